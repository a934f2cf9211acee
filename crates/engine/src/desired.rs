//! Desired-state builder: derivation over every eligible resource plus
//! collision detection.

use rustc_hash::FxHashMap;
use tabsync_core::annotations::AnnotationSet;
use tabsync_core::{DesiredTab, SourceObject, SyncError};
use tracing::{debug, warn};

pub struct BuildOutcome {
    pub tabs: Vec<DesiredTab>,
    pub errors: Vec<SyncError>,
}

/// Build the cycle's desired tab set.
///
/// Two resources deriving the same tab name is an error for both; merging
/// could nondeterministically flip fields between cycles, so neither is
/// synced.
pub fn build_desired(objects: &[SourceObject]) -> BuildOutcome {
    let mut tabs: Vec<DesiredTab> = Vec::new();
    let mut errors: Vec<SyncError> = Vec::new();

    for obj in objects {
        if !AnnotationSet::of(obj).enabled() {
            continue;
        }
        match crate::derive::derive_tab(obj) {
            Ok(tab) => tabs.push(tab),
            Err(e) => {
                warn!(source = %obj.source_key(), error = %e, "excluding resource from cycle");
                errors.push(e);
            }
        }
    }

    // Identity invariant: tab names are unique within a cycle.
    let mut by_name: FxHashMap<&str, Vec<usize>> = FxHashMap::default();
    for (idx, tab) in tabs.iter().enumerate() {
        by_name.entry(tab.name.as_str()).or_default().push(idx);
    }
    let mut excluded: Vec<usize> = Vec::new();
    for (name, indexes) in &by_name {
        if indexes.len() < 2 {
            continue;
        }
        let sources = indexes
            .iter()
            .map(|&i| tabs[i].source_key.clone())
            .collect::<Vec<_>>()
            .join(", ");
        warn!(%name, %sources, "tab name collision; excluding all colliding resources");
        for &i in indexes {
            errors.push(SyncError::Collision {
                name: name.to_string(),
                sources: sources.clone(),
            });
            excluded.push(i);
        }
    }
    if !excluded.is_empty() {
        excluded.sort_unstable();
        let mut keep = Vec::with_capacity(tabs.len() - excluded.len());
        for (idx, tab) in tabs.into_iter().enumerate() {
            if excluded.binary_search(&idx).is_err() {
                keep.push(tab);
            }
        }
        tabs = keep;
    }

    debug!(desired = tabs.len(), errors = errors.len(), "desired state built");
    BuildOutcome { tabs, errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{annotate, enabled_ingress, source};
    use tabsync_core::SourceKind;

    #[test]
    fn skips_resources_without_opt_in() {
        let objects = vec![
            source(SourceKind::Ingress, "media", "radarr"),
            enabled_ingress("media", "sonarr", "sonarr.example.com"),
        ];
        let outcome = build_desired(&objects);
        assert_eq!(outcome.tabs.len(), 1);
        assert_eq!(outcome.tabs[0].name, "Sonarr");
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn collisions_exclude_every_colliding_resource() {
        let mut a = enabled_ingress("media", "radarr", "radarr.example.com");
        let mut b = enabled_ingress("backup", "radarr-b", "radarr-b.example.com");
        annotate(&mut a, "name", "Radarr");
        annotate(&mut b, "name", "Radarr");
        let c = enabled_ingress("media", "sonarr", "sonarr.example.com");

        let outcome = build_desired(&[a, b, c]);
        assert_eq!(outcome.tabs.len(), 1);
        assert_eq!(outcome.tabs[0].name, "Sonarr");
        let collisions = outcome
            .errors
            .iter()
            .filter(|e| matches!(e, SyncError::Collision { .. }))
            .count();
        assert_eq!(collisions, 2, "one collision error per colliding resource");
    }

    #[test]
    fn derivation_errors_do_not_abort_the_build() {
        let mut bad = enabled_ingress("media", "radarr", "radarr.example.com");
        annotate(&mut bad, "active", "maybe");
        let good = enabled_ingress("media", "sonarr", "sonarr.example.com");

        let outcome = build_desired(&[bad, good]);
        assert_eq!(outcome.tabs.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(matches!(outcome.errors[0], SyncError::Derivation { .. }));
    }
}
