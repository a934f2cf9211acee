//! Diff engine: desired set vs remote managed set, by tab name.

use rustc_hash::{FxHashMap, FxHashSet};
use tabsync_core::{DesiredTab, Operation, OperationPlan, RemoteTab, SyncPolicy, TabType};
use tracing::{debug, warn};

/// Compute the operation plan for one cycle.
///
/// `managed` is the set of tab names this controller has desired in the
/// current or any prior cycle; a remote tab outside it is never deleted,
/// regardless of policy. Creates and updates precede deletes so a rename
/// never leaves a window where both names are absent.
pub fn diff(
    desired: &[DesiredTab],
    remote: &[RemoteTab],
    policy: SyncPolicy,
    managed: &FxHashSet<String>,
) -> OperationPlan {
    let mut by_name: FxHashMap<&str, &RemoteTab> = FxHashMap::default();
    for tab in remote {
        if by_name.insert(tab.name.trim(), tab).is_some() {
            warn!(name = %tab.name, "duplicate remote tab name; diffing against the last one");
        }
    }

    let mut ops: Vec<Operation> = Vec::new();
    for tab in desired {
        match by_name.get(tab.name.trim()) {
            None => ops.push(Operation::Create(tab.clone())),
            Some(existing) if existing.matches(tab) => {
                debug!(name = %tab.name, id = existing.id, "tab up to date");
            }
            Some(existing) => {
                // Keep the remote position when the operator did not pin one.
                let mut tab = tab.clone();
                if tab.order.is_none() {
                    tab.order = existing.order;
                }
                ops.push(Operation::Update {
                    id: existing.id,
                    tab,
                });
            }
        }
    }

    if policy == SyncPolicy::Sync {
        let desired_names: FxHashSet<&str> =
            desired.iter().map(|t| t.name.trim()).collect();
        for tab in remote {
            let name = tab.name.trim();
            if desired_names.contains(name) {
                continue;
            }
            // The dashboard's own internal tabs (Homepage, Settings) are
            // never ours to delete.
            if tab.tab_type == TabType::Internal {
                debug!(name = %tab.name, "skipping internal tab");
                continue;
            }
            if !managed.contains(name) {
                debug!(name = %tab.name, "skipping unmanaged tab");
                continue;
            }
            ops.push(Operation::Delete(tab.clone()));
        }
    }

    OperationPlan { ops }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(name: &str, url: &str) -> DesiredTab {
        let mut tab = DesiredTab::new(name, "media/ingress/x");
        tab.url = Some(url.to_string());
        tab
    }

    fn remote(id: i64, name: &str, url: &str) -> RemoteTab {
        RemoteTab::from_desired(id, &desired(name, url))
    }

    fn managed(names: &[&str]) -> FxHashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn creates_what_is_absent_remotely() {
        let plan = diff(
            &[desired("Radarr", "https://radarr.example.com")],
            &[],
            SyncPolicy::Upsert,
            &managed(&["Radarr"]),
        );
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan.ops[0], Operation::Create(_)));
    }

    #[test]
    fn identical_tabs_produce_no_operations() {
        let d = desired("Radarr", "https://radarr.example.com");
        let r = RemoteTab::from_desired(1, &d);
        let plan = diff(&[d], &[r], SyncPolicy::Sync, &managed(&["Radarr"]));
        assert!(plan.is_empty(), "idempotence: matching state yields an empty plan");
    }

    #[test]
    fn changed_field_produces_one_update() {
        let d = desired("Radarr", "https://radarr.example.com");
        let r = remote(1, "Radarr", "http://old");
        let plan = diff(&[d], &[r], SyncPolicy::Upsert, &managed(&["Radarr"]));
        assert_eq!(plan.len(), 1);
        match &plan.ops[0] {
            Operation::Update { id, tab } => {
                assert_eq!(*id, 1);
                assert_eq!(tab.url.as_deref(), Some("https://radarr.example.com"));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn update_carries_remote_order_when_unpinned() {
        let d = desired("Radarr", "https://radarr.example.com");
        let mut r = remote(1, "Radarr", "http://old");
        r.order = Some(7);
        let plan = diff(&[d], &[r], SyncPolicy::Upsert, &managed(&["Radarr"]));
        match &plan.ops[0] {
            Operation::Update { tab, .. } => assert_eq!(tab.order, Some(7)),
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn upsert_policy_never_deletes() {
        let orphan = remote(1, "Orphan", "https://orphan.example.com");
        let plan = diff(&[], &[orphan], SyncPolicy::Upsert, &managed(&["Orphan"]));
        assert!(plan.is_empty());
    }

    #[test]
    fn sync_policy_deletes_only_managed_tabs() {
        let ours = remote(1, "Radarr", "https://radarr.example.com");
        let manual = remote(2, "Manual", "https://manual.example.com");
        let plan = diff(&[], &[ours, manual], SyncPolicy::Sync, &managed(&["Radarr"]));
        assert_eq!(plan.len(), 1);
        match &plan.ops[0] {
            Operation::Delete(tab) => assert_eq!(tab.name, "Radarr"),
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn internal_tabs_are_never_deleted() {
        let mut homepage = remote(1, "Homepage", "api/v2/page/homepage");
        homepage.tab_type = TabType::Internal;
        let plan = diff(&[], &[homepage], SyncPolicy::Sync, &managed(&["Homepage"]));
        assert!(plan.is_empty());
    }

    #[test]
    fn deletes_come_after_creates_and_updates() {
        // Rename: "Old" managed and undesired, "New" desired and absent.
        let old = remote(1, "Old", "https://app.example.com");
        let new = desired("New", "https://app.example.com");
        let plan = diff(&[new], &[old], SyncPolicy::Sync, &managed(&["Old", "New"]));
        assert_eq!(plan.len(), 2);
        assert!(matches!(plan.ops[0], Operation::Create(_)));
        assert!(matches!(plan.ops[1], Operation::Delete(_)));
    }

    #[test]
    fn name_matching_is_case_sensitive() {
        let d = desired("Radarr", "https://radarr.example.com");
        let r = remote(1, "radarr", "https://radarr.example.com");
        let plan = diff(&[d], &[r], SyncPolicy::Upsert, &managed(&["Radarr"]));
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan.ops[0], Operation::Create(_)));
    }
}
