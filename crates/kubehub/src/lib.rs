//! tabsync kube integration – listing and watcher wiring.
//!
//! Resources are read through `DynamicObject` so the five supported kinds
//! share one extraction path. Watch streams feed a capacity-1 notification
//! channel; the reconciliation loop re-lists for a consistent view, so the
//! channel only signals "something changed".

#![forbid(unsafe_code)]

mod lease;
pub use lease::{spawn_lease_gate, LeaseGate};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use smallvec::SmallVec;
use tabsync_core::{annotations::AnnotationSet, SourceKind, SourceLister, SourceObject};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

fn api_resource(kind: SourceKind) -> ApiResource {
    let (group, version) = kind.group_version();
    let gvk = GroupVersionKind {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.as_str().to_string(),
    };
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

fn api_for(client: &Client, kind: SourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = api_resource(kind);
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
        None => Api::all_with(client.clone(), &ar),
    }
}

fn meta_pairs(map: Option<&std::collections::BTreeMap<String, String>>) -> SmallVec<[(String, String); 8]> {
    map.into_iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Ingress spec hints: rule hosts plus the first backend service host/port.
fn ingress_hints(
    namespace: &str,
    spec: Option<&Json>,
) -> (SmallVec<[String; 2]>, Option<String>, Option<u16>) {
    let mut hosts: SmallVec<[String; 2]> = SmallVec::new();
    let mut service_host = None;
    let mut service_port = None;
    let rules = spec
        .and_then(|s| s.get("rules"))
        .and_then(Json::as_array)
        .cloned()
        .unwrap_or_default();
    for rule in &rules {
        if let Some(host) = rule.get("host").and_then(Json::as_str) {
            if !host.is_empty() {
                hosts.push(host.to_string());
            }
        }
    }
    'rules: for rule in &rules {
        let paths = rule
            .get("http")
            .and_then(|h| h.get("paths"))
            .and_then(Json::as_array);
        for path in paths.into_iter().flatten() {
            let service = path.get("backend").and_then(|b| b.get("service"));
            if let Some(name) = service.and_then(|s| s.get("name")).and_then(Json::as_str) {
                service_host = Some(format!("{name}.{namespace}"));
                service_port = service
                    .and_then(|s| s.get("port"))
                    .and_then(|p| p.get("number"))
                    .and_then(Json::as_i64)
                    .and_then(|n| u16::try_from(n).ok());
                break 'rules;
            }
        }
    }
    (hosts, service_host, service_port)
}

/// Convert a raw watched object into a `SourceObject`.
///
/// Returns None when the resource does not opt in via the enabled annotation.
pub fn extract(obj: &DynamicObject, kind: SourceKind) -> Option<SourceObject> {
    let name = obj.metadata.name.clone()?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let labels = meta_pairs(obj.metadata.labels.as_ref());
    let annotations = meta_pairs(obj.metadata.annotations.as_ref());

    let spec = obj.data.get("spec");
    let (hosts, service_host, service_port) = match kind {
        SourceKind::Ingress => ingress_hints(&namespace, spec),
        SourceKind::Service => {
            let port = spec
                .and_then(|s| s.get("ports"))
                .and_then(Json::as_array)
                .and_then(|ports| ports.first())
                .and_then(|p| p.get("port"))
                .and_then(Json::as_i64)
                .and_then(|n| u16::try_from(n).ok());
            (SmallVec::new(), Some(format!("{name}.{namespace}")), port)
        }
        _ => (SmallVec::new(), None, None),
    };

    let source = SourceObject {
        kind,
        namespace,
        name,
        labels,
        annotations,
        hosts,
        service_host,
        service_port,
    };
    if !AnnotationSet::of(&source).enabled() {
        return None;
    }
    Some(source)
}

/// Lists all watched kinds across the configured namespaces. Fresh read each
/// call; any listing failure fails the whole call so a partial view never
/// feeds a destructive diff.
pub struct KubeLister {
    client: Client,
    kinds: Vec<SourceKind>,
    namespaces: Vec<String>,
}

impl KubeLister {
    pub fn new(client: Client, kinds: Vec<SourceKind>, namespaces: Vec<String>) -> Self {
        KubeLister {
            client,
            kinds,
            namespaces,
        }
    }

    async fn list_kind(&self, kind: SourceKind, namespace: Option<&str>) -> Result<Vec<SourceObject>> {
        let api = api_for(&self.client, kind, namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing {} (ns: {})", kind.plural(), namespace.unwrap_or("all")))?;
        Ok(list.items.iter().filter_map(|o| extract(o, kind)).collect())
    }
}

#[async_trait::async_trait]
impl SourceLister for KubeLister {
    async fn list_current(&self) -> Result<Vec<SourceObject>> {
        let mut out = Vec::new();
        for &kind in &self.kinds {
            if self.namespaces.is_empty() {
                out.extend(self.list_kind(kind, None).await?);
            } else {
                for ns in &self.namespaces {
                    out.extend(self.list_kind(kind, Some(ns)).await?);
                }
            }
        }
        debug!(count = out.len(), "listed annotated resources");
        Ok(out)
    }
}

/// Currently-annotated resources keyed by source key, shared across watchers.
type StateMap = Arc<Mutex<FxHashMap<String, SourceObject>>>;

/// Spawn one watch task per (kind, namespace) combination.
///
/// Effective changes push into `tx` via `try_send`; with a capacity-1 channel
/// a burst of events collapses into a single pending trigger.
pub fn spawn_watchers(
    client: &Client,
    kinds: &[SourceKind],
    namespaces: &[String],
    tx: mpsc::Sender<()>,
) {
    let state: StateMap = Arc::new(Mutex::new(FxHashMap::default()));
    let scopes: Vec<Option<String>> = if namespaces.is_empty() {
        vec![None]
    } else {
        namespaces.iter().cloned().map(Some).collect()
    };
    for &kind in kinds {
        for ns in &scopes {
            let client = client.clone();
            let tx = tx.clone();
            let state = state.clone();
            let ns = ns.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) =
                        run_watch(client.clone(), kind, ns.as_deref(), state.clone(), tx.clone())
                            .await
                    {
                        warn!(kind = kind.as_str(), ns = ?ns, error = %e, "watch stream failed; reconnecting");
                    }
                    tokio::time::sleep(WATCH_RECONNECT_DELAY).await;
                }
            });
        }
    }
}

async fn run_watch(
    client: Client,
    kind: SourceKind,
    namespace: Option<&str>,
    state: StateMap,
    tx: mpsc::Sender<()>,
) -> Result<()> {
    let api = api_for(&client, kind, namespace);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = kind.as_str(), ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        counter!("watch_events_total", 1u64);
        let changed = match ev {
            Event::Applied(o) => apply_event(&state, kind, &o).await,
            Event::Deleted(o) => remove_event(&state, kind, &o).await,
            Event::Restarted(list) => restart_event(&state, kind, namespace, &list).await,
        };
        if changed {
            let _ = tx.try_send(());
        }
    }
    warn!(kind = kind.as_str(), "watcher stream ended");
    Ok(())
}

fn raw_key(kind: SourceKind, obj: &DynamicObject) -> String {
    format!(
        "{}/{}/{}",
        obj.metadata.namespace.clone().unwrap_or_default(),
        kind.as_str().to_ascii_lowercase(),
        obj.metadata.name.clone().unwrap_or_default()
    )
}

async fn apply_event(state: &StateMap, kind: SourceKind, obj: &DynamicObject) -> bool {
    let mut map = state.lock().await;
    match extract(obj, kind) {
        Some(source) => {
            let key = source.source_key();
            match map.get(&key) {
                Some(prev) if *prev == source => false,
                _ => {
                    map.insert(key, source);
                    true
                }
            }
        }
        // opt-out (annotation removed) counts as a deletion
        None => map.remove(&raw_key(kind, obj)).is_some(),
    }
}

async fn remove_event(state: &StateMap, kind: SourceKind, obj: &DynamicObject) -> bool {
    state.lock().await.remove(&raw_key(kind, obj)).is_some()
}

/// A watch restart re-lists; rebuild this watcher's slice of the state map.
async fn restart_event(
    state: &StateMap,
    kind: SourceKind,
    namespace: Option<&str>,
    list: &[DynamicObject],
) -> bool {
    let fresh: FxHashMap<String, SourceObject> = list
        .iter()
        .filter_map(|o| extract(o, kind))
        .map(|source| (source.source_key(), source))
        .collect();
    let kind_tag = format!("/{}/", kind.as_str().to_ascii_lowercase());

    let mut map = state.lock().await;
    let mut changed = false;
    let owned: Vec<String> = map
        .keys()
        .filter(|k| {
            k.contains(&kind_tag)
                && namespace
                    .map(|ns| k.starts_with(&format!("{ns}/")))
                    .unwrap_or(true)
        })
        .cloned()
        .collect();
    for key in owned {
        if !fresh.contains_key(&key) {
            map.remove(&key);
            changed = true;
        }
    }
    for (key, source) in fresh {
        match map.get(&key) {
            Some(prev) if *prev == source => {}
            _ => {
                map.insert(key, source);
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn meta(
        name: &str,
        namespace: &str,
        annotations: &[(&str, &str)],
        labels: &[(&str, &str)],
    ) -> kube::core::ObjectMeta {
        let to_map = |pairs: &[(&str, &str)]| -> Option<BTreeMap<String, String>> {
            if pairs.is_empty() {
                None
            } else {
                Some(
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                )
            }
        };
        kube::core::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: to_map(annotations),
            labels: to_map(labels),
            ..Default::default()
        }
    }

    fn ingress(name: &str, annotations: &[(&str, &str)]) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: meta(name, "media", annotations, &[]),
            data: json!({
                "spec": {
                    "rules": [{
                        "host": format!("{name}.example.com"),
                        "http": { "paths": [{
                            "backend": { "service": { "name": name, "port": { "number": 7878 } } }
                        }]}
                    }]
                }
            }),
        }
    }

    #[test]
    fn extract_requires_opt_in() {
        let obj = ingress("radarr", &[]);
        assert!(extract(&obj, SourceKind::Ingress).is_none());
        let obj = ingress("radarr", &[("tabsync.dev/enabled", "true")]);
        assert!(extract(&obj, SourceKind::Ingress).is_some());
    }

    #[test]
    fn extract_reads_ingress_hosts_and_backend() {
        let obj = ingress("radarr", &[("tabsync.dev/enabled", "true")]);
        let source = extract(&obj, SourceKind::Ingress).expect("extracted");
        assert_eq!(source.hosts.as_slice(), ["radarr.example.com"]);
        assert_eq!(source.service_host.as_deref(), Some("radarr.media"));
        assert_eq!(source.service_port, Some(7878));
        assert_eq!(source.source_key(), "media/ingress/radarr");
    }

    #[test]
    fn extract_reads_service_ports() {
        let obj = DynamicObject {
            types: None,
            metadata: meta("sonarr", "media", &[("tabsync.dev/enabled", "true")], &[]),
            data: json!({ "spec": { "ports": [{ "port": 8989 }, { "port": 9000 }] } }),
        };
        let source = extract(&obj, SourceKind::Service).expect("extracted");
        assert!(source.hosts.is_empty());
        assert_eq!(source.service_host.as_deref(), Some("sonarr.media"));
        assert_eq!(source.service_port, Some(8989));
    }

    #[test]
    fn extract_leaves_workloads_without_service_hints() {
        let obj = DynamicObject {
            types: None,
            metadata: meta("app", "tools", &[("tabsync.dev/enabled", "true")], &[]),
            data: json!({ "spec": { "replicas": 2 } }),
        };
        let source = extract(&obj, SourceKind::Deployment).expect("extracted");
        assert_eq!(source.service_host, None);
        assert_eq!(source.service_port, None);
    }

    #[tokio::test]
    async fn apply_event_tracks_opt_in_and_opt_out() {
        let state: StateMap = Arc::new(Mutex::new(FxHashMap::default()));

        let enabled = ingress("radarr", &[("tabsync.dev/enabled", "true")]);
        assert!(apply_event(&state, SourceKind::Ingress, &enabled).await);
        // same content again: no effective change
        assert!(!apply_event(&state, SourceKind::Ingress, &enabled).await);

        let disabled = ingress("radarr", &[]);
        assert!(apply_event(&state, SourceKind::Ingress, &disabled).await);
        assert!(state.lock().await.is_empty());
    }

    #[tokio::test]
    async fn restart_event_drops_vanished_entries() {
        let state: StateMap = Arc::new(Mutex::new(FxHashMap::default()));
        let a = ingress("radarr", &[("tabsync.dev/enabled", "true")]);
        let b = ingress("sonarr", &[("tabsync.dev/enabled", "true")]);
        apply_event(&state, SourceKind::Ingress, &a).await;
        apply_event(&state, SourceKind::Ingress, &b).await;

        let changed = restart_event(&state, SourceKind::Ingress, None, &[a]).await;
        assert!(changed);
        let map = state.lock().await;
        assert!(map.contains_key("media/ingress/radarr"));
        assert!(!map.contains_key("media/ingress/sonarr"));
    }
}
