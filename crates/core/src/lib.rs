//! tabsync core types and collaborator traits.

#![forbid(unsafe_code)]

pub mod annotations;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;

/// Group id tabs fall back to when no group reference resolves.
pub const DEFAULT_GROUP_ID: i64 = 1;

/// Kubernetes resource kinds the controller knows how to watch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Ingress,
    Service,
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Ingress,
        SourceKind::Service,
        SourceKind::Deployment,
        SourceKind::StatefulSet,
        SourceKind::DaemonSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Ingress => "Ingress",
            SourceKind::Service => "Service",
            SourceKind::Deployment => "Deployment",
            SourceKind::StatefulSet => "StatefulSet",
            SourceKind::DaemonSet => "DaemonSet",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            SourceKind::Ingress => "ingresses",
            SourceKind::Service => "services",
            SourceKind::Deployment => "deployments",
            SourceKind::StatefulSet => "statefulsets",
            SourceKind::DaemonSet => "daemonsets",
        }
    }

    /// API group and version serving this kind.
    pub fn group_version(&self) -> (&'static str, &'static str) {
        match self {
            SourceKind::Ingress => ("networking.k8s.io", "v1"),
            SourceKind::Service => ("", "v1"),
            SourceKind::Deployment | SourceKind::StatefulSet | SourceKind::DaemonSet => {
                ("apps", "v1")
            }
        }
    }

    /// Parse a kind from its singular or plural lowercase name.
    pub fn parse(s: &str) -> Option<SourceKind> {
        let s = s.trim().to_ascii_lowercase();
        SourceKind::ALL
            .into_iter()
            .find(|k| s == k.plural() || s == k.as_str().to_ascii_lowercase())
    }
}

/// Immutable view of one watched resource at observation time.
///
/// Owned by the watch subsystem; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceObject {
    pub kind: SourceKind,
    pub namespace: String,
    pub name: String,
    pub labels: SmallVec<[(String, String); 8]>,
    pub annotations: SmallVec<[(String, String); 8]>,
    /// Ingress rule hosts, in spec order.
    pub hosts: SmallVec<[String; 2]>,
    /// Cluster-internal `name.namespace` address of the backing service, if any.
    pub service_host: Option<String>,
    pub service_port: Option<u16>,
}

impl SourceObject {
    /// Stable key correlating the resource with derived tabs. Diagnostics only.
    pub fn source_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.namespace,
            self.kind.as_str().to_ascii_lowercase(),
            self.name
        )
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// How a tab opens in the dashboard. Wire value is the integer the API expects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TabType {
    Internal,
    Iframe,
    NewWindow,
}

impl TabType {
    pub fn as_wire(&self) -> i64 {
        match self {
            TabType::Internal => 0,
            TabType::Iframe => 1,
            TabType::NewWindow => 2,
        }
    }

    /// Wire values outside 0..=2 fall back to iframe.
    pub fn from_wire(v: i64) -> TabType {
        match v {
            0 => TabType::Internal,
            2 => TabType::NewWindow,
            _ => TabType::Iframe,
        }
    }

    /// Parse a human-friendly annotation value.
    pub fn parse(value: &str) -> Option<TabType> {
        match value.trim().to_ascii_lowercase().as_str() {
            "internal" | "0" => Some(TabType::Internal),
            "iframe" | "1" => Some(TabType::Iframe),
            "new-window" | "new_window" | "newwindow" | "2" => Some(TabType::NewWindow),
            _ => None,
        }
    }
}

/// How the controller reconciles tabs with the remote dashboard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Create / update only. Never delete tabs.
    Upsert,
    /// Full reconciliation: create, update, and delete managed orphans.
    Sync,
}

impl FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(SyncPolicy::Upsert),
            "sync" => Ok(SyncPolicy::Sync),
            other => Err(format!("unknown sync policy: {other:?} (expect upsert or sync)")),
        }
    }
}

impl fmt::Display for SyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPolicy::Upsert => "upsert",
            SyncPolicy::Sync => "sync",
        })
    }
}

/// Desired state for a single tab, derived from one source resource.
///
/// Identity for matching against remote state is `name` (trimmed,
/// case-sensitive). `group`/`category` hold human-readable names until the
/// identity resolver fills in `group_id`/`category_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredTab {
    pub name: String,
    pub url: Option<String>,
    pub url_local: Option<String>,
    /// `host:port` ping target, no scheme.
    pub ping_url: Option<String>,
    pub image: Option<String>,
    pub tab_type: TabType,
    pub group: Option<String>,
    pub group_icon: Option<String>,
    pub category: Option<String>,
    pub category_icon: Option<String>,
    pub order: Option<i64>,
    pub default: bool,
    pub active: bool,
    pub splash: bool,
    pub ping: bool,
    pub preload: bool,
    /// Filled by the identity resolver before diffing.
    pub group_id: Option<i64>,
    pub category_id: Option<i64>,
    /// Originating resource (`namespace/kind/name`). Never sent remotely.
    pub source_key: String,
}

impl DesiredTab {
    pub fn new(name: impl Into<String>, source_key: impl Into<String>) -> Self {
        DesiredTab {
            name: name.into(),
            url: None,
            url_local: None,
            ping_url: None,
            image: None,
            tab_type: TabType::Iframe,
            group: None,
            group_icon: None,
            category: None,
            category_icon: None,
            order: None,
            default: false,
            active: true,
            splash: false,
            ping: false,
            preload: false,
            group_id: None,
            category_id: None,
            source_key: source_key.into(),
        }
    }
}

/// Mirror of a remote tab record as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteTab {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub url_local: Option<String>,
    pub ping_url: Option<String>,
    pub image: Option<String>,
    pub tab_type: TabType,
    pub group_id: i64,
    pub category_id: Option<i64>,
    pub order: Option<i64>,
    pub default: bool,
    pub active: bool,
    pub splash: bool,
    pub ping: bool,
    pub preload: bool,
}

fn opt_str_eq(a: Option<&str>, b: Option<&str>) -> bool {
    a.unwrap_or("") == b.unwrap_or("")
}

impl RemoteTab {
    /// The record the remote side should hold once `tab` is applied under `id`.
    pub fn from_desired(id: i64, tab: &DesiredTab) -> RemoteTab {
        RemoteTab {
            id,
            name: tab.name.clone(),
            url: tab.url.clone().unwrap_or_default(),
            url_local: tab.url_local.clone(),
            ping_url: tab.ping_url.clone(),
            image: tab.image.clone(),
            tab_type: tab.tab_type,
            group_id: tab.group_id.unwrap_or(DEFAULT_GROUP_ID),
            category_id: tab.category_id,
            order: tab.order,
            default: tab.default,
            active: tab.active,
            splash: tab.splash,
            ping: tab.ping,
            preload: tab.preload,
        }
    }

    /// Field-by-field semantic equality against a desired tab.
    ///
    /// Empty strings and absent values compare equal; a desired `order` of
    /// None is a don't-care (the remote order is preserved on update).
    pub fn matches(&self, tab: &DesiredTab) -> bool {
        self.name == tab.name.trim()
            && opt_str_eq(Some(self.url.as_str()), tab.url.as_deref())
            && opt_str_eq(self.url_local.as_deref(), tab.url_local.as_deref())
            && opt_str_eq(self.ping_url.as_deref(), tab.ping_url.as_deref())
            && opt_str_eq(self.image.as_deref(), tab.image.as_deref())
            && self.tab_type == tab.tab_type
            && self.group_id == tab.group_id.unwrap_or(DEFAULT_GROUP_ID)
            && self.category_id.unwrap_or(0) == tab.category_id.unwrap_or(0)
            && tab.order.map(|o| Some(o) == self.order).unwrap_or(true)
            && self.default == tab.default
            && self.active == tab.active
            && self.splash == tab.splash
            && self.ping == tab.ping
            && self.preload == tab.preload
    }
}

/// Mirror of a remote tab category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCategory {
    pub id: i64,
    pub name: String,
    pub image: Option<String>,
}

/// Mirror of a remote user group. Groups are never created by the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteGroup {
    pub id: i64,
    pub name: String,
    pub image: Option<String>,
}

/// One entry of an operation plan.
#[derive(Debug, Clone)]
pub enum Operation {
    Create(DesiredTab),
    Update { id: i64, tab: DesiredTab },
    Delete(RemoteTab),
}

/// Ordered set of remote calls one reconciliation cycle should make.
///
/// Built fresh each cycle by the diff engine, consumed once by the sync
/// executor. Creates and updates always precede deletes.
#[derive(Debug, Clone, Default)]
pub struct OperationPlan {
    pub ops: Vec<Operation>,
}

impl OperationPlan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn summary(&self) -> String {
        let mut create = 0usize;
        let mut update = 0usize;
        let mut delete = 0usize;
        for op in &self.ops {
            match op {
                Operation::Create(_) => create += 1,
                Operation::Update { .. } => update += 1,
                Operation::Delete(_) => delete += 1,
            }
        }
        format!("create={create} update={update} delete={delete}")
    }
}

/// A per-item failure recorded during a cycle.
#[derive(Debug, Clone)]
pub struct Failure {
    pub subject: String,
    pub error: String,
}

/// Outcome counts for one reconciliation cycle.
///
/// `skipped` counts items excluded before execution (derivation, collision,
/// resolution); `failed` counts remote operations that exhausted retries.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<Failure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CycleReport {
    pub fn started_now() -> Self {
        CycleReport {
            created: 0,
            updated: 0,
            deleted: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn record_skip(&mut self, subject: impl Into<String>, error: impl ToString) {
        self.skipped += 1;
        self.failures.push(Failure {
            subject: subject.into(),
            error: error.to_string(),
        });
    }

    pub fn record_failure(&mut self, subject: impl Into<String>, error: impl ToString) {
        self.failed += 1;
        self.failures.push(Failure {
            subject: subject.into(),
            error: error.to_string(),
        });
    }

    pub fn summary(&self) -> String {
        format!(
            "created={} updated={} deleted={} skipped={} failed={}",
            self.created, self.updated, self.deleted, self.skipped, self.failed
        )
    }
}

/// Errors from the remote dashboard API.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Network-level or 5xx-class failures worth retrying.
    #[error("transient api error: {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },
    /// 4xx-class / validation failures. Never retried.
    #[error("api error (http {status}): {message}")]
    Permanent { status: u16, message: String },
    /// Response body did not have the expected shape.
    #[error("decoding api response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }
}

/// Item-scoped reconciliation errors. None of these abort a cycle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("derivation failed for {source_key}: {reason}")]
    Derivation { source_key: String, reason: String },
    #[error("tab name {name:?} derived by multiple resources: {sources}")]
    Collision { name: String, sources: String },
    #[error("resolving identities for tab {name:?}: {source}")]
    Resolution {
        name: String,
        #[source]
        source: RemoteError,
    },
}

/// Remote dashboard API surface consumed by the engine.
#[async_trait::async_trait]
pub trait RemoteApi: Send + Sync {
    /// Best-effort reachability probe; never fails the caller.
    async fn health_check(&self) -> bool;

    async fn list_tabs(&self) -> Result<Vec<RemoteTab>, RemoteError>;
    async fn create_tab(&self, tab: &DesiredTab) -> Result<RemoteTab, RemoteError>;
    async fn update_tab(&self, id: i64, tab: &DesiredTab) -> Result<RemoteTab, RemoteError>;
    async fn delete_tab(&self, id: i64) -> Result<(), RemoteError>;

    async fn list_categories(&self) -> Result<Vec<RemoteCategory>, RemoteError>;
    async fn create_category(
        &self,
        name: &str,
        icon: Option<&str>,
    ) -> Result<RemoteCategory, RemoteError>;
    async fn update_category_icon(&self, id: i64, icon: &str) -> Result<(), RemoteError>;

    async fn list_groups(&self) -> Result<Vec<RemoteGroup>, RemoteError>;
    async fn update_group_icon(&self, id: i64, icon: &str) -> Result<(), RemoteError>;
}

/// Watch-subsystem seam: a fresh, consistent view of the annotated resources.
#[async_trait::async_trait]
pub trait SourceLister: Send + Sync {
    async fn list_current(&self) -> anyhow::Result<Vec<SourceObject>>;
}

/// Leadership seam checked before each reconciliation trigger.
pub trait LeadershipGate: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Gate used when leader election is disabled.
pub struct AlwaysLeader;

impl LeadershipGate for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}
