//! Reconciliation loop driver.
//!
//! Serializes cycles: one runs at a time, a trigger arriving mid-cycle is
//! coalesced into at most one pending re-run (capacity-1 channel). The
//! driver owns the only cross-cycle memory: the last remote snapshot and the
//! set of names ever desired by this process.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use tabsync_core::{CycleReport, LeadershipGate, Operation, RemoteApi, SourceLister, SyncError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::desired::build_desired;
use crate::diff::diff;
use crate::exec::{apply_plan, RemoteSnapshot};
use crate::resolve::IdentityResolver;
use crate::EngineSettings;

pub struct LoopDriver {
    lister: Arc<dyn SourceLister>,
    api: Arc<dyn RemoteApi>,
    gate: Arc<dyn LeadershipGate>,
    settings: EngineSettings,
    snapshot: RemoteSnapshot,
    /// Every tab name this process has ever desired. A remote tab outside
    /// this set is never deleted.
    managed: FxHashSet<String>,
}

impl LoopDriver {
    pub fn new(
        lister: Arc<dyn SourceLister>,
        api: Arc<dyn RemoteApi>,
        gate: Arc<dyn LeadershipGate>,
        settings: EngineSettings,
    ) -> Self {
        LoopDriver {
            lister,
            api,
            gate,
            settings,
            snapshot: RemoteSnapshot::default(),
            managed: FxHashSet::default(),
        }
    }

    /// Run until `shutdown` flips. Ticks on the configured interval and on
    /// coalesced change notifications; the first tick fires immediately.
    pub async fn run(
        &mut self,
        mut changes: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if !self.api.health_check().await {
            warn!("remote api unreachable at startup; continuing anyway");
        }
        let mut tick = tokio::time::interval(self.settings.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut events_open = true;
        let mut shutdown_open = true;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!("reconcile triggered by timer");
                }
                event = changes.recv(), if events_open => {
                    match event {
                        Some(()) => {
                            // quiet window so an event burst reconciles once
                            tokio::time::sleep(self.settings.debounce).await;
                            while changes.try_recv().is_ok() {}
                            debug!("reconcile triggered by resource change");
                        }
                        None => {
                            warn!("change stream closed; timer-only from here");
                            events_open = false;
                            continue;
                        }
                    }
                }
                changed = shutdown.changed(), if shutdown_open => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            info!("shutdown requested");
                            break;
                        }
                        Ok(()) => continue,
                        Err(_) => {
                            shutdown_open = false;
                            continue;
                        }
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if !self.gate.is_leader() {
                debug!("not leader; skipping reconcile");
                continue;
            }

            let started = Instant::now();
            counter!("cycles_total", 1u64);
            match self.run_cycle(Some(&shutdown)).await {
                Ok(report) => {
                    histogram!("cycle_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
                    info!(outcome = %report.summary(), "reconcile cycle complete");
                }
                Err(e) => {
                    counter!("cycle_failures_total", 1u64);
                    warn!(error = ?e, "reconcile cycle failed");
                }
            }
        }
        Ok(())
    }

    /// One full pass: observe, derive, resolve, diff, apply.
    ///
    /// Only a failure to read the source or remote sets fails the cycle;
    /// item-scoped errors are recorded in the report and the cycle continues.
    pub async fn run_cycle(
        &mut self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::started_now();

        let objects = self
            .lister
            .list_current()
            .await
            .context("listing source resources")?;
        let outcome = build_desired(&objects);
        let mut tabs = outcome.tabs;
        for error in outcome.errors {
            let subject = match &error {
                SyncError::Derivation { source_key, .. } => format!("derive {source_key}"),
                SyncError::Collision { name, .. } => format!("collision on {name}"),
                other => other.to_string(),
            };
            report.record_skip(subject, &error);
        }

        if tabs.iter().any(|t| t.group.is_some() || t.category.is_some()) {
            let mut resolver = IdentityResolver::load(self.api.as_ref())
                .await
                .context("loading remote groups and categories")?;
            let mut resolved = Vec::with_capacity(tabs.len());
            for mut tab in tabs {
                match resolver.resolve(self.api.as_ref(), &mut tab).await {
                    Ok(()) => resolved.push(tab),
                    Err(e) => {
                        let error = SyncError::Resolution {
                            name: tab.name.clone(),
                            source: e,
                        };
                        warn!(%error, "skipping tab this cycle");
                        report.record_skip(format!("resolve tab {}", tab.name), error);
                    }
                }
            }
            tabs = resolved;
        }

        let fresh = self.api.list_tabs().await.context("listing remote tabs")?;
        self.snapshot.refresh(fresh);

        for tab in &tabs {
            self.managed.insert(tab.name.trim().to_string());
        }

        let plan = diff(
            &tabs,
            &self.snapshot.tabs,
            self.settings.sync_policy,
            &self.managed,
        );
        if plan.is_empty() {
            debug!("no changes needed");
            report.finish();
            return Ok(report);
        }
        info!(plan = %plan.summary(), "applying operation plan");

        if self.settings.dry_run {
            for op in &plan.ops {
                match op {
                    Operation::Create(tab) => info!(name = %tab.name, "dry-run: would create"),
                    Operation::Update { id, tab } => {
                        info!(name = %tab.name, id, "dry-run: would update")
                    }
                    Operation::Delete(tab) => {
                        info!(name = %tab.name, id = tab.id, "dry-run: would delete")
                    }
                }
            }
            report.finish();
            return Ok(report);
        }

        apply_plan(
            self.api.as_ref(),
            plan,
            &mut self.snapshot,
            &mut report,
            shutdown,
        )
        .await;
        report.finish();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{annotate, enabled_ingress, FakeLister, FakeRemote};
    use std::sync::atomic::Ordering;
    use tabsync_core::{AlwaysLeader, RemoteTab, SyncPolicy};

    fn driver(
        objects: Vec<tabsync_core::SourceObject>,
        api: Arc<FakeRemote>,
        policy: SyncPolicy,
    ) -> LoopDriver {
        let settings = EngineSettings {
            sync_policy: policy,
            ..EngineSettings::default()
        };
        LoopDriver::new(
            Arc::new(FakeLister::new(objects)),
            api,
            Arc::new(AlwaysLeader),
            settings,
        )
    }

    #[tokio::test]
    async fn end_to_end_update_leaves_unmanaged_tabs_alone() {
        // Remote: our tab with an old URL, plus a manually created tab.
        let ours = RemoteTab::from_desired(1, &{
            let mut t = tabsync_core::DesiredTab::new("Radarr", "seed");
            t.url = Some("http://old".into());
            t.ping_url = Some("radarr.example.com:443".into());
            t.image = Some("plugins/images/tabs/radarr.png".into());
            t.ping = true;
            t
        });
        let manual = RemoteTab::from_desired(2, &{
            let mut t = tabsync_core::DesiredTab::new("Manual", "seed");
            t.url = Some("https://manual.example.com".into());
            t
        });

        let api = Arc::new(FakeRemote::with_tabs(vec![ours, manual]));
        let objects = vec![enabled_ingress("media", "radarr", "radarr.example.com")];
        let mut driver = driver(objects, api.clone(), SyncPolicy::Sync);

        let report = driver.run_cycle(None).await.expect("cycle");
        assert_eq!(report.updated, 1);
        assert_eq!(report.created, 0);
        assert_eq!(report.deleted, 0, "never-desired remote tab survives sync policy");

        let tabs = api.tabs.lock().unwrap();
        let radarr = tabs.iter().find(|t| t.name == "Radarr").expect("kept");
        assert_eq!(radarr.url, "https://radarr.example.com");
        assert!(tabs.iter().any(|t| t.name == "Manual"));
    }

    #[tokio::test]
    async fn two_quiet_cycles_are_idempotent() {
        let api = Arc::new(FakeRemote::default());
        let objects = vec![enabled_ingress("media", "radarr", "radarr.example.com")];
        let mut driver = driver(objects, api.clone(), SyncPolicy::Sync);

        let first = driver.run_cycle(None).await.expect("first cycle");
        assert_eq!(first.created, 1);

        let second = driver.run_cycle(None).await.expect("second cycle");
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.deleted, 0);
        assert_eq!(api.create_tab_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_overlay_bridges_stale_remote_reads() {
        // The fake's list_tabs is live, so stale reads must be simulated:
        // seed a remote whose listing will *not* show the create we just did.
        struct StaleRemote {
            inner: FakeRemote,
        }

        #[async_trait::async_trait]
        impl tabsync_core::RemoteApi for StaleRemote {
            async fn health_check(&self) -> bool {
                true
            }
            async fn list_tabs(
                &self,
            ) -> Result<Vec<RemoteTab>, tabsync_core::RemoteError> {
                // always report the initial (empty) state
                Ok(Vec::new())
            }
            async fn create_tab(
                &self,
                tab: &tabsync_core::DesiredTab,
            ) -> Result<RemoteTab, tabsync_core::RemoteError> {
                self.inner.create_tab(tab).await
            }
            async fn update_tab(
                &self,
                id: i64,
                tab: &tabsync_core::DesiredTab,
            ) -> Result<RemoteTab, tabsync_core::RemoteError> {
                self.inner.update_tab(id, tab).await
            }
            async fn delete_tab(&self, id: i64) -> Result<(), tabsync_core::RemoteError> {
                self.inner.delete_tab(id).await
            }
            async fn list_categories(
                &self,
            ) -> Result<Vec<tabsync_core::RemoteCategory>, tabsync_core::RemoteError> {
                self.inner.list_categories().await
            }
            async fn create_category(
                &self,
                name: &str,
                icon: Option<&str>,
            ) -> Result<tabsync_core::RemoteCategory, tabsync_core::RemoteError> {
                self.inner.create_category(name, icon).await
            }
            async fn update_category_icon(
                &self,
                id: i64,
                icon: &str,
            ) -> Result<(), tabsync_core::RemoteError> {
                self.inner.update_category_icon(id, icon).await
            }
            async fn list_groups(
                &self,
            ) -> Result<Vec<tabsync_core::RemoteGroup>, tabsync_core::RemoteError> {
                self.inner.list_groups().await
            }
            async fn update_group_icon(
                &self,
                id: i64,
                icon: &str,
            ) -> Result<(), tabsync_core::RemoteError> {
                self.inner.update_group_icon(id, icon).await
            }
        }

        let api = Arc::new(StaleRemote {
            inner: FakeRemote::default(),
        });
        let objects = vec![enabled_ingress("media", "radarr", "radarr.example.com")];
        let settings = EngineSettings {
            sync_policy: SyncPolicy::Sync,
            ..EngineSettings::default()
        };
        let mut driver = LoopDriver::new(
            Arc::new(FakeLister::new(objects)),
            api.clone(),
            Arc::new(AlwaysLeader),
            settings,
        );

        let first = driver.run_cycle(None).await.expect("first cycle");
        assert_eq!(first.created, 1);

        // Second cycle reads the stale (empty) listing; the overlay keeps the
        // created tab visible, so no duplicate create is attempted.
        let second = driver.run_cycle(None).await.expect("second cycle");
        assert_eq!(second.created, 0);
        assert_eq!(api.inner.create_tab_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn category_references_share_one_created_category() {
        let api = Arc::new(FakeRemote::default());
        let mut a = enabled_ingress("media", "radarr", "radarr.example.com");
        let mut b = enabled_ingress("media", "sonarr", "sonarr.example.com");
        let mut c = enabled_ingress("media", "lidarr", "lidarr.example.com");
        for obj in [&mut a, &mut b, &mut c] {
            annotate(obj, "category", "Media Apps");
        }
        let mut driver = driver(vec![a, b, c], api.clone(), SyncPolicy::Upsert);

        let report = driver.run_cycle(None).await.expect("cycle");
        assert_eq!(report.created, 3);
        assert_eq!(api.create_category_calls.load(Ordering::SeqCst), 1);

        let category_id = api.categories.lock().unwrap()[0].id;
        let tabs = api.tabs.lock().unwrap();
        assert!(tabs.iter().all(|t| t.category_id == Some(category_id)));
    }

    #[tokio::test]
    async fn removed_resource_is_deleted_only_under_sync_policy() {
        let api = Arc::new(FakeRemote::default());
        let objects = vec![enabled_ingress("media", "radarr", "radarr.example.com")];
        let mut driver = driver(objects, api.clone(), SyncPolicy::Sync);
        driver.run_cycle(None).await.expect("first cycle");

        // Resource disappears; its tab was desired in a prior cycle, so it is
        // managed and gets deleted.
        driver.lister = Arc::new(FakeLister::new(Vec::new()));
        let report = driver.run_cycle(None).await.expect("second cycle");
        assert_eq!(report.deleted, 1);
        assert!(api.tabs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_policy_keeps_orphans() {
        let api = Arc::new(FakeRemote::default());
        let objects = vec![enabled_ingress("media", "radarr", "radarr.example.com")];
        let mut driver = driver(objects, api.clone(), SyncPolicy::Upsert);
        driver.run_cycle(None).await.expect("first cycle");

        driver.lister = Arc::new(FakeLister::new(Vec::new()));
        let report = driver.run_cycle(None).await.expect("second cycle");
        assert_eq!(report.deleted, 0);
        assert_eq!(api.tabs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolution_failure_skips_the_tab_and_recovers_next_cycle() {
        let api = Arc::new(FakeRemote::default());
        api.create_category_errors
            .lock()
            .unwrap()
            .push_back(tabsync_core::RemoteError::Permanent {
                status: 422,
                message: "validation".into(),
            });
        let mut with_category = enabled_ingress("media", "radarr", "radarr.example.com");
        annotate(&mut with_category, "category", "Media Apps");
        let plain = enabled_ingress("media", "sonarr", "sonarr.example.com");
        let mut driver = driver(vec![with_category, plain], api.clone(), SyncPolicy::Upsert);

        let first = driver.run_cycle(None).await.expect("first cycle");
        assert_eq!(first.skipped, 1, "tab behind the failed category is skipped");
        assert_eq!(first.created, 1, "the other tab still syncs");

        // No partial state kept: next cycle resolves from scratch and
        // succeeds.
        let second = driver.run_cycle(None).await.expect("second cycle");
        assert_eq!(second.skipped, 0);
        assert_eq!(second.created, 1);
    }

    #[tokio::test]
    async fn dry_run_applies_nothing() {
        let api = Arc::new(FakeRemote::default());
        let objects = vec![enabled_ingress("media", "radarr", "radarr.example.com")];
        let settings = EngineSettings {
            dry_run: true,
            ..EngineSettings::default()
        };
        let mut driver = LoopDriver::new(
            Arc::new(FakeLister::new(objects)),
            api.clone(),
            Arc::new(AlwaysLeader),
            settings,
        );
        let report = driver.run_cycle(None).await.expect("cycle");
        assert_eq!(report.created, 0);
        assert_eq!(api.create_tab_calls.load(Ordering::SeqCst), 0);
    }
}
