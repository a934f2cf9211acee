//! Sync executor: applies an operation plan against the remote API.
//!
//! Operations are independent; one failure never aborts the cycle. Transient
//! failures get a bounded retry with doubling backoff. Successes update the
//! in-memory remote snapshot so the next diff reflects the applied change
//! even when the remote read-back is eventually consistent.

use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashSet;
use tabsync_core::{CycleReport, Operation, OperationPlan, RemoteApi, RemoteError, RemoteTab};
use tokio::sync::watch;
use tracing::{info, warn};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Executor-maintained view of the remote tab set.
///
/// `recently_applied` holds the names touched by the latest apply pass; on
/// the next cycle those entries override the fresh remote read for one
/// cycle of eventual-consistency protection.
#[derive(Debug, Default)]
pub struct RemoteSnapshot {
    pub tabs: Vec<RemoteTab>,
    recently_applied: FxHashSet<String>,
}

impl RemoteSnapshot {
    /// Merge a fresh remote listing into the snapshot. Fresh entries win
    /// except for names the previous cycle just wrote; the overlay is then
    /// consumed.
    pub fn refresh(&mut self, fresh: Vec<RemoteTab>) {
        let overlay: Vec<RemoteTab> = self
            .tabs
            .drain(..)
            .filter(|t| self.recently_applied.contains(t.name.trim()))
            .collect();
        self.tabs = fresh
            .into_iter()
            .filter(|t| !self.recently_applied.contains(t.name.trim()))
            .chain(overlay)
            .collect();
        self.recently_applied.clear();
    }

    fn upsert(&mut self, tab: RemoteTab) {
        self.recently_applied.insert(tab.name.trim().to_string());
        match self.tabs.iter_mut().find(|t| t.id == tab.id) {
            Some(slot) => *slot = tab,
            None => self.tabs.push(tab),
        }
    }

    fn remove(&mut self, id: i64, name: &str) {
        self.recently_applied.insert(name.trim().to_string());
        self.tabs.retain(|t| t.id != id);
    }
}

/// Retry transient failures with doubling backoff; permanent failures
/// surface immediately.
async fn with_retry<T, F, Fut>(subject: &str, mut call: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                let delay = BACKOFF_BASE * 2u32.pow(attempt);
                attempt += 1;
                warn!(subject, attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient failure; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Apply the plan one operation at a time, accumulating into `report`.
///
/// A shutdown signal stops the executor between operations; the operation in
/// flight always completes, so nothing is left half-applied.
pub async fn apply_plan(
    api: &dyn RemoteApi,
    plan: OperationPlan,
    snapshot: &mut RemoteSnapshot,
    report: &mut CycleReport,
    shutdown: Option<&watch::Receiver<bool>>,
) {
    for op in plan.ops {
        if shutdown.map(|rx| *rx.borrow()).unwrap_or(false) {
            warn!("shutdown requested; stopping before the next operation");
            break;
        }
        match op {
            Operation::Create(tab) => {
                match with_retry(&format!("create tab {}", tab.name), || api.create_tab(&tab)).await
                {
                    Ok(remote) => {
                        info!(name = %remote.name, id = remote.id, "tab created");
                        counter!("tabs_created_total", 1u64);
                        snapshot.upsert(remote);
                        report.created += 1;
                    }
                    Err(e) => {
                        warn!(name = %tab.name, error = %e, "tab create failed");
                        counter!("tab_ops_failed_total", 1u64);
                        report.record_failure(format!("create tab {}", tab.name), e);
                    }
                }
            }
            Operation::Update { id, tab } => {
                match with_retry(&format!("update tab {}", tab.name), || {
                    api.update_tab(id, &tab)
                })
                .await
                {
                    Ok(remote) => {
                        info!(name = %remote.name, id, "tab updated");
                        counter!("tabs_updated_total", 1u64);
                        snapshot.upsert(remote);
                        report.updated += 1;
                    }
                    Err(e) => {
                        warn!(name = %tab.name, id, error = %e, "tab update failed");
                        counter!("tab_ops_failed_total", 1u64);
                        report.record_failure(format!("update tab {}", tab.name), e);
                    }
                }
            }
            Operation::Delete(tab) => {
                match with_retry(&format!("delete tab {}", tab.name), || {
                    api.delete_tab(tab.id)
                })
                .await
                {
                    Ok(()) => {
                        info!(name = %tab.name, id = tab.id, "tab deleted");
                        counter!("tabs_deleted_total", 1u64);
                        snapshot.remove(tab.id, &tab.name);
                        report.deleted += 1;
                    }
                    Err(e) => {
                        warn!(name = %tab.name, id = tab.id, error = %e, "tab delete failed");
                        counter!("tab_ops_failed_total", 1u64);
                        report.record_failure(format!("delete tab {}", tab.name), e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeRemote;
    use std::sync::atomic::Ordering;
    use tabsync_core::DesiredTab;

    fn desired(name: &str) -> DesiredTab {
        let mut tab = DesiredTab::new(name, "media/ingress/x");
        tab.url = Some(format!("https://{name}.example.com"));
        tab
    }

    fn transient() -> RemoteError {
        RemoteError::Transient {
            status: Some(503),
            message: "unavailable".into(),
        }
    }

    fn permanent() -> RemoteError {
        RemoteError::Permanent {
            status: 422,
            message: "validation".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_item_does_not_abort_the_plan() {
        let api = FakeRemote::default();
        api.create_tab_errors.lock().unwrap().extend([
            permanent(),
        ]);
        let plan = OperationPlan {
            ops: vec![
                Operation::Create(desired("Bad")),
                Operation::Create(desired("Good")),
            ],
        };
        let mut snapshot = RemoteSnapshot::default();
        let mut report = tabsync_core::CycleReport::started_now();
        apply_plan(&api, plan, &mut snapshot, &mut report, None).await;

        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(snapshot.tabs.len(), 1);
        assert_eq!(snapshot.tabs[0].name, "Good");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_then_succeed() {
        let api = FakeRemote::default();
        api.create_tab_errors
            .lock()
            .unwrap()
            .extend([transient(), transient()]);
        let plan = OperationPlan {
            ops: vec![Operation::Create(desired("Radarr"))],
        };
        let mut snapshot = RemoteSnapshot::default();
        let mut report = tabsync_core::CycleReport::started_now();
        apply_plan(&api, plan, &mut snapshot, &mut report, None).await;

        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(api.create_tab_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_after_bounded_attempts() {
        let api = FakeRemote::default();
        api.create_tab_errors
            .lock()
            .unwrap()
            .extend([transient(), transient(), transient(), transient()]);
        let plan = OperationPlan {
            ops: vec![Operation::Create(desired("Radarr"))],
        };
        let mut snapshot = RemoteSnapshot::default();
        let mut report = tabsync_core::CycleReport::started_now();
        apply_plan(&api, plan, &mut snapshot, &mut report, None).await;

        assert_eq!(report.created, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(api.create_tab_calls.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let api = FakeRemote::default();
        api.update_tab_errors.lock().unwrap().extend([permanent()]);
        let plan = OperationPlan {
            ops: vec![Operation::Update {
                id: 9,
                tab: desired("Radarr"),
            }],
        };
        let mut snapshot = RemoteSnapshot::default();
        let mut report = tabsync_core::CycleReport::started_now();
        apply_plan(&api, plan, &mut snapshot, &mut report, None).await;

        assert_eq!(api.update_tab_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_between_operations() {
        let api = FakeRemote::default();
        let plan = OperationPlan {
            ops: vec![
                Operation::Create(desired("A")),
                Operation::Create(desired("B")),
            ],
        };
        let (_tx, rx) = watch::channel(true);
        let mut snapshot = RemoteSnapshot::default();
        let mut report = tabsync_core::CycleReport::started_now();
        apply_plan(&api, plan, &mut snapshot, &mut report, Some(&rx)).await;
        assert_eq!(report.created, 0, "already-signalled shutdown applies nothing");
    }

    #[test]
    fn refresh_overlays_recently_applied_names_once() {
        let mut snapshot = RemoteSnapshot::default();
        let applied = tabsync_core::RemoteTab::from_desired(1, &desired("Radarr"));
        snapshot.upsert(applied.clone());

        // Stale remote read still carries the pre-update record.
        let mut stale = applied.clone();
        stale.url = "http://old".into();
        let other = tabsync_core::RemoteTab::from_desired(2, &desired("Manual"));
        snapshot.refresh(vec![stale.clone(), other.clone()]);

        assert!(snapshot.tabs.contains(&applied), "our write wins over the stale read");
        assert!(snapshot.tabs.contains(&other));

        // Overlay is consumed: the next refresh trusts the remote read.
        snapshot.refresh(vec![stale.clone()]);
        assert_eq!(snapshot.tabs, vec![stale]);
    }

    #[test]
    fn refresh_keeps_deletions_for_one_cycle() {
        let mut snapshot = RemoteSnapshot::default();
        let victim = tabsync_core::RemoteTab::from_desired(3, &desired("Gone"));
        snapshot.tabs = vec![victim.clone()];
        snapshot.remove(victim.id, &victim.name);

        // Stale read still lists the deleted tab.
        snapshot.refresh(vec![victim.clone()]);
        assert!(snapshot.tabs.is_empty(), "deleted tab must not resurface");
    }
}
