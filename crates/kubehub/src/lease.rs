//! Lease-based leadership gate for HA deployments.
//!
//! One holder at a time per Lease object. The gate exposes a plain boolean
//! the reconciliation loop checks per trigger; losing the lease mid-cycle
//! does not interrupt the cycle in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use tabsync_core::LeadershipGate;
use tracing::{debug, info, warn};

const LEASE_DURATION_SECS: i32 = 30;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);

pub struct LeaseGate {
    leading: Arc<AtomicBool>,
}

impl LeadershipGate for LeaseGate {
    fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Relaxed)
    }
}

/// Spawn the acquire/renew loop for a `coordination.k8s.io/v1` Lease.
pub fn spawn_lease_gate(
    client: Client,
    namespace: String,
    name: String,
    identity: String,
) -> LeaseGate {
    let leading = Arc::new(AtomicBool::new(false));
    let flag = leading.clone();
    tokio::spawn(async move {
        let api: Api<Lease> = Api::namespaced(client, &namespace);
        loop {
            let held = match try_acquire(&api, &name, &identity).await {
                Ok(held) => held,
                Err(e) => {
                    warn!(lease = %name, error = %e, "lease acquire attempt failed");
                    false
                }
            };
            let was = flag.swap(held, Ordering::Relaxed);
            if held != was {
                if held {
                    info!(lease = %name, identity = %identity, "acquired leadership");
                } else {
                    warn!(lease = %name, identity = %identity, "lost leadership");
                }
            }
            tokio::time::sleep(RENEW_INTERVAL).await;
        }
    });
    LeaseGate { leading }
}

/// Take or renew the lease. A conflicting write from another replica reads
/// as "not leader this round", not as an error.
async fn try_acquire(api: &Api<Lease>, name: &str, identity: &str) -> Result<bool> {
    let now = MicroTime(Utc::now());
    match api.get_opt(name).await? {
        None => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        Some(mut lease) => {
            let spec = lease.spec.clone().unwrap_or_default();
            let holder = spec.holder_identity.clone().unwrap_or_default();
            let expired = match &spec.renew_time {
                Some(t) => {
                    let age = Utc::now() - t.0;
                    age > chrono::Duration::seconds(
                        spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECS) as i64,
                    )
                }
                None => true,
            };
            if holder != identity && !expired {
                debug!(lease = %name, holder = %holder, "lease held elsewhere");
                return Ok(false);
            }

            let mut next = spec;
            if holder != identity {
                next.acquire_time = Some(now.clone());
                next.lease_transitions = Some(next.lease_transitions.unwrap_or(0) + 1);
            }
            next.holder_identity = Some(identity.to_string());
            next.renew_time = Some(now);
            next.lease_duration_seconds = Some(LEASE_DURATION_SECS);
            lease.spec = Some(next);
            match api.replace(name, &PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}
