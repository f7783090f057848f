//! Background workers: TTL sweeper, retention cleaner, metrics gauges.
//!
//! Every worker owns its own error handling (log and continue) and stops
//! when the shutdown flag flips.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use islet_db::{Database, SandboxStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::runtime::ContainerRuntime;
use crate::sandboxes::SandboxService;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const GAUGE_INTERVAL: Duration = Duration::from_secs(30);
pub const LOG_RETENTION_DAYS: i64 = 7;
pub const AUDIT_RETENTION_DAYS: i64 = 90;

/// Periodically expires sandboxes past their TTL.
pub fn spawn_ttl_sweeper<R>(
    service: SandboxService<R>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    R: ContainerRuntime,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = service.sweep_expired().await;
                    if expired > 0 {
                        info!(expired, "ttl sweep expired sandboxes");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Daily cleanup of aged sandbox logs and audit entries.
pub fn spawn_retention_cleaner(
    db: Database,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let log_cutoff = Utc::now() - chrono::Duration::days(LOG_RETENTION_DAYS);
                    match db.purge_sandbox_logs_before(log_cutoff).await {
                        Ok(purged) if purged > 0 => info!(purged, "purged aged sandbox logs"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "log retention pass failed"),
                    }

                    let audit_cutoff = Utc::now() - chrono::Duration::days(AUDIT_RETENTION_DAYS);
                    match db.purge_audit_entries_before(audit_cutoff).await {
                        Ok(purged) if purged > 0 => info!(purged, "purged aged audit entries"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "audit retention pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Fleet gauges backing the text metrics exposition.
#[derive(Debug, Default)]
pub struct MetricsGauges {
    pub sandboxes_total: AtomicI64,
    pub sandboxes_pending: AtomicI64,
    pub sandboxes_running: AtomicI64,
    pub sandboxes_error: AtomicI64,
}

impl MetricsGauges {
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str("# HELP islet_up Whether the control plane is serving.\n");
        out.push_str("# TYPE islet_up gauge\nislet_up 1\n");
        out.push_str("# HELP islet_sandboxes Sandboxes by coarse status.\n");
        out.push_str("# TYPE islet_sandboxes gauge\n");
        out.push_str(&format!(
            "islet_sandboxes{{status=\"total\"}} {}\n",
            self.sandboxes_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "islet_sandboxes{{status=\"pending\"}} {}\n",
            self.sandboxes_pending.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "islet_sandboxes{{status=\"running\"}} {}\n",
            self.sandboxes_running.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "islet_sandboxes{{status=\"error\"}} {}\n",
            self.sandboxes_error.load(Ordering::Relaxed)
        ));
        out
    }
}

/// Keeps the gauges fresh from store counts.
pub fn spawn_gauge_refresher(
    db: Database,
    gauges: Arc<MetricsGauges>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = refresh(&db, &gauges).await {
                        warn!(error = %err, "gauge refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn refresh(db: &Database, gauges: &MetricsGauges) -> islet_db::Result<()> {
    gauges
        .sandboxes_total
        .store(db.count_sandboxes_total().await?, Ordering::Relaxed);
    gauges.sandboxes_pending.store(
        db.count_sandboxes_with_status(SandboxStatus::Pending).await?,
        Ordering::Relaxed,
    );
    gauges.sandboxes_running.store(
        db.count_sandboxes_with_status(SandboxStatus::Running).await?,
        Ordering::Relaxed,
    );
    gauges.sandboxes_error.store(
        db.count_sandboxes_with_status(SandboxStatus::Error).await?,
        Ordering::Relaxed,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_render_prometheus_text() {
        let gauges = MetricsGauges::default();
        gauges.sandboxes_total.store(3, Ordering::Relaxed);
        gauges.sandboxes_running.store(2, Ordering::Relaxed);
        let text = gauges.render();
        assert!(text.contains("islet_up 1"));
        assert!(text.contains("islet_sandboxes{status=\"total\"} 3"));
        assert!(text.contains("islet_sandboxes{status=\"running\"} 2"));
    }
}
