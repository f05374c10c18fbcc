//! Periodic reconciliation loop
//!
//! One background task drives [`TaskTracker::reconcile`] on a fixed interval
//! for the lifetime of the process. Cancelling the token stops scheduling new
//! passes; a pass already running is allowed to finish.

use crate::tracker::TaskTracker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spawns the reconciliation loop.
///
/// Await the returned handle after cancelling `shutdown` to wait for the
/// in-flight pass.
pub fn spawn_reconciler(
    tracker: Arc<TaskTracker>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Reconciler started");

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Failures are transient: the same set is retried next tick
            match tracker.reconcile().await {
                Ok(report) => debug!(pending = report.pending, "Reconcile tick"),
                Err(e) => warn!(error = %e, "Reconciliation failed, retrying next interval"),
            }
        }

        info!("Reconciler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockRenderClient, RenderError, TaskDetail};
    use crate::delivery::MockDelivery;
    use crate::identity::Identity;
    use crate::quota::QuotaLedger;
    use crate::storage::tests::temp_dir;
    use crate::storage::JsonFile;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_loop_survives_errors_and_stops_on_cancel() {
        let dir = temp_dir();
        let alice = Identity::direct("1", "alice");
        let ledger = Arc::new(
            QuotaLedger::open(JsonFile::new(dir.join("quota.json")), 10, 30)
                .await
                .expect("open ledger"),
        );
        ledger.get_or_init(&alice).await.expect("init");

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut client = MockRenderClient::new();
        client.expect_list_by_condition().returning(move |ids| {
            // First pass fails, the next one finds the job finished
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(RenderError::Network("timeout".into()));
            }
            Ok(ids
                .iter()
                .map(|id| TaskDetail {
                    id: id.clone(),
                    action: "IMAGINE".into(),
                    status: "SUCCESS".into(),
                    ..TaskDetail::default()
                })
                .collect())
        });
        let mut delivery = MockDelivery::new();
        delivery.expect_deliver().returning(|_, _| Ok(()));

        let tracker = Arc::new(TaskTracker::new(
            Arc::new(client),
            Arc::new(delivery),
            ledger.clone(),
            Duration::from_secs(3600),
        ));
        tracker
            .register("job-1", alice.key(), alice.reply_target())
            .await;

        let shutdown = CancellationToken::new();
        let handle = spawn_reconciler(tracker.clone(), Duration::from_millis(20), shutdown.clone());

        for _ in 0..100 {
            if !tracker.contains("job-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.expect("reconciler task");

        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert!(!tracker.contains("job-1"));
        assert_eq!(ledger.get(&alice.key()).await.map(|r| r.remaining), Some(9));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
