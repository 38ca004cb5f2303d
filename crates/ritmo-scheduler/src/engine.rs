//! Scheduler loop: runs a claim pass every poll interval.
//! Uses tokio::interval, so the runner sleeps between passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::claims::{ClaimProcessor, PassSummary};

/// Pass parameters for the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub poll_interval_secs: u64,
    pub batch_size: u32,
    pub claim_timeout_minutes: u32,
}

/// Run claim passes until `shutdown` flips to `true`.
///
/// A failed pass is logged and the loop keeps going; the next tick retries.
/// Returns the totals across all passes.
pub async fn spawn_scheduler(
    processor: Arc<ClaimProcessor>,
    settings: LoopSettings,
    mut shutdown: watch::Receiver<bool>,
) -> PassSummary {
    tracing::info!(
        "⏰ Cadence scheduler started as {} (check every {}s, batch {})",
        processor.worker_id(),
        settings.poll_interval_secs,
        settings.batch_size
    );

    let mut interval =
        tokio::time::interval(Duration::from_secs(settings.poll_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut totals = PassSummary::default();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match processor
            .run_claim_pass(settings.batch_size, settings.claim_timeout_minutes)
            .await
        {
            Ok(summary) => accumulate(&mut totals, &summary),
            Err(e) => tracing::error!("❌ Claim pass failed: {e}"),
        }
    }

    tracing::info!(
        "🛑 Cadence scheduler stopped ({} sent, {} completed, {} cancelled)",
        totals.sent,
        totals.completed,
        totals.cancelled
    );
    totals
}

fn accumulate(totals: &mut PassSummary, pass: &PassSummary) {
    totals.reclaimed += pass.reclaimed;
    totals.claimed += pass.claimed;
    totals.sent += pass.sent;
    totals.completed += pass.completed;
    totals.cancelled += pass.cancelled;
    totals.failed += pass.failed;
    totals.deferred += pass.deferred;
    totals.lost_claims += pass.lost_claims;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::BusinessCalendar;
    use crate::persistence::CadenceDb;
    use async_trait::async_trait;
    use ritmo_core::error::Result;
    use ritmo_core::traits::{EmailTransport, OrgDirectory};
    use ritmo_core::types::SendWindow;
    use std::collections::BTreeMap;

    struct NoopEmail;

    #[async_trait]
    impl EmailTransport for NoopEmail {
        async fn send_templated_email(
            &self,
            _template_code: &str,
            _recipient: &str,
            _variables: &BTreeMap<String, String>,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct AnyOrg;

    #[async_trait]
    impl OrgDirectory for AnyOrg {
        async fn org_timezone(&self, _org_id: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn send_window(&self, _org_id: &str) -> Result<SendWindow> {
            Ok(SendWindow::always())
        }
    }

    #[test]
    fn test_accumulate() {
        let mut totals = PassSummary::default();
        let pass = PassSummary {
            claimed: 3,
            sent: 2,
            completed: 1,
            ..Default::default()
        };
        accumulate(&mut totals, &pass);
        accumulate(&mut totals, &pass);
        assert_eq!(totals.claimed, 6);
        assert_eq!(totals.sent, 4);
        assert_eq!(totals.completed, 2);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let db = Arc::new(CadenceDb::open_in_memory().unwrap());
        let processor = Arc::new(ClaimProcessor::new(
            db.clone(),
            BusinessCalendar::default(),
            Arc::new(AnyOrg),
            db,
            Arc::new(NoopEmail),
        ));
        let (tx, rx) = watch::channel(false);
        let settings = LoopSettings {
            poll_interval_secs: 1,
            batch_size: 10,
            claim_timeout_minutes: 15,
        };
        let handle = tokio::spawn(spawn_scheduler(processor, settings, rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let totals = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(totals.claimed, 0);
    }
}
