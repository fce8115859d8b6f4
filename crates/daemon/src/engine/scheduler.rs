// Periodic closure sweep.
//
// Each tick evaluates every open amendment in its own task. A failure is
// scoped to its amendment, which stays open and is retried next tick.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{ClosureOutcome, Engine, EngineError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub still_open: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub conflicted: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn closed(&self) -> usize {
        self.accepted + self.rejected + self.conflicted
    }

    fn record(&mut self, outcome: ClosureOutcome) {
        match outcome {
            ClosureOutcome::StillOpen => self.still_open += 1,
            ClosureOutcome::Skipped => {}
            ClosureOutcome::Accepted { .. } => self.accepted += 1,
            ClosureOutcome::Rejected => self.rejected += 1,
            ClosureOutcome::Conflicted => self.conflicted += 1,
        }
    }
}

/// Evaluates every open amendment as of `now`.
pub async fn sweep(engine: &Engine, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
    let ids = engine.open_amendment_ids().await?;
    let mut report = SweepReport { evaluated: ids.len(), ..SweepReport::default() };

    let mut tasks = JoinSet::new();
    for amendment_id in ids {
        let engine = engine.clone();
        tasks.spawn(async move {
            let result = engine.evaluate_amendment(amendment_id, now).await;
            (amendment_id, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((amendment_id, Ok(outcome))) => {
                report.record(outcome);
                if !matches!(outcome, ClosureOutcome::StillOpen) {
                    engine.release_amendment(amendment_id).await;
                }
            }
            Ok((amendment_id, Err(error))) => {
                report.failed += 1;
                warn!(amendment_id = %amendment_id, %error, "closure evaluation failed");
            }
            Err(error) => {
                report.failed += 1;
                warn!(%error, "closure task aborted");
            }
        }
    }

    Ok(report)
}

/// Starts the sweep loop. The first sweep runs immediately.
pub fn start_closure_scheduler(engine: Engine, tick_interval: Duration) -> SchedulerHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (report_tx, report_rx) = watch::channel(None);

    let task = tokio::spawn(async move {
        scheduler_loop(engine, tick_interval, shutdown_rx, report_tx).await;
    });

    SchedulerHandle { task, shutdown_tx, last_report: report_rx }
}

/// Handle for the sweep task. Dropping it leaves the task running until
/// the runtime stops; call [`SchedulerHandle::shutdown`] to stop it.
pub struct SchedulerHandle {
    task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    last_report: watch::Receiver<Option<SweepReport>>,
}

impl SchedulerHandle {
    /// Report of the most recent completed sweep.
    pub fn reports(&self) -> watch::Receiver<Option<SweepReport>> {
        self.last_report.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(error) = self.task.await {
            warn!(%error, "closure scheduler task ended abnormally");
        }
    }
}

async fn scheduler_loop(
    engine: Engine,
    tick_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    report_tx: watch::Sender<Option<SweepReport>>,
) {
    info!(tick_ms = tick_interval.as_millis() as u64, "closure scheduler started");
    loop {
        match sweep(&engine, Utc::now()).await {
            Ok(report) => {
                if report.closed() > 0 || report.failed > 0 {
                    info!(
                        evaluated = report.evaluated,
                        accepted = report.accepted,
                        rejected = report.rejected,
                        conflicted = report.conflicted,
                        failed = report.failed,
                        "closure sweep finished"
                    );
                } else {
                    debug!(evaluated = report.evaluated, "closure sweep finished");
                }
                let _ = report_tx.send(Some(report));
            }
            Err(error) => warn!(%error, "failed to list open amendments"),
        }

        tokio::select! {
            _ = tokio::time::sleep(tick_interval) => {},
            _ = shutdown_rx.changed() => {
                debug!("closure scheduler shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use emendare_common::diff;
    use emendare_common::types::{ElectorateMode, VoteStance};

    use super::*;
    use crate::engine::{EngineSettings, NewAmendment};
    use crate::notify::NullPublisher;
    use crate::store::MemoryStore;

    fn immediate_engine() -> Engine {
        let settings =
            EngineSettings { delay_min_sec: 0, delay_max_sec: 0, electorate: ElectorateMode::Live };
        Engine::new(Arc::new(MemoryStore::new()), Arc::new(NullPublisher), settings)
    }

    async fn propose(engine: &Engine, target: &str) -> uuid::Uuid {
        let author = engine.create_user("author").await.unwrap();
        let document = engine.create_document("Charter", "", "text").await.unwrap();
        engine.follow(author.id, document.id).await.unwrap();
        let amendment = engine
            .propose_amendment(NewAmendment {
                document_id: document.id,
                author_id: author.id,
                name: "edit".to_string(),
                description: String::new(),
                base_version: 1,
                patch: diff::diff("text", target),
                delay_min_sec: None,
                delay_max_sec: None,
            })
            .await
            .unwrap();
        engine.cast_vote(amendment.id, author.id, VoteStance::Up).await.unwrap();
        amendment.id
    }

    #[tokio::test]
    async fn sweep_reports_outcomes() {
        let engine = immediate_engine();
        let amendment_id = propose(&engine, "texts").await;

        let report = sweep(&engine, Utc::now()).await.unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.failed, 0);

        let again = sweep(&engine, Utc::now()).await.unwrap();
        assert_eq!(again, SweepReport::default());

        let document_id = engine.get_amendment(amendment_id).await.unwrap().document_id;
        assert_eq!(engine.get_document(document_id).await.unwrap().body, "texts");
    }

    #[tokio::test(start_paused = true)]
    async fn loop_sweeps_on_every_tick_until_shutdown() {
        let engine = immediate_engine();
        let handle = start_closure_scheduler(engine.clone(), Duration::from_secs(10));
        let mut reports = handle.reports();

        reports.changed().await.unwrap();
        assert_eq!(*reports.borrow(), Some(SweepReport::default()));

        propose(&engine, "texts").await;
        tokio::time::advance(Duration::from_secs(10)).await;
        reports.changed().await.unwrap();
        assert_eq!(reports.borrow().map(|r| r.accepted), Some(1));

        handle.shutdown().await;
    }
}
