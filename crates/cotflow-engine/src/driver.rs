//! Consumer loops that call `advance` when tasks finish.
//!
//! `advance` never waits on a backend, so something has to call it again once
//! dispatched work completes. [`Driver::run_session`] drives one session to a
//! stopping point, waking on completion events with a poll fallback.
//! [`Driver::spawn`] runs in the background and advances whichever session a
//! completion event belongs to.

use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cotflow_utils::error::CotflowError;
use cotflow_utils::types::SessionId;

use crate::orchestrator::{AdvanceOutcome, AdvanceReport, Orchestrator};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct Driver {
    orchestrator: Orchestrator,
    poll_interval: Duration,
}

impl Driver {
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Advance `id` until it completes, fails, blocks or is otherwise terminal.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `advance`.
    pub async fn run_session(&self, id: &SessionId) -> Result<AdvanceReport, CotflowError> {
        let mut events = self.orchestrator.dispatcher().subscribe();
        loop {
            let report = self.orchestrator.advance(id).await?;
            debug!(
                session_id = %id,
                phase = report.phase,
                step = %report.step,
                outcome = ?report.outcome,
                "Driver advanced session"
            );
            if report.outcome.is_final() {
                return Ok(report);
            }

            let deadline = tokio::time::sleep(self.poll_interval);
            tokio::pin!(deadline);
            let mut channel_closed = false;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(done) if &done.session_id == id => break,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Driver lagged behind completion events");
                            break;
                        }
                        Err(RecvError::Closed) => {
                            channel_closed = true;
                            break;
                        }
                    },
                    () = &mut deadline => break,
                }
            }
            if channel_closed {
                deadline.await;
            }
        }
    }

    /// Advance the owning session of every completed task, until aborted.
    #[must_use]
    pub fn spawn(&self) -> JoinHandle<()> {
        let driver = self.clone();
        let mut events = self.orchestrator.dispatcher().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(done) => driver.advance_settled(&done.session_id).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Driver dropped completion events; polling will catch up");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    /// Advance once, retrying while another invocation holds the lease.
    async fn advance_settled(&self, id: &SessionId) {
        loop {
            match self.orchestrator.advance(id).await {
                Ok(AdvanceReport {
                    outcome: AdvanceOutcome::AlreadyExecuting { .. },
                    ..
                }) => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(report) => {
                    debug!(session_id = %id, outcome = ?report.outcome, "Driver advanced session");
                    return;
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Driver could not advance session");
                    return;
                }
            }
        }
    }
}
