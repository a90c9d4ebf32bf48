//! Bounded readiness poll loop

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use kubelab_proto::{Phase, WorkloadRef};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::checker::ComponentHealthChecker;
use crate::error::ReadinessError;
use crate::session::{PollSession, ReadinessReport};

/// Poll loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Delay between iterations
    pub interval: Duration,
    /// Overall budget of one `wait` call
    pub timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Progress notifications for presentation adapters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessEvent {
    /// One iteration finished
    Tick { iteration: u64, elapsed: Duration },
    /// A workload moved to a new phase
    PhaseChanged {
        workload: WorkloadRef,
        phase: Phase,
        message: String,
    },
    /// The application probe chain ran
    ApplicationProbe { healthy: bool, message: String },
}

/// Polls workloads until they are verifiably healthy
pub struct ReadinessPoller {
    checker: ComponentHealthChecker,
    interval: Duration,
    timeout: Duration,
    events: Option<UnboundedSender<ReadinessEvent>>,
}

impl ReadinessPoller {
    pub fn new(checker: ComponentHealthChecker, config: PollerConfig) -> Self {
        Self {
            checker,
            interval: config.interval,
            timeout: config.timeout,
            events: None,
        }
    }

    /// Publish progress events to `sender`
    pub fn with_events(mut self, sender: UnboundedSender<ReadinessEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    fn emit(&self, event: ReadinessEvent) {
        if let Some(sender) = &self.events {
            // A dropped receiver only means nobody is rendering progress.
            let _ = sender.send(event);
        }
    }

    /// Poll until ready within the configured [`PollerConfig::timeout`]
    pub async fn wait(&self, workloads: &[WorkloadRef]) -> Result<ReadinessReport, ReadinessError> {
        self.wait_until_ready(workloads, self.timeout).await
    }

    /// Poll until every workload is Ready and the application answers
    ///
    /// Never returns `Timeout` before `timeout` has elapsed.
    pub async fn wait_until_ready(
        &self,
        workloads: &[WorkloadRef],
        timeout: Duration,
    ) -> Result<ReadinessReport, ReadinessError> {
        let span = info_span!("readiness", session = %Uuid::new_v4(), workloads = workloads.len());
        self.poll(workloads, timeout).instrument(span).await
    }

    async fn poll(
        &self,
        workloads: &[WorkloadRef],
        timeout: Duration,
    ) -> Result<ReadinessReport, ReadinessError> {
        let started = Instant::now();
        let mut session = PollSession::new(workloads);
        let mut iteration: u64 = 0;

        info!(timeout = ?timeout, "waiting for workloads to become ready");

        loop {
            iteration += 1;
            self.iterate(&mut session).await?;

            let elapsed = started.elapsed();
            self.emit(ReadinessEvent::Tick { iteration, elapsed });

            if session.is_complete() {
                info!(elapsed = ?elapsed, iterations = iteration, "all components ready");
                return Ok(session.report(elapsed, iteration));
            }

            if elapsed >= timeout {
                info!(elapsed = ?elapsed, "readiness deadline passed");
                return Err(ReadinessError::Timeout {
                    timeout,
                    report: Box::new(session.report(elapsed, iteration)),
                });
            }

            let remaining = timeout - elapsed;
            tokio::time::sleep(self.interval.min(remaining)).await;
        }
    }

    async fn iterate(&self, session: &mut PollSession) -> Result<(), ReadinessError> {
        let pending = session.pending();
        let targets: Vec<WorkloadRef> = pending
            .iter()
            .filter_map(|&i| session.workload(i).cloned())
            .collect();

        let outcomes = join_all(targets.iter().map(|w| self.checker.check_workload(w))).await;

        let now = Utc::now();
        for ((index, workload), outcome) in pending.into_iter().zip(&targets).zip(outcomes) {
            let outcome = outcome?;
            if let Some(phase) = session.observe(index, &outcome, now) {
                info!(workload = %workload, phase = %phase, message = %outcome.message(), "workload phase changed");
                self.emit(ReadinessEvent::PhaseChanged {
                    workload: workload.clone(),
                    phase,
                    message: outcome.message(),
                });
            } else {
                debug!(workload = %workload, message = %outcome.message(), "workload unchanged");
            }
        }

        if session.all_ready() {
            let result = self.checker.check_application().await?;
            if result.healthy {
                info!(message = %result.message, "application probe succeeded");
            } else {
                debug!(message = %result.message, "infra ready, app warming up");
            }
            self.emit(ReadinessEvent::ApplicationProbe {
                healthy: result.healthy,
                message: result.message.clone(),
            });
            session.record_application(&result, Utc::now());
        }

        Ok(())
    }
}
