//! Leader step-down for clustered consumers

use crate::broker::{ConsumerHandle, ConsumerInfo};
use crate::error::{ConsumerError, ConsumerResult};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Number of state polls after the step-down request
pub const STEP_DOWN_ATTEMPTS: usize = 5;

/// Delay before each state poll
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What happened after leadership was given up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDownOutcome {
    /// A different leader was observed
    Elected {
        /// Leader before the request
        previous: String,
        /// Leader observed afterwards
        leader: String,
        /// Polls it took to see the change
        attempts: usize,
    },
    /// No change was observed within the poll budget
    Unchanged {
        /// Leader that is still reported
        leader: String,
        /// Time spent polling
        elapsed: Duration,
    },
}

impl StepDownOutcome {
    /// True when a new leader was seen
    pub fn is_elected(&self) -> bool {
        matches!(self, StepDownOutcome::Elected { .. })
    }
}

impl std::fmt::Display for StepDownOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepDownOutcome::Elected { leader, .. } => write!(f, "New leader elected \"{}\"", leader),
            StepDownOutcome::Unchanged { elapsed, .. } => {
                write!(f, "Leader did not change after {:.1}s", elapsed.as_secs_f64())
            }
        }
    }
}

/// Outcome plus the consumer state observed at the end
#[derive(Debug, Clone)]
pub struct StepDownReport {
    /// Election result
    pub outcome: StepDownOutcome,
    /// Final consumer state
    pub state: ConsumerInfo,
}

/// Asks a consumer's leader to step down and watches for the new one
#[derive(Debug)]
pub struct LeaderStepDown<'a> {
    consumer: &'a ConsumerHandle,
    attempts: usize,
    interval: Duration,
}

impl<'a> LeaderStepDown<'a> {
    /// Coordinator for `consumer`
    pub fn new(consumer: &'a ConsumerHandle) -> Self {
        Self {
            consumer,
            attempts: STEP_DOWN_ATTEMPTS,
            interval: POLL_INTERVAL,
        }
    }

    /// Request the step-down and poll until a new leader shows up
    pub async fn run(&self) -> ConsumerResult<StepDownReport> {
        let info = self.consumer.state().await?;
        let Some(cluster) = info.cluster.as_ref() else {
            return Err(ConsumerError::NotClustered {
                stream: self.consumer.stream_name().to_string(),
                consumer: self.consumer.name().to_string(),
            });
        };

        let previous = cluster.leader.clone();
        info!(
            stream = self.consumer.stream_name(),
            consumer = self.consumer.name(),
            leader = %previous,
            "Requesting leader step down of {} in a {} peer RAFT group",
            previous,
            cluster.replicas.len() + 1
        );
        self.consumer.request_leader_step_down().await?;

        let started = Instant::now();
        let mut outcome = None;
        let mut last_seen = previous.clone();
        let mut last_state = info.clone();

        for attempt in 1..=self.attempts {
            tokio::time::sleep(self.interval).await;

            let state = match self.consumer.state().await {
                Ok(state) => state,
                Err(e) => {
                    warn!(attempt, error = %e, "consumer state request failed");
                    continue;
                }
            };

            let Some(leader) = state.cluster.as_ref().map(|c| c.leader.clone()) else {
                debug!(attempt, "consumer state has no cluster information");
                continue;
            };
            last_state = state;

            if leader != previous {
                info!(attempt, leader = %leader, "new leader elected");
                outcome = Some(StepDownOutcome::Elected {
                    previous: previous.clone(),
                    leader,
                    attempts: attempt,
                });
                break;
            }

            debug!(attempt, leader = %leader, "leader unchanged");
            last_seen = leader;
        }

        let outcome = outcome.unwrap_or_else(|| {
            let elapsed = started.elapsed();
            warn!(elapsed = ?elapsed, "no new leader elected");
            StepDownOutcome::Unchanged {
                leader: last_seen,
                elapsed,
            }
        });

        let state = match self.consumer.state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "could not refresh consumer state, reporting the last one seen");
                last_state
            }
        };
        Ok(StepDownReport { outcome, state })
    }
}
