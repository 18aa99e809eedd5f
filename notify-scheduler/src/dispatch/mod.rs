//! Concurrent delivery fan-out.
//!
//! [`Dispatcher::dispatch`] sends one notification to many endpoints in
//! parallel under a shared deadline and returns one [`Outcome`] per endpoint,
//! in input order. It never retries; [`aggregate`] turns the outcomes into
//! the queue's next state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::endpoint::DeliveryEndpoint;
use crate::error::DeliveryError;
use crate::notification::Notification;

/// Default cap on concurrent deliveries within one fan-out.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Result of delivering to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub service_id: String,
    pub success: bool,
    pub error: Option<DeliveryError>,
    pub duration: Duration,
}

impl Outcome {
    pub fn succeeded(service_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            service_id: service_id.into(),
            success: true,
            error: None,
            duration,
        }
    }

    pub fn failed(service_id: impl Into<String>, error: DeliveryError, duration: Duration) -> Self {
        Self {
            service_id: service_id.into(),
            success: false,
            error: Some(error),
            duration,
        }
    }
}

/// Fan-out configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on concurrent deliveries; the effective pool is
    /// `min(endpoints, max_concurrency)`.
    pub max_concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

/// Dispatches notifications to endpoints concurrently.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config }
    }

    /// Deliver `notification` to every endpoint, bounded by `deadline`.
    pub async fn dispatch(
        &self,
        notification: Arc<Notification>,
        endpoints: Vec<Arc<dyn DeliveryEndpoint>>,
        deadline: Duration,
    ) -> Vec<Outcome> {
        self.dispatch_with_cancel(notification, endpoints, deadline, &CancellationToken::new())
            .await
    }

    /// Like [`dispatch`](Self::dispatch), also stopping when `parent` is cancelled.
    pub async fn dispatch_with_cancel(
        &self,
        notification: Arc<Notification>,
        endpoints: Vec<Arc<dyn DeliveryEndpoint>>,
        deadline: Duration,
        parent: &CancellationToken,
    ) -> Vec<Outcome> {
        if endpoints.is_empty() {
            return Vec::new();
        }

        let token = parent.child_token();
        let permits = endpoints.len().min(self.config.max_concurrency.max(1));
        let semaphore = Arc::new(Semaphore::new(permits));
        let deadline_at = tokio::time::Instant::now() + deadline;

        let timer = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline_at) => {
                        debug!("Dispatch deadline reached, cancelling in-flight deliveries");
                        token.cancel();
                    }
                }
            })
        };

        let service_ids: Vec<&'static str> = endpoints.iter().map(|e| e.service_id()).collect();
        let mut tasks = JoinSet::new();

        for (index, endpoint) in endpoints.into_iter().enumerate() {
            let notification = notification.clone();
            let semaphore = semaphore.clone();
            let token = token.clone();

            tasks.spawn(async move {
                let service_id = endpoint.service_id();

                // Tasks that never got a slot before the deadline skip themselves.
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (index, Outcome::failed(service_id, DeliveryError::Cancelled, Duration::ZERO));
                };

                let started = Instant::now();
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(DeliveryError::Cancelled),
                    result = endpoint.send(&notification, &token) => result,
                };
                let duration = started.elapsed();

                let outcome = match result {
                    Ok(()) => Outcome::succeeded(service_id, duration),
                    Err(e) => Outcome::failed(service_id, e, duration),
                };
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<Outcome>> = vec![None; service_ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => warn!(error = %e, "Delivery task panicked"),
            }
        }

        token.cancel();
        let _ = timer.await;

        outcomes
            .into_iter()
            .zip(service_ids)
            .map(|(outcome, service_id)| {
                outcome.unwrap_or_else(|| {
                    Outcome::failed(
                        service_id,
                        DeliveryError::transient("delivery task aborted"),
                        Duration::ZERO,
                    )
                })
            })
            .collect()
    }
}

/// Queue decision after a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregation {
    /// Every endpoint succeeded, or some did (`warning` lists the failures).
    Completed { warning: Option<String> },
    /// All failed and attempts remain.
    Retry { error: String },
    /// All failed and attempts are exhausted.
    Fail { error: String },
}

fn summarize_failures<'a>(outcomes: impl Iterator<Item = &'a Outcome>) -> String {
    outcomes
        .filter(|o| !o.success)
        .map(|o| match &o.error {
            Some(e) => format!("{}: {}", o.service_id, e),
            None => format!("{}: failed", o.service_id),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Map per-endpoint outcomes to the job's next state.
///
/// Partial success is terminal. Retries only happen when every endpoint failed.
pub fn aggregate(outcomes: &[Outcome], retry_count: i64, max_retries: i64) -> Aggregation {
    let succeeded = outcomes.iter().filter(|o| o.success).count();

    if !outcomes.is_empty() && succeeded == outcomes.len() {
        return Aggregation::Completed { warning: None };
    }

    if succeeded > 0 {
        return Aggregation::Completed {
            warning: Some(format!(
                "partial delivery ({}/{} succeeded): {}",
                succeeded,
                outcomes.len(),
                summarize_failures(outcomes.iter())
            )),
        };
    }

    let error = if outcomes.is_empty() {
        "no endpoints to deliver to".to_string()
    } else {
        summarize_failures(outcomes.iter())
    };

    if retry_count < max_retries {
        Aggregation::Retry { error }
    } else {
        Aggregation::Fail { error }
    }
}
