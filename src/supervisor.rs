//! Run supervisor
//!
//! Restarts the whole session (login, connect, subscribe, stream) with
//! exponential backoff until it ends cleanly, shutdown is requested, or the
//! retry budget runs out.

use crate::resilience::{BackoffConfig, ExponentialBackoff};
use std::fmt::Display;
use std::future::Future;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("giving up after {attempts} attempts: {last_error}")]
    BudgetExhausted { attempts: u32, last_error: String },
}

/// Retries a fallible session under an exponential backoff schedule
#[derive(Debug)]
pub struct Supervisor {
    backoff: BackoffConfig,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(backoff: BackoffConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self { backoff, shutdown }
    }

    /// Run `session` until it returns `Ok`, shutdown is signalled, or the
    /// backoff budget is exhausted
    ///
    /// `session` receives the 1-based attempt number. An attempt that ran
    /// longer than the maximum backoff step restarts the schedule.
    pub async fn run<F, Fut, E>(&mut self, mut session: F) -> Result<(), SupervisorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut backoff = ExponentialBackoff::new(self.backoff.clone());
        let mut attempts = 0u32;

        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            attempts += 1;
            let started = Instant::now();
            tracing::info!(attempt = attempts, "Starting session");

            let result = tokio::select! {
                result = session(attempts) => result,
                Ok(_) = self.shutdown.wait_for(|stop| *stop) => {
                    tracing::info!("Shutdown requested, stopping session");
                    return Ok(());
                }
            };

            let error = match result {
                Ok(()) => {
                    tracing::info!(attempt = attempts, "Session finished");
                    return Ok(());
                }
                Err(e) => e.to_string(),
            };

            let ran_for = started.elapsed();
            if ran_for > backoff.config().max_interval {
                tracing::debug!(ran_for_secs = ran_for.as_secs(), "Long session, resetting backoff");
                backoff.reset();
            }

            let Some(delay) = backoff.next_backoff() else {
                tracing::error!(attempts, error = %error, "Retry budget exhausted");
                return Err(SupervisorError::BudgetExhausted {
                    attempts,
                    last_error: error,
                });
            };

            tracing::warn!(
                attempt = attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Session failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                Ok(_) = self.shutdown.wait_for(|stop| *stop) => {
                    tracing::info!("Shutdown requested during backoff");
                    return Ok(());
                }
            }
        }
    }
}
