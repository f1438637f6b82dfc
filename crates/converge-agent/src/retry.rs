//! Retrying invoker with a fixed inter-attempt delay
//!
//! One initial attempt plus `max_retries` retries. Only transient errors are
//! retried; anything else aborts at once. Running out of attempts turns the
//! last transient error into [`ConvergeError::RetriesExhausted`].

use crate::client::ModelClient;
use crate::types::ModelResponse;
use converge_core::{ConvergeError, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_DELAY: Duration = Duration::from_secs(2);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Immutable retry configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Fixed wait between attempts (no backoff)
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Build from a delay in (possibly fractional) seconds
    pub fn from_secs(max_retries: u32, delay_secs: f64) -> Result<Self> {
        if !delay_secs.is_finite() || delay_secs < 0.0 {
            return Err(ConvergeError::Config(format!(
                "Retry delay must be a non-negative number of seconds, got {}",
                delay_secs
            )));
        }
        Ok(Self::new(max_retries, Duration::from_secs_f64(delay_secs)))
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_DELAY)
    }
}

/// Whitespace-separated token count, used for request size diagnostics
pub fn token_len(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Wraps a [`ModelClient`] with the retry policy
pub struct RetryingInvoker<C> {
    client: C,
    policy: RetryPolicy,
    progress_interval: Duration,
}

impl<C: ModelClient> RetryingInvoker<C> {
    pub fn new(client: C, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            progress_interval: PROGRESS_INTERVAL,
        }
    }

    /// Change how often an in-flight attempt logs its elapsed time
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run one refinement request under the retry policy
    pub async fn invoke(
        &self,
        instructions: &str,
        history: &str,
        iteration: usize,
    ) -> Result<ModelResponse> {
        let max_attempts = self.policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            debug!(
                "model {} iter {}, try {}: instructions_len={}, input_len={}",
                self.client.model_name(),
                iteration,
                attempt,
                token_len(instructions),
                token_len(history)
            );

            let started = Instant::now();
            match self.attempt(instructions, history, iteration, attempt).await {
                Ok(response) => {
                    info!(
                        "Iter {}, try {}: success in {:.1}s ({} chars)",
                        iteration,
                        attempt,
                        started.elapsed().as_secs_f64(),
                        response.text.chars().count()
                    );
                    return Ok(response);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Iter {}, try {}/{} failed after {:.1}s: {}",
                        iteration,
                        attempt,
                        max_attempts,
                        started.elapsed().as_secs_f64(),
                        e
                    );
                    last_error = e.to_string();

                    if attempt < max_attempts {
                        debug!(
                            "Iter {}: retrying in {:.1}s",
                            iteration,
                            self.policy.delay.as_secs_f64()
                        );
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
                Err(e) => {
                    error!("Iter {}, try {}: non-retryable error: {}", iteration, attempt, e);
                    return Err(e);
                }
            }
        }

        Err(ConvergeError::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// One attempt, logging elapsed time while the request is in flight
    async fn attempt(
        &self,
        instructions: &str,
        history: &str,
        iteration: usize,
        attempt: u32,
    ) -> Result<ModelResponse> {
        let started = Instant::now();
        let call = self.client.refine(instructions, history);
        tokio::pin!(call);

        let mut ticker = tokio::time::interval(self.progress_interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut call => return result,
                _ = ticker.tick() => {
                    debug!(
                        "Iter {}, try {}: {}s",
                        iteration,
                        attempt,
                        started.elapsed().as_secs()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedClient {
        script: Mutex<VecDeque<Result<ModelResponse>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<ModelResponse>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn refine(&self, _instructions: &str, _history: &str) -> Result<ModelResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ConvergeError::Other("script exhausted".into())))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn transient() -> Result<ModelResponse> {
        Err(ConvergeError::Transient("503".into()))
    }

    fn no_delay(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::ZERO)
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay, Duration::from_secs(2));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn test_policy_from_secs() {
        let policy = RetryPolicy::from_secs(2, 0.5).unwrap();
        assert_eq!(policy.delay, Duration::from_millis(500));
        assert!(RetryPolicy::from_secs(2, -1.0).is_err());
        assert!(RetryPolicy::from_secs(2, f64::NAN).is_err());
    }

    #[test]
    fn test_token_len() {
        assert_eq!(token_len("  polish   this\ndraft "), 3);
        assert_eq!(token_len(""), 0);
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let invoker = RetryingInvoker::new(
            ScriptedClient::new(vec![Ok(ModelResponse::text("done"))]),
            no_delay(5),
        );
        let response = invoker.invoke("i", "h", 1).await.unwrap();
        assert_eq!(response.text, "done");
        assert_eq!(invoker.client().calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let invoker = RetryingInvoker::new(
            ScriptedClient::new(vec![transient(), transient(), Ok(ModelResponse::text("ok"))]),
            no_delay(5),
        );
        let response = invoker.invoke("i", "h", 1).await.unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(invoker.client().calls(), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let invoker = RetryingInvoker::new(
            ScriptedClient::new(vec![transient(), transient(), transient(), transient()]),
            no_delay(2),
        );
        let err = invoker.invoke("i", "h", 4).await.unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::RetriesExhausted { attempts: 3, .. }
        ));
        assert!(err.is_fatal_backend());
        // 1 initial + 2 retries, the fourth scripted error is never consumed
        assert_eq!(invoker.client().calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_immediately() {
        let invoker = RetryingInvoker::new(
            ScriptedClient::new(vec![
                Err(ConvergeError::Auth("invalid key".into())),
                Ok(ModelResponse::text("never reached")),
            ]),
            no_delay(5),
        );
        let err = invoker.invoke("i", "h", 1).await.unwrap_err();
        assert!(matches!(err, ConvergeError::Auth(_)));
        assert_eq!(invoker.client().calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_means_single_attempt() {
        let invoker = RetryingInvoker::new(ScriptedClient::new(vec![transient()]), no_delay(0));
        let err = invoker.invoke("i", "h", 1).await.unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::RetriesExhausted { attempts: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_between_attempts() {
        let invoker = RetryingInvoker::new(
            ScriptedClient::new(vec![transient(), transient(), Ok(ModelResponse::text("ok"))]),
            RetryPolicy::new(5, Duration::from_secs(2)),
        );

        let started = Instant::now();
        invoker.invoke("i", "h", 1).await.unwrap();
        let elapsed = started.elapsed();

        // Two waits of exactly two seconds: no exponential growth
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_secs(5));
    }
}
