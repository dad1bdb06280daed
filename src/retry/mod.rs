pub mod classify;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, warn};

use self::classify::{classify, ErrorCode, RetryClass};

/// A remote rejection that must not be retried, carrying the stable code and
/// the caller-facing message produced by classification.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

/// Terminal error once the bounded retry budget is spent. Deliberately
/// distinct from the underlying failure so callers can tell "gave up" from
/// "failed once".
#[derive(Debug, Clone, Error)]
#[error("giving up after {attempts} retry attempts ({code}): {last_message}")]
pub struct RetriesExhausted {
    pub attempts: u32,
    pub code: ErrorCode,
    pub last_message: String,
}

/// Retry/backoff tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry budget for transient and unclassified failures.
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Wait applied to abuse-protection signals that name no duration,
    /// in seconds.
    pub flood_fallback_wait_secs: u64,
    /// Optional cap on server-directed waits. `None` keeps retrying for as
    /// long as the remote keeps directing waits.
    pub max_server_directed_waits: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            flood_fallback_wait_secs: 60,
            max_server_directed_waits: None,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn flood_fallback_wait(&self) -> Duration {
        Duration::from_secs(self.flood_fallback_wait_secs)
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 2u64.saturating_pow(failures.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Wraps one logical remote call with classification-driven retries.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `op`, retrying according to the classification of each failure.
    ///
    /// Server-directed waits (FLOOD_WAIT) sleep exactly the directed
    /// duration and do not consume the bounded budget; abuse-protection
    /// signals (PEER_FLOOD) sleep the fixed fallback wait; transient and
    /// unclassified failures use exponential backoff up to `max_attempts`;
    /// fatal codes surface immediately as [`ApiError`] after a single
    /// invocation.
    pub async fn safe_execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures: u32 = 0;
        let mut server_waits: u32 = 0;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let classification = classify(&err.to_string());
            match classification.retry_class() {
                RetryClass::ServerDirected => {
                    server_waits += 1;
                    if let Some(cap) = self.config.max_server_directed_waits {
                        if server_waits > cap {
                            error!(
                                code = %classification.code,
                                waits = server_waits - 1,
                                "server keeps directing waits; giving up"
                            );
                            return Err(RetriesExhausted {
                                attempts: cap,
                                code: classification.code,
                                last_message: classification.raw_message,
                            }
                            .into());
                        }
                    }
                    let wait = classification
                        .retry_after
                        .unwrap_or_else(|| self.config.flood_fallback_wait());
                    warn!(
                        wait_secs = wait.as_secs(),
                        waits = server_waits,
                        "flood wait directed by server; sleeping before retry"
                    );
                    sleep(wait).await;
                }
                RetryClass::FixedWait => {
                    server_waits += 1;
                    if let Some(cap) = self.config.max_server_directed_waits {
                        if server_waits > cap {
                            error!(
                                code = %classification.code,
                                waits = server_waits - 1,
                                "abuse protection persists; giving up"
                            );
                            return Err(RetriesExhausted {
                                attempts: cap,
                                code: classification.code,
                                last_message: classification.raw_message,
                            }
                            .into());
                        }
                    }
                    let wait = self.config.flood_fallback_wait();
                    warn!(
                        code = %classification.code,
                        wait_secs = wait.as_secs(),
                        "abuse protection detected; sleeping before retry"
                    );
                    sleep(wait).await;
                }
                RetryClass::Transient | RetryClass::Generic => {
                    failures += 1;
                    if failures > self.config.max_attempts {
                        error!(
                            code = %classification.code,
                            attempts = self.config.max_attempts,
                            "retry budget exhausted"
                        );
                        return Err(RetriesExhausted {
                            attempts: self.config.max_attempts,
                            code: classification.code,
                            last_message: classification.raw_message,
                        }
                        .into());
                    }
                    let delay = self.config.backoff_delay(failures);
                    warn!(
                        code = %classification.code,
                        attempt = failures,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure; backing off before retry"
                    );
                    sleep(delay).await;
                }
                RetryClass::Fatal => {
                    error!(code = %classification.code, raw = %classification.raw_message, "fatal remote error");
                    return Err(ApiError {
                        code: classification.code,
                        message: classification.message,
                    }
                    .into());
                }
            }
        }
    }
}
