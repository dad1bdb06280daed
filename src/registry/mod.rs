//! Keyed pool of live protocol clients.
//!
//! Guarantees single-flight connects: however many callers ask for the same
//! key at once, exactly one connect attempt runs and every caller shares its
//! outcome. Unhealthy connections get one heal attempt before being destroyed
//! and recreated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{ClientFactory, ClientHandle, ClientOptions};
use crate::session::{SessionCredential, SessionKey};

/// Registry failures. Clone-able so a single failed attempt can be fanned
/// out to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("failed to connect: {reason}")]
    ConnectFailed { reason: String },

    /// The in-flight attempt this caller was waiting on went away without
    /// settling (owner task died).
    #[error("connection attempt abandoned before settling")]
    AttemptAbandoned,
}

/// Pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Age after which in-flight attempt bookkeeping is considered stale and
    /// stops blocking new attempts for the key, in seconds.
    pub pending_attempt_ttl_secs: u64,
    /// How often the background sweeper scans for stale bookkeeping,
    /// in seconds.
    pub sweep_interval_secs: u64,
    /// Options forwarded to the client factory.
    pub client: ClientOptions,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            pending_attempt_ttl_secs: 120,
            sweep_interval_secs: 30,
            client: ClientOptions::default(),
        }
    }
}

impl RegistryConfig {
    pub fn pending_attempt_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_attempt_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub connections: usize,
    pub connected: usize,
    pub pending_attempts: usize,
}

type AttemptResult<H> = Result<Arc<H>, RegistryError>;

struct ConnectionEntry<H> {
    handle: Arc<H>,
    created_at: Instant,
    last_health_check: Instant,
    connected: bool,
}

struct PendingAttempt<H> {
    attempt_id: Uuid,
    started_at: Instant,
    rx: watch::Receiver<Option<AttemptResult<H>>>,
}

struct RegistryState<H> {
    connections: HashMap<SessionKey, ConnectionEntry<H>>,
    pending: HashMap<SessionKey, PendingAttempt<H>>,
}

/// Connection pool with single-flight connects and heal-or-recreate logic.
pub struct ConnectionRegistry<F: ClientFactory> {
    factory: F,
    options: ClientOptions,
    pending_ttl: Duration,
    state: Arc<Mutex<RegistryState<F::Handle>>>,
    sweeper: JoinHandle<()>,
}

impl<F: ClientFactory> ConnectionRegistry<F> {
    /// Create the registry and spawn its staleness sweeper. Must be called
    /// within a tokio runtime.
    pub fn new(factory: F, config: RegistryConfig) -> Self {
        let state = Arc::new(Mutex::new(RegistryState {
            connections: HashMap::new(),
            pending: HashMap::new(),
        }));
        let sweeper = spawn_sweeper(
            Arc::clone(&state),
            config.pending_attempt_ttl(),
            config.sweep_interval(),
        );
        Self {
            factory,
            options: config.client.clone(),
            pending_ttl: config.pending_attempt_ttl(),
            state,
            sweeper,
        }
    }

    /// Return a live, authorized handle for the credential's session.
    ///
    /// Concurrent callers for the same key share one attempt. A cached
    /// handle that still reports its socket connected is returned without
    /// any remote traffic; a disconnected one gets a single heal attempt
    /// before the registry destroys it and builds a replacement. Creation
    /// failures surface as [`RegistryError::ConnectFailed`] without internal
    /// retries; retry policy belongs to the layer above.
    pub async fn get_connection(
        &self,
        credential: &SessionCredential,
    ) -> Result<Arc<F::Handle>, RegistryError> {
        let key = SessionKey::derive(credential);

        let (tx, attempt_id, healing) = {
            let mut state = self.state.lock().await;

            if let Some(pending) = state.pending.get(&key) {
                if pending.started_at.elapsed() < self.pending_ttl {
                    debug!(%key, attempt_id = %pending.attempt_id, "attempt in flight; waiting for its result");
                    let rx = pending.rx.clone();
                    drop(state);
                    return await_attempt(rx).await;
                }
                warn!(%key, attempt_id = %pending.attempt_id, "in-flight attempt is stale; starting fresh");
                state.pending.remove(&key);
            }

            if let Some(entry) = state.connections.get_mut(&key) {
                if entry.handle.is_connected() {
                    entry.last_health_check = Instant::now();
                    entry.connected = true;
                    return Ok(Arc::clone(&entry.handle));
                }
                debug!(
                    %key,
                    since_check_secs = entry.last_health_check.elapsed().as_secs(),
                    "cached connection reports disconnected"
                );
                entry.connected = false;
            }

            let (tx, rx) = watch::channel(None);
            let attempt_id = Uuid::new_v4();
            state.pending.insert(
                key.clone(),
                PendingAttempt {
                    attempt_id,
                    started_at: Instant::now(),
                    rx,
                },
            );
            let healing = state.connections.get(&key).map(|e| Arc::clone(&e.handle));
            (tx, attempt_id, healing)
        };

        let result = self.drive_attempt(&key, credential, healing).await;
        self.publish(&key, attempt_id, &result).await;
        let _ = tx.send(Some(result.clone()));
        result
    }

    /// Heal the existing handle if there is one, otherwise build, connect
    /// and probe a fresh client. Runs outside the state lock; the pending
    /// entry keeps other callers parked meanwhile.
    async fn drive_attempt(
        &self,
        key: &SessionKey,
        credential: &SessionCredential,
        healing: Option<Arc<F::Handle>>,
    ) -> AttemptResult<F::Handle> {
        if let Some(handle) = healing {
            warn!(%key, "cached connection is down; attempting heal");
            match handle.connect().await {
                Ok(()) => {
                    info!(%key, "connection healed");
                    return Ok(handle);
                }
                Err(err) => {
                    error!(%key, error = %err, "heal failed; destroying and recreating");
                    graceful_destroy(handle.as_ref()).await;
                }
            }
        }

        info!(%key, "initializing new client");
        let handle = match self.factory.construct(credential, &self.options).await {
            Ok(handle) => Arc::new(handle),
            Err(err) => {
                error!(%key, error = %err, "client construction failed");
                return Err(RegistryError::ConnectFailed {
                    reason: err.to_string(),
                });
            }
        };

        if let Err(err) = handle.connect().await {
            error!(%key, error = %err, "connect failed");
            graceful_destroy(handle.as_ref()).await;
            return Err(RegistryError::ConnectFailed {
                reason: err.to_string(),
            });
        }

        // An open socket is not enough: verify the session is authorized by
        // fetching our own account. Connected-but-unauthorized is a failure.
        match handle.probe().await {
            Ok(account) => {
                info!(%key, account_id = account.id, "connection established");
                Ok(handle)
            }
            Err(err) => {
                error!(%key, error = %err, "authorization probe failed");
                graceful_destroy(handle.as_ref()).await;
                Err(RegistryError::ConnectFailed {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Record the settled attempt and clear its bookkeeping. If the sweeper
    /// already evicted this attempt, waiters still get the result but the
    /// registry no longer registers the handle; the key may belong to a
    /// newer attempt by now.
    async fn publish(
        &self,
        key: &SessionKey,
        attempt_id: Uuid,
        result: &AttemptResult<F::Handle>,
    ) {
        let mut state = self.state.lock().await;
        let owned = state
            .pending
            .get(key)
            .is_some_and(|p| p.attempt_id == attempt_id);
        if !owned {
            warn!(%key, %attempt_id, "attempt settled after staleness sweep; not registering");
            return;
        }
        state.pending.remove(key);

        match result {
            Ok(handle) => {
                let now = Instant::now();
                let created_at = state
                    .connections
                    .get(key)
                    .filter(|e| Arc::ptr_eq(&e.handle, handle))
                    .map(|e| e.created_at)
                    .unwrap_or(now);
                state.connections.insert(
                    key.clone(),
                    ConnectionEntry {
                        handle: Arc::clone(handle),
                        created_at,
                        last_health_check: now,
                        connected: true,
                    },
                );
            }
            Err(_) => {
                // Whatever entry existed for this key is dead.
                state.connections.remove(key);
            }
        }
    }

    /// Best-effort teardown of one session's connection.
    pub async fn disconnect(&self, credential: &SessionCredential) {
        let key = SessionKey::derive(credential);
        let removed = { self.state.lock().await.connections.remove(&key) };
        if let Some(entry) = removed {
            graceful_destroy(entry.handle.as_ref()).await;
            info!(%key, "connection disconnected");
        }
    }

    /// Tear down every registered connection concurrently and clear all
    /// registry state. Used at process shutdown.
    pub async fn cleanup_all(&self) {
        info!("cleaning up all connections");
        self.sweeper.abort();

        let handles: Vec<Arc<F::Handle>> = {
            let mut state = self.state.lock().await;
            state.pending.clear();
            state.connections.drain().map(|(_, e)| e.handle).collect()
        };

        let mut teardowns = Vec::with_capacity(handles.len());
        for handle in handles {
            teardowns.push(tokio::spawn(async move {
                graceful_destroy(handle.as_ref()).await;
            }));
        }
        for teardown in teardowns {
            let _ = teardown.await;
        }
        info!("cleanup complete");
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.lock().await;
        let connected = state
            .connections
            .values()
            .filter(|e| e.connected && e.handle.is_connected())
            .count();
        RegistryStats {
            connections: state.connections.len(),
            connected,
            pending_attempts: state.pending.len(),
        }
    }
}

impl<F: ClientFactory> Drop for ConnectionRegistry<F> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Wait for someone else's in-flight attempt to settle.
async fn await_attempt<H>(
    mut rx: watch::Receiver<Option<AttemptResult<H>>>,
) -> AttemptResult<H> {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            return Err(RegistryError::AttemptAbandoned);
        }
    }
}

/// Disconnect and destroy, swallowing teardown errors. Nothing actionable
/// can be done with them at this point.
async fn graceful_destroy<H: ClientHandle>(handle: &H) {
    if let Err(err) = handle.disconnect().await {
        debug!(error = %err, "ignoring disconnect error during teardown");
    }
    if let Err(err) = handle.destroy().await {
        debug!(error = %err, "ignoring destroy error during teardown");
    }
}

fn spawn_sweeper<H: ClientHandle>(
    state: Arc<Mutex<RegistryState<H>>>,
    ttl: Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut state = state.lock().await;
            state.pending.retain(|key, pending| {
                let stale = pending.started_at.elapsed() >= ttl;
                if stale {
                    warn!(
                        %key,
                        attempt_id = %pending.attempt_id,
                        age_secs = pending.started_at.elapsed().as_secs(),
                        "removing stale attempt bookkeeping"
                    );
                }
                !stale
            });
        }
    })
}
