#![allow(dead_code)]

use async_trait::async_trait;
use gramlink::{
    AccountInfo, ClientError, ClientFactory, ClientHandle, ClientOptions, SessionCredential,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Install a test subscriber so `RUST_LOG=debug cargo test` shows component
/// logging. Safe to call from every test; only the first call wins.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn credential() -> SessionCredential {
    credential_for_session("1BQANOTEuMTA4LjU2LjEzMQ")
}

pub fn credential_for_session(session: &str) -> SessionCredential {
    SessionCredential::new(94017, "0123456789abcdef", session)
}

/// Per-client failure script applied to every client the factory constructs.
#[derive(Clone, Default)]
pub struct ClientScript {
    /// Fail this many `connect` calls before succeeding.
    pub fail_connects: u32,
    /// Fail this many `probe` calls before succeeding.
    pub fail_probes: u32,
    /// Raw error string returned by failing probes.
    pub probe_error: Option<String>,
    /// When set, `connect` blocks until a permit is released.
    pub connect_gate: Option<Arc<Semaphore>>,
}

#[derive(Debug)]
struct ClientState {
    connected: AtomicBool,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    destroy_calls: AtomicU32,
    probe_calls: AtomicU32,
    fail_connects: AtomicU32,
    fail_probes: AtomicU32,
    probe_error: Mutex<String>,
    connect_gate: Mutex<Option<Arc<Semaphore>>>,
}

/// Scripted in-memory stand-in for a protocol client.
#[derive(Clone, Debug)]
pub struct FakeClient {
    state: Arc<ClientState>,
}

impl FakeClient {
    fn from_script(script: &ClientScript) -> Self {
        Self {
            state: Arc::new(ClientState {
                connected: AtomicBool::new(false),
                connect_calls: AtomicU32::new(0),
                disconnect_calls: AtomicU32::new(0),
                destroy_calls: AtomicU32::new(0),
                probe_calls: AtomicU32::new(0),
                fail_connects: AtomicU32::new(script.fail_connects),
                fail_probes: AtomicU32::new(script.fail_probes),
                probe_error: Mutex::new(
                    script
                        .probe_error
                        .clone()
                        .unwrap_or_else(|| "AUTH_KEY_UNREGISTERED".to_string()),
                ),
                connect_gate: Mutex::new(script.connect_gate.clone()),
            }),
        }
    }

    /// Simulate the remote side dropping the socket.
    pub fn drop_socket(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.state.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> u32 {
        self.state.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> u32 {
        self.state.probe_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ClientHandle for FakeClient {
    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), ClientError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.state.connect_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| ClientError::Transport("connect gate closed".to_string()))?;
            permit.forget();
        }
        if Self::take_failure(&self.state.fail_connects) {
            return Err(ClientError::Transport("connection refused".to_string()));
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.state.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.state.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<AccountInfo, ClientError> {
        self.state.probe_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.state.fail_probes) {
            let raw = self.state.probe_error.lock().unwrap().clone();
            return Err(ClientError::Rpc(raw));
        }
        Ok(AccountInfo {
            id: 7777,
            username: Some("fake_account".to_string()),
            first_name: Some("Fake".to_string()),
        })
    }
}

#[derive(Default)]
struct FactoryState {
    constructed: AtomicU32,
    fail_constructs: AtomicU32,
    script: Mutex<ClientScript>,
    clients: Mutex<Vec<FakeClient>>,
}

/// Factory producing [`FakeClient`]s from the current script. Clone-able so
/// a test can keep inspecting counters after handing the factory to the
/// registry.
#[derive(Clone, Default)]
pub struct FakeFactory {
    state: Arc<FactoryState>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script applied to every client constructed from now on.
    pub fn set_script(&self, script: ClientScript) {
        *self.state.script.lock().unwrap() = script;
    }

    /// Gate all future connects behind a zero-permit semaphore; release with
    /// `add_permits`.
    pub fn gate_connects(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state.script.lock().unwrap().connect_gate = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_next_constructs(&self, n: u32) {
        self.state.fail_constructs.store(n, Ordering::SeqCst);
    }

    pub fn constructed(&self) -> u32 {
        self.state.constructed.load(Ordering::SeqCst)
    }

    /// The `index`-th client ever constructed.
    pub fn client(&self, index: usize) -> FakeClient {
        self.state.clients.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    type Handle = FakeClient;

    async fn construct(
        &self,
        _credential: &SessionCredential,
        _options: &ClientOptions,
    ) -> Result<FakeClient, ClientError> {
        self.state.constructed.fetch_add(1, Ordering::SeqCst);
        if FakeClient::take_failure(&self.state.fail_constructs) {
            return Err(ClientError::Transport("factory offline".to_string()));
        }
        let script = self.state.script.lock().unwrap().clone();
        let client = FakeClient::from_script(&script);
        self.state.clients.lock().unwrap().push(client.clone());
        Ok(client)
    }
}
