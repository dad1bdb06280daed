use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionCredential;

/// Errors surfaced by the protocol client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Error string returned by the remote API, verbatim. Classification
    /// works on this text (see [`crate::retry::classify`]).
    #[error("{0}")]
    Rpc(String),

    /// Socket-level failure before any API response.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Transport used for the underlying MTProto connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain TCP. More stable for long-lived server-side sessions.
    #[default]
    Tcp,
    /// WebSocket transport.
    WebSocket,
}

/// Options forwarded to the client factory when constructing a handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// How many times the client itself retries the initial socket connect.
    pub connection_retries: u32,
    pub transport: TransportKind,
    /// Let the client re-establish dropped sockets on its own.
    pub auto_reconnect: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connection_retries: 5,
            transport: TransportKind::Tcp,
            auto_reconnect: true,
        }
    }
}

/// Minimal account identity returned by the authenticated probe call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

/// Capability surface the registry needs from a live protocol client.
///
/// The real implementation wraps an MTProto client; tests substitute a fake.
/// `is_connected` is a cheap synchronous liveness check (socket state), while
/// `probe` is the lightweight authenticated call (fetch own account) that
/// distinguishes a connected-but-unauthorized client from a usable one.
#[async_trait]
pub trait ClientHandle: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), ClientError>;

    async fn disconnect(&self) -> Result<(), ClientError>;

    /// Release all client resources. The handle must not be used afterwards.
    async fn destroy(&self) -> Result<(), ClientError>;

    async fn probe(&self) -> Result<AccountInfo, ClientError>;
}

/// Builds protocol clients for the registry.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    type Handle: ClientHandle;

    async fn construct(
        &self,
        credential: &SessionCredential,
        options: &ClientOptions,
    ) -> Result<Self::Handle, ClientError>;
}
