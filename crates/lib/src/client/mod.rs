//! Protocol client: the connection to the messaging network.
//!
//! [`ProtocolClient`] is the seam the session manager drives. [`BridgeClient`] is the
//! production implementation, speaking JSON frames to a multidevice bridge over WebSocket.

mod bridge;
mod frames;

pub use bridge::BridgeClient;
pub use frames::{BridgeEvent, BridgeRequest, BridgeResponse, ConnectParams, HelloOk, SendParams};

use crate::address::Address;
use crate::device::DeviceIdentity;
use crate::store::StoreError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Event emitted while pairing. The stream closes when pairing completes or fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A pairing code the operator must scan or enter.
    CodeIssued(String),
    /// Anything else the network reports during pairing (timeouts, success notices, ...).
    Other(String),
}

/// Receiving half of the pairing-event stream.
pub type PairingEvents = mpsc::UnboundedReceiver<PairingEvent>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("pairing stream already open")]
    PairingAlreadyOpen,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("bridge rejected connect: {0}")]
    Rejected(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection closed")]
    Closed,
    #[error("device key: {0}")]
    Key(#[from] crate::device::KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Operations the session layer needs from the messaging network.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open the connection. With no stored identity this drives the pairing handshake and
    /// only returns once pairing succeeded or failed, and closes the pairing stream first.
    async fn connect(&self) -> Result<(), ClientError>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self);

    /// Open the pairing-event stream. Must be called before [`connect`](Self::connect);
    /// at most one stream per client.
    fn pairing_events(&self) -> Result<PairingEvents, ClientError>;

    /// Send a text message over the live connection.
    async fn send_message(&self, to: &Address, text: &str) -> Result<(), ClientError>;

    /// Identity the client is currently authenticated as, if any.
    fn current_identity(&self) -> Option<DeviceIdentity>;
}
