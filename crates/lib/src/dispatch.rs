//! Dispatch facade: turns one HTTP send request into one protocol send.

use crate::address::{Address, AddressError};
use crate::session::{SessionManager, TransportError};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Body of `POST /send`.
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    /// Recipient address, e.g. "1234567890@s.whatsapp.net".
    pub to: String,
    pub text: String,
}

/// Why a request did not produce a send. Validation maps to 400, transport to 500.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Transport(String),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AddressError> for DispatchError {
    fn from(e: AddressError) -> Self {
        Self::Validation(format!("invalid recipient address: {}", e))
    }
}

impl From<TransportError> for DispatchError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    ValidationError(String),
    TransportError(String),
}

impl SendOutcome {
    /// HTTP status and JSON body for this outcome.
    pub fn into_response_parts(self) -> (StatusCode, Value) {
        match self {
            Self::Sent => (StatusCode::OK, json!({ "status": "sent" })),
            Self::ValidationError(e) => error_parts(DispatchError::Validation(e)),
            Self::TransportError(e) => error_parts(DispatchError::Transport(e)),
        }
    }
}

fn error_parts(e: DispatchError) -> (StatusCode, Value) {
    (e.status(), json!({ "error": e.to_string() }))
}

impl From<Result<(), DispatchError>> for SendOutcome {
    fn from(r: Result<(), DispatchError>) -> Self {
        match r {
            Ok(()) => Self::Sent,
            Err(DispatchError::Validation(e)) => Self::ValidationError(e),
            Err(DispatchError::Transport(e)) => Self::TransportError(e),
        }
    }
}

/// Stateless handler holding the shared session.
#[derive(Clone)]
pub struct Dispatcher {
    session: Arc<SessionManager>,
}

impl Dispatcher {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Parse, validate, and send a raw request body.
    pub async fn handle(&self, body: &[u8]) -> (StatusCode, Value) {
        self.outcome(body).await.into_response_parts()
    }

    pub async fn outcome(&self, body: &[u8]) -> SendOutcome {
        SendOutcome::from(self.dispatch(body).await)
    }

    async fn dispatch(&self, body: &[u8]) -> Result<(), DispatchError> {
        let req: SendRequest = serde_json::from_slice(body)
            .map_err(|e| DispatchError::Validation(format!("invalid request body: {}", e)))?;
        let to = Address::parse(&req.to)?;
        self.session.send(&to, &req.text).await?;
        log::debug!("sent message to {}", to);
        Ok(())
    }
}
