//! Device identity: the credential record that links this process to one account.
//!
//! A fresh [`DeviceKey`] is generated for first-time pairing and signs the bridge's
//! connect challenge. Once the operator confirms the pairing code, the bridge issues a
//! device token and the account address; together with the key they form the
//! persisted [`DeviceIdentity`]. Later runs reconnect with the device token alone.

use base64::Engine;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};

/// Errors building or using device keys.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("random source unavailable: {0}")]
    Random(String),
    #[error("decode private key: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("invalid private key length")]
    Length,
}

/// Persisted device identity. Owned by the credential store; everything else holds clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub public_key: String,
    pub private_key: String,
    /// Token issued by the bridge at pairing; presented on every reconnect.
    pub device_token: String,
    /// Account address this device is linked to (e.g. "1234567890@s.whatsapp.net").
    pub account: String,
    /// Unix ms when pairing completed.
    #[serde(default)]
    pub paired_at: i64,
}

impl DeviceIdentity {
    /// Complete a pairing: bind the signing key to the issued token and account.
    pub fn paired(key: DeviceKey, device_token: String, account: String) -> Self {
        Self {
            device_id: key.device_id,
            public_key: key.public_key,
            private_key: key.private_key,
            device_token,
            account,
            paired_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Ed25519 keypair used to sign the connect challenge while pairing.
#[derive(Debug, Clone)]
pub struct DeviceKey {
    pub device_id: String,
    pub public_key: String,
    private_key: String,
}

impl DeviceKey {
    /// Generate a new keypair. device_id is the first 16 chars of base64(public_key).
    pub fn generate() -> Result<Self, KeyError> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes).map_err(|e| KeyError::Random(e.to_string()))?;
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&bytes);
        let verifying_key = signing_key.verifying_key();
        let public_key = base64::engine::general_purpose::STANDARD.encode(verifying_key.as_bytes());
        let private_key = base64::engine::general_purpose::STANDARD.encode(signing_key.as_bytes());
        let device_id = public_key.chars().take(16).collect::<String>();
        Ok(Self {
            device_id,
            public_key,
            private_key,
        })
    }

    /// Sign the payload string and return the signature as base64.
    pub fn sign(&self, payload: &str) -> Result<String, KeyError> {
        let key_bytes = base64::engine::general_purpose::STANDARD.decode(self.private_key.as_bytes())?;
        let key_arr: [u8; 32] = key_bytes.as_slice().try_into().map_err(|_| KeyError::Length)?;
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&key_arr);
        let sig = signing_key.sign(payload.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()))
    }
}

/// Build the canonical payload string the bridge verifies.
/// Order: deviceId, client_id, client_mode, role, scopes (comma-joined), signed_at, token, nonce.
#[allow(clippy::too_many_arguments)]
pub fn build_connect_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at: u64,
    token: &str,
    nonce: &str,
) -> String {
    let scopes_str = scopes.join(",");
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}",
        device_id, client_id, client_mode, role, scopes_str, signed_at, token, nonce
    )
}
