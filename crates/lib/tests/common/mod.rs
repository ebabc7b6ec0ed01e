//! Test doubles for the credential store and protocol client.
#![allow(dead_code)]

use async_trait::async_trait;
use courier::address::Address;
use courier::client::{ClientError, PairingEvent, PairingEvents, ProtocolClient};
use courier::device::DeviceIdentity;
use courier::pairing::{PairingPresenter, PairingSurface};
use courier::session::SessionManager;
use courier::store::{CredentialStore, StoreError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub fn identity() -> DeviceIdentity {
    DeviceIdentity {
        device_id: "dev-1".into(),
        public_key: "pk".into(),
        private_key: "sk".into(),
        device_token: "tok".into(),
        account: "1234567890@s.whatsapp.net".into(),
        paired_at: 1,
    }
}

#[derive(Default)]
pub struct MemoryStore(pub Mutex<Option<DeviceIdentity>>);

impl MemoryStore {
    pub fn with(identity: Option<DeviceIdentity>) -> Self {
        Self(Mutex::new(identity))
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
        Ok(self.0.lock().unwrap().clone())
    }

    async fn put_identity(&self, identity: &DeviceIdentity) -> Result<(), StoreError> {
        *self.0.lock().unwrap() = Some(identity.clone());
        Ok(())
    }
}

/// Records sends; fails them when `fail_with` is set.
#[derive(Default)]
pub struct MockClient {
    pub fail_with: Option<String>,
    pub sends: Mutex<Vec<(String, String)>>,
    pub send_calls: AtomicUsize,
    pairing_tx: Mutex<Option<mpsc::UnboundedSender<PairingEvent>>>,
}

impl MockClient {
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn send_count(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn connect(&self) -> Result<(), ClientError> {
        if let Some(tx) = self.pairing_tx.lock().unwrap().take() {
            let _ = tx.send(PairingEvent::CodeIssued("2@mock".into()));
        }
        Ok(())
    }

    async fn disconnect(&self) {}

    fn pairing_events(&self) -> Result<PairingEvents, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.pairing_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn send_message(&self, to: &Address, text: &str) -> Result<(), ClientError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_with {
            return Err(ClientError::Send(reason.clone()));
        }
        self.sends.lock().unwrap().push((to.to_string(), text.to_string()));
        Ok(())
    }

    fn current_identity(&self) -> Option<DeviceIdentity> {
        Some(identity())
    }
}

pub struct NullSurface;

impl PairingSurface for NullSurface {
    fn show_code(&self, _code: &str) {}
}

pub fn session(client: Arc<MockClient>) -> Arc<SessionManager> {
    let store = Arc::new(MemoryStore::with(Some(identity())));
    Arc::new(SessionManager::new(
        client,
        store,
        PairingPresenter::new(Arc::new(NullSurface)),
    ))
}

/// Serve the gateway for `session` on an ephemeral port; returns the base URL.
pub async fn spawn_gateway(session: Arc<SessionManager>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = courier::gateway::serve(listener, session, std::future::pending()).await;
    });
    format!("http://{}", addr)
}
