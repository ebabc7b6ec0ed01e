//! Session manager: owns the single device session for this process.
//!
//! `establish` decides between first-time pairing and reconnecting with the stored
//! identity, then connects. Every failure there is fatal: without a session there is
//! nothing to serve. `send` is the only operation available afterwards and refuses to
//! touch the client unless the session is connected.

use crate::address::Address;
use crate::client::{ClientError, ProtocolClient};
use crate::device::DeviceIdentity;
use crate::pairing::PairingPresenter;
use crate::store::{CredentialStore, StoreError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Pairing,
    Connected,
    Disconnected,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Pairing,
            2 => Self::Connected,
            3 => Self::Disconnected,
            _ => Self::Unauthenticated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unauthenticated => 0,
            Self::Pairing => 1,
            Self::Connected => 2,
            Self::Disconnected => 3,
        }
    }
}

/// Startup failures. The process cannot serve without a session and exits.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("credential store: {0}")]
    Store(#[from] StoreError),
    #[error("opening pairing stream: {0}")]
    Pairing(ClientError),
    #[error("connecting: {0}")]
    Connect(ClientError),
    #[error("session already established")]
    AlreadyEstablished,
}

/// Send failures surfaced to HTTP callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("send timed out")]
    TimedOut,
    #[error("{0}")]
    Failed(String),
}

/// Owns the protocol client and the session state machine.
pub struct SessionManager {
    client: Arc<dyn ProtocolClient>,
    store: Arc<dyn CredentialStore>,
    presenter: PairingPresenter,
    state: AtomicU8,
    send_timeout: Option<Duration>,
}

impl SessionManager {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        store: Arc<dyn CredentialStore>,
        presenter: PairingPresenter,
    ) -> Self {
        Self {
            client,
            store,
            presenter,
            state: AtomicU8::new(SessionState::Unauthenticated.as_u8()),
            send_timeout: None,
        }
    }

    /// Bound each send; elapsed sends fail with [`TransportError::TimedOut`].
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Identity the live session is bound to.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.client.current_identity()
    }

    /// Pair or reconnect, then connect. Blocks until connected; errors are fatal and leave
    /// the session Disconnected.
    pub async fn establish(&self) -> Result<(), SessionError> {
        if self.state() != SessionState::Unauthenticated {
            return Err(SessionError::AlreadyEstablished);
        }
        if let Err(e) = self.pair_or_reconnect().await {
            self.set_state(SessionState::Disconnected);
            return Err(e);
        }
        self.set_state(SessionState::Connected);
        log::info!("connected");
        Ok(())
    }

    async fn pair_or_reconnect(&self) -> Result<(), SessionError> {
        match self.store.get_identity().await? {
            Some(identity) => {
                log::info!(
                    "connecting with saved session (device {}, {})",
                    identity.device_id,
                    identity.account
                );
                self.client.connect().await.map_err(SessionError::Connect)
            }
            None => {
                self.set_state(SessionState::Pairing);
                let events = self.client.pairing_events().map_err(SessionError::Pairing)?;
                let presenting = self.presenter.clone().spawn(events);
                log::info!("no stored device identity; pairing");
                self.client.connect().await.map_err(SessionError::Connect)?;
                // connect closes the stream on return; let the presenter drain what was queued
                let _ = presenting.await;
                Ok(())
            }
        }
    }

    /// Send `text` to `to` over the live session. Never called on the client unless connected.
    pub async fn send(&self, to: &Address, text: &str) -> Result<(), TransportError> {
        if self.state() != SessionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let sent = match self.send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.client.send_message(to, text))
                .await
                .map_err(|_| TransportError::TimedOut)?,
            None => self.client.send_message(to, text).await,
        };
        sent.map_err(|e| match e {
            ClientError::NotConnected | ClientError::Closed => {
                log::warn!("send to {} failed, session lost: {}", to, e);
                self.set_state(SessionState::Disconnected);
                TransportError::NotConnected
            }
            other => {
                log::debug!("send to {} failed: {}", to, other);
                TransportError::Failed(other.to_string())
            }
        })
    }

    /// Close the session. The state becomes Disconnected and stays there.
    pub async fn disconnect(&self) {
        self.set_state(SessionState::Disconnected);
        self.client.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{PairingEvent, PairingEvents};
    use crate::pairing::PairingSurface;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, oneshot};

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "dev-1".into(),
            public_key: "pk".into(),
            private_key: "sk".into(),
            device_token: "tok".into(),
            account: "1234567890@s.whatsapp.net".into(),
            paired_at: 1,
        }
    }

    struct MemoryStore(Mutex<Option<DeviceIdentity>>);

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

    struct BrokenStore;

    #[async_trait]
    impl CredentialStore for BrokenStore {
        async fn get_identity(&self) -> Result<Option<DeviceIdentity>, StoreError> {
            Err(StoreError::Read {
                path: "device.json".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            })
        }
        async fn put_identity(&self, _identity: &DeviceIdentity) -> Result<(), StoreError> {
            unreachable!("nothing is stored when the store cannot be read")
        }
    }

    /// Emits `codes` during connect when a pairing stream is open, then closes it.
    /// With `gate` set, connect waits for it before finishing.
    #[derive(Default)]
    struct ScriptedClient {
        codes: Vec<String>,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
        connects: AtomicUsize,
        fail_connect: bool,
        send_result: Option<ClientError>,
        send_delay: Option<Duration>,
        streams_opened: AtomicUsize,
        sends: AtomicUsize,
        pairing_tx: Mutex<Option<mpsc::UnboundedSender<PairingEvent>>>,
    }

    #[async_trait]
    impl ProtocolClient for ScriptedClient {
        async fn connect(&self) -> Result<(), ClientError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let tx = self.pairing_tx.lock().unwrap().take();
            if let Some(tx) = tx {
                for code in &self.codes {
                    let _ = tx.send(PairingEvent::CodeIssued(code.clone()));
                }
                let _ = tx.send(PairingEvent::Other("success".into()));
            }
            if self.fail_connect {
                return Err(ClientError::Connect("refused".into()));
            }
            Ok(())
        }

        async fn disconnect(&self) {}

        fn pairing_events(&self) -> Result<PairingEvents, ClientError> {
            self.streams_opened.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            *self.pairing_tx.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn send_message(&self, _to: &Address, _text: &str) -> Result<(), ClientError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.send_delay {
                tokio::time::sleep(delay).await;
            }
            match &self.send_result {
                None => Ok(()),
                Some(ClientError::Closed) => Err(ClientError::Closed),
                Some(e) => Err(ClientError::Send(e.to_string())),
            }
        }

        fn current_identity(&self) -> Option<DeviceIdentity> {
            None
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl PairingSurface for Recording {
        fn show_code(&self, code: &str) {
            self.0.lock().unwrap().push(code.to_string());
        }
    }

    fn manager(
        client: Arc<ScriptedClient>,
        stored: Option<DeviceIdentity>,
    ) -> (SessionManager, Arc<Recording>) {
        let surface = Arc::new(Recording::default());
        let store = Arc::new(MemoryStore(Mutex::new(stored)));
        let mgr = SessionManager::new(client, store, PairingPresenter::new(surface.clone()));
        (mgr, surface)
    }

    #[tokio::test]
    async fn stored_identity_skips_pairing() {
        let client = Arc::new(ScriptedClient {
            codes: vec!["2@never".into()],
            ..Default::default()
        });
        let (mgr, surface) = manager(client.clone(), Some(identity()));

        mgr.establish().await.unwrap();

        assert_eq!(mgr.state(), SessionState::Connected);
        assert_eq!(client.streams_opened.load(Ordering::SeqCst), 0);
        assert!(surface.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_identity_pairs_through_one_stream() {
        let client = Arc::new(ScriptedClient {
            codes: vec!["2@code-a".into(), "2@code-b".into()],
            ..Default::default()
        });
        let (mgr, surface) = manager(client.clone(), None);

        mgr.establish().await.unwrap();

        assert_eq!(mgr.state(), SessionState::Connected);
        assert_eq!(client.streams_opened.load(Ordering::SeqCst), 1);
        assert_eq!(*surface.0.lock().unwrap(), vec!["2@code-a", "2@code-b"]);
    }

    #[tokio::test]
    async fn connect_failure_is_fatal() {
        let client = Arc::new(ScriptedClient {
            fail_connect: true,
            ..Default::default()
        });
        let (mgr, _) = manager(client, None);

        let err = mgr.establish().await.unwrap_err();
        assert!(matches!(err, SessionError::Connect(_)));
        assert_eq!(mgr.state(), SessionState::Disconnected);
        assert_eq!(
            mgr.send(&Address::user("1"), "hi").await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn unreadable_store_is_fatal_before_touching_client() {
        let client = Arc::new(ScriptedClient::default());
        let surface = Arc::new(Recording::default());
        let mgr = SessionManager::new(
            client.clone(),
            Arc::new(BrokenStore),
            PairingPresenter::new(surface),
        );

        let err = mgr.establish().await.unwrap_err();
        assert!(matches!(err, SessionError::Store(StoreError::Read { .. })));
        assert_eq!(mgr.state(), SessionState::Disconnected);
        assert_eq!(client.connects.load(Ordering::SeqCst), 0);
        assert_eq!(client.streams_opened.load(Ordering::SeqCst), 0);
        assert_eq!(
            mgr.send(&Address::user("1"), "hi").await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(client.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconnect_failure_is_fatal() {
        let client = Arc::new(ScriptedClient {
            fail_connect: true,
            ..Default::default()
        });
        let (mgr, _) = manager(client.clone(), Some(identity()));

        assert!(matches!(mgr.establish().await, Err(SessionError::Connect(_))));
        assert_eq!(mgr.state(), SessionState::Disconnected);
        assert_eq!(client.streams_opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sends_are_refused_while_pairing() {
        let (release, gate) = oneshot::channel();
        let client = Arc::new(ScriptedClient {
            codes: vec!["2@code".into()],
            gate: Mutex::new(Some(gate)),
            ..Default::default()
        });
        let (mgr, surface) = manager(client.clone(), None);
        let mgr = Arc::new(mgr);

        let establishing = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.establish().await }
        });
        while client.connects.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(mgr.state(), SessionState::Pairing);
        assert_eq!(
            mgr.send(&Address::user("1"), "hi").await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(client.sends.load(Ordering::SeqCst), 0);

        release.send(()).unwrap();
        establishing.await.unwrap().unwrap();
        assert_eq!(mgr.state(), SessionState::Connected);
        assert_eq!(*surface.0.lock().unwrap(), vec!["2@code"]);
        mgr.send(&Address::user("1"), "hi").await.unwrap();
        assert_eq!(client.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn establish_twice_is_rejected() {
        let client = Arc::new(ScriptedClient::default());
        let (mgr, _) = manager(client, Some(identity()));
        mgr.establish().await.unwrap();
        assert!(matches!(
            mgr.establish().await,
            Err(SessionError::AlreadyEstablished)
        ));
    }

    #[tokio::test]
    async fn send_before_establish_never_reaches_client() {
        let client = Arc::new(ScriptedClient::default());
        let (mgr, _) = manager(client.clone(), Some(identity()));

        let res = mgr.send(&Address::user("1234567890"), "hi").await;

        assert_eq!(res, Err(TransportError::NotConnected));
        assert_eq!(client.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_failure_maps_to_transport_error() {
        let client = Arc::new(ScriptedClient {
            send_result: Some(ClientError::Send("recipient unknown".into())),
            ..Default::default()
        });
        let (mgr, _) = manager(client, Some(identity()));
        mgr.establish().await.unwrap();

        let err = mgr.send(&Address::user("1"), "hi").await.unwrap_err();
        assert!(matches!(err, TransportError::Failed(ref m) if m.contains("recipient unknown")));
        assert_eq!(mgr.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn closed_connection_marks_session_disconnected() {
        let client = Arc::new(ScriptedClient {
            send_result: Some(ClientError::Closed),
            ..Default::default()
        });
        let (mgr, _) = manager(client, Some(identity()));
        mgr.establish().await.unwrap();

        assert_eq!(
            mgr.send(&Address::user("1"), "hi").await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(mgr.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn send_timeout_elapses() {
        let client = Arc::new(ScriptedClient {
            send_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let (mgr, _) = manager(client, Some(identity()));
        let mgr = mgr.with_send_timeout(Some(Duration::from_millis(20)));
        mgr.establish().await.unwrap();

        assert_eq!(
            mgr.send(&Address::user("1"), "hi").await,
            Err(TransportError::TimedOut)
        );
    }

    #[tokio::test]
    async fn disconnect_is_terminal() {
        let client = Arc::new(ScriptedClient::default());
        let (mgr, _) = manager(client, Some(identity()));
        mgr.establish().await.unwrap();
        mgr.disconnect().await;
        assert_eq!(mgr.state(), SessionState::Disconnected);
        assert!(mgr.establish().await.is_err());
    }
}
