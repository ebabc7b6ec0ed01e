//! WebSocket client for the multidevice bridge.
//!
//! Handshake: the bridge opens with a `connect.challenge` event carrying a nonce. A device
//! with a stored identity answers `connect` with its device token. A new device generates a
//! key, signs the challenge, and waits: the bridge streams `pairing.code` events until the
//! operator links the device, then answers with hello-ok carrying the issued device token.
//! After the handshake one reader task routes responses to pending requests by id and one
//! writer task owns the sink.

use super::frames::{
    BridgeRequest, ConnectAuth, ConnectClient, ConnectDevice, ConnectParams, HelloOk, Inbound,
    SendParams,
};
use super::{ClientError, PairingEvent, PairingEvents, ProtocolClient};
use crate::address::Address;
use crate::device::{build_connect_payload, DeviceIdentity, DeviceKey};
use crate::store::CredentialStore;
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const PROTOCOL_VERSION: u32 = 1;
const CLIENT_ID: &str = "courier";
const CLIENT_MODE: &str = "device";
const ROLE: &str = "device";
const CONNECT_ID: &str = "connect";

type Waiters = HashMap<String, oneshot::Sender<Result<serde_json::Value, String>>>;
type Pending = Arc<std::sync::Mutex<Waiters>>;

fn lock_pending(pending: &Pending) -> std::sync::MutexGuard<'_, Waiters> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a request id from `pending` when the send that owns it finishes or is dropped.
struct PendingSlot {
    pending: Pending,
    id: String,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

/// A live bridge connection.
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Pending,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Protocol client speaking to a bridge at `url`.
pub struct BridgeClient {
    url: String,
    token: Option<String>,
    store: Arc<dyn CredentialStore>,
    pairing_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<PairingEvent>>>,
    pairing_opened: AtomicBool,
    conn: RwLock<Option<Connection>>,
    identity: std::sync::RwLock<Option<DeviceIdentity>>,
}

/// How this connect authenticates: stored identity, or a fresh key that still needs pairing.
enum Credentials {
    Stored(DeviceIdentity),
    Pairing(DeviceKey),
}

impl BridgeClient {
    pub fn new(url: impl Into<String>, token: Option<String>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            url: url.into(),
            token,
            store,
            pairing_tx: std::sync::Mutex::new(None),
            pairing_opened: AtomicBool::new(false),
            conn: RwLock::new(None),
            identity: std::sync::RwLock::new(None),
        }
    }

    /// Requests sent to the bridge that are still waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        match self.conn.read().await.as_ref() {
            Some(conn) => lock_pending(&conn.pending).len(),
            None => 0,
        }
    }

    fn emit(&self, event: PairingEvent) {
        let guard = self.pairing_tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    log::debug!("bridge: pairing event dropped, presenter gone");
                }
            }
            None => log::debug!("bridge: pairing event with no open stream: {:?}", event),
        }
    }

    /// Drop the pairing sender; consumers see the stream end.
    fn close_pairing(&self) {
        self.pairing_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    fn connect_params(&self, creds: &Credentials, nonce: &str) -> Result<ConnectParams, ClientError> {
        let scopes = vec!["messages.send".to_string()];
        let client = ConnectClient {
            id: Some(CLIENT_ID.to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            mode: Some(CLIENT_MODE.to_string()),
        };
        let params = match creds {
            Credentials::Stored(identity) => ConnectParams {
                client,
                role: ROLE.to_string(),
                scopes,
                auth: ConnectAuth {
                    token: self.token.clone(),
                    device_token: Some(identity.device_token.clone()),
                },
                device: None,
            },
            Credentials::Pairing(key) => {
                let signed_at = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                let payload = build_connect_payload(
                    &key.device_id,
                    CLIENT_ID,
                    CLIENT_MODE,
                    ROLE,
                    &scopes,
                    signed_at,
                    self.token.as_deref().unwrap_or(""),
                    nonce,
                );
                let signature = key.sign(&payload)?;
                ConnectParams {
                    client,
                    role: ROLE.to_string(),
                    scopes,
                    auth: ConnectAuth {
                        token: self.token.clone(),
                        device_token: None,
                    },
                    device: Some(ConnectDevice {
                        id: key.device_id.clone(),
                        public_key: key.public_key.clone(),
                        signature,
                        signed_at,
                        nonce: nonce.to_string(),
                    }),
                }
            }
        };
        Ok(params)
    }

    /// Run the handshake on a fresh socket and spawn the reader/writer tasks.
    async fn handshake(&self) -> Result<(Connection, DeviceIdentity), ClientError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Connect(format!("{}: {}", self.url, e)))?;
        let (mut sink, mut stream) = ws.split();

        let nonce = loop {
            let text = next_text(&mut stream)
                .await
                .ok_or_else(|| ClientError::Connect("bridge closed before challenge".to_string()))??;
            match serde_json::from_str::<Inbound>(&text) {
                Ok(Inbound::Event { event, payload }) if event == "connect.challenge" => {
                    let nonce = payload
                        .get("nonce")
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| ClientError::Connect("challenge without nonce".to_string()))?;
                    break nonce.to_string();
                }
                _ => log::debug!("bridge: ignoring frame before challenge"),
            }
        };

        let creds = match self.store.get_identity().await? {
            Some(identity) => Credentials::Stored(identity),
            None => Credentials::Pairing(DeviceKey::generate()?),
        };
        let params = self.connect_params(&creds, &nonce)?;
        let params = serde_json::to_value(&params).map_err(|e| ClientError::Connect(e.to_string()))?;
        let req = BridgeRequest::new(CONNECT_ID, "connect", params);
        let req = serde_json::to_string(&req).map_err(|e| ClientError::Connect(e.to_string()))?;
        sink.send(Message::Text(req))
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let hello = loop {
            let text = next_text(&mut stream).await.ok_or_else(|| {
                ClientError::Connect("bridge closed connection during connect".to_string())
            })??;
            match serde_json::from_str::<Inbound>(&text) {
                Ok(Inbound::Event { event, payload }) => {
                    if event == "pairing.code" {
                        match payload.get("code").and_then(|c| c.as_str()) {
                            Some(code) => self.emit(PairingEvent::CodeIssued(code.to_string())),
                            None => self.emit(PairingEvent::Other(event)),
                        }
                    } else {
                        self.emit(PairingEvent::Other(event));
                    }
                }
                Ok(Inbound::Res { id, ok, payload, error }) if id == CONNECT_ID => {
                    if !ok {
                        return Err(ClientError::Rejected(
                            error.unwrap_or_else(|| "connect failed".to_string()),
                        ));
                    }
                    let hello: HelloOk = payload
                        .map(serde_json::from_value::<HelloOk>)
                        .transpose()
                        .map_err(|e| ClientError::Connect(format!("invalid hello-ok: {}", e)))?
                        .ok_or_else(|| ClientError::Connect("hello-ok without payload".to_string()))?;
                    break hello;
                }
                Ok(Inbound::Res { id, .. }) => {
                    log::debug!("bridge: ignoring response {} during connect", id)
                }
                Err(e) => log::debug!("bridge: unparseable frame during connect: {}", e),
            }
        };
        if hello.protocol != PROTOCOL_VERSION {
            log::warn!(
                "bridge speaks protocol {} (client {}); continuing",
                hello.protocol,
                PROTOCOL_VERSION
            );
        }

        let identity = match creds {
            Credentials::Stored(identity) => identity,
            Credentials::Pairing(key) => {
                let auth = hello.auth.ok_or_else(|| {
                    ClientError::Connect("pairing finished without a device token".to_string())
                })?;
                let identity =
                    DeviceIdentity::paired(key, auth.device_token, auth.account.unwrap_or_default());
                self.store.put_identity(&identity).await?;
                log::info!("paired device {} for {}", identity.device_id, identity.account);
                identity
            }
        };

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    log::debug!("bridge: write failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let reader = {
            let pending = pending.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                read_loop(stream, pending.clone()).await;
                connected.store(false, Ordering::SeqCst);
                lock_pending(&pending).clear();
                log::warn!("bridge connection closed");
            })
        };

        Ok((
            Connection {
                outbound,
                pending,
                connected,
                reader,
                writer,
            },
            identity,
        ))
    }
}

/// Next text frame, skipping control frames. None when the stream ends or a close frame arrives.
async fn next_text<S>(stream: &mut S) -> Option<Result<String, ClientError>>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => return Some(Ok(text)),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => return Some(Err(ClientError::Connect(e.to_string()))),
        }
    }
}

/// Route responses to their waiting senders until the socket closes.
async fn read_loop<S>(mut stream: S, pending: Pending)
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(text) = next_text(&mut stream).await {
        let text = match text {
            Ok(t) => t,
            Err(e) => {
                log::debug!("bridge: read failed: {}", e);
                break;
            }
        };
        match serde_json::from_str::<Inbound>(&text) {
            Ok(Inbound::Res { id, ok, payload, error }) => {
                let waiting = lock_pending(&pending).remove(&id);
                let Some(tx) = waiting else {
                    log::debug!("bridge: response for unknown request {}", id);
                    continue;
                };
                let result = if ok {
                    Ok(payload.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(error.unwrap_or_else(|| "request failed".to_string()))
                };
                let _ = tx.send(result);
            }
            Ok(Inbound::Event { event, .. }) => log::debug!("bridge event: {}", event),
            Err(e) => log::debug!("bridge: unparseable frame: {}", e),
        }
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn connect(&self) -> Result<(), ClientError> {
        let mut conn = self.conn.write().await;
        if conn
            .as_ref()
            .is_some_and(|c| c.connected.load(Ordering::SeqCst))
        {
            return Ok(());
        }
        let result = self.handshake().await;
        self.close_pairing();
        let (connection, identity) = result?;
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(identity);
        *conn = Some(connection);
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(conn) = self.conn.write().await.take() else {
            return;
        };
        conn.connected.store(false, Ordering::SeqCst);
        let _ = conn.outbound.send(Message::Close(None));
        drop(conn.outbound);
        let _ = conn.writer.await;
        conn.reader.abort();
        let abandoned = {
            let mut pending = lock_pending(&conn.pending);
            let n = pending.len();
            pending.clear();
            n
        };
        log::info!("bridge disconnected ({} requests abandoned)", abandoned);
    }

    fn pairing_events(&self) -> Result<PairingEvents, ClientError> {
        if self.pairing_opened.swap(true, Ordering::SeqCst) {
            return Err(ClientError::PairingAlreadyOpen);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.pairing_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        Ok(rx)
    }

    async fn send_message(&self, to: &Address, text: &str) -> Result<(), ClientError> {
        let (rx, _slot) = {
            let conn = self.conn.read().await;
            let conn = conn
                .as_ref()
                .filter(|c| c.connected.load(Ordering::SeqCst))
                .ok_or(ClientError::NotConnected)?;
            let id = uuid::Uuid::new_v4().to_string();
            let params = serde_json::to_value(SendParams {
                to: to.to_string(),
                text: text.to_string(),
            })
            .map_err(|e| ClientError::Send(e.to_string()))?;
            let frame = serde_json::to_string(&BridgeRequest::new(id.clone(), "send", params))
                .map_err(|e| ClientError::Send(e.to_string()))?;

            let (tx, rx) = oneshot::channel();
            lock_pending(&conn.pending).insert(id.clone(), tx);
            let slot = PendingSlot {
                pending: conn.pending.clone(),
                id,
            };
            // the reader clears pending after flipping `connected`; recheck so nothing is stranded
            if !conn.connected.load(Ordering::SeqCst)
                || conn.outbound.send(Message::Text(frame)).is_err()
            {
                return Err(ClientError::Closed);
            }
            (rx, slot)
        };
        match rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ClientError::Send(e)),
            Err(_) => Err(ClientError::Closed),
        }
    }

    fn current_identity(&self) -> Option<DeviceIdentity> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
