//! Push channel connection manager.
//!
//! One [`ConnectionSlot`] per [`StreamKey`]; each slot is driven by its own
//! task that runs the [`ConnectionStateMachine`] against a socket from the
//! injected [`ChannelConnector`]. Connection failures never surface to
//! callers: they are logged and feed the reconnect loop.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use sync_core::{
    ConnectionState, OutboundPayload, ReconnectPolicy, StreamKey, SyncError,
    state_machine::{
        ABNORMAL_CLOSE_CODE, CloseReason, ConnectionDirective, ConnectionStateMachine,
        NORMAL_CLOSE_CODE,
    },
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{ChannelConnector, SocketFrame};

const OUTBOUND_QUEUE: usize = 64;
const EVENT_BUFFER: usize = 256;

/// How long a handshake may take before it counts as a transient failure.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by [`ConnectionManager::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelSendError {
    #[error("no connection for stream {0}")]
    Unknown(StreamKey),
    #[error("connection for stream {key} is {state:?}")]
    NotOpen {
        key: StreamKey,
        state: ConnectionState,
    },
    #[error("outbound queue for stream {0} is unavailable")]
    QueueUnavailable(StreamKey),
    #[error(transparent)]
    Encode(#[from] SyncError),
}

/// Something observed on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEventKind {
    State(ConnectionState),
    Frame(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub key: StreamKey,
    pub connection_id: u64,
    pub generation: u64,
    pub kind: ChannelEventKind,
}

/// Returned by [`ConnectionManager::subscribe`].
///
/// The event receiver closes once the connection is released.
#[derive(Debug)]
pub struct ChannelHandle {
    pub key: StreamKey,
    pub connection_id: u64,
    pub events: broadcast::Receiver<ChannelEvent>,
}

struct ConnectionSlot {
    connection_id: u64,
    machine: ConnectionStateMachine,
    cancel: CancellationToken,
    outbound: mpsc::Sender<String>,
    events: broadcast::Sender<ChannelEvent>,
}

struct ManagerInner {
    connector: Arc<dyn ChannelConnector>,
    policy: ReconnectPolicy,
    handshake_timeout: Duration,
    slots: Mutex<HashMap<StreamKey, ConnectionSlot>>,
    next_connection_id: AtomicU64,
}

impl ManagerInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<StreamKey, ConnectionSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns at most one live push connection per stream key.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn ChannelConnector>, policy: ReconnectPolicy) -> Self {
        Self::with_handshake_timeout(connector, policy, DEFAULT_HANDSHAKE_TIMEOUT)
    }

    /// Like [`ConnectionManager::new`], abandoning handshakes after `handshake_timeout`.
    pub fn with_handshake_timeout(
        connector: Arc<dyn ChannelConnector>,
        policy: ReconnectPolicy,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                policy,
                handshake_timeout,
                slots: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open (or reuse) the connection for `key`.
    ///
    /// While the existing connection is live the call only attaches a new
    /// event receiver. After a terminal close, or while the previous
    /// connection is still closing, a fresh connection is created.
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, key: &StreamKey, url: &str) -> ChannelHandle {
        let mut slots = self.inner.slots();
        if let Some(slot) = slots.get(key)
            && slot.machine.state().is_live()
        {
            debug!(key = %key, connection_id = slot.connection_id, "reusing push connection");
            return ChannelHandle {
                key: key.clone(),
                connection_id: slot.connection_id,
                events: slot.events.subscribe(),
            };
        }

        let connection_id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events_tx, events_rx) = broadcast::channel(EVENT_BUFFER);

        let replaced = slots.insert(
            key.clone(),
            ConnectionSlot {
                connection_id,
                machine: ConnectionStateMachine::new(self.inner.policy),
                cancel: cancel.clone(),
                outbound: outbound_tx,
                events: events_tx.clone(),
            },
        );
        drop(slots);
        if let Some(previous) = replaced {
            previous.cancel.cancel();
        }

        info!(key = %key, connection_id, "opening push connection");
        let driver = ConnectionDriver {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            connection_id,
            url: url.to_owned(),
            cancel,
            outbound: outbound_rx,
            events: events_tx,
        };
        tokio::spawn(driver.run());

        ChannelHandle {
            key: key.clone(),
            connection_id,
            events: events_rx,
        }
    }

    /// Close the connection for `key`. Safe to call repeatedly.
    ///
    /// Pending reconnect timers are cancelled before this returns. An open
    /// socket is closed with code 1000 by its driver.
    pub fn unsubscribe(&self, key: &StreamKey) {
        let mut slots = self.inner.slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };

        match slot.machine.close() {
            ConnectionDirective::CloseSocket => {
                info!(key = %key, connection_id = slot.connection_id, "closing push connection");
                slot.cancel.cancel();
            }
            ConnectionDirective::Release => {
                info!(key = %key, connection_id = slot.connection_id, "releasing push connection");
                slot.cancel.cancel();
                slots.remove(key);
            }
            _ => {}
        }
    }

    /// Queue a payload on an open connection.
    pub fn send(&self, key: &StreamKey, payload: &OutboundPayload) -> Result<(), ChannelSendError> {
        let text = payload.to_json()?;
        let slots = self.inner.slots();
        let slot = slots
            .get(key)
            .ok_or_else(|| ChannelSendError::Unknown(key.clone()))?;

        let state = slot.machine.state();
        if state != ConnectionState::Open {
            return Err(ChannelSendError::NotOpen {
                key: key.clone(),
                state,
            });
        }
        slot.outbound
            .try_send(text)
            .map_err(|_| ChannelSendError::QueueUnavailable(key.clone()))
    }

    pub fn state(&self, key: &StreamKey) -> Option<ConnectionState> {
        self.inner.slots().get(key).map(|slot| slot.machine.state())
    }

    pub fn is_open(&self, key: &StreamKey) -> bool {
        self.state(key) == Some(ConnectionState::Open)
    }

    pub fn retry_count(&self, key: &StreamKey) -> Option<u32> {
        self.inner
            .slots()
            .get(key)
            .map(|slot| slot.machine.retry_count())
    }

    pub fn last_error(&self, key: &StreamKey) -> Option<String> {
        self.inner
            .slots()
            .get(key)
            .and_then(|slot| slot.machine.last_error().map(str::to_owned))
    }

    /// Number of connections currently held, including ones still closing.
    pub fn connection_count(&self) -> usize {
        self.inner.slots().len()
    }

    /// Unsubscribe every key.
    pub fn shutdown(&self) {
        let keys: Vec<StreamKey> = self.inner.slots().keys().cloned().collect();
        for key in &keys {
            self.unsubscribe(key);
        }
    }
}

/// Task driving one connection slot until it is released.
struct ConnectionDriver {
    inner: Arc<ManagerInner>,
    key: StreamKey,
    connection_id: u64,
    url: String,
    cancel: CancellationToken,
    outbound: mpsc::Receiver<String>,
    events: broadcast::Sender<ChannelEvent>,
}

impl ConnectionDriver {
    async fn run(mut self) {
        let mut directive = self
            .with_machine(|machine| machine.subscribe().unwrap_or(ConnectionDirective::Ignore))
            .unwrap_or(ConnectionDirective::Release);

        loop {
            directive = match directive {
                ConnectionDirective::Connect { generation } => {
                    self.publish(generation, ChannelEventKind::State(ConnectionState::Connecting));
                    self.connect_and_pump(generation).await
                }
                ConnectionDirective::Reconnect { delay, retry_count } => {
                    self.publish(0, ChannelEventKind::State(ConnectionState::Reconnecting));
                    info!(
                        key = %self.key,
                        attempt = retry_count,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "scheduling push reconnect"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => ConnectionDirective::Release,
                        _ = tokio::time::sleep(delay) => self
                            .with_machine(ConnectionStateMachine::on_reconnect_due)
                            .unwrap_or(ConnectionDirective::Release),
                    }
                }
                ConnectionDirective::CloseSocket
                | ConnectionDirective::Release
                | ConnectionDirective::Ignore => break,
            };
        }

        self.release();
    }

    async fn connect_and_pump(&mut self, generation: u64) -> ConnectionDirective {
        let handshake = tokio::time::timeout(
            self.inner.handshake_timeout,
            self.inner.connector.connect(&self.url),
        );
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return ConnectionDirective::Release,
            result = handshake => result,
        };

        let mut socket = match connected {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                warn!(key = %self.key, generation, error = %err, "push connect failed");
                return self.on_socket_closed(generation, err.close_reason());
            }
            Err(_) => {
                warn!(
                    key = %self.key,
                    generation,
                    timeout_ms = u64::try_from(self.inner.handshake_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    "push handshake timed out"
                );
                return self.on_socket_closed(generation, CloseReason::abnormal("handshake timed out"));
            }
        };

        let opened = self
            .with_machine(|machine| machine.on_open(generation))
            .unwrap_or(false);
        if !opened {
            debug!(key = %self.key, generation, "discarding stale push socket");
            let _ = socket.sink.close(NORMAL_CLOSE_CODE).await;
            return ConnectionDirective::Release;
        }
        info!(key = %self.key, generation, "push connection open");
        self.publish(generation, ChannelEventKind::State(ConnectionState::Open));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    if let Err(err) = socket.sink.close(NORMAL_CLOSE_CODE).await {
                        debug!(key = %self.key, generation, error = %err, "clean close failed");
                    }
                    self.with_machine(ConnectionStateMachine::finish_close);
                    return ConnectionDirective::Release;
                }
                frame = socket.stream.next_frame() => match frame {
                    Some(Ok(SocketFrame::Text(text))) => {
                        let accepted = self
                            .with_machine(|machine| machine.accepts_frame(generation))
                            .unwrap_or(false);
                        if accepted {
                            self.publish(generation, ChannelEventKind::Frame(text));
                        }
                    }
                    Some(Ok(SocketFrame::Closed { code, reason })) => {
                        return self.on_socket_closed(generation, CloseReason::from_close_code(code, reason));
                    }
                    Some(Err(err)) => {
                        return self.on_socket_closed(generation, err.close_reason());
                    }
                    None => {
                        let reason = CloseReason::Abnormal {
                            code: Some(ABNORMAL_CLOSE_CODE),
                            detail: "stream ended without close frame".to_owned(),
                        };
                        return self.on_socket_closed(generation, reason);
                    }
                },
                Some(text) = self.outbound.recv() => {
                    if let Err(err) = socket.sink.send_text(text).await {
                        warn!(key = %self.key, generation, error = %err, "push send failed");
                        return self.on_socket_closed(generation, err.close_reason());
                    }
                }
            }
        }
    }

    fn on_socket_closed(&self, generation: u64, reason: CloseReason) -> ConnectionDirective {
        match &reason {
            CloseReason::Normal => info!(key = %self.key, generation, "push connection closed by server"),
            other => warn!(key = %self.key, generation, reason = ?other, "push connection lost"),
        }
        self.with_machine(|machine| machine.on_close(generation, &reason))
            .unwrap_or(ConnectionDirective::Release)
    }

    /// Run `f` on this driver's state machine under the table lock.
    ///
    /// Returns `None` once the slot was removed or replaced.
    fn with_machine<R>(&self, f: impl FnOnce(&mut ConnectionStateMachine) -> R) -> Option<R> {
        let mut slots = self.inner.slots();
        let slot = slots.get_mut(&self.key)?;
        if slot.connection_id != self.connection_id {
            return None;
        }
        Some(f(&mut slot.machine))
    }

    fn publish(&self, generation: u64, kind: ChannelEventKind) {
        let _ = self.events.send(ChannelEvent {
            key: self.key.clone(),
            connection_id: self.connection_id,
            generation,
            kind,
        });
    }

    fn release(&self) {
        {
            let mut slots = self.inner.slots();
            if slots
                .get(&self.key)
                .is_some_and(|slot| slot.connection_id == self.connection_id)
            {
                slots.remove(&self.key);
            }
        }
        debug!(key = %self.key, connection_id = self.connection_id, "push connection released");
        self.publish(0, ChannelEventKind::State(ConnectionState::Closed));
    }
}
