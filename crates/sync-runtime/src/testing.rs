//! Scripted connector and REST fakes shared by the runtime tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use sync_core::SyncError;
use tokio::sync::mpsc;

use crate::{
    rest::{RestApi, RestRequest},
    transport::{
        ChannelConnector, ChannelSocket, FrameSink, FrameStream, SocketFrame, TransportError,
        TransportResult,
    },
};

/// Let spawned tasks run until they are all parked again.
///
/// Advances paused time by one millisecond.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Test-side handle to one accepted fake socket.
#[derive(Clone)]
pub(crate) struct FakeSocketControl {
    inbound: mpsc::UnboundedSender<TransportResult<SocketFrame>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed_with: Arc<Mutex<Option<u16>>>,
}

impl FakeSocketControl {
    pub(crate) fn push_text(&self, text: &str) {
        let _ = self.inbound.send(Ok(SocketFrame::Text(text.to_owned())));
    }

    pub(crate) fn push_close(&self, code: u16) {
        let _ = self.inbound.send(Ok(SocketFrame::Closed {
            code,
            reason: String::new(),
        }));
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub(crate) fn closed_with(&self) -> Option<u16> {
        *self.closed_with.lock().expect("close lock")
    }
}

struct FakeSink {
    sent: Arc<Mutex<Vec<String>>>,
    closed_with: Arc<Mutex<Option<u16>>>,
}

#[async_trait]
impl FrameSink for FakeSink {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.sent.lock().expect("sent lock").push(text);
        Ok(())
    }

    async fn close(&mut self, code: u16) -> TransportResult<()> {
        *self.closed_with.lock().expect("close lock") = Some(code);
        Ok(())
    }
}

struct FakeStream {
    inbound: mpsc::UnboundedReceiver<TransportResult<SocketFrame>>,
}

#[async_trait]
impl FrameStream for FakeStream {
    async fn next_frame(&mut self) -> Option<TransportResult<SocketFrame>> {
        self.inbound.recv().await
    }
}

/// Connector whose handshakes succeed unless a failure was scripted.
#[derive(Default)]
pub(crate) struct FakeConnector {
    failures: Mutex<VecDeque<TransportError>>,
    hangs: AtomicUsize,
    connects: AtomicUsize,
    sockets: Mutex<Vec<FakeSocketControl>>,
    urls: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next handshake with `err`.
    pub(crate) fn fail_next(&self, err: TransportError) {
        self.failures.lock().expect("failures lock").push_back(err);
    }

    /// Never complete the next handshake.
    pub(crate) fn hang_next(&self) {
        self.hangs.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().expect("urls lock").clone()
    }

    /// Most recently accepted socket.
    pub(crate) fn last_socket(&self) -> FakeSocketControl {
        self.sockets
            .lock()
            .expect("sockets lock")
            .last()
            .cloned()
            .expect("a socket should have been accepted")
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self, url: &str) -> TransportResult<ChannelSocket> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().expect("urls lock").push(url.to_owned());
        let hang = self
            .hangs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(err) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(err);
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed_with = Arc::new(Mutex::new(None));
        self.sockets
            .lock()
            .expect("sockets lock")
            .push(FakeSocketControl {
                inbound: inbound_tx,
                sent: Arc::clone(&sent),
                closed_with: Arc::clone(&closed_with),
            });

        Ok(ChannelSocket {
            sink: Box::new(FakeSink { sent, closed_with }),
            stream: Box::new(FakeStream {
                inbound: inbound_rx,
            }),
        })
    }
}

/// REST fake answering from per-path queues, then per-path defaults.
///
/// Unscripted paths answer 404.
#[derive(Default)]
pub(crate) struct FakeRest {
    queued: Mutex<HashMap<String, VecDeque<Result<Value, SyncError>>>>,
    defaults: Mutex<HashMap<String, Value>>,
    requests: Mutex<Vec<RestRequest>>,
}

impl FakeRest {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, path: &str, result: Result<Value, SyncError>) {
        self.queued
            .lock()
            .expect("queue lock")
            .entry(path.to_owned())
            .or_default()
            .push_back(result);
    }

    pub(crate) fn always(&self, path: &str, value: Value) {
        self.defaults
            .lock()
            .expect("defaults lock")
            .insert(path.to_owned(), value);
    }

    pub(crate) fn requests(&self) -> Vec<RestRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub(crate) fn calls_to(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.path == path)
            .count()
    }
}

#[async_trait]
impl RestApi for FakeRest {
    async fn execute(&self, request: &RestRequest) -> Result<Value, SyncError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        let queued = self
            .queued
            .lock()
            .expect("queue lock")
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front);
        if let Some(result) = queued {
            return result;
        }
        match self.defaults.lock().expect("defaults lock").get(&request.path) {
            Some(value) => Ok(value.clone()),
            None => Err(SyncError::http(404, format!("no fake for {}", request.path))),
        }
    }
}
