//! Notifications facade: live push stream, paginated history and read state.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use serde_json::json;
use sync_core::{
    ConnectionState, EntityId, Notification, NotificationCommand, NotificationStore,
    OutboundPayload, PageRequest, StreamKey, SyncError, SyncErrorCategory, SyncEvent, SyncEventBus,
    ReduceOutcome, decode_push, normalize_list, unread_count_from,
};
use tracing::{debug, warn};

use crate::{
    config::SyncConfig,
    connection::{ChannelEvent, ChannelEventKind, ConnectionManager},
    fetch::ResilientFetcher,
    pump::{PumpEvent, PumpRegistry},
    rest::RestRequest,
};

const LIST_PATH: &str = "notifications/";
const UNREAD_COUNT_PATH: &str = "notifications/unread_count/";
const MARK_ALL_READ_PATH: &str = "notifications/mark_all_as_read/";

/// Point-in-time copy of the notifications store.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationsSnapshot {
    pub items: Vec<Notification>,
    pub unread_count: u64,
}

struct NotificationsInner {
    config: Arc<SyncConfig>,
    user_id: EntityId,
    key: StreamKey,
    fetcher: ResilientFetcher,
    connections: ConnectionManager,
    bus: SyncEventBus,
    store: Mutex<NotificationStore>,
    pumps: PumpRegistry,
    opened: AtomicBool,
}

impl NotificationsInner {
    fn store(&self) -> MutexGuard<'_, NotificationStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_unread(&self, unread_count: u64) {
        self.bus
            .emit(SyncEvent::NotificationsUpdated { unread_count });
    }

    fn handle_pump_event(self: &Arc<Self>, event: PumpEvent) {
        match event {
            PumpEvent::Channel(event) => self.handle_event(event),
            PumpEvent::Lagged { key, skipped } => {
                warn!(key = %key, skipped, "notification events lost; resynchronizing");
                self.resync();
            }
        }
    }

    /// Reload the first page and the unread count, bypassing cached pages.
    fn resync(self: &Arc<Self>) {
        self.fetcher.invalidate_prefix(LIST_PATH);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = inner.load(inner.config.first_page()).await {
                warn!(error = %err, "notification page reload failed");
            }
            if let Err(err) = inner.refresh_unread_count().await {
                warn!(error = %err, "unread count refresh failed");
            }
        });
    }

    async fn load(&self, page: PageRequest) -> Result<Vec<Notification>, SyncError> {
        let mut request = RestRequest::get(LIST_PATH);
        for (key, value) in page.params() {
            request = request.with_param(key, value);
        }
        let items: Vec<Notification> = normalize_list(self.fetcher.get(&request).await?)?;

        let unread_count = {
            let mut store = self.store();
            store.merge_page(items.clone());
            store.unread_count()
        };
        self.emit_unread(unread_count);
        Ok(items)
    }

    async fn refresh_unread_count(&self) -> Result<u64, SyncError> {
        let body = self
            .fetcher
            .get_fresh(&RestRequest::get(UNREAD_COUNT_PATH))
            .await?;
        let count = unread_count_from(&body).ok_or_else(|| {
            SyncError::new(
                SyncErrorCategory::Serialization,
                "unexpected_payload_shape",
                "unread count response has no count",
            )
        })?;

        self.store().set_authoritative_unread(count);
        self.emit_unread(count);
        Ok(count)
    }

    fn handle_event(&self, event: ChannelEvent) {
        match event.kind {
            ChannelEventKind::State(state) => {
                self.bus.emit(SyncEvent::ConnectionChanged {
                    key: event.key.clone(),
                    state,
                });
                if state == ConnectionState::Open {
                    let request = OutboundPayload::Command(NotificationCommand::GetUnreadCount);
                    if let Err(err) = self.connections.send(&event.key, &request) {
                        debug!(key = %event.key, error = %err, "unread count request not sent");
                    }
                }
            }
            ChannelEventKind::Frame(text) => match decode_push::<Notification>(&text) {
                Ok(push) => {
                    let (outcome, unread_count) = {
                        let mut store = self.store();
                        let outcome = store.apply(push);
                        (outcome, store.unread_count())
                    };
                    debug!(key = %event.key, ?outcome, unread_count, "notification event applied");
                    if matches!(outcome, ReduceOutcome::Inserted | ReduceOutcome::Removed) {
                        self.fetcher.invalidate_prefix(LIST_PATH);
                    }
                    self.emit_unread(unread_count);
                }
                Err(err) => {
                    warn!(key = %event.key, error = %err, "dropping undecodable notification frame");
                }
            },
        }
    }
}

/// Notifications for one user.
#[derive(Clone)]
pub struct NotificationsFacade {
    inner: Arc<NotificationsInner>,
}

impl NotificationsFacade {
    pub fn new(
        config: Arc<SyncConfig>,
        user_id: EntityId,
        fetcher: ResilientFetcher,
        connections: ConnectionManager,
        bus: SyncEventBus,
    ) -> Self {
        let key = StreamKey::notifications(&user_id);
        Self {
            inner: Arc::new(NotificationsInner {
                config,
                user_id,
                key,
                fetcher,
                connections,
                bus,
                store: Mutex::new(NotificationStore::new()),
                pumps: PumpRegistry::default(),
                opened: AtomicBool::new(false),
            }),
        }
    }

    pub fn stream_key(&self) -> &StreamKey {
        &self.inner.key
    }

    /// Fetch one page and merge it into the store.
    pub async fn load(&self, page: PageRequest) -> Result<Vec<Notification>, SyncError> {
        self.inner.load(page).await
    }

    /// Subscribe to the user's push stream. A no-op when live channels are off.
    pub fn open(&self) -> Result<(), SyncError> {
        if !self.inner.config.live_channels {
            debug!(key = %self.inner.key, "live channels disabled; notifications use REST only");
            return Ok(());
        }
        let url = self.inner.config.notifications_url(&self.inner.user_id)?;
        let handle = self.inner.connections.subscribe(&self.inner.key, &url);
        self.inner.opened.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        self.inner
            .pumps
            .attach(handle, move |event| inner.handle_pump_event(event));
        Ok(())
    }

    pub fn close(&self) {
        self.inner.opened.store(false, Ordering::SeqCst);
        self.inner.connections.unsubscribe(&self.inner.key);
        self.inner.pumps.detach(&self.inner.key);
    }

    /// Mark one notification read: locally first, then over the channel when
    /// it is open, otherwise through REST. Local state is not rolled back.
    pub async fn mark_read(&self, id: &EntityId) -> Result<(), SyncError> {
        let unread_count = {
            let mut store = self.inner.store();
            store.mark_read(id);
            store.unread_count()
        };
        self.inner.emit_unread(unread_count);

        let command = OutboundPayload::Command(NotificationCommand::MarkAsRead { id: id.clone() });
        match self.inner.connections.send(&self.inner.key, &command) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(id = %id, reason = %err, "marking notification read through REST");
                self.inner
                    .fetcher
                    .mutate(&RestRequest::post(
                        format!("{LIST_PATH}{id}/mark_as_read/"),
                        json!({}),
                    ))
                    .await
                    .map(|_| ())
            }
        }
    }

    pub async fn mark_all_read(&self) -> Result<(), SyncError> {
        let unread_count = {
            let mut store = self.inner.store();
            store.mark_all_read();
            store.unread_count()
        };
        self.inner.emit_unread(unread_count);

        self.inner
            .fetcher
            .mutate(&RestRequest::post(MARK_ALL_READ_PATH, json!({})))
            .await
            .map(|_| ())
    }

    pub async fn delete(&self, id: &EntityId) -> Result<(), SyncError> {
        let unread_count = {
            let mut store = self.inner.store();
            store.remove(id);
            store.unread_count()
        };
        self.inner.emit_unread(unread_count);

        self.inner
            .fetcher
            .mutate(&RestRequest::delete(format!("{LIST_PATH}{id}/")))
            .await
            .map(|_| ())
    }

    /// Ask the server for an authoritative unread count.
    pub async fn refresh_unread_count(&self) -> Result<u64, SyncError> {
        self.inner.refresh_unread_count().await
    }

    pub fn unread_count(&self) -> u64 {
        self.inner.store().unread_count()
    }

    pub fn snapshot(&self) -> NotificationsSnapshot {
        let store = self.inner.store();
        NotificationsSnapshot {
            items: store.items().to_vec(),
            unread_count: store.unread_count(),
        }
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.inner.connections.state(&self.inner.key)
    }

    /// True while live updates are expected but the channel is not open,
    /// including after the server ended the channel for good.
    pub fn degraded(&self) -> bool {
        self.inner.config.live_channels
            && self.inner.opened.load(Ordering::SeqCst)
            && self.connection_state() != Some(ConnectionState::Open)
    }

    pub(crate) fn shutdown(&self) {
        self.close();
        self.inner.pumps.abort_all();
    }
}
