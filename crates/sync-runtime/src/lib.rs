//! I/O side of the synchronization client.
//!
//! [`SyncRuntime`] wires one shared response cache (plus its sweeper), one
//! [`ConnectionManager`] and the two facades consumed by the UI:
//! [`NotificationsFacade`] and [`MessagesFacade`]. Sockets, HTTP, time and id
//! generation are injected through [`RuntimeServices`] so everything above
//! the transport can be driven by fakes.

use std::sync::Arc;

use sync_core::{EntityId, EventStream, SyncError, SyncEventBus};
use sync_platform::{Clock, IdSource, SystemClock, UuidIdSource};
use tracing::info;

pub mod config;
pub mod connection;
pub mod fetch;
pub mod messages;
pub mod notifications;
mod pump;
pub mod rest;
pub mod transport;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, SyncConfig};
pub use connection::{
    ChannelEvent, ChannelEventKind, ChannelHandle, ChannelSendError, ConnectionManager,
};
pub use fetch::{CacheSweeper, ResilientFetcher, SharedCache, retry, retry_with_policy, shared_cache};
pub use messages::{MessagesDeps, MessagesFacade};
pub use notifications::{NotificationsFacade, NotificationsSnapshot};
pub use rest::{HttpRestClient, RestApi, RestMethod, RestRequest};
pub use transport::{
    ChannelConnector, ChannelSocket, FrameSink, FrameStream, SocketFrame, TransportError,
    TransportResult,
};
pub use websocket::WebSocketConnector;

const EVENT_BUS_BUFFER: usize = 512;

/// External services the runtime talks through.
pub struct RuntimeServices {
    pub rest: Arc<dyn RestApi>,
    pub connector: Arc<dyn ChannelConnector>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdSource>,
}

impl RuntimeServices {
    /// reqwest for REST, tungstenite for channels, wall clock and UUID ids.
    pub fn production(config: &SyncConfig) -> Result<Self, SyncError> {
        let mut rest = HttpRestClient::new(config.api_base_url.as_str(), config.http_timeout())?;
        if let Some(token) = &config.auth_token {
            rest = rest.with_bearer_token(token.clone());
        }
        Ok(Self {
            rest: Arc::new(rest),
            connector: Arc::new(WebSocketConnector::new()),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidIdSource),
        })
    }
}

/// Synchronization client for one signed-in user.
pub struct SyncRuntime {
    config: Arc<SyncConfig>,
    bus: SyncEventBus,
    connections: ConnectionManager,
    fetcher: ResilientFetcher,
    sweeper: CacheSweeper,
    notifications: NotificationsFacade,
    messages: MessagesFacade,
}

impl SyncRuntime {
    /// Build the runtime and start the cache sweeper.
    ///
    /// Must be called from within a tokio runtime. No channel is opened
    /// until a facade's `open` is called.
    pub fn new(config: SyncConfig, user_id: EntityId, services: RuntimeServices) -> Self {
        let config = Arc::new(config);
        let bus = SyncEventBus::new(EVENT_BUS_BUFFER);
        let cache = shared_cache();
        let sweeper = CacheSweeper::start(
            Arc::clone(&cache),
            Arc::clone(&services.clock),
            config.cache_sweep_interval(),
        );
        let connections = ConnectionManager::with_handshake_timeout(
            services.connector,
            config.reconnect_policy(),
            config.handshake_timeout(),
        );
        let fetcher = ResilientFetcher::new(
            services.rest,
            cache,
            Arc::clone(&services.clock),
            config.fetch_policy(),
            config.cache_ttl(),
        );

        let notifications = NotificationsFacade::new(
            Arc::clone(&config),
            user_id.clone(),
            fetcher.clone(),
            connections.clone(),
            bus.clone(),
        );
        let messages = MessagesFacade::new(
            Arc::clone(&config),
            user_id.clone(),
            MessagesDeps {
                fetcher: fetcher.clone(),
                connections: connections.clone(),
                bus: bus.clone(),
                clock: services.clock,
                ids: services.ids,
            },
        );

        info!(
            user_id = %user_id,
            live_channels = config.live_channels,
            api = %config.api_base_url,
            "sync runtime started"
        );
        Self {
            config,
            bus,
            connections,
            fetcher,
            sweeper,
            notifications,
            messages,
        }
    }

    /// [`SyncRuntime::new`] with [`RuntimeServices::production`].
    pub fn connect(config: SyncConfig, user_id: EntityId) -> Result<Self, SyncError> {
        let services = RuntimeServices::production(&config)?;
        Ok(Self::new(config, user_id, services))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn notifications(&self) -> &NotificationsFacade {
        &self.notifications
    }

    pub fn messages(&self) -> &MessagesFacade {
        &self.messages
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn fetcher(&self) -> &ResilientFetcher {
        &self.fetcher
    }

    /// Receive every event emitted by either facade.
    pub fn subscribe_events(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Close every channel and stop the sweeper.
    pub async fn shutdown(self) {
        self.notifications.shutdown();
        self.messages.shutdown();
        self.connections.shutdown();
        self.sweeper.stop().await;
        info!("sync runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::env;

    use serde_json::json;
    use sync_core::{ConnectionState, PageRequest, SyncEvent};
    use sync_platform::{ManualClock, SequentialIdSource};

    use super::*;
    use crate::testing::{FakeConnector, FakeRest, settle};

    fn runtime(connector: Arc<FakeConnector>, rest: Arc<FakeRest>) -> SyncRuntime {
        let config = SyncConfig::from_lookup(|key| match key {
            "SYNC_RECONNECT_BASE_MS" => Some("100".to_owned()),
            "SYNC_RECONNECT_MAX_MS" => Some("1000".to_owned()),
            _ => None,
        })
        .expect("test config should parse");
        SyncRuntime::new(
            config,
            EntityId::from(42),
            RuntimeServices {
                rest,
                connector,
                clock: Arc::new(ManualClock::new(0)),
                ids: Arc::new(SequentialIdSource::new()),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn facades_share_connections_and_event_bus() {
        let connector = FakeConnector::new();
        let rest = FakeRest::new();
        let runtime = runtime(connector.clone(), rest);
        let mut events = runtime.subscribe_events();

        runtime.notifications().open().expect("notifications open");
        runtime
            .messages()
            .open(&EntityId::from(5))
            .expect("chat open");
        settle().await;

        assert_eq!(connector.connects(), 2);
        assert_eq!(runtime.connections().connection_count(), 2);
        let mut opened = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::ConnectionChanged {
                key,
                state: ConnectionState::Open,
            } = event
            {
                opened.push(key.to_string());
            }
        }
        opened.sort();
        assert_eq!(opened, ["chat:5", "notifications:42"]);

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_every_channel() {
        let connector = FakeConnector::new();
        let runtime = runtime(connector.clone(), FakeRest::new());
        runtime.notifications().open().expect("notifications open");
        settle().await;
        let socket = connector.last_socket();
        let connections = runtime.connections().clone();

        runtime.shutdown().await;
        settle().await;

        assert_eq!(socket.closed_with(), Some(1000));
        assert_eq!(connections.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_reads_survive_until_a_mutation() {
        let rest = FakeRest::new();
        rest.always("notifications/", json!([{ "id": 1 }]));
        rest.always("notifications/mark_all_as_read/", json!({}));
        let runtime = runtime(FakeConnector::new(), rest.clone());
        let notifications = runtime.notifications();

        notifications
            .load(PageRequest::default())
            .await
            .expect("first load");
        notifications
            .load(PageRequest::default())
            .await
            .expect("cached load");
        assert_eq!(rest.calls_to("notifications/"), 1);

        notifications.mark_all_read().await.expect("mark all");
        notifications
            .load(PageRequest::default())
            .await
            .expect("reload after mutation");
        assert_eq!(rest.calls_to("notifications/"), 2);

        runtime.shutdown().await;
    }

    #[tokio::test]
    #[ignore = "runs against a live backend, requires env vars"]
    async fn live_notifications_smoke() {
        let user_id = env::var("SYNC_USER_ID").expect("SYNC_USER_ID must be set");
        let config = SyncConfig::from_env().expect("SYNC_* env vars should parse");

        let runtime =
            SyncRuntime::connect(config, EntityId::new(user_id)).expect("runtime should start");
        let page = runtime.config().first_page();
        runtime
            .notifications()
            .load(page)
            .await
            .expect("first notifications page");
        runtime
            .notifications()
            .refresh_unread_count()
            .await
            .expect("unread count");
        runtime
            .messages()
            .load_conversations(page)
            .await
            .expect("first conversations page");
        runtime.shutdown().await;
    }
}
