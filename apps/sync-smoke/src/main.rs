mod logging;

use std::{env, process::ExitCode};

use sync_core::{EntityId, SyncEvent};
use sync_runtime::{SyncConfig, SyncRuntime};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let Some(user_id) = env::var("SYNC_USER_ID")
        .ok()
        .filter(|value| !value.trim().is_empty())
    else {
        error!("SYNC_USER_ID must be set to the user whose notifications should be followed");
        return ExitCode::FAILURE;
    };
    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let page = config.first_page();

    let runtime = match SyncRuntime::connect(config, EntityId::new(user_id.trim())) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start sync runtime");
            return ExitCode::FAILURE;
        }
    };
    let mut events = runtime.subscribe_events();

    if let Err(err) = runtime.notifications().open() {
        error!(error = %err, "failed to open notifications channel");
    }
    match runtime.notifications().load(page).await {
        Ok(items) => info!(
            loaded = items.len(),
            unread = runtime.notifications().unread_count(),
            "first notifications page"
        ),
        Err(err) => warn!(error = %err, "first notifications page failed"),
    }

    info!("following live events; press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    runtime.shutdown().await;
    ExitCode::SUCCESS
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::ConnectionChanged { key, state } => {
            info!(key = %key, ?state, "connection changed");
        }
        SyncEvent::NotificationsUpdated { unread_count } => {
            info!(unread_count, "notifications updated");
        }
        SyncEvent::ConversationsUpdated { unread_total } => {
            info!(unread_total, "conversations updated");
        }
        SyncEvent::MessagesUpdated {
            conversation_id,
            unread_count,
        } => {
            info!(conversation_id = %conversation_id, unread_count, "messages updated");
        }
        SyncEvent::SendAck(ack) => {
            info!(
                provisional_id = %ack.provisional_id,
                message_id = ?ack.message_id,
                error_code = ?ack.error_code,
                "send acknowledged"
            );
        }
    }
}
