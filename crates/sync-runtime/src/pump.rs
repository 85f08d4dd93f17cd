//! Tasks forwarding connection events into a facade, one per stream key.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use sync_core::StreamKey;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, warn};

use crate::connection::{ChannelEvent, ChannelHandle};

/// What a pump hands to its facade.
#[derive(Debug)]
pub(crate) enum PumpEvent {
    Channel(ChannelEvent),
    /// The pump fell behind the connection and `skipped` events were lost.
    /// Local state may be stale until it is refreshed from REST.
    Lagged { key: StreamKey, skipped: u64 },
}

struct PumpTask {
    connection_id: u64,
    task: JoinHandle<()>,
}

/// Keeps at most one running pump per stream key and connection.
#[derive(Default)]
pub(crate) struct PumpRegistry {
    tasks: Mutex<HashMap<StreamKey, PumpTask>>,
}

impl PumpRegistry {
    fn tasks(&self) -> MutexGuard<'_, HashMap<StreamKey, PumpTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forward every event of `handle` to `on_event`, in arrival order.
    ///
    /// A handle for a connection that already has a running pump is dropped.
    pub(crate) fn attach<F>(&self, handle: ChannelHandle, mut on_event: F)
    where
        F: FnMut(PumpEvent) + Send + 'static,
    {
        let mut tasks = self.tasks();
        if let Some(existing) = tasks.get(&handle.key)
            && existing.connection_id == handle.connection_id
            && !existing.task.is_finished()
        {
            return;
        }

        let ChannelHandle {
            key,
            connection_id,
            mut events,
        } = handle;
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => on_event(PumpEvent::Channel(event)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(key = %task_key, skipped, "push pump lagged behind");
                        on_event(PumpEvent::Lagged {
                            key: task_key.clone(),
                            skipped,
                        });
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(key = %task_key, connection_id, "push pump finished");
        });

        tasks.insert(key, PumpTask { connection_id, task });
    }

    /// Forget the pump for `key`; it ends by itself once its connection is released.
    pub(crate) fn detach(&self, key: &StreamKey) {
        self.tasks().remove(key);
    }

    pub(crate) fn abort_all(&self) {
        for (_, pump) in self.tasks().drain() {
            pump.task.abort();
        }
    }
}
