//! Fan-out of received broker messages
//!
//! Every message whose topic yields a device id is delivered to the
//! registered observers, synchronous ones first, then asynchronous ones in
//! registration order. Device-data topics are additionally handed to the
//! [`DeviceDataHandler`]. An observer failure is logged and does not stop
//! delivery to the others.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, error, instrument, warn};

use crate::broker::InboundMessage;
use crate::topic::{extract_device_id, is_device_data_topic};

/// Handle returned on registration, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub type SyncObserver = Arc<dyn Fn(&InboundMessage) -> anyhow::Result<()> + Send + Sync>;

#[async_trait]
pub trait MessageObserver: Send + Sync {
    async fn on_message(&self, message: &InboundMessage) -> anyhow::Result<()>;
}

/// Consumer of device telemetry (`devices/{deviceId}/data`)
#[async_trait]
pub trait DeviceDataHandler: Send + Sync {
    async fn handle_device_data(&self, device_id: &str, message: &InboundMessage);
}

/// What happened to a dispatched message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Topic carried no device id
    Dropped,

    /// Delivered to observers only
    Observed,

    /// Delivered to observers and the device-data handler
    Processed,
}

#[derive(Default)]
pub struct MessageDispatcher {
    next_id: AtomicU64,
    sync_observers: RwLock<Vec<(ObserverId, SyncObserver)>>,
    async_observers: RwLock<Vec<(ObserverId, Arc<dyn MessageObserver>)>>,
    device_data: Option<Arc<dyn DeviceDataHandler>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device_data_handler(mut self, handler: Arc<dyn DeviceDataHandler>) -> Self {
        self.device_data = Some(handler);
        self
    }

    fn next_id(&self) -> ObserverId {
        ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&InboundMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.sync_observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        debug!("registered synchronous observer {id:?}");
        id
    }

    pub fn subscribe_async(&self, observer: Arc<dyn MessageObserver>) -> ObserverId {
        let id = self.next_id();
        self.async_observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        debug!("registered asynchronous observer {id:?}");
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut removed = false;

        let mut sync_observers = self.sync_observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = sync_observers.len();
        sync_observers.retain(|(observer_id, _)| *observer_id != id);
        removed |= sync_observers.len() != before;
        drop(sync_observers);

        let mut async_observers = self.async_observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = async_observers.len();
        async_observers.retain(|(observer_id, _)| *observer_id != id);
        removed |= async_observers.len() != before;

        removed
    }

    pub fn observer_count(&self) -> usize {
        self.sync_observers.read().unwrap_or_else(PoisonError::into_inner).len()
            + self.async_observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[instrument(skip_all, fields(topic = %message.topic))]
    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        debug!(
            "Received message on topic {}: {}",
            message.topic,
            message.payload_str()
        );

        let Some(device_id) = extract_device_id(&message.topic) else {
            warn!("Could not extract device ID from topic: {}", message.topic);
            return DispatchOutcome::Dropped;
        };

        // snapshot so observers may (un)register from inside a callback
        let sync_observers: Vec<_> = self
            .sync_observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let async_observers: Vec<_> = self
            .async_observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, observer) in sync_observers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| observer(&message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Observer {id:?} failed for device {device_id}: {e:#}"),
                Err(_) => error!("Observer {id:?} panicked for device {device_id}"),
            }
        }

        for (id, observer) in async_observers {
            if let Err(e) = observer.on_message(&message).await {
                error!("Async observer {id:?} failed for device {device_id}: {e:#}");
            }
        }

        if !is_device_data_topic(&message.topic) {
            return DispatchOutcome::Observed;
        }

        match &self.device_data {
            Some(handler) => {
                handler.handle_device_data(device_id, &message).await;
                DispatchOutcome::Processed
            }
            None => DispatchOutcome::Observed,
        }
    }
}
