//! Typed publish/subscribe notifications between the device subsystems
//!
//! Producers push [`Event`]s into a bounded channel. A single dispatcher
//! ([`EventBus::run`]) drains the channel in submission order and calls every
//! handler registered for the event's [`EventBase`], one after the other.
//! Publishing waits while the queue is full, so events are never dropped.
//!
//! ```ignore
//! static BUS: EventBus = EventBus::new();
//!
//! BUS.subscribe(EventBase::Data, |event| info!("data event: {:?}", event)).await?;
//! BUS.publish(Event::Data(DataEvent::SnapshotAvailable)).await;
//! ```

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex as AsyncMutex;
use log::{debug, error};
use thiserror_no_std::Error;

use alloc::boxed::Box;

/// Number of events that can be queued before publishers start waiting
pub const EVENT_QUEUE_CAPACITY: usize = 5;

/// Maximum number of handlers across all event bases
pub const MAX_HANDLERS: usize = 8;

/// Subsystem an event originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBase {
    Networking,
    Telemetry,
    Data,
}

/// Connectivity events published by [`crate::networking`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkingEvent {
    Initialized,
    Connected,
    Disconnected,
    ScanDone,
}

/// Events published by the telemetry client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    Initialized,
    Connected,
    Disconnected,
    /// Discovery finished; carries the number of servers found
    ServersFound(u8),
}

/// Change notifications from the data manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEvent {
    SnapshotAvailable,
    HistoryAvailable,
}

/// A notification carried over the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Networking(NetworkingEvent),
    Telemetry(TelemetryEvent),
    Data(DataEvent),
}

impl Event {
    /// The coarse subsystem this event belongs to
    pub fn base(&self) -> EventBase {
        match self {
            Event::Networking(_) => EventBase::Networking,
            Event::Telemetry(_) => EventBase::Telemetry,
            Event::Data(_) => EventBase::Data,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBusError {
    #[error("event queue is full")]
    QueueFull,
    #[error("handler table is full")]
    TooManyHandlers,
}

/// Handler invoked from the dispatcher context. Must not block for long.
pub type Handler = Box<dyn FnMut(&Event) + Send>;

struct Subscription {
    base: EventBase,
    handler: Handler,
}

/// Bounded, ordered event channel with per-base handler registration
pub struct EventBus {
    queue: Channel<CriticalSectionRawMutex, Event, EVENT_QUEUE_CAPACITY>,
    handlers: AsyncMutex<CriticalSectionRawMutex, heapless::Vec<Subscription, MAX_HANDLERS>>,
}

impl EventBus {
    pub const fn new() -> Self {
        Self {
            queue: Channel::new(),
            handlers: AsyncMutex::new(heapless::Vec::new()),
        }
    }

    /// Register a handler for every event of `base`.
    ///
    /// Handlers run in registration order. Calling this from inside a handler
    /// deadlocks the dispatcher.
    pub async fn subscribe<F>(&self, base: EventBase, handler: F) -> Result<(), EventBusError>
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let mut handlers = self.handlers.lock().await;
        handlers
            .push(Subscription {
                base,
                handler: Box::new(handler),
            })
            .map_err(|_| {
                error!("Event bus handler table full ({} entries)", MAX_HANDLERS);
                EventBusError::TooManyHandlers
            })
    }

    /// Queue an event, waiting for room if the queue is full
    pub async fn publish(&self, event: Event) {
        debug!("Publishing {:?}", event);
        self.queue.send(event).await;
    }

    /// Queue an event without waiting
    pub fn try_publish(&self, event: Event) -> Result<(), EventBusError> {
        self.queue
            .try_send(event)
            .map_err(|_| EventBusError::QueueFull)
    }

    /// Dispatcher loop. Run exactly one of these per bus.
    pub async fn run(&self) -> ! {
        loop {
            let event = self.queue.receive().await;
            self.dispatch(&event).await;
        }
    }

    /// Dispatch everything currently queued and return the number of events handled
    pub async fn dispatch_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.queue.try_receive() {
            self.dispatch(&event).await;
            count += 1;
        }
        count
    }

    async fn dispatch(&self, event: &Event) {
        let base = event.base();
        let mut handlers = self.handlers.lock().await;
        for subscription in handlers.iter_mut().filter(|s| s.base == base) {
            (subscription.handler)(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::task::Poll;
    use embassy_futures::{block_on, poll_once};
    use std::sync::{Arc, Mutex};

    fn recorder(bus: &EventBus, base: EventBase) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        block_on(bus.subscribe(base, move |event| sink.lock().unwrap().push(*event))).unwrap();
        seen
    }

    #[test]
    fn test_event_base() {
        assert_eq!(
            Event::Networking(NetworkingEvent::ScanDone).base(),
            EventBase::Networking
        );
        assert_eq!(
            Event::Telemetry(TelemetryEvent::ServersFound(3)).base(),
            EventBase::Telemetry
        );
        assert_eq!(
            Event::Data(DataEvent::HistoryAvailable).base(),
            EventBase::Data
        );
    }

    #[test]
    fn test_dispatch_in_publish_order() {
        let bus = EventBus::new();
        let data = recorder(&bus, EventBase::Data);

        block_on(async {
            bus.publish(Event::Data(DataEvent::HistoryAvailable)).await;
            bus.publish(Event::Data(DataEvent::SnapshotAvailable)).await;
            bus.publish(Event::Data(DataEvent::HistoryAvailable)).await;
            assert_eq!(bus.dispatch_pending().await, 3);
        });

        assert_eq!(
            *data.lock().unwrap(),
            [
                Event::Data(DataEvent::HistoryAvailable),
                Event::Data(DataEvent::SnapshotAvailable),
                Event::Data(DataEvent::HistoryAvailable),
            ]
        );
    }

    #[test]
    fn test_handlers_only_see_their_base() {
        let bus = EventBus::new();
        let networking = recorder(&bus, EventBase::Networking);
        let telemetry = recorder(&bus, EventBase::Telemetry);

        block_on(async {
            bus.publish(Event::Networking(NetworkingEvent::Connected)).await;
            bus.publish(Event::Telemetry(TelemetryEvent::ServersFound(2)))
                .await;
            bus.dispatch_pending().await;
        });

        assert_eq!(
            *networking.lock().unwrap(),
            [Event::Networking(NetworkingEvent::Connected)]
        );
        assert_eq!(
            *telemetry.lock().unwrap(),
            [Event::Telemetry(TelemetryEvent::ServersFound(2))]
        );
    }

    #[test]
    fn test_multiple_handlers_per_base() {
        let bus = EventBus::new();
        let first = recorder(&bus, EventBase::Data);
        let second = recorder(&bus, EventBase::Data);

        block_on(async {
            bus.publish(Event::Data(DataEvent::SnapshotAvailable)).await;
            bus.dispatch_pending().await;
        });

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_full_queue_applies_backpressure() {
        let bus = EventBus::new();
        for _ in 0..EVENT_QUEUE_CAPACITY {
            bus.try_publish(Event::Data(DataEvent::SnapshotAvailable))
                .unwrap();
        }

        assert_eq!(
            bus.try_publish(Event::Data(DataEvent::SnapshotAvailable)),
            Err(EventBusError::QueueFull)
        );
        assert!(matches!(
            poll_once(bus.publish(Event::Data(DataEvent::HistoryAvailable))),
            Poll::Pending
        ));

        let handled = block_on(bus.dispatch_pending());
        assert_eq!(handled, EVENT_QUEUE_CAPACITY);
        assert!(bus
            .try_publish(Event::Data(DataEvent::HistoryAvailable))
            .is_ok());
    }

    #[test]
    fn test_handler_table_limit() {
        let bus = EventBus::new();
        block_on(async {
            for _ in 0..MAX_HANDLERS {
                bus.subscribe(EventBase::Data, |_| {}).await.unwrap();
            }
            assert_eq!(
                bus.subscribe(EventBase::Data, |_| {}).await,
                Err(EventBusError::TooManyHandlers)
            );
        });
    }
}
