//! End-to-end flows from the telemetry client through the data manager onto
//! the event bus, with a scripted HTTP transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use embassy_futures::block_on;
use embassy_time::Duration;
use kwartiwi_core::config::MemoryConfigStore;
use kwartiwi_core::data_manager::{DataManager, DemandDataPoint};
use kwartiwi_core::event_bus::{DataEvent, Event, EventBase, EventBus, TelemetryEvent};
use kwartiwi_core::telemetry::http::HttpResponse;
use kwartiwi_core::telemetry::{
    ClientSettings, HttpTransport, LinkState, SyncState, TelemetryClient, TransportError,
    save_server_config,
};

const LIVE_BODY: &str = r#"{
    "timestamp": 1700000100,
    "electricityDeliveredTariff1": 1000.0,
    "electricityDeliveredTariff2": 2000.0,
    "electricityReturnedTariff1": 10.0,
    "electricityReturnedTariff2": 20.0,
    "currentAvgDemand": 2.25,
    "currentPowerUsage": 1.5,
    "currentPowerReturn": 0.0,
    "maxDemandMonth": {"timestamp": 1699990000, "demand": 5.0},
    "predictedPeak": 3.0,
    "predictedPeakTime": 1700000900
}"#;

#[derive(Default)]
struct ScriptedTransport {
    replies: VecDeque<Result<HttpResponse, TransportError>>,
}

impl ScriptedTransport {
    fn ok(mut self, body: &str) -> Self {
        self.replies.push_back(Ok(HttpResponse {
            status: 200,
            body: body.as_bytes().to_vec(),
        }));
        self
    }

    fn failing(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.replies.push_back(Err(TransportError::Connect));
        }
        self
    }
}

impl HttpTransport for ScriptedTransport {
    async fn get(&mut self, _host: &str, _path: &str) -> Result<HttpResponse, TransportError> {
        self.replies.pop_front().unwrap_or(Err(TransportError::Timeout))
    }
}

fn configured_store() -> MemoryConfigStore {
    let mut store = MemoryConfigStore::new();
    save_server_config(&mut store, "meter.local").unwrap();
    store
}

fn record(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for base in [EventBase::Telemetry, EventBase::Data] {
        let sink = seen.clone();
        block_on(bus.subscribe(base, move |e| sink.lock().unwrap().push(*e))).unwrap();
    }
    seen
}

fn fast() -> ClientSettings {
    ClientSettings {
        poll_interval: Duration::from_millis(1),
        retry_delay: Duration::from_millis(1),
    }
}

#[test]
fn test_history_sync_populates_store_once() {
    let bus = EventBus::new();
    let events = record(&bus);
    let data = DataManager::new(&bus);
    let transport = ScriptedTransport::default().ok(
        r#"{"maxDemandYear":[{"timestamp":1000,"demand":2.5}], "shortTermHistory":[{"timestamp":2000,"avgDemand":1.1}]}"#,
    );
    let mut client = TelemetryClient::new(transport, &data, &bus, &mut configured_store())
        .unwrap()
        .with_settings(fast());

    block_on(client.sync_history());
    block_on(bus.dispatch_pending());

    let yearly = block_on(data.yearly());
    assert_eq!(yearly.entries(), [DemandDataPoint::new(1000, 2.5)]);
    assert_eq!(
        block_on(data.get_recent_history(900)),
        [DemandDataPoint::new(2000, 1.1)]
    );
    let history_events = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| **e == Event::Data(DataEvent::HistoryAvailable))
        .count();
    assert_eq!(history_events, 1);
    assert_eq!(client.sync_state(), SyncState::Polling);
}

#[test]
fn test_five_failures_disconnect_then_recover() {
    let bus = EventBus::new();
    let events = record(&bus);
    let data = DataManager::new(&bus);
    let transport = ScriptedTransport::default()
        .ok(LIVE_BODY)
        .failing(5)
        .ok(LIVE_BODY);
    let mut client = TelemetryClient::new(transport, &data, &bus, &mut configured_store())
        .unwrap()
        .with_settings(fast());

    block_on(async {
        client.poll_once().await.unwrap();
        bus.dispatch_pending().await;
        for _ in 0..5 {
            assert!(client.poll_once().await.is_err());
            bus.dispatch_pending().await;
        }
        assert_eq!(client.link_state(), LinkState::Disconnected);
        client.poll_once().await.unwrap();
        bus.dispatch_pending().await;
    });

    let link_events: Vec<Event> = events
        .lock()
        .unwrap()
        .iter()
        .copied()
        .filter(|e| e.base() == EventBase::Telemetry)
        .collect();
    assert_eq!(
        link_events,
        [
            Event::Telemetry(TelemetryEvent::Connected),
            Event::Telemetry(TelemetryEvent::Disconnected),
            Event::Telemetry(TelemetryEvent::Connected),
        ]
    );
    assert_eq!(client.link_state(), LinkState::Connected);

    // Both successful polls appended the average demand at the meter timestamp
    assert_eq!(
        block_on(data.get_recent_history(10)),
        [
            DemandDataPoint::new(1_700_000_100, 2.25),
            DemandDataPoint::new(1_700_000_100, 2.25),
        ]
    );
    let snapshot = block_on(data.snapshot());
    assert_eq!(snapshot.predicted_peak, DemandDataPoint::new(1_700_000_900, 3.0));
    assert_eq!(snapshot.max_demand_month.demand, 5.0);
}
