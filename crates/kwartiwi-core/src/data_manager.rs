//! Canonical meter snapshot and demand history
//!
//! The [`DataManager`] owns the latest [`MeterSnapshot`], the trailing
//! 13-month [`YearlyDemandTable`] and the 15-minute [`ShortTermHistory`]
//! ring buffer. All of it lives behind one async mutex, so a writer never
//! interleaves with a reader, and every mutation is announced on the
//! [`EventBus`] once the lock has been released.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use log::debug;

use crate::event_bus::{DataEvent, Event, EventBus};

extern crate alloc;
use alloc::vec::Vec;

/// Unix timestamp in seconds. Zero marks an unwritten history slot.
pub type Timestamp = i64;

/// Number of months in the yearly peak table
pub const YEARLY_DEMAND_ITEMS: usize = 13;

/// One slot per second for a 15-minute quarter-hour window
pub const SHORT_TERM_HISTORY_ITEMS: usize = 60 * 15;

/// A demand reading at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DemandDataPoint {
    pub timestamp: Timestamp,
    /// Average demand in kW
    pub demand: f32,
}

impl DemandDataPoint {
    pub const fn new(timestamp: Timestamp, demand: f32) -> Self {
        Self { timestamp, demand }
    }

    /// True for slots that were never written
    pub fn is_sentinel(&self) -> bool {
        self.timestamp == 0
    }
}

/// Latest values reported by the meter
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeterSnapshot {
    pub p1_timestamp: Timestamp,
    pub electricity_delivered_tariff1: f32,
    pub electricity_delivered_tariff2: f32,
    pub electricity_returned_tariff1: f32,
    pub electricity_returned_tariff2: f32,
    pub current_avg_demand: f32,
    pub current_power_usage: f32,
    pub current_power_return: f32,
    pub active_tariff: u8,
    pub max_demand_month: DemandDataPoint,
    pub predicted_peak: DemandDataPoint,
}

/// Selects one field of the [`MeterSnapshot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    P1Timestamp,
    ElectricityDeliveredTariff1,
    ElectricityDeliveredTariff2,
    ElectricityReturnedTariff1,
    ElectricityReturnedTariff2,
    CurrentAvgDemand,
    CurrentPowerUsage,
    CurrentPowerReturn,
    ActiveTariff,
    MaxDemandMonth,
    PredictedPeak,
}

/// A typed value for one snapshot field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    P1Timestamp(Timestamp),
    ElectricityDeliveredTariff1(f32),
    ElectricityDeliveredTariff2(f32),
    ElectricityReturnedTariff1(f32),
    ElectricityReturnedTariff2(f32),
    CurrentAvgDemand(f32),
    CurrentPowerUsage(f32),
    CurrentPowerReturn(f32),
    ActiveTariff(u8),
    MaxDemandMonth(DemandDataPoint),
    PredictedPeak(DemandDataPoint),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::P1Timestamp(_) => FieldKind::P1Timestamp,
            FieldValue::ElectricityDeliveredTariff1(_) => FieldKind::ElectricityDeliveredTariff1,
            FieldValue::ElectricityDeliveredTariff2(_) => FieldKind::ElectricityDeliveredTariff2,
            FieldValue::ElectricityReturnedTariff1(_) => FieldKind::ElectricityReturnedTariff1,
            FieldValue::ElectricityReturnedTariff2(_) => FieldKind::ElectricityReturnedTariff2,
            FieldValue::CurrentAvgDemand(_) => FieldKind::CurrentAvgDemand,
            FieldValue::CurrentPowerUsage(_) => FieldKind::CurrentPowerUsage,
            FieldValue::CurrentPowerReturn(_) => FieldKind::CurrentPowerReturn,
            FieldValue::ActiveTariff(_) => FieldKind::ActiveTariff,
            FieldValue::MaxDemandMonth(_) => FieldKind::MaxDemandMonth,
            FieldValue::PredictedPeak(_) => FieldKind::PredictedPeak,
        }
    }
}

impl MeterSnapshot {
    pub fn field(&self, kind: FieldKind) -> FieldValue {
        match kind {
            FieldKind::P1Timestamp => FieldValue::P1Timestamp(self.p1_timestamp),
            FieldKind::ElectricityDeliveredTariff1 => {
                FieldValue::ElectricityDeliveredTariff1(self.electricity_delivered_tariff1)
            }
            FieldKind::ElectricityDeliveredTariff2 => {
                FieldValue::ElectricityDeliveredTariff2(self.electricity_delivered_tariff2)
            }
            FieldKind::ElectricityReturnedTariff1 => {
                FieldValue::ElectricityReturnedTariff1(self.electricity_returned_tariff1)
            }
            FieldKind::ElectricityReturnedTariff2 => {
                FieldValue::ElectricityReturnedTariff2(self.electricity_returned_tariff2)
            }
            FieldKind::CurrentAvgDemand => FieldValue::CurrentAvgDemand(self.current_avg_demand),
            FieldKind::CurrentPowerUsage => FieldValue::CurrentPowerUsage(self.current_power_usage),
            FieldKind::CurrentPowerReturn => {
                FieldValue::CurrentPowerReturn(self.current_power_return)
            }
            FieldKind::ActiveTariff => FieldValue::ActiveTariff(self.active_tariff),
            FieldKind::MaxDemandMonth => FieldValue::MaxDemandMonth(self.max_demand_month),
            FieldKind::PredictedPeak => FieldValue::PredictedPeak(self.predicted_peak),
        }
    }

    pub fn apply(&mut self, value: FieldValue) {
        match value {
            FieldValue::P1Timestamp(v) => self.p1_timestamp = v,
            FieldValue::ElectricityDeliveredTariff1(v) => self.electricity_delivered_tariff1 = v,
            FieldValue::ElectricityDeliveredTariff2(v) => self.electricity_delivered_tariff2 = v,
            FieldValue::ElectricityReturnedTariff1(v) => self.electricity_returned_tariff1 = v,
            FieldValue::ElectricityReturnedTariff2(v) => self.electricity_returned_tariff2 = v,
            FieldValue::CurrentAvgDemand(v) => self.current_avg_demand = v,
            FieldValue::CurrentPowerUsage(v) => self.current_power_usage = v,
            FieldValue::CurrentPowerReturn(v) => self.current_power_return = v,
            FieldValue::ActiveTariff(v) => self.active_tariff = v,
            FieldValue::MaxDemandMonth(v) => self.max_demand_month = v,
            FieldValue::PredictedPeak(v) => self.predicted_peak = v,
        }
    }
}

/// Peak demand per trailing month, newest data replaces the whole table
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct YearlyDemandTable {
    entries: [DemandDataPoint; YEARLY_DEMAND_ITEMS],
    len: usize,
}

impl YearlyDemandTable {
    pub const fn new() -> Self {
        Self {
            entries: [DemandDataPoint::new(0, 0.0); YEARLY_DEMAND_ITEMS],
            len: 0,
        }
    }

    /// Append an entry, handing it back when the table is full
    pub fn push(&mut self, point: DemandDataPoint) -> Result<(), DemandDataPoint> {
        if self.len == YEARLY_DEMAND_ITEMS {
            return Err(point);
        }
        self.entries[self.len] = point;
        self.len += 1;
        Ok(())
    }

    pub fn entries(&self) -> &[DemandDataPoint] {
        &self.entries[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Fixed-capacity ring of demand samples.
///
/// Every insert lands on the write cursor and advances it modulo `N`, so once
/// the ring is full the oldest sample is overwritten. Unwritten slots keep a
/// zero timestamp.
#[derive(Debug, Clone)]
pub struct DemandRing<const N: usize> {
    slots: [DemandDataPoint; N],
    cursor: usize,
}

/// The 900-slot ring backing the 15-minute demand chart
pub type ShortTermHistory = DemandRing<SHORT_TERM_HISTORY_ITEMS>;

impl<const N: usize> DemandRing<N> {
    pub const fn new() -> Self {
        Self {
            slots: [DemandDataPoint::new(0, 0.0); N],
            cursor: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Index the next sample will be written to
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn push(&mut self, point: DemandDataPoint) {
        self.slots[self.cursor] = point;
        self.cursor = (self.cursor + 1) % N;
    }

    /// Drop every sample and rewind the cursor
    pub fn clear(&mut self) {
        self.slots = [DemandDataPoint::default(); N];
        self.cursor = 0;
    }

    /// Up to `max_items` samples, oldest first, ending at the newest one
    pub fn recent(&self, max_items: usize) -> Vec<DemandDataPoint> {
        let mut count = max_items.min(N);
        if count == 0 {
            return Vec::new();
        }

        // Normalized so the start index never goes negative
        let mut start = (self.cursor + N - count) % N;
        while count > 0 && self.slots[start].is_sentinel() {
            start = (start + 1) % N;
            count -= 1;
        }

        (0..count)
            .map(|offset| self.slots[(start + offset) % N])
            .filter(|point| !point.is_sentinel())
            .collect()
    }
}

impl<const N: usize> Default for DemandRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

struct MeterStore {
    snapshot: MeterSnapshot,
    yearly: YearlyDemandTable,
    short_term: ShortTermHistory,
}

/// Owner of the meter snapshot and history.
///
/// Every operation holds the single store lock for its whole duration and is
/// not reentrant. Lock waits are unbounded.
pub struct DataManager<'a> {
    store: AsyncMutex<CriticalSectionRawMutex, MeterStore>,
    bus: &'a EventBus,
}

impl<'a> DataManager<'a> {
    pub const fn new(bus: &'a EventBus) -> Self {
        Self {
            store: AsyncMutex::new(MeterStore {
                snapshot: MeterSnapshot {
                    p1_timestamp: 0,
                    electricity_delivered_tariff1: 0.0,
                    electricity_delivered_tariff2: 0.0,
                    electricity_returned_tariff1: 0.0,
                    electricity_returned_tariff2: 0.0,
                    current_avg_demand: 0.0,
                    current_power_usage: 0.0,
                    current_power_return: 0.0,
                    active_tariff: 0,
                    max_demand_month: DemandDataPoint::new(0, 0.0),
                    predicted_peak: DemandDataPoint::new(0, 0.0),
                },
                yearly: YearlyDemandTable::new(),
                short_term: ShortTermHistory::new(),
            }),
            bus,
        }
    }

    pub async fn get_field(&self, kind: FieldKind) -> FieldValue {
        self.store.lock().await.snapshot.field(kind)
    }

    /// Store one field and announce [`DataEvent::SnapshotAvailable`]
    pub async fn set_field(&self, value: FieldValue) {
        self.store.lock().await.snapshot.apply(value);
        self.announce_snapshot().await;
    }

    /// Copy of the whole snapshot
    pub async fn snapshot(&self) -> MeterSnapshot {
        self.store.lock().await.snapshot
    }

    /// Copy of the yearly peak table
    pub async fn yearly(&self) -> YearlyDemandTable {
        self.store.lock().await.yearly
    }

    /// Append a sample to the short-term ring and announce
    /// [`DataEvent::HistoryAvailable`]
    pub async fn add_history_sample(&self, demand: f32, timestamp: Timestamp) {
        self.store
            .lock()
            .await
            .short_term
            .push(DemandDataPoint::new(timestamp, demand));
        self.announce_history().await;
    }

    /// Up to `max_items` short-term samples, oldest first
    pub async fn get_recent_history(&self, max_items: usize) -> Vec<DemandDataPoint> {
        self.store.lock().await.short_term.recent(max_items)
    }

    /// Apply a batch of decoded fields and an optional history sample under one
    /// lock acquisition. Does not announce.
    pub async fn apply_live_update(&self, fields: &[FieldValue], sample: Option<DemandDataPoint>) {
        let mut store = self.store.lock().await;
        for value in fields {
            store.snapshot.apply(*value);
        }
        if let Some(point) = sample {
            store.short_term.push(point);
        }
        debug!(
            "Applied {} fields{}",
            fields.len(),
            if sample.is_some() { " and a history sample" } else { "" }
        );
    }

    /// Replace the yearly table and the short-term ring wholesale. Does not
    /// announce.
    ///
    /// Samples beyond the ring capacity are ignored; the cursor ends up right
    /// after the last sample written.
    pub async fn replace_history(&self, yearly: YearlyDemandTable, short_term: &[DemandDataPoint]) {
        let mut store = self.store.lock().await;
        store.yearly = yearly;
        store.short_term.clear();
        for point in short_term.iter().take(SHORT_TERM_HISTORY_ITEMS) {
            store.short_term.push(*point);
        }
        debug!(
            "History replaced: {} yearly, {} short-term entries",
            yearly.len(),
            short_term.len().min(SHORT_TERM_HISTORY_ITEMS)
        );
    }

    pub async fn announce_snapshot(&self) {
        self.bus.publish(Event::Data(DataEvent::SnapshotAvailable)).await;
    }

    pub async fn announce_history(&self) {
        self.bus.publish(Event::Data(DataEvent::HistoryAvailable)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    fn timestamps(points: &[DemandDataPoint]) -> Vec<Timestamp> {
        points.iter().map(|p| p.timestamp).collect()
    }

    #[test]
    fn test_recent_on_empty_ring() {
        let ring = DemandRing::<8>::new();
        assert!(ring.recent(8).is_empty());
        assert!(ring.recent(0).is_empty());
    }

    #[test]
    fn test_recent_before_wrap_skips_unwritten_slots() {
        let mut ring = DemandRing::<8>::new();
        for t in 1..=3 {
            ring.push(DemandDataPoint::new(t, t as f32));
        }

        assert_eq!(timestamps(&ring.recent(8)), [1, 2, 3]);
        assert_eq!(timestamps(&ring.recent(2)), [2, 3]);
        assert_eq!(timestamps(&ring.recent(100)), [1, 2, 3]);
    }

    #[test]
    fn test_recent_after_wrap_is_chronological() {
        let mut ring = DemandRing::<4>::new();
        for t in 1..=6 {
            ring.push(DemandDataPoint::new(t, 0.5));
        }

        assert_eq!(ring.cursor(), 2);
        assert_eq!(timestamps(&ring.recent(4)), [3, 4, 5, 6]);
        assert_eq!(timestamps(&ring.recent(3)), [4, 5, 6]);
    }

    #[test]
    fn test_full_ring_drops_oldest() {
        let mut ring = ShortTermHistory::new();
        for t in 1..=(SHORT_TERM_HISTORY_ITEMS as Timestamp + 10) {
            ring.push(DemandDataPoint::new(t, 1.0));
        }

        let recent = ring.recent(SHORT_TERM_HISTORY_ITEMS);
        assert_eq!(recent.len(), SHORT_TERM_HISTORY_ITEMS);
        assert_eq!(recent.first().map(|p| p.timestamp), Some(11));
        assert_eq!(
            recent.last().map(|p| p.timestamp),
            Some(SHORT_TERM_HISTORY_ITEMS as Timestamp + 10)
        );
        assert!(recent.iter().all(|p| p.timestamp > 10));
    }

    #[test]
    fn test_recent_is_ordered_and_bounded_for_any_fill_level() {
        for inserts in 0..20 {
            let mut ring = DemandRing::<7>::new();
            for t in 1..=inserts {
                ring.push(DemandDataPoint::new(t, 0.0));
            }
            for max_items in 0..10 {
                let recent = ring.recent(max_items);
                assert!(recent.len() <= max_items);
                assert!(recent.len() <= inserts as usize);
                assert!(recent.iter().all(|p| !p.is_sentinel()));
                assert!(recent.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
                if let Some(last) = recent.last() {
                    assert_eq!(last.timestamp, inserts);
                }
            }
        }
    }

    #[test]
    fn test_yearly_table_capacity() {
        let mut table = YearlyDemandTable::new();
        for month in 0..YEARLY_DEMAND_ITEMS {
            assert!(table.push(DemandDataPoint::new(month as Timestamp + 1, 2.0)).is_ok());
        }
        assert!(table.push(DemandDataPoint::new(99, 1.0)).is_err());
        assert_eq!(table.len(), YEARLY_DEMAND_ITEMS);
    }

    #[test]
    fn test_set_and_get_field() {
        let bus = EventBus::new();
        let manager = DataManager::new(&bus);

        block_on(async {
            manager
                .set_field(FieldValue::CurrentAvgDemand(2.75))
                .await;
            manager
                .set_field(FieldValue::MaxDemandMonth(DemandDataPoint::new(1_700_000_000, 4.2)))
                .await;

            assert_eq!(
                manager.get_field(FieldKind::CurrentAvgDemand).await,
                FieldValue::CurrentAvgDemand(2.75)
            );
            assert_eq!(
                manager.get_field(FieldKind::MaxDemandMonth).await,
                FieldValue::MaxDemandMonth(DemandDataPoint::new(1_700_000_000, 4.2))
            );
            assert_eq!(
                manager.get_field(FieldKind::ActiveTariff).await,
                FieldValue::ActiveTariff(0)
            );
        });
    }

    #[test]
    fn test_field_kind_matches_value() {
        let mut snapshot = MeterSnapshot::default();
        let value = FieldValue::ElectricityReturnedTariff2(123.5);
        snapshot.apply(value);
        assert_eq!(snapshot.field(value.kind()), value);
    }

    #[test]
    fn test_mutations_announce_on_bus() {
        use crate::event_bus::EventBase;
        use std::sync::{Arc, Mutex};

        let bus = EventBus::new();
        let manager = DataManager::new(&bus);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        block_on(async {
            bus.subscribe(EventBase::Data, move |e| sink.lock().unwrap().push(*e))
                .await
                .unwrap();
            manager.set_field(FieldValue::P1Timestamp(10)).await;
            manager.add_history_sample(1.5, 10).await;
            manager.apply_live_update(&[FieldValue::CurrentPowerUsage(0.4)], None).await;
            bus.dispatch_pending().await;
        });

        assert_eq!(
            *seen.lock().unwrap(),
            [
                Event::Data(DataEvent::SnapshotAvailable),
                Event::Data(DataEvent::HistoryAvailable),
            ]
        );
    }

    #[test]
    fn test_replace_history_resets_ring() {
        let bus = EventBus::new();
        let manager = DataManager::new(&bus);

        block_on(async {
            for t in 1..=5 {
                manager.add_history_sample(0.1, t).await;
                bus.dispatch_pending().await;
            }

            let mut yearly = YearlyDemandTable::new();
            yearly.push(DemandDataPoint::new(1000, 2.5)).unwrap();
            manager
                .replace_history(
                    yearly,
                    &[DemandDataPoint::new(2000, 1.1), DemandDataPoint::new(2001, 1.2)],
                )
                .await;
            manager.add_history_sample(1.3, 2002).await;

            assert_eq!(timestamps(&manager.get_recent_history(10).await), [2000, 2001, 2002]);
            assert_eq!(manager.yearly().await.entries(), yearly.entries());
        });
    }
}
