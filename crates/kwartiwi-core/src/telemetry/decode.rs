//! JSON payloads of the meter-data API
//!
//! Decoding is lenient: every field that is present and well-typed is
//! returned even when siblings are missing or malformed. The number of
//! rejected fields or entries is reported separately so the caller can both
//! apply the good data and treat the request as failed.

use log::warn;
use serde_json::{Map, Value};
use thiserror_no_std::Error;

use crate::data_manager::{
    DemandDataPoint, FieldValue, SHORT_TERM_HISTORY_ITEMS, Timestamp, YearlyDemandTable,
};

extern crate alloc;
use alloc::vec::Vec;

pub const LIVE_PATH: &str = "/api/meter-data";
pub const HISTORY_PATH: &str = "/api/meter-data-history";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Response body is not a JSON object")]
    Malformed,
    #[error("{0} fields or entries could not be decoded")]
    Rejected(usize),
}

/// Decoded `/api/meter-data` response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveUpdate {
    pub fields: Vec<FieldValue>,
    /// Current average demand at the meter timestamp
    pub history_sample: Option<DemandDataPoint>,
    pub rejected: usize,
}

/// Decoded `/api/meter-data-history` response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryUpdate {
    pub yearly: YearlyDemandTable,
    pub short_term: Vec<DemandDataPoint>,
    pub rejected: usize,
}

pub fn decode_live(body: &[u8]) -> Result<LiveUpdate, DecodeError> {
    let root = parse_object(body)?;
    let mut update = LiveUpdate::default();

    let timestamp = root.get("timestamp").and_then(as_timestamp);
    match timestamp {
        Some(ts) => update.fields.push(FieldValue::P1Timestamp(ts)),
        None => update.reject("timestamp"),
    }

    let floats: [(&str, fn(f32) -> FieldValue); 7] = [
        ("electricityDeliveredTariff1", FieldValue::ElectricityDeliveredTariff1),
        ("electricityDeliveredTariff2", FieldValue::ElectricityDeliveredTariff2),
        ("electricityReturnedTariff1", FieldValue::ElectricityReturnedTariff1),
        ("electricityReturnedTariff2", FieldValue::ElectricityReturnedTariff2),
        ("currentAvgDemand", FieldValue::CurrentAvgDemand),
        ("currentPowerUsage", FieldValue::CurrentPowerUsage),
        ("currentPowerReturn", FieldValue::CurrentPowerReturn),
    ];
    for (key, field) in floats {
        match root.get(key).and_then(as_f32) {
            Some(value) => update.fields.push(field(value)),
            None => update.reject(key),
        }
    }

    // The average demand doubles as a short-term history sample
    if let (Some(ts), Some(FieldValue::CurrentAvgDemand(demand))) = (
        timestamp,
        update
            .fields
            .iter()
            .find(|f| matches!(f, FieldValue::CurrentAvgDemand(_))),
    ) {
        update.history_sample = Some(DemandDataPoint::new(ts, *demand));
    }

    match root.get("maxDemandMonth").and_then(|v| demand_point(v, "demand")) {
        Some(point) => update.fields.push(FieldValue::MaxDemandMonth(point)),
        None => update.reject("maxDemandMonth"),
    }

    let peak = root.get("predictedPeak").and_then(as_f32);
    if peak.is_none() {
        update.reject("predictedPeak");
    }
    let peak_time = root.get("predictedPeakTime").and_then(as_timestamp);
    if peak_time.is_none() {
        update.reject("predictedPeakTime");
    }
    if let (Some(demand), Some(ts)) = (peak, peak_time) {
        update
            .fields
            .push(FieldValue::PredictedPeak(DemandDataPoint::new(ts, demand)));
    }

    Ok(update)
}

pub fn decode_history(body: &[u8]) -> Result<HistoryUpdate, DecodeError> {
    let root = parse_object(body)?;
    let mut update = HistoryUpdate::default();

    match root.get("maxDemandYear").and_then(Value::as_array) {
        Some(entries) => {
            for entry in entries {
                let pushed = demand_point(entry, "demand")
                    .map(|point| update.yearly.push(point).is_ok())
                    .unwrap_or(false);
                if !pushed {
                    update.reject("maxDemandYear");
                }
            }
        }
        None => update.reject("maxDemandYear"),
    }

    match root.get("shortTermHistory").and_then(Value::as_array) {
        Some(entries) => {
            for entry in entries {
                match demand_point(entry, "avgDemand") {
                    Some(point) if update.short_term.len() < SHORT_TERM_HISTORY_ITEMS => {
                        update.short_term.push(point)
                    }
                    _ => update.reject("shortTermHistory"),
                }
            }
        }
        None => update.reject("shortTermHistory"),
    }

    Ok(update)
}

impl LiveUpdate {
    fn reject(&mut self, key: &str) {
        warn!("Failed to parse {}", key);
        self.rejected += 1;
    }
}

impl HistoryUpdate {
    fn reject(&mut self, key: &str) {
        warn!("Failed to parse {} entry", key);
        self.rejected += 1;
    }
}

// ============================================================================
// Value helpers
// ============================================================================

fn parse_object(body: &[u8]) -> Result<Map<alloc::string::String, Value>, DecodeError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(DecodeError::Malformed),
    }
}

fn as_timestamp(value: &Value) -> Option<Timestamp> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as Timestamp))
}

fn as_f32(value: &Value) -> Option<f32> {
    value.as_f64().map(|f| f as f32)
}

/// `{"timestamp": .., "<demand_key>": ..}`
fn demand_point(value: &Value, demand_key: &str) -> Option<DemandDataPoint> {
    let timestamp = value.get("timestamp").and_then(as_timestamp)?;
    let demand = value.get(demand_key).and_then(as_f32)?;
    Some(DemandDataPoint::new(timestamp, demand))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE: &str = r#"{
        "timestamp": 1700000000,
        "electricityDeliveredTariff1": 1234.5,
        "electricityDeliveredTariff2": 2345.5,
        "electricityReturnedTariff1": 12.25,
        "electricityReturnedTariff2": 0,
        "currentAvgDemand": 1.75,
        "currentPowerUsage": 0.5,
        "currentPowerReturn": 0.0,
        "maxDemandMonth": {"timestamp": 1699000000, "demand": 4.5},
        "predictedPeak": 2.5,
        "predictedPeakTime": 1700000900
    }"#;

    #[test]
    fn test_live_complete() {
        let update = decode_live(LIVE.as_bytes()).unwrap();
        assert_eq!(update.rejected, 0);
        assert_eq!(update.fields.len(), 10);
        assert_eq!(update.fields[0], FieldValue::P1Timestamp(1_700_000_000));
        assert!(update.fields.contains(&FieldValue::ElectricityReturnedTariff2(0.0)));
        assert!(update.fields.contains(&FieldValue::MaxDemandMonth(DemandDataPoint::new(
            1_699_000_000,
            4.5
        ))));
        assert!(update.fields.contains(&FieldValue::PredictedPeak(DemandDataPoint::new(
            1_700_000_900,
            2.5
        ))));
        assert_eq!(
            update.history_sample,
            Some(DemandDataPoint::new(1_700_000_000, 1.75))
        );
    }

    #[test]
    fn test_live_partial_keeps_good_fields() {
        let body = br#"{"timestamp": 10, "currentPowerUsage": "high", "predictedPeak": 3.0}"#;
        let update = decode_live(body).unwrap();

        assert_eq!(update.fields, [FieldValue::P1Timestamp(10)]);
        // 7 floats missing or mistyped, maxDemandMonth, predictedPeakTime
        assert_eq!(update.rejected, 9);
        assert_eq!(update.history_sample, None);
    }

    #[test]
    fn test_live_sample_needs_timestamp() {
        let body = br#"{"currentAvgDemand": 1.5}"#;
        let update = decode_live(body).unwrap();
        assert!(update.fields.contains(&FieldValue::CurrentAvgDemand(1.5)));
        assert_eq!(update.history_sample, None);
    }

    #[test]
    fn test_malformed_body() {
        assert_eq!(decode_live(b"not json"), Err(DecodeError::Malformed));
        assert_eq!(decode_history(b"[1, 2]"), Err(DecodeError::Malformed));
    }

    #[test]
    fn test_history_minimal() {
        let body = br#"{"maxDemandYear":[{"timestamp":1000,"demand":2.5}],"shortTermHistory":[{"timestamp":2000,"avgDemand":1.1}]}"#;
        let update = decode_history(body).unwrap();

        assert_eq!(update.rejected, 0);
        assert_eq!(update.yearly.entries(), [DemandDataPoint::new(1000, 2.5)]);
        assert_eq!(update.short_term, [DemandDataPoint::new(2000, 1.1)]);
    }

    #[test]
    fn test_history_excess_and_bad_entries() {
        let yearly: Vec<String> = (1..=15)
            .map(|i| format!(r#"{{"timestamp":{i},"demand":1.0}}"#))
            .collect();
        let body = format!(
            r#"{{"maxDemandYear":[{}],"shortTermHistory":[{{"timestamp":5}},{{"timestamp":6,"avgDemand":0.5}}]}}"#,
            yearly.join(",")
        );

        let update = decode_history(body.as_bytes()).unwrap();
        assert_eq!(update.yearly.len(), 13);
        assert_eq!(update.short_term, [DemandDataPoint::new(6, 0.5)]);
        assert_eq!(update.rejected, 3);
    }

    #[test]
    fn test_history_missing_arrays() {
        let update = decode_history(b"{}").unwrap();
        assert!(update.yearly.is_empty());
        assert!(update.short_term.is_empty());
        assert_eq!(update.rejected, 2);
    }
}
