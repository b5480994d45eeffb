use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identifies one partition of the inbound feed.
pub type PartitionId = u32;

/// Position of a record within a feed partition. Offsets are dense and start at zero.
pub type Offset = u64;

pub const BROOK_CONFIG_ENV_PREFIX: &str = "BROOK__";

pub fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

pub fn to_micros(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap().as_micros() as u64
}

pub fn from_millis(ts: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ts)
}

pub fn from_micros(ts: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(ts)
}

pub fn to_nanos(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH).unwrap().as_nanos()
}

pub fn from_nanos(ts: u128) -> SystemTime {
    UNIX_EPOCH
        + Duration::from_secs((ts / 1_000_000_000) as u64)
        + Duration::from_nanos((ts % 1_000_000_000) as u64)
}

/// Latest accepted event time, 9999-12-31T23:59:59.999Z.
pub const MAX_EVENT_TIMESTAMP_MILLIS: u64 = 253_402_300_799_999;

/// Formats a timestamp for log output.
pub fn print_time(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

/// Serializes a [SystemTime] as milliseconds since the epoch.
pub mod serde_millis {
    use super::{from_millis, to_millis};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(to_millis(*time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SystemTime, D::Error> {
        Ok(from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Copy, Hash, Debug, Clone, Eq, PartialEq, Encode, Decode, PartialOrd, Ord)]
pub struct Window {
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

impl Window {
    pub fn new(start_time: SystemTime, end_time: SystemTime) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    /// Windows are half-open: `[start_time, end_time)`.
    pub fn contains(&self, t: SystemTime) -> bool {
        self.start_time <= t && t < self.end_time
    }
}

impl Display for Window {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            to_millis(self.start_time),
            to_millis(self.end_time)
        )
    }
}

/// The identity of a single piece of window state: a grouping key (the user id) and the window
/// it is being aggregated over.
#[derive(Clone, Hash, Debug, Eq, PartialEq, Encode, Decode, PartialOrd, Ord)]
pub struct WindowKey {
    pub key: String,
    pub window: Window,
}

impl WindowKey {
    pub fn new(key: impl Into<String>, window: Window) -> Self {
        Self {
            key: key.into(),
            window,
        }
    }

    pub fn window_start(&self) -> SystemTime {
        self.window.start_time
    }

    pub fn window_end(&self) -> SystemTime {
        self.window.end_time
    }
}

/// Running aggregate for one [WindowKey].
#[derive(Clone, Debug, PartialEq, Default, Encode, Decode)]
pub struct WindowAccumulator {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl WindowAccumulator {
    pub fn add(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value {
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }
}

/// Idempotency key for emitted aggregates.
#[derive(Clone, Hash, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct AggregateKey {
    pub user_id: String,
    pub window_start: SystemTime,
    pub window_end: SystemTime,
}

/// An aggregate result as written to the aggregate store. Re-emitting the same window overwrites
/// the previous value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmittedAggregate {
    pub user_id: String,
    #[serde(with = "serde_millis")]
    pub window_start: SystemTime,
    #[serde(with = "serde_millis")]
    pub window_end: SystemTime,
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Set on the emission produced when the window closes.
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(with = "serde_millis")]
    pub emitted_at: SystemTime,
}

impl EmittedAggregate {
    pub fn from_state(key: &WindowKey, acc: &WindowAccumulator, is_final: bool) -> Self {
        Self {
            user_id: key.key.clone(),
            window_start: key.window.start_time,
            window_end: key.window.end_time,
            count: acc.count,
            sum: acc.sum,
            min: acc.min,
            max: acc.max,
            is_final,
            emitted_at: SystemTime::now(),
        }
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey {
            user_id: self.user_id.clone(),
            window_start: self.window_start,
            window_end: self.window_end,
        }
    }

    pub fn window(&self) -> Window {
        Window::new(self.window_start, self.window_end)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    PageView,
    AddToCart,
    Purchase,
    Other(String),
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "PAGE_VIEW" => EventType::PageView,
            "ADD_TO_CART" => EventType::AddToCart,
            "PURCHASE" => EventType::Purchase,
            _ => EventType::Other(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.to_string()
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.to_string().into())
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::PageView => write!(f, "PAGE_VIEW"),
            EventType::AddToCart => write!(f, "ADD_TO_CART"),
            EventType::Purchase => write!(f, "PURCHASE"),
            EventType::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid record json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is missing a user id")]
    MissingUserId,

    #[error("invalid event timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// A single customer activity event, as delivered by the inbound feed.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivityRecord {
    user_id: String,
    session_id: String,
    event_timestamp: SystemTime,
    event_type: EventType,
    product_id: Option<String>,
    page_url: Option<String>,
    value: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActivityRecord {
    #[serde(alias = "user_id")]
    user_id: String,
    #[serde(alias = "session_id")]
    session_id: String,
    #[serde(alias = "event_timestamp", alias = "timestamp")]
    event_timestamp: RawTimestamp,
    #[serde(alias = "event_type")]
    event_type: EventType,
    #[serde(default, alias = "product_id")]
    product_id: Option<String>,
    #[serde(default, alias = "page_url")]
    page_url: Option<String>,
    #[serde(default)]
    value: Option<f64>,
}

impl ActivityRecord {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        event_timestamp: SystemTime,
        event_type: EventType,
    ) -> Result<Self, DecodeError> {
        let user_id = user_id.into();
        if user_id.is_empty() {
            return Err(DecodeError::MissingUserId);
        }
        let latest = from_millis(MAX_EVENT_TIMESTAMP_MILLIS);
        if event_timestamp < UNIX_EPOCH || event_timestamp > latest {
            return Err(DecodeError::InvalidTimestamp(format!(
                "{:?}",
                event_timestamp
            )));
        }

        Ok(Self {
            user_id,
            session_id: session_id.into(),
            event_timestamp,
            event_type,
            product_id: None,
            page_url: None,
            value: None,
        })
    }

    pub fn with_product_id(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }

    pub fn with_page_url(mut self, page_url: impl Into<String>) -> Self {
        self.page_url = Some(page_url.into());
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    /// Decodes a JSON payload from the feed.
    pub fn from_json(bs: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawActivityRecord = serde_json::from_slice(bs)?;

        let event_timestamp = match raw.event_timestamp {
            RawTimestamp::Millis(ms) => u64::try_from(ms)
                .ok()
                .filter(|ms| *ms <= MAX_EVENT_TIMESTAMP_MILLIS)
                .map(from_millis)
                .ok_or_else(|| DecodeError::InvalidTimestamp(ms.to_string()))?,
            RawTimestamp::Text(s) => chrono::DateTime::parse_from_rfc3339(&s)
                .ok()
                .and_then(|t| u64::try_from(t.timestamp_millis()).ok())
                .map(from_millis)
                .ok_or(DecodeError::InvalidTimestamp(s))?,
        };

        let mut record = Self::new(
            raw.user_id,
            raw.session_id,
            event_timestamp,
            raw.event_type,
        )?;
        record.product_id = raw.product_id;
        record.page_url = raw.page_url;
        record.value = raw.value;
        Ok(record)
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::json!({
            "userId": self.user_id,
            "sessionId": self.session_id,
            "eventTimestamp": to_millis(self.event_timestamp),
            "eventType": self.event_type.to_string(),
            "productId": self.product_id,
            "pageUrl": self.page_url,
            "value": self.value,
        })
        .to_string()
        .into_bytes()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn event_timestamp(&self) -> SystemTime {
        self.event_timestamp
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn product_id(&self) -> Option<&str> {
        self.product_id.as_deref()
    }

    pub fn page_url(&self) -> Option<&str> {
        self.page_url.as_deref()
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[derive(Debug, Copy, Clone, Encode, Decode, PartialEq)]
pub struct CheckpointBarrier {
    pub epoch: u32,
    pub timestamp: SystemTime,
    pub then_stop: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_decode_camel_case() {
        let record = ActivityRecord::from_json(
            br#"{"userId": "user_A", "sessionId": "s1", "eventTimestamp": 5000,
                 "eventType": "PAGE_VIEW", "pageUrl": "/home", "value": 1.5}"#,
        )
        .unwrap();

        assert_eq!(record.user_id(), "user_A");
        assert_eq!(record.event_timestamp(), from_millis(5000));
        assert_eq!(record.event_type(), &EventType::PageView);
        assert_eq!(record.page_url(), Some("/home"));
        assert_eq!(record.product_id(), None);
        assert_eq!(record.value(), Some(1.5));
    }

    #[test]
    fn test_decode_rfc3339() {
        let record = ActivityRecord::from_json(
            br#"{"user_id": "u", "session_id": "s", "event_timestamp": "1970-01-01T00:01:00Z",
                 "event_type": "purchase", "product_id": "p-1"}"#,
        )
        .unwrap();

        assert_eq!(record.event_timestamp(), from_millis(60_000));
        assert_eq!(record.event_type(), &EventType::Purchase);
        assert_eq!(record.product_id(), Some("p-1"));
    }

    #[test_case(br#"not json"#; "garbage")]
    #[test_case(br#"{"sessionId": "s", "eventTimestamp": 1, "eventType": "PAGE_VIEW"}"#; "missing user")]
    #[test_case(br#"{"userId": "", "sessionId": "s", "eventTimestamp": 1, "eventType": "PAGE_VIEW"}"#; "empty user")]
    #[test_case(br#"{"userId": "u", "sessionId": "s", "eventTimestamp": -1, "eventType": "PAGE_VIEW"}"#; "negative timestamp")]
    #[test_case(br#"{"userId": "u", "sessionId": "s", "eventTimestamp": "yesterday", "eventType": "PAGE_VIEW"}"#; "bad timestamp")]
    #[test_case(br#"{"userId": "u", "sessionId": "s", "eventTimestamp": 253402300800000, "eventType": "PAGE_VIEW"}"#; "timestamp past year 9999")]
    fn test_malformed(payload: &[u8]) {
        assert!(ActivityRecord::from_json(payload).is_err());
    }

    #[test]
    fn test_far_future_timestamps() {
        let record = ActivityRecord::from_json(
            br#"{"userId": "u", "sessionId": "s", "eventTimestamp": "2600-01-01T00:00:30Z",
                 "eventType": "PAGE_VIEW"}"#,
        )
        .unwrap();

        let ts = record.event_timestamp();
        assert_eq!(to_millis(ts), 19_880_899_230_000);
        assert_eq!(from_nanos(to_nanos(ts)), ts);

        let latest = from_millis(MAX_EVENT_TIMESTAMP_MILLIS);
        assert!(ActivityRecord::new("u", "s", latest, EventType::PageView).is_ok());

        let past_latest = latest + Duration::from_millis(1);
        assert!(matches!(
            ActivityRecord::new("u", "s", past_latest, EventType::PageView),
            Err(DecodeError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let record = ActivityRecord::new("u", "s", from_millis(42), EventType::AddToCart)
            .unwrap()
            .with_product_id("p")
            .with_value(3.0);

        assert_eq!(ActivityRecord::from_json(&record.to_json()).unwrap(), record);
    }

    #[test]
    fn test_other_event_type() {
        let t: EventType = "SEARCH".parse().unwrap();
        assert_eq!(t, EventType::Other("SEARCH".to_string()));
        assert_eq!(t.to_string(), "SEARCH");
    }

    #[test]
    fn test_window_half_open() {
        let w = Window::new(from_millis(0), from_millis(60_000));
        assert!(w.contains(from_millis(0)));
        assert!(w.contains(from_millis(59_999)));
        assert!(!w.contains(from_millis(60_000)));
    }

    #[test]
    fn test_accumulator() {
        let mut acc = WindowAccumulator::default();
        acc.add(Some(2.0));
        acc.add(None);
        acc.add(Some(-1.0));

        assert_eq!(acc.count, 3);
        assert_eq!(acc.sum, 1.0);
        assert_eq!(acc.min, Some(-1.0));
        assert_eq!(acc.max, Some(2.0));
    }

    #[test]
    fn test_aggregate_json() {
        let key = WindowKey::new("u", Window::new(from_millis(0), from_millis(60_000)));
        let mut acc = WindowAccumulator::default();
        acc.add(None);
        let agg = EmittedAggregate::from_state(&key, &acc, true);

        let json = serde_json::to_value(&agg).unwrap();
        assert_eq!(json["userId"], "u");
        assert_eq!(json["windowEnd"], 60_000);
        assert_eq!(json["final"], true);
    }
}
