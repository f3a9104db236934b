//! Timestamp (de)serialization for wire models.
//!
//! Inbound packets carry ISO-8601 strings which the transport re-hydrates
//! into epoch-millisecond numbers; models must accept either form. Outbound
//! serialization always emits ISO-8601.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

/// Raw wire forms a timestamp field may take.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireTime {
    Iso(String),
    EpochMillis(i64),
    EpochMillisFloat(f64),
}

fn from_wire<'de, D: Deserializer<'de>>(wire: WireTime) -> Result<DateTime<Utc>, D::Error> {
    match wire {
        WireTime::Iso(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| D::Error::custom(format!("invalid timestamp '{s}': {e}"))),
        WireTime::EpochMillis(ms) => DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| D::Error::custom(format!("epoch millis out of range: {ms}"))),
        WireTime::EpochMillisFloat(ms) => {
            #[allow(clippy::cast_possible_truncation)]
            DateTime::from_timestamp_millis(ms as i64)
                .ok_or_else(|| D::Error::custom(format!("epoch millis out of range: {ms}")))
        }
    }
}

/// Deserialize a required timestamp field.
///
/// # Errors
///
/// Fails on strings that are not ISO-8601 and numbers outside the
/// representable range.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    from_wire::<D>(WireTime::deserialize(deserializer)?)
}

/// Serialize a timestamp as ISO-8601 with millisecond precision.
///
/// # Errors
///
/// Propagates serializer failures.
pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Same contract as the parent module, for `Option<DateTime<Utc>>` fields.
pub mod option {
    use super::{from_wire, DateTime, Deserialize, Deserializer, SecondsFormat, Serializer, Utc, WireTime};

    /// Deserialize an optional timestamp field.
    ///
    /// # Errors
    ///
    /// Fails on present values that are not valid timestamps.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let wire = Option::<WireTime>::deserialize(deserializer)?;
        wire.map(from_wire::<D>).transpose()
    }

    /// Serialize an optional timestamp as ISO-8601.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(
        time: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => serializer.serialize_none(),
        }
    }
}
