//! Decoding of streaming envelopes into typed notifications.
//!
//! The streaming link delivers server-sent events. Each event carries a JSON envelope whose
//! `data` field is itself a JSON document describing one notification. [`NotificationCodec`]
//! turns an event into a [`Notification`] and never fails: anything it cannot understand becomes
//! [`Notification::Ignored`].
//!
//! Inline payloads (segment key lists, bitmaps, rule definitions) are left encoded in the
//! notification and decoded by their consumer with [`decode_payload`], so a malformed payload
//! degrades only that consumer's work to a full fetch.
use std::{collections::HashMap, io::Read, ops::RangeInclusive};

use base64::{engine::general_purpose::STANDARD, Engine};
use derive_more::From;
use serde::Deserialize;
use thiserror::Error;

/// Envelope `name` that marks occupancy metadata.
pub const OCCUPANCY_EVENT_NAME: &str = "[meta]occupancy";

/// Errors while decoding a notification or its inline payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The envelope or notification body is not the JSON we expect.
    #[error("malformed json: {0}")]
    Json(String),
    /// The inline payload is not valid base64.
    #[error("inline payload is not valid base64")]
    Base64,
    /// The inline payload could not be decompressed.
    #[error("inline payload decompression failed: {0}")]
    Decompression(String),
    /// Unsupported compression id.
    #[error("unknown compression type {0}")]
    UnknownCompression(u8),
    /// Unsupported segment update strategy id.
    #[error("unknown update strategy {0}")]
    UnknownStrategy(u8),
    /// The notification requires an inline payload but carries none.
    #[error("missing inline payload")]
    MissingPayload,
    /// A bounded update carried a zero-length bitmap.
    #[error("empty bitmap")]
    EmptyBitmap,
}

impl From<serde_json::Error> for DecodeError {
    fn from(value: serde_json::Error) -> Self {
        DecodeError::Json(value.to_string())
    }
}

/// Notification type as announced in the notification body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum NotificationKind {
    /// A rule changed.
    #[serde(rename = "SPLIT_UPDATE")]
    RulesUpdate,
    /// A rule was killed.
    #[serde(rename = "SPLIT_KILL")]
    RulesKill,
    /// Legacy segment change.
    #[serde(rename = "MY_SEGMENTS_UPDATE")]
    SegmentsUpdate,
    /// Segment change with an update strategy.
    #[serde(rename = "MY_SEGMENTS_UPDATE_V2")]
    SegmentsUpdateV2,
    /// Large segment change.
    #[serde(rename = "MY_LARGE_SEGMENTS_UPDATE")]
    LargeSegmentsUpdate,
    /// Control signal.
    #[serde(rename = "CONTROL")]
    Control,
    /// Publisher count update.
    #[serde(rename = "OCCUPANCY")]
    Occupancy,
    /// Anything else.
    #[serde(other)]
    Unknown,
}

/// Parsed outer envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Notification type.
    pub kind: NotificationKind,
    /// Channel the notification was published on.
    pub channel: String,
    /// Server timestamp in milliseconds.
    pub timestamp: i64,
    /// The notification body, still encoded as JSON.
    pub data: String,
}

/// Compression applied to an inline payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Plain base64.
    #[default]
    None,
    /// Gzip, then base64.
    Gzip,
    /// Zlib, then base64.
    Zlib,
}

impl TryFrom<u8> for Compression {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Zlib),
            other => Err(DecodeError::UnknownCompression(other)),
        }
    }
}

/// How a subscriber should react to a segment update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Every subscriber refetches.
    UnboundedFetch,
    /// Subscribers whose key is set in the bitmap refetch.
    BoundedFetch,
    /// The payload lists hashed keys to add to or remove from the named segments.
    KeyList,
    /// The named segments are removed for every subscriber.
    SegmentRemoval,
}

impl TryFrom<u8> for UpdateStrategy {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(UpdateStrategy::UnboundedFetch),
            1 => Ok(UpdateStrategy::BoundedFetch),
            2 => Ok(UpdateStrategy::KeyList),
            3 => Ok(UpdateStrategy::SegmentRemoval),
            other => Err(DecodeError::UnknownStrategy(other)),
        }
    }
}

/// The rule set changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesChange {
    /// Version of the rule set after the change.
    pub change_number: i64,
    /// Version the inline definition applies on top of.
    pub previous_change_number: Option<i64>,
    /// Compression of `payload`.
    pub compression: Compression,
    /// Base64 encoded, possibly compressed, rule definition.
    pub payload: Option<String>,
}

/// A single rule was killed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesKill {
    /// Name of the killed rule.
    pub name: String,
    /// Treatment to serve from now on.
    pub default_treatment: String,
    /// Version of the kill.
    pub change_number: i64,
}

/// Legacy per-subscriber segment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentsChange {
    /// Per-subscriber channel, ending with the key hash.
    pub channel: String,
    /// Version of the memberships after the change.
    pub change_number: i64,
    /// `true` if `segments` is the full new membership list.
    pub includes_payload: bool,
    /// The full membership list, when included.
    pub segments: Option<Vec<String>>,
}

/// Per-subscriber segment change with an update strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentsChangeV2 {
    /// Channel the change was published on.
    pub channel: String,
    /// Version of the change, if versioned.
    pub change_number: Option<i64>,
    /// How subscribers react.
    pub strategy: UpdateStrategy,
    /// Compression of `data`.
    pub compression: Compression,
    /// Inline payload: a bitmap or a key list, depending on `strategy`.
    pub data: Option<String>,
    /// Segments the change applies to.
    pub segment_names: Vec<String>,
}

/// Large segment change with an update strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LargeSegmentsChange {
    /// Channel the change was published on.
    pub channel: String,
    /// Version of the change, if versioned.
    pub change_number: Option<i64>,
    /// Large segments the change applies to.
    pub names: Vec<String>,
    /// How subscribers react.
    pub strategy: UpdateStrategy,
    /// Compression of `data`.
    pub compression: Compression,
    /// Inline payload: a bitmap or a key list, depending on `strategy`.
    pub data: Option<String>,
    /// Window over which subscribers spread their refetch.
    pub update_interval_ms: Option<u64>,
    /// Hash used to spread the refetch.
    pub hash_algorithm: Option<u8>,
    /// Seed of that hash.
    pub hash_seed: Option<u32>,
}

/// Publisher count on a monitoring channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupancy {
    /// Monitoring channel.
    pub channel: String,
    /// Envelope timestamp in milliseconds.
    pub timestamp: i64,
    /// Active publishers on the channel.
    pub publishers: u32,
}

/// Out-of-band streaming control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ControlType {
    /// Notifications stop flowing until resumed.
    #[serde(rename = "STREAMING_PAUSED")]
    StreamingPaused,
    /// Notifications flow again.
    #[serde(rename = "STREAMING_RESUMED", alias = "STREAMING_ENABLED")]
    StreamingResumed,
    /// Streaming is off for the session.
    #[serde(rename = "STREAMING_DISABLED")]
    StreamingDisabled,
    /// Reconnect from scratch.
    #[serde(rename = "STREAMING_RESET")]
    StreamingReset,
}

/// Control signal with the envelope timestamp it arrived with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    /// Envelope timestamp in milliseconds.
    pub timestamp: i64,
    /// The signal.
    pub control_type: ControlType,
}

/// How the connection layer should react to a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Reconnect with a fresh token after a backoff.
    Retryable,
    /// Stop streaming for the rest of the session.
    NonRetryable,
    /// Log and carry on.
    Ignorable,
}

/// Error event sent by the streaming server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// Vendor error code.
    pub code: u32,
    /// HTTP status equivalent, 0 if absent.
    pub http_status: u16,
    /// Human readable description.
    pub message: String,
    /// Classification of `code`.
    pub kind: ProtocolErrorKind,
}

/// Protocol error code boundaries.
///
/// The numbers are owned by the streaming vendor, so they are configuration rather than
/// constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCodeRanges {
    /// Codes that warrant a reconnect with a fresh token.
    pub retryable: RangeInclusive<u32>,
    /// The vendor's messaging error range. Codes above it are ignored.
    pub messaging: RangeInclusive<u32>,
}

impl ErrorCodeRanges {
    /// Default value for [`ErrorCodeRanges::retryable`].
    pub const DEFAULT_RETRYABLE: RangeInclusive<u32> = 40140..=40149;
    /// Default value for [`ErrorCodeRanges::messaging`].
    pub const DEFAULT_MESSAGING: RangeInclusive<u32> = 40000..=49999;

    /// Create ranges with the default boundaries.
    pub fn new() -> ErrorCodeRanges {
        ErrorCodeRanges::default()
    }

    /// Update the retryable range.
    pub fn with_retryable(mut self, retryable: RangeInclusive<u32>) -> ErrorCodeRanges {
        self.retryable = retryable;
        self
    }

    /// Update the messaging range.
    pub fn with_messaging(mut self, messaging: RangeInclusive<u32>) -> ErrorCodeRanges {
        self.messaging = messaging;
        self
    }

    /// Classify a numeric protocol error code.
    pub fn classify(&self, code: u32) -> ProtocolErrorKind {
        if self.retryable.contains(&code) {
            ProtocolErrorKind::Retryable
        } else if code > *self.messaging.end() {
            ProtocolErrorKind::Ignorable
        } else {
            ProtocolErrorKind::NonRetryable
        }
    }
}

impl Default for ErrorCodeRanges {
    fn default() -> Self {
        ErrorCodeRanges {
            retryable: ErrorCodeRanges::DEFAULT_RETRYABLE,
            messaging: ErrorCodeRanges::DEFAULT_MESSAGING,
        }
    }
}

/// A decoded streaming notification.
#[derive(Debug, Clone, PartialEq, Eq, From)]
pub enum Notification {
    /// See [`RulesChange`].
    RulesChanged(RulesChange),
    /// See [`RulesKill`].
    RulesKilled(RulesKill),
    /// See [`SegmentsChange`].
    SubscriberSegmentsChanged(SegmentsChange),
    /// See [`SegmentsChangeV2`].
    SubscriberSegmentsChangedV2(SegmentsChangeV2),
    /// See [`LargeSegmentsChange`].
    LargeSegmentsChanged(LargeSegmentsChange),
    /// See [`Occupancy`].
    Occupancy(Occupancy),
    /// See [`Control`].
    Control(Control),
    /// See [`ProtocolError`].
    ProtocolError(ProtocolError),
    /// Malformed or unknown input. Carries nothing on purpose.
    Ignored,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    name: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct KindHeader {
    #[serde(rename = "type")]
    kind: Option<NotificationKind>,
    metrics: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRulesChange {
    change_number: i64,
    pcn: Option<i64>,
    c: Option<u8>,
    d: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRulesKill {
    change_number: i64,
    split_name: String,
    default_treatment: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSegmentsChange {
    change_number: i64,
    #[serde(default)]
    includes_payload: bool,
    segment_list: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSegmentsChangeV2 {
    change_number: Option<i64>,
    u: u8,
    c: Option<u8>,
    d: Option<String>,
    segment_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLargeSegmentsChange {
    change_number: Option<i64>,
    #[serde(default)]
    large_segments: Vec<String>,
    u: u8,
    c: Option<u8>,
    d: Option<String>,
    i: Option<u64>,
    h: Option<u8>,
    s: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawOccupancy {
    metrics: RawMetrics,
}

#[derive(Debug, Deserialize)]
struct RawMetrics {
    publishers: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawControl {
    control_type: ControlType,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProtocolError {
    #[serde(default)]
    message: String,
    code: u32,
    #[serde(default)]
    status_code: u16,
}

/// Parse the outer envelope and detect the notification kind.
pub fn parse_envelope(raw: &str) -> Result<Envelope, DecodeError> {
    let envelope: RawEnvelope = serde_json::from_str(raw)?;

    let kind = if envelope.name.as_deref() == Some(OCCUPANCY_EVENT_NAME) {
        NotificationKind::Occupancy
    } else {
        let header: KindHeader = serde_json::from_str(&envelope.data)?;
        match header.kind {
            Some(kind) => kind,
            None if header.metrics.is_some() => NotificationKind::Occupancy,
            None => NotificationKind::Unknown,
        }
    };

    Ok(Envelope {
        kind,
        channel: envelope.channel,
        timestamp: envelope.timestamp,
        data: envelope.data,
    })
}

/// Decode the body of a rules update.
pub fn decode_rules_change(data: &str) -> Result<RulesChange, DecodeError> {
    let raw: RawRulesChange = serde_json::from_str(data)?;
    Ok(RulesChange {
        change_number: raw.change_number,
        previous_change_number: raw.pcn,
        compression: raw.c.map(Compression::try_from).transpose()?.unwrap_or_default(),
        payload: raw.d.filter(|it| !it.is_empty()),
    })
}

/// Decode the body of a rule kill.
pub fn decode_rules_kill(data: &str) -> Result<RulesKill, DecodeError> {
    let raw: RawRulesKill = serde_json::from_str(data)?;
    Ok(RulesKill {
        name: raw.split_name,
        default_treatment: raw.default_treatment,
        change_number: raw.change_number,
    })
}

/// Decode the body of a legacy segment change published on `channel`.
pub fn decode_segments_change(channel: &str, data: &str) -> Result<SegmentsChange, DecodeError> {
    let raw: RawSegmentsChange = serde_json::from_str(data)?;
    Ok(SegmentsChange {
        channel: channel.to_owned(),
        change_number: raw.change_number,
        includes_payload: raw.includes_payload,
        segments: raw.segment_list,
    })
}

/// Decode the body of a segment change published on `channel`.
pub fn decode_segments_change_v2(
    channel: &str,
    data: &str,
) -> Result<SegmentsChangeV2, DecodeError> {
    let raw: RawSegmentsChangeV2 = serde_json::from_str(data)?;
    Ok(SegmentsChangeV2 {
        channel: channel.to_owned(),
        change_number: raw.change_number,
        strategy: UpdateStrategy::try_from(raw.u)?,
        compression: raw.c.map(Compression::try_from).transpose()?.unwrap_or_default(),
        data: raw.d.filter(|it| !it.is_empty()),
        segment_names: raw.segment_name.into_iter().collect(),
    })
}

/// Decode the body of a large segment change published on `channel`.
pub fn decode_large_segments_change(
    channel: &str,
    data: &str,
) -> Result<LargeSegmentsChange, DecodeError> {
    let raw: RawLargeSegmentsChange = serde_json::from_str(data)?;
    Ok(LargeSegmentsChange {
        channel: channel.to_owned(),
        change_number: raw.change_number,
        names: raw.large_segments,
        strategy: UpdateStrategy::try_from(raw.u)?,
        compression: raw.c.map(Compression::try_from).transpose()?.unwrap_or_default(),
        data: raw.d.filter(|it| !it.is_empty()),
        update_interval_ms: raw.i,
        hash_algorithm: raw.h,
        hash_seed: raw.s,
    })
}

/// Decode the body of an occupancy update.
pub fn decode_occupancy(
    channel: &str,
    timestamp: i64,
    data: &str,
) -> Result<Occupancy, DecodeError> {
    let raw: RawOccupancy = serde_json::from_str(data)?;
    Ok(Occupancy {
        channel: channel.to_owned(),
        timestamp,
        publishers: raw.metrics.publishers,
    })
}

/// Decode the body of a control signal.
pub fn decode_control(timestamp: i64, data: &str) -> Result<Control, DecodeError> {
    let raw: RawControl = serde_json::from_str(data)?;
    Ok(Control {
        timestamp,
        control_type: raw.control_type,
    })
}

/// Decode a protocol error event and classify its code against `ranges`.
pub fn decode_error(ranges: &ErrorCodeRanges, data: &str) -> Result<ProtocolError, DecodeError> {
    let raw: RawProtocolError = serde_json::from_str(data)?;
    Ok(ProtocolError {
        code: raw.code,
        http_status: raw.status_code,
        message: raw.message,
        kind: ranges.classify(raw.code),
    })
}

/// Returns `true` if a server-sent event carries a protocol error rather than a notification.
pub fn is_error_event(event: &HashMap<String, String>) -> bool {
    event.get("event").map(String::as_str) == Some("error")
}

/// Turns server-sent events into [`Notification`]s.
#[derive(Debug, Clone, Default)]
pub struct NotificationCodec {
    ranges: ErrorCodeRanges,
}

impl NotificationCodec {
    /// Create a codec classifying protocol errors with `ranges`.
    pub fn new(ranges: ErrorCodeRanges) -> NotificationCodec {
        NotificationCodec { ranges }
    }

    /// Decode one server-sent event. Never fails.
    pub fn decode(&self, event: &HashMap<String, String>) -> Notification {
        let Some(data) = event.get("data") else {
            log::debug!(target: "flagsync", "ignoring streaming event without data");
            return Notification::Ignored;
        };

        let result = if is_error_event(event) {
            decode_error(&self.ranges, data).map(Notification::from)
        } else {
            self.decode_envelope(data)
        };

        result.unwrap_or_else(|err| {
            log::warn!(target: "flagsync", "ignoring malformed streaming notification: {err}");
            Notification::Ignored
        })
    }

    fn decode_envelope(&self, raw: &str) -> Result<Notification, DecodeError> {
        let envelope = parse_envelope(raw)?;
        let Envelope {
            kind,
            channel,
            timestamp,
            data,
        } = &envelope;

        let notification: Notification = match kind {
            NotificationKind::RulesUpdate => decode_rules_change(data)?.into(),
            NotificationKind::RulesKill => decode_rules_kill(data)?.into(),
            NotificationKind::SegmentsUpdate => decode_segments_change(channel, data)?.into(),
            NotificationKind::SegmentsUpdateV2 => decode_segments_change_v2(channel, data)?.into(),
            NotificationKind::LargeSegmentsUpdate => {
                decode_large_segments_change(channel, data)?.into()
            }
            NotificationKind::Occupancy => decode_occupancy(channel, *timestamp, data)?.into(),
            NotificationKind::Control => decode_control(*timestamp, data)?.into(),
            NotificationKind::Unknown => {
                log::debug!(target: "flagsync", channel = channel.as_str(); "ignoring unknown notification type");
                Notification::Ignored
            }
        };
        Ok(notification)
    }
}

/// Decode a base64, possibly compressed, inline payload.
pub fn decode_payload(data: &str, compression: Compression) -> Result<Vec<u8>, DecodeError> {
    let bytes = STANDARD.decode(data).map_err(|_| DecodeError::Base64)?;

    let mut decoded = Vec::new();
    let result = match compression {
        Compression::None => return Ok(bytes),
        Compression::Gzip => flate2::read::GzDecoder::new(bytes.as_slice()).read_to_end(&mut decoded),
        Compression::Zlib => {
            flate2::read::ZlibDecoder::new(bytes.as_slice()).read_to_end(&mut decoded)
        }
    };
    result.map_err(|err| DecodeError::Decompression(err.to_string()))?;
    Ok(decoded)
}

/// Hashed keys added to and removed from a segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KeyList {
    /// Key hashes joining the segments.
    #[serde(rename = "a", default)]
    pub added: Vec<u64>,
    /// Key hashes leaving the segments.
    #[serde(rename = "r", default)]
    pub removed: Vec<u64>,
}

/// What a key list means for a particular subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyListAction {
    /// Add the segments to the subscriber.
    Add,
    /// Remove the segments from the subscriber.
    Remove,
    /// The subscriber is not affected.
    None,
}

impl KeyList {
    /// Decode a key list from a decoded inline payload.
    pub fn from_payload(payload: &[u8]) -> Result<KeyList, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Action for the subscriber whose 64-bit key hash is `key_hash`.
    pub fn action_for(&self, key_hash: u64) -> KeyListAction {
        if self.added.contains(&key_hash) {
            KeyListAction::Add
        } else if self.removed.contains(&key_hash) {
            KeyListAction::Remove
        } else {
            KeyListAction::None
        }
    }
}

/// Returns `true` if the bit addressed by `key_hash` is set in `bitmap`.
pub fn is_key_in_bitmap(bitmap: &[u8], key_hash: u64) -> Result<bool, DecodeError> {
    if bitmap.is_empty() {
        return Err(DecodeError::EmptyBitmap);
    }
    let index = key_hash % (bitmap.len() as u64 * 8);
    let byte = bitmap[(index / 8) as usize];
    Ok(byte & (1 << (index % 8)) != 0)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write};

    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::*;

    const RULES_UPDATE: &str = r#"{"id":"VSEQrcq9D8:0:0","clientId":"NDEzMTY5Mzg0MA==:MjU4MzkwNDA2NA==","timestamp":1584554772719,"encoding":"json","channel":"MzM5Njc0ODcyNg==_MTExMzgwNjgx_splits","data":"{\"type\":\"SPLIT_UPDATE\",\"changeNumber\":1584554772108}"}"#;
    const RULES_KILL: &str = r#"{"id":"-OT-rGuSwz:0:0","clientId":"NDEzMTY5Mzg0MA==:NDIxNjU0NTUyNw==","timestamp":1584647606489,"encoding":"json","channel":"MzM5Njc0ODcyNg==_MTExMzgwNjgx_splits","data":"{\"type\":\"SPLIT_KILL\",\"changeNumber\":1584647606125,\"defaultTreatment\":\"off\",\"splitName\":\"dep_split\"}"}"#;
    const SEGMENTS_INLINE: &str = r#"{"id":"x2dE2TEiJL:0:0","clientId":"NDEzMTY5Mzg0MA==:OTc5Nzc4NDYz","timestamp":1584647533288,"encoding":"json","channel":"MzM5Njc0ODcyNg==_MTExMzgwNjgx_MTcwNTI2MTM0Mg==_mySegments","data":"{\"type\":\"MY_SEGMENTS_UPDATE\",\"changeNumber\":1584647532812,\"includesPayload\":true,\"segmentList\":[\"segment1\", \"segment2\"]}"}"#;
    const OCCUPANCY: &str = r#"{"id":"x2dE2TEiJL:0:0","clientId":"NDEzMTY5Mzg0MA==:OTc5Nzc4NDYz","timestamp":1584647533288,"encoding":"json","channel":"[?occupancy=metrics.publishers]control_pri","name":"[meta]occupancy","data":"{\"metrics\": {\"publishers\":1}}"}"#;
    const CONTROL: &str = r#"{"id":"x2dE2TEiJL:0:0","clientId":"NDEzMTY5Mzg0MA==:OTc5Nzc4NDYz","timestamp":1584647533288,"encoding":"json","channel":"control_pri","data":"{\"type\":\"CONTROL\",\"controlType\":\"STREAMING_RESUMED\"}"}"#;

    fn message(data: &str) -> HashMap<String, String> {
        HashMap::from([
            ("event".to_owned(), "message".to_owned()),
            ("data".to_owned(), data.to_owned()),
        ])
    }

    fn error_event(data: &str) -> HashMap<String, String> {
        HashMap::from([
            ("event".to_owned(), "error".to_owned()),
            ("data".to_owned(), data.to_owned()),
        ])
    }

    #[test]
    fn decodes_rules_update() {
        let notification = NotificationCodec::default().decode(&message(RULES_UPDATE));

        assert_eq!(
            notification,
            Notification::RulesChanged(RulesChange {
                change_number: 1584554772108,
                previous_change_number: None,
                compression: Compression::None,
                payload: None,
            })
        );
    }

    #[test]
    fn decodes_rules_kill() {
        let notification = NotificationCodec::default().decode(&message(RULES_KILL));

        assert_eq!(
            notification,
            Notification::RulesKilled(RulesKill {
                name: "dep_split".to_owned(),
                default_treatment: "off".to_owned(),
                change_number: 1584647606125,
            })
        );
    }

    #[test]
    fn decodes_inline_segments() {
        let Notification::SubscriberSegmentsChanged(change) =
            NotificationCodec::default().decode(&message(SEGMENTS_INLINE))
        else {
            panic!("expected a segments change");
        };

        assert!(change.includes_payload);
        assert_eq!(
            change.segments,
            Some(vec!["segment1".to_owned(), "segment2".to_owned()])
        );
        assert_eq!(
            change.channel,
            "MzM5Njc0ODcyNg==_MTExMzgwNjgx_MTcwNTI2MTM0Mg==_mySegments"
        );
    }

    #[test]
    fn decodes_occupancy_and_control_with_envelope_timestamp() {
        let codec = NotificationCodec::default();

        assert_eq!(
            codec.decode(&message(OCCUPANCY)),
            Notification::Occupancy(Occupancy {
                channel: "[?occupancy=metrics.publishers]control_pri".to_owned(),
                timestamp: 1584647533288,
                publishers: 1,
            })
        );
        assert_eq!(
            codec.decode(&message(CONTROL)),
            Notification::Control(Control {
                timestamp: 1584647533288,
                control_type: ControlType::StreamingResumed,
            })
        );
    }

    #[test]
    fn decodes_segments_v2_and_large_segments() {
        let v2 = r#"{"channel":"x_MTcwNTI2MTM0Mg==_mySegments","timestamp":1,"data":"{\"type\":\"MY_SEGMENTS_UPDATE_V2\",\"changeNumber\":5,\"u\":2,\"c\":1,\"d\":\"H4sI\",\"segmentName\":\"beta\"}"}"#;
        let large = r#"{"channel":"x_MTcwNTI2MTM0Mg==_myLargeSegments","timestamp":1,"data":"{\"type\":\"MY_LARGE_SEGMENTS_UPDATE\",\"changeNumber\":7,\"largeSegments\":[\"ls1\",\"ls2\"],\"u\":0,\"i\":60000,\"h\":1,\"s\":1234}"}"#;
        let codec = NotificationCodec::default();

        let Notification::SubscriberSegmentsChangedV2(v2) = codec.decode(&message(v2)) else {
            panic!("expected a v2 segments change");
        };
        assert_eq!(v2.strategy, UpdateStrategy::KeyList);
        assert_eq!(v2.compression, Compression::Gzip);
        assert_eq!(v2.segment_names, vec!["beta".to_owned()]);

        let Notification::LargeSegmentsChanged(large) = codec.decode(&message(large)) else {
            panic!("expected a large segments change");
        };
        assert_eq!(large.strategy, UpdateStrategy::UnboundedFetch);
        assert_eq!(large.names, vec!["ls1".to_owned(), "ls2".to_owned()]);
        assert_eq!(large.update_interval_ms, Some(60_000));
        assert_eq!(large.hash_seed, Some(1234));
    }

    #[test]
    fn classifies_protocol_errors_by_code() {
        let codec = NotificationCodec::default();
        let decode = |code: u32| {
            let data = format!(
                r#"{{"message":"Token expired","code":{code},"statusCode":401,"href":"https://help.ably.io/error/{code}"}}"#
            );
            match codec.decode(&error_event(&data)) {
                Notification::ProtocolError(error) => error.kind,
                other => panic!("expected a protocol error, got {other:?}"),
            }
        };

        assert_eq!(decode(40142), ProtocolErrorKind::Retryable);
        assert_eq!(decode(40140), ProtocolErrorKind::Retryable);
        assert_eq!(decode(40149), ProtocolErrorKind::Retryable);
        assert_eq!(decode(40012), ProtocolErrorKind::NonRetryable);
        assert_eq!(decode(39999), ProtocolErrorKind::NonRetryable);
        assert_eq!(decode(50000), ProtocolErrorKind::Ignorable);
    }

    #[test]
    fn error_ranges_are_configurable() {
        let ranges = ErrorCodeRanges::new().with_retryable(40100..=40199);

        assert_eq!(ranges.classify(40150), ProtocolErrorKind::Retryable);
        assert_eq!(ErrorCodeRanges::new().classify(40150), ProtocolErrorKind::NonRetryable);
    }

    #[test]
    fn error_event_detection() {
        assert!(is_error_event(&error_event("{}")));
        assert!(!is_error_event(&message("{}")));
        assert!(!is_error_event(&HashMap::new()));
    }

    #[test]
    fn malformed_input_is_ignored() {
        let codec = NotificationCodec::default();

        for data in [
            "",
            "not json",
            r#"{"channel":"c","timestamp":1,"data":"{{{"}"#,
            r#"{"channel":"c","timestamp":1,"data":"{\"type\":\"SOMETHING_NEW\"}"}"#,
            r#"{"channel":"c","timestamp":1,"data":"{\"type\":\"SPLIT_UPDATE\"}"}"#,
            r#"{"channel":"c","timestamp":1,"data":"{\"type\":\"MY_SEGMENTS_UPDATE_V2\",\"u\":9}"}"#,
        ] {
            assert_eq!(codec.decode(&message(data)), Notification::Ignored, "{data:?}");
        }
        assert_eq!(codec.decode(&error_event("{{{")), Notification::Ignored);
        assert_eq!(codec.decode(&HashMap::new()), Notification::Ignored);
    }

    #[test]
    fn decodes_compressed_payloads() {
        let plain = br#"{"a":[1,2],"r":[3]}"#;

        let mut gzip = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gzip.write_all(plain).unwrap();
        let gzip = STANDARD.encode(gzip.finish().unwrap());

        let mut zlib = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        zlib.write_all(plain).unwrap();
        let zlib = STANDARD.encode(zlib.finish().unwrap());

        assert_eq!(decode_payload(&gzip, Compression::Gzip).unwrap(), plain);
        assert_eq!(decode_payload(&zlib, Compression::Zlib).unwrap(), plain);
        assert_eq!(
            decode_payload(&STANDARD.encode(plain), Compression::None).unwrap(),
            plain
        );
    }

    #[test]
    fn corrupt_payloads_are_decode_errors() {
        assert_eq!(
            decode_payload("%%%", Compression::None),
            Err(DecodeError::Base64)
        );
        assert!(matches!(
            decode_payload(&STANDARD.encode("not gzip"), Compression::Gzip),
            Err(DecodeError::Decompression(_))
        ));
    }

    #[test]
    fn key_list_actions() {
        let list = KeyList::from_payload(br#"{"a":[1,18446744073709551615],"r":[3]}"#).unwrap();

        assert_eq!(list.action_for(u64::MAX), KeyListAction::Add);
        assert_eq!(list.action_for(3), KeyListAction::Remove);
        assert_eq!(list.action_for(4), KeyListAction::None);
    }

    #[test]
    fn bitmap_lookup() {
        // bit 1 of byte 0 and bit 0 of byte 1
        let bitmap = [0b0000_0010, 0b0000_0001];

        assert!(is_key_in_bitmap(&bitmap, 1).unwrap());
        assert!(is_key_in_bitmap(&bitmap, 8).unwrap());
        assert!(is_key_in_bitmap(&bitmap, 17).unwrap(), "index wraps modulo bit length");
        assert!(!is_key_in_bitmap(&bitmap, 0).unwrap());
        assert_eq!(is_key_in_bitmap(&[], 1), Err(DecodeError::EmptyBitmap));
    }
}
