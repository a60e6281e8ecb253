//! Health-check wire frames.
//!
//! Health traffic shares one datagram channel with ordinary application
//! traffic, so every inbound payload is classified here first:
//!
//! ```text
//! PING                        monitor -> worker   reply: PONG
//! PING:yyyymmdd.HHMMSS.mmm    monitor -> worker   reply: PONG:<same timestamp>
//! PONG | PONG:<timestamp>     worker  -> monitor
//! ZULU:yyyymmdd:hhmmss.mmm    monitor -> worker   no reply
//! ```
//!
//! Anything else is [`Frame::Other`] and belongs to the application command
//! layer, untouched. Decoding never fails.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc};
use std::fmt;

const PING: &[u8] = b"PING";
const PONG: &[u8] = b"PONG";
const ZULU_PREFIX: &str = "ZULU:";

/// Key correlating a PONG with the PING that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackingKey {
    /// Bare `PING`/`PONG`, tracked under the literal `"PING"`
    Bare,
    /// Timestamp echoed verbatim by the worker
    Timestamp(String),
}

impl TrackingKey {
    /// Build a timestamped key in `yyyymmdd.HHMMSS.mmm` (UTC).
    pub fn at(time: DateTime<Utc>) -> Self {
        TrackingKey::Timestamp(format_ping_timestamp(time))
    }

    /// The literal string used for correlation.
    pub fn as_str(&self) -> &str {
        match self {
            TrackingKey::Bare => "PING",
            TrackingKey::Timestamp(ts) => ts,
        }
    }

    pub fn is_timestamped(&self) -> bool {
        matches!(self, TrackingKey::Timestamp(_))
    }
}

impl fmt::Display for TrackingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified datagram payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Liveness probe
    Ping(TrackingKey),
    /// Reply to a probe
    Pong(TrackingKey),
    /// UTC time-sync, fire-and-forget
    TimeSync(DateTime<Utc>),
    /// Not a health frame; hand to the command layer unmodified
    Other(Bytes),
}

impl Frame {
    /// Build a time-sync frame truncated to millisecond precision.
    pub fn time_sync(at: DateTime<Utc>) -> Self {
        let millis = at.timestamp_subsec_millis();
        Frame::TimeSync(at.with_nanosecond(millis * 1_000_000).unwrap_or(at))
    }

    /// Classify a raw payload.
    pub fn decode(payload: &[u8]) -> Self {
        if let Some(key) = probe_key(payload, PING) {
            return Frame::Ping(key);
        }
        if let Some(key) = probe_key(payload, PONG) {
            return Frame::Pong(key);
        }
        if let Some(at) = std::str::from_utf8(payload)
            .ok()
            .and_then(|text| text.strip_prefix(ZULU_PREFIX))
            .and_then(parse_zulu)
        {
            return Frame::TimeSync(at);
        }
        Frame::Other(Bytes::copy_from_slice(payload))
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Ping(key) => encode_probe(PING, key),
            Frame::Pong(key) => encode_probe(PONG, key),
            Frame::TimeSync(at) => Bytes::from(format!(
                "{ZULU_PREFIX}{:04}{:02}{:02}:{:02}{:02}{:02}.{:03}",
                at.year(),
                at.month(),
                at.day(),
                at.hour(),
                at.minute(),
                at.second(),
                at.timestamp_subsec_millis().min(999),
            )),
            Frame::Other(bytes) => bytes.clone(),
        }
    }

    /// True for PING, PONG and ZULU frames.
    pub fn is_health_frame(&self) -> bool {
        !matches!(self, Frame::Other(_))
    }
}

/// Format a ping timestamp as `yyyymmdd.HHMMSS.mmm`.
pub fn format_ping_timestamp(time: DateTime<Utc>) -> String {
    format!(
        "{:04}{:02}{:02}.{:02}{:02}{:02}.{:03}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second(),
        time.timestamp_subsec_millis().min(999),
    )
}

fn probe_key(payload: &[u8], word: &[u8]) -> Option<TrackingKey> {
    let rest = payload.strip_prefix(word)?;
    if rest.is_empty() {
        return Some(TrackingKey::Bare);
    }
    let ts = rest.strip_prefix(b":")?;
    let ts = std::str::from_utf8(ts).ok()?;
    Some(TrackingKey::Timestamp(ts.to_string()))
}

fn encode_probe(word: &'static [u8], key: &TrackingKey) -> Bytes {
    match key {
        TrackingKey::Bare => Bytes::from_static(word),
        TrackingKey::Timestamp(ts) => {
            let mut buf = BytesMut::with_capacity(word.len() + 1 + ts.len());
            buf.put_slice(word);
            buf.put_u8(b':');
            buf.put_slice(ts.as_bytes());
            buf.freeze()
        }
    }
}

/// Parse `yyyymmdd:hhmmss.mmm`.
fn parse_zulu(text: &str) -> Option<DateTime<Utc>> {
    let (date, time) = text.split_once(':')?;
    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (hms, millis) = time.split_once('.')?;
    if hms.len() != 6 || millis.len() != 3 {
        return None;
    }
    if !hms.bytes().chain(millis.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let date = NaiveDate::from_ymd_opt(
        date[0..4].parse().ok()?,
        date[4..6].parse().ok()?,
        date[6..8].parse().ok()?,
    )?;
    let time = NaiveTime::from_hms_milli_opt(
        hms[0..2].parse().ok()?,
        hms[2..4].parse().ok()?,
        hms[4..6].parse().ok()?,
        millis.parse().ok()?,
    )?;
    Some(date.and_time(time).and_utc())
}
