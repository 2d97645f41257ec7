//! Event Codec
//!
//! Canonical byte form of an [`AuditEvent`]. The same bytes are hashed,
//! signed over (through the content hash) and persisted, so the encoding
//! must be deterministic and every field, including absent optionals,
//! must take part in it.
//!
//! Layout (version 1, all integers big-endian):
//!
//! ```text
//! u8   schema version
//! [16] event_id
//! i64  timestamp seconds, u32 timestamp nanos
//! str  event_type
//! str  actor.user_id, str actor.org_id
//! str  resource.resource_type, str resource.resource_id
//! str  action
//! u8   outcome.success (0 or 1)
//! u32  detail count, then (str key, tagged value) in ascending key order
//! opt  risk_score (u8)
//! opt  correction_of ([16])
//! ```
//!
//! `str` is a u32 length followed by UTF-8 bytes; `opt` is a `0x00`/`0x01`
//! presence marker followed by the value when present.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::audit::event::{Actor, AuditEvent, DetailValue, EventType, Outcome, Resource};
use crate::error::{LedgerError, LedgerResult};

pub const SCHEMA_VERSION: u8 = 1;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;

const ABSENT: u8 = 0x00;
const PRESENT: u8 = 0x01;

/// Encode an event into its canonical byte form
pub fn canonicalize(event: &AuditEvent) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.push(SCHEMA_VERSION);
    out.extend_from_slice(event.event_id.as_bytes());
    out.extend_from_slice(&event.timestamp.timestamp().to_be_bytes());
    out.extend_from_slice(&event.timestamp.timestamp_subsec_nanos().to_be_bytes());
    put_str(&mut out, event.event_type.as_str());
    put_str(&mut out, &event.actor.user_id);
    put_str(&mut out, &event.actor.org_id);
    put_str(&mut out, &event.resource.resource_type);
    put_str(&mut out, &event.resource.resource_id);
    put_str(&mut out, &event.action);
    out.push(u8::from(event.outcome.success));

    // BTreeMap iterates in ascending key order
    out.extend_from_slice(&(event.outcome.details.len() as u32).to_be_bytes());
    for (key, value) in &event.outcome.details {
        put_str(&mut out, key);
        put_value(&mut out, value);
    }

    match event.risk_score {
        Some(score) => {
            out.push(PRESENT);
            out.push(score);
        }
        None => out.push(ABSENT),
    }

    match event.correction_of {
        Some(original) => {
            out.push(PRESENT);
            out.extend_from_slice(original.as_bytes());
        }
        None => out.push(ABSENT),
    }

    out
}

/// Decode canonical bytes back into an event
pub fn decode(bytes: &[u8]) -> LedgerResult<AuditEvent> {
    let mut reader = Reader::new(bytes);
    let version = reader.u8("schema version")?;
    match version {
        SCHEMA_VERSION => decode_v1(&mut reader),
        other => Err(LedgerError::malformed(format!(
            "unsupported schema version {}",
            other
        ))),
    }
}

fn decode_v1(reader: &mut Reader<'_>) -> LedgerResult<AuditEvent> {
    let event_id = reader.uuid("event_id")?;
    let secs = reader.i64("timestamp")?;
    let nanos = reader.u32("timestamp")?;
    let timestamp: DateTime<Utc> = DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| LedgerError::malformed("timestamp out of range"))?;

    let event_type: EventType = reader
        .string("event_type")?
        .parse()
        .map_err(LedgerError::MalformedEvent)?;

    let actor = Actor {
        user_id: reader.string("actor.user_id")?,
        org_id: reader.string("actor.org_id")?,
    };
    let resource = Resource {
        resource_type: reader.string("resource.resource_type")?,
        resource_id: reader.string("resource.resource_id")?,
    };
    let action = reader.string("action")?;
    let success = reader.flag("outcome.success")?;

    let count = reader.u32("details count")? as usize;
    let mut details = BTreeMap::new();
    let mut last_key: Option<String> = None;
    for _ in 0..count {
        let key = reader.string("details key")?;
        if let Some(prev) = &last_key {
            if key <= *prev {
                return Err(LedgerError::malformed(format!(
                    "details key {:?} is out of canonical order",
                    key
                )));
            }
        }
        let value = reader.value(&key)?;
        last_key = Some(key.clone());
        details.insert(key, value);
    }

    let risk_score = if reader.flag("risk_score marker")? {
        Some(reader.u8("risk_score")?)
    } else {
        None
    };

    let correction_of = if reader.flag("correction_of marker")? {
        Some(reader.uuid("correction_of")?)
    } else {
        None
    };

    reader.finish()?;

    Ok(AuditEvent {
        event_id,
        timestamp,
        event_type,
        actor,
        resource,
        action,
        outcome: Outcome { success, details },
        risk_score,
        correction_of,
    })
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn put_value(out: &mut Vec<u8>, value: &DetailValue) {
    match value {
        DetailValue::Null => out.push(TAG_NULL),
        DetailValue::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        DetailValue::Integer(i) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&i.to_be_bytes());
        }
        DetailValue::Float(f) => {
            // -0.0 == 0.0, so both must encode the same way
            let normalized = if *f == 0.0 { 0.0f64 } else { *f };
            out.push(TAG_FLOAT);
            out.extend_from_slice(&normalized.to_bits().to_be_bytes());
        }
        DetailValue::Text(s) => {
            out.push(TAG_TEXT);
            put_str(out, s);
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize, field: &str) -> LedgerResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                LedgerError::malformed(format!(
                    "truncated record while reading {} at offset {}",
                    field, self.offset
                ))
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, field: &str) -> LedgerResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N, field)?);
        Ok(buf)
    }

    fn u8(&mut self, field: &str) -> LedgerResult<u8> {
        Ok(self.take(1, field)?[0])
    }

    fn u32(&mut self, field: &str) -> LedgerResult<u32> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    fn i64(&mut self, field: &str) -> LedgerResult<i64> {
        Ok(i64::from_be_bytes(self.array(field)?))
    }

    fn flag(&mut self, field: &str) -> LedgerResult<bool> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(LedgerError::malformed(format!(
                "{} must be 0 or 1, found {}",
                field, other
            ))),
        }
    }

    fn uuid(&mut self, field: &str) -> LedgerResult<Uuid> {
        Ok(Uuid::from_bytes(self.array(field)?))
    }

    fn string(&mut self, field: &str) -> LedgerResult<String> {
        let len = self.u32(field)? as usize;
        let raw = self.take(len, field)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| LedgerError::malformed(format!("{} is not valid UTF-8: {}", field, e)))
    }

    fn value(&mut self, key: &str) -> LedgerResult<DetailValue> {
        match self.u8(key)? {
            TAG_NULL => Ok(DetailValue::Null),
            TAG_BOOL => Ok(DetailValue::Bool(self.flag(key)?)),
            TAG_INTEGER => Ok(DetailValue::Integer(self.i64(key)?)),
            TAG_FLOAT => {
                let f = f64::from_bits(u64::from_be_bytes(self.array(key)?));
                if !f.is_finite() {
                    return Err(LedgerError::malformed(format!(
                        "details.{} is not a finite number",
                        key
                    )));
                }
                Ok(DetailValue::Float(f))
            }
            TAG_TEXT => Ok(DetailValue::Text(self.string(key)?)),
            other => Err(LedgerError::malformed(format!(
                "details.{} has unknown value tag {:#04x}",
                key, other
            ))),
        }
    }

    fn finish(&self) -> LedgerResult<()> {
        if self.offset != self.bytes.len() {
            return Err(LedgerError::malformed(format!(
                "{} trailing bytes after record",
                self.bytes.len() - self.offset
            )));
        }
        Ok(())
    }
}
