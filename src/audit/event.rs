//! Audit Event
//!
//! The immutable fact recorded by the ledger, and the request shape callers
//! submit before an `event_id` and timestamp have been assigned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

pub const MAX_TEXT_LEN: usize = 4096;
pub const MAX_DETAILS: usize = 256;
pub const MAX_PARTITION_LEN: usize = 128;
pub const MAX_RISK_SCORE: u8 = 100;

/// Category of an audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AccessControl,
    UserAuthentication,
    DataAccess,
    ConfigurationChange,
    KeyManagement,
    ApprovalWorkflow,
    PolicyViolation,
    System,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::AccessControl,
        EventType::UserAuthentication,
        EventType::DataAccess,
        EventType::ConfigurationChange,
        EventType::KeyManagement,
        EventType::ApprovalWorkflow,
        EventType::PolicyViolation,
        EventType::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AccessControl => "access_control",
            EventType::UserAuthentication => "user_authentication",
            EventType::DataAccess => "data_access",
            EventType::ConfigurationChange => "configuration_change",
            EventType::KeyManagement => "key_management",
            EventType::ApprovalWorkflow => "approval_workflow",
            EventType::PolicyViolation => "policy_violation",
            EventType::System => "system",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused the event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub org_id: String,
}

/// What the event acted upon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_type: String,
    pub resource_id: String,
}

/// Primitive value carried in an outcome's details map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetailValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for DetailValue {
    fn from(value: &str) -> Self {
        DetailValue::Text(value.to_string())
    }
}

impl From<String> for DetailValue {
    fn from(value: String) -> Self {
        DetailValue::Text(value)
    }
}

impl From<bool> for DetailValue {
    fn from(value: bool) -> Self {
        DetailValue::Bool(value)
    }
}

impl From<i64> for DetailValue {
    fn from(value: i64) -> Self {
        DetailValue::Integer(value)
    }
}

impl From<f64> for DetailValue {
    fn from(value: f64) -> Self {
        DetailValue::Float(value)
    }
}

/// Success flag plus structured details, ordered by key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default)]
    pub details: BTreeMap<String, DetailValue>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            success: true,
            details: BTreeMap::new(),
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<DetailValue>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// One immutable audited fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub actor: Actor,
    pub resource: Resource,
    pub action: String,
    pub outcome: Outcome,
    pub risk_score: Option<u8>,
    pub correction_of: Option<Uuid>,
}

impl AuditEvent {
    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "{} {} by {} on {}/{} ({})",
            self.event_type,
            self.action,
            self.actor.user_id,
            self.resource.resource_type,
            self.resource.resource_id,
            if self.outcome.success { "ok" } else { "failed" }
        )
    }
}

/// Event as submitted by a caller, before ingestion assigns identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub event_type: String,
    pub actor: Actor,
    pub resource: Resource,
    pub action: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub risk_score: Option<u8>,
    #[serde(default)]
    pub correction_of: Option<Uuid>,
}

impl NewAuditEvent {
    pub fn new(
        event_type: EventType,
        actor: Actor,
        resource: Resource,
        action: &str,
        outcome: Outcome,
    ) -> Self {
        Self {
            timestamp: None,
            event_type: event_type.as_str().to_string(),
            actor,
            resource,
            action: action.to_string(),
            outcome,
            risk_score: None,
            correction_of: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_risk_score(mut self, score: u8) -> Self {
        self.risk_score = Some(score);
        self
    }

    pub fn correcting(mut self, original: Uuid) -> Self {
        self.correction_of = Some(original);
        self
    }

    /// Check required fields and limits, returning the parsed event type
    pub fn validate(&self) -> LedgerResult<EventType> {
        let event_type: EventType = self
            .event_type
            .parse()
            .map_err(LedgerError::InvalidEvent)?;

        require_text("actor.user_id", &self.actor.user_id)?;
        require_text("actor.org_id", &self.actor.org_id)?;
        require_text("resource.resource_type", &self.resource.resource_type)?;
        require_text("resource.resource_id", &self.resource.resource_id)?;
        require_text("action", &self.action)?;

        if let Some(score) = self.risk_score {
            if score > MAX_RISK_SCORE {
                return Err(LedgerError::InvalidEvent(format!(
                    "risk_score {} exceeds {}",
                    score, MAX_RISK_SCORE
                )));
            }
        }

        if self.outcome.details.len() > MAX_DETAILS {
            return Err(LedgerError::InvalidEvent(format!(
                "outcome.details has {} entries (maximum {})",
                self.outcome.details.len(),
                MAX_DETAILS
            )));
        }

        for (key, value) in &self.outcome.details {
            require_text("outcome.details key", key)?;
            match value {
                DetailValue::Float(f) if !f.is_finite() => {
                    return Err(LedgerError::InvalidEvent(format!(
                        "outcome.details.{} is not a finite number",
                        key
                    )));
                }
                DetailValue::Text(s) if s.len() > MAX_TEXT_LEN => {
                    return Err(LedgerError::InvalidEvent(format!(
                        "outcome.details.{} exceeds {} bytes",
                        key, MAX_TEXT_LEN
                    )));
                }
                _ => {}
            }
        }

        Ok(event_type)
    }

    /// Validate and turn the request into an immutable event
    pub fn into_event(self, event_id: Uuid, received_at: DateTime<Utc>) -> LedgerResult<AuditEvent> {
        let event_type = self.validate()?;
        Ok(AuditEvent {
            event_id,
            timestamp: self.timestamp.unwrap_or(received_at),
            event_type,
            actor: self.actor,
            resource: self.resource,
            action: self.action,
            outcome: self.outcome,
            risk_score: self.risk_score,
            correction_of: self.correction_of,
        })
    }
}

fn require_text(field: &str, value: &str) -> LedgerResult<()> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidEvent(format!("{} is required", field)));
    }
    if value.len() > MAX_TEXT_LEN {
        return Err(LedgerError::InvalidEvent(format!(
            "{} exceeds {} bytes",
            field, MAX_TEXT_LEN
        )));
    }
    Ok(())
}

/// Partition keys are short identifiers such as an organization id
pub fn validate_partition(partition: &str) -> LedgerResult<()> {
    if partition.is_empty() || partition.len() > MAX_PARTITION_LEN {
        return Err(LedgerError::InvalidEvent(format!(
            "partition must be 1-{} characters",
            MAX_PARTITION_LEN
        )));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-');
    if !partition.chars().all(allowed) {
        return Err(LedgerError::InvalidEvent(format!(
            "partition {:?} contains unsupported characters",
            partition
        )));
    }
    Ok(())
}
