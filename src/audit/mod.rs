//! Audit Trail
//!
//! Events are canonicalized, hashed, linked to their predecessor and signed
//! before they are committed to a partition's chain.

pub mod block;
pub mod codec;
pub mod event;
pub mod ledger;
pub mod verify;

pub use block::{ChainBlock, ChainTip, ContentHash};
pub use event::{Actor, AuditEvent, DetailValue, EventType, NewAuditEvent, Outcome, Resource};
pub use ledger::{AuditLedger, RetryPolicy};
pub use verify::{AuditProof, ChainVerificationResult, ChainVerifier};
