//! The universal record model and the static per-entity schema configuration.
//!
//! Coffer does not interpret business entities beyond what sync, encryption,
//! and auditing need: every row is a [`Record`] with a JSON field map plus
//! lifecycle metadata. The per-kind knowledge (which fields are sensitive,
//! which fields reference other tables, which field carries the primary date)
//! is static configuration in this module, not runtime inference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::CoreError;

/// The logical tables a Coffer store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A money movement.
    Transaction,
    /// A spending/income category.
    Category,
    /// A usage context (e.g. personal, business).
    Context,
    /// A shared group of users.
    Group,
    /// A recurring transaction rule.
    RecurringRule,
    /// A per-category budget.
    Budget,
}

impl EntityKind {
    /// All entity kinds, in sync order.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Category,
        EntityKind::Context,
        EntityKind::Group,
        EntityKind::Transaction,
        EntityKind::RecurringRule,
        EntityKind::Budget,
    ];

    /// Returns the SQL table name for this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Transaction => "transactions",
            EntityKind::Category => "categories",
            EntityKind::Context => "contexts",
            EntityKind::Group => "groups",
            EntityKind::RecurringRule => "recurring_rules",
            EntityKind::Budget => "budgets",
        }
    }

    /// Field names stored ciphertext-at-rest for this kind.
    ///
    /// Anything needed as a query or sort index (ids, dates, flags, foreign
    /// keys) stays plaintext; free text, amounts, and personal names do not.
    pub fn sensitive_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Transaction => &["description", "amount", "payee"],
            EntityKind::Category => &["name"],
            EntityKind::Context => &["name"],
            EntityKind::Group => &["name", "note"],
            EntityKind::RecurringRule => &["description", "amount"],
            EntityKind::Budget => &["amount", "note"],
        }
    }

    /// Foreign-key fields and the kind they reference.
    pub fn reference_fields(&self) -> &'static [(&'static str, EntityKind)] {
        match self {
            EntityKind::Transaction => &[
                ("category_id", EntityKind::Category),
                ("context_id", EntityKind::Context),
                ("group_id", EntityKind::Group),
            ],
            EntityKind::RecurringRule => &[("category_id", EntityKind::Category)],
            EntityKind::Budget => &[("category_id", EntityKind::Category)],
            _ => &[],
        }
    }

    /// The primary date field, if the kind has one, used by the
    /// implausible-future-date audit.
    pub fn primary_date_field(&self) -> Option<&'static str> {
        match self {
            EntityKind::Transaction => Some("date"),
            EntityKind::RecurringRule => Some("start_date"),
            EntityKind::Budget => Some("period_start"),
            _ => None,
        }
    }

    /// The `(active flag, end date)` field pair for kinds that declare their
    /// own end condition, used by the stale-active audit.
    pub fn activity_window(&self) -> Option<(&'static str, &'static str)> {
        match self {
            EntityKind::RecurringRule => Some(("active", "end_date")),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.table() == s)
            .ok_or_else(|| CoreError::invalid_format(format!("unknown entity table: {s}")))
    }
}

/// The universal unit synchronized and encrypted.
///
/// A record is keyed by a client-generated id (offline creation never waits
/// on the remote authority), carries a JSON field map whose sensitive subset
/// is tokenized at rest, and tracks its sync lifecycle:
///
/// - `pending_sync` is set by every local write and cleared only by the sync
///   engine once the remote authority acknowledged that exact state;
/// - `deleted_at` is a soft-delete tombstone, terminal from the sync engine's
///   perspective (only an explicit restore clears it);
/// - `version` is the last known remote revision, opaque to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Globally unique id, immutable, never reused.
    pub id: Uuid,
    /// Field name to value mapping.
    pub fields: Map<String, Value>,
    /// Last local mutation time, used for conflict tie-breaking.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker; non-null means logically gone but retained.
    pub deleted_at: Option<DateTime<Utc>>,
    /// True while this state has not been acknowledged by the authority.
    pub pending_sync: bool,
    /// Last known remote revision, if any.
    pub version: Option<i64>,
}

impl Record {
    /// Creates a fresh local record, pending sync.
    pub fn new(id: Uuid, fields: Map<String, Value>) -> Self {
        Self {
            id,
            fields,
            updated_at: Utc::now(),
            deleted_at: None,
            pending_sync: true,
            version: None,
        }
    }

    /// Returns true if the record carries a soft-delete tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Parses a date value out of a field map entry.
///
/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (interpreted at
/// UTC midnight), the two forms callers store.
pub fn parse_field_date(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    Some(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0)?,
        Utc,
    ))
}
