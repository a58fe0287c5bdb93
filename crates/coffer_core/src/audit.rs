//! The integrity auditor: detection of referential and temporal anomalies
//! that offline mutation and partial sync can introduce.
//!
//! The auditor only reports; applying a fix is a separate, explicit call with
//! a caller-chosen strategy. It never invents data (reassignment requires a
//! caller-supplied target) and never auto-applies anything.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::record::{parse_field_date, EntityKind, Record};
use crate::store::RecordStore;

/// An anomaly found by [`IntegrityAuditor::checkup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// A foreign key points at an id absent from the referenced table.
    OrphanReference {
        /// Kind of the offending record.
        kind: EntityKind,
        /// Id of the offending record.
        id: Uuid,
        /// The foreign-key field.
        field: String,
        /// The table the field references.
        target_kind: EntityKind,
        /// The id that no longer exists there.
        missing_id: Uuid,
    },
    /// A record flagged active whose own end condition has already passed.
    StaleActiveRule {
        /// Kind of the offending record.
        kind: EntityKind,
        /// Id of the offending record.
        id: Uuid,
        /// When the record's declared end condition passed.
        ended_at: DateTime<Utc>,
    },
    /// A primary date more than one year ahead of the audit time.
    ImplausibleFutureDate {
        /// Kind of the offending record.
        kind: EntityKind,
        /// Id of the offending record.
        id: Uuid,
        /// The date field.
        field: String,
        /// The implausible value.
        date: DateTime<Utc>,
    },
}

impl Issue {
    /// The offending record.
    pub fn record(&self) -> (EntityKind, Uuid) {
        match self {
            Issue::OrphanReference { kind, id, .. }
            | Issue::StaleActiveRule { kind, id, .. }
            | Issue::ImplausibleFutureDate { kind, id, .. } => (*kind, *id),
        }
    }

    /// A human-readable description for the operator/UI.
    pub fn describe(&self) -> String {
        match self {
            Issue::OrphanReference {
                kind,
                id,
                field,
                target_kind,
                missing_id,
            } => format!(
                "{kind} record {id}: field {field} references {missing_id}, \
                 which no longer exists in {target_kind}"
            ),
            Issue::StaleActiveRule { kind, id, ended_at } => format!(
                "{kind} record {id} is still flagged active but ended at {ended_at}"
            ),
            Issue::ImplausibleFutureDate {
                kind,
                id,
                field,
                date,
            } => format!(
                "{kind} record {id}: field {field} is {date}, more than a year ahead \
                 (likely a data-entry error)"
            ),
        }
    }
}

/// An explicit remediation chosen by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixStrategy {
    /// Soft-delete the offending record.
    Delete,
    /// Deactivate the record (clear its active flag).
    Archive,
    /// Point the dangling reference at a caller-supplied target.
    Reassign {
        /// The replacement target id. Must exist in the referenced table.
        target: Uuid,
    },
}

/// Scans the store for anomalies and applies explicit fixes.
pub struct IntegrityAuditor {
    store: Arc<RecordStore>,
    future_horizon: Duration,
}

impl IntegrityAuditor {
    /// Creates an auditor with the standard one-year future-date horizon.
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            store,
            future_horizon: Duration::days(365),
        }
    }

    /// Runs every check over the full non-deleted record set.
    ///
    /// Checks are independent; one record can raise several issues. The scan
    /// works on the stored form, since every audited field (ids, dates,
    /// flags) is plaintext at rest.
    pub fn checkup(&self) -> CoreResult<Vec<Issue>> {
        let now = Utc::now();
        let mut issues = Vec::new();

        // One id snapshot per referenced table; soft-deleted targets count as
        // absent, which is exactly the orphan case offline deletion creates.
        let mut live_ids: HashMap<EntityKind, HashSet<Uuid>> = HashMap::new();
        for kind in EntityKind::ALL {
            let ids = self
                .store
                .list_raw(kind, false)?
                .into_iter()
                .map(|record| record.id)
                .collect();
            live_ids.insert(kind, ids);
        }

        for kind in EntityKind::ALL {
            for record in self.store.list_raw(kind, false)? {
                self.check_references(kind, &record, &live_ids, &mut issues);
                self.check_activity_window(kind, &record, now, &mut issues);
                self.check_future_dates(kind, &record, now, &mut issues);
            }
        }

        debug!(count = issues.len(), "integrity checkup complete");
        Ok(issues)
    }

    fn check_references(
        &self,
        kind: EntityKind,
        record: &Record,
        live_ids: &HashMap<EntityKind, HashSet<Uuid>>,
        issues: &mut Vec<Issue>,
    ) {
        for &(field, target_kind) in kind.reference_fields() {
            let Some(value) = record.fields.get(field) else { continue };
            let Some(reference) = value.as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                continue;
            };
            if !live_ids[&target_kind].contains(&reference) {
                issues.push(Issue::OrphanReference {
                    kind,
                    id: record.id,
                    field: field.to_string(),
                    target_kind,
                    missing_id: reference,
                });
            }
        }
    }

    fn check_activity_window(
        &self,
        kind: EntityKind,
        record: &Record,
        now: DateTime<Utc>,
        issues: &mut Vec<Issue>,
    ) {
        let Some((flag_field, end_field)) = kind.activity_window() else {
            return;
        };
        let active = record
            .fields
            .get(flag_field)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !active {
            return;
        }
        let Some(ended_at) = record.fields.get(end_field).and_then(parse_field_date) else {
            return;
        };
        if ended_at < now {
            issues.push(Issue::StaleActiveRule {
                kind,
                id: record.id,
                ended_at,
            });
        }
    }

    fn check_future_dates(
        &self,
        kind: EntityKind,
        record: &Record,
        now: DateTime<Utc>,
        issues: &mut Vec<Issue>,
    ) {
        let Some(field) = kind.primary_date_field() else { return };
        let Some(date) = record.fields.get(field).and_then(parse_field_date) else {
            return;
        };
        if date > now + self.future_horizon {
            issues.push(Issue::ImplausibleFutureDate {
                kind,
                id: record.id,
                field: field.to_string(),
                date,
            });
        }
    }

    /// Applies one remediation as a single atomic update.
    ///
    /// # Errors
    ///
    /// Rejects strategy/issue mismatches, and reassignments whose target does
    /// not exist (or is deleted) in the referenced table.
    pub fn fix(&self, issue: &Issue, strategy: &FixStrategy) -> CoreResult<()> {
        match (issue, strategy) {
            (_, FixStrategy::Delete) => {
                let (kind, id) = issue.record();
                self.store.soft_delete(kind, id)
            }
            (Issue::StaleActiveRule { kind, id, .. }, FixStrategy::Archive) => {
                let (flag_field, _) = kind
                    .activity_window()
                    .ok_or_else(|| CoreError::invalid_operation("record has no active flag"))?;
                let mut patch = Map::new();
                patch.insert(flag_field.to_string(), json!(false));
                self.store.mutate(*kind, *id, patch)
            }
            (
                Issue::OrphanReference {
                    kind,
                    id,
                    field,
                    target_kind,
                    ..
                },
                FixStrategy::Reassign { target },
            ) => {
                let replacement = self
                    .store
                    .get_raw(*target_kind, *target)?
                    .filter(|record| !record.is_deleted())
                    .ok_or(CoreError::RecordNotFound {
                        kind: *target_kind,
                        id: *target,
                    })?;
                let mut patch = Map::new();
                patch.insert(field.clone(), json!(replacement.id.to_string()));
                self.store.mutate(*kind, *id, patch)
            }
            (issue, strategy) => Err(CoreError::invalid_operation(format!(
                "strategy {strategy:?} does not apply to {}",
                issue.describe()
            ))),
        }
    }
}
