use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Token joining an original endpoint uid and a referencing record id into a clone uid.
pub const CLONE_SEPARATOR: &str = "::dup::";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error(
        "endpoint {endpoint_uid} referenced by {relation} record {record_id} does not exist"
    )]
    EndpointNotFound { relation: String, endpoint_uid: String, record_id: i64 },
    #[error(
        "cannot enforce unique {relation}.{column}: endpoint {endpoint_uid} is still shared by records {record_ids:?}"
    )]
    ConstraintViolation {
        relation: String,
        column: String,
        endpoint_uid: String,
        record_ids: Vec<i64>,
    },
    #[error("invalid schema layout: {0}")]
    InvalidLayout(String),
}

/// Build the uid of the clone that `record_id` receives when split off `original_uid`.
#[must_use]
pub fn derive_clone_uid(original_uid: &str, record_id: i64) -> String {
    format!("{original_uid}{CLONE_SEPARATOR}{record_id}")
}

/// Split a clone uid back into the original uid and the record-id suffix.
///
/// Truncation happens at the first separator, so the original uid is recovered even when a
/// clone was itself split again later.
#[must_use]
pub fn split_clone_uid(uid: &str) -> Option<(&str, &str)> {
    uid.split_once(CLONE_SEPARATOR)
}

#[must_use]
pub fn is_clone_uid(uid: &str) -> bool {
    uid.contains(CLONE_SEPARATOR)
}

/// Original endpoint uid for `uid`; non-clone uids are returned unchanged.
#[must_use]
pub fn original_uid(uid: &str) -> &str {
    split_clone_uid(uid).map_or(uid, |(original, _)| original)
}

/// One stored cell of an endpoint row, kept in its `SQLite` storage class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// An endpoint row: its key plus every other column, by column name.
///
/// The column set is whatever the endpoint table declares; clones carry the same map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub uid: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Endpoint {
    #[must_use]
    pub fn new(uid: &str) -> Self {
        Self { uid: uid.to_string(), attributes: BTreeMap::new() }
    }

    #[must_use]
    pub fn with_attribute(mut self, column: &str, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(column.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn attribute(&self, column: &str) -> Option<&AttributeValue> {
        self.attributes.get(column)
    }

    #[must_use]
    pub fn is_clone(&self) -> bool {
        is_clone_uid(&self.uid)
    }

    /// Copy of this endpoint under the uid derived for `record_id`.
    #[must_use]
    pub fn clone_for(&self, record_id: i64) -> Self {
        Self { uid: derive_clone_uid(&self.uid, record_id), attributes: self.attributes.clone() }
    }
}

/// One referencing relation: a table whose foreign key must end up unique.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RelationSpec {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    pub fk_column: String,
    pub unique_index: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl RelationSpec {
    #[must_use]
    pub fn new(table: &str, fk_column: &str) -> Self {
        Self {
            table: table.to_string(),
            id_column: default_id_column(),
            fk_column: fk_column.to_string(),
            unique_index: format!("{table}_{fk_column}_key"),
        }
    }
}

impl Display for RelationSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.fk_column)
    }
}

/// Table and column names the reconciliation runs against.
///
/// Relations are reconciled in the listed order; later relations observe clones created by
/// earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaLayout {
    pub endpoint_table: String,
    pub endpoint_key: String,
    pub relations: Vec<RelationSpec>,
}

impl Default for SchemaLayout {
    fn default() -> Self {
        Self {
            endpoint_table: "euds".to_string(),
            endpoint_key: "uid".to_string(),
            relations: vec![
                RelationSpec::new("certificates", "eud_uid"),
                RelationSpec::new("data_packages", "creator_uid"),
            ],
        }
    }
}

impl SchemaLayout {
    /// Reject layouts whose names cannot be safely spliced into SQL or that repeat a relation.
    ///
    /// # Errors
    /// Returns `ReconcileError::InvalidLayout` describing the first offending entry.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        check_identifier("endpoint_table", &self.endpoint_table)?;
        check_identifier("endpoint_key", &self.endpoint_key)?;

        if self.relations.is_empty() {
            return Err(ReconcileError::InvalidLayout(
                "at least one referencing relation is required".to_string(),
            ));
        }

        let mut tables = BTreeSet::new();
        let mut indexes = BTreeSet::new();
        for relation in &self.relations {
            check_identifier("table", &relation.table)?;
            check_identifier("id_column", &relation.id_column)?;
            check_identifier("fk_column", &relation.fk_column)?;
            check_identifier("unique_index", &relation.unique_index)?;

            if relation.table == self.endpoint_table {
                return Err(ReconcileError::InvalidLayout(format!(
                    "relation table {} is the endpoint table",
                    relation.table
                )));
            }
            if !tables.insert(relation.table.as_str()) {
                return Err(ReconcileError::InvalidLayout(format!(
                    "relation table {} listed more than once",
                    relation.table
                )));
            }
            if !indexes.insert(relation.unique_index.as_str()) {
                return Err(ReconcileError::InvalidLayout(format!(
                    "unique index name {} listed more than once",
                    relation.unique_index
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn relation(&self, table: &str) -> Option<&RelationSpec> {
        self.relations.iter().find(|relation| relation.table == table)
    }
}

fn check_identifier(field: &str, value: &str) -> Result<(), ReconcileError> {
    let mut chars = value.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Ok(());
    }

    Err(ReconcileError::InvalidLayout(format!(
        "{field} must be a plain SQL identifier, got {value:?}"
    )))
}

/// Records of one relation sharing one endpoint, ascending by record id.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateGroup {
    pub relation: String,
    pub endpoint_uid: String,
    pub record_ids: Vec<i64>,
}

impl DuplicateGroup {
    /// The earliest record, which keeps the original endpoint.
    #[must_use]
    pub fn keeper(&self) -> Option<i64> {
        self.record_ids.first().copied()
    }

    /// Records that must move to a clone.
    #[must_use]
    pub fn excess(&self) -> &[i64] {
        self.record_ids.get(1..).unwrap_or(&[])
    }

    #[must_use]
    pub fn planned_clones(&self) -> Vec<PlannedClone> {
        self.excess()
            .iter()
            .map(|&record_id| PlannedClone {
                record_id,
                clone_uid: derive_clone_uid(&self.endpoint_uid, record_id),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlannedClone {
    pub record_id: i64,
    pub clone_uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GroupPlan {
    pub endpoint_uid: String,
    pub keeper: i64,
    pub clones: Vec<PlannedClone>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RelationPlan {
    pub relation: String,
    pub groups: Vec<GroupPlan>,
}

impl RelationPlan {
    #[must_use]
    pub fn from_groups(relation: &str, groups: &[DuplicateGroup]) -> Self {
        Self {
            relation: relation.to_string(),
            groups: groups
                .iter()
                .filter_map(|group| {
                    Some(GroupPlan {
                        endpoint_uid: group.endpoint_uid.clone(),
                        keeper: group.keeper()?,
                        clones: group.planned_clones(),
                    })
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn reassignments(&self) -> usize {
        self.groups.iter().map(|group| group.clones.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CloneStatus {
    Created,
    Reused,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CloneOutcome {
    pub uid: String,
    pub status: CloneStatus,
}

/// Result of removing a unique index; a missing index is an expected outcome on reversal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DropOutcome {
    Dropped,
    Absent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RelationReport {
    pub relation: String,
    pub groups: usize,
    pub records_reassigned: usize,
    pub clones_created: usize,
    pub clones_reused: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileReport {
    pub relations: Vec<RelationReport>,
    pub unique_indexes: Vec<String>,
}

impl ReconcileReport {
    #[must_use]
    pub fn clones_created(&self) -> usize {
        self.relations.iter().map(|relation| relation.clones_created).sum()
    }

    #[must_use]
    pub fn records_reassigned(&self) -> usize {
        self.relations.iter().map(|relation| relation.records_reassigned).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RelationRevert {
    pub relation: String,
    pub unique_index: DropOutcome,
    pub records_restored: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RevertReport {
    pub relations: Vec<RelationRevert>,
    pub clones_deleted: usize,
}
