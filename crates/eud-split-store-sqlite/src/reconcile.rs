//! Reference-splitting reconciliation over a live `SQLite` connection.
//!
//! Every function takes the connection explicitly; callers pass a `Transaction` (which derefs
//! to `Connection`) so that a forward or reverse pass commits as one unit.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use eud_split_core::{
    derive_clone_uid, original_uid, AttributeValue, CloneOutcome, CloneStatus, DropOutcome,
    DuplicateGroup, Endpoint, ReconcileError, ReconcileReport, RelationPlan, RelationReport,
    RelationRevert, RelationSpec, RevertReport, SchemaLayout, CLONE_SEPARATOR,
};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, warn};

/// Column names of `table` in declaration order; empty when the table does not exist.
///
/// # Errors
/// Returns an error when the table catalog cannot be read.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_identifier(table)))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

/// Every column of the endpoint table except its key.
///
/// # Errors
/// Returns an error when the endpoint table is missing or its catalog cannot be read.
pub fn endpoint_columns(conn: &Connection, layout: &SchemaLayout) -> Result<Vec<String>> {
    let columns = table_columns(conn, &layout.endpoint_table)?;
    if columns.is_empty() {
        return Err(anyhow!("endpoint table {} does not exist", layout.endpoint_table));
    }

    Ok(columns
        .into_iter()
        .filter(|column| !column.eq_ignore_ascii_case(&layout.endpoint_key))
        .collect())
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list<'a>(columns: impl IntoIterator<Item = &'a String>) -> String {
    columns.into_iter().map(|column| quote_identifier(column)).collect::<Vec<_>>().join(", ")
}

fn attribute_value(value: ValueRef<'_>) -> AttributeValue {
    match value {
        ValueRef::Null => AttributeValue::Null,
        ValueRef::Integer(number) => AttributeValue::Integer(number),
        ValueRef::Real(number) => AttributeValue::Real(number),
        ValueRef::Text(text) => AttributeValue::Text(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => AttributeValue::Blob(bytes.to_vec()),
    }
}

fn sql_value(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::Null => Value::Null,
        AttributeValue::Integer(number) => Value::Integer(*number),
        AttributeValue::Real(number) => Value::Real(*number),
        AttributeValue::Text(text) => Value::Text(text.clone()),
        AttributeValue::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

/// Load one endpoint row by uid, every column in its stored storage class.
///
/// # Errors
/// Returns an error when the endpoint table cannot be inspected or the lookup fails.
pub fn load_endpoint(
    conn: &Connection,
    layout: &SchemaLayout,
    uid: &str,
) -> Result<Option<Endpoint>> {
    let columns = endpoint_columns(conn, layout)?;
    let mut select_list = quote_identifier(&layout.endpoint_key);
    if !columns.is_empty() {
        select_list = format!("{select_list}, {}", column_list(&columns));
    }
    let query = format!(
        "SELECT {select_list} FROM {table} WHERE {key} = ?1",
        table = layout.endpoint_table,
        key = layout.endpoint_key,
    );
    let mut stmt = conn
        .prepare(&query)
        .with_context(|| format!("failed to prepare lookup on {}", layout.endpoint_table))?;

    let endpoint = stmt
        .query_row(params![uid], |row| {
            let mut attributes = BTreeMap::new();
            for (index, column) in columns.iter().enumerate() {
                attributes.insert(column.clone(), attribute_value(row.get_ref(index + 1)?));
            }
            Ok(Endpoint { uid: row.get(0)?, attributes })
        })
        .optional()
        .with_context(|| format!("failed to load endpoint {uid}"))?;

    Ok(endpoint)
}

/// # Errors
/// Returns an error when the existence query fails.
pub fn endpoint_exists(conn: &Connection, layout: &SchemaLayout, uid: &str) -> Result<bool> {
    let query = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1)",
        layout.endpoint_table, layout.endpoint_key
    );
    let exists = conn
        .query_row(&query, params![uid], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to check whether endpoint {uid} exists"))?;
    Ok(exists == 1)
}

/// Insert one endpoint row; columns absent from `endpoint.attributes` take their defaults.
///
/// # Errors
/// Returns an error when the insert fails, including when the uid is already taken.
pub fn insert_endpoint(
    conn: &Connection,
    layout: &SchemaLayout,
    endpoint: &Endpoint,
) -> Result<()> {
    let mut columns = vec![quote_identifier(&layout.endpoint_key)];
    let mut values = vec![Value::Text(endpoint.uid.clone())];
    for (column, value) in &endpoint.attributes {
        columns.push(quote_identifier(column));
        values.push(sql_value(value));
    }

    let placeholders = (1..=values.len()).map(|n| format!("?{n}")).collect::<Vec<_>>();
    let query = format!(
        "INSERT INTO {table}({columns}) VALUES ({values})",
        table = layout.endpoint_table,
        columns = columns.join(", "),
        values = placeholders.join(", "),
    );

    conn.execute(&query, params_from_iter(values))
        .with_context(|| format!("failed to insert endpoint {}", endpoint.uid))?;
    Ok(())
}

/// Copy the row of `original` under `clone_uid` inside the store, cell for cell.
///
/// Returns the number of rows written: 0 when `original` does not exist.
///
/// # Errors
/// Returns an error when the endpoint table cannot be inspected or the insert fails.
pub fn copy_endpoint_row(
    conn: &Connection,
    layout: &SchemaLayout,
    original: &str,
    clone_uid: &str,
) -> Result<usize> {
    let columns = endpoint_columns(conn, layout)?;
    let key = quote_identifier(&layout.endpoint_key);
    let (target, source) = if columns.is_empty() {
        (key.clone(), "?1".to_string())
    } else {
        let listed = column_list(&columns);
        (format!("{key}, {listed}"), format!("?1, {listed}"))
    };
    let statement = format!(
        "INSERT INTO {table}({target}) SELECT {source} FROM {table} WHERE {key} = ?2",
        table = layout.endpoint_table,
    );

    conn.execute(&statement, params![clone_uid, original])
        .with_context(|| format!("failed to copy endpoint {original} to {clone_uid}"))
}

/// Find every endpoint referenced by more than one record of `relation`.
///
/// Groups come back ordered by endpoint uid, record ids ascending inside each group. NULL
/// foreign keys never participate.
///
/// # Errors
/// Returns an error when the relation cannot be scanned.
pub fn find_duplicate_groups(
    conn: &Connection,
    relation: &RelationSpec,
) -> Result<Vec<DuplicateGroup>> {
    let query = format!(
        "SELECT {fk}, {id} FROM {table}
         WHERE {fk} IN (
             SELECT {fk} FROM {table}
             WHERE {fk} IS NOT NULL
             GROUP BY {fk}
             HAVING COUNT(*) > 1
         )
         ORDER BY {fk} ASC, {id} ASC",
        fk = relation.fk_column,
        id = relation.id_column,
        table = relation.table,
    );
    let mut stmt = conn
        .prepare(&query)
        .with_context(|| format!("failed to scan {relation} for duplicates"))?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    let mut groups: Vec<DuplicateGroup> = Vec::new();
    for row in rows {
        let (endpoint_uid, record_id) = row?;
        match groups.last_mut() {
            Some(group) if group.endpoint_uid == endpoint_uid => group.record_ids.push(record_id),
            _ => groups.push(DuplicateGroup {
                relation: relation.table.clone(),
                endpoint_uid,
                record_ids: vec![record_id],
            }),
        }
    }

    Ok(groups)
}

/// Produce the clone of `original` that `record_id` of `relation` will point at.
///
/// An endpoint already present under the derived uid is returned untouched, which makes
/// re-runs and clones shared between relations safe.
///
/// # Errors
/// Returns `ReconcileError::EndpointNotFound` when the original endpoint no longer exists, or
/// an error when any store access fails.
pub fn clone_endpoint(
    conn: &Connection,
    layout: &SchemaLayout,
    relation: &RelationSpec,
    original: &str,
    record_id: i64,
) -> Result<CloneOutcome> {
    let clone_uid = derive_clone_uid(original, record_id);
    if endpoint_exists(conn, layout, &clone_uid)? {
        debug!(%clone_uid, relation = %relation.table, "reusing existing clone");
        return Ok(CloneOutcome { uid: clone_uid, status: CloneStatus::Reused });
    }

    if copy_endpoint_row(conn, layout, original, &clone_uid)? == 0 {
        return Err(ReconcileError::EndpointNotFound {
            relation: relation.table.clone(),
            endpoint_uid: original.to_string(),
            record_id,
        }
        .into());
    }

    debug!(%clone_uid, original, relation = %relation.table, "cloned endpoint");
    Ok(CloneOutcome { uid: clone_uid, status: CloneStatus::Created })
}

/// Point one record of `relation` at `endpoint_uid`.
///
/// # Errors
/// Returns an error when the update fails or the record does not exist.
pub fn repoint_record(
    conn: &Connection,
    relation: &RelationSpec,
    record_id: i64,
    endpoint_uid: &str,
) -> Result<()> {
    let query = format!(
        "UPDATE {} SET {} = ?1 WHERE {} = ?2",
        relation.table, relation.fk_column, relation.id_column
    );
    let changed = conn
        .execute(&query, params![endpoint_uid, record_id])
        .with_context(|| format!("failed to repoint {relation} record {record_id}"))?;

    if changed != 1 {
        return Err(anyhow!(
            "expected to repoint exactly one {} record with id {record_id}, updated {changed}",
            relation.table
        ));
    }

    Ok(())
}

/// Split every duplicate group of one relation: the keeper stays, every other record moves to
/// its own clone.
///
/// # Errors
/// Returns an error on the first group that cannot be split; nothing is skipped.
pub fn reconcile_relation(
    conn: &Connection,
    layout: &SchemaLayout,
    relation: &RelationSpec,
) -> Result<RelationReport> {
    let groups = find_duplicate_groups(conn, relation)?;
    let mut report = RelationReport {
        relation: relation.table.clone(),
        groups: groups.len(),
        ..RelationReport::default()
    };

    for group in &groups {
        debug!(
            relation = %relation.table,
            endpoint_uid = %group.endpoint_uid,
            keeper = ?group.keeper(),
            excess = group.excess().len(),
            "splitting duplicate group"
        );

        for &record_id in group.excess() {
            let outcome = clone_endpoint(conn, layout, relation, &group.endpoint_uid, record_id)?;
            repoint_record(conn, relation, record_id, &outcome.uid)?;

            match outcome.status {
                CloneStatus::Created => report.clones_created += 1,
                CloneStatus::Reused => report.clones_reused += 1,
            }
            report.records_reassigned += 1;
        }
    }

    info!(
        relation = %relation.table,
        groups = report.groups,
        reassigned = report.records_reassigned,
        created = report.clones_created,
        reused = report.clones_reused,
        "relation reconciled"
    );
    Ok(report)
}

/// Add the NULL-tolerant unique index guarding `relation`'s foreign key.
///
/// # Errors
/// Returns `ReconcileError::ConstraintViolation` naming the first remaining duplicate group,
/// or an error when the index cannot be created.
pub fn install_unique_index(conn: &Connection, relation: &RelationSpec) -> Result<()> {
    if let Some(group) = find_duplicate_groups(conn, relation)?.into_iter().next() {
        return Err(ReconcileError::ConstraintViolation {
            relation: relation.table.clone(),
            column: relation.fk_column.clone(),
            endpoint_uid: group.endpoint_uid,
            record_ids: group.record_ids,
        }
        .into());
    }

    let statement = format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table}({fk}) WHERE {fk} IS NOT NULL",
        index = relation.unique_index,
        table = relation.table,
        fk = relation.fk_column,
    );
    conn.execute_batch(&statement)
        .with_context(|| format!("failed to create unique index {}", relation.unique_index))?;

    info!(index = %relation.unique_index, relation = %relation, "unique index installed");
    Ok(())
}

/// # Errors
/// Returns an error when the index catalog cannot be read or the drop fails.
pub fn drop_unique_index(conn: &Connection, relation: &RelationSpec) -> Result<DropOutcome> {
    if !index_exists(conn, &relation.unique_index)? {
        warn!(index = %relation.unique_index, "unique index already absent");
        return Ok(DropOutcome::Absent);
    }

    conn.execute_batch(&format!("DROP INDEX {}", relation.unique_index))
        .with_context(|| format!("failed to drop unique index {}", relation.unique_index))?;
    info!(index = %relation.unique_index, "unique index dropped");
    Ok(DropOutcome::Dropped)
}

/// Rewrite every clone reference of `relation` back to its original endpoint uid.
///
/// The rewrite is purely syntactic and must run before clones are deleted.
///
/// # Errors
/// Returns an error when references cannot be read or rewritten.
pub fn restore_original_references(conn: &Connection, relation: &RelationSpec) -> Result<usize> {
    let query = format!(
        "SELECT {id}, {fk} FROM {table} WHERE instr({fk}, ?1) > 0 ORDER BY {id} ASC",
        id = relation.id_column,
        fk = relation.fk_column,
        table = relation.table,
    );
    let rewrites = {
        let mut stmt = conn
            .prepare(&query)
            .with_context(|| format!("failed to scan {relation} for clone references"))?;
        let rows = stmt.query_map(params![CLONE_SEPARATOR], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut rewrites = Vec::new();
        for row in rows {
            let (record_id, uid) = row?;
            rewrites.push((record_id, original_uid(&uid).to_string()));
        }
        rewrites
    };

    for (record_id, original) in &rewrites {
        repoint_record(conn, relation, *record_id, original)?;
    }

    info!(relation = %relation, restored = rewrites.len(), "clone references restored");
    Ok(rewrites.len())
}

/// Delete every endpoint whose uid carries the clone separator.
///
/// # Errors
/// Returns an error when the delete fails, e.g. a clone is still referenced under enforced
/// foreign keys.
pub fn delete_clones(conn: &Connection, layout: &SchemaLayout) -> Result<usize> {
    let statement = format!(
        "DELETE FROM {} WHERE instr({}, ?1) > 0",
        layout.endpoint_table, layout.endpoint_key
    );
    let deleted = conn
        .execute(&statement, params![CLONE_SEPARATOR])
        .context("failed to delete cloned endpoints")?;
    info!(deleted, "cloned endpoints deleted");
    Ok(deleted)
}

/// Run the forward pass: split every relation in layout order, then guard each with a
/// unique index.
///
/// # Errors
/// Returns an error when the layout is invalid or any step fails.
pub fn reconcile_all(conn: &Connection, layout: &SchemaLayout) -> Result<ReconcileReport> {
    layout.validate()?;

    let mut report = ReconcileReport::default();
    for relation in &layout.relations {
        report.relations.push(reconcile_relation(conn, layout, relation)?);
    }

    // Indexes go in only once every relation is split.
    for relation in &layout.relations {
        install_unique_index(conn, relation)?;
        report.unique_indexes.push(relation.unique_index.clone());
    }

    Ok(report)
}

/// Undo the forward pass: drop indexes, restore original references, then delete clones.
///
/// # Errors
/// Returns an error when the layout is invalid or any step fails.
pub fn revert_all(conn: &Connection, layout: &SchemaLayout) -> Result<RevertReport> {
    layout.validate()?;

    let mut outcomes = Vec::with_capacity(layout.relations.len());
    for relation in &layout.relations {
        outcomes.push(drop_unique_index(conn, relation)?);
    }

    let mut report = RevertReport::default();
    for (relation, unique_index) in layout.relations.iter().zip(outcomes) {
        let records_restored = restore_original_references(conn, relation)?;
        report.relations.push(RelationRevert {
            relation: relation.table.clone(),
            unique_index,
            records_restored,
        });
    }

    report.clones_deleted = delete_clones(conn, layout)?;
    Ok(report)
}

/// Describe what the forward pass would do without touching the store.
///
/// # Errors
/// Returns an error when the layout is invalid or a relation cannot be scanned.
pub fn plan_all(conn: &Connection, layout: &SchemaLayout) -> Result<Vec<RelationPlan>> {
    layout.validate()?;

    let mut plans = Vec::with_capacity(layout.relations.len());
    for relation in &layout.relations {
        let groups = find_duplicate_groups(conn, relation)?;
        plans.push(RelationPlan::from_groups(&relation.table, &groups));
    }
    Ok(plans)
}

/// Count clones that no relation references any more.
///
/// # Errors
/// Returns an error when the endpoint or relation tables cannot be read.
pub fn count_orphaned_clones(conn: &Connection, layout: &SchemaLayout) -> Result<usize> {
    let query = format!(
        "SELECT {} FROM {} WHERE instr({}, ?1) > 0",
        layout.endpoint_key, layout.endpoint_table, layout.endpoint_key
    );
    let mut stmt = conn.prepare(&query).context("failed to list cloned endpoints")?;
    let rows = stmt.query_map(params![CLONE_SEPARATOR], |row| row.get::<_, String>(0))?;

    let mut orphaned = 0_usize;
    for row in rows {
        let uid = row?;
        let mut referenced = false;
        for relation in &layout.relations {
            let reference_check = format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1)",
                relation.table, relation.fk_column
            );
            if conn.query_row(&reference_check, params![uid], |row| row.get::<_, i64>(0))? == 1 {
                referenced = true;
                break;
            }
        }

        if !referenced {
            orphaned += 1;
        }
    }

    Ok(orphaned)
}

pub(crate) fn index_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
            params![index_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if index exists: {index_name}"))?;
    Ok(exists == 1)
}
