use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use eud_split_core::{
    DuplicateGroup, Endpoint, ReconcileReport, RelationPlan, RevertReport, SchemaLayout,
};
use rusqlite::{params, Connection, DatabaseName, OpenFlags};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

pub mod reconcile;

const LATEST_SCHEMA_VERSION: i64 = 2;
const SPLIT_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

pub(crate) const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS euds (
  uid TEXT PRIMARY KEY,
  callsign TEXT,
  device TEXT,
  os TEXT,
  platform TEXT,
  version TEXT,
  phone_number TEXT,
  last_event_time TEXT,
  last_status TEXT,
  user_id INTEGER,
  team_id INTEGER,
  team_role TEXT,
  meshtastic_id INTEGER,
  meshtastic_macaddr TEXT,
  last_meshtastic_publish TEXT
);

CREATE TABLE IF NOT EXISTS certificates (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  common_name TEXT NOT NULL,
  eud_uid TEXT,
  callsign TEXT,
  expiration_date TEXT,
  FOREIGN KEY (eud_uid) REFERENCES euds(uid)
);

CREATE TABLE IF NOT EXISTS data_packages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  hash TEXT NOT NULL,
  filename TEXT NOT NULL,
  creator_uid TEXT,
  submission_time TEXT,
  FOREIGN KEY (creator_uid) REFERENCES euds(uid)
);

CREATE INDEX IF NOT EXISTS idx_certificates_eud_uid ON certificates(eud_uid);
CREATE INDEX IF NOT EXISTS idx_data_packages_creator_uid ON data_packages(creator_uid);
";

pub struct SqliteStore {
    conn: Connection,
    layout: SchemaLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationSummary {
    pub applied_versions: Vec<i64>,
    pub reconcile: Option<ReconcileReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DowngradeSummary {
    pub reverted_versions: Vec<i64>,
    pub revert: Option<RevertReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub orphaned_clones: usize,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed EUD store using the default EUD schema layout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_layout(path, SchemaLayout::default())
    }

    /// Open a store whose endpoint and referencing tables follow `layout`.
    ///
    /// # Errors
    /// Returns an error when the layout is invalid, the database cannot be opened, or pragmas
    /// cannot be applied.
    pub fn open_with_layout(path: &Path, layout: SchemaLayout) -> Result<Self> {
        layout.validate()?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, layout })
    }

    /// Open an existing database for inspection: the file is never created and the journal
    /// mode is left as found.
    ///
    /// # Errors
    /// Returns an error when the layout is invalid or the database file does not exist.
    pub fn open_existing(path: &Path, layout: SchemaLayout) -> Result<Self> {
        layout.validate()?;

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open existing sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, layout })
    }

    #[must_use]
    pub fn layout(&self) -> &SchemaLayout {
        &self.layout
    }

    /// Report current and target schema versions plus pending migrations without writing.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) =
            detect_effective_schema_version(&self.conn, &self.layout)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations, splitting duplicate EUD references on the way to v2.
    ///
    /// # Errors
    /// Returns an error when bootstrapping or any migration step fails. A failed split leaves
    /// the store exactly as it was before the call.
    pub fn migrate(&mut self) -> Result<MigrationSummary> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut summary = MigrationSummary { applied_versions: Vec::new(), reconcile: None };
        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
            if version >= 1 {
                summary.applied_versions.push(1);
            }
        }

        if version < SPLIT_SCHEMA_VERSION {
            summary.reconcile = Some(self.apply_split_migration()?);
            summary.applied_versions.push(SPLIT_SCHEMA_VERSION);
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(summary)
    }

    /// Revert the split migration: restore original EUD references, drop clones and the
    /// unique indexes, and step the schema back to v1.
    ///
    /// # Errors
    /// Returns an error when the schema version is unsupported or the reversal fails.
    pub fn downgrade(&mut self) -> Result<DowngradeSummary> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < SPLIT_SCHEMA_VERSION {
            info!(version, "split migration not applied; nothing to downgrade");
            return Ok(DowngradeSummary { reverted_versions: Vec::new(), revert: None });
        }
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        let tx = self.conn.transaction().context("failed to start downgrade transaction")?;
        let report = reconcile::revert_all(&tx, &self.layout)?;
        tx.execute(
            "DELETE FROM schema_migrations WHERE version = ?1",
            params![SPLIT_SCHEMA_VERSION],
        )
        .context("failed to remove migration version 2")?;
        tx.commit().context("failed to commit downgrade")?;

        info!(clones_deleted = report.clones_deleted, "split migration reverted");
        Ok(DowngradeSummary { reverted_versions: vec![SPLIT_SCHEMA_VERSION], revert: Some(report) })
    }

    /// Duplicate groups and the clone uids the split migration would create, per relation.
    ///
    /// # Errors
    /// Returns an error when a referencing relation cannot be scanned.
    pub fn plan(&self) -> Result<Vec<RelationPlan>> {
        reconcile::plan_all(&self.conn, &self.layout)
    }

    /// # Errors
    /// Returns an error when the endpoint lookup fails.
    pub fn endpoint(&self, uid: &str) -> Result<Option<Endpoint>> {
        reconcile::load_endpoint(&self.conn, &self.layout, uid)
    }

    /// Foreign-key values of one referencing relation, ordered by record id.
    ///
    /// # Errors
    /// Returns an error when `table` is not part of the layout or cannot be read.
    pub fn references(&self, table: &str) -> Result<Vec<(i64, Option<String>)>> {
        let relation = self
            .layout
            .relation(table)
            .ok_or_else(|| anyhow!("{table} is not a referencing relation of this layout"))?;
        let query = format!(
            "SELECT {id}, {fk} FROM {table} ORDER BY {id} ASC",
            id = relation.id_column,
            fk = relation.fk_column,
            table = relation.table,
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut references = Vec::new();
        for row in rows {
            references.push(row?);
        }
        Ok(references)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, duplicate and orphan checks plus schema status.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let mut duplicate_groups = Vec::new();
        let mut orphaned_clones = 0;
        if schema_status.current_version >= 1 {
            for relation in &self.layout.relations {
                duplicate_groups.extend(reconcile::find_duplicate_groups(&self.conn, relation)?);
            }
            orphaned_clones = reconcile::count_orphaned_clones(&self.conn, &self.layout)?;
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            duplicate_groups,
            orphaned_clones,
            schema_status,
        })
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, &self.layout.endpoint_table)? {
            if self.layout != SchemaLayout::default() {
                return Err(anyhow!(
                    "endpoint table {} does not exist; only the default layout can be created",
                    self.layout.endpoint_table
                ));
            }
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        check_layout_columns(&self.conn, &self.layout)?;

        if split_indexes_present(&self.conn, &self.layout)? {
            // Unique indexes already in place, but version rows are missing.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        record_schema_version(&self.conn, 1)?;
        Ok(1)
    }

    fn apply_split_migration(&mut self) -> Result<ReconcileReport> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        info!(relations = self.layout.relations.len(), "splitting duplicate EUD references");
        let report = reconcile::reconcile_all(&tx, &self.layout)?;

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![SPLIT_SCHEMA_VERSION, now],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        info!(
            clones_created = report.clones_created(),
            records_reassigned = report.records_reassigned(),
            "split migration applied"
        );
        Ok(report)
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)?;
    info!("baseline EUD schema created");
    Ok(())
}

fn check_layout_columns(conn: &Connection, layout: &SchemaLayout) -> Result<()> {
    if !table_has_column(conn, &layout.endpoint_table, &layout.endpoint_key)? {
        return Err(anyhow!(
            "database schema is invalid: {} has no {} column",
            layout.endpoint_table,
            layout.endpoint_key
        ));
    }

    for relation in &layout.relations {
        for column in [&relation.id_column, &relation.fk_column] {
            if !table_has_column(conn, &relation.table, column)? {
                return Err(anyhow!(
                    "database schema is invalid: {} has no {} column",
                    relation.table,
                    column
                ));
            }
        }
    }

    Ok(())
}

fn split_indexes_present(conn: &Connection, layout: &SchemaLayout) -> Result<bool> {
    for relation in &layout.relations {
        if !reconcile::index_exists(conn, &relation.unique_index)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    Ok(reconcile::table_columns(conn, table)?
        .iter()
        .any(|name| name.eq_ignore_ascii_case(column)))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(
    conn: &Connection,
    layout: &SchemaLayout,
) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, &layout.endpoint_table)? {
        return Ok((0, false));
    }

    check_layout_columns(conn, layout)?;

    if split_indexes_present(conn, layout)? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use eud_split_core::{is_clone_uid, AttributeValue, DropOutcome, ReconcileError, RelationSpec};
    use ulid::Ulid;

    fn seed_eud(store: &SqliteStore, uid: &str, callsign: &str) -> Result<()> {
        store.conn.execute(
            "INSERT INTO euds(uid, callsign, device, platform, last_event_time, user_id, team_role)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![uid, callsign, "Pixel 8", "ATAK-CIV", "2026-01-30T12:00:00Z", 3_i64, "Medic"],
        )?;
        Ok(())
    }

    fn seed_certificate(store: &SqliteStore, id: i64, eud_uid: Option<&str>) -> Result<()> {
        store.conn.execute(
            "INSERT INTO certificates(id, common_name, eud_uid) VALUES (?1, ?2, ?3)",
            params![id, format!("cert-{id}"), eud_uid],
        )?;
        Ok(())
    }

    fn seed_package(store: &SqliteStore, id: i64, creator_uid: Option<&str>) -> Result<()> {
        store.conn.execute(
            "INSERT INTO data_packages(id, hash, filename, creator_uid) VALUES (?1, ?2, ?3, ?4)",
            params![id, format!("hash-{id}"), format!("package-{id}.zip"), creator_uid],
        )?;
        Ok(())
    }

    fn baseline_store() -> Result<SqliteStore> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        apply_migration_1(&store.conn)?;
        Ok(store)
    }

    fn endpoint_uids(store: &SqliteStore) -> Result<Vec<String>> {
        let mut stmt = store.conn.prepare("SELECT uid FROM euds ORDER BY uid ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut uids = Vec::new();
        for row in rows {
            uids.push(row?);
        }
        Ok(uids)
    }

    // Test IDs: TMIG-001
    #[test]
    fn migrate_fresh_database_creates_baseline_and_indexes() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let summary = store.migrate()?;

        assert_eq!(summary.applied_versions, vec![1, 2]);
        assert_eq!(current_schema_version(&store.conn)?, 2);
        assert!(reconcile::index_exists(&store.conn, "certificates_eud_uid_key")?);
        assert!(reconcile::index_exists(&store.conn, "data_packages_creator_uid_key")?);
        Ok(())
    }

    // Test IDs: TMIG-002
    #[test]
    fn migrate_splits_shared_eud_into_clone_with_identical_attributes() -> Result<()> {
        let mut store = baseline_store()?;
        seed_eud(&store, "E1", "ALPHA")?;
        seed_certificate(&store, 1, Some("E1"))?;
        seed_certificate(&store, 2, Some("E1"))?;

        let summary = store.migrate()?;
        assert_eq!(summary.applied_versions, vec![2]);
        let Some(report) = summary.reconcile else {
            return Err(anyhow!("split migration report missing"));
        };
        assert_eq!(report.clones_created(), 1);

        assert_eq!(
            store.references("certificates")?,
            vec![(1, Some("E1".to_string())), (2, Some("E1::dup::2".to_string()))]
        );

        let (Some(original), Some(clone)) = (store.endpoint("E1")?, store.endpoint("E1::dup::2")?)
        else {
            return Err(anyhow!("original or clone endpoint missing"));
        };
        assert_eq!(clone.attributes, original.attributes);
        assert_eq!(clone.attribute("callsign"), Some(&AttributeValue::Text("ALPHA".to_string())));
        Ok(())
    }

    // Test IDs: TMIG-003
    #[test]
    fn every_relation_is_unique_after_migration() -> Result<()> {
        let mut store = baseline_store()?;
        for uid in ["E1", "E2", "E3"] {
            seed_eud(&store, uid, uid)?;
        }
        for (id, uid) in [(1, "E1"), (2, "E1"), (3, "E2"), (4, "E1"), (5, "E2"), (6, "E3")] {
            seed_certificate(&store, id, Some(uid))?;
        }
        seed_certificate(&store, 7, None)?;
        seed_certificate(&store, 8, None)?;
        for (id, uid) in [(2, "E2"), (3, "E2"), (4, "E1"), (9, "E1"), (10, "E3")] {
            seed_package(&store, id, Some(uid))?;
        }

        store.migrate()?;

        for relation in ["certificates", "data_packages"] {
            let mut seen = std::collections::BTreeSet::new();
            for (id, uid) in store.references(relation)? {
                if let Some(uid) = uid {
                    assert!(seen.insert(uid.clone()), "{relation} record {id} shares {uid}");
                }
            }
        }

        let report = store.integrity_check()?;
        assert!(report.duplicate_groups.is_empty());
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.orphaned_clones, 0);
        Ok(())
    }

    // Test IDs: TMIG-004
    #[test]
    fn second_migrate_is_a_no_op() -> Result<()> {
        let mut store = baseline_store()?;
        seed_eud(&store, "E1", "ALPHA")?;
        seed_certificate(&store, 1, Some("E1"))?;
        seed_certificate(&store, 2, Some("E1"))?;

        store.migrate()?;
        let before = endpoint_uids(&store)?;
        let second = store.migrate()?;

        assert!(second.applied_versions.is_empty());
        assert!(second.reconcile.is_none());
        assert_eq!(endpoint_uids(&store)?, before);
        Ok(())
    }

    // Test IDs: TMIG-005
    #[test]
    fn failed_split_rolls_back_every_change() -> Result<()> {
        let mut store = baseline_store()?;
        seed_eud(&store, "E1", "ALPHA")?;
        seed_certificate(&store, 1, Some("E1"))?;
        seed_certificate(&store, 2, Some("E1"))?;
        store.conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
        seed_package(&store, 3, Some("GHOST"))?;
        seed_package(&store, 4, Some("GHOST"))?;
        store.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let Err(err) = store.migrate() else {
            return Err(anyhow!("expected migration to fail on a vanished endpoint"));
        };
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::EndpointNotFound { relation, .. }) if relation == "data_packages"
        ));

        assert_eq!(current_schema_version(&store.conn)?, 1);
        assert_eq!(endpoint_uids(&store)?, vec!["E1".to_string()]);
        assert_eq!(store.references("certificates")?[1], (2, Some("E1".to_string())));
        assert!(!reconcile::index_exists(&store.conn, "certificates_eud_uid_key")?);
        Ok(())
    }

    // Test IDs: TMIG-006
    #[test]
    fn downgrade_restores_references_and_removes_clones() -> Result<()> {
        let mut store = baseline_store()?;
        seed_eud(&store, "E1", "ALPHA")?;
        seed_eud(&store, "E2", "BRAVO")?;
        seed_certificate(&store, 1, Some("E1"))?;
        seed_certificate(&store, 2, Some("E1"))?;
        seed_package(&store, 3, Some("E2"))?;
        seed_package(&store, 4, Some("E2"))?;
        seed_package(&store, 5, None)?;
        let certificates_before = store.references("certificates")?;
        let packages_before = store.references("data_packages")?;

        store.migrate()?;
        assert!(endpoint_uids(&store)?.iter().any(|uid| is_clone_uid(uid)));

        let summary = store.downgrade()?;
        assert_eq!(summary.reverted_versions, vec![2]);
        let Some(revert) = summary.revert else {
            return Err(anyhow!("revert report missing"));
        };
        assert_eq!(revert.clones_deleted, 2);
        assert!(revert
            .relations
            .iter()
            .all(|relation| relation.unique_index == DropOutcome::Dropped));

        assert_eq!(store.references("certificates")?, certificates_before);
        assert_eq!(store.references("data_packages")?, packages_before);
        assert_eq!(endpoint_uids(&store)?, vec!["E1".to_string(), "E2".to_string()]);
        assert_eq!(current_schema_version(&store.conn)?, 1);

        let again = store.downgrade()?;
        assert!(again.reverted_versions.is_empty());
        Ok(())
    }

    // Test IDs: TMIG-007
    #[test]
    fn downgrade_tolerates_indexes_removed_by_hand() -> Result<()> {
        let mut store = baseline_store()?;
        seed_eud(&store, "E1", "ALPHA")?;
        seed_certificate(&store, 1, Some("E1"))?;
        seed_certificate(&store, 2, Some("E1"))?;
        store.migrate()?;
        store.conn.execute_batch("DROP INDEX certificates_eud_uid_key;")?;

        let summary = store.downgrade()?;
        let Some(revert) = summary.revert else {
            return Err(anyhow!("revert report missing"));
        };
        assert_eq!(revert.relations[0].unique_index, DropOutcome::Absent);
        assert_eq!(revert.relations[1].unique_index, DropOutcome::Dropped);
        assert_eq!(store.references("certificates")?[1], (2, Some("E1".to_string())));
        Ok(())
    }

    // Test IDs: TMIG-008
    #[test]
    fn schema_status_infers_legacy_versions() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let empty = store.schema_status()?;
        assert_eq!(empty.current_version, 0);
        assert_eq!(empty.pending_versions, vec![1, 2]);

        store.conn.execute_batch(MIGRATION_001_SQL)?;
        let legacy = store.schema_status()?;
        assert_eq!(legacy.current_version, 1);
        assert_eq!(legacy.pending_versions, vec![2]);
        assert!(legacy.inferred_from_legacy);
        Ok(())
    }

    // Test IDs: TMIG-009
    #[test]
    fn migrate_rejects_schema_missing_foreign_key_column() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(
            "CREATE TABLE euds(uid TEXT PRIMARY KEY);
             CREATE TABLE certificates(id INTEGER PRIMARY KEY);
             CREATE TABLE data_packages(id INTEGER PRIMARY KEY, creator_uid TEXT);",
        )?;

        let Err(err) = store.migrate() else {
            return Err(anyhow!("expected migration to fail on invalid legacy schema"));
        };
        assert!(err.to_string().contains("certificates has no eud_uid column"));
        Ok(())
    }

    // Test IDs: TMIG-010
    #[test]
    fn custom_layout_requires_existing_tables() -> Result<()> {
        let layout = SchemaLayout {
            endpoint_table: "devices".to_string(),
            endpoint_key: "uid".to_string(),
            relations: vec![RelationSpec::new("certificates", "device_uid")],
        };
        let mut store = SqliteStore::open_with_layout(Path::new(":memory:"), layout)?;

        let Err(err) = store.migrate() else {
            return Err(anyhow!("expected migration to refuse creating a custom layout"));
        };
        assert!(err.to_string().contains("endpoint table devices does not exist"));
        Ok(())
    }

    // Test IDs: TMIG-011
    #[test]
    fn open_rejects_invalid_layout() {
        let layout = SchemaLayout { relations: vec![], ..SchemaLayout::default() };
        assert!(SqliteStore::open_with_layout(Path::new(":memory:"), layout).is_err());
    }

    // Test IDs: TINT-001
    #[test]
    fn integrity_check_reports_pending_duplicates_before_migration() -> Result<()> {
        let store = baseline_store()?;
        seed_eud(&store, "E1", "ALPHA")?;
        seed_package(&store, 1, Some("E1"))?;
        seed_package(&store, 2, Some("E1"))?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.duplicate_groups.len(), 1);
        assert_eq!(report.duplicate_groups[0].relation, "data_packages");
        assert_eq!(report.schema_status.pending_versions, vec![2]);

        let plans = store.plan()?;
        assert_eq!(plans[1].groups[0].clones[0].clone_uid, "E1::dup::2");
        Ok(())
    }

    // Test IDs: TBAK-001
    #[test]
    fn backup_captures_pre_migration_state() -> Result<()> {
        let mut store = baseline_store()?;
        seed_eud(&store, "E1", "ALPHA")?;
        seed_certificate(&store, 1, Some("E1"))?;
        seed_certificate(&store, 2, Some("E1"))?;

        let backup_file =
            std::env::temp_dir().join(format!("eud-split-backup-{}.sqlite3", Ulid::new()));
        store.backup_database(&backup_file)?;
        store.migrate()?;

        let restored = SqliteStore::open(&backup_file)?;
        assert_eq!(endpoint_uids(&restored)?, vec!["E1".to_string()]);
        assert_eq!(restored.references("certificates")?[1], (2, Some("E1".to_string())));
        drop(restored);

        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{}", backup_file.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    // Test IDs: TMIG-012
    #[test]
    fn inspection_leaves_legacy_database_unmodified() -> Result<()> {
        let db_file =
            std::env::temp_dir().join(format!("eud-split-legacy-{}.sqlite3", Ulid::new()));
        {
            let conn = Connection::open(&db_file)?;
            conn.execute_batch(MIGRATION_001_SQL)?;
            conn.execute_batch(
                "INSERT INTO euds(uid, callsign) VALUES ('E1', 'ALPHA');
                 INSERT INTO certificates(id, common_name, eud_uid)
                   VALUES (1, 'cert-1', 'E1'), (2, 'cert-2', 'E1');",
            )?;
        }

        let store = SqliteStore::open_existing(&db_file, SchemaLayout::default())?;
        assert_eq!(store.schema_status()?.current_version, 1);
        assert_eq!(store.plan()?[0].reassignments(), 1);
        assert_eq!(store.integrity_check()?.duplicate_groups.len(), 1);
        assert!(!table_exists(&store.conn, "schema_migrations")?);
        let journal_mode: String =
            store.conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        assert_eq!(journal_mode, "delete");
        drop(store);

        let missing = db_file.with_extension("absent");
        assert!(SqliteStore::open_existing(&missing, SchemaLayout::default()).is_err());
        assert!(!missing.exists());

        fs::remove_file(&db_file)
            .with_context(|| format!("failed to cleanup sqlite file {}", db_file.display()))?;
        Ok(())
    }
}
