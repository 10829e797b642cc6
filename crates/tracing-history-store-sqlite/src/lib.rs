#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_history_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, HistoryEntry, HistoryPolicy, TracingState,
    TracingStatusHistory,
};

const HISTORY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_HISTORY_V1: &str = r"
CREATE TABLE IF NOT EXISTS history_policies (
  policy_version INTEGER PRIMARY KEY,
  policy_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS active_history_policy (
  slot INTEGER PRIMARY KEY CHECK (slot = 1),
  policy_version INTEGER NOT NULL,
  activated_at TEXT NOT NULL,
  FOREIGN KEY (policy_version) REFERENCES history_policies(policy_version)
);

CREATE TABLE IF NOT EXISTS tracing_status_entries (
  position INTEGER PRIMARY KEY CHECK (position >= 0),
  tracing_on INTEGER NOT NULL CHECK (tracing_on IN (0, 1)),
  recorded_at TEXT NOT NULL
);
";

/// Persists a single [`TracingStatusHistory`] and serializes writers.
///
/// Every mutation runs in an immediate transaction, so two processes
/// consuming observations against the same file cannot both append.
pub struct SqliteHistoryStore {
    conn: Connection,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_HISTORY_V1)
            .context("failed to apply tracing history schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let applied = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![HISTORY_MIGRATION_VERSION, now],
            )
            .context("failed to register tracing history schema migration")?;
        if applied > 0 {
            tracing::info!(
                version = HISTORY_MIGRATION_VERSION,
                "applied tracing history schema"
            );
        }

        register_policy(&self.conn, &HistoryPolicy::v1())?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO active_history_policy(slot, policy_version, activated_at)
                 VALUES (1, 1, ?1)",
                params![now],
            )
            .context("failed to initialize active policy")?;

        Ok(())
    }

    /// Stores `policy` under its version. Versions are immutable: registering
    /// different values under an existing version fails.
    pub fn register_policy(&self, policy: &HistoryPolicy) -> Result<()> {
        register_policy(&self.conn, policy)
    }

    /// Registers `policy` and makes it the policy later invocations resolve.
    pub fn activate_policy(&mut self, policy: &HistoryPolicy) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start policy transaction")?;

        register_policy(&tx, policy)?;
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        tx.execute(
            "INSERT INTO active_history_policy(slot, policy_version, activated_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(slot) DO UPDATE SET
               policy_version = excluded.policy_version,
               activated_at = excluded.activated_at",
            params![i64::from(policy.policy_version), now],
        )
        .context("failed to update active policy")?;
        tx.commit().context("failed to commit policy transaction")?;

        tracing::info!(
            policy_version = policy.policy_version,
            "activated history policy"
        );
        Ok(())
    }

    /// The activated policy, or [`HistoryPolicy::v1`] before migration.
    pub fn active_policy(&self) -> Result<HistoryPolicy> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT policy_version FROM active_history_policy WHERE slot = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query active_history_policy")?;

        let Some(version) = version else {
            return Ok(HistoryPolicy::v1());
        };
        let version = u32::try_from(version)
            .with_context(|| format!("invalid active policy_version: {version}"))?;

        self.get_policy(version)?
            .ok_or_else(|| anyhow!("active policy_version {version} is not registered"))
    }

    pub fn get_policy(&self, policy_version: u32) -> Result<Option<HistoryPolicy>> {
        read_policy(&self.conn, policy_version)
    }

    pub fn load_history(&self) -> Result<TracingStatusHistory> {
        read_history(&self.conn)
    }

    pub fn save_history(&mut self, history: &TracingStatusHistory) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start history transaction")?;
        write_history(&tx, history)?;
        tx.commit().context("failed to commit history transaction")?;

        tracing::info!(entries = history.len(), "saved tracing history");
        Ok(())
    }

    /// Loads, consumes `state` and saves inside one write transaction.
    pub fn consume_state(
        &mut self,
        state: &TracingState,
        policy: &HistoryPolicy,
    ) -> Result<TracingStatusHistory> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start consume transaction")?;

        let history = read_history(&tx)?.consuming_state_with_policy(state, policy);
        write_history(&tx, &history)?;
        tx.commit().context("failed to commit consume transaction")?;

        tracing::info!(
            on = state.is_tracing_enabled,
            entries = history.len(),
            "consumed tracing state"
        );
        Ok(history)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn read_policy(conn: &Connection, policy_version: u32) -> Result<Option<HistoryPolicy>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT policy_json FROM history_policies WHERE policy_version = ?1",
            params![i64::from(policy_version)],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query history_policies")?;

    let Some(json) = json else {
        return Ok(None);
    };

    let value: Value = serde_json::from_str(&json).context("invalid stored policy JSON")?;
    let policy = HistoryPolicy::from_json(&value)
        .map_err(|err| anyhow!("failed to parse policy {policy_version}: {err}"))?;
    Ok(Some(policy))
}

fn register_policy(conn: &Connection, policy: &HistoryPolicy) -> Result<()> {
    policy
        .validate()
        .map_err(|err| anyhow!("invalid policy configuration: {err}"))?;

    if let Some(existing) = read_policy(conn, policy.policy_version)? {
        if existing == *policy {
            return Ok(());
        }
        return Err(anyhow!(
            "policy_version {} is already registered with different values",
            policy.policy_version
        ));
    }

    let payload = serde_json::to_string(policy).context("failed to serialize policy")?;
    let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO history_policies(policy_version, policy_json, created_at)
         VALUES (?1, ?2, ?3)",
        params![i64::from(policy.policy_version), payload, now],
    )
    .context("failed to insert policy")?;

    Ok(())
}

fn read_history(conn: &Connection) -> Result<TracingStatusHistory> {
    let mut stmt = conn
        .prepare(
            "SELECT tracing_on, recorded_at
             FROM tracing_status_entries
             ORDER BY position ASC",
        )
        .context("failed to prepare history query")?;

    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let on: i64 = row.get(0)?;
        let recorded_at: String = row.get(1)?;
        entries.push(HistoryEntry {
            on: on != 0,
            date: parse_stored_timestamp(&recorded_at)?,
        });
    }

    Ok(TracingStatusHistory::from_entries(entries))
}

fn write_history(conn: &Connection, history: &TracingStatusHistory) -> Result<()> {
    conn.execute("DELETE FROM tracing_status_entries", [])
        .context("failed to clear tracing_status_entries")?;

    let mut stmt = conn
        .prepare(
            "INSERT INTO tracing_status_entries(position, tracing_on, recorded_at)
             VALUES (?1, ?2, ?3)",
        )
        .context("failed to prepare history insert")?;

    for (position, entry) in history.entries().iter().enumerate() {
        let position = i64::try_from(position)
            .with_context(|| format!("history position out of range: {position}"))?;
        let recorded_at = format_rfc3339(entry.date).map_err(|err| anyhow!(err.to_string()))?;
        stmt.execute(params![position, bool_to_sql(entry.on), recorded_at])
            .context("failed to insert history entry")?;
    }

    Ok(())
}

fn parse_stored_timestamp(raw: &str) -> Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid stored recorded_at {raw}: {err}"))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::Duration;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteHistoryStore {
        let store = must(SqliteHistoryStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn remove_db_files(db_path: &Path) {
        let _ = std::fs::remove_file(db_path);
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = db_path.as_os_str().to_owned();
            sidecar.push(suffix);
            let _ = std::fs::remove_file(sidecar);
        }
    }

    fn fixture_now() -> OffsetDateTime {
        match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    #[test]
    fn fresh_store_has_empty_history_and_default_policy() {
        let store = fixture_store();

        assert!(must(store.load_history()).is_empty());
        assert_eq!(must(store.get_policy(1)), Some(HistoryPolicy::v1()));
        assert_eq!(must(store.get_policy(2)), None);
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());

        let migrations: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count migrations: {err}"),
        };
        assert_eq!(migrations, 1);
    }

    #[test]
    fn consume_state_persists_pruned_history() {
        let mut store = fixture_store();
        let now = fixture_now();
        let policy = HistoryPolicy::v1();

        for state in [
            TracingState::new(true, now - Duration::days(15)),
            TracingState::new(false, now - Duration::days(10)),
            TracingState::new(true, now - Duration::days(1)),
            TracingState::new(false, now - Duration::hours(1)),
        ] {
            let _ = must(store.consume_state(&state, &policy));
        }

        let history = must(store.load_history());
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.entries().first().map(|entry| entry.date),
            Some(now - Duration::days(10))
        );

        let rows: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM tracing_status_entries",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count entries: {err}"),
        };
        assert_eq!(rows, 3);
    }

    #[test]
    fn save_history_replaces_previous_entries() {
        let mut store = fixture_store();
        let now = fixture_now();

        let long = TracingStatusHistory::from_entries(vec![
            HistoryEntry {
                on: true,
                date: now - Duration::days(3),
            },
            HistoryEntry {
                on: false,
                date: now - Duration::days(2),
            },
        ]);
        must(store.save_history(&long));

        let short = TracingStatusHistory::from_entries(vec![HistoryEntry {
            on: true,
            date: now,
        }]);
        must(store.save_history(&short));

        assert_eq!(must(store.load_history()), short);
    }

    #[test]
    fn history_survives_reopen() {
        let db_path = std::env::temp_dir().join(format!("tracing-history-{}.sqlite3", Ulid::new()));
        let now = fixture_now();

        {
            let mut store = must(SqliteHistoryStore::open(&db_path));
            must(store.migrate());
            let _ = must(store.consume_state(
                &TracingState::new(true, now - Duration::days(3)),
                &HistoryPolicy::v1(),
            ));
        }

        let store = must(SqliteHistoryStore::open(&db_path));
        must(store.migrate());
        let history = must(store.load_history());
        assert_eq!(history.count_enabled_days(now), 3);

        remove_db_files(&db_path);
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let store = fixture_store();
        let policy = HistoryPolicy {
            policy_version: 2,
            retention_days: 0,
            minimum_enabled_hours: 48,
        };

        assert!(store.register_policy(&policy).is_err());
        assert_eq!(must(store.get_policy(2)), None);
    }

    #[test]
    fn activated_policy_is_resolved_after_reopen() {
        let db_path = std::env::temp_dir().join(format!("tracing-policy-{}.sqlite3", Ulid::new()));
        let policy = HistoryPolicy {
            policy_version: 2,
            retention_days: 7,
            minimum_enabled_hours: 12,
        };

        {
            let mut store = must(SqliteHistoryStore::open(&db_path));
            must(store.migrate());
            assert_eq!(must(store.active_policy()), HistoryPolicy::v1());
            must(store.activate_policy(&policy));
        }

        let store = must(SqliteHistoryStore::open(&db_path));
        must(store.migrate());
        assert_eq!(must(store.active_policy()), policy);
        assert_eq!(must(store.get_policy(1)), Some(HistoryPolicy::v1()));

        remove_db_files(&db_path);
    }

    #[test]
    fn registered_policy_versions_are_immutable() {
        let mut store = fixture_store();
        let altered_v1 = HistoryPolicy {
            minimum_enabled_hours: 12,
            ..HistoryPolicy::v1()
        };

        assert!(store.register_policy(&altered_v1).is_err());
        assert!(store.activate_policy(&altered_v1).is_err());
        must(store.register_policy(&HistoryPolicy::v1()));

        assert_eq!(must(store.get_policy(1)), Some(HistoryPolicy::v1()));
        assert_eq!(must(store.active_policy()), HistoryPolicy::v1());
    }

    #[test]
    fn corrupted_timestamp_surfaces_error() {
        let store = fixture_store();
        if let Err(err) = store.connection().execute(
            "INSERT INTO tracing_status_entries(position, tracing_on, recorded_at)
             VALUES (0, 1, 'not-a-date')",
            [],
        ) {
            panic!("failed to seed corrupted row: {err}");
        }

        assert!(store.load_history().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_store_matches_in_memory_history(
            steps in prop::collection::vec((any::<bool>(), 0_i64..96), 1..40)
        ) {
            let mut store = fixture_store();
            let policy = HistoryPolicy::v1();
            let mut expected = TracingStatusHistory::new();
            let mut date = fixture_now() - Duration::days(30);

            for (on, gap_hours) in steps {
                date += Duration::hours(gap_hours);
                let state = TracingState::new(on, date);
                expected.consume_with_policy(&state, &policy);
                let persisted = must(store.consume_state(&state, &policy));
                prop_assert_eq!(&persisted, &expected);
            }

            prop_assert_eq!(must(store.load_history()), expected);
        }
    }
}
