//! Connection bootstrap and migrations table, same pattern as the
//! desktop app this pipeline grew out of: a local `migrations` table
//! gates idempotent `CREATE TABLE IF NOT EXISTS` blocks, applied once at
//! startup via `init_database`.

use rusqlite::{Connection, Result};
use std::path::{Path, PathBuf};

pub fn get_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("pipeline.db")
}

pub fn get_connection(data_dir: &Path) -> Result<Connection> {
    std::fs::create_dir_all(data_dir).expect("failed to create pipeline data directory");
    Connection::open(get_db_path(data_dir))
}

pub fn init_database(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;
    run_migrations(conn)
}

fn apply_once(conn: &Connection, name: &str, migration: impl FnOnce(&Connection) -> Result<()>) -> Result<()> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM migrations WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    if count == 0 {
        log::info!("running migration: {}", name);
        migration(conn)?;
        conn.execute(
            "INSERT INTO migrations (name, applied_at) VALUES (?1, datetime('now'))",
            [name],
        )?;
    }
    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<()> {
    apply_once(conn, "001_bus", crate::pipeline::bus::SqliteBus::init_schema)?;
    apply_once(conn, "002_object_store", crate::pipeline::object_store::SqliteObjectStore::init_schema)?;
    apply_once(conn, "003_sessions", migration_003_sessions)?;
    apply_once(conn, "004_extraction_caches", migration_004_extraction_caches)?;
    apply_once(conn, "005_pairing_cache", migration_005_pairing_cache)?;
    apply_once(conn, "006_reports", migration_006_reports)?;
    Ok(())
}

/// C7's session record and per-resume sub-state (§3, §4.7).
fn migration_003_sessions(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            job_id TEXT PRIMARY KEY,
            organization_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            stage TEXT NOT NULL,
            last_error TEXT,
            terminal_at TEXT
        );

        CREATE TABLE IF NOT EXISTS session_resumes (
            job_id TEXT NOT NULL REFERENCES sessions(job_id),
            resume_id TEXT NOT NULL,
            sub_state TEXT NOT NULL,
            PRIMARY KEY (job_id, resume_id)
        );
        CREATE INDEX IF NOT EXISTS idx_session_resumes_job ON session_resumes(job_id);
        ",
    )
}

/// Per-stage idempotency caches keyed by the triggering event's
/// `messageId` (§4.3 step 1, §4.4 step 5).
fn migration_004_extraction_caches(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS extraction_cache (
            message_id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            jd_dto TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS parse_cache (
            message_id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            resume_id TEXT NOT NULL,
            resume_dto TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        ",
    )
}

/// C5's pairing cache: one row per `jobId`, holding the extracted JD (if
/// arrived) and a queue of resumes awaiting it (§4.5, §9).
fn migration_005_pairing_cache(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS pairing_cache (
            job_id TEXT PRIMARY KEY,
            jd_dto TEXT
        );

        CREATE TABLE IF NOT EXISTS pairing_cache_pending_resumes (
            job_id TEXT NOT NULL,
            resume_id TEXT NOT NULL,
            resume_dto TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            PRIMARY KEY (job_id, resume_id)
        );
        CREATE INDEX IF NOT EXISTS idx_pairing_pending_enqueued ON pairing_cache_pending_resumes(enqueued_at);
        ",
    )
}

/// C6's idempotency guard: one report per `(jobId, resumeId)` (§4.6).
fn migration_006_reports(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS reports (
            job_id TEXT NOT NULL,
            resume_id TEXT NOT NULL,
            report_dto TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (job_id, resume_id)
        );
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_database_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        init_database(&conn).unwrap();
        let migration_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(migration_count, 6);
    }
}
