use anyhow::Result;
use chrono::Utc;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Run database migrations
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    // Tracks applied migrations
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Pipelines and datacenters").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Probe outcomes").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

/// Get current schema version from database
pub async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

/// Record that a migration was applied
async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, Utc::now().timestamp(), description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: pipelines and the datacenter registry
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pipelines (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            project_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL DEFAULT 1,
            is_heart_beat INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            datacenter_ids TEXT NOT NULL DEFAULT '[]',
            end_at INTEGER,
            steps TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS datacenters (
            id INTEGER PRIMARY KEY,
            base_url TEXT NOT NULL,
            title TEXT NOT NULL,
            city TEXT,
            country TEXT,
            region TEXT,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_pipelines_active ON pipelines(is_active, is_heart_beat)", ())
        .await?;

    Ok(())
}

/// Migration v2: probe outcomes, one row per leg
///
/// Step records are stored without bodies; bodies live in `body_snapshot`
/// so retention can drop them with a single column update.
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS probe_outcomes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            pipeline_id INTEGER NOT NULL,
            project_id INTEGER NOT NULL,
            datacenter_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            address TEXT NOT NULL,
            success INTEGER NOT NULL,
            average_response_time_ms REAL NOT NULL,
            steps TEXT NOT NULL,
            body_snapshot TEXT,
            header_snapshot TEXT NOT NULL,
            status_snapshot TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_probe_outcomes_pipeline ON probe_outcomes(pipeline_id, id DESC)",
        (),
    )
    .await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_probe_outcomes_session ON probe_outcomes(session_id)", ())
        .await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_probe_outcomes_created_at ON probe_outcomes(created_at)", ())
        .await?;

    Ok(())
}
