use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tracing::info;

use crate::error::{CacheError, CacheResult};

/// One forward-only schema step.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Applied in order; never edit a shipped entry, append a new one.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "businesses",
        sql: r#"
        CREATE TABLE IF NOT EXISTS businesses (
            business_key TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            cid TEXT,
            place_id TEXT,
            address TEXT,
            phone TEXT,
            latitude REAL,
            longitude REAL,
            category TEXT,
            rating REAL,
            quality_score INTEGER NOT NULL,
            record_json TEXT NOT NULL,
            source_engine TEXT NOT NULL,
            first_seen_at INTEGER NOT NULL,
            last_updated_at INTEGER NOT NULL,
            update_count INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_businesses_last_updated ON businesses(last_updated_at);
        "#,
    },
    Migration {
        version: 2,
        name: "reviews_and_images",
        sql: r#"
        CREATE TABLE IF NOT EXISTS reviews (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            business_key TEXT NOT NULL REFERENCES businesses(business_key) ON DELETE CASCADE,
            content_hash TEXT NOT NULL,
            reviewer TEXT NOT NULL,
            rating REAL,
            text TEXT NOT NULL,
            relative_date TEXT,
            captured_at INTEGER NOT NULL,
            UNIQUE(business_key, content_hash)
        );
        CREATE TABLE IF NOT EXISTS images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            business_key TEXT NOT NULL REFERENCES businesses(business_key) ON DELETE CASCADE,
            url TEXT NOT NULL,
            resolution TEXT,
            captured_at INTEGER NOT NULL,
            UNIQUE(business_key, url)
        );
        "#,
    },
    Migration {
        version: 3,
        name: "extraction_history",
        sql: r#"
        CREATE TABLE IF NOT EXISTS extraction_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            business_key TEXT,
            query TEXT NOT NULL,
            engine TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            quality_score INTEGER,
            success INTEGER NOT NULL,
            error TEXT,
            recorded_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_history_engine ON extraction_history(engine);
        "#,
    },
    Migration {
        version: 4,
        name: "identity_aliases",
        sql: r#"
        CREATE TABLE IF NOT EXISTS identity_aliases (
            alias_key TEXT PRIMARY KEY,
            business_key TEXT NOT NULL REFERENCES businesses(business_key) ON DELETE CASCADE,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_aliases_business ON identity_aliases(business_key);
        "#,
    },
    // Schema Evolution: new columns are added, old ones are never dropped.
    Migration {
        version: 5,
        name: "businesses_website",
        sql: "ALTER TABLE businesses ADD COLUMN website TEXT;",
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Bring the database up to the latest schema.
///
/// A database written by a newer build is refused rather than rewritten.
pub async fn migrate(pool: &SqlitePool) -> CacheResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    let current = current_version(pool).await?;
    let latest = latest_version();
    if current > latest {
        return Err(CacheError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, latest
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let mut tx = pool.begin().await?;
        sqlx::query(migration.sql).execute(&mut *tx).await.map_err(|e| {
            CacheError::Migration(format!("migration {} ({}) failed: {}", migration.version, migration.name, e))
        })?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(version = migration.version, name = migration.name, "applied cache schema migration");
    }

    Ok(())
}

pub async fn current_version(pool: &SqlitePool) -> CacheResult<i64> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}
