//! Persistent business cache.
//!
//! Supports:
//! - TTL-based freshness on reads
//! - Read-merge-write upserts (sub-collections accumulate, never shrink)
//! - Identity aliases so any captured identifier finds the same entry
//! - Append-only extraction history and aggregate stats
//! - Age-based retention sweep

pub mod merge;
pub mod schema;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tokio::sync::Mutex;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::error::{CacheError, CacheResult};
use crate::identity::BusinessIdentity;
use crate::quality;
use crate::record::{Image, Record, Review};

pub use merge::merge_records;

// ============================================================================
// Data Structures
// ============================================================================

/// A cached record plus bookkeeping.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CacheEntry {
    #[schema(value_type = String)]
    pub identity: BusinessIdentity,
    pub record: Record,
    #[schema(value_type = String)]
    pub first_seen_at: DateTime<Utc>,
    #[schema(value_type = String)]
    pub last_updated_at: DateTime<Utc>,
    pub update_count: u32,
    pub source_engine: String,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct CacheStats {
    pub total_entries: u64,
    pub total_reviews: u64,
    pub total_images: u64,
    pub average_quality: f64,
    pub engines: Vec<EngineStats>,
}

/// Per-engine numbers from the extraction history.
#[derive(Debug, Clone, Serialize, ToSchema, FromRow)]
pub struct EngineStats {
    pub engine: String,
    pub attempts: i64,
    pub successes: i64,
    pub average_duration_ms: f64,
}

/// One row of the append-only extraction audit.
#[derive(Debug, Clone)]
pub struct ExtractionEvent {
    pub business_key: Option<String>,
    pub query: String,
    pub engine: String,
    pub duration: Duration,
    pub quality_score: Option<u8>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, FromRow)]
struct BusinessRow {
    business_key: String,
    record_json: String,
    quality_score: i64,
    source_engine: String,
    first_seen_at: i64,
    last_updated_at: i64,
    update_count: i64,
}

#[derive(Debug, FromRow)]
struct ReviewRow {
    reviewer: String,
    rating: Option<f64>,
    text: String,
    relative_date: Option<String>,
}

#[derive(Debug, FromRow)]
struct ImageRow {
    url: String,
    resolution: Option<String>,
}

// ============================================================================
// Store
// ============================================================================

/// SQLite-backed cache shared by every worker.
pub struct CacheStore {
    pool: SqlitePool,
    // Serializes read-merge-write so concurrent upserts cannot lose updates.
    write_lock: Mutex<()>,
}

impl CacheStore {
    /// Open (or create) the cache at `database_url` and migrate it.
    ///
    /// # Example URLs
    /// - `sqlite://maps_cache.db`
    /// - `sqlite::memory:` (use `in_memory()` instead, it pins one connection)
    pub async fn connect(database_url: &str) -> CacheResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Ephemeral store for tests and dry runs.
    pub async fn in_memory() -> CacheResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A second connection would see a different, empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> CacheResult<Self> {
        schema::migrate(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetch a fresh entry. Entries older than `max_age` are reported as absent;
    /// `max_age == 0` never hits.
    pub async fn get(&self, identity: &BusinessIdentity, max_age: Duration) -> CacheResult<Option<CacheEntry>> {
        self.get_by_alias(&identity.key(), max_age).await
    }

    /// Fetch a fresh entry through a remembered query alias.
    pub async fn get_by_query(&self, query_key: &str, max_age: Duration) -> CacheResult<Option<CacheEntry>> {
        self.get_by_alias(query_key, max_age).await
    }

    async fn get_by_alias(&self, alias: &str, max_age: Duration) -> CacheResult<Option<CacheEntry>> {
        if max_age.is_zero() {
            return Ok(None);
        }
        let mut conn = self.pool.acquire().await?;
        let Some(business_key) = lookup_alias(&mut conn, alias).await? else {
            return Ok(None);
        };
        let Some(entry) = load_entry(&mut conn, &business_key).await? else {
            return Ok(None);
        };

        let age = Utc::now().signed_duration_since(entry.last_updated_at);
        let age_ms = age.num_milliseconds().max(0) as u128;
        if age_ms > max_age.as_millis() {
            debug!(alias, business_key = %business_key, age_ms, "cache entry stale");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Business identity the cache would file this record under, if it
    /// already knows the business by any of the record's identifiers.
    pub async fn resolve_identity(&self, record: &Record) -> CacheResult<Option<BusinessIdentity>> {
        let mut conn = self.pool.acquire().await?;
        match resolve_business_key(&mut conn, record).await? {
            Some(key) => Ok(Some(parse_key(&key)?)),
            None => Ok(None),
        }
    }

    /// Insert or merge `record`, returning the stored entry.
    pub async fn upsert(&self, record: &Record, source_engine: &str) -> CacheResult<CacheEntry> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing_key = resolve_business_key(&mut tx, record).await?;
        let existing = match &existing_key {
            Some(key) => load_entry(&mut tx, key).await?,
            None => None,
        };
        let business_key = existing_key.unwrap_or_else(|| BusinessIdentity::from_record(record).key());

        let merged = match &existing {
            Some(entry) => merge_records(&entry.record, record),
            None => {
                let mut fresh = record.clone();
                fresh.quality_score = quality::score(&fresh);
                fresh
            }
        };

        let now = Utc::now().timestamp_millis();
        let scalars = Record {
            reviews: Vec::new(),
            images: Vec::new(),
            ..merged.clone()
        };
        let record_json = serde_json::to_string(&scalars)?;

        sqlx::query(
            r#"
            INSERT INTO businesses (
                business_key, name, cid, place_id, address, phone, website,
                latitude, longitude, category, rating, quality_score,
                record_json, source_engine, first_seen_at, last_updated_at, update_count
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
            ON CONFLICT(business_key) DO UPDATE SET
                name = excluded.name,
                cid = excluded.cid,
                place_id = excluded.place_id,
                address = excluded.address,
                phone = excluded.phone,
                website = excluded.website,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                category = excluded.category,
                rating = excluded.rating,
                quality_score = excluded.quality_score,
                record_json = excluded.record_json,
                source_engine = excluded.source_engine,
                last_updated_at = MAX(businesses.first_seen_at, excluded.last_updated_at),
                update_count = businesses.update_count + 1
            "#,
        )
        .bind(&business_key)
        .bind(&merged.name)
        .bind(merged.cid.map(|c| c.to_string()))
        .bind(&merged.place_id)
        .bind(&merged.address)
        .bind(&merged.phone)
        .bind(&merged.website)
        .bind(merged.location.map(|g| g.lat))
        .bind(merged.location.map(|g| g.lng))
        .bind(&merged.category)
        .bind(merged.rating.map(f64::from))
        .bind(merged.quality_score as i64)
        .bind(&record_json)
        .bind(source_engine)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for review in &merged.reviews {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO reviews (business_key, content_hash, reviewer, rating, text, relative_date, captured_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&business_key)
            .bind(review.dedup_key())
            .bind(&review.reviewer)
            .bind(review.rating.map(f64::from))
            .bind(&review.text)
            .bind(&review.relative_date)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for image in &merged.images {
            sqlx::query(
                "INSERT OR IGNORE INTO images (business_key, url, resolution, captured_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&business_key)
            .bind(&image.url)
            .bind(&image.resolution)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let mut aliases: Vec<String> = BusinessIdentity::candidates(&merged).iter().map(|i| i.key()).collect();
        aliases.extend(BusinessIdentity::candidates(record).iter().map(|i| i.key()));
        aliases.push(business_key.clone());
        for alias in aliases {
            insert_alias(&mut tx, &alias, &business_key, now).await?;
        }

        tx.commit().await?;

        let mut conn = self.pool.acquire().await?;
        let entry = load_entry(&mut conn, &business_key)
            .await?
            .ok_or_else(|| CacheError::Corrupt(format!("entry {} vanished after upsert", business_key)))?;

        debug!(
            business_key = %business_key,
            update_count = entry.update_count,
            reviews = entry.record.reviews.len(),
            images = entry.record.images.len(),
            quality = entry.record.quality_score,
            "cache upsert"
        );
        Ok(entry)
    }

    /// Remember that `query_key` resolved to `identity`.
    pub async fn remember_query(&self, query_key: &str, identity: &BusinessIdentity) -> CacheResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        let Some(business_key) = lookup_alias(&mut conn, &identity.key()).await? else {
            return Ok(());
        };
        // A query may point at a different business than last time; latest wins.
        sqlx::query(
            r#"
            INSERT INTO identity_aliases (alias_key, business_key, created_at) VALUES (?, ?, ?)
            ON CONFLICT(alias_key) DO UPDATE SET business_key = excluded.business_key, created_at = excluded.created_at
            "#,
        )
        .bind(query_key)
        .bind(&business_key)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Delete entries not updated within `max_age`. Offline maintenance only.
    pub async fn sweep(&self, max_age: Duration) -> CacheResult<u64> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.sweep_before(cutoff).await
    }

    /// Delete entries whose last update is strictly before `cutoff`.
    pub async fn sweep_before(&self, cutoff: DateTime<Utc>) -> CacheResult<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM businesses WHERE last_updated_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        info!(deleted, cutoff = %cutoff, "🧹 cache retention sweep");
        Ok(deleted)
    }

    /// Aggregate counts across the cache and its history.
    pub async fn stats(&self) -> CacheResult<CacheStats> {
        let (total_entries, average_quality): (i64, f64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(AVG(quality_score), 0.0) FROM businesses")
                .fetch_one(&self.pool)
                .await?;
        let total_reviews: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reviews")
            .fetch_one(&self.pool)
            .await?;
        let total_images: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await?;
        let engines: Vec<EngineStats> = sqlx::query_as(
            r#"
            SELECT engine,
                   COUNT(*) AS attempts,
                   COALESCE(SUM(success), 0) AS successes,
                   COALESCE(AVG(duration_ms), 0.0) AS average_duration_ms
            FROM extraction_history
            GROUP BY engine
            ORDER BY engine
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(CacheStats {
            total_entries: total_entries as u64,
            total_reviews: total_reviews as u64,
            total_images: total_images as u64,
            average_quality,
            engines,
        })
    }

    /// Append one attempt to the extraction audit. Never updated afterwards.
    pub async fn record_extraction(&self, event: &ExtractionEvent) -> CacheResult<()> {
        sqlx::query(
            r#"
            INSERT INTO extraction_history (business_key, query, engine, duration_ms, quality_score, success, error, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.business_key)
        .bind(&event.query)
        .bind(&event.engine)
        .bind(event.duration.as_millis().min(i64::MAX as u128) as i64)
        .bind(event.quality_score.map(i64::from))
        .bind(event.success)
        .bind(&event.error)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Row Helpers
// ============================================================================

async fn lookup_alias(conn: &mut SqliteConnection, alias: &str) -> CacheResult<Option<String>> {
    let key: Option<String> = sqlx::query_scalar("SELECT business_key FROM identity_aliases WHERE alias_key = ?")
        .bind(alias)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(key)
}

async fn resolve_business_key(conn: &mut SqliteConnection, record: &Record) -> CacheResult<Option<String>> {
    for candidate in BusinessIdentity::candidates(record) {
        let Some(key) = lookup_alias(conn, &candidate.key()).await? else {
            continue;
        };
        // A fingerprint match never overrides a provider id that disagrees.
        if matches!(candidate, BusinessIdentity::Fingerprint(_)) && conflicts_with_stored(conn, &key, record).await? {
            debug!(business_key = %key, "fingerprint matches a business with different provider ids");
            continue;
        }
        return Ok(Some(key));
    }
    Ok(None)
}

async fn conflicts_with_stored(conn: &mut SqliteConnection, business_key: &str, record: &Record) -> CacheResult<bool> {
    let stored: Option<(Option<String>, Option<String>)> =
        sqlx::query_as("SELECT cid, place_id FROM businesses WHERE business_key = ?")
            .bind(business_key)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((stored_cid, stored_place_id)) = stored else {
        return Ok(false);
    };

    let cid_conflict = match (record.cid, stored_cid.as_deref()) {
        (Some(ours), Some(theirs)) => theirs != ours.to_string(),
        _ => false,
    };
    let place_conflict = match (record.place_id.as_deref(), stored_place_id.as_deref()) {
        (Some(ours), Some(theirs)) => ours != theirs,
        _ => false,
    };
    Ok(cid_conflict || place_conflict)
}

async fn insert_alias(conn: &mut SqliteConnection, alias: &str, business_key: &str, now: i64) -> CacheResult<()> {
    sqlx::query("INSERT OR IGNORE INTO identity_aliases (alias_key, business_key, created_at) VALUES (?, ?, ?)")
        .bind(alias)
        .bind(business_key)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn load_entry(conn: &mut SqliteConnection, business_key: &str) -> CacheResult<Option<CacheEntry>> {
    let row: Option<BusinessRow> = sqlx::query_as(
        r#"
        SELECT business_key, record_json, quality_score, source_engine, first_seen_at, last_updated_at, update_count
        FROM businesses WHERE business_key = ?
        "#,
    )
    .bind(business_key)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let reviews: Vec<ReviewRow> = sqlx::query_as(
        "SELECT reviewer, rating, text, relative_date FROM reviews WHERE business_key = ? ORDER BY id",
    )
    .bind(business_key)
    .fetch_all(&mut *conn)
    .await?;
    let images: Vec<ImageRow> =
        sqlx::query_as("SELECT url, resolution FROM images WHERE business_key = ? ORDER BY id")
            .bind(business_key)
            .fetch_all(&mut *conn)
            .await?;

    let mut record: Record = serde_json::from_str(&row.record_json)?;
    record.reviews = reviews
        .into_iter()
        .map(|r| Review {
            reviewer: r.reviewer,
            rating: r.rating.map(|v| v as f32),
            text: r.text,
            relative_date: r.relative_date,
        })
        .collect();
    record.images = images
        .into_iter()
        .map(|i| Image { url: i.url, resolution: i.resolution })
        .collect();
    record.quality_score = row.quality_score.clamp(0, 100) as u8;

    Ok(Some(CacheEntry {
        identity: parse_key(&row.business_key)?,
        record,
        first_seen_at: from_millis(row.first_seen_at)?,
        last_updated_at: from_millis(row.last_updated_at)?,
        update_count: row.update_count.max(0) as u32,
        source_engine: row.source_engine,
    }))
}

fn parse_key(key: &str) -> CacheResult<BusinessIdentity> {
    key.parse().map_err(CacheError::Corrupt)
}

fn from_millis(ms: i64) -> CacheResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| CacheError::Corrupt(format!("bad timestamp {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn starbucks() -> Record {
        Record::builder("Starbucks")
            .cid(Some(6132208262146062126))
            .address(Some("1585 Broadway, New York, NY 10036"))
            .phone(Some("+1-212-555-0100"))
            .coordinates(Some(40.7580), Some(-73.9855))
            .review("Ann", Some(4.0), "Busy but fast", Some("2 weeks ago"))
            .image("https://img.example/sb-1.jpg", Some("high"))
            .build()
            .unwrap()
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_upsert_then_get() {
        let store = CacheStore::in_memory().await.unwrap();
        let record = starbucks();

        let entry = store.upsert(&record, "fast").await.unwrap();
        assert_eq!(entry.identity, BusinessIdentity::Cid(6132208262146062126));
        assert_eq!(entry.update_count, 1);
        assert_eq!(entry.source_engine, "fast");
        assert!(entry.last_updated_at >= entry.first_seen_at);
        assert_eq!(entry.record.reviews.len(), 1);
        assert_eq!(entry.record.images.len(), 1);
        assert_eq!(entry.record.name, "Starbucks");

        let hit = store.get(&entry.identity, HOUR).await.unwrap().unwrap();
        assert_eq!(hit.record, entry.record);
    }

    #[tokio::test]
    async fn test_zero_max_age_never_hits() {
        let store = CacheStore::in_memory().await.unwrap();
        let entry = store.upsert(&starbucks(), "fast").await.unwrap();
        assert!(store.get(&entry.identity, Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_entry_is_a_miss() {
        let store = CacheStore::in_memory().await.unwrap();
        let entry = store.upsert(&starbucks(), "fast").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get(&entry.identity, Duration::from_millis(5)).await.unwrap().is_none());
        assert!(store.get(&entry.identity, HOUR).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_repeated_upsert_never_shrinks_collections() {
        let store = CacheStore::in_memory().await.unwrap();
        let record = starbucks();

        let first = store.upsert(&record, "fast").await.unwrap();
        let second = store.upsert(&record, "fast").await.unwrap();
        assert_eq!(second.record.reviews.len(), first.record.reviews.len());
        assert_eq!(second.record.images.len(), first.record.images.len());
        assert_eq!(second.update_count, 2);
        assert_eq!(second.first_seen_at, first.first_seen_at);

        let smaller = Record::builder("Starbucks").cid(Some(6132208262146062126)).build().unwrap();
        let third = store.upsert(&smaller, "fallback").await.unwrap();
        assert_eq!(third.record.reviews.len(), 1);
        assert_eq!(third.record.images.len(), 1);
        assert_eq!(third.record.address, record.address);
        assert_eq!(third.update_count, 3);
        assert_eq!(third.source_engine, "fallback");
        assert!(third.record.quality_score >= record.quality_score);
    }

    #[tokio::test]
    async fn test_additional_reviews_accumulate() {
        let store = CacheStore::in_memory().await.unwrap();
        store.upsert(&starbucks(), "fast").await.unwrap();

        let more = Record::builder("Starbucks")
            .cid(Some(6132208262146062126))
            .review("Bob", Some(2.0), "Cold latte", None)
            .review("Ann", Some(4.0), "Busy but fast", None)
            .build()
            .unwrap();
        let entry = store.upsert(&more, "fast").await.unwrap();
        assert_eq!(entry.record.reviews.len(), 2);
        assert_eq!(entry.record.reviews[0].reviewer, "Ann");
        assert_eq!(entry.record.reviews[1].reviewer, "Bob");
    }

    #[tokio::test]
    async fn test_identity_survives_losing_the_cid() {
        let store = CacheStore::in_memory().await.unwrap();
        let first = store.upsert(&starbucks(), "fast").await.unwrap();

        // Same business, but this scrape did not capture the CID.
        let without_cid = Record::builder("Starbucks")
            .address(Some("1585 Broadway, New York, NY 10036"))
            .phone(Some("+1 212 555 0100"))
            .build()
            .unwrap();
        assert_eq!(store.resolve_identity(&without_cid).await.unwrap(), Some(first.identity.clone()));

        let second = store.upsert(&without_cid, "fallback").await.unwrap();
        assert_eq!(second.identity, first.identity);
        assert_eq!(second.update_count, 2);
        assert_eq!(store.stats().await.unwrap().total_entries, 1);
    }

    #[tokio::test]
    async fn test_same_fingerprint_different_cid_stays_separate() {
        let store = CacheStore::in_memory().await.unwrap();
        let nyc = Record::builder("Starbucks")
            .cid(Some(1))
            .coordinates(Some(40.758), Some(-73.9855))
            .image("https://img.example/nyc.jpg", Some("high"))
            .build()
            .unwrap();
        let la = Record::builder("Starbucks")
            .cid(Some(2))
            .coordinates(Some(34.05), Some(-118.24))
            .image("https://img.example/la.jpg", Some("high"))
            .build()
            .unwrap();

        let first = store.upsert(&nyc, "fast").await.unwrap();
        assert_eq!(store.resolve_identity(&la).await.unwrap(), None);
        let second = store.upsert(&la, "fast").await.unwrap();

        assert_eq!(first.identity, BusinessIdentity::Cid(1));
        assert_eq!(second.identity, BusinessIdentity::Cid(2));
        assert_eq!(second.update_count, 1);

        let kept = store.get(&BusinessIdentity::Cid(1), HOUR).await.unwrap().unwrap();
        assert_eq!(kept.record.cid, Some(1));
        assert_eq!(kept.record.location.map(|g| g.lat), Some(40.758));
        assert_eq!(kept.record.images.len(), 1);
        assert_eq!(store.stats().await.unwrap().total_entries, 2);
    }

    #[tokio::test]
    async fn test_late_cid_links_to_fingerprint_entry() {
        let store = CacheStore::in_memory().await.unwrap();
        let bare = Record::builder("Corner Deli").address(Some("1 Main St")).build().unwrap();
        let first = store.upsert(&bare, "fast").await.unwrap();
        assert!(matches!(first.identity, BusinessIdentity::Fingerprint(_)));

        let with_cid = Record::builder("Corner Deli").address(Some("1 Main St")).cid(Some(555)).build().unwrap();
        let second = store.upsert(&with_cid, "fast").await.unwrap();
        assert_eq!(second.identity, first.identity);
        assert_eq!(second.record.cid, Some(555));

        let via_cid = store.get(&BusinessIdentity::Cid(555), HOUR).await.unwrap().unwrap();
        assert_eq!(via_cid.identity, first.identity);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_keep_both_reviews() {
        let store = Arc::new(CacheStore::in_memory().await.unwrap());
        let a = Record::builder("Starbucks")
            .cid(Some(1))
            .review("Ann", Some(5.0), "Lovely staff", None)
            .build()
            .unwrap();
        let b = Record::builder("Starbucks")
            .cid(Some(1))
            .review("Bob", Some(1.0), "Wrong order", None)
            .build()
            .unwrap();

        let (sa, sb) = (store.clone(), store.clone());
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { sa.upsert(&a, "fast").await }),
            tokio::spawn(async move { sb.upsert(&b, "fallback").await }),
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();

        let entry = store.get(&BusinessIdentity::Cid(1), HOUR).await.unwrap().unwrap();
        assert_eq!(entry.record.reviews.len(), 2);
        assert_eq!(entry.update_count, 2);
    }

    #[tokio::test]
    async fn test_query_alias() {
        let store = CacheStore::in_memory().await.unwrap();
        let entry = store.upsert(&starbucks(), "fast").await.unwrap();
        store.remember_query("query:starbucks times square nyc", &entry.identity).await.unwrap();

        let hit = store.get_by_query("query:starbucks times square nyc", HOUR).await.unwrap().unwrap();
        assert_eq!(hit.identity, entry.identity);
        assert!(store.get_by_query("query:unknown", HOUR).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_old_entries_and_children() {
        let store = CacheStore::in_memory().await.unwrap();
        let entry = store.upsert(&starbucks(), "fast").await.unwrap();
        store.upsert(&Record::builder("Other").cid(Some(2)).build().unwrap(), "fast").await.unwrap();

        assert_eq!(store.sweep(HOUR).await.unwrap(), 0);
        let deleted = store.sweep_before(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(deleted, 2);

        assert!(store.get(&entry.identity, HOUR).await.unwrap().is_none());
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.total_reviews, 0);
        assert_eq!(stats.total_images, 0);
    }

    #[tokio::test]
    async fn test_stats_and_history() {
        let store = CacheStore::in_memory().await.unwrap();
        let entry = store.upsert(&starbucks(), "fast").await.unwrap();
        store.upsert(&Record::builder("Name Only").build().unwrap(), "fallback").await.unwrap();

        for (engine, success) in [("fast", true), ("fast", false), ("fallback", true)] {
            store
                .record_extraction(&ExtractionEvent {
                    business_key: success.then(|| entry.identity.key()),
                    query: "starbucks".to_string(),
                    engine: engine.to_string(),
                    duration: Duration::from_millis(1000),
                    quality_score: success.then_some(70),
                    success,
                    error: (!success).then(|| "timeout".to_string()),
                })
                .await
                .unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_reviews, 1);
        assert_eq!(stats.total_images, 1);
        let expected_avg = (entry.record.quality_score as f64 + 15.0) / 2.0;
        assert!((stats.average_quality - expected_avg).abs() < 1e-9);

        assert_eq!(stats.engines.len(), 2);
        let fast = stats.engines.iter().find(|e| e.engine == "fast").unwrap();
        assert_eq!(fast.attempts, 2);
        assert_eq!(fast.successes, 1);
        assert!((fast.average_duration_ms - 1000.0).abs() < 1e-9);
    }
}
