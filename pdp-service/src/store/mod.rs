//! Resource object cache backed by embedded SQLite
//!
//! One database file per environment, WAL journaling, a bounded
//! connection pool, and savepoint transactions around every multi-step
//! mutation. Rows are keyed `(id, version)` with a secondary index on the
//! content hash; list queries are ordered by hash so pagination is stable
//! without being predictable.

mod list;

pub use list::{ListFilter, DEFAULT_LIMIT};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Acquire, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::path::Path;

use crate::config::DatabaseConfig;
use crate::error::{GatewayError, Result};
use crate::object::TmfObject;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS tmfobject (
    id TEXT NOT NULL,
    version TEXT NOT NULL,
    organizationIdentifier TEXT NOT NULL DEFAULT '',
    organization TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    lifecycleStatus TEXT NOT NULL DEFAULT '',
    lastUpdate TEXT NOT NULL DEFAULT '',
    content BLOB NOT NULL,
    hash BLOB NOT NULL,
    created INT NOT NULL,
    updated INT NOT NULL,
    PRIMARY KEY (id, version)
);
CREATE INDEX IF NOT EXISTS idx_hash ON tmfobject(hash);
";

const COLUMNS: &str = "id, version, organizationIdentifier, organization, kind, name, \
     description, lifecycleStatus, lastUpdate, content, hash, created, updated";

const LIST_COLUMNS: &str = "id, max(version) AS version, organizationIdentifier, \
     organization, kind, name, description, lifecycleStatus, lastUpdate, content, hash, \
     created, updated";

/// What `upsert` did with the row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Row present, fresh, identical hash; nothing written
    Unchanged,
    /// Row present with identical hash but past the freshness window
    Refreshed,
    /// Row present with a different hash
    Updated,
    /// Row was absent
    Inserted,
}

/// The cache store
#[derive(Clone)]
pub struct TmfCache {
    pool: SqlitePool,
    max_freshness_secs: i64,
}

impl TmfCache {
    /// Open (creating if missing) the cache database at `path`
    pub async fn open(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(10))
            .connect_with(options)
            .await?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }

        tracing::info!(path = %path.as_ref().display(), "cache database ready");

        Ok(Self {
            pool,
            max_freshness_secs: config.max_freshness_secs,
        })
    }

    /// Begin a transaction for callers that batch several mutations
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Single indexed read: presence, stored hash and row freshness
    pub async fn exists(&self, id: &str, version: &str) -> Result<Option<(Vec<u8>, i64)>> {
        let row = sqlx::query("SELECT hash, updated FROM tmfobject WHERE id = ? AND version = ?")
            .bind(id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| {
            let hash: Vec<u8> = r.get("hash");
            let updated: i64 = r.get("updated");
            (hash, now_unix() - updated)
        }))
    }

    /// Insert a new row; duplicates of `(id, version)` are a conflict
    pub async fn insert(&self, obj: &TmfObject) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_in(&mut conn, obj).await
    }

    /// Update an existing row by `(id, version)`
    ///
    /// Refreshes the hash, `updated` and every scalar projection;
    /// `created` is never touched.
    pub async fn update(&self, obj: &TmfObject) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        update_in(&mut conn, obj).await
    }

    /// Write-through upsert in its own transaction
    pub async fn upsert(&self, obj: &TmfObject) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = self.upsert_tx(&mut tx, obj).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Upsert inside a caller-owned transaction, using a savepoint
    ///
    /// Fresh row with an equal hash returns without writing; a stale or
    /// hash-divergent row is written through; an absent row is inserted.
    pub async fn upsert_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        obj: &TmfObject,
    ) -> Result<UpsertOutcome> {
        let mut sp = tx.begin().await?;

        let existing =
            sqlx::query("SELECT hash, updated FROM tmfobject WHERE id = ? AND version = ?")
                .bind(&obj.id)
                .bind(&obj.version)
                .fetch_optional(&mut *sp)
                .await?;

        let outcome = match existing {
            Some(row) => {
                let hash: Vec<u8> = row.get("hash");
                let updated: i64 = row.get("updated");
                let fresh = now_unix() - updated < self.max_freshness_secs;
                let same = hash == obj.hash;
                if fresh && same {
                    UpsertOutcome::Unchanged
                } else {
                    update_in(&mut sp, obj).await?;
                    if same {
                        UpsertOutcome::Refreshed
                    } else {
                        UpsertOutcome::Updated
                    }
                }
            }
            None => {
                insert_in(&mut sp, obj).await?;
                UpsertOutcome::Inserted
            }
        };

        sp.commit().await?;
        Ok(outcome)
    }

    /// Fetch one object; an absent version selects the lexicographically
    /// greatest one
    pub async fn retrieve(&self, id: &str, version: Option<&str>) -> Result<Option<TmfObject>> {
        let row = match version {
            Some(v) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM tmfobject WHERE id = ? AND version = ?"
                ))
                .bind(id)
                .bind(v)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM tmfobject WHERE id = ? \
                     ORDER BY version DESC LIMIT 1"
                ))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(decode_row).transpose()
    }

    /// Filtered aggregate query over the latest version of each object
    pub async fn list(&self, kind: &str, filter: &ListFilter) -> Result<Vec<TmfObject>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {LIST_COLUMNS} FROM tmfobject WHERE kind = "
        ));
        qb.push_bind(kind);

        if !filter.lifecycle_status.is_empty() {
            qb.push(" AND lifecycleStatus IN (");
            {
                let mut sep = qb.separated(", ");
                for v in &filter.lifecycle_status {
                    sep.push_bind(v);
                }
            }
            qb.push(")");
        }

        if let Some(ref org) = filter.organization {
            qb.push(" AND organization = ");
            qb.push_bind(org);
        }

        for (path, values) in &filter.json_filters {
            qb.push(" AND json_extract(content, ");
            qb.push_bind(path);
            qb.push(")");
            if values.len() == 1 {
                qb.push(" = ");
                qb.push_bind(&values[0]);
            } else {
                qb.push(" IN (");
                {
                    let mut sep = qb.separated(", ");
                    for v in values {
                        sep.push_bind(v);
                    }
                }
                qb.push(")");
            }
        }

        qb.push(" GROUP BY id ORDER BY hash LIMIT ");
        qb.push_bind(filter.limit);
        qb.push(" OFFSET ");
        qb.push_bind(filter.offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(decode_row).collect()
    }

    /// Drop every cached row
    pub async fn clear(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM tmfobject")
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    /// Freshness window used by upsert, in seconds
    pub fn max_freshness_secs(&self) -> i64 {
        self.max_freshness_secs
    }

    /// Backdate a row's `updated` timestamp
    #[cfg(test)]
    async fn set_updated(&self, id: &str, version: &str, updated: i64) -> Result<()> {
        sqlx::query("UPDATE tmfobject SET updated = ? WHERE id = ? AND version = ?")
            .bind(updated)
            .bind(id)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_in(conn: &mut SqliteConnection, obj: &TmfObject) -> Result<()> {
    let now = now_unix();
    let res = sqlx::query(
        "INSERT INTO tmfobject (id, version, organizationIdentifier, organization, kind, \
         name, description, lifecycleStatus, lastUpdate, content, hash, created, updated) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&obj.id)
    .bind(&obj.version)
    .bind(&obj.organization_identifier)
    .bind(&obj.organization)
    .bind(&obj.kind)
    .bind(&obj.name)
    .bind(&obj.description)
    .bind(&obj.lifecycle_status)
    .bind(&obj.last_update)
    .bind(&obj.content_json)
    .bind(&obj.hash)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await;

    match res {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
            GatewayError::Conflict(format!("{} {} already cached", obj.id, obj.version)),
        ),
        Err(e) => Err(e.into()),
    }
}

async fn update_in(conn: &mut SqliteConnection, obj: &TmfObject) -> Result<()> {
    let done = sqlx::query(
        "UPDATE tmfobject SET organizationIdentifier = ?, organization = ?, kind = ?, \
         name = ?, description = ?, lifecycleStatus = ?, lastUpdate = ?, content = ?, \
         hash = ?, updated = ? WHERE id = ? AND version = ?",
    )
    .bind(&obj.organization_identifier)
    .bind(&obj.organization)
    .bind(&obj.kind)
    .bind(&obj.name)
    .bind(&obj.description)
    .bind(&obj.lifecycle_status)
    .bind(&obj.last_update)
    .bind(&obj.content_json)
    .bind(&obj.hash)
    .bind(now_unix())
    .bind(&obj.id)
    .bind(&obj.version)
    .execute(conn)
    .await?;

    if done.rows_affected() == 0 {
        return Err(GatewayError::NotFound(format!(
            "{} {} not cached",
            obj.id, obj.version
        )));
    }
    Ok(())
}

/// Rebuild an object from its row
///
/// The payload is reparsed and the hash recomputed; disagreement with the
/// stored hash means the blob was corrupted and fails this call.
fn decode_row(row: SqliteRow) -> Result<TmfObject> {
    let id: String = row.get("id");
    let content: Vec<u8> = row.get("content");
    let stored_hash: Vec<u8> = row.get("hash");

    let mut obj = TmfObject::from_bytes(&content)
        .map_err(|e| GatewayError::Internal(format!("cache corruption for {id}: {e}")))?;

    if obj.hash != stored_hash {
        return Err(GatewayError::Internal(format!(
            "cache corruption for {id}: content does not match stored hash"
        )));
    }

    obj.version = row.get("version");
    obj.organization_identifier = row.get("organizationIdentifier");
    obj.organization = row.get("organization");
    obj.created = row.get("created");
    obj.updated = row.get("updated");
    Ok(obj)
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn scratch_cache() -> (TempDir, TmfCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = TmfCache::open(dir.path().join("test.db"), &DatabaseConfig::default())
            .await
            .unwrap();
        (dir, cache)
    }

    fn offering(id: &str, version: &str, status: &str) -> TmfObject {
        TmfObject::from_value(json!({
            "id": format!("urn:ngsi-ld:product-offering:{id}"),
            "name": format!("offering {id}"),
            "version": version,
            "lifecycleStatus": status,
            "relatedParty": [{"role": "Seller", "name": "did:elsi:VATES-1"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_retrieve_round_trip() {
        let (_dir, cache) = scratch_cache().await;
        let obj = offering("A", "0.1", "Launched");
        cache.insert(&obj).await.unwrap();

        let got = cache.retrieve(&obj.id, Some("0.1")).await.unwrap().unwrap();
        assert_eq!(got.id, obj.id);
        assert_eq!(got.name, obj.name);
        assert_eq!(got.lifecycle_status, "Launched");
        assert_eq!(got.seller, "did:elsi:VATES-1");
        assert_eq!(got.hash, obj.hash);
        assert_eq!(got.content, obj.content);
        assert!(got.created > 0);
        assert_eq!(got.created, got.updated);
    }

    #[tokio::test]
    async fn test_insert_duplicate_is_conflict() {
        let (_dir, cache) = scratch_cache().await;
        let obj = offering("A", "0.1", "Launched");
        cache.insert(&obj).await.unwrap();
        let err = cache.insert(&obj).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn test_retrieve_absent_is_none() {
        let (_dir, cache) = scratch_cache().await;
        assert!(cache
            .retrieve("urn:ngsi-ld:catalog:nope", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_retrieve_picks_greatest_version() {
        let (_dir, cache) = scratch_cache().await;
        for v in ["0.1", "0.10", "0.9"] {
            cache.insert(&offering("A", v, "Launched")).await.unwrap();
        }
        let got = cache
            .retrieve("urn:ngsi-ld:product-offering:A", None)
            .await
            .unwrap()
            .unwrap();
        // Lexicographic, not numeric: "0.9" > "0.10".
        assert_eq!(got.version, "0.9");
    }

    #[tokio::test]
    async fn test_update_preserves_created() {
        let (_dir, cache) = scratch_cache().await;
        let mut obj = offering("A", "0.1", "Launched");
        cache.insert(&obj).await.unwrap();
        let created = cache
            .retrieve(&obj.id, None)
            .await
            .unwrap()
            .unwrap()
            .created;

        obj.stamp("organizationIdentifier", "did:elsi:ORG-42");
        cache.update(&obj).await.unwrap();

        let got = cache.retrieve(&obj.id, None).await.unwrap().unwrap();
        assert_eq!(got.created, created);
        assert_eq!(got.organization_identifier, "did:elsi:ORG-42");
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let (_dir, cache) = scratch_cache().await;
        let err = cache
            .update(&offering("A", "0.1", "Launched"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not-found");
    }

    #[tokio::test]
    async fn test_upsert_outcomes() {
        let (_dir, cache) = scratch_cache().await;
        let mut obj = offering("A", "0.1", "Launched");

        assert_eq!(cache.upsert(&obj).await.unwrap(), UpsertOutcome::Inserted);
        // Fresh and identical: no write.
        assert_eq!(cache.upsert(&obj).await.unwrap(), UpsertOutcome::Unchanged);

        obj.stamp("description", "changed");
        assert_eq!(cache.upsert(&obj).await.unwrap(), UpsertOutcome::Updated);
    }

    #[tokio::test]
    async fn test_upsert_freshness_boundary() {
        let (_dir, cache) = scratch_cache().await;
        let obj = offering("A", "0.1", "Launched");
        cache.insert(&obj).await.unwrap();
        let window = cache.max_freshness_secs();

        // One second inside the window: still fresh, no write.
        cache
            .set_updated(&obj.id, "0.1", now_unix() - window + 1)
            .await
            .unwrap();
        assert_eq!(cache.upsert(&obj).await.unwrap(), UpsertOutcome::Unchanged);

        // One second past it: stale, written through even with an equal hash.
        cache
            .set_updated(&obj.id, "0.1", now_unix() - window - 1)
            .await
            .unwrap();
        assert_eq!(cache.upsert(&obj).await.unwrap(), UpsertOutcome::Refreshed);
    }

    #[tokio::test]
    async fn test_exists_freshness() {
        let (_dir, cache) = scratch_cache().await;
        let obj = offering("A", "0.1", "Launched");
        cache.insert(&obj).await.unwrap();

        let (hash, freshness) = cache.exists(&obj.id, "0.1").await.unwrap().unwrap();
        assert_eq!(hash, obj.hash);
        assert!(freshness >= 0 && freshness < 5);
        assert!(cache.exists(&obj.id, "9.9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_groups() {
        let (_dir, cache) = scratch_cache().await;
        cache.insert(&offering("A", "0.1", "Launched")).await.unwrap();
        cache.insert(&offering("A", "0.2", "Launched")).await.unwrap();
        cache.insert(&offering("B", "0.1", "Launched")).await.unwrap();
        cache.insert(&offering("C", "0.1", "Retired")).await.unwrap();

        let mut query = BTreeMap::new();
        query.insert("lifecycleStatus".to_string(), vec!["Launched".to_string()]);
        let filter = ListFilter::from_query(&query);

        let got = cache.list("productOffering", &filter).await.unwrap();
        assert_eq!(got.len(), 2);
        let a = got
            .iter()
            .find(|o| o.id.ends_with(":A"))
            .expect("offering A present");
        assert_eq!(a.version, "0.2");
    }

    #[tokio::test]
    async fn test_list_json_path_filter() {
        let (_dir, cache) = scratch_cache().await;
        let mut with_bundle = offering("A", "0.1", "Launched");
        with_bundle.stamp("brand", "acme");
        cache.insert(&with_bundle).await.unwrap();
        cache.insert(&offering("B", "0.1", "Launched")).await.unwrap();

        let mut query = BTreeMap::new();
        query.insert("brand".to_string(), vec!["acme".to_string()]);
        let got = cache
            .list("productOffering", &ListFilter::from_query(&query))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert!(got[0].id.ends_with(":A"));
    }

    #[tokio::test]
    async fn test_list_order_is_stable_and_pages_reconstruct() {
        let (_dir, cache) = scratch_cache().await;
        for i in 0..25 {
            cache
                .insert(&offering(&format!("{i:02}"), "0.1", "Launched"))
                .await
                .unwrap();
        }

        let all = cache
            .list(
                "productOffering",
                &ListFilter::default().with_paging(100, 0),
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 25);

        let again = cache
            .list(
                "productOffering",
                &ListFilter::default().with_paging(100, 0),
            )
            .await
            .unwrap();
        let ids =
            |objs: &[TmfObject]| objs.iter().map(|o| o.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&all), ids(&again));

        let mut paged = Vec::new();
        for page in 0..5 {
            let chunk = cache
                .list(
                    "productOffering",
                    &ListFilter::default().with_paging(5, page * 5),
                )
                .await
                .unwrap();
            paged.extend(chunk);
        }
        assert_eq!(ids(&all), ids(&paged));
    }

    #[tokio::test]
    async fn test_default_limit_is_ten() {
        let (_dir, cache) = scratch_cache().await;
        for i in 0..15 {
            cache
                .insert(&offering(&format!("{i:02}"), "0.1", "Launched"))
                .await
                .unwrap();
        }
        let got = cache
            .list("productOffering", &ListFilter::default())
            .await
            .unwrap();
        assert_eq!(got.len(), DEFAULT_LIMIT as usize);
    }

    #[tokio::test]
    async fn test_clear() {
        let (_dir, cache) = scratch_cache().await;
        cache.insert(&offering("A", "0.1", "Launched")).await.unwrap();
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache
            .retrieve("urn:ngsi-ld:product-offering:A", None)
            .await
            .unwrap()
            .is_none());
    }
}
