//! Postgres-backed canonical store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hitledger_common::{DependentKind, DependentRecord, NewHit, Resource};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::store::{Bootstrap, CanonicalStore, HitInsert, UnitOfWork};

const HIT_REQUEST_ID_INDEX: &str = "ix_hits_request_id";
const RESOURCE_URL_INDEX: &str = "ix_resources_url";

// Postgres SQLSTATE codes we react to.
const PG_FOREIGN_KEY_VIOLATION: &str = "23503";
const PG_NO_MATCHING_CONFLICT_TARGET: &str = "42P10";

type ResourceRow = (i64, String, Option<DateTime<Utc>>);

fn to_resource((id, url, metadata_refreshed_at): ResourceRow) -> Resource {
    Resource {
        id,
        url,
        metadata_refreshed_at,
    }
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CanonicalStore for PgStore {
    type Unit = PgUnit;

    async fn begin(&self) -> Result<PgUnit> {
        let tx = self.pool.begin().await?;
        Ok(PgUnit { tx })
    }

    async fn duplicate_logical_keys(&self) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar::<_, String>(
            r#"
            SELECT url
            FROM resources
            GROUP BY url
            HAVING COUNT(*) > 1
            ORDER BY url ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn count_hits(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM hits")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_resources(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM resources")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// PgUnit
// ---------------------------------------------------------------------------

/// One Postgres transaction. Dropping it without `commit` rolls back.
pub struct PgUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn find_resources_by_logical_key(&mut self, url: &str) -> Result<Vec<Resource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT id, url, metadata_refreshed_at
            FROM resources
            WHERE url = $1
            ORDER BY id ASC
            "#,
        )
        .bind(url)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(to_resource).collect())
    }

    async fn lock_resources_by_logical_key(&mut self, url: &str) -> Result<Vec<Resource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            r#"
            SELECT id, url, metadata_refreshed_at
            FROM resources
            WHERE url = $1
            ORDER BY id ASC
            FOR UPDATE
            "#,
        )
        .bind(url)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows.into_iter().map(to_resource).collect())
    }

    async fn insert_resource(&mut self, url: &str) -> Result<Resource> {
        let row = sqlx::query_as::<_, ResourceRow>(
            r#"
            INSERT INTO resources (url)
            VALUES ($1)
            RETURNING id, url, metadata_refreshed_at
            "#,
        )
        .bind(url)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(to_resource(row))
    }

    async fn insert_hit(&mut self, hit: &NewHit, resource_id: i64) -> Result<HitInsert> {
        let attrs = &hit.attributes;
        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO hits
                (request_id, resource_id, occurred_at,
                 session_id, username, browser, device_model, client_os)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (request_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(hit.request_id)
        .bind(resource_id)
        .bind(hit.occurred_at)
        .bind(&attrs.session_id)
        .bind(&attrs.username)
        .bind(&attrs.browser)
        .bind(&attrs.device_model)
        .bind(&attrs.client_os)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| {
            if sqlstate(&e).as_deref() == Some(PG_NO_MATCHING_CONFLICT_TARGET) {
                StoreError::MissingHitIndex
            } else {
                StoreError::Database(e)
            }
        })?;

        Ok(match inserted {
            Some(id) => HitInsert::Inserted(id),
            None => HitInsert::NaturalKeyConflict,
        })
    }

    async fn find_dependent_records(
        &mut self,
        kind: &DependentKind,
        resource_id: i64,
    ) -> Result<Vec<DependentRecord>> {
        kind.validate()?;
        let sql = format!(
            "SELECT {id} FROM {table} WHERE {col} = $1 ORDER BY {id} ASC",
            id = kind.id_column,
            table = kind.table,
            col = kind.reference_column,
        );

        let ids = sqlx::query_scalar::<_, i64>(&sql)
            .bind(resource_id)
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(ids
            .into_iter()
            .map(|id| DependentRecord {
                kind: kind.name.clone(),
                id,
                resource_id,
            })
            .collect())
    }

    async fn rewrite_resource_reference(
        &mut self,
        kind: &DependentKind,
        record_id: i64,
        new_resource_id: i64,
    ) -> Result<()> {
        kind.validate()?;
        let sql = format!(
            "UPDATE {table} SET {col} = $1 WHERE {id} = $2",
            table = kind.table,
            col = kind.reference_column,
            id = kind.id_column,
        );

        let result = sqlx::query(&sql)
            .bind(new_resource_id)
            .bind(record_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RewriteRejected {
                kind: kind.name.clone(),
                record_id,
            });
        }
        Ok(())
    }

    async fn delete_resource(&mut self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM resources WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if sqlstate(&e).as_deref() == Some(PG_FOREIGN_KEY_VIOLATION) {
                    let kind = match &e {
                        sqlx::Error::Database(db) => db
                            .table()
                            .or(db.constraint())
                            .unwrap_or("unknown")
                            .to_string(),
                        _ => "unknown".to_string(),
                    };
                    StoreError::ResourceInUse { id, kind }
                } else {
                    StoreError::Database(e)
                }
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ResourceNotFound(id));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn sqlstate(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[async_trait]
impl Bootstrap for PgStore {
    async fn purge_duplicate_hits(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = purge_duplicate_hits_tx(&mut tx).await?;
        tx.commit().await?;

        info!(removed, "Purged duplicate hits");
        Ok(removed)
    }

    async fn enforce_unique_request_ids(&self) -> Result<(u64, bool)> {
        let mut tx = self.pool.begin().await?;

        // Hold off writers (and other bootstraps) from the index check through
        // the purge and the index build.
        sqlx::query("LOCK TABLE hits IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT i.indisunique
            FROM pg_index i
            JOIN pg_class c ON c.oid = i.indexrelid
            WHERE c.relname = $1
            "#,
        )
        .bind(HIT_REQUEST_ID_INDEX)
        .fetch_optional(&mut *tx)
        .await?;

        if existing == Some(true) {
            tx.rollback().await?;
            info!("Unique index on hits.request_id already exists");
            return Ok((0, false));
        }

        let removed = purge_duplicate_hits_tx(&mut tx).await?;

        if existing == Some(false) {
            warn!("Index on hits.request_id exists but is not unique; recreating");
            sqlx::query(&format!("DROP INDEX {HIT_REQUEST_ID_INDEX}"))
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX {HIT_REQUEST_ID_INDEX} ON hits (request_id)"
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(removed, "Created unique index on hits.request_id");
        Ok((removed, true))
    }

    async fn ensure_resource_lookup_index(&self) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_indexes WHERE indexname = $1)",
        )
        .bind(RESOURCE_URL_INDEX)
        .fetch_one(&self.pool)
        .await?;

        if exists {
            return Ok(false);
        }

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {RESOURCE_URL_INDEX} ON resources (url)"
        ))
        .execute(&self.pool)
        .await?;

        info!("Created lookup index on resources.url");
        Ok(true)
    }
}

async fn purge_duplicate_hits_tx(tx: &mut Transaction<'static, Postgres>) -> Result<u64> {
    // Keep the earliest row per request id.
    let result = sqlx::query(
        r#"
        DELETE FROM hits h
        USING hits earlier
        WHERE h.request_id = earlier.request_id
          AND h.id > earlier.id
        "#,
    )
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}
