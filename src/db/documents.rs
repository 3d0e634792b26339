// PostgreSQL document store: one row per document, optimistic version CAS

use crate::clock::Clock;
use crate::store::{
    BatchWrite, DocumentStore, Mutation, StoreError, StoreResult, StoredDocument, TxFn,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;

pub struct PgDocumentStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    fn row_to_document(row: &sqlx::postgres::PgRow) -> StoreResult<StoredDocument> {
        Ok(StoredDocument {
            id: row.try_get("id")?,
            data: row.try_get("data")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<StoredDocument>> {
        let row = sqlx::query(
            r#"
            SELECT id, data, expires_at
            FROM documents
            WHERE collection = $1 AND id = $2
              AND (expires_at IS NULL OR expires_at > $3)
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_document).transpose()
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        data: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, version, expires_at, updated_at)
            VALUES ($1, $2, $3, 1, $4, NOW())
            ON CONFLICT (collection, id) DO UPDATE
            SET data = EXCLUDED.data,
                version = documents.version + 1,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(data)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM documents
            WHERE collection = $1 AND id = $2
              AND (expires_at IS NULL OR expires_at > $3)
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<StoredDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT id, data, expires_at
            FROM documents
            WHERE collection = $1
              AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY id
            "#,
        )
        .bind(collection)
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_document).collect()
    }

    async fn transact(&self, collection: &str, id: &str, body: &mut TxFn<'_>) -> StoreResult<()> {
        let now = self.clock.now();
        let row = sqlx::query(
            "SELECT data, version, expires_at FROM documents WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        // An expired row still carries a version for the compare-and-set
        let (current, version) = match &row {
            Some(row) => {
                let version: i64 = row.try_get("version")?;
                let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at")?;
                let data: Value = row.try_get("data")?;
                let live = crate::store::is_live(expires_at, now);
                (live.then_some(data), Some(version))
            }
            None => (None, None),
        };

        let affected = match (body(current)?, version) {
            (Mutation::Keep, _) => return Ok(()),
            (Mutation::Put { data, expires_at }, Some(version)) => sqlx::query(
                r#"
                UPDATE documents
                SET data = $3, version = version + 1, expires_at = $4, updated_at = NOW()
                WHERE collection = $1 AND id = $2 AND version = $5
                "#,
            )
            .bind(collection)
            .bind(id)
            .bind(data)
            .bind(expires_at)
            .bind(version)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (Mutation::Put { data, expires_at }, None) => sqlx::query(
                r#"
                INSERT INTO documents (collection, id, data, version, expires_at, updated_at)
                VALUES ($1, $2, $3, 1, $4, NOW())
                ON CONFLICT (collection, id) DO NOTHING
                "#,
            )
            .bind(collection)
            .bind(id)
            .bind(data)
            .bind(expires_at)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (Mutation::Delete, Some(version)) => sqlx::query(
                "DELETE FROM documents WHERE collection = $1 AND id = $2 AND version = $3",
            )
            .bind(collection)
            .bind(id)
            .bind(version)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (Mutation::Delete, None) => return Ok(()),
        };

        if affected == 0 {
            return Err(StoreError::conflict(collection, id));
        }
        Ok(())
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for write in writes {
            match write {
                BatchWrite::Put {
                    collection,
                    id,
                    data,
                    expires_at,
                } => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (collection, id, data, version, expires_at, updated_at)
                        VALUES ($1, $2, $3, 1, $4, NOW())
                        ON CONFLICT (collection, id) DO UPDATE
                        SET data = EXCLUDED.data,
                            version = documents.version + 1,
                            expires_at = EXCLUDED.expires_at,
                            updated_at = NOW()
                        "#,
                    )
                    .bind(collection)
                    .bind(id)
                    .bind(data)
                    .bind(expires_at)
                    .execute(&mut *tx)
                    .await?;
                }
                BatchWrite::Delete { collection, id } => {
                    sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
                        .bind(collection)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn purge_expired(&self, collection: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM documents WHERE collection = $1 AND expires_at IS NOT NULL AND expires_at <= $2",
        )
        .bind(collection)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> StoreResult<()> {
        crate::db::health_check(&self.pool).await
    }
}
