use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{
    ActiveSession, CatalogEntry, ChangeRecord, EntryIdentity, SessionId, SessionSummary,
    StatusFlag,
};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::info;

use crate::{
    CatalogReader, CatalogStore, ChangeFilter, EntryQuery, Page, StatusCounts, StoreError,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(err.to_string()),
            sqlx::Error::PoolClosed => StoreError::Connection(err.to_string()),
            sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("40001" | "40P01")) =>
            {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Postgres-backed catalog.
#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Connection(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(err.to_string()))?;
        info!("catalog migrations applied");
        Ok(())
    }
}

/// Locks the lease row and fails unless `session_id` still holds it.
async fn ensure_holder(
    conn: &mut PgConnection,
    source_id: &str,
    session_id: &SessionId,
) -> Result<(), StoreError> {
    let holder: Option<String> = sqlx::query_scalar(
        "SELECT session_id FROM active_sessions WHERE source_id = $1 FOR UPDATE",
    )
    .bind(source_id)
    .fetch_optional(&mut *conn)
    .await?;
    match holder {
        Some(holder) if holder == session_id.as_str() => Ok(()),
        _ => Err(StoreError::LeaseLost {
            source_id: source_id.to_string(),
            session_id: session_id.clone(),
        }),
    }
}

const CLEAR_SEEN: &str = "UPDATE catalog_entries \
     SET seen_in_session = FALSE, \
         document = jsonb_set(document, '{seen_in_session}', 'false'::jsonb) \
     WHERE source_id = $1";

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn begin_session(
        &self,
        session: &ActiveSession,
        lease: Duration,
    ) -> Result<u64, StoreError> {
        let lease = chrono::Duration::from_std(lease)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let stale_before = session
            .started_at
            .checked_sub_signed(lease)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut tx = self.pool.begin().await?;
        let taken = sqlx::query(
            "INSERT INTO active_sessions (source_id, session_id, started_at, renewed_at) \
             VALUES ($1, $2, $3, NULL) \
             ON CONFLICT (source_id) DO UPDATE \
             SET session_id = EXCLUDED.session_id, started_at = EXCLUDED.started_at, \
                 renewed_at = NULL \
             WHERE active_sessions.session_id = EXCLUDED.session_id \
                OR COALESCE(active_sessions.renewed_at, active_sessions.started_at) <= $4",
        )
        .bind(&session.source_id)
        .bind(session.session_id.as_str())
        .bind(session.started_at)
        .bind(stale_before)
        .execute(&mut *tx)
        .await?;

        if taken.rows_affected() == 0 {
            let holder: String =
                sqlx::query_scalar("SELECT session_id FROM active_sessions WHERE source_id = $1")
                    .bind(&session.source_id)
                    .fetch_one(&mut *tx)
                    .await?;
            return Err(StoreError::SessionConflict {
                source_id: session.source_id.clone(),
                session_id: holder.into(),
            });
        }

        let marked = sqlx::query(&format!("{CLEAR_SEEN} AND status_flag <> 'DELETED'"))
            .bind(&session.source_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(marked.rows_affected())
    }

    async fn find_by_sku(
        &self,
        source_id: &str,
        sku: &str,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        let row: Option<Json<CatalogEntry>> = sqlx::query_scalar(
            "SELECT document FROM catalog_entries \
             WHERE source_id = $1 AND identity_kind = 'sku' AND identity_key = $2",
        )
        .bind(source_id)
        .bind(sku)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(entry)| entry))
    }

    async fn find_by_url(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        let row: Option<Json<CatalogEntry>> = sqlx::query_scalar(
            "SELECT document FROM catalog_entries \
             WHERE source_id = $1 AND url = $2 \
             ORDER BY (identity_kind = 'url') DESC, first_seen_at ASC \
             LIMIT 1",
        )
        .bind(source_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(entry)| entry))
    }

    async fn apply(
        &self,
        session_id: &SessionId,
        entry: &CatalogEntry,
        change: Option<&ChangeRecord>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        ensure_holder(&mut *tx, &entry.source_id, session_id).await?;
        sqlx::query("UPDATE active_sessions SET renewed_at = now() WHERE source_id = $1")
            .bind(&entry.source_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO catalog_entries \
             (id, source_id, identity_kind, identity_key, sku, url, title, status_flag, \
              seen_in_session, last_seen_session_id, needs_processing, first_seen_at, \
              last_updated_at, document) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT (id) DO UPDATE SET \
               sku = EXCLUDED.sku, url = EXCLUDED.url, title = EXCLUDED.title, \
               status_flag = EXCLUDED.status_flag, seen_in_session = EXCLUDED.seen_in_session, \
               last_seen_session_id = EXCLUDED.last_seen_session_id, \
               needs_processing = EXCLUDED.needs_processing, \
               last_updated_at = EXCLUDED.last_updated_at, document = EXCLUDED.document",
        )
        .bind(entry.id)
        .bind(&entry.source_id)
        .bind(entry.identity.kind())
        .bind(entry.identity.key())
        .bind(entry.sku.as_deref())
        .bind(&entry.url)
        .bind(&entry.title)
        .bind(entry.status_flag.as_str())
        .bind(entry.seen_in_session)
        .bind(entry.last_seen_session_id.as_ref().map(SessionId::as_str))
        .bind(entry.needs_processing)
        .bind(entry.first_seen_at)
        .bind(entry.last_updated_at)
        .bind(Json(entry))
        .execute(&mut *tx)
        .await?;

        if let Some(change) = change {
            sqlx::query(
                "INSERT INTO catalog_changes \
                 (id, session_id, source_id, change_type, needs_user_review, recorded_at, document) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(change.id)
            .bind(change.session_id.as_str())
            .bind(&change.source_id)
            .bind(change.change_type.as_str())
            .bind(change.needs_user_review)
            .bind(change.timestamp)
            .bind(Json(change))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn unseen_entries(
        &self,
        source_id: &str,
        session_id: &SessionId,
    ) -> Result<Vec<CatalogEntry>, StoreError> {
        let mut tx = self.pool.begin().await?;
        ensure_holder(&mut *tx, source_id, session_id).await?;
        let rows: Vec<Json<CatalogEntry>> = sqlx::query_scalar(
            "SELECT document FROM catalog_entries \
             WHERE source_id = $1 AND status_flag <> 'DELETED' \
               AND NOT (seen_in_session AND COALESCE(last_seen_session_id = $2, FALSE)) \
             ORDER BY first_seen_at, id",
        )
        .bind(source_id)
        .bind(session_id.as_str())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(rows.into_iter().map(|Json(entry)| entry).collect())
    }

    async fn end_session(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let recorded: Option<String> =
            sqlx::query_scalar("SELECT session_id FROM session_summaries WHERE session_id = $1")
                .bind(summary.session_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if recorded.is_some() {
            return Ok(());
        }

        ensure_holder(&mut *tx, &summary.source_id, &summary.session_id).await?;
        sqlx::query(CLEAR_SEEN)
            .bind(&summary.source_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO session_summaries (session_id, source_id, started_at, document) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (session_id) DO NOTHING",
        )
        .bind(summary.session_id.as_str())
        .bind(&summary.source_id)
        .bind(summary.started_at)
        .bind(Json(summary))
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM active_sessions WHERE source_id = $1")
            .bind(&summary.source_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn push_entry_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &EntryQuery) {
    if let Some(source_id) = &query.source_id {
        qb.push(" AND source_id = ").push_bind(source_id.clone());
    }
    if let Some(status) = query.status {
        qb.push(" AND status_flag = ").push_bind(status.as_str());
    }
    if let Some(needle) = query.search_needle() {
        let pattern = like_pattern(&needle);
        qb.push(" AND (LOWER(title) LIKE ")
            .push_bind(pattern.clone())
            .push(" OR LOWER(COALESCE(sku, '')) LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

#[async_trait]
impl CatalogReader for PgCatalogStore {
    async fn get_entry(
        &self,
        source_id: &str,
        identity: &EntryIdentity,
    ) -> Result<Option<CatalogEntry>, StoreError> {
        let row: Option<Json<CatalogEntry>> = sqlx::query_scalar(
            "SELECT document FROM catalog_entries \
             WHERE source_id = $1 AND identity_kind = $2 AND identity_key = $3",
        )
        .bind(source_id)
        .bind(identity.kind())
        .bind(identity.key())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(entry)| entry))
    }

    async fn list_entries(&self, query: &EntryQuery) -> Result<Page<CatalogEntry>, StoreError> {
        let (page, limit) = query.normalized_paging();
        let offset = i64::try_from(query.offset()).unwrap_or(i64::MAX);

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM catalog_entries WHERE TRUE");
        push_entry_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Postgres>::new("SELECT document FROM catalog_entries WHERE TRUE");
        push_entry_filters(&mut select, query);
        select
            .push(" ORDER BY last_updated_at DESC, id LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(offset);
        let rows: Vec<Json<CatalogEntry>> =
            select.build_query_scalar().fetch_all(&self.pool).await?;

        Ok(Page::new(
            rows.into_iter().map(|Json(entry)| entry).collect(),
            total.max(0) as u64,
            page,
            limit,
        ))
    }

    async fn status_counts(&self, source_id: &str) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status_flag, COUNT(*) FROM catalog_entries \
             WHERE source_id = $1 GROUP BY status_flag",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.parse::<StatusFlag>() {
                Ok(StatusFlag::New) => counts.new += count,
                Ok(StatusFlag::Updated) => counts.updated += count,
                Ok(StatusFlag::Unchanged) => counts.unchanged += count,
                Ok(StatusFlag::Deleted) => counts.deleted += count,
                Err(_) => {}
            }
            counts.all += count;
        }
        Ok(counts)
    }

    async fn changes(&self, filter: &ChangeFilter) -> Result<Vec<ChangeRecord>, StoreError> {
        let mut select =
            QueryBuilder::<Postgres>::new("SELECT document FROM catalog_changes WHERE TRUE");
        if let Some(session_id) = &filter.session_id {
            select
                .push(" AND session_id = ")
                .push_bind(session_id.as_str().to_string());
        }
        if let Some(source_id) = &filter.source_id {
            select.push(" AND source_id = ").push_bind(source_id.clone());
        }
        if filter.review_only {
            select.push(" AND needs_user_review");
        }
        select.push(" ORDER BY recorded_at, id");
        let rows: Vec<Json<ChangeRecord>> =
            select.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|Json(change)| change).collect())
    }

    async fn session_summaries(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let rows: Vec<Json<SessionSummary>> = sqlx::query_scalar(
            "SELECT document FROM session_summaries \
             WHERE ($1::TEXT IS NULL OR source_id = $1) \
             ORDER BY session_id DESC",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(summary)| summary).collect())
    }

    async fn pending_entries(&self, source_id: &str) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows: Vec<Json<CatalogEntry>> = sqlx::query_scalar(
            "SELECT document FROM catalog_entries \
             WHERE source_id = $1 AND needs_processing \
               AND status_flag IN ('NEW', 'UPDATED') \
             ORDER BY last_updated_at",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(entry)| entry).collect())
    }

    async fn mark_processed(
        &self,
        source_id: &str,
        identity: &EntryIdentity,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE catalog_entries SET needs_processing = FALSE, \
               document = jsonb_set( \
                 jsonb_set(document, '{needs_processing}', 'false'::jsonb), \
                 '{processed_at}', to_jsonb($4::TEXT)) \
             WHERE source_id = $1 AND identity_kind = $2 AND identity_key = $3",
        )
        .bind(source_id)
        .bind(identity.kind())
        .bind(identity.key())
        .bind(at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
