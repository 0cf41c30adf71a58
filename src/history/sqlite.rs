//! SQLite TaskHistory implementation.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sea_query::{Expr, Func, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::schema::{TaskHistoryTable as T, CREATE_TASK_HISTORY_TABLE};
use super::{HistoryEntry, HistoryError, HistoryStats, Result, TaskHistory};
use crate::model::OperationStatus;

const COLUMNS: [T; 15] = [
    T::TaskId,
    T::OperationNumber,
    T::Amount,
    T::Date,
    T::CashRegister,
    T::ThirdParty,
    T::Nature,
    T::Description,
    T::TotalLineItems,
    T::Status,
    T::StartedAt,
    T::CompletedAt,
    T::DurationSeconds,
    T::ErrorMessage,
    T::RawData,
];

/// SQLite implementation of TaskHistory.
pub struct SqliteTaskHistory {
    pool: SqlitePool,
}

impl SqliteTaskHistory {
    /// Create a new SQLite task history.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path)).await?;
        let history = Self::new(pool);
        history.init().await?;
        Ok(history)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_TASK_HISTORY_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Timestamps are stored as UTC RFC 3339 so they sort lexically.
fn encode_time(time: &DateTime<Local>) -> String {
    time.with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| HistoryError::Corrupt(format!("timestamp {:?}: {}", raw, e)))
}

fn decode_status(raw: String) -> Result<OperationStatus> {
    serde_json::from_value(serde_json::Value::String(raw.clone()))
        .map_err(|_| HistoryError::Corrupt(format!("status {:?}", raw)))
}

fn decode_row(row: &SqliteRow) -> Result<HistoryEntry> {
    let amount: Option<String> = row.try_get("amount")?;
    let started_at: String = row.try_get("started_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;
    let raw_data: Option<String> = row.try_get("raw_data")?;
    let total_line_items: i64 = row.try_get("total_line_items")?;

    Ok(HistoryEntry {
        task_id: row.try_get("task_id")?,
        operation_number: row.try_get("operation_number")?,
        amount: amount
            .map(|a| Decimal::from_str(&a))
            .transpose()
            .map_err(|e| HistoryError::Corrupt(format!("amount: {}", e)))?,
        date: row.try_get("date")?,
        cash_register: row.try_get("cash_register")?,
        third_party: row.try_get("third_party")?,
        nature: row.try_get("nature")?,
        description: row.try_get("description")?,
        total_line_items: total_line_items.max(0) as u32,
        status: decode_status(row.try_get("status")?)?,
        started_at: decode_time(&started_at)?,
        completed_at: completed_at.as_deref().map(decode_time).transpose()?,
        duration_seconds: row.try_get("duration_seconds")?,
        error_message: row.try_get("error_message")?,
        raw_data: raw_data
            .as_deref()
            .map(|raw| serde_json::from_str(raw))
            .transpose()?,
    })
}

#[async_trait]
impl TaskHistory for SqliteTaskHistory {
    async fn save(&self, entry: &HistoryEntry) -> Result<()> {
        let raw_data = entry
            .raw_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let query = Query::insert()
            .into_table(T::Table)
            .columns(COLUMNS)
            .values_panic([
                entry.task_id.clone().into(),
                entry.operation_number.clone().into(),
                entry.amount.map(|a| a.to_string()).into(),
                entry.date.clone().into(),
                entry.cash_register.clone().into(),
                entry.third_party.clone().into(),
                entry.nature.clone().into(),
                entry.description.clone().into(),
                i64::from(entry.total_line_items).into(),
                entry.status.as_str().into(),
                encode_time(&entry.started_at).into(),
                entry.completed_at.as_ref().map(encode_time).into(),
                entry.duration_seconds.into(),
                entry.error_message.clone().into(),
                raw_data.into(),
            ])
            .on_conflict(
                OnConflict::column(T::TaskId)
                    .update_columns(COLUMNS.into_iter().skip(1))
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        debug!(task_id = %entry.task_id, status = %entry.status, "History saved");

        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<HistoryEntry>> {
        let query = Query::select()
            .columns(COLUMNS)
            .from(T::Table)
            .and_where(Expr::col(T::TaskId).eq(task_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn list(
        &self,
        limit: Option<u32>,
        status: Option<OperationStatus>,
    ) -> Result<Vec<HistoryEntry>> {
        // SelectStatement is !Send; render it before the first await.
        let query = {
            let mut select = Query::select();
            select
                .columns(COLUMNS)
                .from(T::Table)
                .order_by(T::StartedAt, Order::Desc);
            if let Some(status) = status {
                select.and_where(Expr::col(T::Status).eq(status.as_str()));
            }
            if let Some(limit) = limit {
                select.limit(u64::from(limit));
            }
            select.to_string(SqliteQueryBuilder)
        };

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn statistics(&self) -> Result<HistoryStats> {
        let by_status_query = Query::select()
            .column(T::Status)
            .expr_as(Expr::col(T::TaskId).count(), sea_query::Alias::new("n"))
            .from(T::Table)
            .group_by_col(T::Status)
            .to_string(SqliteQueryBuilder);

        let mut by_status = BTreeMap::new();
        let mut total = 0u64;
        for row in sqlx::query(&by_status_query).fetch_all(&self.pool).await? {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            total += n.max(0) as u64;
            by_status.insert(status, n.max(0) as u64);
        }

        let avg_query = Query::select()
            .expr_as(
                Func::avg(Expr::col(T::DurationSeconds)),
                sea_query::Alias::new("avg_duration"),
            )
            .from(T::Table)
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&avg_query).fetch_one(&self.pool).await?;
        let average_duration_seconds: Option<f64> = row.try_get("avg_duration")?;

        Ok(HistoryStats {
            total,
            by_status,
            average_duration_seconds,
        })
    }

    async fn clear_before(&self, cutoff: DateTime<Local>) -> Result<u64> {
        let query = Query::delete()
            .from_table(T::Table)
            .and_where(Expr::col(T::StartedAt).lt(encode_time(&cutoff)))
            .to_string(SqliteQueryBuilder);

        let done = sqlx::query(&query).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }
}
