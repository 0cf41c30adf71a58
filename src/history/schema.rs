//! History table schema using sea-query.

use sea_query::Iden;

/// Task history table schema.
#[derive(Iden, Clone, Copy)]
pub enum TaskHistoryTable {
    #[iden = "task_history"]
    Table,
    #[iden = "task_id"]
    TaskId,
    #[iden = "operation_number"]
    OperationNumber,
    #[iden = "amount"]
    Amount,
    #[iden = "date"]
    Date,
    #[iden = "cash_register"]
    CashRegister,
    #[iden = "third_party"]
    ThirdParty,
    #[iden = "nature"]
    Nature,
    #[iden = "description"]
    Description,
    #[iden = "total_line_items"]
    TotalLineItems,
    #[iden = "status"]
    Status,
    #[iden = "started_at"]
    StartedAt,
    #[iden = "completed_at"]
    CompletedAt,
    #[iden = "duration_seconds"]
    DurationSeconds,
    #[iden = "error_message"]
    ErrorMessage,
    #[iden = "raw_data"]
    RawData,
}

/// SQL for creating the task history table.
pub const CREATE_TASK_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT UNIQUE NOT NULL,
    operation_number TEXT,
    amount TEXT,
    date TEXT,
    cash_register TEXT,
    third_party TEXT,
    nature TEXT,
    description TEXT,
    total_line_items INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    duration_seconds REAL,
    error_message TEXT,
    raw_data TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_task_history_started_at ON task_history(started_at);
CREATE INDEX IF NOT EXISTS idx_task_history_status ON task_history(status);
"#;
