//! In-memory service status, fed by observer events.
//!
//! Holds the counters and current-task view an operator dashboard renders.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Local};
use serde::Serialize;

use super::{EventKind, Observer, ObserverEvent};

const MAX_LOG_LINES: usize = 200;
const SNAPSHOT_LOG_LINES: usize = 50;

/// Task counters for the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_processed: u64,
}

/// The task being processed right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentTask {
    pub task_id: String,
    pub started_at: DateTime<Local>,
    pub current_step: String,
    pub date: Option<String>,
    pub cash_register: Option<String>,
    pub file_reference: Option<String>,
    pub third_party: Option<String>,
    pub nature: Option<String>,
    pub description: Option<String>,
    pub total_line_items: u64,
    pub current_line_item: u64,
    pub line_item_details: Option<String>,
}

/// Point-in-time copy of the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub stats: TaskStats,
    pub success_rate: f64,
    pub current_task: Option<CurrentTask>,
    pub recent_logs: Vec<String>,
    pub uptime_seconds: Option<f64>,
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    stats: TaskStats,
    current_task: Option<CurrentTask>,
    /// Received but not yet started; counted in `pending`.
    waiting: HashSet<String>,
    logs: VecDeque<String>,
    session_started_at: Option<DateTime<Local>>,
}

/// Thread-safe status tracker.
#[derive(Debug, Default)]
pub struct StatusTracker {
    state: Mutex<State>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.lock();
        let finished = state.stats.completed + state.stats.failed;
        let success_rate = if finished > 0 {
            state.stats.completed as f64 / finished as f64 * 100.0
        } else {
            0.0
        };
        let skip = state.logs.len().saturating_sub(SNAPSHOT_LOG_LINES);

        StatusSnapshot {
            connected: state.connected,
            stats: state.stats.clone(),
            success_rate,
            current_task: state.current_task.clone(),
            recent_logs: state.logs.iter().skip(skip).cloned().collect(),
            uptime_seconds: state
                .session_started_at
                .map(|start| (Local::now() - start).num_milliseconds() as f64 / 1000.0),
        }
    }

    pub fn add_log(&self, message: &str, level: &str) {
        let mut state = self.lock();
        Self::push_log(&mut state, message, level);
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.stats = TaskStats::default();
        state.current_task = None;
        state.waiting.clear();
        state.session_started_at = None;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push_log(state: &mut State, message: &str, level: &str) {
        let line = format!("[{}] [{}] {}", Local::now().format("%H:%M:%S"), level, message);
        state.logs.push_back(line);
        while state.logs.len() > MAX_LOG_LINES {
            state.logs.pop_front();
        }
    }

    fn finish_task(state: &mut State, task_id: Option<&str>, success: bool) {
        // Rejected before starting: it leaves the pending count, not processing.
        let never_started = task_id.map_or(false, |id| state.waiting.remove(id));
        if never_started {
            state.stats.pending = state.stats.pending.saturating_sub(1);
        } else {
            state.stats.processing = state.stats.processing.saturating_sub(1);
        }
        if success {
            state.stats.completed += 1;
        } else {
            state.stats.failed += 1;
        }
        state.stats.total_processed += 1;

        let matches = match (&state.current_task, task_id) {
            (Some(task), Some(id)) => task.task_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            state.current_task = None;
        }
    }
}

impl Observer for StatusTracker {
    fn notify(&self, event: &ObserverEvent) {
        let mut state = self.lock();
        let text = |key: &str| event.str_attr(key).map(str::to_string);

        match event.kind {
            EventKind::Connecting => {}
            EventKind::Connected => {
                state.connected = true;
                if state.session_started_at.is_none() {
                    state.session_started_at = Some(Local::now());
                }
            }
            EventKind::Disconnected => state.connected = false,
            EventKind::TaskReceived => {
                // A redelivered task is still one pending task.
                let fresh = match text("task_id") {
                    Some(id) => state.waiting.insert(id),
                    None => true,
                };
                if fresh {
                    state.stats.pending += 1;
                }
            }
            EventKind::TaskStarted => {
                if let Some(id) = event.str_attr("task_id") {
                    state.waiting.remove(id);
                }
                state.stats.pending = state.stats.pending.saturating_sub(1);
                state.stats.processing += 1;
                state.current_task = Some(CurrentTask {
                    task_id: text("task_id").unwrap_or_default(),
                    started_at: Local::now(),
                    current_step: String::new(),
                    date: text("date"),
                    cash_register: text("cash_register"),
                    file_reference: text("file_reference"),
                    third_party: text("third_party"),
                    nature: text("nature"),
                    description: text("description"),
                    total_line_items: event.u64_attr("total_line_items").unwrap_or(0),
                    current_line_item: 0,
                    line_item_details: None,
                });
            }
            EventKind::Step => {
                if let Some(task) = state.current_task.as_mut() {
                    if let Some(step) = text("step") {
                        task.current_step = step;
                    }
                    if let Some(n) = event.u64_attr("current_line_item") {
                        task.current_line_item = n;
                    }
                    if let Some(details) = text("line_item_details") {
                        task.line_item_details = Some(details);
                    }
                }
            }
            EventKind::TaskCompleted => {
                let success = text("status").map_or(true, |s| s == "COMPLETED");
                Self::finish_task(&mut state, event.str_attr("task_id"), success);
            }
            EventKind::TaskFailed => {
                Self::finish_task(&mut state, event.str_attr("task_id"), false);
            }
        }

        let line = format!(
            "{} {}",
            event.kind,
            event.str_attr("task_id").unwrap_or_default()
        );
        let level = match event.kind {
            EventKind::TaskFailed | EventKind::Disconnected => "WARNING",
            _ => "INFO",
        };
        Self::push_log(&mut state, line.trim_end(), level);
    }
}
