//! Test result types for durable execution testing.
//!
//! [`TestResult`] is what a runner hands back once an execution reaches a
//! terminal status. It holds the outcome, every non-EXECUTION operation,
//! the handler invocations and the full event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TestError;
use crate::history::HistoryEvent;
use crate::model::{Operation, OperationStatus};
use crate::types::{ExecutionStatus, Invocation, TestResultError};

/// Result of a durable execution test.
///
/// `get_result` and `get_error` are mutually exclusive: the first fails
/// unless the execution succeeded, the second fails when it did.
///
/// # Examples
///
/// ```ignore
/// let result: TestResult<String> = runner.run("input").await?;
///
/// match result.get_status() {
///     ExecutionStatus::Succeeded => assert_eq!(result.get_result()?, "expected output"),
///     _ => panic!("{}", result.get_error()?),
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult<T> {
    status: ExecutionStatus,
    result: Option<T>,
    error: Option<TestResultError>,
    /// Non-EXECUTION operations in arrival order
    operations: Vec<Operation>,
    invocations: Vec<Invocation>,
    history_events: Vec<HistoryEvent>,
}

impl<T> TestResult<T> {
    /// Creates a successful result.
    pub fn success(result: T, operations: Vec<Operation>) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            result: Some(result),
            error: None,
            operations,
            invocations: Vec::new(),
            history_events: Vec::new(),
        }
    }

    /// Creates an unsuccessful result with the given terminal status.
    pub fn failure(
        status: ExecutionStatus,
        error: Option<TestResultError>,
        operations: Vec<Operation>,
    ) -> Self {
        Self {
            status,
            result: None,
            error,
            operations,
            invocations: Vec::new(),
            history_events: Vec::new(),
        }
    }

    pub fn with_invocations(mut self, invocations: Vec<Invocation>) -> Self {
        self.invocations = invocations;
        self
    }

    pub fn with_history_events(mut self, history_events: Vec<HistoryEvent>) -> Self {
        self.history_events = history_events;
        self
    }

    /// Final execution status.
    pub fn get_status(&self) -> ExecutionStatus {
        self.status
    }

    /// Gets the result value.
    ///
    /// Fails with [`TestError::ExecutionFailed`], carrying the execution's
    /// error message and stack trace, when the execution did not succeed.
    pub fn get_result(&self) -> Result<&T, TestError> {
        match self.status {
            ExecutionStatus::Succeeded => self.result.as_ref().ok_or_else(|| {
                TestError::result_not_available("Execution succeeded but result is not set")
            }),
            status if status.is_terminal() => Err(TestError::ExecutionFailed(
                self.error
                    .clone()
                    .unwrap_or_else(|| TestResultError::from_message(format!("Execution {}", status))),
            )),
            status => Err(TestError::result_not_available(format!(
                "Execution is not complete ({})",
                status
            ))),
        }
    }

    /// Gets the error of an execution that did not succeed.
    pub fn get_error(&self) -> Result<&TestResultError, TestError> {
        match self.status {
            ExecutionStatus::Succeeded => Err(TestError::result_not_available(
                "Cannot get error from successful execution",
            )),
            _ => self.error.as_ref().ok_or_else(|| {
                TestError::result_not_available(format!(
                    "No error details for execution status {}",
                    self.status
                ))
            }),
        }
    }

    /// Gets operations, optionally only those with the given status.
    pub fn get_operations(&self, status: Option<OperationStatus>) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| status.map_or(true, |status| op.status == status))
            .collect()
    }

    /// Handler invocations, in the order they ran.
    pub fn get_invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    /// Every history event of the execution, ordered by event id.
    pub fn get_history_events(&self) -> &[HistoryEvent] {
        &self.history_events
    }

    /// True when the execution succeeded.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// True for any unsuccessful terminal status, including STOPPED.
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Number of handler invocations, counting replays.
    pub fn invocation_count(&self) -> usize {
        self.invocations.len()
    }
}

/// Columns shown by [`TestResult::print_with_config`].
#[derive(Debug, Clone)]
pub struct PrintConfig {
    pub show_id: bool,
    pub show_parent_id: bool,
    pub show_name: bool,
    pub show_type: bool,
    pub show_sub_type: bool,
    pub show_status: bool,
    pub show_start_time: bool,
    pub show_end_time: bool,
    pub show_duration: bool,
}

impl Default for PrintConfig {
    fn default() -> Self {
        Self {
            show_id: false,
            show_parent_id: false,
            show_name: true,
            show_type: true,
            show_sub_type: false,
            show_status: true,
            show_start_time: true,
            show_end_time: true,
            show_duration: true,
        }
    }
}

impl PrintConfig {
    /// Shows every column.
    pub fn all() -> Self {
        Self {
            show_id: true,
            show_parent_id: true,
            show_name: true,
            show_type: true,
            show_sub_type: true,
            show_status: true,
            show_start_time: true,
            show_end_time: true,
            show_duration: true,
        }
    }

    /// Name, type and status only.
    pub fn minimal() -> Self {
        Self {
            show_id: false,
            show_parent_id: false,
            show_name: true,
            show_type: true,
            show_sub_type: false,
            show_status: true,
            show_start_time: false,
            show_end_time: false,
            show_duration: false,
        }
    }

    pub fn with_id(mut self, show: bool) -> Self {
        self.show_id = show;
        self
    }

    pub fn with_parent_id(mut self, show: bool) -> Self {
        self.show_parent_id = show;
        self
    }

    pub fn with_sub_type(mut self, show: bool) -> Self {
        self.show_sub_type = show;
        self
    }

    pub fn with_duration(mut self, show: bool) -> Self {
        self.show_duration = show;
        self
    }

    fn columns(&self) -> Vec<Column> {
        [
            (self.show_id, Column::Id),
            (self.show_parent_id, Column::ParentId),
            (self.show_name, Column::Name),
            (self.show_type, Column::Type),
            (self.show_sub_type, Column::SubType),
            (self.show_status, Column::Status),
            (self.show_start_time, Column::StartTime),
            (self.show_end_time, Column::EndTime),
            (self.show_duration, Column::Duration),
        ]
        .into_iter()
        .filter_map(|(show, column)| show.then_some(column))
        .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Column {
    Id,
    ParentId,
    Name,
    Type,
    SubType,
    Status,
    StartTime,
    EndTime,
    Duration,
}

impl Column {
    fn header(self) -> &'static str {
        match self {
            Self::Id => "ID",
            Self::ParentId => "Parent ID",
            Self::Name => "Name",
            Self::Type => "Type",
            Self::SubType => "Sub Type",
            Self::Status => "Status",
            Self::StartTime => "Start Time",
            Self::EndTime => "End Time",
            Self::Duration => "Duration",
        }
    }

    fn value(self, op: &Operation) -> String {
        let or_dash = |value: Option<&String>| value.cloned().unwrap_or_else(|| "-".to_string());
        match self {
            Self::Id => op.id.clone(),
            Self::ParentId => or_dash(op.parent_id.as_ref()),
            Self::Name => or_dash(op.name.as_ref()),
            Self::Type => op.operation_type.to_string(),
            Self::SubType => or_dash(op.sub_type.as_ref()),
            Self::Status => op.status.to_string(),
            Self::StartTime => op.start_timestamp.map(format_timestamp).unwrap_or_else(|| "-".to_string()),
            Self::EndTime => op.end_timestamp.map(format_timestamp).unwrap_or_else(|| "-".to_string()),
            Self::Duration => match (op.start_timestamp, op.end_timestamp) {
                (Some(start), Some(end)) => format_duration((end - start).num_milliseconds()),
                _ => "-".to_string(),
            },
        }
    }
}

impl<T> TestResult<T> {
    /// Prints the operation table with the default columns.
    pub fn print(&self) {
        self.print_with_config(PrintConfig::default());
    }

    /// Prints the operations table to stdout.
    pub fn print_with_config(&self, config: PrintConfig) {
        println!("{}", self.render_table(&config));
    }

    /// Renders the execution summary and operation table.
    pub fn render_table(&self, config: &PrintConfig) -> String {
        let columns = config.columns();
        let headers: Vec<String> = columns.iter().map(|c| c.header().to_string()).collect();
        let rows: Vec<Vec<String>> = self
            .operations
            .iter()
            .map(|op| columns.iter().map(|c| c.value(op)).collect())
            .collect();

        let mut widths: Vec<usize> = headers.iter().map(String::len).collect();
        for row in &rows {
            for (width, value) in widths.iter_mut().zip(row) {
                *width = (*width).max(value.len());
            }
        }

        let mut out = String::new();
        out.push_str("\n=== Execution Result ===\n");
        out.push_str(&format!("Status: {}\n", self.status));
        if let Some(ref err) = self.error {
            out.push_str(&format!("Error: {}\n", err));
        }
        out.push_str(&format!("Operations: {}\n", self.operations.len()));
        out.push_str(&format!("Invocations: {}\n\n", self.invocations.len()));

        out.push_str(&format_row(&headers, &widths));
        out.push_str(&format_separator(&widths));
        for row in &rows {
            out.push_str(&format_row(row, &widths));
        }
        out
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn format_duration(millis: i64) -> String {
    if millis < 1000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.2}s", millis as f64 / 1000.0)
    } else if millis < 3_600_000 {
        format!("{}m {}s", millis / 60_000, (millis % 60_000) / 1000)
    } else {
        format!("{}h {}m", millis / 3_600_000, (millis % 3_600_000) / 60_000)
    }
}

fn format_row(row: &[String], widths: &[usize]) -> String {
    let cells: Vec<String> = row
        .iter()
        .zip(widths)
        .map(|(value, width)| format!("{:<width$}", value, width = width))
        .collect();
    format!("| {} |\n", cells.join(" | "))
}

fn format_separator(widths: &[usize]) -> String {
    let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    format!("+-{}-+\n", dashes.join("-+-"))
}
