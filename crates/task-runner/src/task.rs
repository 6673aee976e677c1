//! Task and task result records exchanged with the task service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task status as seen by workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Scheduled server-side, not yet picked up
    Scheduled,

    /// Delivered to a worker
    InProgress,

    /// Completed successfully
    Completed,

    /// Failed during execution
    Failed,
}

impl TaskStatus {
    /// Whether no further transitions are expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A unit of work delivered by the task service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task id (empty means "no task")
    pub task_id: String,

    /// Task definition name; workers register for one task type
    #[serde(rename = "taskDefName")]
    pub task_type: String,

    /// Owning workflow instance
    pub workflow_instance_id: String,

    pub status: TaskStatus,

    #[serde(default)]
    pub input_data: Map<String, Value>,

    /// Execution domain the task was routed through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// How many times the task has been polled
    #[serde(default)]
    pub poll_count: u32,

    /// Server-side response timeout, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_timeout_seconds: Option<u64>,
}

impl Task {
    /// Create a scheduled task
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        workflow_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            workflow_instance_id: workflow_instance_id.into(),
            status: TaskStatus::Scheduled,
            input_data: Map::new(),
            domain: None,
            poll_count: 0,
            response_timeout_seconds: None,
        }
    }

    /// Add an input value
    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input_data.insert(key.into(), value.into());
        self
    }

    /// Route the task through a domain
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Whether this is a real task (non-blank id)
    pub fn has_id(&self) -> bool {
        !self.task_id.trim().is_empty()
    }
}

/// Result status reported back to the task service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResultStatus {
    /// Still running; the service calls back after `callback_after_seconds`
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A log line captured during task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecLog {
    pub log: String,
    pub task_id: String,
    pub created_time: DateTime<Utc>,
}

/// Outcome of executing a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub workflow_instance_id: String,
    pub task_id: String,

    /// Identity of the worker that executed the task
    #[serde(default)]
    pub worker_id: String,

    pub status: TaskResultStatus,

    /// Inline output; cleared when externalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_for_incompletion: Option<String>,

    #[serde(default)]
    pub logs: Vec<TaskExecLog>,

    /// Reference to externally stored output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_output_payload_storage_path: Option<String>,

    #[serde(default)]
    pub callback_after_seconds: u64,
}

impl TaskResult {
    /// Build a result for a task, carrying over its identity and status
    pub fn from_task(task: &Task) -> Self {
        let status = match task.status {
            TaskStatus::Completed => TaskResultStatus::Completed,
            TaskStatus::Failed => TaskResultStatus::Failed,
            TaskStatus::Scheduled | TaskStatus::InProgress => TaskResultStatus::InProgress,
        };

        Self {
            workflow_instance_id: task.workflow_instance_id.clone(),
            task_id: task.task_id.clone(),
            worker_id: String::new(),
            status,
            output_data: Some(Map::new()),
            reason_for_incompletion: None,
            logs: vec![],
            external_output_payload_storage_path: None,
            callback_after_seconds: 0,
        }
    }

    /// A completed result for the task
    pub fn complete(task: &Task) -> Self {
        Self {
            status: TaskResultStatus::Completed,
            ..Self::from_task(task)
        }
    }

    /// A failed result for the task
    pub fn failed(task: &Task, reason: impl Into<String>) -> Self {
        Self {
            status: TaskResultStatus::Failed,
            reason_for_incompletion: Some(reason.into()),
            ..Self::from_task(task)
        }
    }

    /// An in-progress result asking to be called back later
    pub fn in_progress(task: &Task, callback_after_seconds: u64) -> Self {
        Self {
            status: TaskResultStatus::InProgress,
            callback_after_seconds,
            ..Self::from_task(task)
        }
    }

    /// Add an output value
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.output_data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Append a log line
    pub fn log(&mut self, line: impl Into<String>) {
        self.logs.push(TaskExecLog {
            log: line.into(),
            task_id: self.task_id.clone(),
            created_time: Utc::now(),
        });
    }

    /// Size of the inline output once serialized
    pub fn output_size(&self) -> usize {
        self.output_data
            .as_ref()
            .and_then(|output| serde_json::to_vec(output).ok())
            .map_or(0, |bytes| bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blank_id_is_not_a_task() {
        assert!(Task::new("t-1", "encode", "wf-1").has_id());
        assert!(!Task::new("", "encode", "wf-1").has_id());
        assert!(!Task::new("   ", "encode", "wf-1").has_id());
    }

    #[test]
    fn test_result_status_follows_task_status() {
        let mut task = Task::new("t-1", "encode", "wf-1");
        assert_eq!(
            TaskResult::from_task(&task).status,
            TaskResultStatus::InProgress
        );

        task.status = TaskStatus::Failed;
        let result = TaskResult::from_task(&task);
        assert_eq!(result.status, TaskResultStatus::Failed);
        assert_eq!(result.task_id, "t-1");
        assert_eq!(result.workflow_instance_id, "wf-1");
    }

    #[test]
    fn test_log_lines_carry_task_id() {
        let task = Task::new("t-9", "encode", "wf-1");
        let mut result = TaskResult::failed(&task, "boom");
        result.log("stack line");

        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].task_id, "t-9");
        assert_eq!(result.reason_for_incompletion.as_deref(), Some("boom"));
    }

    #[test]
    fn test_wire_field_names() {
        let task = Task::new("t-1", "encode", "wf-1").with_input("size", 3);
        let value = serde_json::to_value(&task).unwrap();

        assert_eq!(value["taskDefName"], json!("encode"));
        assert_eq!(value["workflowInstanceId"], json!("wf-1"));
        assert_eq!(value["status"], json!("SCHEDULED"));
        assert_eq!(value["inputData"]["size"], json!(3));
    }

    #[test]
    fn test_output_size_counts_inline_output() {
        let task = Task::new("t-1", "encode", "wf-1");
        let result = TaskResult::complete(&task).with_output("k", "v");
        assert_eq!(result.output_size(), r#"{"k":"v"}"#.len());

        let cleared = TaskResult {
            output_data: None,
            ..result
        };
        assert_eq!(cleared.output_size(), 0);
    }
}
