//! Task lifecycle events carried on the notification queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

/// What happened to the task.
///
/// Unknown operations fail deserialization; the worker acks and drops them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Complete,
}

/// Task identifier as carried on the wire: the title for create, update and
/// complete, the numeric id for delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskRef {
    Id(i64),
    Title(String),
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRef::Id(id) => write!(f, "{}", id),
            TaskRef::Title(title) => write!(f, "{}", title),
        }
    }
}

impl From<i64> for TaskRef {
    fn from(id: i64) -> Self {
        TaskRef::Id(id)
    }
}

impl From<&str> for TaskRef {
    fn from(title: &str) -> Self {
        TaskRef::Title(title.to_string())
    }
}

impl From<String> for TaskRef {
    fn from(title: String) -> Self {
        TaskRef::Title(title)
    }
}

/// A task event as published by the task service.
///
/// Wire format: `{"operation": "create", "task": "Write report", "email": "a@b.com"}`.
/// `email` is optional; without it the notification is only logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub operation: Operation,
    pub task: TaskRef,
    #[serde(rename = "email", default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

impl TaskEvent {
    pub fn new(operation: Operation, task: impl Into<TaskRef>, recipient: Option<String>) -> Self {
        Self {
            operation,
            task: task.into(),
            recipient,
        }
    }

    pub fn created(title: impl Into<String>, recipient: Option<String>) -> Self {
        Self::new(Operation::Create, TaskRef::Title(title.into()), recipient)
    }

    pub fn updated(title: impl Into<String>, recipient: Option<String>) -> Self {
        Self::new(Operation::Update, TaskRef::Title(title.into()), recipient)
    }

    pub fn completed(title: impl Into<String>, recipient: Option<String>) -> Self {
        Self::new(Operation::Complete, TaskRef::Title(title.into()), recipient)
    }

    pub fn deleted(task_id: i64, recipient: Option<String>) -> Self {
        Self::new(Operation::Delete, TaskRef::Id(task_id), recipient)
    }

    /// Human-readable notification text.
    pub fn message(&self) -> String {
        render_message(self.operation, &self.task)
    }
}

pub fn render_message(operation: Operation, task: &TaskRef) -> String {
    match operation {
        Operation::Create => format!("Task created: {}", task),
        Operation::Update => format!("Task updated: {}", task),
        Operation::Delete => format!("Task with ID: {} deleted", task),
        Operation::Complete => format!("Task mark as completed: {}", task),
    }
}
