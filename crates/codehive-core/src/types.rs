//! Epic / Story / Task / Instruction hierarchy types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh record identifier
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Work item priority (0 = most urgent)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "0" => Ok(Self::Critical),
            "high" | "1" => Ok(Self::High),
            "medium" | "2" => Ok(Self::Medium),
            "low" | "3" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Lifecycle status shared by every hierarchy level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
    Failed,
    Cancelled,
}

impl Status {
    /// Completed, failed and cancelled items never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Blocked => write!(f, "BLOCKED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" | "INPROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "BLOCKED" => Ok(Self::Blocked),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" | "CANCELED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// The four containment levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HierarchyLevel {
    Epic,
    Story,
    Task,
    Instruction,
}

impl HierarchyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Epic => "epic",
            Self::Story => "story",
            Self::Task => "task",
            Self::Instruction => "instruction",
        }
    }

    /// Name used in error messages
    pub fn label(&self) -> &'static str {
        match self {
            Self::Epic => "Epic",
            Self::Story => "Story",
            Self::Task => "Task",
            Self::Instruction => "Instruction",
        }
    }
}

impl std::fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Levels that carry their own dependency edge set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyLevel {
    Epic,
    Task,
    Instruction,
}

impl DependencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Epic => "epic",
            Self::Task => "task",
            Self::Instruction => "instruction",
        }
    }

    pub fn hierarchy_level(&self) -> HierarchyLevel {
        match self {
            Self::Epic => HierarchyLevel::Epic,
            Self::Task => HierarchyLevel::Task,
            Self::Instruction => HierarchyLevel::Instruction,
        }
    }
}

impl std::fmt::Display for DependencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DependencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "epic" => Ok(Self::Epic),
            "task" => Ok(Self::Task),
            "instruction" => Ok(Self::Instruction),
            _ => Err(format!("Invalid dependency level: {}", s)),
        }
    }
}

/// Edge type between two items of the same level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
    Blocks,
    RelatesTo,
    Sequential,
    Parallel,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocks => write!(f, "BLOCKS"),
            Self::RelatesTo => write!(f, "RELATES_TO"),
            Self::Sequential => write!(f, "SEQUENTIAL"),
            Self::Parallel => write!(f, "PARALLEL"),
        }
    }
}

impl std::str::FromStr for DependencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "BLOCKS" => Ok(Self::Blocks),
            "RELATES_TO" => Ok(Self::RelatesTo),
            "SEQUENTIAL" => Ok(Self::Sequential),
            "PARALLEL" => Ok(Self::Parallel),
            _ => Err(format!("Invalid dependency type: {}", s)),
        }
    }
}

/// Directed edge `from` -> `to` ("from depends on to")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub id: String,
    pub level: DependencyLevel,
    pub from_id: String,
    pub to_id: String,
    pub dep_type: DependencyType,
    pub created_at: DateTime<Utc>,
}

impl DependencyEdge {
    pub fn new(
        level: DependencyLevel,
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        dep_type: DependencyType,
    ) -> Self {
        Self {
            id: new_id(),
            level,
            from_id: from_id.into(),
            to_id: to_id.into(),
            dep_type,
            created_at: Utc::now(),
        }
    }
}

/// Top-level body of work inside a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub priority: Priority,
    /// Sum of every descendant's usage
    pub token_usage: u64,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub epic_id: String,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub priority: Priority,
    pub story_points: Option<u32>,
    pub token_usage: u64,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub story_id: String,
    pub title: String,
    pub description: String,
    /// Free-form classification ("implementation", "test", ...)
    pub task_type: String,
    pub status: Status,
    pub priority: Priority,
    pub estimated_minutes: Option<u32>,
    pub actual_minutes: Option<u32>,
    pub token_usage: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Smallest executable unit of work, ordered by `sequence` within its task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: String,
    pub task_id: String,
    pub sequence: u32,
    pub title: String,
    pub description: String,
    pub directive: String,
    pub expected_outcome: String,
    pub validation_criteria: Option<String>,
    pub status: Status,
    pub priority: Priority,
    pub token_usage: u64,
    pub output: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub executed_by: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateEpic {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl CreateEpic {
    pub fn new(project_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn into_epic(self) -> Epic {
        let now = Utc::now();
        Epic {
            id: new_id(),
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            status: Status::Pending,
            priority: self.priority.unwrap_or_default(),
            token_usage: 0,
            acceptance_criteria: self.acceptance_criteria,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateEpic {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateStory {
    pub epic_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Option<Priority>,
    pub story_points: Option<u32>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl CreateStory {
    pub fn new(epic_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            epic_id: epic_id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_story_points(mut self, points: u32) -> Self {
        self.story_points = Some(points);
        self
    }

    pub fn into_story(self) -> Story {
        let now = Utc::now();
        Story {
            id: new_id(),
            epic_id: self.epic_id,
            title: self.title,
            description: self.description,
            status: Status::Pending,
            priority: self.priority.unwrap_or_default(),
            story_points: self.story_points,
            token_usage: 0,
            acceptance_criteria: self.acceptance_criteria,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_points: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTask {
    pub story_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub task_type: String,
    pub priority: Option<Priority>,
    pub estimated_minutes: Option<u32>,
}

impl CreateTask {
    pub fn new(story_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            title: title.into(),
            task_type: "implementation".to_string(),
            ..Default::default()
        }
    }

    pub fn with_estimate(mut self, minutes: u32) -> Self {
        self.estimated_minutes = Some(minutes);
        self
    }

    pub fn into_task(self) -> Task {
        let now = Utc::now();
        Task {
            id: new_id(),
            story_id: self.story_id,
            title: self.title,
            description: self.description,
            task_type: self.task_type,
            status: Status::Pending,
            priority: self.priority.unwrap_or_default(),
            estimated_minutes: self.estimated_minutes,
            actual_minutes: None,
            token_usage: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTask {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInstruction {
    pub task_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Assigned as max(sequence) + 1 within the task when omitted
    pub sequence: Option<u32>,
    pub directive: String,
    pub expected_outcome: String,
    pub validation_criteria: Option<String>,
    pub priority: Option<Priority>,
}

impl CreateInstruction {
    pub fn new(
        task_id: impl Into<String>,
        directive: impl Into<String>,
        expected_outcome: impl Into<String>,
    ) -> Self {
        let directive = directive.into();
        Self {
            task_id: task_id.into(),
            title: directive.lines().next().unwrap_or_default().to_string(),
            directive,
            expected_outcome: expected_outcome.into(),
            ..Default::default()
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn into_instruction(self, sequence: u32) -> Instruction {
        let now = Utc::now();
        Instruction {
            id: new_id(),
            task_id: self.task_id,
            sequence,
            title: self.title,
            description: self.description,
            directive: self.directive,
            expected_outcome: self.expected_outcome,
            validation_criteria: self.validation_criteria,
            status: Status::Pending,
            priority: self.priority.unwrap_or_default(),
            token_usage: 0,
            output: None,
            error: None,
            execution_time_ms: None,
            executed_by: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInstruction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_criteria: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl UpdateInstruction {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::Low.ordinal(), 3);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            Status::Pending,
            Status::InProgress,
            Status::Completed,
            Status::Blocked,
            Status::Failed,
            Status::Cancelled,
        ] {
            let parsed: Status = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("done".parse::<Status>().is_err());
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&Status::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn test_update_skips_unset_fields() {
        let update = UpdateStory {
            status: Some(Status::Completed),
            ..Default::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(object["status"], "COMPLETED");
    }

    #[test]
    fn test_create_instruction_defaults_title_to_first_line() {
        let input = CreateInstruction::new("task-1", "Add login route\nwith tests", "route exists");
        assert_eq!(input.title, "Add login route");
        let instruction = input.into_instruction(4);
        assert_eq!(instruction.sequence, 4);
        assert_eq!(instruction.status, Status::Pending);
    }
}
