//! TDD cycle types: phases, tests, artifacts and queries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodehiveError;
use crate::types::new_id;

/// Phase of a RED -> GREEN -> REFACTOR -> REVIEW cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Red,
    Green,
    Refactor,
    Review,
}

impl Phase {
    /// Conventional commit prefix for changes produced in this phase
    pub fn commit_prefix(&self) -> &'static str {
        match self {
            Self::Red => "feat(tests)",
            Self::Green => "feat(impl)",
            Self::Refactor => "refactor",
            Self::Review => "test(review)",
        }
    }

    /// Lowercase tag used in checkpoint branch names
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Green => "green",
            Self::Refactor => "refactor",
            Self::Review => "review",
        }
    }

    pub fn all() -> [Phase; 4] {
        [Self::Red, Self::Green, Self::Refactor, Self::Review]
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Red => write!(f, "RED"),
            Self::Green => write!(f, "GREEN"),
            Self::Refactor => write!(f, "REFACTOR"),
            Self::Review => write!(f, "REVIEW"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = CodehiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RED" => Ok(Self::Red),
            "GREEN" => Ok(Self::Green),
            "REFACTOR" => Ok(Self::Refactor),
            "REVIEW" => Ok(Self::Review),
            _ => Err(CodehiveError::UnknownPhase(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Input for starting a new cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl FeatureRequest {
    pub fn new(project_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.acceptance_criteria.push(criterion.into());
        self
    }
}

/// One feature moving through the TDD phases on its own branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub phase: Phase,
    pub status: CycleStatus,
    pub branch_name: Option<String>,
    pub merge_request_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Cycle {
    pub fn from_request(request: FeatureRequest) -> Self {
        let now = Utc::now();
        // Short ids keep feature branch names readable
        let id = new_id().chars().take(8).collect();
        Self {
            id,
            project_id: request.project_id,
            title: request.title,
            description: request.description,
            acceptance_criteria: request.acceptance_criteria,
            phase: Phase::Red,
            status: CycleStatus::Active,
            branch_name: None,
            merge_request_url: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Failing,
    Passing,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub cycle_id: String,
    pub name: String,
    /// Acceptance criterion this test covers
    pub criterion: String,
    pub file_path: String,
    pub code: String,
    pub status: TestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TestCase {
    pub fn failing(
        cycle_id: impl Into<String>,
        name: impl Into<String>,
        criterion: impl Into<String>,
        file_path: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            cycle_id: cycle_id.into(),
            name: name.into(),
            criterion: criterion.into(),
            file_path: file_path.into(),
            code: code.into(),
            status: TestStatus::Failing,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    Code,
    Test,
    Doc,
    Config,
}

/// File content produced by a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub cycle_id: String,
    pub kind: ArtifactKind,
    pub path: String,
    pub content: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        cycle_id: impl Into<String>,
        kind: ArtifactKind,
        path: impl Into<String>,
        content: impl Into<String>,
        phase: Phase,
    ) -> Self {
        Self {
            id: new_id(),
            cycle_id: cycle_id.into(),
            kind,
            path: path.into(),
            content: content.into(),
            phase,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryUrgency {
    Blocking,
    Advisory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    #[default]
    Pending,
    Answered,
    Dismissed,
}

/// Question raised to a human during a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub cycle_id: String,
    pub phase: Phase,
    pub question: String,
    pub context: Option<String>,
    pub urgency: QueryUrgency,
    pub status: QueryStatus,
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl Query {
    pub fn new(
        cycle_id: impl Into<String>,
        phase: Phase,
        question: impl Into<String>,
        urgency: QueryUrgency,
    ) -> Self {
        Self {
            id: new_id(),
            cycle_id: cycle_id.into(),
            phase,
            question: question.into(),
            context: None,
            urgency,
            status: QueryStatus::Pending,
            answer: None,
            created_at: Utc::now(),
            answered_at: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Pending blocking queries hold their cycle in place
    pub fn is_blocking(&self) -> bool {
        self.urgency == QueryUrgency::Blocking && self.status == QueryStatus::Pending
    }
}

/// Non-blocking choice reported by the AI collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPoint {
    pub summary: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub chosen: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_prefix_per_phase() {
        let prefixes: Vec<_> = Phase::all().iter().map(|p| p.commit_prefix()).collect();
        assert_eq!(
            prefixes,
            vec!["feat(tests)", "feat(impl)", "refactor", "test(review)"]
        );
    }

    #[test]
    fn test_phase_parse_is_case_insensitive() {
        assert_eq!("green".parse::<Phase>().unwrap(), Phase::Green);
        assert_eq!("REVIEW".parse::<Phase>().unwrap(), Phase::Review);
    }

    #[test]
    fn test_unknown_phase_is_typed_error() {
        let err = "DEPLOY".parse::<Phase>().unwrap_err();
        assert!(matches!(err, CodehiveError::UnknownPhase(ref p) if p == "DEPLOY"));
    }

    #[test]
    fn test_blocking_query_only_while_pending() {
        let mut query = Query::new("c1", Phase::Green, "Which API?", QueryUrgency::Blocking);
        assert!(query.is_blocking());
        query.status = QueryStatus::Answered;
        assert!(!query.is_blocking());

        let advisory = Query::new("c1", Phase::Green, "Style?", QueryUrgency::Advisory);
        assert!(!advisory.is_blocking());
    }

    #[test]
    fn test_new_cycle_starts_red_and_active() {
        let cycle = Cycle::from_request(FeatureRequest::new("p1", "Login").with_criterion("works"));
        assert_eq!(cycle.phase, Phase::Red);
        assert_eq!(cycle.status, CycleStatus::Active);
        assert_eq!(cycle.id.len(), 8);
        assert_eq!(cycle.acceptance_criteria.len(), 1);
    }
}
