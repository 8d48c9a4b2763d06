use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "running" | "in_progress" | "in-progress" => Ok(Self::Running),
            "completed" | "complete" | "success" | "succeeded" => Ok(Self::Completed),
            "failed" | "failure" | "error" => Ok(Self::Failed),
            other => Err(format!("Unknown execution status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work inside an [`Execution`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub index: usize,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn pending(index: usize) -> Self {
        Self {
            index,
            name: String::new(),
            description: None,
            status: StepStatus::Pending,
            duration_ms: None,
            error: None,
        }
    }
}

/// Local mirror of one multi-step skill run on the orchestrator.
///
/// `steps` has exactly `total_steps` entries for the whole life of the
/// record; `current_step`, once set, always indexes into it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Execution {
    pub id: String,
    pub name: String,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_description: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub steps: Vec<Step>,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        total_steps: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            total_steps,
            current_step: None,
            current_step_name: None,
            current_step_description: None,
            status: ExecutionStatus::Running,
            started_at,
            last_event_at: started_at,
            steps: (0..total_steps).map(Step::pending).collect(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    pub fn steps_with_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|step| step.status == status).count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RememberScope {
    None,
    Skill,
    Always,
}

impl Default for RememberScope {
    fn default() -> Self {
        Self::None
    }
}

impl RememberScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Skill => "skill",
            Self::Always => "always",
        }
    }
}

impl fmt::Display for RememberScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RememberScope {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "" | "none" | "false" => Ok(Self::None),
            "skill" | "session" => Ok(Self::Skill),
            "always" | "global" => Ok(Self::Always),
            other => Err(format!("Unknown remember scope: {other}")),
        }
    }
}

/// A time-bounded question the orchestrator is blocked on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub id: String,
    pub execution_id: String,
    pub step_index: usize,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub remaining_seconds: u64,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    /// A consumer answered through the client.
    Responded,
    /// The local countdown reached zero.
    Expired,
    /// The orchestrator reported the request answered elsewhere.
    Answered,
    /// The orchestrator expired the request on its side.
    ServerExpired,
    /// The client was disposed with the request outstanding.
    Shutdown,
}

impl ResolutionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Responded => "responded",
            Self::Expired => "expired",
            Self::Answered => "answered",
            Self::ServerExpired => "server_expired",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ResolutionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
