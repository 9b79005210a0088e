//! Execution step types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Coarse classification of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Proposal,
    Confirmation,
    ToolResult,
    UserInteraction,
    Error,
    FinalAnswer,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::Proposal => "proposal",
            StepKind::Confirmation => "confirmation",
            StepKind::ToolResult => "tool_result",
            StepKind::UserInteraction => "user_interaction",
            StepKind::Error => "error",
            StepKind::FinalAnswer => "final_answer",
        };
        f.write_str(name)
    }
}

/// One step of a proposed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_number: u32,
    pub description: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub expected_tool: Option<String>,
}

/// A tool invocation as proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub reasoning_tag: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl CallRecord {
    /// Whether `other` names the same tool with identical parameters.
    pub fn same_call(&self, other: &CallRecord) -> bool {
        self.name == other.name && self.parameters == other.parameters
    }
}

/// What was put in front of the confirmation gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "proposal", rename_all = "snake_case")]
pub enum Proposal {
    Plan { steps: Vec<PlanStep> },
    FunctionCall(CallRecord),
    FinalAnswer { result: String, summary: Option<String> },
}

/// Category of an error step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ParseError,
    GenerationFailed,
    ToolNotFound,
    RepeatedCall,
    ToolExecution,
    InteractionFailed,
    StepLimit,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::GenerationFailed => "generation_failed",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::RepeatedCall => "repeated_call",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::InteractionFailed => "interaction_failed",
            ErrorKind::StepLimit => "step_limit",
        };
        f.write_str(name)
    }
}

/// Kind-specific payload of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepPayload {
    /// A decision awaiting confirmation.
    Proposal(Proposal),
    /// A plan the user accepted.
    Plan { steps: Vec<PlanStep> },
    /// The user accepted the pending proposal.
    Confirmation,
    /// The user rejected the pending proposal with feedback.
    DecisionRevision { feedback: String },
    /// The user aborted the session.
    ExecutionAborted,
    ToolResult {
        provider: String,
        call: CallRecord,
        result: Vec<String>,
    },
    UserInteraction {
        function: String,
        parameters: Value,
        result: Value,
    },
    Error { error_type: ErrorKind, message: String },
    FinalAnswer { result: String, summary: Option<String> },
}

impl StepPayload {
    pub fn error(error_type: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            error_type,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            StepPayload::Proposal(_) | StepPayload::Plan { .. } => StepKind::Proposal,
            StepPayload::Confirmation
            | StepPayload::DecisionRevision { .. }
            | StepPayload::ExecutionAborted => StepKind::Confirmation,
            StepPayload::ToolResult { .. } => StepKind::ToolResult,
            StepPayload::UserInteraction { .. } => StepKind::UserInteraction,
            StepPayload::Error { .. } => StepKind::Error,
            StepPayload::FinalAnswer { .. } => StepKind::FinalAnswer,
        }
    }

    /// The `step_type` tag this payload serializes under.
    pub fn step_type(&self) -> &'static str {
        match self {
            StepPayload::Proposal(_) => "proposal",
            StepPayload::Plan { .. } => "plan",
            StepPayload::Confirmation => "confirmation",
            StepPayload::DecisionRevision { .. } => "decision_revision",
            StepPayload::ExecutionAborted => "execution_aborted",
            StepPayload::ToolResult { .. } => "tool_result",
            StepPayload::UserInteraction { .. } => "user_interaction",
            StepPayload::Error { .. } => "error",
            StepPayload::FinalAnswer { .. } => "final_answer",
        }
    }

    /// One-line human-readable projection.
    pub fn render(&self) -> String {
        match self {
            StepPayload::Proposal(Proposal::FunctionCall(call)) => {
                let mut line = format!("Proposed {}({})", call.name, call.parameters);
                if let Some(reasoning) = &call.reasoning {
                    line.push_str(&format!(": {reasoning}"));
                }
                line
            }
            StepPayload::Proposal(Proposal::FinalAnswer { result, .. }) => {
                format!("Proposed final answer: {result}")
            }
            StepPayload::Proposal(Proposal::Plan { steps }) => {
                format!("Proposed plan with {} steps", steps.len())
            }
            StepPayload::Plan { steps } => {
                let outline = steps
                    .iter()
                    .map(|s| format!("{}. {}", s.step_number, s.description))
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("Plan accepted: {outline}")
            }
            StepPayload::Confirmation => "Confirmed".to_string(),
            StepPayload::DecisionRevision { feedback } => {
                format!("Revision requested: {feedback}")
            }
            StepPayload::ExecutionAborted => "Execution aborted by user".to_string(),
            StepPayload::ToolResult {
                provider,
                call,
                result,
            } => format!("{provider}/{} returned {}", call.name, result.join(", ")),
            StepPayload::UserInteraction {
                function, result, ..
            } => format!("User interaction {function}: {result}"),
            StepPayload::Error {
                error_type,
                message,
            } => format!("Error ({error_type}): {message}"),
            StepPayload::FinalAnswer { result, summary } => match summary {
                Some(summary) => format!("Final answer: {result} ({summary})"),
                None => format!("Final answer: {result}"),
            },
        }
    }
}

/// An entry in the execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: StepPayload,
}

impl ExecutionStep {
    pub fn kind(&self) -> StepKind {
        self.payload.kind()
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Aborted => "aborted",
            RunOutcome::Failed => "failed",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(RunOutcome::Completed),
            "aborted" => Ok(RunOutcome::Aborted),
            "failed" => Ok(RunOutcome::Failed),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}
