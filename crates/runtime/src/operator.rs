//! The human side of the loop: confirming proposals and answering
//! interaction requests.

use std::future::Future;

use history::Proposal;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::Result;

/// Operator's answer to a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirm,
    /// Reject the proposal and ask for another, with guidance.
    Redo { feedback: String },
    Abort,
}

impl ConfirmationOutcome {
    pub fn redo(feedback: impl Into<String>) -> Self {
        Self::Redo {
            feedback: feedback.into(),
        }
    }
}

/// A `user_interaction` decision as the model phrased it.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionRequest {
    pub function: String,
    pub parameters: Value,
    pub reasoning_tag: Option<String>,
    pub reasoning: Option<String>,
    pub confidence: Option<String>,
}

impl InteractionRequest {
    fn param(&self, key: &str) -> Option<String> {
        self.parameters.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Interpret the request. Unrecognized names fall back to showing the
    /// parameters as information.
    pub fn interaction(&self) -> Interaction {
        match self.function.as_str() {
            "show_information" => Interaction::ShowInformation {
                title: self.param("title").unwrap_or_else(|| "Information".into()),
                message: self.param("message").unwrap_or_default(),
            },
            "get_confirmation" => Interaction::GetConfirmation {
                message: self.param("message").unwrap_or_default(),
                instructions: self.param("instructions"),
            },
            "report_error" => Interaction::ReportError {
                message: self.param("message").unwrap_or_default(),
                error_type: self.param("error_type"),
                details: self.param("details"),
            },
            "escalate" => Interaction::Escalate {
                question: self
                    .param("question")
                    .or_else(|| self.param("message"))
                    .unwrap_or_default(),
                context: self.param("context"),
            },
            other => {
                warn!(function = other, "unknown interaction; showing as information");
                Interaction::ShowInformation {
                    title: other.to_string(),
                    message: self.parameters.to_string(),
                }
            }
        }
    }
}

/// Built-in interaction kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    ShowInformation {
        title: String,
        message: String,
    },
    GetConfirmation {
        message: String,
        instructions: Option<String>,
    },
    ReportError {
        message: String,
        error_type: Option<String>,
        details: Option<String>,
    },
    Escalate {
        question: String,
        context: Option<String>,
    },
}

/// Catalog of interaction functions, for prompts.
pub const INTERACTION_CATALOG: &str = "\
1. show_information(title: string, message: string) - Display information to the user
2. get_confirmation(message: string, instructions: string) - Ask the user to confirm or reject something
3. report_error(message: string, error_type: string, details: string) - Tell the user about a problem
4. escalate(question: string, context: string) - Ask the user a question you cannot answer yourself";

/// Human-readable rendering of a proposal for a confirmation prompt.
pub fn describe_proposal(proposal: &Proposal) -> String {
    match proposal {
        Proposal::FunctionCall(call) => {
            let mut text = format!("Tool: {}\nParameters: {}", call.name, call.parameters);
            if let Some(tag) = &call.reasoning_tag {
                text.push_str(&format!("\nReasoning type: {tag}"));
            }
            if let Some(reasoning) = &call.reasoning {
                text.push_str(&format!("\nReasoning: {reasoning}"));
            }
            text
        }
        Proposal::Plan { steps } => {
            let mut text = String::from("Plan:");
            for step in steps {
                text.push_str(&format!("\n  {}. {}", step.step_number, step.description));
                if let Some(tool) = &step.expected_tool {
                    text.push_str(&format!(" [{tool}]"));
                }
            }
            text
        }
        Proposal::FinalAnswer { result, summary } => {
            let mut text = format!("Result: {result}");
            if let Some(summary) = summary {
                text.push_str(&format!("\nSummary: {summary}"));
            }
            text
        }
    }
}

/// Gate between the decision loop and anything with side effects.
pub trait Operator: Send + Sync {
    /// Accept, revise, or abort a proposal.
    fn confirm(&self, proposal: &Proposal) -> impl Future<Output = ConfirmationOutcome> + Send;

    /// Carry out an interaction and return its structured result.
    fn interact(&self, interaction: &Interaction) -> impl Future<Output = Result<Value>> + Send;
}

/// Operator for unattended runs: confirms everything and answers
/// interactions without a human.
#[derive(Debug, Clone, Default)]
pub struct AutoOperator;

impl Operator for AutoOperator {
    async fn confirm(&self, _proposal: &Proposal) -> ConfirmationOutcome {
        ConfirmationOutcome::Confirm
    }

    async fn interact(&self, interaction: &Interaction) -> Result<Value> {
        Ok(match interaction {
            Interaction::ShowInformation { title, message } => {
                info!(%title, %message, "information");
                json!({"status": "shown"})
            }
            Interaction::GetConfirmation { .. } => {
                json!({"choice": "confirm", "feedback": null})
            }
            Interaction::ReportError { message, .. } => {
                warn!(%message, "reported error");
                json!({"status": "error_reported"})
            }
            Interaction::Escalate { question, .. } => {
                warn!(%question, "escalation with no operator attached");
                json!({"status": "unanswered", "answer": null})
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use history::CallRecord;

    fn request(function: &str, parameters: Value) -> InteractionRequest {
        InteractionRequest {
            function: function.to_string(),
            parameters,
            reasoning_tag: None,
            reasoning: None,
            confidence: None,
        }
    }

    #[test]
    fn known_interactions_are_recognized() {
        let escalate = request("escalate", json!({"question": "Which base?", "context": "log"}));
        assert_eq!(
            escalate.interaction(),
            Interaction::Escalate {
                question: "Which base?".into(),
                context: Some("log".into()),
            }
        );

        let error = request("report_error", json!({"message": "bad input"}));
        assert!(matches!(
            error.interaction(),
            Interaction::ReportError { message, error_type: None, .. } if message == "bad input"
        ));
    }

    #[test]
    fn unknown_interaction_falls_back_to_information() {
        let unknown = request("dance", json!({"style": "waltz"}));
        assert_eq!(
            unknown.interaction(),
            Interaction::ShowInformation {
                title: "dance".into(),
                message: r#"{"style":"waltz"}"#.into(),
            }
        );
    }

    #[test]
    fn describe_function_call() {
        let proposal = Proposal::FunctionCall(CallRecord {
            name: "add".into(),
            parameters: json!({"a": 1, "b": 2}),
            reasoning_tag: Some("ARITHMETIC".into()),
            reasoning: None,
        });
        assert_eq!(
            describe_proposal(&proposal),
            "Tool: add\nParameters: {\"a\":1,\"b\":2}\nReasoning type: ARITHMETIC"
        );
    }

    #[tokio::test]
    async fn auto_operator_confirms_and_answers() {
        let operator = AutoOperator;
        let proposal = Proposal::FinalAnswer {
            result: "3".into(),
            summary: None,
        };
        assert_eq!(operator.confirm(&proposal).await, ConfirmationOutcome::Confirm);

        let result = operator
            .interact(&Interaction::GetConfirmation {
                message: "ok?".into(),
                instructions: None,
            })
            .await
            .unwrap();
        assert_eq!(result["choice"], "confirm");
    }
}
