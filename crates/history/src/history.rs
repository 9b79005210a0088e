//! Append-only execution history for one session.

use chrono::Utc;

use crate::step::{CallRecord, ExecutionStep, PlanStep, RunOutcome, SessionId, StepPayload};
use crate::store::StepStore;
use crate::Result;

/// Ordered log of everything the decision loop did for one request.
///
/// Step numbers start at 1 and increase by exactly one per appended step.
/// Steps are never modified once appended. When a [`StepStore`] is attached,
/// every step is mirrored to it before `append` returns.
pub struct ExecutionHistory {
    session_id: SessionId,
    query: String,
    steps: Vec<ExecutionStep>,
    store: Option<StepStore>,
}

impl ExecutionHistory {
    pub fn new(session_id: SessionId, query: impl Into<String>) -> Self {
        Self {
            session_id,
            query: query.into(),
            steps: Vec::new(),
            store: None,
        }
    }

    /// Mirror steps into `store`, registering the run first.
    pub fn with_store(mut self, store: StepStore) -> Result<Self> {
        store.begin_run(self.session_id, &self.query)?;
        self.store = Some(store);
        Ok(self)
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Append a step, assigning the next step number.
    pub fn append(&mut self, payload: StepPayload) -> Result<&ExecutionStep> {
        let step = ExecutionStep {
            step_number: self.steps.len() as u64 + 1,
            timestamp: Utc::now(),
            payload,
        };
        if let Some(store) = &self.store {
            store.append(self.session_id, &step)?;
        }
        self.steps.push(step);
        Ok(&self.steps[self.steps.len() - 1])
    }

    /// Record how the run ended in the attached store, if any.
    pub fn finish(&self, outcome: RunOutcome) -> Result<()> {
        match &self.store {
            Some(store) => store.finish_run(self.session_id, outcome),
            None => Ok(()),
        }
    }

    pub fn steps(&self) -> &[ExecutionStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&ExecutionStep> {
        self.steps.last()
    }

    /// The most recently accepted plan.
    pub fn plan(&self) -> Option<&[PlanStep]> {
        self.steps.iter().rev().find_map(|step| match &step.payload {
            StepPayload::Plan { steps } => Some(steps.as_slice()),
            _ => None,
        })
    }

    /// The most recently executed tool call.
    pub fn last_executed_call(&self) -> Option<&CallRecord> {
        self.steps.iter().rev().find_map(|step| match &step.payload {
            StepPayload::ToolResult { call, .. } => Some(call),
            _ => None,
        })
    }

    /// Text replay of all steps, one per line, for inclusion in prompts.
    pub fn replay(&self) -> String {
        if self.steps.is_empty() {
            return "(no steps yet)".to_string();
        }
        self.steps
            .iter()
            .map(|step| {
                format!(
                    "#{} [{}] {}",
                    step.step_number,
                    step.payload.step_type(),
                    step.payload.render()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
