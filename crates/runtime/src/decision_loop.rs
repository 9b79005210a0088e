//! The decide / confirm / execute cycle for one session.
//!
//! Each iteration asks the generator for a decision, validates it, puts it
//! in front of the operator, and acts on the answer:
//!
//! ```text
//! AwaitingDecision ──► AwaitingConfirmation ──► Executing ──► AwaitingDecision
//!        ▲                    │  │
//!        └── Reiterating ◄────┘  └──► Aborted
//! ```
//!
//! Every transition appends to the session's [`ExecutionHistory`] and is
//! reported through the [`Reporter`]. Unknown tool names are recorded and
//! the loop asks again. Other recoverable failures (unparseable output,
//! repeated calls, generation errors) are recorded and retried up to a
//! bound; a failed tool execution ends the session.

use std::time::Duration;

use history::{CallRecord, ErrorKind, ExecutionHistory, PlanStep, Proposal, StepPayload};
use tracing::{debug, warn};

use crate::backend::Generator;
use crate::decision::{self, Decision};
use crate::operator::{ConfirmationOutcome, InteractionRequest, Operator};
use crate::prompt::Prompt;
use crate::registry::ToolDescriptor;
use crate::reporter::{Reporter, Stage};
use crate::tools::ToolHost;
use crate::{Error, Result};

/// Bounds and switches for the loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub generation_timeout: Duration,
    /// Consecutive failed decision attempts tolerated before giving up.
    pub max_decision_retries: u32,
    /// Hard cap on history length.
    pub max_steps: usize,
    /// Reject a call identical to the one executed just before it.
    pub reject_repeated_calls: bool,
    /// Ask for a plan before the first tool call.
    pub require_plan: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(20),
            max_decision_retries: 3,
            max_steps: 50,
            reject_repeated_calls: true,
            require_plan: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingDecision,
    AwaitingConfirmation,
    Executing,
    Reiterating,
    Aborted,
    Finished,
}

/// How a session ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed {
        result: String,
        summary: Option<String>,
    },
    Aborted,
}

/// Mutable state of one session.
pub struct SessionContext {
    pub facts: Vec<String>,
    pub history: ExecutionHistory,
    feedback: Option<String>,
    state: LoopState,
    failed_attempts: u32,
}

impl SessionContext {
    pub fn new(history: ExecutionHistory) -> Self {
        Self {
            facts: Vec::new(),
            history,
            feedback: None,
            state: LoopState::AwaitingDecision,
            failed_attempts: 0,
        }
    }

    pub fn with_facts(mut self, facts: Vec<String>) -> Self {
        self.facts = facts;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Feedback from the last rejected proposal, not yet acted on.
    pub fn feedback(&self) -> Option<&str> {
        self.feedback.as_deref()
    }
}

enum Gate {
    Proceed,
    Reiterate,
    Abort,
}

/// Drives one session to completion.
pub struct DecisionLoop<'a, G, H, O> {
    generator: &'a G,
    tools: &'a H,
    operator: &'a O,
    reporter: &'a dyn Reporter,
    config: &'a LoopConfig,
}

impl<'a, G, H, O> DecisionLoop<'a, G, H, O>
where
    G: Generator,
    H: ToolHost,
    O: Operator,
{
    pub fn new(
        generator: &'a G,
        tools: &'a H,
        operator: &'a O,
        reporter: &'a dyn Reporter,
        config: &'a LoopConfig,
    ) -> Self {
        Self {
            generator,
            tools,
            operator,
            reporter,
            config,
        }
    }

    pub async fn run(&self, ctx: &mut SessionContext) -> Result<Outcome> {
        loop {
            if ctx.history.len() >= self.config.max_steps {
                let limit = self.config.max_steps;
                self.record(
                    ctx,
                    StepPayload::error(ErrorKind::StepLimit, format!("step limit of {limit} reached")),
                    Stage::Error,
                )?;
                return Err(Error::StepLimit(limit));
            }

            ctx.state = LoopState::AwaitingDecision;
            let Some(decision) = self.next_decision(ctx).await? else {
                continue;
            };
            debug!(session = %ctx.history.session_id(), kind = decision.kind(), "decision");

            match decision {
                Decision::UserInteraction(request) => self.interact(ctx, request).await?,
                Decision::FunctionCall(call) => {
                    let Some(tool) = self.validate_call(ctx, &call)? else {
                        continue;
                    };
                    match self.gate(ctx, Proposal::FunctionCall(call.clone())).await? {
                        Gate::Proceed => self.execute(ctx, &tool, call).await?,
                        Gate::Reiterate => {}
                        Gate::Abort => return Ok(Outcome::Aborted),
                    }
                }
                Decision::Plan(steps) => {
                    match self.gate(ctx, Proposal::Plan { steps: steps.clone() }).await? {
                        Gate::Proceed => self.accept_plan(ctx, steps)?,
                        Gate::Reiterate => {}
                        Gate::Abort => return Ok(Outcome::Aborted),
                    }
                }
                Decision::FinalAnswer { result, summary } => {
                    let proposal = Proposal::FinalAnswer {
                        result: result.clone(),
                        summary: summary.clone(),
                    };
                    match self.gate(ctx, proposal).await? {
                        Gate::Proceed => {
                            self.record(
                                ctx,
                                StepPayload::FinalAnswer {
                                    result: result.clone(),
                                    summary: summary.clone(),
                                },
                                Stage::Completion,
                            )?;
                            ctx.state = LoopState::Finished;
                            return Ok(Outcome::Completed { result, summary });
                        }
                        Gate::Reiterate => {}
                        Gate::Abort => return Ok(Outcome::Aborted),
                    }
                }
            }
        }
    }

    /// Ask the generator for a decision. `None` means the attempt failed and
    /// was recorded.
    async fn next_decision(&self, ctx: &mut SessionContext) -> Result<Option<Decision>> {
        let prompt = Prompt {
            query: ctx.history.query(),
            facts: &ctx.facts,
            history: &ctx.history,
            catalog: &self.tools.describe_all(),
            feedback: ctx.feedback.as_deref(),
            require_plan: self.config.require_plan,
        }
        .render();

        self.reporter.report(Stage::Decision, "Determining next step");
        let timeout = self.config.generation_timeout;
        let text = match tokio::time::timeout(timeout, self.generator.generate(&prompt)).await {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                self.reject(ctx, ErrorKind::GenerationFailed, err.to_string())?;
                return Ok(None);
            }
            Err(_) => {
                self.reject(
                    ctx,
                    ErrorKind::GenerationFailed,
                    format!("no response within {timeout:?}"),
                )?;
                return Ok(None);
            }
        };

        match decision::parse(&text) {
            Ok(decision) => {
                ctx.feedback = None;
                Ok(Some(decision))
            }
            Err(err) => {
                warn!(session = %ctx.history.session_id(), error = %err, "unparseable decision");
                self.reject(ctx, ErrorKind::ParseError, err.to_string())?;
                Ok(None)
            }
        }
    }

    /// Check a proposed call before it reaches the operator.
    fn validate_call(
        &self,
        ctx: &mut SessionContext,
        call: &CallRecord,
    ) -> Result<Option<ToolDescriptor>> {
        let tool = match self.tools.resolve(&call.name) {
            Ok(tool) => tool,
            Err(_) => {
                // Not counted against the retry bound; `max_steps` caps it.
                self.record(
                    ctx,
                    StepPayload::error(ErrorKind::ToolNotFound, format!("Unknown tool: {}", call.name)),
                    Stage::Error,
                )?;
                return Ok(None);
            }
        };
        let repeated = self.config.reject_repeated_calls
            && ctx
                .history
                .last_executed_call()
                .is_some_and(|previous| previous.same_call(call));
        if repeated {
            self.reject(
                ctx,
                ErrorKind::RepeatedCall,
                format!("{}({}) was just executed; choose a different step", call.name, call.parameters),
            )?;
            return Ok(None);
        }
        Ok(Some(tool))
    }

    async fn gate(&self, ctx: &mut SessionContext, proposal: Proposal) -> Result<Gate> {
        ctx.state = LoopState::AwaitingConfirmation;
        self.record(ctx, StepPayload::Proposal(proposal.clone()), Stage::Confirmation)?;

        match self.operator.confirm(&proposal).await {
            ConfirmationOutcome::Confirm => {
                ctx.failed_attempts = 0;
                self.record(ctx, StepPayload::Confirmation, Stage::Confirmation)?;
                Ok(Gate::Proceed)
            }
            ConfirmationOutcome::Redo { feedback } => {
                ctx.state = LoopState::Reiterating;
                self.record(
                    ctx,
                    StepPayload::DecisionRevision {
                        feedback: feedback.clone(),
                    },
                    Stage::Confirmation,
                )?;
                ctx.feedback = Some(feedback);
                Ok(Gate::Reiterate)
            }
            ConfirmationOutcome::Abort => {
                ctx.state = LoopState::Aborted;
                self.record(ctx, StepPayload::ExecutionAborted, Stage::Completion)?;
                Ok(Gate::Abort)
            }
        }
    }

    fn accept_plan(&self, ctx: &mut SessionContext, steps: Vec<PlanStep>) -> Result<()> {
        self.record(ctx, StepPayload::Plan { steps }, Stage::Decision)
    }

    async fn execute(
        &self,
        ctx: &mut SessionContext,
        tool: &ToolDescriptor,
        call: CallRecord,
    ) -> Result<()> {
        ctx.state = LoopState::Executing;
        self.reporter.report(
            Stage::Execution,
            &format!("Executing {}/{}", tool.provider, call.name),
        );

        match self.tools.execute(tool, &call).await {
            Ok(output) => self.record(
                ctx,
                StepPayload::ToolResult {
                    provider: output.provider,
                    call,
                    result: output.texts,
                },
                Stage::Execution,
            ),
            Err(err) => {
                let message = format!("{} failed: {err}", call.name);
                self.record(
                    ctx,
                    StepPayload::error(ErrorKind::ToolExecution, message.clone()),
                    Stage::Error,
                )?;
                ctx.state = LoopState::Finished;
                Err(Error::ToolExecution(message))
            }
        }
    }

    async fn interact(&self, ctx: &mut SessionContext, request: InteractionRequest) -> Result<()> {
        let interaction = request.interaction();
        self.reporter.report(
            Stage::Interaction,
            &format!("Interaction requested: {}", request.function),
        );

        match self.operator.interact(&interaction).await {
            Ok(result) => {
                ctx.failed_attempts = 0;
                self.record(
                    ctx,
                    StepPayload::UserInteraction {
                        function: request.function,
                        parameters: request.parameters,
                        result,
                    },
                    Stage::Interaction,
                )
            }
            Err(err) => self.reject(ctx, ErrorKind::InteractionFailed, err.to_string()),
        }
    }

    /// Record a recoverable failure and enforce the retry bound.
    fn reject(&self, ctx: &mut SessionContext, kind: ErrorKind, message: String) -> Result<()> {
        self.record(ctx, StepPayload::error(kind, message.clone()), Stage::Error)?;
        ctx.failed_attempts += 1;
        if ctx.failed_attempts > self.config.max_decision_retries {
            ctx.state = LoopState::Finished;
            return Err(Error::RetriesExhausted {
                attempts: ctx.failed_attempts,
                last: message,
            });
        }
        Ok(())
    }

    fn record(&self, ctx: &mut SessionContext, payload: StepPayload, stage: Stage) -> Result<()> {
        let step = ctx.history.append(payload)?;
        debug!(step = step.step_number, step_type = step.payload.step_type(), "recorded step");
        self.reporter.report(stage, &step.payload.render());
        Ok(())
    }
}
