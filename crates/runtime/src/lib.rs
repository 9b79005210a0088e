//! Harbor runtime: supervised tool providers and the decision loop that
//! drives them.
//!
//! # Overview
//!
//! - **ProviderSupervisor**: owns one provider process on a private event
//!   loop thread, restarting it whenever the connection is lost.
//! - **CommandBridge** / **ResultFuture**: hand commands to a provider's
//!   event loop from any thread and collect the single result.
//! - **ToolRegistry**: the process-wide tool catalog, kept in step with
//!   each supervisor's discovered tools.
//! - **SessionBroker**: per-session event queues for progress reporting.
//! - **DecisionLoop**: asks a [`Generator`] for the next step, gets the
//!   [`Operator`]'s confirmation, and executes it through a [`ToolHost`].
//! - **Orchestrator**: wires all of the above together.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use mcp::ProviderConfig;
//! use runtime::{AnthropicBackend, AutoOperator, Orchestrator, OrchestratorConfig, Request};
//!
//! # async fn example() -> runtime::Result<()> {
//! let backend = AnthropicBackend::builder("sk-ant-api01-...", runtime::DEFAULT_MODEL).build();
//! let providers = vec![ProviderConfig::new("calc", "calc-provider")];
//! let orchestrator =
//!     Orchestrator::new(providers, backend, AutoOperator, OrchestratorConfig::default())?;
//! orchestrator.start()?;
//! orchestrator.wait_until_ready(Duration::from_secs(10)).await?;
//!
//! let session = orchestrator.submit(Request::new("Add 1 and 2"))?;
//! let mut events = orchestrator.broker().drain(session)?;
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.content);
//! }
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod backend;
mod bridge;
mod broker;
pub mod decision;
mod decision_loop;
mod error;
mod operator;
mod orchestrator;
mod prompt;
mod registry;
mod reporter;
mod supervisor;
mod tools;

pub use backend::{AnthropicBackend, AnthropicBackendBuilder, DEFAULT_MODEL, Generator};
pub use bridge::{CommandBridge, ResultFuture};
pub use broker::{DEFAULT_RETENTION, EventKind, EventStream, SessionBroker, SessionEvent};
pub use decision::{Decision, ParseError};
pub use decision_loop::{DecisionLoop, LoopConfig, LoopState, Outcome, SessionContext};
pub use error::{CommandError, Error, Result};
pub use operator::{
    AutoOperator, ConfirmationOutcome, INTERACTION_CATALOG, Interaction, InteractionRequest,
    Operator, describe_proposal,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, ProviderSummary, Request};
pub use prompt::Prompt;
pub use registry::{RegistrationConflict, ToolDescriptor, ToolRegistry};
pub use reporter::{Reporter, SessionReporter, Stage, TracingReporter};
pub use supervisor::{
    Command, CommandFuture, Lifecycle, ProviderStatus, ProviderSupervisor, SupervisorConfig,
};
pub use tools::{ProviderToolHost, ToolHost, ToolOutput};
