//! Execution history for harbor sessions.
//!
//! Every request handled by the runtime gets an [`ExecutionHistory`]: an
//! append-only, strictly numbered log of what the decision loop proposed,
//! what the user confirmed or rejected, what tools returned, and how the run
//! ended. The history is replayed into every subsequent prompt.
//!
//! # Core Concepts
//!
//! ## ExecutionStep
//!
//! An [`ExecutionStep`] carries a step number, a timestamp, and a
//! [`StepPayload`]. Payloads serialize with a `step_type` tag
//! (`proposal`, `confirmation`, `decision_revision`, `tool_result`, ...) and
//! map onto a coarse [`StepKind`].
//!
//! ## StepStore
//!
//! A [`StepStore`] is an optional SQLite audit log. When attached to a
//! history, each step is written through as it is appended, so past runs can
//! be listed and inspected after the process exits.
//!
//! # Example
//!
//! ```no_run
//! use history::{ExecutionHistory, RunOutcome, SessionId, StepPayload, StepStore};
//!
//! let store = StepStore::open("runs.db")?;
//! let mut history = ExecutionHistory::new(SessionId::new(), "add 1 and 2").with_store(store)?;
//!
//! history.append(StepPayload::FinalAnswer {
//!     result: "3".into(),
//!     summary: None,
//! })?;
//! history.finish(RunOutcome::Completed)?;
//!
//! println!("{}", history.replay());
//! # Ok::<(), history::Error>(())
//! ```

mod error;
mod history;
mod step;
mod store;

pub use error::{Error, Result};
pub use history::ExecutionHistory;
pub use step::{
    CallRecord, ErrorKind, ExecutionStep, PlanStep, Proposal, RunOutcome, SessionId, StepKind,
    StepPayload,
};
pub use store::{RunSummary, StepStore};
