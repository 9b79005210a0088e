//! Process-level wiring: supervisors, registry, broker, and one decision
//! loop task per submitted request.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use history::{ExecutionHistory, RunOutcome, SessionId, StepStore};
use mcp::ProviderConfig;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::Generator;
use crate::bridge::CommandBridge;
use crate::broker::{DEFAULT_RETENTION, EventKind, SessionBroker, SessionEvent};
use crate::decision_loop::{DecisionLoop, LoopConfig, Outcome, SessionContext};
use crate::operator::Operator;
use crate::registry::ToolRegistry;
use crate::reporter::SessionReporter;
use crate::supervisor::{Lifecycle, ProviderSupervisor, SupervisorConfig};
use crate::tools::ProviderToolHost;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub supervisor: SupervisorConfig,
    pub decision: LoopConfig,
    /// Upper bound on a single tool call, including time spent queued.
    pub tool_timeout: Duration,
    pub session_retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            decision: LoopConfig::default(),
            tool_timeout: Duration::from_secs(30),
            session_retention: DEFAULT_RETENTION,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// A query to run.
pub struct Request {
    pub query: String,
    pub facts: Vec<String>,
    pub store: Option<StepStore>,
}

impl Request {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            facts: Vec::new(),
            store: None,
        }
    }

    pub fn fact(mut self, fact: impl Into<String>) -> Self {
        self.facts.push(fact.into());
        self
    }

    /// Persist the session's steps.
    pub fn store(mut self, store: StepStore) -> Self {
        self.store = Some(store);
        self
    }
}

/// One provider's state, for status displays.
#[derive(Debug, Clone)]
pub struct ProviderSummary {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub tools: usize,
    pub last_error: Option<String>,
}

pub struct Orchestrator<G, O> {
    supervisors: Vec<Arc<ProviderSupervisor>>,
    registry: Arc<ToolRegistry>,
    bridge: Arc<CommandBridge>,
    broker: Arc<SessionBroker>,
    host: Arc<ProviderToolHost>,
    generator: Arc<G>,
    operator: Arc<O>,
    config: OrchestratorConfig,
    background: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl<G, O> Orchestrator<G, O>
where
    G: Generator + 'static,
    O: Operator + 'static,
{
    pub fn new(
        providers: Vec<ProviderConfig>,
        generator: G,
        operator: O,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let mut names = HashSet::new();
        for provider in &providers {
            if !names.insert(provider.name.clone()) {
                return Err(Error::Config(format!("duplicate provider name: {}", provider.name)));
            }
        }

        let supervisors: Vec<Arc<ProviderSupervisor>> = providers
            .into_iter()
            .map(|provider| Arc::new(ProviderSupervisor::new(provider, config.supervisor.clone())))
            .collect();
        let registry = Arc::new(ToolRegistry::new());
        let bridge = Arc::new(CommandBridge::new(supervisors.iter().cloned()));
        let host = Arc::new(ProviderToolHost::new(
            Arc::clone(&registry),
            Arc::clone(&bridge),
            config.tool_timeout,
        ));

        Ok(Self {
            supervisors,
            registry,
            bridge,
            broker: Arc::new(SessionBroker::new(config.session_retention)),
            host,
            generator: Arc::new(generator),
            operator: Arc::new(operator),
            config,
            background: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Start every supervisor, the registry watchers, and the session
    /// sweeper. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        if !background.is_empty() {
            return Ok(());
        }
        for supervisor in &self.supervisors {
            background.push(self.registry.attach(supervisor));
            supervisor.start()?;
        }
        background.push(
            self.broker
                .spawn_sweeper(self.config.sweep_interval, self.cancel.clone()),
        );
        info!(providers = self.supervisors.len(), "orchestrator started");
        Ok(())
    }

    /// Wait until every provider is ready.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        for supervisor in &self.supervisors {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            supervisor.wait_until_ready(remaining).await?;
        }
        // Registration happens on the watcher tasks; give them a turn.
        while self.registry.len() < self.expected_tools() {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    fn expected_tools(&self) -> usize {
        let conflicts = self.registry.conflicts();
        self.supervisors
            .iter()
            .filter(|s| !conflicts.iter().any(|c| c.rejected == s.name()))
            .map(|s| {
                let tools = s.list_tools();
                tools.iter().map(|tool| &tool.name).collect::<HashSet<_>>().len()
            })
            .sum()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<SessionBroker> {
        &self.broker
    }

    pub fn bridge(&self) -> &Arc<CommandBridge> {
        &self.bridge
    }

    pub fn status(&self) -> Vec<ProviderSummary> {
        self.supervisors
            .iter()
            .map(|supervisor| {
                let status = supervisor.status();
                ProviderSummary {
                    name: supervisor.name().to_string(),
                    lifecycle: status.lifecycle,
                    tools: status.tools.len(),
                    last_error: status.last_error,
                }
            })
            .collect()
    }

    /// Start a session for `request` and return its id immediately.
    ///
    /// Progress is published to the broker; the session ends with exactly
    /// one `final` or `error` event followed by the end-of-stream marker.
    pub fn submit(&self, request: Request) -> Result<SessionId> {
        let session = self.broker.create_session();
        let mut history = ExecutionHistory::new(session, &request.query);
        if let Some(store) = request.store {
            history = history.with_store(store)?;
        }
        self.broker.publish(
            session,
            EventKind::Update,
            format!("Processing query: {}", request.query),
        )?;
        let mut ctx = SessionContext::new(history).with_facts(request.facts);

        let generator = Arc::clone(&self.generator);
        let operator = Arc::clone(&self.operator);
        let host = Arc::clone(&self.host);
        let broker = Arc::clone(&self.broker);
        let config = self.config.decision.clone();

        tokio::spawn(async move {
            let reporter = SessionReporter::new(Arc::clone(&broker), session);
            let outcome = DecisionLoop::new(&*generator, &*host, &*operator, &reporter, &config)
                .run(&mut ctx)
                .await;
            finish(&broker, session, &ctx.history, outcome);
        });

        info!(session = %session, "session submitted");
        Ok(session)
    }

    /// Stop background tasks and every provider.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for supervisor in &self.supervisors {
            supervisor.stop().await;
        }
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("orchestrator stopped");
    }
}

fn finish(
    broker: &SessionBroker,
    session: SessionId,
    history: &ExecutionHistory,
    outcome: Result<Outcome>,
) {
    let (run_outcome, event) = match outcome {
        Ok(Outcome::Completed { result, summary }) => (
            RunOutcome::Completed,
            SessionEvent::new(EventKind::Final, result).with_data(json!({ "summary": summary })),
        ),
        Ok(Outcome::Aborted) => (
            RunOutcome::Aborted,
            SessionEvent::new(EventKind::Final, "Execution aborted by user")
                .with_data(json!({ "aborted": true })),
        ),
        Err(err) => {
            warn!(session = %session, error = %err, "session failed");
            (RunOutcome::Failed, SessionEvent::new(EventKind::Error, err.to_string()))
        }
    };

    if let Err(err) = history.finish(run_outcome) {
        error!(session = %session, error = %err, "failed to record run outcome");
    }
    if let Err(err) = broker.publish_event(session, event) {
        warn!(session = %session, error = %err, "could not publish final event");
    }
    if let Err(err) = broker.close(session) {
        warn!(session = %session, error = %err, "could not close session");
    }
    info!(session = %session, outcome = run_outcome.as_str(), "session finished");
}
