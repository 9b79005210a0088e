//! Provider supervision.
//!
//! Each [`ProviderSupervisor`] owns one tool provider. It runs a private
//! single-threaded event loop on a dedicated OS thread; that loop is the only
//! place the provider's [`Connection`] is touched. Commands from other
//! threads arrive through a FIFO queue and execute one at a time, in
//! submission order.
//!
//! The loop spawns the provider, performs the handshake, and then serves
//! commands while probing liveness on a fixed interval. When the connection
//! is lost it fails everything still queued with
//! [`CommandError::ProviderUnavailable`], waits out the backoff, and starts
//! over. It only gives up when asked to stop.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use mcp::{Connection, ProviderConfig};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::ResultFuture;
use crate::error::CommandError;
use crate::registry::ToolDescriptor;
use crate::{Error, Result};

/// Future produced by a command while it borrows the connection.
pub type CommandFuture<'a, T> = Pin<Box<dyn Future<Output = mcp::Result<T>> + 'a>>;

/// Timing knobs for a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between liveness probes.
    pub probe_interval: Duration,
    /// Pause between a failure and the next spawn attempt.
    pub restart_backoff: Duration,
    /// Timeout for each request on the connection.
    pub request_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            restart_backoff: Duration::from_secs(5),
            request_timeout: mcp::DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Ready,
    Degraded,
    Stopped,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Starting => "starting",
            Lifecycle::Ready => "ready",
            Lifecycle::Degraded => "degraded",
            Lifecycle::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a provider's state, published on every transition.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub lifecycle: Lifecycle,
    /// Catalog from the most recent successful handshake.
    pub tools: Vec<ToolDescriptor>,
    /// Incremented on each transition to `Ready`.
    pub generation: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProviderStatus {
    fn initial() -> Self {
        Self {
            lifecycle: Lifecycle::Starting,
            tools: Vec::new(),
            generation: 0,
            last_health_check: None,
            last_error: None,
        }
    }
}

enum Disposition {
    Completed,
    ConnectionLost(mcp::Error),
}

trait Job: Send {
    fn run<'a>(
        self: Box<Self>,
        conn: &'a mut Connection,
    ) -> Pin<Box<dyn Future<Output = Disposition> + 'a>>;

    fn abandon(self: Box<Self>, error: CommandError);

    /// Name the provider the command was queued on.
    fn assign(&mut self, provider: &str);
}

struct Pending<T, F> {
    command: F,
    slot: Slot<T>,
}

/// Write side of a command's [`ResultFuture`]. Dropping it unwritten fails
/// the future, so a command discarded without running never leaves its
/// caller waiting.
struct Slot<T> {
    future: ResultFuture<T>,
    provider: String,
}

impl<T> Slot<T> {
    fn fulfil(&self, outcome: std::result::Result<T, CommandError>) {
        if let Err(err) = self.future.set(outcome) {
            warn!(provider = %self.provider, error = %err, "command result written twice");
        }
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if !self.future.is_ready() {
            let _ = self
                .future
                .set(Err(CommandError::ProviderUnavailable(self.provider.clone())));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<T, F> Job for Pending<T, F>
where
    T: Send + 'static,
    F: for<'a> FnOnce(&'a mut Connection) -> CommandFuture<'a, T> + Send + 'static,
{
    fn run<'a>(
        self: Box<Self>,
        conn: &'a mut Connection,
    ) -> Pin<Box<dyn Future<Output = Disposition> + 'a>> {
        let Pending { command, slot } = *self;
        let work = match panic::catch_unwind(AssertUnwindSafe(move || command(conn))) {
            Ok(work) => work,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(provider = %slot.provider, panic = %message, "command panicked");
                slot.fulfil(Err(CommandError::Failed(format!("command panicked: {message}"))));
                return Box::pin(async { Disposition::Completed });
            }
        };
        Box::pin(async move {
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(value)) => {
                    slot.fulfil(Ok(value));
                    Disposition::Completed
                }
                Ok(Err(err)) if err.is_connection_lost() => {
                    slot.fulfil(Err(CommandError::ProviderUnavailable(slot.provider.clone())));
                    Disposition::ConnectionLost(err)
                }
                Ok(Err(err)) => {
                    slot.fulfil(Err(CommandError::Failed(err.to_string())));
                    Disposition::Completed
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(provider = %slot.provider, panic = %message, "command panicked");
                    slot.fulfil(Err(CommandError::Failed(format!("command panicked: {message}"))));
                    Disposition::Completed
                }
            }
        })
    }

    fn abandon(self: Box<Self>, error: CommandError) {
        self.slot.fulfil(Err(error));
    }

    fn assign(&mut self, provider: &str) {
        self.slot.provider = provider.to_string();
    }
}

/// A unit of work bound for a provider's event loop.
pub struct Command {
    job: Box<dyn Job>,
}

impl Command {
    /// Wrap `command`, returning it with the future its outcome lands in.
    pub fn new<T, F>(command: F) -> (Self, ResultFuture<T>)
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Connection) -> CommandFuture<'a, T> + Send + 'static,
    {
        let future = ResultFuture::new();
        let job = Box::new(Pending {
            command,
            slot: Slot {
                future: future.clone(),
                provider: String::new(),
            },
        });
        (Self { job }, future)
    }
}

/// Owns one provider and keeps it running.
pub struct ProviderSupervisor {
    config: ProviderConfig,
    settings: SupervisorConfig,
    queue: mpsc::UnboundedSender<Command>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    status: Arc<watch::Sender<ProviderStatus>>,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProviderSupervisor {
    pub fn new(config: ProviderConfig, settings: SupervisorConfig) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ProviderStatus::initial());
        Self {
            config,
            settings,
            queue,
            inbox: Mutex::new(Some(inbox)),
            status: Arc::new(status),
            stop: CancellationToken::new(),
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Launch the event loop thread. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::ProviderUnavailable(self.config.name.clone()))?;

        let event_loop = EventLoop {
            config: self.config.clone(),
            settings: self.settings.clone(),
            inbox,
            status: Arc::clone(&self.status),
            stop: self.stop.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("provider-{}", self.config.name))
            .spawn(move || runtime.block_on(event_loop.run()))?;
        *thread = Some(handle);
        info!(provider = %self.config.name, command = %self.config.command, "supervisor started");
        Ok(())
    }

    pub fn status(&self) -> ProviderStatus {
        self.status.borrow().clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.status.borrow().lifecycle
    }

    /// Watch status transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProviderStatus> {
        self.status.subscribe()
    }

    /// Current catalog; empty unless the provider is `Ready`.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let status = self.status.borrow();
        match status.lifecycle {
            Lifecycle::Ready => status.tools.clone(),
            _ => Vec::new(),
        }
    }

    /// Wait until the provider reaches `Ready`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut status = self.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            status.wait_for(|s| matches!(s.lifecycle, Lifecycle::Ready | Lifecycle::Stopped)),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .map(|s| s.lifecycle)
        .map_err(|_| Error::ProviderUnavailable(self.config.name.clone()))?;

        match reached {
            Lifecycle::Ready => Ok(()),
            _ => Err(Error::ProviderUnavailable(self.config.name.clone())),
        }
    }

    /// Queue a prepared [`Command`].
    pub fn submit_command(&self, mut command: Command) -> Result<()> {
        command.job.assign(&self.config.name);
        if self.lifecycle() == Lifecycle::Stopped {
            return Err(Error::ProviderUnavailable(self.config.name.clone()));
        }
        self.queue
            .send(command)
            .map_err(|_| Error::ProviderUnavailable(self.config.name.clone()))
    }

    /// Queue `command` and return the future its outcome lands in.
    ///
    /// Commands queued before the provider is ready wait for it; callers
    /// bound that wait with the timeout they pass to the future.
    pub fn submit<T, F>(&self, command: F) -> Result<ResultFuture<T>>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Connection) -> CommandFuture<'a, T> + Send + 'static,
    {
        let (command, future) = Command::new(command);
        self.submit_command(command)?;
        Ok(future)
    }

    /// Signal the event loop to stop and wait for it to reach `Stopped`.
    pub async fn stop(&self) {
        self.stop.cancel();
        let running = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if running {
            let mut status = self.subscribe();
            let _ = status
                .wait_for(|s| s.lifecycle == Lifecycle::Stopped)
                .await;
        } else {
            self.status.send_modify(|s| s.lifecycle = Lifecycle::Stopped);
        }
    }
}

impl Drop for ProviderSupervisor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

enum Exit {
    Stopped,
    Lost(mcp::Error),
}

enum Event {
    Stop,
    Command(Command),
    Probe,
}

struct EventLoop {
    config: ProviderConfig,
    settings: SupervisorConfig,
    inbox: mpsc::UnboundedReceiver<Command>,
    status: Arc<watch::Sender<ProviderStatus>>,
    stop: CancellationToken,
}

impl EventLoop {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        while !self.stop.is_cancelled() {
            attempt += 1;
            self.status.send_modify(|s| s.lifecycle = Lifecycle::Starting);

            let error = match self.connect().await {
                Ok(conn) => {
                    attempt = 0;
                    match self.serve(conn).await {
                        Exit::Stopped => break,
                        Exit::Lost(err) => {
                            warn!(provider = %self.config.name, error = %err, "connection lost; restarting");
                            self.fail_queued();
                            err.to_string()
                        }
                    }
                }
                Err(err) => {
                    warn!(provider = %self.config.name, attempt, error = %err, "provider failed to start; retrying");
                    err.to_string()
                }
            };

            self.status.send_modify(|s| {
                s.lifecycle = Lifecycle::Degraded;
                s.last_error = Some(error);
            });

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.settings.restart_backoff) => {}
            }
        }

        self.status.send_modify(|s| s.lifecycle = Lifecycle::Stopped);
        self.fail_queued();
        info!(provider = %self.config.name, "supervisor stopped");
    }

    async fn connect(&self) -> mcp::Result<Connection> {
        let mut conn = Connection::spawn(self.config.clone())
            .await?
            .with_timeout(self.settings.request_timeout);
        let tools = conn.handshake().await?;
        let descriptors: Vec<ToolDescriptor> = tools
            .into_iter()
            .map(|tool| ToolDescriptor::from_tool(&self.config.name, tool))
            .collect();

        info!(provider = %self.config.name, tools = descriptors.len(), "provider ready");
        self.status.send_modify(|s| {
            s.lifecycle = Lifecycle::Ready;
            s.tools = descriptors;
            s.generation += 1;
            s.last_health_check = Some(Utc::now());
            s.last_error = None;
        });
        Ok(conn)
    }

    async fn serve(&mut self, mut conn: Connection) -> Exit {
        let mut probe = tokio::time::interval(self.settings.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        probe.tick().await;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Event::Stop,
                command = self.inbox.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Stop,
                },
                _ = probe.tick() => Event::Probe,
            };

            match event {
                Event::Stop => {
                    if let Err(err) = conn.shutdown().await {
                        debug!(provider = %self.config.name, error = %err, "error stopping provider");
                    }
                    return Exit::Stopped;
                }
                Event::Command(command) => {
                    if let Disposition::ConnectionLost(err) = command.job.run(&mut conn).await {
                        return Exit::Lost(err);
                    }
                }
                Event::Probe => match conn.ping().await {
                    Ok(()) => self
                        .status
                        .send_modify(|s| s.last_health_check = Some(Utc::now())),
                    Err(err) => return Exit::Lost(err),
                },
            }
        }
    }

    /// Fail every command still waiting in the queue.
    fn fail_queued(&mut self) {
        let mut failed = 0;
        while let Ok(command) = self.inbox.try_recv() {
            command
                .job
                .abandon(CommandError::ProviderUnavailable(self.config.name.clone()));
            failed += 1;
        }
        if failed > 0 {
            debug!(provider = %self.config.name, failed, "failed queued commands");
        }
    }
}
