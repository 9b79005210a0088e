//! Cross-thread command submission.
//!
//! Callers on any thread hand a command to a provider's event loop and get
//! back a [`ResultFuture`]. The event loop writes the outcome exactly once;
//! callers may wait for it either by blocking or by awaiting.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mcp::{CallToolResult, Connection};
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::CommandError;
use crate::supervisor::ProviderSupervisor;
use crate::{Error, Result};

type Outcome<T> = std::result::Result<T, CommandError>;

struct Slot<T> {
    value: Mutex<Option<Outcome<T>>>,
    ready: Condvar,
    notify: Notify,
}

/// Single-assignment result container shared between the event loop and a
/// caller.
///
/// The first [`set`](Self::set) wins. Any later write returns
/// [`Error::AlreadySet`] and leaves the stored value untouched. Readers see
/// either "not ready" or the final value, never an intermediate state.
pub struct ResultFuture<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for ResultFuture<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for ResultFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultFuture<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                value: Mutex::new(None),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Outcome<T>>> {
        self.slot.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the outcome and wake every waiter.
    pub fn set(&self, outcome: Outcome<T>) -> Result<()> {
        {
            let mut value = self.lock();
            if value.is_some() {
                return Err(Error::AlreadySet);
            }
            *value = Some(outcome);
        }
        self.slot.ready.notify_all();
        self.slot.notify.notify_waiters();
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.lock().is_some()
    }
}

impl<T: Clone> ResultFuture<T> {
    /// The outcome, if one has been written.
    pub fn try_get(&self) -> Option<Outcome<T>> {
        self.lock().clone()
    }

    /// Block the current thread until the outcome arrives or `timeout`
    /// elapses. Do not call from inside an async task.
    pub fn wait(&self, timeout: Duration) -> Result<T> {
        let guard = self.lock();
        let (guard, _) = self
            .slot
            .ready
            .wait_timeout_while(guard, timeout, |value| value.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(outcome) => outcome.clone().map_err(Error::from),
            None => Err(Error::Timeout(timeout)),
        }
    }

    /// Await the outcome for at most `timeout`.
    pub async fn wait_async(&self, timeout: Duration) -> Result<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.slot.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a `set` in between is not missed.
            notified.as_mut().enable();

            if let Some(outcome) = self.try_get() {
                return outcome.map_err(Error::from);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout(timeout));
            }
        }
    }
}

/// Routes commands to the supervisor that owns each provider.
pub struct CommandBridge {
    providers: HashMap<String, Arc<ProviderSupervisor>>,
}

impl CommandBridge {
    pub fn new(supervisors: impl IntoIterator<Item = Arc<ProviderSupervisor>>) -> Self {
        let providers = supervisors
            .into_iter()
            .map(|supervisor| (supervisor.name().to_string(), supervisor))
            .collect();
        Self { providers }
    }

    pub fn provider(&self, name: &str) -> Result<&Arc<ProviderSupervisor>> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))
    }

    /// Queue `command` on the named provider's event loop.
    pub fn submit<T, F>(&self, provider: &str, command: F) -> Result<ResultFuture<T>>
    where
        T: Clone + Send + 'static,
        F: for<'a> FnOnce(&'a mut Connection) -> crate::supervisor::CommandFuture<'a, T>
            + Send
            + 'static,
    {
        self.provider(provider)?.submit(command)
    }

    /// Invoke a tool on `provider` and wait for its result.
    pub async fn call_tool(
        &self,
        provider: &str,
        tool: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<CallToolResult> {
        let tool = tool.to_string();
        let future = self.submit::<CallToolResult, _>(provider, move |conn| {
            Box::pin(async move { conn.call_tool(&tool, arguments).await })
        })?;
        future.wait_async(timeout).await
    }
}
