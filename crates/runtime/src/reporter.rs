//! Progress reporting out of the decision loop.

use std::sync::Arc;

use history::SessionId;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::{EventKind, SessionBroker, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decision,
    Confirmation,
    Execution,
    Interaction,
    Error,
    Completion,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Decision => "decision",
            Stage::Confirmation => "confirmation",
            Stage::Execution => "execution",
            Stage::Interaction => "interaction",
            Stage::Error => "error",
            Stage::Completion => "completion",
        }
    }
}

/// Receives human-readable progress messages.
pub trait Reporter: Send + Sync {
    fn report(&self, stage: Stage, message: &str);
}

/// Writes progress to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, stage: Stage, message: &str) {
        match stage {
            Stage::Error => warn!(stage = stage.as_str(), "{message}"),
            _ => info!(stage = stage.as_str(), "{message}"),
        }
    }
}

/// Publishes progress into a broker session.
pub struct SessionReporter {
    broker: Arc<SessionBroker>,
    session: SessionId,
}

impl SessionReporter {
    pub fn new(broker: Arc<SessionBroker>, session: SessionId) -> Self {
        Self { broker, session }
    }
}

impl Reporter for SessionReporter {
    fn report(&self, stage: Stage, message: &str) {
        let kind = match stage {
            Stage::Error => EventKind::Error,
            _ => EventKind::Update,
        };
        let event = SessionEvent::new(kind, message).with_data(json!({ "stage": stage.as_str() }));
        if let Err(err) = self.broker.publish_event(self.session, event) {
            debug!(session = %self.session, error = %err, "dropped progress event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn session_reporter_tags_stage() {
        let broker = Arc::new(SessionBroker::default());
        let id = broker.create_session();
        let reporter = SessionReporter::new(Arc::clone(&broker), id);
        reporter.report(Stage::Execution, "Executing calc/add");
        reporter.report(Stage::Error, "Unknown tool: pow");
        broker.close(id).unwrap();

        let events = broker
            .drain(id)
            .unwrap()
            .collect_events(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Update);
        assert_eq!(events[0].data.as_ref().unwrap()["stage"], "execution");
        assert_eq!(events[1].kind, EventKind::Error);
    }

    #[test]
    fn reporting_into_closed_session_is_harmless() {
        let broker = Arc::new(SessionBroker::default());
        let id = broker.create_session();
        broker.close(id).unwrap();
        SessionReporter::new(broker, id).report(Stage::Decision, "late");
    }
}
