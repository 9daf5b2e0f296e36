use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::api::RenewalError;

/// Buffered events per subscriber before old ones are dropped
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Session lifecycle notifications for the navigation layer.
///
/// One-way: nothing waits for a subscriber to act on these.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    LoggedIn { at: DateTime<Utc> },
    Renewed { at: DateTime<Utc> },
    /// Renewal failed and credentials were cleared. The user has to log in again.
    Terminated {
        reason: RenewalError,
        at: DateTime<Utc>,
    },
    LoggedOut { at: DateTime<Utc> },
}

impl SessionEvent {
    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionEvent::Terminated { .. })
    }
}

#[derive(Debug)]
pub(crate) struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            debug!("Session event dropped, no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let events = SessionEvents::new();
        let mut first = events.subscribe();
        let mut second = events.subscribe();

        events.emit(SessionEvent::Terminated {
            reason: RenewalError::MissingRefreshToken,
            at: Utc::now(),
        });

        assert!(first.recv().await.expect("first subscriber").is_terminated());
        assert!(second.recv().await.expect("second subscriber").is_terminated());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let events = SessionEvents::new();
        events.emit(SessionEvent::LoggedOut { at: Utc::now() });
    }
}
