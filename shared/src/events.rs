//! Interface to the game-state / UI layer.
//!
//! The protocol never touches game objects directly. Once an application event
//! has been accepted (acknowledged and de-duplicated) it is handed to a
//! [`SessionEvents`] implementation. Callbacks run on protocol tasks and must
//! not block.

use log::info;
use std::sync::Mutex;

pub trait SessionEvents: Send + Sync + 'static {
    /// A participant now exists in the shared level.
    fn on_join(&self, identity: &str);

    fn on_leave(&self, identity: &str);

    fn on_chat(&self, identity: &str, message: &str);

    /// The session is over. No further callbacks follow.
    fn on_session_end(&self);

    /// Human-readable status line for the local player, e.g.
    /// "failed to reach server".
    fn on_notice(&self, notice: &str) {
        info!("{}", notice);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Joined(String),
    Left(String),
    Chat { identity: String, message: String },
    SessionEnded,
    Notice(String),
}

/// Records every callback in arrival order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<SessionEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.lock().clone()
    }

    pub fn contains(&self, event: &SessionEvent) -> bool {
        self.lock().contains(event)
    }

    pub fn count(&self, event: &SessionEvent) -> usize {
        self.lock().iter().filter(|e| *e == event).count()
    }

    fn push(&self, event: SessionEvent) {
        self.lock().push(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SessionEvent>> {
        // A panicking test thread must not hide the events recorded so far.
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SessionEvents for EventLog {
    fn on_join(&self, identity: &str) {
        self.push(SessionEvent::Joined(identity.to_string()));
    }

    fn on_leave(&self, identity: &str) {
        self.push(SessionEvent::Left(identity.to_string()));
    }

    fn on_chat(&self, identity: &str, message: &str) {
        self.push(SessionEvent::Chat {
            identity: identity.to_string(),
            message: message.to_string(),
        });
    }

    fn on_session_end(&self) {
        self.push(SessionEvent::SessionEnded);
    }

    fn on_notice(&self, notice: &str) {
        self.push(SessionEvent::Notice(notice.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_records_in_order() {
        let log = EventLog::new();
        log.on_join("alice");
        log.on_chat("alice", "hi");
        log.on_leave("alice");
        log.on_session_end();

        assert_eq!(
            log.events(),
            vec![
                SessionEvent::Joined("alice".to_string()),
                SessionEvent::Chat {
                    identity: "alice".to_string(),
                    message: "hi".to_string(),
                },
                SessionEvent::Left("alice".to_string()),
                SessionEvent::SessionEnded,
            ]
        );
    }

    #[test]
    fn test_event_log_counts() {
        let log = EventLog::new();
        log.on_notice("lag");
        log.on_notice("lag");
        assert_eq!(log.count(&SessionEvent::Notice("lag".to_string())), 2);
        assert!(!log.contains(&SessionEvent::SessionEnded));
    }
}
