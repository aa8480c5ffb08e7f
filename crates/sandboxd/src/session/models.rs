//! Session data models and the status state machine.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Row inserted, sandbox being provisioned.
    Creating,
    /// Sandbox reachable and in use.
    Running,
    /// No recent activity; sandbox still up.
    Idle,
    Stopped,
    /// Soft-deleted. Terminal.
    Deleted,
}

/// Events that move a session between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Ready,
    Activity,
    IdleTimeout,
    Stop,
    Delete,
}

/// An event applied to a status it is not legal from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal session transition: {event} from {from}")]
pub struct IllegalTransition {
    pub from: SessionStatus,
    pub event: SessionEvent,
}

impl SessionEvent {
    /// Statuses this event may be applied to.
    pub fn legal_sources(self) -> &'static [SessionStatus] {
        use SessionStatus::*;
        match self {
            SessionEvent::Ready => &[Creating],
            SessionEvent::Activity => &[Running, Idle],
            SessionEvent::IdleTimeout => &[Running],
            SessionEvent::Stop => &[Creating, Running, Idle],
            SessionEvent::Delete => &[Creating, Running, Idle, Stopped],
        }
    }

    /// Status the event leads to.
    pub fn target(self) -> SessionStatus {
        match self {
            SessionEvent::Ready | SessionEvent::Activity => SessionStatus::Running,
            SessionEvent::IdleTimeout => SessionStatus::Idle,
            SessionEvent::Stop => SessionStatus::Stopped,
            SessionEvent::Delete => SessionStatus::Deleted,
        }
    }
}

impl SessionStatus {
    /// Statuses covered by the one-current-session-per-(user, agent) index.
    pub const CURRENT: &'static [SessionStatus] = &[
        SessionStatus::Creating,
        SessionStatus::Running,
        SessionStatus::Idle,
    ];

    /// Statuses whose sandbox is expected to be up and receiving file pushes.
    pub const ACTIVE: &'static [SessionStatus] = &[SessionStatus::Running, SessionStatus::Idle];

    pub fn transition(self, event: SessionEvent) -> Result<SessionStatus, IllegalTransition> {
        if event.legal_sources().contains(&self) {
            Ok(event.target())
        } else {
            Err(IllegalTransition { from: self, event })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Deleted => "deleted",
        }
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_current(self) -> bool {
        Self::CURRENT.contains(&self)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(SessionStatus::Creating),
            "running" => Ok(SessionStatus::Running),
            "idle" => Ok(SessionStatus::Idle),
            "stopped" => Ok(SessionStatus::Stopped),
            "deleted" => Ok(SessionStatus::Deleted),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

// Implement conversion from String for SQLx
impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Ready => write!(f, "ready"),
            SessionEvent::Activity => write!(f, "activity"),
            SessionEvent::IdleTimeout => write!(f, "idle_timeout"),
            SessionEvent::Stop => write!(f, "stop"),
            SessionEvent::Delete => write!(f, "delete"),
        }
    }
}

/// A usage window of one user on one agent's sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// UUID v4.
    pub id: String,
    pub user_id: i64,
    pub agent_id: i64,
    /// Concrete pod name, `{workload}-0`.
    pub pod_name: String,
    pub pod_ip: String,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub last_active: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of [`SessionService::create_or_reuse_session`](super::SessionService::create_or_reuse_session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub pod_name: String,
    pub created_at: String,
    /// False when an existing session was reused or adopted.
    pub is_new: bool,
}

impl CreateSessionResponse {
    pub fn from_session(session: &Session, is_new: bool) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            pod_name: session.pod_name.clone(),
            created_at: session.created_at.clone(),
            is_new,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent::*;
    use SessionStatus::*;

    const ALL_STATUSES: [SessionStatus; 5] = [Creating, Running, Idle, Stopped, Deleted];
    const ALL_EVENTS: [SessionEvent; 5] = [Ready, Activity, IdleTimeout, Stop, Delete];

    #[test]
    fn legal_transitions() {
        assert_eq!(Creating.transition(Ready), Ok(Running));
        assert_eq!(Running.transition(Activity), Ok(Running));
        assert_eq!(Idle.transition(Activity), Ok(Running));
        assert_eq!(Running.transition(IdleTimeout), Ok(Idle));
        assert_eq!(Idle.transition(Stop), Ok(Stopped));
        assert_eq!(Stopped.transition(Delete), Ok(Deleted));
        assert_eq!(Creating.transition(Delete), Ok(Deleted));
    }

    #[test]
    fn every_other_pair_is_illegal() {
        let legal = [
            (Creating, Ready),
            (Running, Activity),
            (Idle, Activity),
            (Running, IdleTimeout),
            (Creating, Stop),
            (Running, Stop),
            (Idle, Stop),
            (Creating, Delete),
            (Running, Delete),
            (Idle, Delete),
            (Stopped, Delete),
        ];
        for status in ALL_STATUSES {
            for event in ALL_EVENTS {
                let result = status.transition(event);
                if legal.contains(&(status, event)) {
                    assert!(result.is_ok(), "{status} + {event} should be legal");
                } else {
                    assert_eq!(
                        result,
                        Err(IllegalTransition {
                            from: status,
                            event
                        })
                    );
                }
            }
        }
    }

    #[test]
    fn deleted_is_terminal() {
        for event in ALL_EVENTS {
            assert!(Deleted.transition(event).is_err());
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in ALL_STATUSES {
            assert_eq!(status.to_string().parse::<SessionStatus>(), Ok(status));
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn illegal_transition_message() {
        let err = Deleted.transition(Activity).unwrap_err();
        assert_eq!(err.to_string(), "illegal session transition: activity from deleted");
    }
}
