//! Session orchestrator.

mod models;
mod probe;
mod repository;
mod service;

pub use models::{
    CreateSessionResponse, IllegalTransition, Session, SessionEvent, SessionStatus,
};
pub use probe::{HttpProbe, PodIpProbe, ReachabilityProbe};
pub use repository::SessionRepository;
pub use service::{SessionService, SessionServiceConfig};
