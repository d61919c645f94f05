//! Session lifecycle and persistence.

mod models;
mod repository;
mod service;

pub use models::{
    CreateSessionRequest, Message, SendMessageRequest, Session, SessionEvent, SessionStatus,
};
pub use repository::SessionRepository;
pub use service::SessionService;
