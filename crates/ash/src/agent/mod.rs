//! Agent deployment and lookup.

mod models;
mod repository;
mod service;

pub use models::{Agent, DeployAgentRequest};
pub use repository::AgentRepository;
pub use service::{AgentService, SYSTEM_PROMPT_FILE};
