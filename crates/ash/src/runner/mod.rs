//! Runner registry, backends, and coordination.

mod backend;
mod coordinator;
mod heartbeat;
mod models;
mod repository;

pub use backend::{EventStream, LocalBackend, NewSandbox, RemoteBackend, RunnerBackend};
pub use coordinator::Coordinator;
pub use heartbeat::{HeartbeatConfig, RunnerIdentity, spawn_heartbeat};
pub use models::{
    CreateSandboxRequest, CreateSandboxResponse, DeregisterRequest, HeartbeatRequest, OkResponse,
    RegisterRequest, Runner,
};
pub use repository::RunnerRepository;
