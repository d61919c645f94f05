//! Sandbox lifecycle: models, persistence, and the pool.

mod models;
mod pool;
mod repository;

pub use models::{Sandbox, SandboxState};
pub use pool::{CreateSandbox, EvictHook, LiveBridge, PoolConfig, SandboxPool};
pub use repository::SandboxRepository;
