//! Bridge process supervision and resource limits.

pub mod limits;
mod supervisor;

pub use limits::ResourceLimits;
pub use supervisor::{
    Bridge, BridgeSpawnSpec, ENV_ALLOWLIST, ExitClass, classify_exit, restricted_env,
};
