//! Runner-side registration and heartbeat loop.
//!
//! A runner announces itself to the coordinator with exponential backoff
//! until registration lands, then reports its pool counts on a fixed
//! cadence. Active = sandboxes holding a session (warm, waiting, running);
//! warming is reported separately so the selection query can subtract
//! in-flight creates from free capacity.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sandbox::SandboxPool;

use super::models::{HeartbeatRequest, OkResponse, RegisterRequest};

/// Registration retry schedule, in seconds.
const REGISTER_BACKOFF_SECS: &[u64] = &[1, 2, 4, 8, 16];

/// Connection details this runner advertises.
#[derive(Debug, Clone)]
pub struct RunnerIdentity {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub max_sandboxes: i64,
}

/// Heartbeat loop configuration.
#[derive(Clone)]
pub struct HeartbeatConfig {
    pub coordinator_url: String,
    pub identity: RunnerIdentity,
    pub interval: Duration,
    pub internal_secret: Option<String>,
}

/// Register with the coordinator, retrying on the backoff schedule, then
/// heartbeat until cancelled. Deregisters on the way out.
pub fn spawn_heartbeat(
    pool: Arc<SandboxPool>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let client = reqwest::Client::new();

        if !register_with_backoff(&client, &config, &cancel).await {
            return;
        }

        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = send_heartbeat(&client, &pool, &config).await {
                warn!(error = ?e, "heartbeat failed");
            }
        }

        if let Err(e) = post_internal(
            &client,
            &config,
            "deregister",
            &serde_json::json!({ "id": config.identity.id }),
        )
        .await
        {
            warn!(error = ?e, "deregister on shutdown failed");
        }
    });
}

async fn register_with_backoff(
    client: &reqwest::Client,
    config: &HeartbeatConfig,
    cancel: &CancellationToken,
) -> bool {
    let request = RegisterRequest {
        id: config.identity.id.clone(),
        host: config.identity.host.clone(),
        port: config.identity.port as i64,
        max_sandboxes: config.identity.max_sandboxes,
    };

    let mut backoff = REGISTER_BACKOFF_SECS.iter();
    loop {
        match post_internal(client, config, "register", &request).await {
            Ok(()) => {
                info!(runner_id = %config.identity.id, "registered with coordinator");
                return true;
            }
            Err(e) => {
                let wait = backoff.next().copied().unwrap_or(16);
                warn!(error = ?e, retry_in_secs = wait, "registration failed");
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(Duration::from_secs(wait)) => {}
                }
            }
        }
    }
}

async fn send_heartbeat(
    client: &reqwest::Client,
    pool: &SandboxPool,
    config: &HeartbeatConfig,
) -> anyhow::Result<()> {
    let stats = pool.stats().await?;
    let request = HeartbeatRequest {
        id: config.identity.id.clone(),
        active: stats.warm + stats.waiting + stats.running,
        warming: stats.warming,
    };
    post_internal(client, config, "heartbeat", &request).await?;
    debug!(active = request.active, warming = request.warming, "heartbeat sent");
    Ok(())
}

async fn post_internal<T: serde::Serialize>(
    client: &reqwest::Client,
    config: &HeartbeatConfig,
    endpoint: &str,
    body: &T,
) -> anyhow::Result<()> {
    let mut request = client
        .post(format!(
            "{}/internal/runners/{endpoint}",
            config.coordinator_url
        ))
        .json(body);
    if let Some(secret) = &config.internal_secret {
        request = request.bearer_auth(secret);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        anyhow::bail!("coordinator returned {}", response.status());
    }
    let _: OkResponse = response.json().await?;
    Ok(())
}
