//! Runner host: model instances, subprocess supervision, streaming.

mod client;
mod control_client;
mod error;
mod instance;
mod stream;
mod supervisor;

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::protocol::{InferenceRequest, TaskResponse};
use crate::session::SessionFilter;

pub use client::{
    ApiUsage, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatDelta,
    ChatMessage, ChunkChoice, FunctionDelta, OllamaApiClient, PullProgress, ToolCallDelta,
};
pub use control_client::ControlClient;
pub use error::{RunnerError, RunnerResult};
pub use instance::{InstanceConfig, ModelInstance};
pub use stream::{SseBuffer, ToolCallAccumulator};
pub use supervisor::{
    free_port, kill_process_tree, OllamaSupervisor, SupervisorConfig, TailBuffer,
    READINESS_POLL_INTERVAL, READINESS_TIMEOUT,
};

/// How often the reaper checks staleness and reports snapshots.
const REAPER_INTERVAL: Duration = Duration::from_secs(5);

/// Where a model instance pulls its next piece of work from.
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn next_request(&self, filter: &SessionFilter) -> Result<Option<InferenceRequest>>;
}

/// Where a model instance sends its response frames.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, response: TaskResponse) -> Result<()>;
}

/// Runner host configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Control-plane base URL.
    pub control_url: String,
    /// Models to host, one instance each.
    pub models: Vec<String>,
    /// Inference server binary.
    pub binary: String,
    /// Model cache directory.
    pub cache_dir: PathBuf,
    /// Idle TTL before an instance reports stale.
    pub instance_ttl: Duration,
    /// Bound on each instance's job-history ring.
    pub job_history_buffer_size: usize,
    /// Models to pre-pull at instance start.
    pub warmup_models: Vec<String>,
}

/// Hosts one model instance per configured model and reaps stale ones.
pub struct RunnerHost {
    instances: Vec<Arc<ModelInstance>>,
    cancel: CancellationToken,
}

impl RunnerHost {
    /// Boot all configured instances and start the reaper.
    pub async fn start(config: RunnerConfig) -> Result<Self> {
        let cancel = CancellationToken::new();
        let client = Arc::new(ControlClient::new(config.control_url.clone()));

        let mut instances = Vec::with_capacity(config.models.len());
        for model in &config.models {
            let instance = ModelInstance::start(
                InstanceConfig {
                    model: model.clone(),
                    binary: config.binary.clone(),
                    cache_dir: config.cache_dir.clone(),
                    ttl: config.instance_ttl,
                    job_history_limit: config.job_history_buffer_size,
                    warmup_models: config.warmup_models.clone(),
                },
                client.clone() as Arc<dyn WorkSource>,
                client.clone() as Arc<dyn ResponseHandler>,
                &cancel,
            )
            .await?;

            info!("model instance {} serving {}", instance.id(), model);
            instances.push(Arc::new(instance));
        }

        let host = Self { instances, cancel };
        host.spawn_reaper(client);
        Ok(host)
    }

    /// Periodically report instance snapshots and stop stale
    /// instances. Instances never self-terminate on staleness.
    fn spawn_reaper(&self, client: Arc<ControlClient>) {
        let instances = self.instances.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                for instance in &instances {
                    if instance.is_stopped() {
                        continue;
                    }

                    let state = instance.state();
                    if let Err(err) = client.report_state(&state).await {
                        warn!("failed to report instance state: {:?}", err);
                    }

                    if instance.stale() {
                        info!(
                            "instance {} for {} stale, stopping",
                            instance.id(),
                            instance.model()
                        );
                        if let Err(err) = instance.stop() {
                            error!("error stopping stale instance: {}", err);
                        }
                    }
                }
            }
        });
    }

    /// Stop every instance and the reaper.
    pub fn shutdown(&self) {
        for instance in &self.instances {
            if instance.is_stopped() {
                continue;
            }
            if let Err(err) = instance.stop() {
                error!("error stopping instance {}: {}", instance.id(), err);
            }
        }
        self.cancel.cancel();
    }

    /// Wait until every instance's subprocess has exited.
    pub async fn wait_finished(&self) {
        for instance in &self.instances {
            instance.wait_finished().await;
        }
    }

    pub fn instances(&self) -> &[Arc<ModelInstance>] {
        &self.instances
    }
}
