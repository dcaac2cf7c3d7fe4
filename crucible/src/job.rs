//! Inbound jobs and the per-job dispatch path.

use std::sync::Arc;

use crucibled_api::{ExecResponse, RunRequest};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::agent;
use crate::pool::VmPoolManager;
use crate::queue::JobQueue;

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Job {
    fn run_request(&self) -> RunRequest {
        RunRequest {
            id: self.id.clone(),
            language: self.language.clone(),
            code: self.code.clone(),
            variant: self.variant.clone(),
        }
    }

    /// One task per inbound job: publish `received`, claim a warm VM,
    /// publish `running`, hand the code to the agent, publish the terminal
    /// status, and discard the VM. A VM never serves two jobs.
    pub async fn run(
        self,
        queue: Arc<JobQueue>,
        pools: Arc<VmPoolManager>,
        shutdown: CancellationToken,
    ) {
        queue.set_received(&self).await;

        let pool = match pools.get_pool(&self.language) {
            Ok(pool) => pool,
            Err(err) => {
                tracing::warn!(job = %self.id, language = %self.language, "Job for unknown language");
                queue
                    .set_failed(&self, &ExecResponse::from_error(err.to_string()))
                    .await;
                return;
            }
        };

        // may park here until a filler delivers; shutdown aborts the wait
        let vm = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(job = %self.id, "Shutting down before a VM became available");
                return;
            }
            vm = pool.take() => match vm {
                Ok(vm) => vm,
                Err(_) => {
                    tracing::info!(job = %self.id, "Pool closed while waiting for a VM");
                    return;
                }
            },
        };

        queue.set_running(&self).await;

        match agent::run_job(vm.ip, &self.run_request()).await {
            Ok(run) if run.ok => queue.set_done(&self, &run.response).await,
            Ok(run) => queue.set_failed(&self, &run.response).await,
            Err(err) => {
                let detail = format!("{err:#}");
                tracing::error!(job = %self.id, err = %detail, "Agent invocation failed");
                queue
                    .set_failed(&self, &ExecResponse::from_error(detail))
                    .await;
            }
        }

        vm.shutdown().await;
    }
}
