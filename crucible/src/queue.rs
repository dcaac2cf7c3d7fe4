//! NATS transport: the inbound job subscription and per-job status
//! publishing.
//!
//! Status updates are fire-and-forget. A broker hiccup on a publish is
//! logged and the job carries on; losing one status message must never
//! take a dispatcher down with it.

use anyhow::{Context, Result};
use crucibled_api::ExecResponse;
use serde::Serialize;

use crate::job::Job;

const JOBS_SUBJECT: &str = "jobs";

pub struct JobQueue {
    client: async_nats::Client,
}

#[derive(Debug, Serialize)]
struct JobStatus<'a> {
    id: &'a str,
    status: &'a str,
    message: &'a str,
    error: &'a str,
    stderr: &'a str,
    stdout: &'a str,
    exec_duration: u64,
    mem_usage: i64,
}

impl<'a> JobStatus<'a> {
    fn new(job: &'a Job, status: &'a str, res: &'a ExecResponse) -> Self {
        Self {
            id: &job.id,
            status,
            message: &res.message,
            error: &res.error,
            stderr: &res.stderr,
            stdout: &res.stdout,
            exec_duration: res.exec_duration,
            mem_usage: res.mem_usage,
        }
    }
}

fn status_subject(id: &str) -> String {
    format!("job_status.{id}")
}

impl JobQueue {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("connect to NATS at {url}"))?;
        tracing::info!(url, "Connected to NATS");
        Ok(Self { client })
    }

    pub async fn subscribe_jobs(&self) -> Result<async_nats::Subscriber> {
        self.client
            .subscribe(JOBS_SUBJECT.to_owned())
            .await
            .context("subscribe to the jobs subject")
    }

    async fn publish_status(&self, job: &Job, status: &str, res: &ExecResponse) {
        let payload = JobStatus::new(job, status, res);
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(job = %job.id, %err, "Failed to encode job status");
                return;
            }
        };
        if let Err(err) = self
            .client
            .publish(status_subject(&job.id), bytes.into())
            .await
        {
            tracing::error!(job = %job.id, status, %err, "Failed to publish job status");
        }
    }

    pub async fn set_received(&self, job: &Job) {
        self.publish_status(job, "received", &ExecResponse::default())
            .await;
    }

    pub async fn set_running(&self, job: &Job) {
        self.publish_status(job, "running", &ExecResponse::default())
            .await;
    }

    pub async fn set_done(&self, job: &Job, res: &ExecResponse) {
        self.publish_status(job, "done", res).await;
    }

    pub async fn set_failed(&self, job: &Job, res: &ExecResponse) {
        self.publish_status(job, "failed", res).await;
    }
}
