//! HTTP client for the in-guest agent.

use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crucibled_api::{ExecResponse, RunRequest};

pub const AGENT_PORT: u16 = 8080;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);
const RUN_TIMEOUT: Duration = Duration::from_secs(60);

fn http() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(reqwest::Client::new)
}

/// One readiness probe. Transport errors and non-200 answers both mean
/// "not ready"; the caller decides how long to keep asking.
pub async fn ping(ip: Ipv4Addr) -> Result<()> {
    let res = http()
        .get(format!("http://{ip}:{AGENT_PORT}/health"))
        .timeout(HEALTH_TIMEOUT)
        .send()
        .await
        .context("health request")?;

    if res.status() != reqwest::StatusCode::OK {
        return Err(anyhow!("agent answered health with {}", res.status()));
    }
    Ok(())
}

pub struct AgentRun {
    /// 2xx from the agent: the job was actually executed.
    pub ok: bool,
    pub response: ExecResponse,
}

/// Hand a job to the agent and decode its verdict. Compile failures and
/// agent-side errors come back as `ok: false` with the agent's body; a
/// transport failure is an `Err`.
pub async fn run_job(ip: Ipv4Addr, request: &RunRequest) -> Result<AgentRun> {
    let res = http()
        .post(format!("http://{ip}:{AGENT_PORT}/run"))
        .timeout(RUN_TIMEOUT)
        .json(request)
        .send()
        .await
        .context("run request")?;

    let ok = res.status().is_success();
    let response = res
        .json::<ExecResponse>()
        .await
        .context("decode agent response")?;

    Ok(AgentRun { ok, response })
}
