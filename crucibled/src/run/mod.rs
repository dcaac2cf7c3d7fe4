mod golang;
mod python;

use std::path::PathBuf;
use std::process::Output;
use std::time::{Duration, Instant};

use crucibled_api::{ExecResponse, RunRequest};
use thiserror::Error;
use tokio::task::spawn_blocking;
use tokio::time::timeout;

const COMPILE_TIMEOUT: Duration = Duration::from_secs(20);
const RUN_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-language execution recipe. The raw source has already been written
/// to [`source_path`] by the time either method runs.
pub trait Handler: Send + Sync {
    fn compile(&self, id: &str) -> Result<(), RunError>;
    fn run(&self, id: &str) -> Result<Output, RunError>;
}

pub fn handler_for(language: &str) -> Option<&'static dyn Handler> {
    match language {
        "python" => Some(&python::PythonHandler),
        "golang" => Some(&golang::GolangHandler),
        _ => None,
    }
}

pub fn source_path(id: &str) -> PathBuf {
    PathBuf::from("/tmp").join(id)
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{error}")]
    Compile {
        error: String,
        stdout: String,
        stderr: String,
    },
    #[error("I/O error while running code: {0}")]
    Io(#[from] std::io::Error),
    #[error("thread panicked during execution: {0}")]
    Panicked(String),
    #[error("code exceeded max compilation time of {0:?}")]
    CompileTimeout(Duration),
    #[error("code exceeded max runtime of {0:?}")]
    RunTimeout(Duration),
}

impl From<tokio::task::JoinError> for RunError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Panicked(format!("{value:?}"))
    }
}

/// Compile (when the language needs it) and run one job, collecting output
/// and resource usage. The handlers are plain blocking code spawned onto
/// the blocking pool, with a timeout around each phase.
pub async fn execute(
    handler: &'static dyn Handler,
    req: &RunRequest,
) -> Result<ExecResponse, RunError> {
    let id = req.id.clone();
    let compiled = timeout(COMPILE_TIMEOUT, spawn_blocking(move || handler.compile(&id)))
        .await
        .map_err(|_| RunError::CompileTimeout(COMPILE_TIMEOUT))?;
    compiled??;

    let id = req.id.clone();
    let started = Instant::now();
    let joined = timeout(RUN_TIMEOUT, spawn_blocking(move || handler.run(&id)))
        .await
        .map_err(|_| RunError::RunTimeout(RUN_TIMEOUT))?;
    let output = joined??;

    let exec_duration = started.elapsed().as_millis() as u64;

    Ok(ExecResponse {
        message: "Done".to_owned(),
        error: String::new(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exec_duration,
        mem_usage: max_child_rss_bytes(),
    })
}

/// Peak resident set over everything this process has run, in bytes.
/// ru_maxrss is reported in KiB on Linux.
fn max_child_rss_bytes() -> i64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };
    if rc == 0 {
        usage.ru_maxrss * 1024
    } else {
        0
    }
}
