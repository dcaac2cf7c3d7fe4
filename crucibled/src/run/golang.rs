use std::process::{Command, Output};

use super::{source_path, RunError};

#[derive(Debug)]
pub struct GolangHandler;

impl super::Handler for GolangHandler {
    #[tracing::instrument(skip(self))]
    fn compile(&self, id: &str) -> Result<(), RunError> {
        std::fs::copy(source_path(id), format!("/tmp/{id}.go"))?;

        let output = Command::new("go")
            .args(["build", "-o"])
            .arg(format!("/tmp/{id}.out"))
            .arg(format!("/tmp/{id}.go"))
            .output()?;

        if output.status.success() {
            tracing::debug!("Code compiled successfully");
            Ok(())
        } else {
            tracing::info!("Code failed to compile");
            Err(RunError::Compile {
                error: format!("go build exited with {}", output.status),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    #[tracing::instrument(skip(self))]
    fn run(&self, id: &str) -> Result<Output, RunError> {
        let output = Command::new(format!("/tmp/{id}.out")).output()?;
        tracing::debug!("Output collected, process joined");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Handler;
    use super::*;

    #[test]
    fn compile_fails_without_a_source_file() {
        let id = format!("test-{}", uuid::Uuid::new_v4());
        assert!(GolangHandler.compile(&id).is_err());
    }
}
