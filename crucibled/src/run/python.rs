use std::process::{Command, Output};

use super::{source_path, RunError};

#[derive(Debug)]
pub struct PythonHandler;

impl super::Handler for PythonHandler {
    /// Python has no build step; the interpreter just wants its extension.
    #[tracing::instrument(skip(self))]
    fn compile(&self, id: &str) -> Result<(), RunError> {
        std::fs::copy(source_path(id), format!("/tmp/{id}.py"))?;
        tracing::debug!("Code written out to /tmp/{id}.py");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn run(&self, id: &str) -> Result<Output, RunError> {
        let output = Command::new("/usr/bin/python3")
            .arg(format!("/tmp/{id}.py"))
            .output()?;
        tracing::debug!("Output collected, process joined");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Handler;
    use super::*;

    #[test]
    fn compile_stages_the_source_with_a_py_extension() {
        let id = format!("test-{}", uuid::Uuid::new_v4());
        std::fs::write(source_path(&id), "print('hi')").unwrap();

        PythonHandler.compile(&id).unwrap();

        let staged = format!("/tmp/{id}.py");
        assert_eq!(std::fs::read_to_string(&staged).unwrap(), "print('hi')");

        std::fs::remove_file(source_path(&id)).unwrap();
        std::fs::remove_file(&staged).unwrap();
    }

    #[test]
    fn compile_fails_without_a_source_file() {
        let id = format!("test-{}", uuid::Uuid::new_v4());
        assert!(PythonHandler.compile(&id).is_err());
    }
}
