//! Container engine detection and command execution inside containers.

use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use duct::cmd;

use crate::install::discovery::{self, OptionalDep};

/// Locate the container engine executable. An explicit path wins; otherwise
/// podman is preferred over docker.
pub fn detect_engine(engine_path: Option<&str>) -> Result<String> {
    if let Some(path) = engine_path {
        return Ok(shellexpand::tilde(path).into_owned());
    }
    for candidate in ["podman", "docker"] {
        if let Ok(path) = which::which(candidate) {
            return Ok(path.to_string_lossy().into_owned());
        }
    }
    bail!("Neither podman nor docker found on PATH")
}

/// Execution of shell scripts inside a running container.
///
/// The install orchestrator only talks to this trait; tests substitute a
/// recording implementation.
pub trait ContainerRunner {
    /// Run attached to an interactive terminal (install commands that may
    /// prompt or draw progress). Returns the command's exit code.
    fn run_terminal(&self, container: &str, script: &str) -> Result<i32>;

    /// Run non-interactively with output suppressed (existence checks).
    /// Returns the command's exit code.
    fn run_quiet(&self, container: &str, script: &str) -> Result<i32>;

    /// Run non-interactively and capture stdout (file listings). A non-zero
    /// exit is an error.
    fn run_output(&self, container: &str, script: &str) -> Result<String>;

    /// Run the optional-dependency search, streaming its progress output
    /// through while collecting the trailing record block.
    fn find_optional_deps(&self, container: &str, script: &str, package: &str)
    -> Result<Vec<OptionalDep>>;
}

/// [`ContainerRunner`] over a podman/docker executable.
pub struct EngineRunner {
    engine: String,
}

impl EngineRunner {
    pub fn new(engine: String) -> Self {
        EngineRunner { engine }
    }
}

impl ContainerRunner for EngineRunner {
    fn run_terminal(&self, container: &str, script: &str) -> Result<i32> {
        let status = Command::new(&self.engine)
            .args(["exec", "-it", container, "/bin/bash", "-c", script])
            .status()
            .with_context(|| format!("Failed to run command in container '{container}'"))?;
        Ok(status.code().unwrap_or(1))
    }

    fn run_quiet(&self, container: &str, script: &str) -> Result<i32> {
        let status = Command::new(&self.engine)
            .args(["exec", container, "/bin/bash", "-c", script])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("Failed to run command in container '{container}'"))?;
        Ok(status.code().unwrap_or(1))
    }

    fn run_output(&self, container: &str, script: &str) -> Result<String> {
        cmd(
            self.engine.as_str(),
            ["exec", container, "/bin/bash", "-c", script],
        )
        .read()
        .with_context(|| format!("Command failed in container '{container}'"))
    }

    fn find_optional_deps(
        &self,
        container: &str,
        script: &str,
        package: &str,
    ) -> Result<Vec<OptionalDep>> {
        // "-it" keeps the helper's progress rendering intact; its stdout is
        // still piped to us for sentinel detection.
        let mut command = Command::new(&self.engine);
        command.args(["exec", "-it", container, "/bin/bash", "-c", script]);
        discovery::discover(&mut command, package)
    }
}
