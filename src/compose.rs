//! Starting and stopping compose projects.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{Error, Result};

/// Brings compose projects up and down.
#[async_trait]
pub trait ComposeRunner: Send + Sync {
    /// `docker compose up -d --remove-orphans` in `dir`.
    async fn up(&self, dir: &Path, project: &str) -> Result<()>;

    /// `docker compose down` in `dir`.
    async fn down(&self, dir: &Path, project: &str) -> Result<()>;
}

/// [`ComposeRunner`] shelling out to the `docker compose` plugin.
#[derive(Debug, Clone)]
pub struct DockerCompose {
    program: PathBuf,
    docker_host: String,
}

impl DockerCompose {
    pub fn new(docker_host: impl Into<String>) -> Self {
        Self {
            program: PathBuf::from("docker"),
            docker_host: docker_host.into(),
        }
    }

    /// Use another `docker` binary.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, dir: &Path, project: &str, args: &[&str]) -> Result<()> {
        debug!(project, dir = %dir.display(), ?args, "running docker compose");
        let output = Command::new(&self.program)
            .arg("compose")
            .args(["--project-name", project])
            .args(args)
            .current_dir(dir)
            .env("DOCKER_HOST", &self.docker_host)
            .output()
            .await
            .map_err(|e| {
                Error::Transport(format!("failed to run {}: {e}", self.program.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Transport(format!(
                "docker compose {} failed for {project}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ComposeRunner for DockerCompose {
    async fn up(&self, dir: &Path, project: &str) -> Result<()> {
        self.run(dir, project, &["up", "-d", "--remove-orphans"]).await?;
        info!(project, "compose project started");
        Ok(())
    }

    async fn down(&self, dir: &Path, project: &str) -> Result<()> {
        self.run(dir, project, &["down"]).await?;
        info!(project, "compose project stopped");
        Ok(())
    }
}
