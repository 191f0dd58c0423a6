use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use crawldesk_job::TenantId;
use tokio::process::Command;

use crate::{
    artifacts::{ArtifactLayout, TENANT_SEPARATOR},
    error::GraphError,
};

/// Runs the external data processor that renders a tenant's result store as
/// an HTML network graph:
///
/// `<program> [args..] --database <store> --output <html> [--physics true]`
///
/// Output goes to a tenant-prefixed temp file and is renamed into
/// `graphs/<tenant>.html` only when the processor succeeds.
#[derive(Debug, Clone)]
pub struct GraphGenerator {
    program: PathBuf,
    args: Vec<String>,
    layout: ArtifactLayout,
    timeout: Duration,
}

impl GraphGenerator {
    pub fn new(program: PathBuf, args: Vec<String>, layout: ArtifactLayout, timeout: Duration) -> Self {
        Self {
            program,
            args,
            layout,
            timeout,
        }
    }

    pub fn graph_path(&self, tenant: &TenantId) -> PathBuf {
        self.layout.graph(tenant)
    }

    pub async fn generate(&self, tenant: &TenantId, physics: bool) -> Result<PathBuf, GraphError> {
        let store = self.layout.result_store(tenant);
        if !tokio::fs::try_exists(&store).await.unwrap_or(false) {
            return Err(GraphError::NoResults);
        }

        let dir = self.layout.graphs_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(
            "{tenant}{TENANT_SEPARATOR}{}.html.tmp",
            uuid::Uuid::new_v4().simple()
        ));

        let res = self.run(tenant, &store, &tmp, physics).await;
        if res.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        res
    }

    async fn run(&self, tenant: &TenantId, store: &Path, tmp: &Path, physics: bool) -> Result<PathBuf, GraphError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--database")
            .arg(store)
            .arg("--output")
            .arg(tmp);
        if physics {
            cmd.args(["--physics", "true"]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| GraphError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        // On timeout the child is dropped, which kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GraphError::TimedOut(self.timeout))??;

        if !output.status.success() {
            return Err(GraphError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let out = self.layout.graph(tenant);
        match tokio::fs::rename(tmp, &out).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(GraphError::MissingOutput),
            Err(e) => return Err(e.into()),
        }
        tracing::info!(tenant = %tenant, physics, path = %out.display(), "network graph generated");
        Ok(out)
    }
}
