use std::path::{Path, PathBuf};

use crawldesk_job::{JobConfig, JobId, TenantId};
use tokio::io::AsyncWriteExt;

/// Separates the tenant from a per-job suffix in artifact file names.
pub const TENANT_SEPARATOR: &str = "__";

/// Tenant-scoped on-disk layout under the data root.
///
/// Every artifact name starts with the owning tenant id so the idle-session
/// reaper can attribute files without any index.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn graphs_dir(&self) -> PathBuf {
        self.root.join("graphs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn artifact_dirs(&self) -> [PathBuf; 4] {
        [
            self.results_dir(),
            self.configs_dir(),
            self.graphs_dir(),
            self.logs_dir(),
        ]
    }

    pub fn result_store(&self, tenant: &TenantId) -> PathBuf {
        self.results_dir().join(format!("{tenant}.db"))
    }

    pub fn job_config(&self, tenant: &TenantId, job: JobId) -> PathBuf {
        self.configs_dir()
            .join(format!("{tenant}{TENANT_SEPARATOR}{job}.json"))
    }

    pub fn job_log(&self, tenant: &TenantId, job: JobId) -> PathBuf {
        self.logs_dir()
            .join(format!("{tenant}{TENANT_SEPARATOR}{job}.log"))
    }

    pub fn graph(&self, tenant: &TenantId) -> PathBuf {
        self.graphs_dir().join(format!("{tenant}.html"))
    }

    pub async fn ensure(&self) -> std::io::Result<()> {
        for dir in self.artifact_dirs() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// Tenant embedded in an artifact file name: the text before the first `.`
/// and before the first [`TENANT_SEPARATOR`].
pub fn tenant_of_artifact(file_name: &str) -> Option<&str> {
    let stem = file_name.split('.').next()?;
    let tenant = stem.split(TENANT_SEPARATOR).next()?;
    if tenant.is_empty() { None } else { Some(tenant) }
}

/// Writes the worker config atomically (tmp + rename) so a worker never reads
/// a half-written file.
pub async fn write_job_config(path: &Path, config: &JobConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(config).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(&data).await?;
    f.flush().await?;
    drop(f);
    tokio::fs::rename(&tmp, path).await
}
