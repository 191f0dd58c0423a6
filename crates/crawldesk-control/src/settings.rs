use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_MAX_ACTIVE_JOBS: usize = 5;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn absolutize(p: PathBuf) -> PathBuf {
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Process-wide tunables. Every field has a default so a bare environment boots.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    pub worker_bin: PathBuf,
    pub max_active_jobs: usize,
    pub reap_interval: Duration,
    pub idle_sweep_interval: Duration,
    pub liveness_window: Duration,
    pub session_idle: Duration,
    pub cancel_grace: Duration,
    pub seed_sites: PathBuf,
    pub bind: SocketAddr,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
    pub graph_processor: PathBuf,
    pub graph_script: Option<PathBuf>,
    pub graph_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            worker_bin: PathBuf::from("./pkg/data-crawler/data-crawler"),
            max_active_jobs: DEFAULT_MAX_ACTIVE_JOBS,
            reap_interval: Duration::from_millis(1000),
            idle_sweep_interval: Duration::from_secs(60),
            liveness_window: Duration::from_secs(72 * 60 * 60),
            session_idle: Duration::from_secs(60 * 60),
            cancel_grace: Duration::from_secs(5),
            seed_sites: PathBuf::from("./seed-sites.txt"),
            bind: ([0, 0, 0, 0], 8080).into(),
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
            graph_processor: PathBuf::from("python3"),
            graph_script: Some(PathBuf::from("./pkg/data-processor/data_processor.py")),
            graph_timeout: Duration::from_secs(120),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            data_root: absolutize(env_path("CRAWLDESK_DATA_ROOT", "./data")),
            worker_bin: env_path("CRAWLDESK_WORKER_BIN", "./pkg/data-crawler/data-crawler"),
            max_active_jobs: env_usize("CRAWLDESK_MAX_ACTIVE_JOBS")
                .map(|v| v.clamp(1, 64))
                .unwrap_or(d.max_active_jobs),
            reap_interval: env_u64("CRAWLDESK_REAP_INTERVAL_MS")
                .map(|v| Duration::from_millis(v.clamp(100, 60_000)))
                .unwrap_or(d.reap_interval),
            idle_sweep_interval: env_u64("CRAWLDESK_IDLE_SWEEP_INTERVAL_SEC")
                .map(|v| Duration::from_secs(v.clamp(5, 3600)))
                .unwrap_or(d.idle_sweep_interval),
            liveness_window: env_u64("CRAWLDESK_LIVENESS_WINDOW_HOURS")
                .map(|v| Duration::from_secs(v.clamp(1, 8760) * 60 * 60))
                .unwrap_or(d.liveness_window),
            session_idle: env_u64("CRAWLDESK_SESSION_IDLE_SEC")
                .map(|v| Duration::from_secs(v.clamp(60, 7 * 24 * 60 * 60)))
                .unwrap_or(d.session_idle),
            cancel_grace: env_u64("CRAWLDESK_CANCEL_GRACE_SEC")
                .map(|v| Duration::from_secs(v.clamp(1, 60)))
                .unwrap_or(d.cancel_grace),
            seed_sites: env_path("CRAWLDESK_SEED_SITES", "./seed-sites.txt"),
            bind: std::env::var("CRAWLDESK_BIND")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(d.bind),
            log_file_max_bytes: env_u64("CRAWLDESK_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(64 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(d.log_file_max_bytes),
            log_file_max_files: env_usize("CRAWLDESK_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(d.log_file_max_files),
            graph_processor: env_path("CRAWLDESK_GRAPH_PROCESSOR", "python3"),
            // Set to an empty value when the processor is a standalone executable.
            graph_script: match std::env::var("CRAWLDESK_GRAPH_SCRIPT") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(PathBuf::from(v.trim())),
                Err(_) => d.graph_script,
            },
            graph_timeout: env_u64("CRAWLDESK_GRAPH_TIMEOUT_SEC")
                .map(|v| Duration::from_secs(v.clamp(5, 1800)))
                .unwrap_or(d.graph_timeout),
        }
    }

    /// Leading processor arguments, ahead of the per-run flags.
    pub fn graph_args(&self) -> Vec<String> {
        self.graph_script
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }

    pub fn with_data_root(mut self, root: &Path) -> Self {
        self.data_root = root.to_path_buf();
        self
    }
}
