use std::{future::Future, path::PathBuf, process::Stdio, time::Duration};

use crawldesk_job::{JobId, JobKey, TenantId};
use futures_util::future::BoxFuture;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::error::LaunchError;

/// Everything a spawner needs to start one worker run.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub tenant: TenantId,
    pub key: JobKey,
    pub job_id: JobId,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub cancelled: bool,
    pub error: Option<String>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A started worker. `wait` resolves once the worker is gone for good,
/// including after a cancellation-driven termination.
pub struct RunningWorker {
    pub pid: Option<u32>,
    exit: BoxFuture<'static, WorkerExit>,
}

impl RunningWorker {
    pub fn new(pid: Option<u32>, exit: impl Future<Output = WorkerExit> + Send + 'static) -> Self {
        Self {
            pid,
            exit: Box::pin(exit),
        }
    }

    pub async fn wait(self) -> WorkerExit {
        self.exit.await
    }
}

#[async_trait::async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Starts a worker for `spec`. The worker must stop once `cancel` fires.
    async fn spawn(
        &self,
        spec: WorkerSpec,
        cancel: CancellationToken,
    ) -> Result<RunningWorker, LaunchError>;
}

/// Runs the external crawler binary as `<program> -c <config>` in its own
/// process group.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    grace: Duration,
    log_max_bytes: u64,
    log_max_files: usize,
}

impl ProcessSpawner {
    pub fn new(program: PathBuf, grace: Duration) -> Self {
        Self {
            program,
            grace,
            log_max_bytes: 10 * 1024 * 1024,
            log_max_files: 3,
        }
    }

    pub fn with_log_limits(mut self, max_bytes: u64, max_files: usize) -> Self {
        self.log_max_bytes = max_bytes;
        self.log_max_files = max_files.max(1);
        self
    }
}

#[async_trait::async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        spec: WorkerSpec,
        cancel: CancellationToken,
    ) -> Result<RunningWorker, LaunchError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c")
            .arg(&spec.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let pid = child.id();

        let log_tx = spawn_log_writer(&spec, self.log_max_bytes, self.log_max_files);
        forward_output(&mut child, &spec, log_tx.clone());

        let grace = self.grace;
        let exit = async move {
            let exit = supervise(child, pid, cancel, grace).await;
            let _ = log_tx.send(exit_line(&exit));
            exit
        };
        Ok(RunningWorker::new(pid, exit))
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    cancel: CancellationToken,
    grace: Duration,
) -> WorkerExit {
    tokio::select! {
        res = child.wait() => return exit_from(res, false),
        _ = cancel.cancelled() => {}
    }

    let pgid = pid.map(|p| p as i32);
    signal_group(&mut child, pgid, Signal::Term);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(res) => exit_from(res, true),
        Err(_) => {
            tracing::warn!(?pid, "crawl worker ignored SIGTERM; sending SIGKILL");
            signal_group(&mut child, pgid, Signal::Kill);
            exit_from(child.wait().await, true)
        }
    }
}

fn exit_line(exit: &WorkerExit) -> String {
    let code = exit.code.map_or_else(|| "none".to_string(), |c| c.to_string());
    match &exit.error {
        Some(err) => format!("=== exit code={code} cancelled={} error={err} ===", exit.cancelled),
        None => format!("=== exit code={code} cancelled={} ===", exit.cancelled),
    }
}

fn exit_from(res: std::io::Result<std::process::ExitStatus>, cancelled: bool) -> WorkerExit {
    match res {
        Ok(status) => WorkerExit {
            code: status.code(),
            cancelled,
            error: None,
        },
        Err(e) => WorkerExit {
            code: None,
            cancelled,
            error: Some(e.to_string()),
        },
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, pgid: Option<i32>, signal: Signal) {
    let Some(pgid) = pgid else {
        let _ = child.start_kill();
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(-pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pgid: Option<i32>, _signal: Signal) {
    let _ = child.start_kill();
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Workers must not outlive the control process.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

fn forward_output(child: &mut Child, spec: &WorkerSpec, log_tx: mpsc::UnboundedSender<String>) {
    if let Some(out) = child.stdout.take() {
        let tx = log_tx.clone();
        let tenant = spec.tenant.clone();
        let key = spec.key.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(tenant = %tenant, job = %key, "[stdout] {line}");
                let _ = tx.send(format!("[stdout] {line}"));
            }
        });
    }
    if let Some(err) = child.stderr.take() {
        let tx = log_tx;
        let tenant = spec.tenant.clone();
        let key = spec.key.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(tenant = %tenant, job = %key, "[stderr] {line}");
                let _ = tx.send(format!("[stderr] {line}"));
            }
        });
    }
}

fn spawn_log_writer(spec: &WorkerSpec, max_bytes: u64, max_files: usize) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let banner = format!(
        "crawl job {} tenant={} key={} started={}",
        spec.job_id,
        spec.tenant,
        spec.key,
        chrono::Utc::now().to_rfc3339(),
    );
    let path = spec.log_path.clone();
    tokio::spawn(async move {
        let mut log = match JobLog::create(path.clone(), banner, max_bytes, max_files).await {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "worker log file unavailable");
                return;
            }
        };
        while let Some(line) = rx.recv().await {
            if let Err(e) = log.append(&line).await {
                tracing::debug!(path = %path.display(), error = %e, "worker log write failed");
            }
        }
        let _ = log.file.flush().await;
    });
    tx
}

/// Console log of one job run. Each segment opens with a banner naming the
/// job, tenant and key; full segments roll to `<name>.1` .. `<name>.<keep>`.
struct JobLog {
    path: PathBuf,
    banner: String,
    max_bytes: u64,
    keep: usize,
    segment: usize,
    written: u64,
    file: tokio::fs::File,
}

impl JobLog {
    async fn create(path: PathBuf, banner: String, max_bytes: u64, keep: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        let mut log = Self {
            path,
            banner,
            max_bytes,
            keep: keep.max(1),
            segment: 0,
            written: 0,
            file,
        };
        log.write_banner().await?;
        Ok(log)
    }

    fn segment_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    async fn write_banner(&mut self) -> std::io::Result<()> {
        let line = match self.segment {
            0 => format!("=== {} ===\n", self.banner),
            n => format!("=== {} segment={n} ===\n", self.banner),
        };
        self.file.write_all(line.as_bytes()).await?;
        self.written = line.len() as u64;
        Ok(())
    }

    async fn roll(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        let _ = tokio::fs::remove_file(self.segment_path(self.keep)).await;
        for n in (1..self.keep).rev() {
            let _ = tokio::fs::rename(self.segment_path(n), self.segment_path(n + 1)).await;
        }
        tokio::fs::rename(&self.path, self.segment_path(1)).await?;
        self.file = tokio::fs::File::create(&self.path).await?;
        self.segment += 1;
        self.write_banner().await
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let line = line.trim_end_matches('\n');
        let len = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.written.saturating_add(len) > self.max_bytes {
            if let Err(e) = self.roll().await {
                tracing::debug!(path = %self.path.display(), error = %e, "worker log rotation failed");
            }
        }
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.written = self.written.saturating_add(len);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Debug, Clone, Copy)]
    pub enum Behavior {
        /// Runs until cancelled.
        UntilCancelled,
        /// Exits with status 0 right away.
        Immediate,
        /// Refuses to start.
        Fail,
    }

    /// In-memory spawner that records what it was asked to start.
    #[derive(Clone)]
    pub struct FakeSpawner {
        behavior: Behavior,
        pub spawned: Arc<AtomicUsize>,
        pub specs: Arc<Mutex<Vec<WorkerSpec>>>,
    }

    impl FakeSpawner {
        pub fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                spawned: Arc::new(AtomicUsize::new(0)),
                specs: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn spawned(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl WorkerSpawner for FakeSpawner {
        async fn spawn(
            &self,
            spec: WorkerSpec,
            cancel: CancellationToken,
        ) -> Result<RunningWorker, LaunchError> {
            if let Behavior::Fail = self.behavior {
                return Err(LaunchError::Spawn {
                    program: PathBuf::from("fake-crawler"),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary"),
                });
            }
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().unwrap().push(spec);
            let behavior = self.behavior;
            Ok(RunningWorker::new(Some(4242), async move {
                match behavior {
                    Behavior::UntilCancelled => {
                        cancel.cancelled().await;
                        WorkerExit {
                            code: None,
                            cancelled: true,
                            error: None,
                        }
                    }
                    _ => WorkerExit {
                        code: Some(0),
                        cancelled: false,
                        error: None,
                    },
                }
            }))
        }
    }
}
