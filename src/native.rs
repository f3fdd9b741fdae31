use crate::{
    engine::{BootConfig, ProcessControl, RuntimeBooter, RuntimeInstance, ServerReady, SpawnedProcess},
    tree::{MountEntry, MountTree},
};
use anyhow::{bail, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use uuid::Uuid;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").unwrap());

static LOCAL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bhttps?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d{2,5})\b").unwrap()
});

/// Pick a local server URL out of a line of dev-server output.
///
/// Dev servers print their address in many shapes (`Local: http://localhost:3000/`,
/// `ready - started server on 0.0.0.0:3000, url: http://localhost:3000`); the
/// reported URL is always normalized to `http://localhost:{port}`.
pub fn detect_server_url(line: &str) -> Option<ServerReady> {
    let plain = ANSI_ESCAPE.replace_all(line, "");
    let caps = LOCAL_URL.captures(&plain)?;
    let port: u16 = caps.get(1)?.as_str().parse().ok()?;
    Some(ServerReady {
        port,
        url: format!("http://localhost:{port}"),
    })
}

/// Boots runtimes as scratch directories on the host, running processes
/// with the host's toolchain.
pub struct NativeRuntimeBooter {
    required_programs: Vec<String>,
    env: Vec<(String, String)>,
}

impl Default for NativeRuntimeBooter {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRuntimeBooter {
    /// Requires `node` and `npm` on PATH
    pub fn new() -> Self {
        Self::with_required_programs(["node", "npm"])
    }

    pub fn with_required_programs<I, S>(programs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_programs: programs.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    /// Extra environment for every process spawned in booted instances
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl RuntimeBooter for NativeRuntimeBooter {
    async fn boot(&self, config: &BootConfig) -> anyhow::Result<Arc<dyn RuntimeInstance>> {
        for program in &self.required_programs {
            which::which(program).with_context(|| format!("`{program}` was not found on PATH"))?;
        }

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", config.workdir_name))
            .tempdir()
            .context("failed to create the runtime working directory")?;

        let instance = NativeInstance::new(dir, self.env.clone());
        tracing::info!(id = %instance.id, root = %instance.root.display(), "native runtime booted");
        Ok(Arc::new(instance))
    }

    fn name(&self) -> &str {
        "native"
    }
}

/// One scratch working directory plus the processes started in it
pub struct NativeInstance {
    id: Uuid,
    root: PathBuf,
    dir: Mutex<Option<TempDir>>,
    env: Vec<(String, String)>,
    ready_tx: broadcast::Sender<ServerReady>,
    processes: Mutex<Vec<Arc<NativeProcess>>>,
}

impl NativeInstance {
    fn new(dir: TempDir, env: Vec<(String, String)>) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            id: Uuid::new_v4(),
            root: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
            env,
            ready_tx,
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a runtime path onto the host, refusing anything that escapes the root
    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        resolve_under(&self.root, path)
    }
}

fn resolve_under(root: &Path, path: &str) -> anyhow::Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("path {path:?} escapes the runtime working directory")
            }
        }
    }
    Ok(resolved)
}

#[async_trait]
impl RuntimeInstance for NativeInstance {
    async fn mount(&self, tree: &MountTree) -> anyhow::Result<()> {
        let mut pending: Vec<(PathBuf, &MountTree)> = vec![(self.root.clone(), tree)];
        while let Some((dir, level)) = pending.pop() {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
            for (name, entry) in &level.0 {
                let target = dir.join(name);
                match entry {
                    MountEntry::File { contents } => tokio::fs::write(&target, contents)
                        .await
                        .with_context(|| format!("writing {}", target.display()))?,
                    MountEntry::Directory(children) => pending.push((target, children)),
                }
            }
        }
        Ok(())
    }

    async fn spawn(&self, program: &str, args: &[String]) -> anyhow::Result<SpawnedProcess> {
        let executable =
            which::which(program).with_context(|| format!("`{program}` was not found on PATH"))?;

        let mut cmd = Command::new(executable);
        cmd.args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        // Own process group so the whole tree can be signalled at once
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start `{program}`"))?;

        let (out_tx, output) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, out_tx.clone(), self.ready_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, out_tx, self.ready_tx.clone());
        }

        let process = Arc::new(NativeProcess {
            pid: child.id(),
            kill_requested: Notify::new(),
            exited: AtomicBool::new(false),
        });
        tracing::debug!(program, pid = ?process.pid, "spawned");

        let (exit_tx, exit) = oneshot::channel();
        let waiter = process.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    waiter.exited.store(true, Ordering::SeqCst);
                    match status {
                        Ok(status) => {
                            let _ = exit_tx.send(status.code().unwrap_or(-1));
                        }
                        Err(e) => tracing::warn!(error = %e, "failed waiting on child"),
                    }
                }
                _ = waiter.kill_requested.notified() => {
                    waiter.signal_group();
                    let _ = child.kill().await;
                    waiter.exited.store(true, Ordering::SeqCst);
                }
            }
        });

        {
            let mut processes = self.processes.lock();
            processes.retain(|p| !p.exited.load(Ordering::SeqCst));
            processes.push(process.clone());
        }

        Ok(SpawnedProcess {
            output,
            exit,
            control: process,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        let target = self.resolve(path)?;
        tokio::fs::read_to_string(&target)
            .await
            .with_context(|| format!("reading {}", target.display()))
    }

    async fn write_file(&self, path: &str, contents: &str) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::write(&target, contents)
            .await
            .with_context(|| format!("writing {}", target.display()))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        let result = if recursive {
            tokio::fs::create_dir_all(&target).await
        } else {
            tokio::fs::create_dir(&target).await
        };
        result.with_context(|| format!("creating {}", target.display()))
    }

    async fn teardown(&self) {
        let processes = std::mem::take(&mut *self.processes.lock());
        for process in processes {
            process.kill();
        }

        let dir = self.dir.lock().take();
        if let Some(dir) = dir {
            let id = self.id;
            match tokio::task::spawn_blocking(move || dir.close()).await {
                Ok(Ok(())) => tracing::debug!(%id, "working directory removed"),
                Ok(Err(e)) => tracing::warn!(%id, error = %e, "failed to remove working directory"),
                Err(e) => tracing::warn!(%id, error = %e, "cleanup task failed"),
            }
        }
    }
}

fn pump_lines<R>(reader: R, out: mpsc::UnboundedSender<String>, ready: broadcast::Sender<ServerReady>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(event) = detect_server_url(&line) {
                let _ = ready.send(event);
            }
            let _ = out.send(line);
        }
    });
}

struct NativeProcess {
    pid: Option<u32>,
    kill_requested: Notify,
    exited: AtomicBool,
}

impl NativeProcess {
    #[cfg(unix)]
    fn signal_group(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "process group already gone");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&self) {}
}

impl ProcessControl for NativeProcess {
    fn kill(&self) {
        if !self.exited.load(Ordering::SeqCst) {
            self.kill_requested.notify_one();
        }
    }
}
