//! Scriptable in-memory runtime used by the manager tests.

use crate::engine::{
    BootConfig, ProcessControl, RuntimeBooter, RuntimeInstance, ServerReady, SpawnedProcess,
};
use crate::tree::{MountEntry, MountTree};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeScript {
    /// Boot attempts that fail before one succeeds (`usize::MAX` = always)
    pub failing_boots: usize,
    pub boot_delay: Duration,
    /// Emitted after any non-install process is spawned
    pub ready: Option<(u16, String, Duration)>,
    pub install_exit: i32,
    pub install_delay: Duration,
    pub fail_mount: bool,
    pub mount_delay: Duration,
    /// Server processes exit on their own after the delay
    pub server_exit: Option<(Duration, i32)>,
}

pub(crate) struct FakeBooter {
    script: FakeScript,
    boots: AtomicUsize,
    boot_times: Mutex<Vec<Instant>>,
    instances: Mutex<Vec<Arc<FakeInstance>>>,
}

impl FakeBooter {
    pub fn new(script: FakeScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            boots: AtomicUsize::new(0),
            boot_times: Mutex::new(Vec::new()),
            instances: Mutex::new(Vec::new()),
        })
    }

    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn boot_times(&self) -> Vec<Instant> {
        self.boot_times.lock().clone()
    }

    pub fn instance(&self, index: usize) -> Arc<FakeInstance> {
        self.instances.lock()[index].clone()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }
}

#[async_trait]
impl RuntimeBooter for FakeBooter {
    async fn boot(&self, _config: &BootConfig) -> anyhow::Result<Arc<dyn RuntimeInstance>> {
        let attempt = self.boots.fetch_add(1, Ordering::SeqCst) + 1;
        self.boot_times.lock().push(Instant::now());
        if !self.script.boot_delay.is_zero() {
            tokio::time::sleep(self.script.boot_delay).await;
        }
        if attempt <= self.script.failing_boots {
            anyhow::bail!("boot attempt {attempt} failed");
        }
        let instance = Arc::new(FakeInstance::new(self.script.clone()));
        self.instances.lock().push(instance.clone());
        Ok(instance)
    }

    fn name(&self) -> &str {
        "fake"
    }
}

pub(crate) struct FakeInstance {
    script: FakeScript,
    ready_tx: broadcast::Sender<ServerReady>,
    files: Mutex<HashMap<String, String>>,
    dirs: Mutex<HashSet<String>>,
    mounts: Mutex<Vec<MountTree>>,
    spawned: Mutex<Vec<(String, Instant)>>,
    kills: Arc<AtomicUsize>,
    teardowns: AtomicUsize,
}

impl FakeInstance {
    fn new(script: FakeScript) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            script,
            ready_tx,
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashSet::new()),
            mounts: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            kills: Arc::new(AtomicUsize::new(0)),
            teardowns: AtomicUsize::new(0),
        }
    }

    pub fn emit_ready(&self, port: u16, url: &str) {
        let _ = self.ready_tx.send(ServerReady {
            port,
            url: url.to_string(),
        });
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().get(normalize(path)).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().contains(normalize(path))
    }

    pub fn mounts(&self) -> Vec<MountTree> {
        self.mounts.lock().clone()
    }

    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().iter().map(|(line, _)| line.clone()).collect()
    }

    /// Spawned command lines with the instant each was started
    pub fn spawn_log(&self) -> Vec<(String, Instant)> {
        self.spawned.lock().clone()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    fn flatten(&self, prefix: &str, tree: &MountTree) {
        for (name, entry) in &tree.0 {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            match entry {
                MountEntry::File { contents } => {
                    self.files.lock().insert(path, contents.clone());
                }
                MountEntry::Directory(dir) => {
                    self.dirs.lock().insert(path.clone());
                    self.flatten(&path, dir);
                }
            }
        }
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./").trim_start_matches('/')
}

struct FakeProcess {
    exit: Mutex<Option<oneshot::Sender<i32>>>,
    kills: Arc<AtomicUsize>,
}

impl FakeProcess {
    fn finish(&self, code: i32) {
        if let Some(tx) = self.exit.lock().take() {
            let _ = tx.send(code);
        }
    }
}

impl ProcessControl for FakeProcess {
    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender resolves `exit` with an error
        self.exit.lock().take();
    }
}

#[async_trait]
impl RuntimeInstance for FakeInstance {
    async fn mount(&self, tree: &MountTree) -> anyhow::Result<()> {
        if !self.script.mount_delay.is_zero() {
            tokio::time::sleep(self.script.mount_delay).await;
        }
        if self.script.fail_mount {
            anyhow::bail!("EIO: mount rejected");
        }
        self.mounts.lock().push(tree.clone());
        self.flatten("", tree);
        Ok(())
    }

    async fn spawn(&self, program: &str, args: &[String]) -> anyhow::Result<SpawnedProcess> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.spawned.lock().push((line.clone(), Instant::now()));

        let (out_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let _ = out_tx.send(format!("> {line}"));
        let control = Arc::new(FakeProcess {
            exit: Mutex::new(Some(exit_tx)),
            kills: self.kills.clone(),
        });

        if line == "npm install" {
            let code = self.script.install_exit;
            if self.script.install_delay.is_zero() {
                control.finish(code);
            } else {
                let control = control.clone();
                let delay = self.script.install_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    control.finish(code);
                });
            }
        } else {
            if let Some((port, url, delay)) = self.script.ready.clone() {
                let tx = self.ready_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(ServerReady { port, url });
                });
            }
            if let Some((delay, code)) = self.script.server_exit {
                let control = control.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    control.finish(code);
                });
            }
        }

        Ok(SpawnedProcess {
            output,
            exit,
            control,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        self.file(path)
            .ok_or_else(|| anyhow::anyhow!("ENOENT: no such file, open '{path}'"))
    }

    async fn write_file(&self, path: &str, contents: &str) -> anyhow::Result<()> {
        self.files
            .lock()
            .insert(normalize(path).to_string(), contents.to_string());
        Ok(())
    }

    async fn mkdir(&self, path: &str, _recursive: bool) -> anyhow::Result<()> {
        self.dirs.lock().insert(normalize(path).to_string());
        Ok(())
    }

    async fn teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}
