//! Shared lifecycle of the preview runtime.
//!
//! One [`SandboxRuntimeManager`] owns at most one booted runtime instance at
//! a time. Consumers lease it with [`SandboxRuntimeManager::acquire`] and
//! give it back with [`SandboxRuntimeManager::release`]; the instance is
//! torn down when the last lease is returned.
//!
//! ```text
//! Uninitialized -> Booting -> Ready -> ServerStarting -> ServerRunning
//!       ^             |         |                             |
//!       +-- failure --+         +------> TearingDown <--------+
//! ```
//!
//! Concurrent `acquire` calls made while a boot is running attach to that
//! boot instead of starting another one, and all of them observe its result.

use crate::{
    config::{ManagerConfig, PreviewOptions, MANIFEST_FILE},
    engine::{BootConfig, ProcessControl, RuntimeBooter, RuntimeInstance, ServerReady, SpawnedProcess},
    errors::{describe_boot_fault, PreviewError, Result},
    status::{LifecyclePhase, ServerStatus, StatusCallback, StatusHub, Subscription},
    tree::{MountTree, VirtualFileNode},
};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tracing::{debug, info, warn};

/// A consumer's lease on the shared runtime.
///
/// Every consumer attached to the same boot holds a handle with the same
/// [`generation`](RuntimeHandle::generation). Give it back with
/// [`SandboxRuntimeManager::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "release the handle once the runtime is no longer needed"]
pub struct RuntimeHandle {
    generation: u64,
}

impl RuntimeHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone)]
enum BootOutcome {
    Ready(u64),
    Failed(PreviewError),
}

enum Slot {
    Empty,
    Booting(watch::Receiver<Option<BootOutcome>>),
    Live(Arc<LiveRuntime>),
    TearingDown(watch::Receiver<bool>),
}

struct State {
    slot: Slot,
    ref_count: usize,
    generation: u64,
}

enum Pending {
    Start {
        generation: u64,
        done: watch::Sender<Option<BootOutcome>>,
        outcome: watch::Receiver<Option<BootOutcome>>,
    },
    Boot {
        generation: u64,
        outcome: watch::Receiver<Option<BootOutcome>>,
    },
    Teardown(watch::Receiver<bool>),
}

struct ActiveServer {
    id: u64,
    port: u16,
    control: Arc<dyn ProcessControl>,
}

#[derive(Default)]
struct Processes {
    install: Option<Arc<dyn ProcessControl>>,
    server: Option<ActiveServer>,
    next_server_id: u64,
}

/// A booted instance plus the bookkeeping tied to it
struct LiveRuntime {
    generation: u64,
    instance: Arc<dyn RuntimeInstance>,
    disposed: watch::Sender<bool>,
    in_flight: AtomicUsize,
    idle: Notify,
    install_pending: AtomicBool,
    /// Held for the whole install so concurrent starts wait for it
    install_lock: tokio::sync::Mutex<()>,
    processes: Mutex<Processes>,
}

impl LiveRuntime {
    fn new(generation: u64, instance: Arc<dyn RuntimeInstance>) -> Self {
        let (disposed, _) = watch::channel(false);
        Self {
            generation,
            instance,
            disposed,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            install_pending: AtomicBool::new(true),
            install_lock: tokio::sync::Mutex::new(()),
            processes: Mutex::new(Processes::default()),
        }
    }

    fn is_disposed(&self) -> bool {
        *self.disposed.borrow()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(PreviewError::HandleDisposed)
        } else {
            Ok(())
        }
    }

    /// Register an in-flight operation; teardown waits for these to finish.
    fn begin_op(self: &Arc<Self>) -> Result<OpGuard> {
        // Count first so a concurrent teardown cannot miss us
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = OpGuard {
            runtime: self.clone(),
        };
        self.ensure_live()?;
        Ok(guard)
    }

    fn dispose(&self) {
        self.disposed.send_replace(true);
    }

    async fn disposed_signal(&self) {
        let mut rx = self.disposed.subscribe();
        let _ = rx.wait_for(|disposed| *disposed).await;
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn set_install(&self, control: Option<Arc<dyn ProcessControl>>) {
        self.processes.lock().install = control;
    }

    fn stop_server(&self) {
        let previous = self.processes.lock().server.take();
        if let Some(server) = previous {
            debug!(port = server.port, "stopping previous dev server");
            server.control.kill();
        }
    }

    fn register_server(&self, port: u16, control: Arc<dyn ProcessControl>) -> u64 {
        let mut processes = self.processes.lock();
        processes.next_server_id += 1;
        let id = processes.next_server_id;
        processes.server = Some(ActiveServer { id, port, control });
        id
    }

    /// Forget the server if it is still the active one
    fn clear_server_if(&self, id: u64) -> bool {
        let mut processes = self.processes.lock();
        match &processes.server {
            Some(server) if server.id == id => {
                processes.server = None;
                true
            }
            _ => false,
        }
    }

    fn active_port(&self) -> Option<u16> {
        self.processes.lock().server.as_ref().map(|s| s.port)
    }

    fn kill_all(&self) {
        let mut processes = self.processes.lock();
        if let Some(install) = processes.install.take() {
            install.kill();
        }
        if let Some(server) = processes.server.take() {
            server.control.kill();
        }
    }
}

struct OpGuard {
    runtime: Arc<LiveRuntime>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if self.runtime.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.runtime.idle.notify_waiters();
        }
    }
}

struct Shared {
    booter: Arc<dyn RuntimeBooter>,
    config: ManagerConfig,
    state: Mutex<State>,
    status: Mutex<ServerStatus>,
    /// Serializes apply-and-notify so subscribers see snapshots in order.
    /// Reentrant because callbacks may run nested updates on the same thread.
    dispatch: ReentrantMutex<()>,
    hub: Arc<StatusHub>,
}

type Teardown = (Arc<LiveRuntime>, watch::Sender<bool>);

impl Shared {
    fn update_status(&self, apply: impl FnOnce(&mut ServerStatus)) {
        let _dispatch = self.dispatch.lock();
        let snapshot = {
            let mut status = self.status.lock();
            apply(&mut status);
            status.clone()
        };
        self.hub.notify(&snapshot);
    }

    /// Like `update_status`, but dropped once `live` has been disposed so a
    /// late operation cannot overwrite the reset status of a torn-down runtime.
    fn update_live(&self, live: &LiveRuntime, apply: impl FnOnce(&mut ServerStatus)) {
        let _dispatch = self.dispatch.lock();
        let snapshot = {
            let mut status = self.status.lock();
            if live.is_disposed() {
                return;
            }
            apply(&mut status);
            status.clone()
        };
        self.hub.notify(&snapshot);
    }

    fn record_failure(&self, live: Option<&LiveRuntime>, err: PreviewError) -> PreviewError {
        if err == PreviewError::HandleDisposed {
            return err;
        }
        let message = err.to_string();
        match live {
            Some(live) => self.update_live(live, |s| s.last_error = Some(message)),
            None => self.update_status(|s| s.last_error = Some(message)),
        }
        err
    }

    /// Give back one lease of `generation`. Returns the runtime to tear down
    /// when that was the last lease on a live runtime.
    fn drop_lease(&self, generation: u64) -> Option<Teardown> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let live = match &state.slot {
            Slot::Live(live) if live.generation == generation => live.clone(),
            Slot::Booting(_) if state.generation == generation => {
                state.ref_count = state.ref_count.saturating_sub(1);
                debug!(generation, ref_count = state.ref_count, "waiter left before the boot settled");
                return None;
            }
            _ => {
                debug!(generation, "ignoring release of a stale handle");
                return None;
            }
        };
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count > 0 {
            debug!(generation, ref_count = state.ref_count, "runtime released");
            return None;
        }
        Some(begin_teardown(state, live))
    }

    fn live_or(&self, missing: PreviewError) -> Result<Arc<LiveRuntime>> {
        match &self.state.lock().slot {
            Slot::Live(live) => Ok(live.clone()),
            Slot::TearingDown(_) => Err(PreviewError::HandleDisposed),
            Slot::Empty | Slot::Booting(_) => Err(missing),
        }
    }

    async fn boot_with_retry(&self) -> Result<Arc<dyn RuntimeInstance>> {
        let boot_config = BootConfig {
            workdir_name: self.config.workdir_name.clone(),
        };
        let attempts = self.config.max_boot_attempts.max(1);
        let attempt_timeout = self.config.boot_attempt_timeout();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result =
                match tokio::time::timeout(attempt_timeout, self.booter.boot(&boot_config)).await {
                    Ok(result) => result.map_err(|e| describe_boot_fault(&e)),
                    Err(_) => Err(format!("boot attempt timed out after {attempt_timeout:?}")),
                };

            match result {
                Ok(instance) => {
                    if attempt > 1 {
                        info!(attempt, "runtime booted after retrying");
                    }
                    return Ok(instance);
                }
                Err(message) => {
                    warn!(attempt, attempts, error = %message, "runtime boot attempt failed");
                    last_error = message;
                    if attempt < attempts {
                        let delay = self.config.backoff_delay(attempt);
                        debug!(?delay, "backing off before next boot attempt");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(PreviewError::BootFailure {
            attempts,
            message: last_error,
        })
    }

    async fn run_boot(
        self: Arc<Self>,
        generation: u64,
        done: watch::Sender<Option<BootOutcome>>,
    ) {
        let outcome = match self.boot_with_retry().await {
            Ok(instance) => {
                let live = Arc::new(LiveRuntime::new(generation, instance));
                let (ref_count, orphaned) = {
                    let mut guard = self.state.lock();
                    let state = &mut *guard;
                    let orphaned = if state.ref_count == 0 {
                        Some(begin_teardown(state, live.clone()))
                    } else {
                        state.slot = Slot::Live(live.clone());
                        None
                    };
                    (state.ref_count, orphaned)
                };
                info!(generation, ref_count, booter = self.booter.name(), "runtime ready");
                self.update_status(|s| {
                    s.set_phase(LifecyclePhase::Ready);
                    s.files_ready = false;
                    s.last_error = None;
                });
                match orphaned {
                    Some((live, done)) => {
                        warn!(generation, "every waiter left before the boot settled");
                        tokio::spawn(self.clone().teardown(live, done));
                    }
                    None => {
                        tokio::spawn(self.clone().watch_server_ready(live));
                    }
                }
                BootOutcome::Ready(generation)
            }
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    state.slot = Slot::Empty;
                    state.ref_count = 0;
                }
                warn!(generation, error = %err, "giving up on runtime boot");
                let message = err.to_string();
                self.update_status(|s| {
                    *s = ServerStatus::default();
                    s.last_error = Some(message);
                });
                BootOutcome::Failed(err)
            }
        };
        done.send_replace(Some(outcome));
    }

    async fn teardown(self: Arc<Self>, live: Arc<LiveRuntime>, done: watch::Sender<bool>) {
        let generation = live.generation;
        info!(generation, "last consumer released the runtime, tearing down");
        self.update_status(|s| s.set_phase(LifecyclePhase::TearingDown));
        live.dispose();

        let grace = self.config.teardown_grace();
        if tokio::time::timeout(grace, live.wait_idle()).await.is_err() {
            warn!(
                generation,
                ?grace,
                in_flight = live.in_flight.load(Ordering::SeqCst),
                "operations still in flight after the teardown grace period"
            );
        }

        live.kill_all();
        live.instance.teardown().await;

        // Reset before the slot opens up, so a fresh boot's status is never overwritten
        self.update_status(|s| *s = ServerStatus::default());
        self.state.lock().slot = Slot::Empty;
        done.send_replace(true);
        info!(generation, "runtime torn down");
    }

    /// Marks the server running when a late notification arrives for the
    /// active port, e.g. after `wait_for_port: false` or a timed-out start.
    async fn watch_server_ready(self: Arc<Self>, live: Arc<LiveRuntime>) {
        let mut events = live.instance.server_ready();
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = live.disposed_signal() => break,
            };
            match event {
                Ok(ServerReady { port, url }) => {
                    if live.active_port() != Some(port) {
                        debug!(port, "server-ready for an inactive port");
                        continue;
                    }
                    info!(port, %url, "dev server ready");
                    self.update_live(&live, |s| {
                        s.set_phase(LifecyclePhase::ServerRunning);
                        s.server_url = Some(url);
                        s.server_port = Some(port);
                        s.last_error = None;
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "server-ready watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn watch_server_exit(
        self: &Arc<Self>,
        live: Arc<LiveRuntime>,
        server_id: u64,
        exit: oneshot::Receiver<i32>,
    ) {
        let shared = self.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                code = exit => code,
                _ = live.disposed_signal() => return,
            };
            // Killed on purpose when replaced or torn down
            if !live.clear_server_if(server_id) {
                return;
            }
            let message = match code {
                Ok(code) => format!("dev server exited with code {code}"),
                Err(_) => "dev server was terminated".to_string(),
            };
            warn!(generation = live.generation, "{message}");
            shared.update_live(&live, |s| {
                s.set_phase(LifecyclePhase::Ready);
                s.server_url = None;
                s.server_port = None;
                s.last_error = Some(message);
            });
        });
    }
}

/// Process-wide owner of the shared preview runtime.
///
/// Cheap to clone; clones share the same runtime and status.
#[derive(Clone)]
pub struct SandboxRuntimeManager {
    shared: Arc<Shared>,
}

impl SandboxRuntimeManager {
    pub fn new(booter: Arc<dyn RuntimeBooter>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                booter,
                config,
                state: Mutex::new(State {
                    slot: Slot::Empty,
                    ref_count: 0,
                    generation: 0,
                }),
                status: Mutex::new(ServerStatus::default()),
                dispatch: ReentrantMutex::new(()),
                hub: Arc::new(StatusHub::default()),
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Current status snapshot
    pub fn status(&self) -> ServerStatus {
        self.shared.status.lock().clone()
    }

    /// Number of outstanding leases
    pub fn ref_count(&self) -> usize {
        self.shared.state.lock().ref_count
    }

    /// Lease the shared runtime, booting it if nobody holds it yet.
    pub async fn acquire(&self) -> Result<RuntimeHandle> {
        loop {
            let pending = {
                let mut guard = self.shared.state.lock();
                let state = &mut *guard;
                match &state.slot {
                    Slot::Live(live) => {
                        let generation = live.generation;
                        state.ref_count += 1;
                        debug!(generation, ref_count = state.ref_count, "attached to live runtime");
                        return Ok(RuntimeHandle { generation });
                    }
                    Slot::Booting(outcome) => {
                        let outcome = outcome.clone();
                        state.ref_count += 1;
                        debug!(ref_count = state.ref_count, "attached to in-flight boot");
                        Pending::Boot {
                            generation: state.generation,
                            outcome,
                        }
                    }
                    Slot::TearingDown(done) => Pending::Teardown(done.clone()),
                    Slot::Empty => {
                        state.generation += 1;
                        let (done, outcome) = watch::channel(None);
                        state.slot = Slot::Booting(outcome.clone());
                        state.ref_count = 1;
                        Pending::Start {
                            generation: state.generation,
                            done,
                            outcome,
                        }
                    }
                }
            };

            match pending {
                Pending::Teardown(mut done) => {
                    debug!("waiting for teardown before booting a fresh runtime");
                    let _ = done.wait_for(|finished| *finished).await;
                }
                Pending::Boot {
                    generation,
                    outcome,
                } => {
                    let lease = PendingLease::new(&self.shared, generation);
                    let result = Self::await_boot(outcome).await;
                    lease.disarm();
                    return result;
                }
                Pending::Start {
                    generation,
                    done,
                    outcome,
                } => {
                    let lease = PendingLease::new(&self.shared, generation);
                    info!(generation, booter = self.shared.booter.name(), "booting runtime");
                    self.shared.update_status(|s| {
                        s.set_phase(LifecyclePhase::Booting);
                        s.last_error = None;
                    });
                    // Owned by a task so the boot completes even if this caller goes away
                    tokio::spawn(self.shared.clone().run_boot(generation, done));
                    let result = Self::await_boot(outcome).await;
                    lease.disarm();
                    return result;
                }
            }
        }
    }

    async fn await_boot(mut outcome: watch::Receiver<Option<BootOutcome>>) -> Result<RuntimeHandle> {
        let settled = outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|settled| (*settled).clone());
        match settled {
            Some(BootOutcome::Ready(generation)) => Ok(RuntimeHandle { generation }),
            Some(BootOutcome::Failed(err)) => Err(err),
            None => Err(PreviewError::InternalError(
                "boot task ended without reporting an outcome".to_string(),
            )),
        }
    }

    /// Return a lease. The last one tears the runtime down.
    pub async fn release(&self, handle: RuntimeHandle) {
        let Some((live, done)) = self.shared.drop_lease(handle.generation) else {
            return;
        };

        let teardown = tokio::spawn(self.shared.clone().teardown(live, done));
        if let Err(e) = teardown.await {
            warn!(error = %e, "teardown task failed");
        }
    }

    /// Mount a whole project tree into the runtime.
    pub async fn mount_files(&self, nodes: &[VirtualFileNode]) -> Result<()> {
        let live = self
            .shared
            .live_or(PreviewError::MountFailure("runtime has not been booted".to_string()))
            .map_err(|e| self.shared.record_failure(None, e))?;
        let _op = live.begin_op()?;

        let tree = MountTree::from_nodes(nodes).map_err(|e| {
            self.shared
                .record_failure(Some(live.as_ref()), PreviewError::MountFailure(e.to_string()))
        })?;

        self.shared.update_live(&live, |s| s.files_ready = false);
        let files = tree.file_count();
        debug!(files, "mounting project tree");

        if let Err(e) = live.instance.mount(&tree).await {
            live.ensure_live()?;
            return Err(self
                .shared
                .record_failure(Some(live.as_ref()), PreviewError::MountFailure(format!("{e:#}"))));
        }
        live.ensure_live()?;

        live.install_pending.store(true, Ordering::SeqCst);
        self.shared.update_live(&live, |s| {
            s.files_ready = true;
            s.last_error = None;
        });
        info!(files, "project tree mounted");
        Ok(())
    }

    /// Install dependencies, (re)start the dev server and return its URL.
    pub async fn start_server(&self, options: PreviewOptions) -> Result<String> {
        let live = self.shared.live_or(PreviewError::NotBooted)?;
        let _op = live.begin_op()?;

        if !self.status().files_ready {
            return Err(self
                .shared
                .record_failure(Some(live.as_ref()), PreviewError::FilesNotMounted));
        }

        let config = &self.shared.config;
        let port = options.port.unwrap_or(config.default_port);
        let command = options
            .command
            .unwrap_or_else(|| config.default_command.clone());
        let wait_for_port = options.wait_for_port.unwrap_or(true);
        let (program, args) = split_command(&command)
            .map_err(|e| self.shared.record_failure(Some(live.as_ref()), e))?;

        self.shared.update_live(&live, |s| {
            s.set_phase(LifecyclePhase::ServerStarting);
            s.server_url = None;
            s.server_port = Some(port);
            s.last_error = None;
        });

        self.ensure_manifest(&live).await;
        live.ensure_live()?;
        self.install_dependencies(&live).await?;

        live.stop_server();
        // Subscribe before spawning so a fast server cannot be missed
        let mut ready = live.instance.server_ready();

        info!(%command, port, "starting dev server");
        let SpawnedProcess {
            output,
            exit,
            control,
        } = match live.instance.spawn(&program, &args).await {
            Ok(process) => process,
            Err(e) => {
                live.ensure_live()?;
                return Err(self.fail_start(
                    &live,
                    PreviewError::SpawnFailure {
                        command,
                        message: format!("{e:#}"),
                    },
                ));
            }
        };
        if live.is_disposed() {
            control.kill();
            return Err(PreviewError::HandleDisposed);
        }

        let server_id = live.register_server(port, control);
        spawn_output_logger(live.generation, "server", output);
        self.shared.watch_server_exit(live.clone(), server_id, exit);

        if !wait_for_port {
            let url = format!("http://localhost:{port}");
            debug!(%url, "not waiting for server-ready, returning optimistic URL");
            self.shared.update_live(&live, |s| {
                s.set_phase(LifecyclePhase::ServerRunning);
                s.server_url = Some(url.clone());
            });
            return Ok(url);
        }

        let timeout = config.server_ready_timeout();
        let waited = tokio::time::timeout(timeout, async {
            tokio::select! {
                url = wait_for_port_ready(&mut ready, port) => url,
                _ = live.disposed_signal() => Err(PreviewError::HandleDisposed),
            }
        })
        .await;

        match waited {
            Ok(Ok(url)) => {
                live.ensure_live()?;
                self.shared.update_live(&live, |s| {
                    s.set_phase(LifecyclePhase::ServerRunning);
                    s.server_url = Some(url.clone());
                    s.server_port = Some(port);
                    s.last_error = None;
                });
                info!(port, %url, "preview available");
                Ok(url)
            }
            Ok(Err(e)) => Err(self.fail_start(&live, e)),
            Err(_) => {
                warn!(port, ?timeout, "no server-ready notification before the deadline");
                Err(self.fail_start(&live, PreviewError::ServerStartTimeout { port, timeout }))
            }
        }
    }

    /// Revert to `Ready` and record the error
    fn fail_start(&self, live: &LiveRuntime, err: PreviewError) -> PreviewError {
        if err == PreviewError::HandleDisposed {
            return err;
        }
        let message = err.to_string();
        self.shared.update_live(live, |s| {
            s.set_phase(LifecyclePhase::Ready);
            s.server_url = None;
            s.server_port = None;
            s.last_error = Some(message);
        });
        err
    }

    async fn ensure_manifest(&self, live: &LiveRuntime) {
        if live.instance.read_file(MANIFEST_FILE).await.is_ok() {
            return;
        }
        let manifest = match serde_json::to_string_pretty(&self.shared.config.default_manifest) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "default manifest is not serializable");
                return;
            }
        };
        match live.instance.write_file(MANIFEST_FILE, &manifest).await {
            Ok(()) => info!("no {MANIFEST_FILE} mounted, wrote the default manifest"),
            Err(e) => warn!(error = %format!("{e:#}"), "could not write the default manifest"),
        }
    }

    /// Runs once per mount. Never fails the start except on disposal.
    async fn install_dependencies(&self, live: &Arc<LiveRuntime>) -> Result<()> {
        let Some(command) = self.shared.config.install_command.as_deref() else {
            return Ok(());
        };
        let _installing = tokio::select! {
            guard = live.install_lock.lock() => guard,
            _ = live.disposed_signal() => return Err(PreviewError::HandleDisposed),
        };
        if !live.install_pending.swap(false, Ordering::SeqCst) {
            debug!("dependencies already installed for this mount");
            return Ok(());
        }
        let (program, args) = match split_command(command) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "skipping dependency install");
                return Ok(());
            }
        };

        info!(command, "installing dependencies");
        let SpawnedProcess {
            output,
            exit,
            control,
        } = match live.instance.spawn(&program, &args).await {
            Ok(process) => process,
            Err(e) => {
                warn!(command, error = %format!("{e:#}"), "install could not start, continuing without it");
                return live.ensure_live();
            }
        };
        live.set_install(Some(control.clone()));
        spawn_output_logger(live.generation, "install", output);

        let install_timeout = self.shared.config.install_timeout();
        let exit = tokio::select! {
            exit = tokio::time::timeout(install_timeout, exit) => exit,
            _ = live.disposed_signal() => return Err(PreviewError::HandleDisposed),
        };
        live.set_install(None);

        match exit {
            Ok(Ok(0)) => info!("dependencies installed"),
            Ok(Ok(code)) => {
                let warning = PreviewError::InstallNonZeroExit(code);
                warn!(%warning, "continuing without a clean install");
            }
            Ok(Err(_)) => warn!("install ended without an exit code, continuing"),
            Err(_) => {
                control.kill();
                warn!(timeout = ?install_timeout, "install timed out, continuing");
            }
        }
        live.ensure_live()
    }

    /// Write one file, creating its parent directory first.
    pub async fn write_file(&self, path: &str, contents: &str) -> Result<()> {
        let live = self.shared.live_or(PreviewError::NotBooted)?;
        let _op = live.begin_op()?;

        let result = async {
            if let Some(parent) = parent_dir(path) {
                live.instance.mkdir(parent, true).await?;
            }
            live.instance.write_file(path, contents).await
        }
        .await;
        live.ensure_live()?;

        result.map_err(|e| {
            self.shared.record_failure(
                Some(live.as_ref()),
                PreviewError::FileWrite {
                    path: path.to_string(),
                    message: format!("{e:#}"),
                },
            )
        })
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let live = self.shared.live_or(PreviewError::NotBooted)?;
        let _op = live.begin_op()?;
        let result = live.instance.read_file(path).await;
        live.ensure_live()?;
        result.map_err(|e| PreviewError::FileRead {
            path: path.to_string(),
            message: format!("{e:#}"),
        })
    }

    /// Register a status callback. It is called once right away with the
    /// current status and then synchronously on every change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ServerStatus) + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        let id = self.shared.hub.add(callback.clone());
        callback(&self.status());
        Subscription::new(id, &self.shared.hub)
    }
}

fn begin_teardown(state: &mut State, live: Arc<LiveRuntime>) -> Teardown {
    let (done, finished) = watch::channel(false);
    state.slot = Slot::TearingDown(finished);
    (live, done)
}

/// Count taken by an `acquire` still waiting on a boot. Dropping it before
/// the boot settles (the caller was cancelled) gives the count back.
struct PendingLease {
    shared: Arc<Shared>,
    generation: u64,
    armed: bool,
}

impl PendingLease {
    fn new(shared: &Arc<Shared>, generation: u64) -> Self {
        Self {
            shared: shared.clone(),
            generation,
            armed: true,
        }
    }

    /// The boot settled and the caller saw the outcome
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some((live, done)) = self.shared.drop_lease(self.generation) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(self.shared.clone().teardown(live, done));
            }
            Err(_) => warn!(generation = self.generation, "no runtime left to tear down an abandoned lease"),
        }
    }
}

async fn wait_for_port_ready(
    events: &mut broadcast::Receiver<ServerReady>,
    port: u16,
) -> Result<String> {
    loop {
        match events.recv().await {
            Ok(ready) if ready.port == port => return Ok(ready.url),
            Ok(ready) => debug!(port = ready.port, expected = port, "server-ready for another port"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "server-ready receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(PreviewError::HandleDisposed),
        }
    }
}

fn spawn_output_logger(generation: u64, process: &'static str, mut output: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        while let Some(line) = output.recv().await {
            debug!(target: "previewbox::process", generation, process, "{}", line.trim_end());
        }
    });
}

fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts
        .next()
        .ok_or_else(|| PreviewError::InvalidCommand(command.to_string()))?;
    Ok((program, parts.collect()))
}

fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let index = trimmed.rfind('/')?;
    let parent = &trimmed[..index];
    (!parent.is_empty()).then_some(parent)
}
