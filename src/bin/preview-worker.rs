//! Line-delimited JSON-RPC front end for the preview runtime manager.
//!
//! Requests arrive on stdin, responses and `status` notifications leave on
//! stdout. Logs go to stderr.

use parking_lot::Mutex;
use previewbox::{
    create_native_manager, ManagerOptions, PreviewError, PreviewOptions, RuntimeHandle,
    SandboxRuntimeManager, Subscription, VirtualFileNode,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
struct WorkerConfig {
    config_path: Option<PathBuf>,
    required_programs: Option<Vec<String>>,
}

impl WorkerConfig {
    fn from_env_and_args() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let mut config_path = std::env::var("PREVIEWBOX_CONFIG").ok().map(PathBuf::from);
        let mut required_programs = std::env::var("PREVIEWBOX_REQUIRED_PROGRAMS")
            .ok()
            .map(|v| split_programs(&v));

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    if let Some(v) = args.get(i + 1) {
                        config_path = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                "--require" => {
                    if let Some(v) = args.get(i + 1) {
                        required_programs = Some(split_programs(v));
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }

        Self {
            config_path,
            required_programs,
        }
    }

    fn manager_options(&self) -> ManagerOptions {
        let mut options = ManagerOptions::from_env();
        options.config_path = self.config_path.clone();
        options.required_programs = self.required_programs.clone();
        options
    }
}

fn split_programs(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Leases handed out to the client, keyed by an id the client echoes back
struct Worker {
    manager: SandboxRuntimeManager,
    leases: Mutex<HashMap<u64, RuntimeHandle>>,
    next_lease: Mutex<u64>,
}

impl Worker {
    fn new(manager: SandboxRuntimeManager) -> Self {
        Self {
            manager,
            leases: Mutex::new(HashMap::new()),
            next_lease: Mutex::new(0),
        }
    }

    async fn release_all(&self) {
        let leases: Vec<RuntimeHandle> = self.leases.lock().drain().map(|(_, h)| h).collect();
        for handle in leases {
            self.manager.release(handle).await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "preview_worker=info,previewbox=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = WorkerConfig::from_env_and_args();
    tracing::info!("preview-worker starting (config={:?})", cfg.config_path);

    let manager = create_native_manager(&cfg.manager_options())?;
    let worker = Arc::new(Worker::new(manager));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(msg) = out_rx.recv().await {
            let line = serde_json::to_string(&msg)?;
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let notifier = out_tx.clone();
    let subscription: Subscription = worker.manager.subscribe(move |status| {
        let _ = notifier.send(json!({
            "jsonrpc": "2.0",
            "method": "status",
            "params": status,
        }));
    });

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid json-rpc line: {} | err={}", line, e);
                continue;
            }
        };

        let method = parsed.get("method").and_then(|m| m.as_str()).unwrap_or("");
        if method == "shutdown" || method == "exit" {
            worker.release_all().await;
            if let Some(id) = parsed.get("id").cloned() {
                let _ = out_tx.send(json!({ "jsonrpc": "2.0", "result": null, "id": id }));
            }
            break;
        }

        // Requests run concurrently so a slow `start` does not block `status` or `release`
        let worker = worker.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            if let Some(response) = handle_message(&worker, parsed).await {
                let _ = out_tx.send(response);
            }
        });
    }

    worker.release_all().await;
    subscription.unsubscribe();
    drop(out_tx);
    writer.await??;
    tracing::info!("preview-worker stopped");
    Ok(())
}

async fn handle_message(worker: &Worker, msg: Value) -> Option<Value> {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = msg.get("id").cloned()?;
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = match method {
        "initialize" => Ok(json!({
            "serverInfo": {
                "name": "previewbox preview-worker",
                "version": env!("CARGO_PKG_VERSION")
            }
        })),
        "acquire" => acquire(worker).await,
        "release" => release(worker, &params).await,
        "mount" => mount(worker, params).await,
        "start" => start(worker, params).await,
        "write_file" => write_file(worker, params).await,
        "read_file" => read_file(worker, params).await,
        "status" => Ok(json!({
            "status": worker.manager.status(),
            "refCount": worker.manager.ref_count(),
        })),
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    Some(match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    })
}

type RpcResult = std::result::Result<Value, Value>;

fn preview_error(err: PreviewError) -> Value {
    json!({
        "code": -32000,
        "message": err.to_string(),
        "data": { "retryable": err.is_retryable() }
    })
}

fn invalid_params(err: serde_json::Error) -> Value {
    json!({ "code": -32602, "message": format!("Invalid params: {err}") })
}

async fn acquire(worker: &Worker) -> RpcResult {
    let handle = worker.manager.acquire().await.map_err(preview_error)?;
    let generation = handle.generation();
    let lease = {
        let mut next = worker.next_lease.lock();
        *next += 1;
        *next
    };
    worker.leases.lock().insert(lease, handle);
    Ok(json!({ "lease": lease, "generation": generation }))
}

async fn release(worker: &Worker, params: &Value) -> RpcResult {
    let lease = params
        .get("lease")
        .and_then(Value::as_u64)
        .ok_or_else(|| json!({ "code": -32602, "message": "Invalid params: missing `lease`" }))?;
    let handle = worker.leases.lock().remove(&lease);
    match handle {
        Some(handle) => {
            worker.manager.release(handle).await;
            Ok(json!({ "released": true }))
        }
        None => Ok(json!({ "released": false })),
    }
}

#[derive(Deserialize)]
struct MountParams {
    files: Vec<VirtualFileNode>,
}

async fn mount(worker: &Worker, params: Value) -> RpcResult {
    let params: MountParams = serde_json::from_value(params).map_err(invalid_params)?;
    worker
        .manager
        .mount_files(&params.files)
        .await
        .map_err(preview_error)?;
    Ok(json!({ "mounted": true }))
}

async fn start(worker: &Worker, params: Value) -> RpcResult {
    let options: PreviewOptions = serde_json::from_value(params).map_err(invalid_params)?;
    let url = worker
        .manager
        .start_server(options)
        .await
        .map_err(preview_error)?;
    Ok(json!({ "url": url }))
}

#[derive(Deserialize)]
struct WriteParams {
    path: String,
    contents: String,
}

async fn write_file(worker: &Worker, params: Value) -> RpcResult {
    let params: WriteParams = serde_json::from_value(params).map_err(invalid_params)?;
    worker
        .manager
        .write_file(&params.path, &params.contents)
        .await
        .map_err(preview_error)?;
    Ok(json!({ "written": true }))
}

#[derive(Deserialize)]
struct ReadParams {
    path: String,
}

async fn read_file(worker: &Worker, params: Value) -> RpcResult {
    let params: ReadParams = serde_json::from_value(params).map_err(invalid_params)?;
    let contents = worker
        .manager
        .read_file(&params.path)
        .await
        .map_err(preview_error)?;
    Ok(json!({ "contents": contents }))
}
