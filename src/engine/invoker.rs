//! Invocation orchestration: one fresh context per call.
//!
//! [`Invoker::invoke`] submits the call to the worker pool and enforces the
//! time budget; the worker then walks the per-call sequence: stage files,
//! install the network surface, inject dependencies, evaluate the source,
//! resolve the entry (directly for JS, via a generated trampoline for
//! Python/Ruby), execute, settle a JS thenable if one comes back, and marshal
//! the result eagerly so it outlives the context. The staged temp directory
//! is removed on every exit path.

use crate::bridge;
use crate::constants::{
    EVENT_FILES_KEY, KV_BINDING, MAX_STAGED_NAME_LEN, NET_BINDING, PLATFORM_ATTACH_NAME,
    PROMISE_POLL_INTERVAL, SQL_BINDING, STAGED_NAME_FALLBACK, TRAMPOLINE_NAME,
};
use crate::engine::{
    Arg, ContextOptions, EngineRegistry, GuestContext, GuestEngine, GuestRef, GuestValue, HostFn,
    InterruptHandle, LanguageId, WorkerPool, marshal,
};
use crate::error::{Error, Result};
use crate::netproxy::VirtualNetwork;
use crate::resources::Platform;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::{debug, warn};

/// One input file to stage into the invocation's temp directory.
#[derive(Debug, Clone)]
pub struct FileInput {
    /// Requested file name; sanitized before staging.
    pub name: String,
    /// MIME type surfaced in the event metadata.
    pub content_type: String,
    /// Raw content.
    pub bytes: Vec<u8>,
}

/// A transient request to run guest code once.
#[derive(Clone)]
pub struct InvocationRequest {
    pub language_id: LanguageId,
    pub source_code: String,
    pub function_name: String,
    /// Free-form event map handed to the handler.
    pub event: Map<String, Value>,
    /// Files staged into a per-invocation temp directory.
    pub files: Vec<FileInput>,
    /// Dependency name → source text.
    pub dependencies: BTreeMap<String, String>,
    /// JS only: evaluate the source as a module.
    pub js_eval_as_module: bool,
    /// Time budget in milliseconds; zero or negative waits indefinitely.
    pub timeout_millis: i64,
    /// Whether the virtual network surface is installed.
    pub enable_network: bool,
    /// Per-function resource bindings.
    pub platform: Option<Platform>,
}

impl InvocationRequest {
    /// A minimal request with no files, dependencies, network, or platform.
    pub fn new(
        language_id: LanguageId,
        source_code: impl Into<String>,
        function_name: impl Into<String>,
    ) -> Self {
        Self {
            language_id,
            source_code: source_code.into(),
            function_name: function_name.into(),
            event: Map::new(),
            files: Vec::new(),
            dependencies: BTreeMap::new(),
            js_eval_as_module: false,
            timeout_millis: 0,
            enable_network: false,
            platform: None,
        }
    }
}

/// Entry point for running invocations against registered engines.
pub struct Invoker {
    registry: Arc<EngineRegistry>,
    pool: WorkerPool,
    network: Arc<VirtualNetwork>,
}

impl Invoker {
    /// Creates an invoker with the default pool sizing.
    pub fn new(registry: Arc<EngineRegistry>, network: Arc<VirtualNetwork>) -> Self {
        Self::with_pool(registry, network, WorkerPool::new())
    }

    /// Creates an invoker over an explicit pool.
    pub fn with_pool(
        registry: Arc<EngineRegistry>,
        network: Arc<VirtualNetwork>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            registry,
            pool,
            network,
        }
    }

    /// Maximum concurrent invocations.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Runs one invocation to completion, timeout, or failure.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<Value> {
        let engine = self
            .registry
            .get(request.language_id)
            .ok_or_else(|| Error::EngineUnavailable(request.language_id.to_string()))?;

        let interrupt = InterruptHandle::new();
        let worker_interrupt = interrupt.clone();
        let network = Arc::clone(&self.network);
        let timeout_millis = request.timeout_millis;

        self.pool
            .run(timeout_millis, interrupt, move || {
                do_invoke(engine, network, request, worker_interrupt)
            })
            .await
    }
}

// =============================================================================
// Per-call Sequence
// =============================================================================

fn do_invoke(
    engine: Arc<dyn GuestEngine>,
    network: Arc<VirtualNetwork>,
    request: InvocationRequest,
    interrupt: InterruptHandle,
) -> Result<Value> {
    let language = request.language_id;
    let mut ctx = engine.new_context(ContextOptions {
        language,
        module_eval: language == LanguageId::Js && request.js_eval_as_module,
        interrupt: interrupt.clone(),
    })?;

    let mut event = request.event;
    let staged = if request.files.is_empty() {
        None
    } else {
        Some(StagedFiles::stage(&request.files)?)
    };
    if let Some(staged) = &staged {
        event.insert(EVENT_FILES_KEY.to_string(), staged.metadata());
    }

    if request.enable_network {
        install_network(ctx.as_mut(), &network, language)?;
    }

    if language == LanguageId::Js && !request.dependencies.is_empty() {
        ctx.eval("<require>", &bridge::js_require_installer(&request.dependencies))?;
    }

    let module_namespace = match language {
        LanguageId::Js if request.js_eval_as_module => {
            Some(ctx.eval_module("<function>", &request.source_code)?)
        }
        LanguageId::Python => {
            if !request.dependencies.is_empty() {
                ctx.eval(
                    "<dependencies>",
                    &bridge::python_dependency_installer(&request.dependencies),
                )?;
            }
            ctx.eval("<function>", &request.source_code)?;
            None
        }
        _ => {
            ctx.eval("<function>", &request.source_code)?;
            None
        }
    };

    let event_value = Value::Object(event);
    let function_name = request.function_name.as_str();

    let result = match language {
        LanguageId::Js => {
            let entry = match &module_namespace {
                Some(namespace) => namespace.member(function_name),
                None => ctx.lookup(function_name),
            };
            let entry = entry
                .filter(|e| e.is_executable())
                .ok_or_else(|| entry_not_found(language, function_name))?;

            match request.platform.as_ref().filter(|p| !p.is_empty()) {
                Some(platform) => {
                    register_platform(ctx.as_mut(), platform)?;
                    ctx.eval(
                        "<platform>",
                        &bridge::js_platform_attach(platform.kv.is_some(), platform.sql.is_some()),
                    )?;
                    let attach = ctx.lookup(PLATFORM_ATTACH_NAME).ok_or_else(|| {
                        Error::Internal("platform attach helper missing".to_string())
                    })?;
                    let attached = attach.call(vec![Arg::Value(event_value)])?;
                    entry.call(vec![Arg::Ref(attached)])?
                }
                None => entry.call(vec![Arg::Value(event_value)])?,
            }
        }
        LanguageId::Python | LanguageId::Ruby => {
            // The entry is checked before the trampoline bakes it in, so a
            // missing handler surfaces as FunctionNotFound rather than a
            // guest name error.
            let has_entry = ctx
                .lookup(function_name)
                .filter(|e| e.is_executable())
                .is_some();
            if !has_entry {
                return Err(entry_not_found(language, function_name));
            }

            let (script, binding) = if language == LanguageId::Python {
                (
                    bridge::python_trampoline(function_name, &event_value),
                    TRAMPOLINE_NAME.to_string(),
                )
            } else {
                (
                    bridge::ruby_trampoline(function_name, &event_value),
                    bridge::ruby_trampoline_global(),
                )
            };
            ctx.eval("<trampoline>", &script)?;
            let trampoline = ctx
                .lookup(&binding)
                .ok_or_else(|| Error::Internal("trampoline binding missing".to_string()))?;
            trampoline.call(Vec::new())?
        }
    };

    let value = if language == LanguageId::Js && is_thenable(result.as_ref()) {
        settle_thenable(ctx.as_mut(), result, &interrupt)?
    } else {
        marshal::to_host(result.as_ref())
    };

    debug!(language = %language, function = %function_name, "invocation complete");
    Ok(value)
}

fn entry_not_found(language: LanguageId, function: &str) -> Error {
    Error::FunctionNotFound {
        language: language.to_string(),
        function: function.to_string(),
    }
}

// =============================================================================
// Network and Platform Bindings
// =============================================================================

fn install_network(
    ctx: &mut dyn GuestContext,
    network: &Arc<VirtualNetwork>,
    language: LanguageId,
) -> Result<()> {
    let net = Arc::clone(network);
    let host_fn: HostFn = Arc::new(move |args: &[GuestRef]| {
        let method = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::NetworkRequest("method must be a string".to_string()))?;
        let url = args
            .get(1)
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::NetworkRequest("url must be a string".to_string()))?;
        let body = args
            .get(2)
            .filter(|v| !v.is_null())
            .and_then(|v| v.as_str());
        let headers = args
            .get(3)
            .map(|v| marshal::to_host(v.as_ref()))
            .unwrap_or(Value::Null);
        let header_pairs: Vec<(String, String)> = headers
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let exchange = net.http(&method, &url, body.as_deref(), &header_pairs)?;
        Ok(exchange.to_value())
    });
    ctx.register_host_fn(NET_BINDING, host_fn)?;

    let shim = match language {
        LanguageId::Js => bridge::js_net_shim(),
        LanguageId::Python => bridge::python_net_shim(),
        LanguageId::Ruby => bridge::ruby_net_shim(),
    };
    ctx.eval("<net>", &shim)?;
    Ok(())
}

fn register_platform(ctx: &mut dyn GuestContext, platform: &Platform) -> Result<()> {
    if let Some(kv) = platform.kv.clone() {
        let host_fn: HostFn = Arc::new(move |args: &[GuestRef]| {
            let op = args.first().and_then(|v| v.as_str()).unwrap_or_default();
            let key = args.get(1).and_then(|v| v.as_str()).unwrap_or_default();
            match op.as_str() {
                "get" => Ok(kv.get(&key).unwrap_or(Value::Null)),
                "put" => {
                    let value = args
                        .get(2)
                        .map(|v| marshal::to_host(v.as_ref()))
                        .unwrap_or(Value::Null);
                    kv.put(&key, value);
                    Ok(Value::Null)
                }
                "delete" => {
                    kv.delete(&key);
                    Ok(Value::Null)
                }
                other => Err(Error::NotSupported(format!("kv operation: {other}"))),
            }
        });
        ctx.register_host_fn(KV_BINDING, host_fn)?;
    }

    if let Some(sql) = platform.sql.clone() {
        let host_fn: HostFn = Arc::new(move |args: &[GuestRef]| {
            let statement = args.first().and_then(|v| v.as_str()).unwrap_or_default();
            sql.query(&statement)
        });
        ctx.register_host_fn(SQL_BINDING, host_fn)?;
    }
    Ok(())
}

// =============================================================================
// Promise Settling
// =============================================================================

fn is_thenable(value: &dyn GuestValue) -> bool {
    value
        .member("then")
        .map(|then| then.is_executable())
        .unwrap_or(false)
}

/// Awaits a guest thenable without a host event loop: resolve/reject host
/// callbacks fill a shared slot, and the context is pumped between 1 ms
/// polls so queued microtasks can run. Rejection re-raises as a guest
/// runtime failure.
fn settle_thenable(
    ctx: &mut dyn GuestContext,
    value: GuestRef,
    interrupt: &InterruptHandle,
) -> Result<Value> {
    type Slot = Arc<Mutex<Option<std::result::Result<Value, String>>>>;
    let slot: Slot = Arc::new(Mutex::new(None));

    let resolved = Arc::clone(&slot);
    let on_resolve: HostFn = Arc::new(move |args: &[GuestRef]| {
        let settled = args
            .first()
            .map(|v| marshal::to_host(v.as_ref()))
            .unwrap_or(Value::Null);
        *resolved.lock().unwrap_or_else(|e| e.into_inner()) = Some(Ok(settled));
        Ok(Value::Null)
    });

    let rejected = Arc::clone(&slot);
    let on_reject: HostFn = Arc::new(move |args: &[GuestRef]| {
        let reason = args
            .first()
            .map(|v| v.display())
            .unwrap_or_else(|| "promise rejected".to_string());
        *rejected.lock().unwrap_or_else(|e| e.into_inner()) = Some(Err(reason));
        Ok(Value::Null)
    });

    value.invoke_member(
        "then",
        vec![Arg::Function(on_resolve), Arg::Function(on_reject)],
    )?;

    loop {
        if let Some(outcome) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return outcome.map_err(Error::GuestEvaluation);
        }
        if interrupt.is_triggered() {
            return Err(Error::GuestEvaluation(
                "interrupted while awaiting promise".to_string(),
            ));
        }
        ctx.pump()?;
        std::thread::sleep(PROMISE_POLL_INTERVAL);
    }
}

// =============================================================================
// File Staging
// =============================================================================

/// Per-invocation temp directory holding the request's input files. Dropping
/// removes the directory; failures are logged and suppressed.
struct StagedFiles {
    dir: Option<TempDir>,
    metadata: Vec<Value>,
}

impl StagedFiles {
    fn stage(files: &[FileInput]) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("faas-invoke-").tempdir()?;
        let mut metadata = Vec::new();

        for file in files {
            let name = sanitize_file_name(&file.name);
            let path = dir.path().join(&name);
            fs::write(&path, &file.bytes)?;

            let mut entry = Map::new();
            entry.insert("name".to_string(), Value::String(name));
            entry.insert(
                "contentType".to_string(),
                Value::String(file.content_type.clone()),
            );
            entry.insert("path".to_string(), Value::String(path.display().to_string()));
            entry.insert("size".to_string(), Value::from(file.bytes.len() as u64));
            metadata.push(Value::Object(entry));
        }

        debug!(count = files.len(), dir = %dir.path().display(), "staged invocation files");
        Ok(Self {
            dir: Some(dir),
            metadata,
        })
    }

    fn metadata(&self) -> Value {
        Value::Array(self.metadata.clone())
    }

    #[cfg(test)]
    fn path(&self) -> std::path::PathBuf {
        self.dir.as_ref().unwrap().path().to_path_buf()
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "staged file cleanup failed");
            }
        }
    }
}

/// Makes a requested file name safe for the staging directory: path
/// separators become `_`, surrounding whitespace is trimmed, empty or
/// dot-only names fall back to `file.bin`, and length is capped.
fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let trimmed = replaced.trim();
    let base = if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        STAGED_NAME_FALLBACK
    } else {
        trimmed
    };
    base.chars().take(MAX_STAGED_NAME_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name("a\\b/c"), "a_b_c");
        assert_eq!(sanitize_file_name("   "), "file.bin");
        assert_eq!(sanitize_file_name(""), "file.bin");
        assert_eq!(sanitize_file_name("."), "file.bin");
        let long = "x".repeat(400);
        assert_eq!(sanitize_file_name(&long).len(), MAX_STAGED_NAME_LEN);
    }

    #[test]
    fn test_staged_files_roundtrip_and_cleanup() {
        let staged = StagedFiles::stage(&[
            FileInput {
                name: "in/data.txt".to_string(),
                content_type: "text/plain".to_string(),
                bytes: b"hello".to_vec(),
            },
            FileInput {
                name: String::new(),
                content_type: "application/octet-stream".to_string(),
                bytes: vec![0, 1, 2],
            },
        ])
        .unwrap();

        let dir = staged.path();
        assert!(dir.join("in_data.txt").exists());
        assert!(dir.join("file.bin").exists());

        let metadata = staged.metadata();
        let entries = metadata.as_array().unwrap();
        assert_eq!(entries[0]["name"], "in_data.txt");
        assert_eq!(entries[0]["contentType"], "text/plain");
        assert_eq!(entries[0]["size"], 5);
        assert!(
            entries[0]["path"]
                .as_str()
                .unwrap()
                .ends_with("in_data.txt")
        );

        drop(staged);
        assert!(!dir.exists(), "staging directory must not outlive the call");
    }
}
