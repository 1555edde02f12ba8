#![allow(dead_code)]

//! Scripted guest engine implementing the evaluator seam for tests.
//!
//! Real engines are external collaborators; these tests drive the host
//! through the same trait surface with programmable behaviors. The scripted
//! context honors the contracts the host relies on: generated trampolines
//! define their binding, `eval_module` returns a namespace, registered host
//! functions are reachable from "guest" behaviors, and thenables settle only
//! when the context is pumped.

use faasrun::blocklist::{BlocklistBuilder, EgressFilter};
use faasrun::engine::{
    Arg, ContextOptions, EngineRegistry, GuestContext, GuestEngine, GuestRef, GuestValue, HostFn,
    InterruptHandle, Invoker, LanguageId, to_host,
};
use faasrun::{Error, Result};
use faasrun::netproxy::VirtualNetwork;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

// =============================================================================
// Values
// =============================================================================

pub type FakeFn = Arc<dyn Fn(Vec<Arg>) -> Result<FakeValue> + Send + Sync>;

/// Outcome a thenable eventually settles to.
pub struct ThenableState {
    pub outcome: std::result::Result<Value, String>,
    callbacks: Option<(HostFn, HostFn)>,
    delivered: bool,
}

/// Guest value of the scripted engine.
#[derive(Clone)]
pub enum FakeValue {
    Null,
    Str(String),
    Bool(bool),
    Int(i64),
    /// Host data converted into the guest, projected transparently.
    Host(Value),
    /// Plain object with ordered members.
    Object(Vec<(String, FakeValue)>),
    /// Callable.
    Fn(FakeFn),
    /// Promise-like: settles when the context is pumped.
    Thenable(Arc<Mutex<ThenableState>>),
}

impl FakeValue {
    pub fn function(f: impl Fn(Vec<Arg>) -> Result<FakeValue> + Send + Sync + 'static) -> Self {
        FakeValue::Fn(Arc::new(f))
    }
}

impl GuestValue for FakeValue {
    fn is_null(&self) -> bool {
        matches!(self, FakeValue::Null) || matches!(self, FakeValue::Host(Value::Null))
    }

    fn as_str(&self) -> Option<String> {
        match self {
            FakeValue::Str(s) => Some(s.clone()),
            FakeValue::Host(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            FakeValue::Bool(b) => Some(*b),
            FakeValue::Host(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            FakeValue::Int(i) => Some(*i),
            FakeValue::Host(Value::Number(n)) => n.as_i64(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            FakeValue::Host(Value::Number(n)) if n.as_i64().is_none() => n.as_f64(),
            _ => None,
        }
    }

    fn as_host_value(&self) -> Option<Value> {
        match self {
            FakeValue::Host(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn member_keys(&self) -> Vec<String> {
        match self {
            FakeValue::Object(entries) => entries.iter().map(|(k, _)| k.clone()).collect(),
            FakeValue::Host(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn member(&self, name: &str) -> Option<GuestRef> {
        match self {
            FakeValue::Object(entries) => entries
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| Box::new(v.clone()) as GuestRef),
            FakeValue::Host(Value::Object(map)) => map
                .get(name)
                .map(|v| Box::new(FakeValue::Host(v.clone())) as GuestRef),
            FakeValue::Thenable(state) => {
                if name != "then" {
                    return None;
                }
                let state = Arc::clone(state);
                Some(Box::new(FakeValue::function(move |args| {
                    let mut functions = args.into_iter().filter_map(|arg| match arg {
                        Arg::Function(f) => Some(f),
                        _ => None,
                    });
                    let resolve = functions
                        .next()
                        .ok_or_else(|| Error::GuestEvaluation("then needs callbacks".into()))?;
                    let reject = functions
                        .next()
                        .ok_or_else(|| Error::GuestEvaluation("then needs callbacks".into()))?;
                    state.lock().unwrap().callbacks = Some((resolve, reject));
                    Ok(FakeValue::Null)
                })))
            }
            _ => None,
        }
    }

    fn get_item(&self, key: &str) -> Option<GuestRef> {
        self.member(key)
    }

    fn is_executable(&self) -> bool {
        matches!(self, FakeValue::Fn(_))
    }

    fn call(&self, args: Vec<Arg>) -> Result<GuestRef> {
        match self {
            FakeValue::Fn(f) => f(args).map(|v| Box::new(v) as GuestRef),
            _ => Err(Error::NotSupported("value is not executable".into())),
        }
    }

    fn display(&self) -> String {
        match self {
            FakeValue::Null => "null".to_string(),
            FakeValue::Str(s) => s.clone(),
            FakeValue::Bool(b) => b.to_string(),
            FakeValue::Int(i) => i.to_string(),
            FakeValue::Host(v) => v.to_string(),
            FakeValue::Object(_) => "<object>".to_string(),
            FakeValue::Fn(_) => "<function>".to_string(),
            FakeValue::Thenable(_) => "<promise>".to_string(),
        }
    }
}

/// Converts an incoming argument to plain host data (platform proxies and
/// callbacks flatten to null).
pub fn arg_value(arg: &Arg) -> Value {
    match arg {
        Arg::Value(v) => v.clone(),
        Arg::Ref(r) => to_host(r.as_ref()),
        Arg::Function(_) => Value::Null,
    }
}

fn arg_to_ref(arg: Arg) -> GuestRef {
    match arg {
        Arg::Value(v) => Box::new(FakeValue::Host(v)),
        Arg::Ref(r) => r,
        Arg::Function(_) => Box::new(FakeValue::Null),
    }
}

// =============================================================================
// Context
// =============================================================================

struct Inner {
    globals: HashMap<String, FakeValue>,
    host_fns: HashMap<String, HostFn>,
    pending: Vec<Arc<Mutex<ThenableState>>>,
    interrupt: InterruptHandle,
}

type Shared = Arc<Mutex<Inner>>;

/// Handle the engine's setup closure uses to program a fresh context.
#[derive(Clone)]
pub struct ContextHandle(Shared);

impl ContextHandle {
    /// Defines a top-level guest binding.
    pub fn define(&self, name: &str, value: FakeValue) {
        self.0
            .lock()
            .unwrap()
            .globals
            .insert(name.to_string(), value);
    }

    /// The context's interrupt flag, for busy-wait behaviors.
    pub fn interrupt(&self) -> InterruptHandle {
        self.0.lock().unwrap().interrupt.clone()
    }

    /// Creates a thenable that settles to `outcome` on the next pump.
    pub fn thenable(&self, outcome: std::result::Result<Value, String>) -> FakeValue {
        let state = Arc::new(Mutex::new(ThenableState {
            outcome,
            callbacks: None,
            delivered: false,
        }));
        self.0.lock().unwrap().pending.push(Arc::clone(&state));
        FakeValue::Thenable(state)
    }
}

/// One eval issued against a scripted context.
#[derive(Debug, Clone)]
pub struct Recording {
    pub name: String,
    pub source: String,
}

struct FakeContext {
    shared: Shared,
    recordings: Arc<Mutex<Vec<Recording>>>,
    pumps: Arc<Mutex<usize>>,
}

impl FakeContext {
    fn record(&self, name: &str, source: &str) {
        self.recordings.lock().unwrap().push(Recording {
            name: name.to_string(),
            source: source.to_string(),
        });
    }

    /// Interprets a generated trampoline: binds the trampoline name to a
    /// closure calling the configured handler with the baked event.
    fn install_trampoline(&self, source: &str) -> Result<()> {
        let (binding, call) = if let Some(rest) =
            source.strip_prefix("def __faas_invoke__():\n    return ")
        {
            ("__faas_invoke__", rest.trim_end())
        } else if let Some(rest) = source.strip_prefix("$__faas_invoke__ = lambda do\n  ") {
            let call = rest
                .split("\nend")
                .next()
                .ok_or_else(|| Error::GuestEvaluation("malformed trampoline".into()))?;
            ("$__faas_invoke__", call)
        } else {
            return Err(Error::GuestEvaluation("unrecognized trampoline".into()));
        };

        let open = call
            .find('(')
            .ok_or_else(|| Error::GuestEvaluation("malformed trampoline".into()))?;
        let function_name = &call[..open];
        let literal = &call[open + 1..call.len() - 1];
        let event = naive_literal_value(literal)?;

        let target = self
            .shared
            .lock()
            .unwrap()
            .globals
            .get(function_name)
            .cloned()
            .ok_or_else(|| Error::GuestEvaluation(format!("undefined name: {function_name}")))?;

        let trampoline = FakeValue::function(move |_args| match &target {
            FakeValue::Fn(f) => f(vec![Arg::Value(event.clone())]),
            _ => Err(Error::GuestEvaluation("handler is not callable".into())),
        });
        self.shared
            .lock()
            .unwrap()
            .globals
            .insert(binding.to_string(), trampoline);
        Ok(())
    }

    /// Interprets the platform-attach helper: binds a closure that returns
    /// the event extended with a `platform` object wired to the registered
    /// host bindings.
    fn install_platform_attach(&self) {
        let kv_fn = self.shared.lock().unwrap().host_fns.get("__faas_kv").cloned();
        let sql_fn = self
            .shared
            .lock()
            .unwrap()
            .host_fns
            .get("__faas_sql")
            .cloned();

        let attach = FakeValue::function(move |mut args| {
            let event = arg_value(&args.remove(0));
            let mut members: Vec<(String, FakeValue)> = event
                .as_object()
                .map(|map| {
                    map.iter()
                        .map(|(k, v)| (k.clone(), FakeValue::Host(v.clone())))
                        .collect()
                })
                .unwrap_or_default();

            let mut platform: Vec<(String, FakeValue)> = Vec::new();
            if let Some(kv) = kv_fn.clone() {
                let op = |name: &'static str, kv: HostFn| {
                    FakeValue::function(move |call_args| {
                        let mut refs: Vec<GuestRef> =
                            vec![Box::new(FakeValue::Str(name.to_string()))];
                        refs.extend(call_args.into_iter().map(arg_to_ref));
                        kv(&refs).map(FakeValue::Host)
                    })
                };
                platform.push((
                    "kv".to_string(),
                    FakeValue::Object(vec![
                        ("get".to_string(), op("get", Arc::clone(&kv))),
                        ("put".to_string(), op("put", Arc::clone(&kv))),
                        ("delete".to_string(), op("delete", Arc::clone(&kv))),
                    ]),
                ));
            }
            if let Some(sql) = sql_fn.clone() {
                platform.push((
                    "sql".to_string(),
                    FakeValue::Object(vec![(
                        "query".to_string(),
                        FakeValue::function(move |call_args| {
                            let refs: Vec<GuestRef> =
                                call_args.into_iter().map(arg_to_ref).collect();
                            sql(&refs).map(FakeValue::Host)
                        }),
                    )]),
                ));
            }
            members.push(("platform".to_string(), FakeValue::Object(platform)));
            Ok(FakeValue::Object(members))
        });

        self.shared
            .lock()
            .unwrap()
            .globals
            .insert("__faas_attach_platform".to_string(), attach);
    }
}

impl GuestContext for FakeContext {
    fn eval(&mut self, name: &str, source: &str) -> Result<GuestRef> {
        self.record(name, source);
        match name {
            "<trampoline>" => self.install_trampoline(source)?,
            "<platform>" => self.install_platform_attach(),
            _ => {}
        }
        Ok(Box::new(FakeValue::Null))
    }

    fn eval_module(&mut self, name: &str, source: &str) -> Result<GuestRef> {
        self.record(name, source);
        let entries: Vec<(String, FakeValue)> = self
            .shared
            .lock()
            .unwrap()
            .globals
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(FakeValue::Object(entries)))
    }

    fn lookup(&self, name: &str) -> Option<GuestRef> {
        self.shared
            .lock()
            .unwrap()
            .globals
            .get(name)
            .cloned()
            .map(|v| Box::new(v) as GuestRef)
    }

    fn register_host_fn(&mut self, name: &str, function: HostFn) -> Result<()> {
        self.shared
            .lock()
            .unwrap()
            .host_fns
            .insert(name.to_string(), function);
        Ok(())
    }

    fn pump(&mut self) -> Result<()> {
        *self.pumps.lock().unwrap() += 1;
        let pending: Vec<Arc<Mutex<ThenableState>>> =
            self.shared.lock().unwrap().pending.clone();
        for state in pending {
            let mut state = state.lock().unwrap();
            if state.delivered {
                continue;
            }
            let Some((resolve, reject)) = state.callbacks.clone() else {
                continue;
            };
            state.delivered = true;
            match state.outcome.clone() {
                Ok(value) => {
                    let arg: GuestRef = Box::new(FakeValue::Host(value));
                    resolve(&[arg])?;
                }
                Err(reason) => {
                    let arg: GuestRef = Box::new(FakeValue::Str(reason));
                    reject(&[arg])?;
                }
            }
        }
        Ok(())
    }
}

/// Converts trampoline-baked Python/Ruby literals back to JSON. Good enough
/// for the plain string/number/bool events these tests bake.
fn naive_literal_value(literal: &str) -> Result<Value> {
    let text = literal
        .replace(" => ", ": ")
        .replace('\'', "\"")
        .replace("None", "null")
        .replace("nil", "null")
        .replace("True", "true")
        .replace("False", "false");
    serde_json::from_str(&text).map_err(|e| Error::GuestEvaluation(format!("bad literal: {e}")))
}

// =============================================================================
// Engine
// =============================================================================

type SetupFn = Arc<dyn Fn(&ContextHandle) + Send + Sync>;

/// Scripted engine: each context starts from the programmed setup closure.
pub struct ScriptedEngine {
    language: LanguageId,
    setup: SetupFn,
    /// Every eval across every context, for sequencing assertions.
    pub recordings: Arc<Mutex<Vec<Recording>>>,
    /// Total pump calls across contexts.
    pub pumps: Arc<Mutex<usize>>,
}

impl ScriptedEngine {
    pub fn new(
        language: LanguageId,
        setup: impl Fn(&ContextHandle) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            language,
            setup: Arc::new(setup),
            recordings: Arc::new(Mutex::new(Vec::new())),
            pumps: Arc::new(Mutex::new(0)),
        })
    }

    /// Sources evaluated under the given synthetic name.
    pub fn recorded(&self, name: &str) -> Vec<String> {
        self.recordings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.source.clone())
            .collect()
    }
}

impl GuestEngine for ScriptedEngine {
    fn language(&self) -> LanguageId {
        self.language
    }

    fn new_context(&self, opts: ContextOptions) -> Result<Box<dyn GuestContext>> {
        let shared: Shared = Arc::new(Mutex::new(Inner {
            globals: HashMap::new(),
            host_fns: HashMap::new(),
            pending: Vec::new(),
            interrupt: opts.interrupt,
        }));
        (self.setup)(&ContextHandle(Arc::clone(&shared)));
        Ok(Box::new(FakeContext {
            shared,
            recordings: Arc::clone(&self.recordings),
            pumps: Arc::clone(&self.pumps),
        }))
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Builds an invoker over the given engines with a permissive (empty RNG1)
/// blocklist. The temp dir keeps the blocklist file alive.
pub fn test_invoker(engines: Vec<Arc<ScriptedEngine>>) -> (tempfile::TempDir, Invoker) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blocklist.bin");
    BlocklistBuilder::new().write_ranges(&path).unwrap();

    let filter = EgressFilter::new(path);
    let network = Arc::new(VirtualNetwork::new(filter));

    let mut registry = EngineRegistry::new();
    for engine in engines {
        registry.register(engine);
    }
    (dir, Invoker::new(Arc::new(registry), network))
}
