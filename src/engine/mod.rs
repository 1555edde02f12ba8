//! Guest engine seam and invocation machinery.
//!
//! The embedded language engines are external collaborators. This module
//! defines the narrow interface the host programs against:
//!
//! - [`GuestEngine`]: per-language factory of one-shot contexts
//! - [`GuestContext`]: evaluate source, resolve bindings, register host
//!   callables, pump the engine's microtask queue
//! - [`GuestValue`]: introspection surface the marshaller walks
//!
//! Contexts are used exactly once: each invocation builds a fresh context on
//! a pooled worker and drops it before the worker goes idle. Engines must
//! honor the [`InterruptHandle`] at their yield points so timed-out work can
//! be abandoned.
//!
//! # Binding contract
//!
//! [`GuestContext::register_host_fn`] makes a host callable resolvable as a
//! top-level name in the guest (a polyglot export). Generated bridge scripts
//! (see [`crate::bridge`]) reference those names directly. Host callables
//! receive guest values and return host values; the engine converts the
//! returned value into a guest value.

mod invoker;
mod marshal;
mod pool;

pub use invoker::{FileInput, InvocationRequest, Invoker};
pub use marshal::{to_host, to_python_literal, to_ruby_literal};
pub use pool::WorkerPool;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// =============================================================================
// Languages
// =============================================================================

/// Supported guest language tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageId {
    /// JavaScript (script or module evaluation).
    Js,
    /// Python.
    Python,
    /// Ruby.
    Ruby,
}

impl LanguageId {
    /// Parses a manifest language tag.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "js" => Ok(Self::Js),
            "python" => Ok(Self::Python),
            "ruby" => Ok(Self::Ruby),
            other => Err(Error::UnknownLanguage(other.to_string())),
        }
    }
}

impl std::fmt::Display for LanguageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Js => write!(f, "js"),
            Self::Python => write!(f, "python"),
            Self::Ruby => write!(f, "ruby"),
        }
    }
}

// =============================================================================
// Interruption
// =============================================================================

/// Cooperative cancellation flag shared between the pool and a context.
///
/// Triggering does not tear the guest down; the engine observes the flag at
/// its next yield point and abandons evaluation.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// Creates an untriggered handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests interruption.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Reports whether interruption was requested.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Seam Types
// =============================================================================

/// Owned handle to a value living inside a guest context.
pub type GuestRef = Box<dyn GuestValue>;

/// Host callable exposed to guests. Receives guest values, returns a host
/// value the engine converts back into the guest world.
pub type HostFn = Arc<dyn Fn(&[GuestRef]) -> Result<Value> + Send + Sync>;

/// Argument passed into a guest callable.
pub enum Arg {
    /// Host data, converted to a fresh guest value by the engine.
    Value(Value),
    /// A value already living in the context.
    Ref(GuestRef),
    /// A host callable (promise callbacks and similar).
    Function(HostFn),
}

/// Options for constructing a one-shot context.
pub struct ContextOptions {
    /// Language the context evaluates.
    pub language: LanguageId,
    /// JS only: evaluate sources as modules and return their namespace.
    pub module_eval: bool,
    /// Cancellation flag the engine must observe at yield points.
    pub interrupt: InterruptHandle,
}

/// Factory for one-shot guest contexts of a single language.
pub trait GuestEngine: Send + Sync {
    /// The language this engine evaluates.
    fn language(&self) -> LanguageId;

    /// Builds a fresh context. Contexts are never reused across invocations.
    fn new_context(&self, opts: ContextOptions) -> Result<Box<dyn GuestContext>>;
}

/// One-shot guest execution sandbox.
pub trait GuestContext {
    /// Evaluates source text in the script binding and returns its
    /// completion value.
    fn eval(&mut self, name: &str, source: &str) -> Result<GuestRef>;

    /// Compiles and evaluates source as a module, returning the module
    /// namespace.
    fn eval_module(&mut self, name: &str, source: &str) -> Result<GuestRef>;

    /// Resolves a top-level binding: a global, a module-level name, or a
    /// polyglot export, per language convention.
    fn lookup(&self, name: &str) -> Option<GuestRef>;

    /// Registers a host callable under a top-level guest name.
    fn register_host_fn(&mut self, name: &str, function: HostFn) -> Result<()>;

    /// Runs one microtask turn (a no-op evaluation in engines without an
    /// explicit job queue). Called between polls while settling thenables.
    fn pump(&mut self) -> Result<()>;
}

/// Introspection surface over a guest value.
///
/// The defaults describe an opaque object with no data view, so engine
/// implementations only override what their value kinds support. Methods
/// returning fresh [`GuestRef`]s keep the underlying context alive through
/// whatever interior sharing the engine uses.
pub trait GuestValue {
    /// True for the guest's null/nil/undefined values.
    fn is_null(&self) -> bool {
        false
    }

    /// String view, when the value is a guest string.
    fn as_str(&self) -> Option<String> {
        None
    }

    /// Boolean view.
    fn as_bool(&self) -> Option<bool> {
        None
    }

    /// Integral view, when the number fits an i64 exactly.
    fn as_i64(&self) -> Option<i64> {
        None
    }

    /// Floating view, for numerics that do not fit an integer.
    fn as_f64(&self) -> Option<f64> {
        None
    }

    /// Host data passing through the guest unchanged.
    fn as_host_value(&self) -> Option<Value> {
        None
    }

    /// Ordered elements, when the value is array-like.
    fn array_elements(&self) -> Option<Vec<GuestRef>> {
        None
    }

    /// Keys in insertion order, when the value supports the `keys()` + `[]`
    /// mapping protocol (Python dicts, Ruby hashes).
    fn mapping_keys(&self) -> Option<Vec<GuestRef>> {
        None
    }

    /// Item access by string key (`value[key]`).
    fn get_item(&self, key: &str) -> Option<GuestRef> {
        let _ = key;
        None
    }

    /// Member names, for plain objects.
    fn member_keys(&self) -> Vec<String> {
        Vec::new()
    }

    /// Member access by name.
    fn member(&self, name: &str) -> Option<GuestRef> {
        let _ = name;
        None
    }

    /// True when the value can be called.
    fn is_executable(&self) -> bool {
        false
    }

    /// Calls the value.
    fn call(&self, args: Vec<Arg>) -> Result<GuestRef> {
        let _ = args;
        Err(Error::NotSupported("value is not executable".to_string()))
    }

    /// Calls a member with `self` as receiver.
    fn invoke_member(&self, name: &str, args: Vec<Arg>) -> Result<GuestRef> {
        let member = self
            .member(name)
            .ok_or_else(|| Error::NotSupported(format!("no member: {name}")))?;
        member.call(args)
    }

    /// Human-readable rendering, used as the marshalling fallback.
    fn display(&self) -> String;
}

impl std::fmt::Debug for dyn GuestValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Registry of available guest engines, one per language.
#[derive(Default)]
pub struct EngineRegistry {
    engines: Vec<Arc<dyn GuestEngine>>,
}

impl EngineRegistry {
    /// Creates an empty registry. Engine backends are linked in by the
    /// embedding build and registered here.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an engine. A later registration for the same language wins.
    pub fn register(&mut self, engine: Arc<dyn GuestEngine>) {
        self.engines.retain(|e| e.language() != engine.language());
        self.engines.push(engine);
    }

    /// Gets the engine for a language.
    pub fn get(&self, language: LanguageId) -> Option<Arc<dyn GuestEngine>> {
        self.engines
            .iter()
            .find(|e| e.language() == language)
            .cloned()
    }

    /// Languages with a registered backend.
    pub fn languages(&self) -> Vec<LanguageId> {
        self.engines.iter().map(|e| e.language()).collect()
    }
}
