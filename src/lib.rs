//! # faasrun
//!
//! **Polyglot FaaS host with per-invocation isolation and egress control**
//!
//! Accepts user-supplied guest source (JavaScript, Python, Ruby), stores it
//! as a named function asset, and executes it on HTTP invocation with a
//! fresh one-shot guest context, a time budget, a host-mediated virtual
//! network behind a binary IP blocklist, and optional per-function resource
//! bindings.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            faasrun                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  HTTP dispatch (web) ── assets ── resources                      │
//! │        │                                                         │
//! │  ┌─────┴───────────────────────────────────────────────┐         │
//! │  │              Invocation engine (engine)             │         │
//! │  │  worker pool │ per-call context │ marshalling       │         │
//! │  │  file staging │ trampolines │ promise settling      │         │
//! │  └─────┬───────────────────────────────────────────────┘         │
//! │        │ GuestEngine / GuestContext / GuestValue seam            │
//! │        ▼                                                         │
//! │  external guest evaluators (js, python, ruby)                    │
//! │                                                                  │
//! │  virtual network (netproxy) ──► egress filter (blocklist)        │
//! │                                  RNG1 ranges │ TRI1 trie         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Isolation Model
//!
//! Guest contexts are built per call and dropped before the worker returns
//! to the pool; nothing guest-visible is shared between invocations except
//! the explicit `net` and `platform` proxies. Guests cannot open sockets:
//! with networking disabled there is no network surface at all, and with it
//! enabled every request passes header sanitization and the egress filter
//! before any connection. A missing or malformed blocklist fails closed.
//!
//! # Engine Seam
//!
//! The embedded language engines are external collaborators. The
//! [`engine`] module defines the narrow trait seam they plug into; the
//! host side (pool, bridge scripts, marshalling, dispatch) is complete and
//! engine-agnostic. Registered backends are looked up per invocation via
//! [`engine::EngineRegistry`].
//!
//! # Example
//!
//! ```rust,ignore
//! use faasrun::blocklist::EgressFilter;
//! use faasrun::engine::{EngineRegistry, InvocationRequest, Invoker, LanguageId};
//! use faasrun::netproxy::VirtualNetwork;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> faasrun::Result<()> {
//!     let filter = EgressFilter::new("blocklist.bin");
//!     let network = Arc::new(VirtualNetwork::new(filter));
//!
//!     let mut registry = EngineRegistry::new();
//!     // registry.register(Arc::new(MyJsEngine::new()));
//!
//!     let invoker = Invoker::new(Arc::new(registry), network);
//!     let mut request = InvocationRequest::new(
//!         LanguageId::Js,
//!         "function handler(event) { return { ok: true }; }",
//!         "handler",
//!     );
//!     request.timeout_millis = 5000;
//!     let result = invoker.invoke(request).await?;
//!     println!("{result}");
//!     Ok(())
//! }
//! ```

pub mod assets;
pub mod blocklist;
pub mod bridge;
pub mod config;
pub mod constants;
pub mod engine;
mod error;
pub mod ip;
pub mod netproxy;
pub mod resources;
pub mod web;

pub use error::{Error, Result};
