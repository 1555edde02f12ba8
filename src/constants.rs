//! Constants for the FaaS host.
//!
//! All limits, timeouts, magics, and keys are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Storage Paths
// =============================================================================

/// Root state directory, created next to the process working directory.
pub const STATE_DIR: &str = ".faas";

/// Subdirectory for persisted function assets.
pub const FUNCTIONS_DIR: &str = "functions";

/// Subdirectory for persisted resource records.
pub const RESOURCES_DIR: &str = "resources";

// =============================================================================
// Blocklist Format
// =============================================================================

/// Magic for the sorted-range blocklist encoding.
pub const RANGE_MAGIC: [u8; 4] = *b"RNG1";

/// Magic for the compressed-prefix-trie blocklist encoding.
pub const TRIE_MAGIC: [u8; 4] = *b"TRI1";

/// Offset of the trie root node, right after magic + reserved word.
pub const TRIE_ROOT_OFFSET: usize = 8;

/// Serialized size of one trie node record: type u8, bit index u8, two i32 offsets.
pub const TRIE_NODE_SIZE: usize = 10;

/// Trie node type tag: two-way branch.
pub const TRIE_NODE_BRANCH: u8 = 1;

/// Trie node type tag: terminal leaf (blocks the whole subtree).
pub const TRIE_NODE_LEAF: u8 = 2;

/// Environment key overriding the blocklist file path.
pub const BLOCKLIST_ENV_KEY: &str = "egress.blocklist.file";

/// Default blocklist file, next to the working directory.
pub const DEFAULT_BLOCKLIST_FILE: &str = "blocklist.bin";

/// How often the background reloader polls the blocklist file.
pub const BLOCKLIST_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Virtual Network
// =============================================================================

/// Connect timeout for guest-originated HTTP requests.
pub const NET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whole-request timeout for guest-originated HTTP requests.
pub const NET_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Request headers guests may not set; dropped case-insensitively.
pub const RESTRICTED_HEADERS: [&str; 4] =
    ["host", "content-length", "connection", "transfer-encoding"];

// =============================================================================
// Invocation Engine
// =============================================================================

/// Default guest entry point name.
pub const DEFAULT_FUNCTION_NAME: &str = "handler";

/// Lower bound on worker pool capacity; the upper bound is the CPU count.
pub const MIN_POOL_WORKERS: usize = 2;

/// Poll interval while settling a guest thenable.
pub const PROMISE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Longest permitted staged file name after sanitization.
pub const MAX_STAGED_NAME_LEN: usize = 255;

/// Name used for staged files whose sanitized name came out empty.
pub const STAGED_NAME_FALLBACK: &str = "file.bin";

/// Event key under which staged file metadata is exposed to guests.
pub const EVENT_FILES_KEY: &str = "files";

// =============================================================================
// Guest Binding Names
// =============================================================================

/// Host binding guests call for virtualized HTTP.
pub const NET_BINDING: &str = "__faas_net_http";

/// Host binding behind the platform KV proxy.
pub const KV_BINDING: &str = "__faas_kv";

/// Host binding behind the platform SQL placeholder.
pub const SQL_BINDING: &str = "__faas_sql";

/// Name of the generated zero-argument trampoline.
pub const TRAMPOLINE_NAME: &str = "__faas_invoke__";

/// Name of the generated JS helper that attaches the platform to an event.
pub const PLATFORM_ATTACH_NAME: &str = "__faas_attach_platform";

// =============================================================================
// HTTP Dispatch
// =============================================================================

/// Default HTTP listen port for `serve`.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Time budget applied to invocations dispatched over HTTP.
pub const DISPATCH_TIMEOUT_MILLIS: i64 = 5000;
