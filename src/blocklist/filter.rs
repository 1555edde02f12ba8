//! Egress filter: memory-mapped blocklist lookup with fail-closed reload.
//!
//! The filter keeps the current blocklist behind an atomically swapped
//! snapshot. Readers clone the snapshot handle and are never blocked by a
//! reload; a reload either installs a fully validated mapping or collapses
//! the state to `Missing`, in which case every non-loopback lookup reports
//! blocked until a good file appears.

use crate::constants::{
    RANGE_MAGIC, TRIE_MAGIC, TRIE_NODE_BRANCH, TRIE_NODE_LEAF, TRIE_NODE_SIZE, TRIE_ROOT_OFFSET,
};
use crate::error::{Error, Result};
use crate::ip;
use memmap2::Mmap;
use std::fs::File;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use url::{Host, Url};

static GLOBAL_FILTER: OnceLock<Arc<EgressFilter>> = OnceLock::new();

/// Which encoding the mapped file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ranges,
    Trie,
}

enum State {
    /// No usable blocklist. All non-loopback egress is blocked.
    Missing,
    Loaded {
        map: Mmap,
        mode: Mode,
        mtime: SystemTime,
        size: u64,
    },
}

/// Blocklist-backed egress policy.
pub struct EgressFilter {
    path: PathBuf,
    state: RwLock<Arc<State>>,
    /// Serializes `ensure_loaded`; lookups never take this.
    reload: Mutex<()>,
}

impl EgressFilter {
    /// Creates a filter over `path` and attempts an initial load.
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        let filter = Arc::new(Self {
            path: path.into(),
            state: RwLock::new(Arc::new(State::Missing)),
            reload: Mutex::new(()),
        });
        filter.ensure_loaded();
        filter
    }

    /// Installs this filter as the process-wide default consulted by every
    /// virtual network without an explicit filter. First caller wins.
    pub fn install_global(self: Arc<Self>) {
        let _ = GLOBAL_FILTER.set(self);
    }

    /// Returns the process-wide default filter, if one was installed.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_FILTER.get().cloned()
    }

    /// Path of the backing blocklist file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the blocklist if the file changed. Serialized; cheap when the
    /// modification time and size are unchanged. Never fails: any error
    /// collapses the state to `Missing`.
    pub fn ensure_loaded(&self) {
        let _guard = self.reload.lock().unwrap_or_else(|e| e.into_inner());

        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) => {
                self.collapse(&format!("stat failed: {e}"));
                return;
            }
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let size = meta.len();

        {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            if let State::Loaded {
                mtime: cur_mtime,
                size: cur_size,
                ..
            } = &**state
                && *cur_mtime == mtime
                && *cur_size == size
            {
                return;
            }
        }

        match self.load(mtime, size) {
            Ok(state) => {
                *self.state.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(state);
                info!(path = %self.path.display(), size, "blocklist loaded");
            }
            Err(e) => self.collapse(&e.to_string()),
        }
    }

    fn collapse(&self, reason: &str) {
        debug!(path = %self.path.display(), reason, "blocklist unavailable, failing closed");
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = Arc::new(State::Missing);
    }

    fn load(&self, mtime: SystemTime, size: u64) -> Result<State> {
        let file = File::open(&self.path)?;
        // SAFETY: the mapping is read-only and replaced wholesale on change;
        // a concurrent writer uses rename, never in-place truncation.
        let map = unsafe { Mmap::map(&file) }.map_err(Error::Io)?;

        if map.len() < 8 {
            return Err(Error::Serialization("blocklist shorter than header".into()));
        }
        let magic: [u8; 4] = map[0..4].try_into().unwrap();
        let mode = if magic == RANGE_MAGIC {
            Mode::Ranges
        } else if magic == TRIE_MAGIC {
            Mode::Trie
        } else {
            return Err(Error::Serialization(format!(
                "unknown blocklist magic: {magic:02x?}"
            )));
        };

        if mode == Mode::Ranges {
            let count = i32::from_be_bytes(map[4..8].try_into().unwrap());
            if count < 0 || map.len() < 8 + count as usize * 8 {
                return Err(Error::Serialization("range blocklist truncated".into()));
            }
        }

        Ok(State::Loaded {
            map,
            mode,
            mtime,
            size,
        })
    }

    /// Spawns a background task that polls `ensure_loaded` on `interval`.
    pub fn spawn_reloader(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let filter = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the constructor already loaded.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                filter.ensure_loaded();
            }
        })
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Reports whether `addr` is blocked.
    ///
    /// Loopback (127.0.0.0/8) is not egress and is always allowed. With no
    /// usable blocklist the answer is `true` for everything else.
    pub fn is_blocked(&self, addr: u32) -> bool {
        if addr >> 24 == 127 {
            return false;
        }

        let state = self.state.read().unwrap_or_else(|e| e.into_inner()).clone();
        match &*state {
            State::Missing => true,
            State::Loaded { map, mode, .. } => match mode {
                Mode::Ranges => range_lookup(map, addr),
                Mode::Trie => trie_lookup(map, addr),
            },
        }
    }

    /// Enforces the policy for an outbound URL before any connection.
    ///
    /// Literal IPv4 hosts are checked directly; domain names are resolved and
    /// every IPv4 answer must pass. Resolution failures and empty answers are
    /// denials.
    pub fn enforce_url(&self, url: &Url) -> Result<()> {
        self.ensure_loaded();

        let host = match url.host() {
            // No host (e.g. file-style schemes): nothing to enforce.
            None => return Ok(()),
            Some(host) => host,
        };

        match host {
            Host::Ipv4(v4) => {
                let addr = u32::from(v4);
                if self.is_blocked(addr) {
                    return Err(Error::egress(format!(
                        "address {} is blocked",
                        ip::format_ipv4(addr)
                    )));
                }
                Ok(())
            }
            Host::Ipv6(_) => Err(Error::egress("no resolvable IPv4 address")),
            Host::Domain(name) => {
                let port = url.port_or_known_default().unwrap_or(80);
                let answers: Vec<SocketAddr> = (name, port)
                    .to_socket_addrs()
                    .map_err(|_| Error::egress(format!("DNS failure for {name}")))?
                    .collect();

                let mut saw_v4 = false;
                for answer in answers {
                    if let SocketAddr::V4(v4) = answer {
                        saw_v4 = true;
                        let addr = u32::from(*v4.ip());
                        if self.is_blocked(addr) {
                            return Err(Error::egress(format!(
                                "{} resolves to blocked address {}",
                                name,
                                ip::format_ipv4(addr)
                            )));
                        }
                    }
                }
                if !saw_v4 {
                    return Err(Error::egress("no resolvable IPv4 address"));
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Encodings
// =============================================================================

fn range_lookup(map: &Mmap, addr: u32) -> bool {
    let count = i32::from_be_bytes(map[4..8].try_into().unwrap()) as usize;

    let entry = |i: usize| -> (u32, u32) {
        let at = 8 + i * 8;
        (
            u32::from_be_bytes(map[at..at + 4].try_into().unwrap()),
            u32::from_be_bytes(map[at + 4..at + 8].try_into().unwrap()),
        )
    };

    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let (start, end) = entry(mid);
        if addr < start {
            hi = mid;
        } else if addr > end {
            lo = mid + 1;
        } else {
            return true;
        }
    }
    false
}

/// Walks the compressed trie. The stored bit index of each node is
/// authoritative: a collapsed chain jumps the cursor forward, so the cursor
/// is reset from the node rather than incremented blindly. Structural
/// surprises (out-of-bounds offsets, unknown node types) fail closed.
fn trie_lookup(map: &Mmap, addr: u32) -> bool {
    let mut offset = TRIE_ROOT_OFFSET;
    loop {
        if offset + TRIE_NODE_SIZE > map.len() {
            return true;
        }
        let kind = map[offset];
        let bit_index = map[offset + 1] as u32;

        match kind {
            k if k == TRIE_NODE_LEAF => return true,
            k if k == TRIE_NODE_BRANCH => {
                if bit_index >= 32 {
                    return true;
                }
                let bit = (addr >> (31 - bit_index)) & 1;
                let side = if bit == 0 {
                    i32::from_be_bytes(map[offset + 2..offset + 6].try_into().unwrap())
                } else {
                    i32::from_be_bytes(map[offset + 6..offset + 10].try_into().unwrap())
                };
                if side == 0 {
                    return false;
                }
                if side < 0 {
                    return true;
                }
                offset = side as usize;
            }
            _ => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::BlocklistBuilder;

    fn write_ranges(dir: &Path, entries: &[&str]) -> PathBuf {
        let mut builder = BlocklistBuilder::new();
        for entry in entries {
            assert!(builder.add_line(entry), "rejected entry {entry}");
        }
        let path = dir.join("blocklist.bin");
        builder.write_ranges(&path).unwrap();
        path
    }

    #[test]
    fn test_missing_file_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let filter = EgressFilter::new(dir.path().join("nope.bin"));

        assert!(filter.is_blocked(ip::parse_ipv4("8.8.8.8").unwrap()));
        // Loopback is exempt even when failing closed.
        assert!(!filter.is_blocked(ip::parse_ipv4("127.0.0.1").unwrap()));
    }

    #[test]
    fn test_range_membership() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ranges(dir.path(), &["10.0.0.0/24", "203.0.113.7"]);
        let filter = EgressFilter::new(path);

        assert!(filter.is_blocked(ip::parse_ipv4("10.0.0.0").unwrap()));
        assert!(filter.is_blocked(ip::parse_ipv4("10.0.0.255").unwrap()));
        assert!(filter.is_blocked(ip::parse_ipv4("203.0.113.7").unwrap()));
        assert!(!filter.is_blocked(ip::parse_ipv4("10.0.1.0").unwrap()));
        assert!(!filter.is_blocked(ip::parse_ipv4("203.0.113.6").unwrap()));
        assert!(!filter.is_blocked(ip::parse_ipv4("8.8.8.8").unwrap()));
    }

    #[test]
    fn test_loopback_always_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ranges(dir.path(), &["127.0.0.0/8"]);
        let filter = EgressFilter::new(path);
        assert!(!filter.is_blocked(ip::parse_ipv4("127.1.2.3").unwrap()));
    }

    #[test]
    fn test_trie_blocks_listed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = BlocklistBuilder::new();
        builder.add_cidr("203.0.113.7/32").unwrap();
        let path = dir.path().join("trie.bin");
        builder.write_trie(&path).unwrap();

        let filter = EgressFilter::new(path);
        assert!(filter.is_blocked(ip::parse_ipv4("203.0.113.7").unwrap()));
    }

    #[test]
    fn test_trie_empty_allows_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trie.bin");
        BlocklistBuilder::new().write_trie(&path).unwrap();

        let filter = EgressFilter::new(path);
        assert!(!filter.is_blocked(ip::parse_ipv4("8.8.8.8").unwrap()));
        assert!(!filter.is_blocked(ip::parse_ipv4("203.0.113.7").unwrap()));
    }

    #[test]
    fn test_trie_one_sided_branch_allows_other_side() {
        // Hand-built image: branch on bit 0 with only the right side set,
        // leading to a leaf. Left-side queries walk to offset 0 (no match).
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"TRI1");
        bytes.extend_from_slice(&0_i32.to_be_bytes());
        bytes.push(TRIE_NODE_BRANCH);
        bytes.push(0);
        bytes.extend_from_slice(&0_i32.to_be_bytes());
        bytes.extend_from_slice(&18_i32.to_be_bytes());
        bytes.push(TRIE_NODE_LEAF);
        bytes.push(1);
        bytes.extend_from_slice(&0_i32.to_be_bytes());
        bytes.extend_from_slice(&0_i32.to_be_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trie.bin");
        std::fs::write(&path, &bytes).unwrap();

        let filter = EgressFilter::new(path);
        assert!(filter.is_blocked(ip::parse_ipv4("192.0.2.1").unwrap()));
        assert!(!filter.is_blocked(ip::parse_ipv4("9.9.9.9").unwrap()));
    }

    #[test]
    fn test_trie_unknown_node_type_fails_closed() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"TRI1");
        bytes.extend_from_slice(&0_i32.to_be_bytes());
        bytes.push(9);
        bytes.push(0);
        bytes.extend_from_slice(&0_i32.to_be_bytes());
        bytes.extend_from_slice(&0_i32.to_be_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trie.bin");
        std::fs::write(&path, &bytes).unwrap();

        let filter = EgressFilter::new(path);
        assert!(filter.is_blocked(ip::parse_ipv4("8.8.8.8").unwrap()));
    }

    #[test]
    fn test_bad_magic_collapses_to_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        std::fs::write(&path, b"NOPExxxxxxxx").unwrap();

        let filter = EgressFilter::new(path);
        assert!(filter.is_blocked(ip::parse_ipv4("1.1.1.1").unwrap()));
    }

    #[test]
    fn test_hot_reload_picks_up_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ranges(dir.path(), &["198.51.100.0/24"]);
        let filter = EgressFilter::new(path.clone());
        assert!(filter.is_blocked(ip::parse_ipv4("198.51.100.9").unwrap()));
        assert!(!filter.is_blocked(ip::parse_ipv4("8.8.8.8").unwrap()));

        // Replace atomically with a list that blocks something else.
        let mut builder = BlocklistBuilder::new();
        builder.add_ip("8.8.8.8").unwrap();
        // Nudge mtime granularity.
        std::thread::sleep(Duration::from_millis(20));
        builder.write_ranges(&path).unwrap();
        filter.ensure_loaded();

        assert!(filter.is_blocked(ip::parse_ipv4("8.8.8.8").unwrap()));
        assert!(!filter.is_blocked(ip::parse_ipv4("198.51.100.9").unwrap()));
    }

    #[test]
    fn test_enforce_url_no_host_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let filter = EgressFilter::new(dir.path().join("missing.bin"));
        let url = Url::parse("data:text/plain,hello").unwrap();
        assert!(filter.enforce_url(&url).is_ok());
    }

    #[test]
    fn test_enforce_url_literal_ip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ranges(dir.path(), &["203.0.113.7"]);
        let filter = EgressFilter::new(path);

        let blocked = Url::parse("http://203.0.113.7/").unwrap();
        assert!(matches!(
            filter.enforce_url(&blocked),
            Err(Error::EgressDenied { .. })
        ));

        let allowed = Url::parse("http://203.0.113.8/").unwrap();
        assert!(filter.enforce_url(&allowed).is_ok());
    }

    #[test]
    fn test_enforce_url_missing_list_denies_domains() {
        let dir = tempfile::tempdir().unwrap();
        let filter = EgressFilter::new(dir.path().join("missing.bin"));
        let url = Url::parse("http://localhost/").unwrap();
        // localhost resolves to loopback, which stays exempt.
        assert!(filter.enforce_url(&url).is_ok());

        let remote = Url::parse("http://192.0.2.9/").unwrap();
        assert!(filter.enforce_url(&remote).is_err());
    }
}
