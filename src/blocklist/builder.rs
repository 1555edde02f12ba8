//! Blocklist builder: feed ingestion, range coalescing, prefix trie.
//!
//! Feeds are plain text, one entry per line. A line may carry a `#` comment;
//! the first whitespace/comma/semicolon-separated token is inspected and kept
//! only when it looks like an IPv4 address or CIDR block. Everything else is
//! ignored, so raw threat-intel exports can be ingested as-is.
//!
//! The builder maintains two parallel structures over the same entries:
//! a sorted list of coalesced inclusive ranges (serialized as `RNG1`) and a
//! binary prefix trie where an inserted prefix terminates its path and prunes
//! the subtree beneath it, so shorter prefixes dominate longer ones
//! (serialized as `TRI1` after path compression).

use crate::constants::{
    RANGE_MAGIC, TRIE_MAGIC, TRIE_NODE_BRANCH, TRIE_NODE_LEAF, TRIE_NODE_SIZE, TRIE_ROOT_OFFSET,
};
use crate::error::{Error, Result};
use crate::ip;
use regex::Regex;
use std::fs;
use std::io::BufRead;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

fn ipv4_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").unwrap())
}

fn cidr_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}/\d{1,2}$").unwrap())
}

/// Inclusive IPv4 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    /// First address in the range.
    pub first: u32,
    /// Last address in the range.
    pub last: u32,
}

// =============================================================================
// Prefix Trie
// =============================================================================

#[derive(Debug, Default)]
struct TrieNode {
    terminal: bool,
    children: [Option<Box<TrieNode>>; 2],
}

impl TrieNode {
    /// Inserts a prefix of `bits` leading bits of `ip`. A terminal reached on
    /// the way down already covers the new prefix; a new terminal prunes
    /// everything below it.
    fn insert(&mut self, ip: u32, bits: u8, depth: u8) {
        if self.terminal {
            return;
        }
        if depth == bits {
            self.terminal = true;
            self.children = [None, None];
            return;
        }
        let bit = ((ip >> (31 - depth)) & 1) as usize;
        self.children[bit]
            .get_or_insert_with(Box::default)
            .insert(ip, bits, depth + 1);
    }
}

/// Path-compressed trie node, ready for serialization.
#[derive(Debug)]
enum Compressed {
    Leaf { depth: u8 },
    Branch { depth: u8, left: Box<Compressed>, right: Box<Compressed> },
}

/// Compresses a trie subtree: a terminal becomes a leaf carrying its bit
/// depth, a single-child node collapses into that child, and only nodes with
/// both children survive as branches. The stored depth lets the lookup reset
/// its bit cursor after a collapsed chain.
fn compress(node: &TrieNode, depth: u8) -> Option<Compressed> {
    if node.terminal {
        return Some(Compressed::Leaf { depth });
    }
    let left = node.children[0]
        .as_deref()
        .and_then(|child| compress(child, depth + 1));
    let right = node.children[1]
        .as_deref()
        .and_then(|child| compress(child, depth + 1));
    match (left, right) {
        (None, None) => None,
        (Some(only), None) | (None, Some(only)) => Some(only),
        (Some(left), Some(right)) => Some(Compressed::Branch {
            depth,
            left: Box::new(left),
            right: Box::new(right),
        }),
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct FlatNode {
    kind: u8,
    bit_index: u8,
    left: u32,
    right: u32,
}

/// Flattens the compressed trie in preorder so the root lands at the fixed
/// root offset. Returns the index of the subtree root.
fn flatten(node: &Compressed, out: &mut Vec<FlatNode>) -> usize {
    let index = out.len();
    out.push(FlatNode::default());
    match node {
        Compressed::Leaf { depth } => {
            out[index] = FlatNode {
                kind: TRIE_NODE_LEAF,
                bit_index: *depth,
                left: 0,
                right: 0,
            };
        }
        Compressed::Branch { depth, left, right } => {
            let left_index = flatten(left, out);
            let right_index = flatten(right, out);
            out[index] = FlatNode {
                kind: TRIE_NODE_BRANCH,
                bit_index: *depth,
                left: node_offset(left_index),
                right: node_offset(right_index),
            };
        }
    }
    index
}

fn node_offset(index: usize) -> u32 {
    (TRIE_ROOT_OFFSET + index * TRIE_NODE_SIZE) as u32
}

// =============================================================================
// Builder
// =============================================================================

/// Accumulates blocklist entries and serializes them.
#[derive(Debug, Default)]
pub struct BlocklistBuilder {
    ranges: Vec<IpRange>,
    trie: TrieNode,
    entries: usize,
}

impl BlocklistBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries accepted so far.
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Returns true when no entry has been accepted.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Ingests every line of a feed. Returns the number of entries accepted
    /// from this feed.
    pub fn add_source(&mut self, reader: impl BufRead) -> Result<usize> {
        let mut accepted = 0;
        for line in reader.lines() {
            if self.add_line(&line?) {
                accepted += 1;
            }
        }
        debug!(accepted, "ingested blocklist feed");
        Ok(accepted)
    }

    /// Ingests a single feed line. Returns true when the line contributed an
    /// entry.
    pub fn add_line(&mut self, line: &str) -> bool {
        let line = line.split('#').next().unwrap_or("");
        let token = match line
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .find(|t| !t.is_empty())
        {
            Some(token) => token,
            None => return false,
        };

        if cidr_pattern().is_match(token) {
            match self.add_cidr(token) {
                Ok(()) => true,
                Err(_) => {
                    debug!(token, "skipping malformed CIDR token");
                    false
                }
            }
        } else if ipv4_pattern().is_match(token) {
            match self.add_ip(token) {
                Ok(()) => true,
                Err(_) => {
                    debug!(token, "skipping malformed address token");
                    false
                }
            }
        } else {
            false
        }
    }

    /// Adds a single address as a /32 entry.
    pub fn add_ip(&mut self, text: &str) -> Result<()> {
        let addr = ip::parse_ipv4(text)?;
        self.push(IpRange { first: addr, last: addr }, addr, 32);
        Ok(())
    }

    /// Adds a CIDR block.
    pub fn add_cidr(&mut self, text: &str) -> Result<()> {
        let (first, last) = ip::cidr_range(text)?;
        let bits = text
            .split_once('/')
            .map(|(_, p)| p.parse::<u8>().unwrap_or(32))
            .unwrap_or(32);
        self.push(IpRange { first, last }, first, bits);
        Ok(())
    }

    fn push(&mut self, range: IpRange, prefix: u32, bits: u8) {
        self.ranges.push(range);
        self.trie.insert(prefix, bits, 0);
        self.entries += 1;
    }

    /// Returns the sorted, coalesced ranges. Adjacent and overlapping ranges
    /// merge: `r` folds into the running range when `r.first <= cur.last + 1`.
    pub fn coalesced(&self) -> Vec<IpRange> {
        let mut sorted = self.ranges.clone();
        sorted.sort_by_key(|r| (r.first, r.last));

        let mut out: Vec<IpRange> = Vec::with_capacity(sorted.len());
        for range in sorted {
            match out.last_mut() {
                Some(cur) if range.first <= cur.last.saturating_add(1) => {
                    cur.last = cur.last.max(range.last);
                }
                _ => out.push(range),
            }
        }
        out
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Serializes the coalesced ranges as an `RNG1` image.
    pub fn range_bytes(&self) -> Vec<u8> {
        let ranges = self.coalesced();
        let mut buf = Vec::with_capacity(8 + ranges.len() * 8);
        buf.extend_from_slice(&RANGE_MAGIC);
        buf.extend_from_slice(&(ranges.len() as i32).to_be_bytes());
        for range in &ranges {
            buf.extend_from_slice(&range.first.to_be_bytes());
            buf.extend_from_slice(&range.last.to_be_bytes());
        }
        buf
    }

    /// Serializes the compressed prefix trie as a `TRI1` image.
    ///
    /// An empty builder produces a childless branch at the root, which
    /// matches nothing.
    pub fn trie_bytes(&self) -> Vec<u8> {
        let mut nodes = Vec::new();
        match compress(&self.trie, 0) {
            Some(root) => {
                flatten(&root, &mut nodes);
            }
            None => nodes.push(FlatNode {
                kind: TRIE_NODE_BRANCH,
                bit_index: 0,
                left: 0,
                right: 0,
            }),
        }

        let mut buf = Vec::with_capacity(TRIE_ROOT_OFFSET + nodes.len() * TRIE_NODE_SIZE);
        buf.extend_from_slice(&TRIE_MAGIC);
        buf.extend_from_slice(&0_i32.to_be_bytes());
        for node in &nodes {
            buf.push(node.kind);
            buf.push(node.bit_index);
            buf.extend_from_slice(&(node.left as i32).to_be_bytes());
            buf.extend_from_slice(&(node.right as i32).to_be_bytes());
        }
        buf
    }

    /// Writes the `RNG1` encoding to `path` atomically.
    pub fn write_ranges(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.range_bytes())?;
        info!(path = %path.display(), entries = self.entries, "wrote range blocklist");
        Ok(())
    }

    /// Writes the `TRI1` encoding to `path` atomically.
    pub fn write_trie(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.trie_bytes())?;
        info!(path = %path.display(), entries = self.entries, "wrote trie blocklist");
        Ok(())
    }
}

/// Stages `data` in a sibling temp file, then renames over `path` so readers
/// never observe a torn file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
    }

    let temp_name = format!("tmp.{}", uuid::Uuid::now_v7());
    let temp_path = path.with_extension(temp_name);
    fs::write(&temp_path, data).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::StorageWriteFailed(e.to_string())
    })?;
    Ok(())
}
