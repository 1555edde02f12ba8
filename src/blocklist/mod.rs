//! Binary IP blocklist: building and enforcement.
//!
//! Two on-disk encodings share a 4-byte magic prefix:
//!
//! ```text
//! RNG1: "RNG1" | count i32 | count x (start u32, end u32)   sorted, inclusive
//! TRI1: "TRI1" | reserved  | node records, root at offset 8
//!       node: type u8 (1=branch, 2=leaf) | bit index u8 | left i32 | right i32
//! ```
//!
//! [`builder::BlocklistBuilder`] ingests IP/CIDR feeds and writes either
//! encoding atomically; [`filter::EgressFilter`] memory-maps a file and
//! answers lookups, failing closed whenever the file is missing or malformed.

pub mod builder;
pub mod filter;

pub use builder::{BlocklistBuilder, IpRange};
pub use filter::EgressFilter;
