//! Radix module
//!
//! Binary patricia trie keyed by 32- or 64-bit integers with explicit masks.

pub mod trie;

pub use trie::{RadixKey, RadixTrie};
