//! Binary radix trie
//!
//! Nodes live in an arena and refer to each other by index; detached leaves
//! go back to a free list and are reset before reuse.

use std::fmt::Debug;

use crate::error::P2pError;

/// Integer key usable in a [`RadixTrie`]
pub trait RadixKey: Copy + Eq + Debug {
    /// Width of the key in bits
    const BITS: u32;
    /// Sentinel marking a node without a value
    const EMPTY: Self;

    /// Bit at `index`, counted from the most significant bit
    fn bit(self, index: u32) -> bool;
}

impl RadixKey for u32 {
    const BITS: u32 = 32;
    const EMPTY: Self = u32::MAX;

    fn bit(self, index: u32) -> bool {
        self & (0x8000_0000u32 >> index) != 0
    }
}

impl RadixKey for u64 {
    const BITS: u32 = 64;
    const EMPTY: Self = u64::MAX;

    fn bit(self, index: u32) -> bool {
        self & (0x8000_0000_0000_0000u64 >> index) != 0
    }
}

#[derive(Debug, Clone)]
struct RadixNode<K> {
    left: Option<usize>,
    right: Option<usize>,
    parent: Option<usize>,
    value: K,
}

impl<K: RadixKey> RadixNode<K> {
    fn new(parent: Option<usize>) -> Self {
        Self {
            left: None,
            right: None,
            parent,
            value: K::EMPTY,
        }
    }

    fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    fn is_empty(&self) -> bool {
        self.value == K::EMPTY
    }

    fn child(&self, right: bool) -> Option<usize> {
        if right {
            self.right
        } else {
            self.left
        }
    }
}

const ROOT: usize = 0;

/// Longest-prefix-match trie over `u32` or `u64` keys
///
/// Not internally synchronized; callers serialize access.
#[derive(Debug, Clone)]
pub struct RadixTrie<K> {
    nodes: Vec<RadixNode<K>>,
    free: Vec<usize>,
}

impl<K: RadixKey> Default for RadixTrie<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: RadixKey> RadixTrie<K> {
    pub fn new() -> Self {
        Self {
            nodes: vec![RadixNode::new(None)],
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, parent: usize) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = RadixNode::new(Some(parent));
                index
            }
            None => {
                self.nodes.push(RadixNode::new(Some(parent)));
                self.nodes.len() - 1
            }
        }
    }

    /// Number of mask bits set from the MSB
    fn prefix_len(mask: K) -> u32 {
        (0..K::BITS).take_while(|i| mask.bit(*i)).count() as u32
    }

    /// Store `value` under `key/mask`, creating the path as needed.
    /// Re-adding the same prefix overwrites its value.
    pub fn add(&mut self, key: K, mask: K, value: K) -> Result<(), P2pError> {
        if value == K::EMPTY {
            return Err(P2pError::validation_error_with_field(
                "value collides with the empty sentinel",
                "value",
            ));
        }

        let depth = Self::prefix_len(mask);
        let mut current = ROOT;
        for i in 0..depth {
            let right = key.bit(i);
            current = match self.nodes[current].child(right) {
                Some(next) => next,
                None => {
                    let next = self.alloc(current);
                    if right {
                        self.nodes[current].right = Some(next);
                    } else {
                        self.nodes[current].left = Some(next);
                    }
                    next
                }
            };
        }
        self.nodes[current].value = value;
        Ok(())
    }

    /// Remove the value stored under `key/mask`.
    ///
    /// A terminal leaf is detached and recycled, along with any ancestors
    /// left as empty leaves; an interior node only loses its value.
    /// Deleting an absent prefix is a no-op.
    pub fn del(&mut self, key: K, mask: K) {
        let depth = Self::prefix_len(mask);
        let mut current = ROOT;
        for i in 0..depth {
            match self.nodes[current].child(key.bit(i)) {
                Some(next) => current = next,
                None => return,
            }
        }

        self.nodes[current].value = K::EMPTY;
        while current != ROOT && self.nodes[current].is_leaf() && self.nodes[current].is_empty() {
            let parent = match self.nodes[current].parent {
                Some(parent) => parent,
                None => break,
            };
            if self.nodes[parent].left == Some(current) {
                self.nodes[parent].left = None;
            }
            if self.nodes[parent].right == Some(current) {
                self.nodes[parent].right = None;
            }
            self.nodes[current] = RadixNode::new(None);
            self.free.push(current);
            current = parent;
        }
    }

    /// Longest-prefix match for `key`
    pub fn get(&self, key: K) -> Result<K, P2pError> {
        let mut found = None;
        let mut current = Some(ROOT);
        let mut i = 0;
        while let Some(index) = current {
            let node = &self.nodes[index];
            if !node.is_empty() {
                found = Some(node.value);
            }
            if i >= K::BITS {
                break;
            }
            current = node.child(key.bit(i));
            i += 1;
        }
        found.ok_or_else(|| P2pError::not_found_with_key("no matching prefix", format!("{:?}", key)))
    }

    /// Every stored value, in key order
    pub fn list(&self) -> Vec<K> {
        let mut values = Vec::new();
        let mut stack = Vec::with_capacity(K::BITS as usize + 1);
        let mut current = Some(ROOT);

        while current.is_some() || !stack.is_empty() {
            while let Some(index) = current {
                stack.push(index);
                current = self.nodes[index].left;
            }
            if let Some(index) = stack.pop() {
                let node = &self.nodes[index];
                if !node.is_empty() {
                    values.push(node.value);
                }
                current = node.right;
            }
        }
        values
    }

    /// Nodes currently attached to the trie, root included
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list().is_empty()
    }
}
