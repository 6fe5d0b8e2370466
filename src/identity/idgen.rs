//! Id generators
//!
//! Frame ids and trace ids come from an injected [`IdGenerator`] rather than
//! a process-wide singleton.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of unique 64-bit ids
pub trait IdGenerator: Send + Sync {
    /// Reseed the generator
    fn init(&self, seed: u64);

    /// Next id
    fn generate(&self) -> u64;
}

/// Monotonic counter starting after a seed
#[derive(Debug)]
pub struct SequenceIdGenerator {
    next: AtomicU64,
}

impl SequenceIdGenerator {
    pub fn new() -> Self {
        Self::with_seed(rand::random::<u32>() as u64)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }
}

impl Default for SequenceIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn init(&self, seed: u64) {
        self.next.store(seed, Ordering::SeqCst);
    }

    fn generate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }
}

/// Custom epoch (2020-01-01T00:00:00Z) in milliseconds
const SNOWFLAKE_EPOCH_MS: u64 = 1_577_836_800_000;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug, Default)]
struct SnowflakeState {
    node: u64,
    last_ms: u64,
    sequence: u64,
}

/// Time-ordered ids: `millis(41) | node(10) | sequence(12)`
#[derive(Debug, Default)]
pub struct SnowflakeIdGenerator {
    state: Mutex<SnowflakeState>,
}

impl SnowflakeIdGenerator {
    pub fn new(node: u64) -> Self {
        let generator = Self::default();
        generator.init(node);
        generator
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .saturating_sub(SNOWFLAKE_EPOCH_MS)
    }
}

impl IdGenerator for SnowflakeIdGenerator {
    fn init(&self, seed: u64) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.node = seed & ((1 << NODE_BITS) - 1);
    }

    fn generate(&self) -> u64 {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut now = Self::now_ms().max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // sequence exhausted within this millisecond, borrow the next one
                now += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        now << (NODE_BITS + SEQUENCE_BITS) | state.node << SEQUENCE_BITS | state.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequence_generator() {
        let generator = SequenceIdGenerator::with_seed(41);
        assert_eq!(generator.generate(), 42);
        assert_eq!(generator.generate(), 43);
        generator.init(0);
        assert_eq!(generator.generate(), 1);
    }

    #[test]
    fn test_snowflake_unique_and_increasing() {
        let generator = SnowflakeIdGenerator::new(7);
        let mut last = 0;
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = generator.generate();
            assert!(id > last);
            assert_eq!((id >> SEQUENCE_BITS) & ((1 << NODE_BITS) - 1), 7);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn test_shared_across_threads() {
        let generator: Arc<dyn IdGenerator> = Arc::new(SequenceIdGenerator::with_seed(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..250).map(|_| generator.generate()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 1000);
    }
}
