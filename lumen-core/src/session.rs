//! Per-sender correlation state: one random source id and a sequence counter
//! per target.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use crate::target::Target;

/// Owned by a sender and passed explicitly to packet templating.
#[derive(Debug)]
pub struct SessionContext {
    source: u32,
    sequences: Mutex<HashMap<Option<Target>, u8>>,
}

impl SessionContext {
    /// New context with a random non-zero source.
    pub fn new() -> Self {
        Self::with_source(rand::thread_rng().gen_range(1..=u32::MAX))
    }

    pub fn with_source(source: u32) -> Self {
        Self {
            source,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> u32 {
        self.source
    }

    /// Next sequence for `target` (None is the broadcast counter). Starts at
    /// 1 and wraps at 256.
    pub fn seq(&self, target: Option<Target>) -> u8 {
        let mut sequences = match self.sequences.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = sequences.entry(target).or_insert(0);
        *next = next.wrapping_add(1);
        *next
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}
