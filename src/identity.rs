//! Generation of fresh cache key identifiers
//!
//! Keys whose dependencies match nothing in storage get a new opaque
//! identifier. The generator is injected into the manager so tests can use
//! predictable identifiers.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Source of new, unique identifiers
pub trait IdGenerator: Send + Sync {
    fn new_id(&self) -> String;
}

/// Random identifiers backed by UUID v4
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdGenerator for RandomIds {
    fn new_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Deterministic `<prefix>-<n>` identifiers, counting from 1
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn new_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}
