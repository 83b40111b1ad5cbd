//! Document id generation.
//!
//! Workspaces mint ids for new documents and for interior block objects
//! through a pluggable [`IdGenerator`]. The default produces UUID v4
//! strings, unique per process and across replicas.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Strategy for producing unique string identifiers.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Default generator: random UUID v4 strings.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic generator for tests: `"0"`, `"1"`, `"2"`, …
#[derive(Debug, Default)]
pub struct AutoIncrementIdGenerator {
    next: AtomicU64,
}

impl IdGenerator for AutoIncrementIdGenerator {
    fn generate(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}
