//! Single-resident-model gate.
//!
//! Ollama serves one model at a time, and CPU-only machines cannot hold
//! two. Every topic agent acquires the gate before generating, so
//! concurrent explanation requests serialize on one resident model
//! instead of swapping models under each other.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use super::generation::GenerationError;
use super::topic::Topic;

/// Snapshot of the generation currently holding the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveGeneration {
    pub topic: Topic,
    pub model: String,
    /// ISO 8601.
    pub started_at: String,
}

/// Exclusive model access controller. Share behind `Arc` across threads.
pub struct ModelGate {
    lock: Mutex<()>,
    current: Mutex<Option<ActiveGeneration>>,
}

impl ModelGate {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            current: Mutex::new(None),
        }
    }

    /// Block until the model is free. Hold the guard for the whole call.
    pub fn acquire(&self, topic: Topic, model: &str) -> Result<GateGuard<'_>, GenerationError> {
        let guard = self.lock.lock().map_err(|_| GenerationError::ModelGate)?;
        self.set_current(topic, model);
        Ok(GateGuard {
            _guard: guard,
            gate: self,
        })
    }

    /// Non-blocking variant: `None` while another generation runs.
    pub fn try_acquire(&self, topic: Topic, model: &str) -> Option<GateGuard<'_>> {
        let guard = self.lock.try_lock().ok()?;
        self.set_current(topic, model);
        Some(GateGuard {
            _guard: guard,
            gate: self,
        })
    }

    pub fn current(&self) -> Option<ActiveGeneration> {
        self.current.lock().ok()?.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    fn set_current(&self, topic: Topic, model: &str) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(ActiveGeneration {
                topic,
                model: model.to_string(),
                started_at: chrono::Utc::now().to_rfc3339(),
            });
        }
    }

    fn clear_current(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
    }
}

impl Default for ModelGate {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII access token; dropping it frees the gate.
pub struct GateGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    gate: &'a ModelGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.clear_current();
    }
}
