//! In-flight work tracking
//!
//! Two small guards keep the schedulers from stepping on themselves and on
//! each other:
//!
//! - [`CycleGate`] admits at most one running cycle of a given kind, so a
//!   manual trigger cannot overlap the background loop.
//! - [`InFlightGuards`] admits at most one worker per `(user, provider)`
//!   pair. The same set is shared by the refresh and poll schedulers, so a
//!   poll never races a refresh on the same connection.
//!
//! Both hand out RAII passes; releasing is a `Drop`, never a call site
//! obligation. The mutex is only held for the membership check itself,
//! never across an await.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::providers::Provider;

/// Shared registry of `(user, provider)` pairs currently being worked on.
#[derive(Debug, Clone, Default)]
pub struct InFlightGuards {
    active: Arc<Mutex<HashSet<(Uuid, Provider)>>>,
}

impl InFlightGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the pair, or returns `None` when another worker already holds
    /// it. The claim is released when the returned guard drops.
    pub fn try_begin(&self, user_id: Uuid, provider: Provider) -> Option<InFlightGuard> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if active.insert((user_id, provider)) {
            Some(InFlightGuard {
                registry: Arc::clone(&self.active),
                key: (user_id, provider),
            })
        } else {
            None
        }
    }

    /// Number of pairs currently claimed.
    pub fn len(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII claim on one `(user, provider)` pair.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<Mutex<HashSet<(Uuid, Provider)>>>,
    key: (Uuid, Provider),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Single-admission gate for one cycle kind.
#[derive(Debug, Clone, Default)]
pub struct CycleGate {
    running: Arc<AtomicBool>,
}

impl CycleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the gate, or returns `None` while another cycle holds it.
    pub fn try_acquire(&self) -> Option<CyclePass> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(CyclePass {
                running: Arc::clone(&self.running),
            })
        } else {
            None
        }
    }

    /// Whether a cycle currently holds the gate.
    pub fn is_held(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// RAII pass for one admitted cycle.
#[derive(Debug)]
pub struct CyclePass {
    running: Arc<AtomicBool>,
}

impl Drop for CyclePass {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
