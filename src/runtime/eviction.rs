// src/runtime/eviction.rs
//! Victim selection when the pool is at capacity
//!
//! The pool only ever offers `ready` handles as candidates, so a policy can
//! never pick a handle that owns a query.

use crate::runtime::worker_handle::{HandleId, WorkspaceKey};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;

/// Configured eviction strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Least recently used ready handle
    #[default]
    Lru,

    /// Least recently used ready handle idle for longer than the idle threshold
    IdleTimeout,
}

impl EvictionStrategy {
    /// Build the policy; `idle_threshold` is the pool's idle eviction threshold
    pub fn build(self, idle_threshold: Option<Duration>) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionStrategy::Lru => Box::new(LeastRecentlyUsed),
            EvictionStrategy::IdleTimeout => Box::new(IdleTimeout {
                threshold: idle_threshold.unwrap_or(Duration::ZERO),
            }),
        }
    }
}

/// What a policy sees of each ready handle
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub handle_id: HandleId,
    pub workspace: WorkspaceKey,
    pub last_used_at: Instant,
    pub spawned_at: Instant,
}

impl EvictionCandidate {
    fn lru_key(&self) -> (Instant, Instant, HandleId) {
        (self.last_used_at, self.spawned_at, self.handle_id)
    }
}

/// Chooses which ready handle to retire to make room
pub trait EvictionPolicy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    fn select_victim(&self, candidates: &[EvictionCandidate], now: Instant) -> Option<HandleId>;
}

/// Oldest `last_used_at` wins; ties go to the older spawn, then the lower id
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyUsed;

impl EvictionPolicy for LeastRecentlyUsed {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn select_victim(&self, candidates: &[EvictionCandidate], _now: Instant) -> Option<HandleId> {
        candidates
            .iter()
            .min_by_key(|c| c.lru_key())
            .map(|c| c.handle_id)
    }
}

/// Like LRU, restricted to handles idle longer than `threshold`
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    pub threshold: Duration,
}

impl EvictionPolicy for IdleTimeout {
    fn name(&self) -> &'static str {
        "idle_timeout"
    }

    fn select_victim(&self, candidates: &[EvictionCandidate], now: Instant) -> Option<HandleId> {
        candidates
            .iter()
            .filter(|c| now.saturating_duration_since(c.last_used_at) > self.threshold)
            .min_by_key(|c| c.lru_key())
            .map(|c| c.handle_id)
    }
}
