//! Acquisition source selection.
//!
//! `SourceSelector` owns the prioritized list of sources and which one is active.
//! Health flags are written only here. The orchestration loop and the background
//! prober call in concurrently, so all state sits behind one mutex.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Primary,
    Fallback,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Primary => "primary",
            SourceKind::Fallback => "fallback",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: String,
    /// Collaborator-specific address, e.g. `stub://front` or `/dev/video0`.
    pub locator: String,
    /// Lower is preferred.
    pub priority: u8,
    pub kind: SourceKind,
    pub is_healthy: bool,
}

impl SourceDescriptor {
    pub fn new(id: &str, locator: &str, priority: u8, kind: SourceKind) -> Self {
        Self {
            id: id.to_string(),
            locator: locator.to_string(),
            priority,
            kind,
            is_healthy: true,
        }
    }
}

/// No healthy source other than the failed one is left.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoneAvailable;

impl fmt::Display for NoneAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no healthy acquisition source available")
    }
}

impl std::error::Error for NoneAvailable {}

struct SelectorState {
    /// Sorted by priority, registration order within a priority.
    sources: Vec<SourceDescriptor>,
    active: usize,
    switches: u64,
}

pub struct SourceSelector {
    inner: Mutex<SelectorState>,
}

impl SourceSelector {
    /// The first source in priority order starts active.
    pub fn new(mut sources: Vec<SourceDescriptor>) -> Result<Self> {
        if sources.is_empty() {
            return Err(anyhow!("at least one acquisition source is required"));
        }
        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.id.as_str()) {
                return Err(anyhow!("duplicate source id '{}'", source.id));
            }
        }
        // Stable sort keeps registration order on equal priority.
        sources.sort_by_key(|s| s.priority);
        let active = sources.iter().position(|s| s.is_healthy).unwrap_or(0);
        Ok(Self {
            inner: Mutex::new(SelectorState {
                sources,
                active,
                switches: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SelectorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> SourceDescriptor {
        let state = self.lock();
        state.sources[state.active].clone()
    }

    pub fn snapshot(&self) -> Vec<SourceDescriptor> {
        self.lock().sources.clone()
    }

    /// Number of times the active source changed.
    pub fn switches(&self) -> u64 {
        self.lock().switches
    }

    pub fn healthy_count(&self) -> usize {
        self.lock().sources.iter().filter(|s| s.is_healthy).count()
    }

    /// Mark `id` unhealthy. When it is the active source, switch away from it.
    ///
    /// Returns `None` when `id` was not active, otherwise the switch result.
    pub fn mark_unhealthy(&self, id: &str) -> Option<Result<SourceDescriptor, NoneAvailable>> {
        let mut state = self.lock();
        let idx = state.sources.iter().position(|s| s.id == id)?;
        state.sources[idx].is_healthy = false;
        if idx != state.active {
            return None;
        }
        Some(switch_locked(&mut state))
    }

    pub fn mark_healthy(&self, id: &str) -> bool {
        let mut state = self.lock();
        match state.sources.iter_mut().find(|s| s.id == id) {
            Some(source) => {
                source.is_healthy = true;
                true
            }
            None => false,
        }
    }

    /// Switch to the highest-priority healthy source other than the active one.
    ///
    /// When the active source is the only healthy one this is a no-op returning it.
    pub fn switch_to_next(&self) -> Result<SourceDescriptor, NoneAvailable> {
        let mut state = self.lock();
        switch_locked(&mut state)
    }

    /// Manual switch: next healthy source after the active one in priority order,
    /// wrapping around.
    pub fn rotate(&self) -> Result<SourceDescriptor, NoneAvailable> {
        let mut state = self.lock();
        let len = state.sources.len();
        let next = (1..len)
            .map(|step| (state.active + step) % len)
            .find(|&idx| state.sources[idx].is_healthy)
            .ok_or(NoneAvailable)?;
        state.active = next;
        state.switches += 1;
        Ok(state.sources[next].clone())
    }

    /// Give every failed source other than the active one another chance.
    /// Returns how many were re-admitted.
    pub fn readmit_failed(&self) -> usize {
        let mut state = self.lock();
        let active = state.active;
        let mut readmitted = 0;
        for (idx, source) in state.sources.iter_mut().enumerate() {
            if idx != active && !source.is_healthy {
                source.is_healthy = true;
                readmitted += 1;
            }
        }
        readmitted
    }
}

fn switch_locked(state: &mut SelectorState) -> Result<SourceDescriptor, NoneAvailable> {
    let current = state.active;
    let candidate = state
        .sources
        .iter()
        .enumerate()
        .find(|(idx, s)| *idx != current && s.is_healthy)
        .map(|(idx, _)| idx);
    match candidate {
        Some(idx) => {
            state.active = idx;
            state.switches += 1;
            Ok(state.sources[idx].clone())
        }
        None if state.sources[current].is_healthy => Ok(state.sources[current].clone()),
        None => Err(NoneAvailable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn two_sources() -> SourceSelector {
        SourceSelector::new(vec![
            SourceDescriptor::new("laptop", "stub://laptop", 1, SourceKind::Fallback),
            SourceDescriptor::new("drone", "stub://drone", 0, SourceKind::Primary),
        ])
        .unwrap()
    }

    #[test]
    fn highest_priority_source_starts_active() {
        assert_eq!(two_sources().active().id, "drone");
    }

    #[test]
    fn failing_active_source_switches_to_fallback() {
        let selector = two_sources();
        let switched = selector.mark_unhealthy("drone").unwrap().unwrap();
        assert_eq!(switched.id, "laptop");
        assert_eq!(selector.active().id, "laptop");
        assert_eq!(selector.switches(), 1);
    }

    #[test]
    fn marking_inactive_source_does_not_switch() {
        let selector = two_sources();
        assert!(selector.mark_unhealthy("laptop").is_none());
        assert_eq!(selector.active().id, "drone");
        assert_eq!(selector.healthy_count(), 1);
    }

    #[test]
    fn single_unhealthy_source_reports_none_available() {
        let selector = SourceSelector::new(vec![SourceDescriptor::new(
            "cam",
            "stub://cam",
            0,
            SourceKind::Primary,
        )])
        .unwrap();
        assert_eq!(selector.mark_unhealthy("cam"), Some(Err(NoneAvailable)));
        assert_eq!(selector.switch_to_next(), Err(NoneAvailable));
    }

    #[test]
    fn switch_is_idempotent_on_only_healthy_source() {
        let selector = two_sources();
        selector.mark_unhealthy("drone");
        let first = selector.switch_to_next().unwrap();
        let second = selector.switch_to_next().unwrap();
        assert_eq!(first, second);
        assert_eq!(selector.switches(), 1);
    }

    #[test]
    fn equal_priority_keeps_registration_order() {
        let selector = SourceSelector::new(vec![
            SourceDescriptor::new("a", "stub://a", 0, SourceKind::Primary),
            SourceDescriptor::new("b", "stub://b", 1, SourceKind::Fallback),
            SourceDescriptor::new("c", "stub://c", 1, SourceKind::Fallback),
        ])
        .unwrap();
        assert_eq!(selector.switch_to_next().unwrap().id, "b");
        assert_eq!(selector.rotate().unwrap().id, "c");
        assert_eq!(selector.rotate().unwrap().id, "a");
    }

    #[test]
    fn readmit_restores_failed_sources() {
        let selector = two_sources();
        selector.mark_unhealthy("drone");
        assert_eq!(selector.mark_unhealthy("laptop"), Some(Err(NoneAvailable)));
        assert_eq!(selector.readmit_failed(), 1);
        assert_eq!(selector.switch_to_next().unwrap().id, "drone");
    }

    #[test]
    fn rejects_duplicate_ids() {
        assert!(SourceSelector::new(vec![
            SourceDescriptor::new("a", "stub://a", 0, SourceKind::Primary),
            SourceDescriptor::new("a", "stub://b", 1, SourceKind::Fallback),
        ])
        .is_err());
    }

    #[test]
    fn concurrent_health_updates_are_serialized() {
        let selector = Arc::new(two_sources());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let selector = selector.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if i % 2 == 0 {
                            selector.mark_healthy("laptop");
                        } else {
                            selector.mark_unhealthy("laptop");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        selector.mark_healthy("laptop");
        assert_eq!(selector.healthy_count(), 2);
    }
}
