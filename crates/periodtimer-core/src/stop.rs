//! Cooperative stop signal checked at period boundaries

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable stop flag
///
/// A [`child`](StopSignal::child) observes its parent but raising the child
/// leaves the parent untouched, so a runner can stop its own loops without
/// signalling the caller.
#[derive(Debug, Clone)]
pub struct StopSignal {
    flags: Vec<Arc<AtomicBool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            flags: vec![Arc::new(AtomicBool::new(false))],
        }
    }

    /// Derive a signal that is raised when either it or `self` is raised
    pub fn child(&self) -> Self {
        let mut flags = self.flags.clone();
        flags.push(Arc::new(AtomicBool::new(false)));
        Self { flags }
    }

    /// Raise this signal (and therefore every child of it)
    pub fn raise(&self) {
        if let Some(own) = self.flags.last() {
            own.store(true, Ordering::Release);
        }
    }

    pub fn is_raised(&self) -> bool {
        self.flags.iter().any(|f| f.load(Ordering::Acquire))
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_is_shared_between_clones() {
        let stop = StopSignal::new();
        let clone = stop.clone();
        assert!(!clone.is_raised());
        stop.raise();
        assert!(clone.is_raised());
    }

    #[test]
    fn test_child_sees_parent_but_not_reverse() {
        let parent = StopSignal::new();
        let child = parent.child();
        child.raise();
        assert!(child.is_raised());
        assert!(!parent.is_raised());

        let other = parent.child();
        parent.raise();
        assert!(other.is_raised());
    }

    #[test]
    fn test_default_signal_can_be_raised() {
        let stop = StopSignal::default();
        assert!(!stop.is_raised());
        stop.raise();
        assert!(stop.is_raised());
    }
}
