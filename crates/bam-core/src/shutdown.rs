//! External shutdown signal, polled at each exploration step and block entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cloneable handle to a shutdown flag. Requesting shutdown aborts the
/// current and all enclosing recursive invocations; an aborted block
/// analysis is never committed to the cache as finished.
#[derive(Clone, Default)]
pub struct ShutdownNotifier {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    requested: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. The first reason wins.
    pub fn request(&self, reason: &str) {
        let mut slot = self.inner.reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
        self.inner.requested.store(true, Ordering::Release);
    }

    #[inline]
    pub fn should_shutdown(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> String {
        self.inner
            .reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "shutdown requested".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let s = ShutdownNotifier::new();
        assert!(!s.should_shutdown());
        let clone = s.clone();
        clone.request("limit reached");
        s.request("second");
        assert!(s.should_shutdown());
        assert_eq!(s.reason(), "limit reached");
    }
}
