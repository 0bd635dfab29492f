use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Cooperative cancellation shared between a caller and long-running work.
/// Work polls [`Cancellation::is_cancelled`] and abandons itself without
/// publishing anything when it turns true.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// Never cancelled unless [`Cancellation::cancel`] is called.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self
                .deadline
                .map(|deadline| Instant::now() >= deadline)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_visible_through_clones() {
        let token = Cancellation::none();
        let worker_view = token.clone();
        assert!(!worker_view.is_cancelled());
        token.cancel();
        assert!(worker_view.is_cancelled());
    }

    #[test]
    fn test_elapsed_deadline_cancels() {
        let token = Cancellation::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
        let generous = Cancellation::with_timeout(Duration::from_secs(3600));
        assert!(!generous.is_cancelled());
    }
}
