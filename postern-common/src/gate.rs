use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// A shared counter that admits work while it stays at or under a ceiling.
///
/// Entering always increments, so the count reflects every caller that is
/// currently holding a [`Permit`], admitted or not. A ceiling of `0` means
/// unlimited.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    count: Arc<AtomicUsize>,
}

/// Held for as long as the guarded work runs, decrementing the gate on drop
#[derive(Debug)]
pub struct Permit {
    count: Arc<AtomicUsize>,
    admitted: bool,
}

impl Gate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a caller, reporting whether it fits under `ceiling`
    #[must_use]
    pub fn enter(&self, ceiling: usize) -> Permit {
        let current = self.count.fetch_add(1, Ordering::AcqRel) + 1;

        Permit {
            count: Arc::clone(&self.count),
            admitted: ceiling == 0 || current <= ceiling,
        }
    }

    /// Like [`Gate::enter`], but refuses without counting when the gate is full
    #[must_use]
    pub fn try_enter(&self, ceiling: usize) -> Option<Permit> {
        let permit = self.enter(ceiling);
        permit.admitted.then_some(permit)
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Permit {
    #[must_use]
    pub const fn admitted(&self) -> bool {
        self.admitted
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}
