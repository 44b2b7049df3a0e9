use std::sync::{Mutex, MutexGuard};

/// Locks a std mutex, recovering the guard if a previous holder panicked.
///
/// The audio paths must keep producing frames even after a panic elsewhere,
/// so poisoning is ignored.
pub trait PoisonlessLock<T> {
    fn plock(&self) -> MutexGuard<'_, T>;
}

impl<T> PoisonlessLock<T> for Mutex<T> {
    fn plock(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(l) => l,
            Err(e) => e.into_inner(),
        }
    }
}
