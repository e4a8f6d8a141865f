use std::ops::{Deref, DerefMut};

/// A scoped mutex guarding one plain-data state record. Acquisition names
/// a purpose so slow paths show up in logs with context. Callers keep the
/// critical section short and never invoke user callbacks while holding
/// the guard.
#[derive(Debug, Default)]
pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            inner: std::sync::Mutex::new(value),
        }
    }

    pub fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
        MutexGuard {
            guard: match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    log::warn!("state lock for {purpose} was poisoned, continuing");
                    poisoned.into_inner()
                }
            },
        }
    }
}

pub struct MutexGuard<'a, T> {
    guard: std::sync::MutexGuard<'a, T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.guard.deref()
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.deref_mut()
    }
}
