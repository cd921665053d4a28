//! Per-call error policy: raise at the end, collect into a list, or hand each
//! error to a callback.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::DispatchError;

type Callback = Arc<dyn Fn(DispatchError) + Send + Sync>;

#[derive(Clone, Default)]
pub enum ErrorCatcher {
    /// Buffer errors and fail the call once it is done.
    #[default]
    Raise,
    /// Append every error to a caller-owned list; the call itself succeeds.
    Collect(CaughtErrors),
    /// Call once per error, in the order they happen.
    Callback(Callback),
}

impl ErrorCatcher {
    pub fn collect() -> (Self, CaughtErrors) {
        let list = CaughtErrors::default();
        (ErrorCatcher::Collect(list.clone()), list)
    }

    pub fn callback(f: impl Fn(DispatchError) + Send + Sync + 'static) -> Self {
        ErrorCatcher::Callback(Arc::new(f))
    }
}

impl fmt::Debug for ErrorCatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCatcher::Raise => write!(f, "Raise"),
            ErrorCatcher::Collect(list) => write!(f, "Collect({})", list.len()),
            ErrorCatcher::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// Shared error list filled by `ErrorCatcher::Collect`.
#[derive(Clone, Default)]
pub struct CaughtErrors {
    errors: Arc<Mutex<Vec<DispatchError>>>,
}

impl CaughtErrors {
    fn lock(&self) -> MutexGuard<'_, Vec<DispatchError>> {
        match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, error: DispatchError) {
        self.lock().push(error);
    }

    fn push_unique(&self, error: DispatchError) {
        push_unique(&mut self.lock(), error);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<DispatchError> {
        self.lock().clone()
    }

    pub fn take(&self) -> Vec<DispatchError> {
        std::mem::take(&mut *self.lock())
    }
}

impl fmt::Debug for CaughtErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.lock().iter()).finish()
    }
}

/// Errors count as the same when they render the same.
fn push_unique(errors: &mut Vec<DispatchError>, error: DispatchError) {
    let text = error.to_string();
    if !errors.iter().any(|e| e.to_string() == text) {
        errors.push(error);
    }
}

/// Applies one catcher for the duration of a call. Clones share the buffer.
#[derive(Clone)]
pub struct CatchScope {
    catcher: ErrorCatcher,
    raised: CaughtErrors,
}

impl CatchScope {
    pub fn new(catcher: ErrorCatcher) -> Self {
        Self {
            catcher,
            raised: CaughtErrors::default(),
        }
    }

    pub fn add(&self, error: DispatchError) {
        match &self.catcher {
            ErrorCatcher::Raise => self.raised.push_unique(error),
            ErrorCatcher::Collect(list) => list.push(error),
            ErrorCatcher::Callback(f) => f(error),
        }
    }

    /// Catcher for nested calls that feeds this scope.
    pub fn forwarder(&self) -> ErrorCatcher {
        let scope = self.clone();
        ErrorCatcher::callback(move |e| scope.add(e))
    }

    /// Close the scope. With `Raise`, a single error from a call that touched
    /// fewer than two targets is returned as is; anything else is aggregated.
    pub fn finish(self, targets: usize) -> Result<(), DispatchError> {
        let mut errors = self.raised.take();
        match errors.len() {
            0 => Ok(()),
            1 if targets < 2 => Err(errors.remove(0)),
            _ => Err(DispatchError::Multiple(errors)),
        }
    }
}
