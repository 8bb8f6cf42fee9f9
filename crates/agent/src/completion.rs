use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Failure of the instrumented operation itself, as seen by a continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    pub error_type: String,
    pub message: String,
    pub canceled: bool,
}

impl CallFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            canceled: false,
        }
    }

    pub fn canceled() -> Self {
        Self {
            error_type: "Canceled".to_string(),
            message: "operation was canceled".to_string(),
            canceled: true,
        }
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

pub type CompletionResult<T> = std::result::Result<T, CallFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Pending,
    RanToCompletion,
    Faulted,
    Canceled,
}

type Callback<T> = Box<dyn FnOnce(&CompletionResult<T>) + Send>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Arc<CompletionResult<T>>),
}

/// Handle to an operation that finishes later, possibly on another thread.
///
/// Clones share state. The first `complete` wins; callbacks registered with
/// `on_complete` run exactly once, on the completing thread, or immediately on
/// the registering thread when the result is already known. A panicking
/// callback is contained and does not stop the ones registered after it.
pub struct Completion<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("status", &self.status())
            .finish()
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    pub fn resolved(result: CompletionResult<T>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Done(Arc::new(result)))),
        }
    }

    /// Resolves the operation. Returns `false` if it was already resolved.
    pub fn complete(&self, result: CompletionResult<T>) -> bool {
        let result = Arc::new(result);
        let callbacks = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(&*state, State::Done(_)) {
                return false;
            }
            match std::mem::replace(&mut *state, State::Done(Arc::clone(&result))) {
                State::Pending(callbacks) => callbacks,
                State::Done(_) => Vec::new(),
            }
        };

        for callback in callbacks {
            run_callback(callback, &result);
        }
        true
    }

    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&CompletionResult<T>) + Send + 'static,
    {
        let done = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(result) => Arc::clone(result),
            }
        };
        run_callback(Box::new(callback), &done);
    }

    pub fn status(&self) -> CompletionStatus {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            State::Pending(_) => CompletionStatus::Pending,
            State::Done(result) => match result.as_ref() {
                Ok(_) => CompletionStatus::RanToCompletion,
                Err(failure) if failure.canceled => CompletionStatus::Canceled,
                Err(_) => CompletionStatus::Faulted,
            },
        }
    }
}

fn run_callback<T>(callback: Callback<T>, result: &CompletionResult<T>) {
    if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
        warn!("completion callback panicked");
    }
}
