use crate::sync::Mutex;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// A captured panic payload in transit between threads.
pub(crate) type Payload = Box<dyn Any + Send + 'static>;

/// Error raised by a failing work unit, or inherited from a failed parent.
///
/// The first failing work unit of a task wins; every later capture on the
/// same task is discarded. The error is cheap to clone (descendants of a
/// failed task all share the same payload) and surfaces at every waiter of
/// every task it reached. Releasing a handle without waiting discards the
/// error silently.
#[derive(Debug, Clone, Error)]
#[error("{}", .inner.message)]
pub struct TaskError {
    inner: Arc<Repr>,
}

#[derive(derive_more::Debug)]
struct Repr {
    message: Box<str>,
    #[debug(skip)]
    payload: Mutex<Option<Payload>>,
}

impl TaskError {
    /// Wraps a payload caught by `std::panic::catch_unwind`.
    pub(crate) fn from_panic(payload: Payload) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).into()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str().into()
        } else {
            "task callback panicked".into()
        };
        Self {
            inner: Arc::new(Repr {
                message,
                payload: Mutex::new(Some(payload)),
            }),
        }
    }

    /// Human-readable form of the captured payload: the panic message when
    /// it was a `&str` or `String`, a generic note otherwise.
    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// Re-raises the failure on the current thread.
    ///
    /// When this is the last reference to the capture, the original payload
    /// is resumed, so a `catch_unwind` upstream observes the exact value the
    /// work unit panicked with. Otherwise a fresh panic carrying the message
    /// is raised.
    pub fn resume(self) -> ! {
        match Arc::try_unwrap(self.inner) {
            Ok(repr) => {
                let payload = repr.payload.lock().take();
                match payload {
                    Some(payload) => std::panic::resume_unwind(payload),
                    None => panic!("{}", repr.message),
                }
            }
            Err(inner) => panic!("{}", inner.message),
        }
    }
}
