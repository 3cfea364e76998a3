//! Shared failure types.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A clonable failure carried by error entries.
///
/// Entries fan out to any number of observers, so the cause has to be
/// shareable. `Fault` wraps the underlying error in an [`Arc`] and hands out
/// cheap clones.
#[derive(Clone)]
pub struct Fault(Arc<anyhow::Error>);

impl Fault {
    pub fn new(error: anyhow::Error) -> Self {
        Fault(Arc::new(error))
    }

    /// Create a fault from a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Fault(Arc::new(anyhow::Error::msg(message)))
    }

    /// The underlying cause.
    pub fn cause(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl From<anyhow::Error> for Fault {
    fn from(error: anyhow::Error) -> Self {
        Fault::new(error)
    }
}

impl From<HandlerError> for Fault {
    fn from(error: HandlerError) -> Self {
        Fault::new(anyhow::Error::new(error))
    }
}

/// Raised when a chained handler fails while processing an entry.
///
/// The failure is reinjected into the originating channel wrapped in this
/// type, so downstream error observers can tell which operation broke.
#[derive(Error, Debug)]
#[error("{operation} handler failed: {cause}")]
pub struct HandlerError {
    pub operation: &'static str,
    pub cause: Fault,
}

impl HandlerError {
    pub fn new(operation: &'static str, cause: impl Into<Fault>) -> Self {
        HandlerError {
            operation,
            cause: cause.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_clones_share_the_cause() {
        let fault = Fault::msg("boom");
        let copy = fault.clone();
        assert_eq!(fault.to_string(), "boom");
        assert_eq!(copy.to_string(), "boom");
    }

    #[test]
    fn handler_error_names_the_operation() {
        let error = HandlerError::new("Promise.then", Fault::msg("bad value"));
        assert_eq!(error.to_string(), "Promise.then handler failed: bad value");
    }
}
