//! Ordered teardown helpers.

use crate::error::{Error, Result};

/// Explicit, ordered destruction of a resource-owning object.
///
/// Implementors release their children in dependency order, keep going
/// after a failed step, and report the first failure.
pub trait Delete {
    /// Release every resource owned by `self`.
    fn delete(self) -> Result<()>;
}

/// Deleting an absent handle is a no-op success.
impl<T: Delete> Delete for Option<T> {
    fn delete(self) -> Result<()> {
        match self {
            Some(inner) => inner.delete(),
            None => Ok(()),
        }
    }
}

/// Keeps the first error seen during a teardown sequence.
#[derive(Debug, Default)]
pub(crate) struct FirstError(Option<Error>);

impl FirstError {
    pub fn new() -> Self {
        Self(None)
    }

    /// Record the outcome of one teardown step.
    pub fn record<E: Into<Error>>(&mut self, res: std::result::Result<(), E>) {
        if let Err(e) = res {
            let e = e.into();
            log::debug!("rrpma: teardown step failed: {}", e);
            self.0.get_or_insert(e);
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.0 {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    struct Counted<'a>(&'a std::cell::Cell<u32>);

    impl Delete for Counted<'_> {
        fn delete(self) -> Result<()> {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn option_delete_is_idempotent() {
        let count = std::cell::Cell::new(0);
        let mut slot = Some(Counted(&count));
        slot.take().delete().unwrap();
        slot.take().delete().unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn first_error_wins() {
        let mut first = FirstError::new();
        first.record::<Error>(Ok(()));
        first.record(Err(io::Error::from_raw_os_error(libc::EBUSY)));
        first.record(Err(io::Error::from_raw_os_error(libc::EINVAL)));
        let err = first.into_result().unwrap_err();
        assert_eq!(err.provider_code(), Some(libc::EBUSY));
    }
}
