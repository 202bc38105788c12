use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Cooperative cancellation flag shared between the caller and long-running
/// engine operations. Clones observe the same flag.
///
/// Holders of a shard pack lock finish the in-flight entry before observing
/// cancellation; aborting mid-header would tear the pack file.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn bail_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.bail_if_cancelled().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.bail_if_cancelled(), Err(Error::Cancelled)));
    }
}
