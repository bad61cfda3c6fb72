use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::error::BuildError;

/// Cooperative cancellation flag shared between a build and whoever may stop
/// it (the Ctrl-C handler in the binary).
///
/// Stages check the token before they start; a stage already running an
/// external tool is allowed to finish so the resources it acquired can be
/// released in order.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`BuildError::Cancelled`] if cancellation was requested
    /// before `stage` starts.
    pub fn check(&self, stage: &str) -> Result<(), BuildError> {
        if self.is_cancelled() {
            log::warn!("Cancellation requested, not starting {}", stage);
            return Err(BuildError::Cancelled {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }

    /// Cancel this token on Ctrl-C.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            log::warn!("Interrupted, stopping after the current stage");
            token.cancel();
        })
    }
}
