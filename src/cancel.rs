use tokio_util::sync::CancellationToken;

/// The one cancellation signal of a download.
///
/// Clones share the same signal. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    token: CancellationToken,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Calling this more than once has no further effect.
    pub fn request_cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal is set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clones_share_the_signal() {
        let controller = CancellationController::new();
        let observer = controller.clone();
        assert!(!observer.is_cancelled());
        controller.request_cancel();
        controller.request_cancel();
        assert!(observer.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_from_another_task() {
        let controller = CancellationController::new();
        let remote = controller.clone();
        tokio::spawn(async move { remote.request_cancel() });
        tokio::time::timeout(Duration::from_secs(5), controller.cancelled())
            .await
            .expect("cancellation was not observed");
        assert!(controller.is_cancelled());
    }
}
