use std::sync::Arc;
use tokio::sync::watch;

/// One-shot broadcast stop flag shared between the orchestrator and its workers.
///
/// Once raised it stays raised. Raising never blocks and may be repeated.
/// Every clone observes the same flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    flag: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    pub fn raise(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_raised(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the flag has been raised (immediately if it already is).
    pub async fn raised(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
