use crate::server::ServerError;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// What the server hands back: goodput in Mbps, or why it could not measure.
pub type GoodputResult = Result<f64, ServerError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no result arrived within {0:?}")]
    Timeout(Duration),
    #[error("the producer went away without publishing a result")]
    Closed,
}

/// Creates the single-slot handoff used for one trial.
///
/// Both halves are consumed by use, so a trial can publish and read at most
/// one value. A fresh pair must be created for every trial.
pub fn result_channel() -> (ResultSender, ResultReceiver) {
    let (tx, rx) = oneshot::channel();
    (ResultSender(tx), ResultReceiver(rx))
}

#[derive(Debug)]
pub struct ResultSender(oneshot::Sender<GoodputResult>);

impl ResultSender {
    /// Returns `false` when the receiving side has already been dropped.
    pub fn publish(self, result: GoodputResult) -> bool {
        self.0.send(result).is_ok()
    }
}

#[derive(Debug)]
pub struct ResultReceiver(oneshot::Receiver<GoodputResult>);

impl ResultReceiver {
    /// Waits up to `wait` for the one value of this trial.
    pub async fn recv_timeout(self, wait: Duration) -> Result<GoodputResult, ChannelError> {
        match tokio::time::timeout(wait, self.0).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Timeout(wait)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_exactly_the_published_value() {
        let (tx, rx) = result_channel();
        assert!(tx.publish(Ok(42.5)));
        let value = rx.recv_timeout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(value.unwrap(), 42.5);
    }

    #[tokio::test]
    async fn reading_before_publication_waits_then_times_out() {
        let (tx, rx) = result_channel();
        let started = std::time::Instant::now();
        let err = rx.recv_timeout(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        drop(tx);
    }

    #[tokio::test]
    async fn a_late_value_is_still_received_within_the_wait() {
        let (tx, rx) = result_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.publish(Ok(1.0));
        });
        let value = rx.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn dropped_producer_is_reported() {
        let (tx, rx) = result_channel();
        drop(tx);
        let err = rx.recv_timeout(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn failures_travel_through_the_channel() {
        let (tx, rx) = result_channel();
        tx.publish(Err(ServerError::NoConnection));
        let value = rx.recv_timeout(Duration::from_millis(50)).await.unwrap();
        assert!(matches!(value, Err(ServerError::NoConnection)));
    }
}
