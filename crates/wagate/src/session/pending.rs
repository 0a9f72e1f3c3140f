//! One-shot completion token for an in-flight connect request.

use tokio::sync::oneshot;

use super::ConnectOutcome;

/// Delivers exactly one [`ConnectOutcome`] to the waiting request.
///
/// The first `resolve` wins; every later call is a no-op that returns `false`.
#[derive(Debug)]
pub struct PendingResponse {
    tx: Option<oneshot::Sender<ConnectOutcome>>,
}

impl PendingResponse {
    pub fn new() -> (Self, oneshot::Receiver<ConnectOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Fire the token. Returns `true` only for the call that actually fired it.
    ///
    /// A receiver that already went away (client hung up) still counts as fired.
    pub fn resolve(&mut self, outcome: ConnectOutcome) -> bool {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_resolution_wins() {
        let (mut pending, rx) = PendingResponse::new();
        assert!(!pending.is_resolved());

        assert!(pending.resolve(ConnectOutcome::Connected));
        assert!(!pending.resolve(ConnectOutcome::Timeout));
        assert!(!pending.resolve(ConnectOutcome::Error {
            reason: "late".to_string()
        }));
        assert!(pending.is_resolved());

        assert_eq!(rx.await.unwrap(), ConnectOutcome::Connected);
    }

    #[test]
    fn resolving_after_receiver_dropped_still_fires_once() {
        let (mut pending, rx) = PendingResponse::new();
        drop(rx);
        assert!(pending.resolve(ConnectOutcome::Timeout));
        assert!(!pending.resolve(ConnectOutcome::Timeout));
    }

    #[tokio::test]
    async fn dropping_unresolved_token_closes_receiver() {
        let (pending, rx) = PendingResponse::new();
        drop(pending);
        assert!(rx.await.is_err());
    }
}
