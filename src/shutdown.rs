//! Hierarchical shutdown signal.
//!
//! A [`Shutdown`] is a cloneable token backed by a `tokio::sync::watch` channel.
//! Child tokens fire when their parent fires, but cancelling a child leaves the
//! parent untouched. Every long-lived task in the crate selects against one.

use futures::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    parent: Option<Arc<Shutdown>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
            parent: None,
        }
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.lineage().any(|token| *token.receiver.borrow())
    }

    /// Resolves once this token or any of its ancestors has fired.
    pub async fn cancelled(&self) {
        let waits: Vec<_> = self
            .lineage()
            .map(|token| {
                let mut receiver = token.receiver.clone();
                // Every sender in the chain lives as long as `self`.
                Box::pin(async move {
                    let _ = receiver.wait_for(|cancelled| *cancelled).await;
                })
            })
            .collect();
        select_all(waits).await;
    }

    /// Create a token that is cancelled together with `self`.
    ///
    /// The child keeps its ancestors alive and checks them directly, so no task
    /// is spawned and a runtime is not required.
    pub fn child(&self) -> Shutdown {
        let (sender, receiver) = watch::channel(false);
        Shutdown {
            sender: Arc::new(sender),
            receiver,
            parent: Some(Arc::new(self.clone())),
        }
    }

    fn lineage(&self) -> impl Iterator<Item = &Shutdown> {
        std::iter::successors(Some(self), |token| token.parent.as_deref())
    }
}
