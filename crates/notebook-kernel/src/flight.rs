//! Readiness signal shared between the caller that performs a keyed setup
//! and every concurrent caller waiting on the same key.

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

/// Held by the single caller performing the setup. Dropping it without
/// signalling releases waiters with a failure.
#[derive(Debug)]
pub struct FlightLeader {
    sender: watch::Sender<Readiness>,
}

#[derive(Debug, Clone)]
pub struct FlightWaiter {
    receiver: watch::Receiver<Readiness>,
}

pub fn flight() -> (FlightLeader, FlightWaiter) {
    let (sender, receiver) = watch::channel(Readiness::Pending);
    (FlightLeader { sender }, FlightWaiter { receiver })
}

impl FlightLeader {
    pub fn complete(self) {
        self.sender.send_replace(Readiness::Ready);
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.sender.send_replace(Readiness::Failed(reason.into()));
    }
}

impl FlightWaiter {
    /// Resolves once the leader has signalled; `Err` carries the failure
    /// reason.
    pub async fn wait(&mut self) -> Result<(), String> {
        match self
            .receiver
            .wait_for(|readiness| *readiness != Readiness::Pending)
            .await
        {
            Ok(readiness) => match &*readiness {
                Readiness::Failed(reason) => Err(reason.clone()),
                _ => Ok(()),
            },
            Err(_) => Err("setup was abandoned before it completed".to_owned()),
        }
    }
}
