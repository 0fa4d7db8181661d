//! Queue and connection lifecycle events, fanned out to listeners (the
//! GUI, the hub client, auto-search) over a bounded channel instead of the
//! callback-interface/listener-list pattern the original uses (spec.md §9
//! "Listener/callback fanout").

use tokio::sync::mpsc;

use crate::{BundleToken, HintedUser};

/// The channel capacity applied to every listener subscription. A slow
/// listener backs up the sender rather than growing without bound; if it
/// falls behind for too long its events are simply not delivered (the
/// sender logs and drops rather than blocking the core).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum QueueEvent {
    BundleAdded(BundleToken),
    BundleRemoved(BundleToken),
    BundleStatusChanged(BundleToken),
    BundleSourcesChanged(BundleToken),
    BundleSizeChanged(BundleToken),
    ItemAdded { bundle: BundleToken, target: String },
    ItemRemoved { bundle: BundleToken, target: String },
    ItemFinished { bundle: BundleToken, target: String },
    ItemFailed { bundle: BundleToken, target: String, reason: String },
    SourceFilesUpdated(HintedUser),
}

#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    UserConnected { token: crate::Token, user: HintedUser },
    UserDisconnected { token: crate::Token },
    ConnectionFlooded { user: HintedUser },
}

pub type QueueEventSender = mpsc::Sender<QueueEvent>;
pub type QueueEventReceiver = mpsc::Receiver<QueueEvent>;
pub type ConnectionEventSender = mpsc::Sender<ConnectionEvent>;
pub type ConnectionEventReceiver = mpsc::Receiver<ConnectionEvent>;

/// Fans a single queue event out to all currently-registered listener
/// channels, dropping any that have been closed.
#[derive(Default)]
pub struct QueueEventBus {
    listeners: Vec<QueueEventSender>,
}

impl QueueEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> QueueEventReceiver {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.listeners.push(tx);
        rx
    }

    pub fn emit(&mut self, event: QueueEvent) {
        self.listeners.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("queue event listener is lagging, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Fans a single connection event out to all currently-registered listener
/// channels, dropping any that have been closed.
#[derive(Default)]
pub struct ConnectionEventBus {
    listeners: Vec<ConnectionEventSender>,
}

impl ConnectionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> ConnectionEventReceiver {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.listeners.push(tx);
        rx
    }

    pub fn emit(&mut self, event: ConnectionEvent) {
        self.listeners.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("connection event listener is lagging, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_emit() {
        let mut bus = QueueEventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(QueueEvent::BundleAdded("b1".to_owned()));
        let evt = rx.recv().await.unwrap();
        matches!(evt, QueueEvent::BundleAdded(ref t) if t == "b1");
    }

    #[tokio::test]
    async fn test_connection_bus_subscribe_and_emit() {
        let mut bus = ConnectionEventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(ConnectionEvent::UserDisconnected { token: "t1".to_owned() });
        let evt = rx.recv().await.unwrap();
        matches!(evt, ConnectionEvent::UserDisconnected { ref token } if token == "t1");
    }
}
