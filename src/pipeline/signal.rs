use std::sync::Arc;
use tokio::sync::watch;

/// Version counter bumped on every blackboard write and unit state change.
///
/// Pending dispatches and completion waiters hold a receiver and re-check
/// their condition each time the version moves, so nobody spins.
#[derive(Clone, Debug)]
pub(crate) struct ChangeSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl ChangeSignal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn notify(&self) {
        self.tx.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// A receiver that only reports changes made after this call
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}
