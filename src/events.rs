//! Broadcasts ledger changes to in-process subscribers.

use tokio::sync::broadcast;

use crate::{Amount, aggregate::Scope, ledger::LedgerEntry};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A change to the ledger that other parts of the application may react to.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    /// A new entry was written to the ledger.
    EntryCreated(LedgerEntry),
    /// A category total changed.
    AggregateChanged {
        /// The scope whose total changed.
        scope: Scope,
        /// The total before the change.
        previous: Amount,
        /// The total after the change.
        spent: Amount,
    },
}

/// Fans ledger events out to every subscriber.
///
/// Events are only published after the database transaction that caused them
/// has committed. Publishing never blocks and never fails: if nobody is
/// subscribed the event is dropped, and slow subscribers miss the oldest
/// events rather than holding up the ledger.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    /// Create an event bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }

    /// Send `event` to the current subscribers.
    ///
    /// Returns the number of subscribers the event was sent to.
    pub fn publish(&self, event: LedgerEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!("No subscribers for ledger event");
                0
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
