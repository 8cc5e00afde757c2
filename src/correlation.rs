//! The table of in-flight calls.
//!
//! Maps a [`CallId`] to the single-assignment slot its caller is awaiting.
//! Callers insert and remove concurrently; exactly one receive loop resolves.
//! All access goes through the mutex here, so a response cannot interleave
//! unsafely with registration or removal.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::wire::{CallId, ResponseEnvelope};

/// One caller's completion slot, written at most once by the receive loop.
pub(crate) type CompletionSlot = oneshot::Receiver<ResponseEnvelope>;

/// Thread-safe map from call identifier to pending completion.
///
/// The table never outgrows the set of calls currently in flight: `resolve`
/// removes the entry it fires, and callers `remove` entries they abandon.
#[derive(Default)]
pub(crate) struct CorrelationTable {
    slots: Mutex<HashMap<CallId, oneshot::Sender<ResponseEnvelope>>>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create and store a fresh slot for `id`, returning the receiving end.
    ///
    /// Registering an id that is already pending is a logic error: identifiers
    /// are unique per connection lifetime, so this can only happen after the
    /// u32 counter wraps with a call still outstanding. The stale entry is
    /// dropped, which resolves its caller with `ConnectionClosed` rather than
    /// handing two callers the same slot.
    pub(crate) fn register(&self, id: CallId) -> CompletionSlot {
        let (tx, rx) = oneshot::channel();
        let previous = self.slots.lock().unwrap().insert(id, tx);
        debug_assert!(previous.is_none(), "call id {id} registered twice");
        rx
    }

    /// Fire the slot for `id` with `response`, removing it from the table.
    ///
    /// Returns false when no slot is waiting (a late or unknown response);
    /// the caller decides whether that is worth logging.
    pub(crate) fn resolve(&self, id: CallId, response: ResponseEnvelope) -> bool {
        let Some(tx) = self.slots.lock().unwrap().remove(&id) else {
            return false;
        };
        // The receiver may have been dropped by a caller that gave up; that
        // is its problem, not ours.
        let _ = tx.send(response);
        true
    }

    /// Drop the entry for `id` without firing it.
    ///
    /// Called by the waiting caller on its own error paths so the table stays
    /// bounded by the calls actually in flight.
    pub(crate) fn remove(&self, id: CallId) {
        self.slots.lock().unwrap().remove(&id);
    }

    /// Drain every slot, resolving each waiting caller with a closed error.
    ///
    /// Dropping a sender wakes its receiver with `RecvError`, which the
    /// dispatcher maps to `CallError::ConnectionClosed`. Runs on disconnect
    /// and dispose so no pending call hangs forever.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.slots.lock().unwrap().drain().collect();
        drained.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    fn response(id: u32) -> ResponseEnvelope {
        ResponseEnvelope {
            msg_id: CallId::new(id),
            result: Some(Value::from(id)),
            error: None,
        }
    }

    #[tokio::test]
    async fn resolve_fires_the_matching_slot() {
        let table = CorrelationTable::new();
        let slot = table.register(CallId::new(1));

        assert!(table.resolve(CallId::new(1), response(1)));
        let envelope = slot.await.unwrap();
        assert_eq!(envelope.msg_id, CallId::new(1));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn late_response_is_a_no_op() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(CallId::new(99), response(99)));
    }

    #[tokio::test]
    async fn resolve_after_remove_is_a_no_op() {
        let table = CorrelationTable::new();
        let _slot = table.register(CallId::new(2));
        table.remove(CallId::new(2));
        assert!(!table.resolve(CallId::new(2), response(2)));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn fail_all_wakes_every_waiter_with_an_error() {
        let table = CorrelationTable::new();
        let a = table.register(CallId::new(1));
        let b = table.register(CallId::new(2));
        assert_eq!(table.len(), 2);

        assert_eq!(table.fail_all(), 2);
        assert!(a.await.is_err());
        assert!(b.await.is_err());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn distinct_calls_never_share_a_slot() {
        let table = CorrelationTable::new();
        let one = table.register(CallId::new(1));
        let two = table.register(CallId::new(2));

        // Deliver out of order; each slot sees only its own id.
        table.resolve(CallId::new(2), response(2));
        table.resolve(CallId::new(1), response(1));

        assert_eq!(one.await.unwrap().msg_id, CallId::new(1));
        assert_eq!(two.await.unwrap().msg_id, CallId::new(2));
    }
}
