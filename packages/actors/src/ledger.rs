//! Record of completed requests, used for idempotency within one process run.

use dvm_core::EventId;
use indexmap::IndexMap;
use indexmap::map::Entry;

/// Errors from recording into the ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("request {request_id} already completed with result {result_id}")]
    AlreadyCompleted {
        request_id: EventId,
        result_id: EventId,
    },
}

/// Mapping from request id to result id.
///
/// Grows monotonically and is never pruned; entries keep insertion order.
/// Owned by the dispatch actor, which is its only mutator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedJobLedger {
    results: IndexMap<EventId, EventId>,
}

impl CompletedJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, request_id: &EventId) -> bool {
        self.results.contains_key(request_id)
    }

    /// Result id recorded for a request.
    pub fn get(&self, request_id: &EventId) -> Option<&EventId> {
        self.results.get(request_id)
    }

    /// Record a completed request. A request id can only be recorded once.
    pub fn record(&mut self, request_id: EventId, result_id: EventId) -> Result<(), LedgerError> {
        match self.results.entry(request_id) {
            Entry::Occupied(existing) => Err(LedgerError::AlreadyCompleted {
                request_id: existing.key().clone(),
                result_id: existing.get().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(result_id);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Entries in the order they were recorded.
    pub fn entries(&self) -> impl Iterator<Item = (&EventId, &EventId)> {
        self.results.iter()
    }

    /// Request ids in the order they were recorded.
    pub fn request_ids(&self) -> impl Iterator<Item = &EventId> {
        self.results.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> EventId {
        EventId::from_bytes([byte; 32])
    }

    #[test]
    fn records_in_insertion_order() {
        let mut ledger = CompletedJobLedger::new();
        ledger.record(id(3), id(30)).unwrap();
        ledger.record(id(1), id(10)).unwrap();
        ledger.record(id(2), id(20)).unwrap();

        let requests: Vec<_> = ledger.request_ids().cloned().collect();
        assert_eq!(requests, [id(3), id(1), id(2)]);
        assert_eq!(ledger.get(&id(1)), Some(&id(10)));
        let entries: Vec<_> = ledger.entries().map(|(_, result)| result.clone()).collect();
        assert_eq!(entries, [id(30), id(10), id(20)]);
    }

    #[test]
    fn rejects_second_completion() {
        let mut ledger = CompletedJobLedger::new();
        ledger.record(id(1), id(10)).unwrap();

        let err = ledger.record(id(1), id(11)).unwrap_err();
        assert_eq!(
            err,
            LedgerError::AlreadyCompleted {
                request_id: id(1),
                result_id: id(10),
            }
        );
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.get(&id(1)), Some(&id(10)));
    }
}
