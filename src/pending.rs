// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pending Request Table
//!
//! Maps in-flight correlation identifiers to the handler waiting for their
//! reply. Requests are registered from the publishing path and taken from the
//! reply consumer task, so every operation goes through one mutex.
//!
//! Entries may carry a deadline. Expiry is an addition over the plain
//! request/reply exchange, which on its own leaks entries whose reply never
//! arrives.

use crate::{correlation::CorrelationId, errors::RpcError};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

/// Outcome handed to a response handler: the raw reply payload, or the reason
/// no reply will come (`RpcError::Timeout`).
pub type ReplyResult = Result<Vec<u8>, RpcError>;

/// Single-use continuation invoked with the reply for one request.
pub type ResponseHandler = Box<dyn FnOnce(ReplyResult) + Send + 'static>;

struct PendingEntry {
    handler: ResponseHandler,
    deadline: Option<Instant>,
}

/// Thread-safe table of requests awaiting a reply.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<CorrelationId, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `id`.
    ///
    /// Fails with `DuplicateCorrelationId` if `id` is already pending; the
    /// existing entry is left untouched.
    pub fn register(
        &self,
        id: CorrelationId,
        handler: ResponseHandler,
        deadline: Option<Instant>,
    ) -> Result<(), RpcError> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(RpcError::DuplicateCorrelationId(id));
        }

        entries.insert(id, PendingEntry { handler, deadline });
        Ok(())
    }

    /// Removes and returns the handler for `id`, if any.
    ///
    /// Returns `None` for ids that were already taken, expired or never
    /// registered here.
    pub fn take(&self, id: &CorrelationId) -> Option<ResponseHandler> {
        self.lock().remove(id).map(|entry| entry.handler)
    }

    /// Removes every entry whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> Vec<(CorrelationId, ResponseHandler)> {
        let mut entries = self.lock();
        let expired: Vec<CorrelationId> = entries
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|entry| (id, entry.handler)))
            .collect()
    }

    /// Drops every pending handler without invoking it.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Handlers run outside the lock, so a poisoned mutex still holds a
    // consistent map.
    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    fn counting_handler(counter: &Arc<AtomicUsize>) -> ResponseHandler {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_register_then_take() {
        let table = PendingRequests::new();
        let id = CorrelationId::new();
        let counter = Arc::new(AtomicUsize::new(0));

        table.register(id, counting_handler(&counter), None).unwrap();
        assert!(table.contains(&id));

        let handler = table.take(&id).expect("handler registered");
        handler(Ok(b"reply".to_vec()));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_take_is_idempotent() {
        let table = PendingRequests::new();
        let id = CorrelationId::new();
        table.register(id, Box::new(|_| {}), None).unwrap();

        assert!(table.take(&id).is_some());
        assert!(table.take(&id).is_none());
    }

    #[test]
    fn test_take_unknown_leaves_table_untouched() {
        let table = PendingRequests::new();
        let id = CorrelationId::new();
        table.register(id, Box::new(|_| {}), None).unwrap();

        assert!(table.take(&CorrelationId::new()).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.contains(&id));
    }

    #[test]
    fn test_duplicate_register_fails_and_keeps_first() {
        let table = PendingRequests::new();
        let id = CorrelationId::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        table.register(id, counting_handler(&first), None).unwrap();
        let err = table
            .register(id, counting_handler(&second), None)
            .unwrap_err();
        assert_eq!(err, RpcError::DuplicateCorrelationId(id));

        table.take(&id).unwrap()(Ok(vec![]));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_drops_handlers_without_invoking() {
        let table = PendingRequests::new();
        let counter = Arc::new(AtomicUsize::new(0));
        table
            .register(CorrelationId::new(), counting_handler(&counter), None)
            .unwrap();

        table.clear();

        assert!(table.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_expire_only_removes_overdue_entries() {
        let table = PendingRequests::new();
        let now = Instant::now();
        let overdue = CorrelationId::new();
        let later = CorrelationId::new();
        let forever = CorrelationId::new();

        table
            .register(overdue, Box::new(|_| {}), Some(now - Duration::from_millis(1)))
            .unwrap();
        table
            .register(later, Box::new(|_| {}), Some(now + Duration::from_secs(60)))
            .unwrap();
        table.register(forever, Box::new(|_| {}), None).unwrap();

        let expired = table.expire(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, overdue);
        assert_eq!(table.len(), 2);
        assert!(table.take(&overdue).is_none());
    }

    #[test]
    fn test_concurrent_register_and_take() {
        let table = Arc::new(PendingRequests::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let ids: Vec<CorrelationId> = (0..200).map(|_| CorrelationId::new()).collect();

        for id in &ids {
            table.register(*id, counting_handler(&counter), None).unwrap();
        }

        let workers: Vec<_> = ids
            .chunks(50)
            .map(|chunk| {
                let table = table.clone();
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    for id in chunk {
                        if let Some(handler) = table.take(&id) {
                            handler(Ok(vec![]));
                        }
                        assert!(table.take(&id).is_none());
                    }
                })
            })
            .collect();

        let registrar = {
            let table = table.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    table
                        .register(CorrelationId::new(), Box::new(|_| {}), None)
                        .unwrap();
                }
            })
        };

        for worker in workers {
            worker.join().unwrap();
        }
        registrar.join().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 200);
        assert_eq!(table.len(), 200);
    }
}
