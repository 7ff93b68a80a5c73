//! Reply cache for forwarded operations
//!
//! A forward whose reply got lost is sent again with the same
//! [`ForwardId`]. The secondary keeps the outcome of recent forwards and
//! answers a resent one from here, so operations that cannot run twice
//! (create, unlink, rename) are not mistaken for divergence.
//!
//! Entries are evicted in insertion order once the cache is full.

use crate::message::ForwardId;
use crate::op::OpReply;
use mirrorfs_common::{Error, RemoteError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Forwards remembered per secondary target
pub const DEFAULT_REPLY_CACHE_CAPACITY: usize = 4096;

pub type CachedReply = std::result::Result<OpReply, RemoteError>;

struct CacheState {
    replies: HashMap<ForwardId, CachedReply>,
    order: VecDeque<ForwardId>,
}

pub struct ReplyCache {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl ReplyCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(CacheState {
                replies: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Outcome of an earlier execution of forward `id`
    pub fn get(&self, id: &ForwardId) -> Option<CachedReply> {
        self.state.lock().replies.get(id).cloned()
    }

    /// Remember the outcome of forward `id`
    pub fn insert(&self, id: ForwardId, result: &Result<OpReply>) {
        let reply = match result {
            Ok(reply) => Ok(reply.clone()),
            Err(e) => Err(RemoteError::from(e)),
        };

        let mut state = self.state.lock();
        if state.replies.insert(id, reply).is_some() {
            return;
        }
        state.order.push_back(id);
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.replies.remove(&oldest);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().replies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplyCache {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_CACHE_CAPACITY)
    }
}

/// Turn a cached outcome back into the result of an execution
pub fn replay(reply: CachedReply) -> Result<OpReply> {
    reply.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorfs_common::{ErrorCode, TargetId};

    fn id(seq: u64) -> ForwardId {
        ForwardId {
            origin: TargetId(1),
            seq,
        }
    }

    #[test]
    fn test_outcomes_are_replayed() {
        let cache = ReplyCache::new(8);
        assert!(cache.get(&id(1)).is_none());

        cache.insert(id(1), &Ok(OpReply::Done));
        cache.insert(id(2), &Err(Error::not_found("root/f")));

        assert_eq!(replay(cache.get(&id(1)).unwrap()).unwrap(), OpReply::Done);
        let err = replay(cache.get(&id(2)).unwrap()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        // Same sequence number from another primary is a different forward
        let other = ForwardId {
            origin: TargetId(3),
            seq: 1,
        };
        assert!(cache.get(&other).is_none());
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let cache = ReplyCache::new(3);
        for seq in 0..5 {
            cache.insert(id(seq), &Ok(OpReply::Done));
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&id(0)).is_none());
        assert!(cache.get(&id(1)).is_none());
        assert!(cache.get(&id(4)).is_some());

        // Re-inserting an ID does not grow the cache
        cache.insert(id(4), &Ok(OpReply::Done));
        assert_eq!(cache.len(), 3);
    }
}
