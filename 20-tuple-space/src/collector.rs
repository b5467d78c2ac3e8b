//! Ledger of asynchronous replica replies.
//!
//! Every remote call the coordinator fires records exactly one entry here
//! when it completes. The coordinator task that issued the calls waits in
//! [`ResponseCollector::wait_for_count`] until enough entries for its key have
//! arrived, then reads them back.
//!
//! Entries are grouped by [`GroupKey`] (request id, retry id, kind) and never
//! removed: a coordinator serves a bounded number of requests per process.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;

use crate::{ReplicaId, RequestId, RetryId, message::ReplicaReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Put,
    Read,
    Take,
    Dump,
    Lock,
    Unlock,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Put => "PUT",
            OpKind::Read => "READ",
            OpKind::Take => "TAKE",
            OpKind::Dump => "DUMP",
            OpKind::Lock => "LOCK",
            OpKind::Unlock => "UNLOCK",
        };
        f.write_str(name)
    }
}

/// Identifies the set of replies one fan-out produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub request_id: RequestId,
    pub retry_id: RetryId,
    pub kind: OpKind,
}

impl GroupKey {
    pub fn new(request_id: RequestId, kind: OpKind) -> Self {
        Self::round(request_id, 0, kind)
    }

    pub fn round(request_id: RequestId, retry_id: RetryId, kind: OpKind) -> Self {
        Self {
            request_id,
            retry_id,
            kind,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}.{}", self.kind, self.request_id, self.retry_id)
    }
}

/// What one replica answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Ack,
    Tuple(String),
    Tuples(Vec<String>),
    /// The replica processed the call and refused it.
    Rejected(String),
    /// The call never completed (connection or framing failure).
    Unreachable(String),
}

impl Payload {
    pub fn from_call(result: anyhow::Result<ReplicaReply>) -> Self {
        match result {
            Ok(ReplicaReply::Ok) => Payload::Ack,
            Ok(ReplicaReply::Tuple { tuple }) => Payload::Tuple(tuple),
            Ok(ReplicaReply::Tuples { tuples }) => Payload::Tuples(tuples),
            Ok(ReplicaReply::Error { message }) => Payload::Rejected(message),
            Err(err) => Payload::Unreachable(format!("{err:#}")),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Payload::Rejected(_) | Payload::Unreachable(_))
    }
}

#[derive(Debug, Clone)]
pub struct ResponseEntry {
    pub key: GroupKey,
    pub replica: ReplicaId,
    pub payload: Payload,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollectorError {
    #[error("duplicate response from replica {replica} for {key}")]
    Duplicate { key: GroupKey, replica: ReplicaId },
}

#[derive(Default)]
pub struct ResponseCollector {
    ledger: Mutex<HashMap<GroupKey, Vec<(ReplicaId, Payload)>>>,
    arrived: Notify,
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one reply and wakes every waiter.
    ///
    /// A second reply from the same replica for the same key is rejected and
    /// leaves the ledger untouched.
    pub fn record(&self, entry: ResponseEntry) -> Result<(), CollectorError> {
        {
            let mut ledger = self.ledger();
            let group = ledger.entry(entry.key).or_default();
            if group.iter().any(|(replica, _)| *replica == entry.replica) {
                return Err(CollectorError::Duplicate {
                    key: entry.key,
                    replica: entry.replica,
                });
            }
            group.push((entry.replica, entry.payload));
        }
        self.arrived.notify_waiters();
        Ok(())
    }

    pub fn count(&self, key: GroupKey) -> usize {
        self.ledger().get(&key).map_or(0, Vec::len)
    }

    /// Waits until at least `n` replies for `key` have been recorded.
    ///
    /// Replies recorded before the call count too.
    pub async fn wait_for_count(&self, key: GroupKey, n: usize) {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count(key) >= n {
                return;
            }
            notified.await;
        }
    }

    /// The reply `replica` gave for `key`, if it has arrived.
    pub fn get(&self, key: GroupKey, replica: ReplicaId) -> Option<Payload> {
        self.ledger().get(&key).and_then(|group| {
            group
                .iter()
                .find(|(from, _)| *from == replica)
                .map(|(_, payload)| payload.clone())
        })
    }

    /// All replies for `key` in arrival order.
    pub fn responses(&self, key: GroupKey) -> Vec<(ReplicaId, Payload)> {
        self.ledger().get(&key).cloned().unwrap_or_default()
    }

    /// Concatenates the tuples every replica returned for `request_id`.
    ///
    /// Groups are visited by retry id and replies by replica id, so the result
    /// does not depend on arrival order. Failures contribute nothing.
    pub fn merge(&self, request_id: RequestId, kind: OpKind) -> Vec<String> {
        let ledger = self.ledger();
        let mut groups: Vec<_> = ledger
            .iter()
            .filter(|(key, _)| key.request_id == request_id && key.kind == kind)
            .collect();
        groups.sort_by_key(|(key, _)| key.retry_id);

        let mut merged = Vec::new();
        for (_, group) in groups {
            let mut replies: Vec<_> = group.iter().collect();
            replies.sort_by_key(|(replica, _)| *replica);
            for (_, payload) in replies {
                match payload {
                    Payload::Tuples(tuples) => merged.extend(tuples.iter().cloned()),
                    Payload::Tuple(tuple) => merged.push(tuple.clone()),
                    _ => {}
                }
            }
        }
        merged
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<GroupKey, Vec<(ReplicaId, Payload)>>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
