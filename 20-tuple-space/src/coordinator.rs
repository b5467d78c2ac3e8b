//! Client operations over the replica set.
//!
//! Every operation gets a fresh request id, fires its replica calls
//! concurrently, and then waits on the [`ResponseCollector`] for exactly the
//! number of replies it needs:
//!
//! - **PUT**: all replicas, success only if every replica acknowledged.
//! - **READ**: all replicas are asked, the first successful answer wins; the
//!   rest are drained in the background.
//! - **TAKE**: two voters reserve candidates round after round until they hold
//!   a tuple in common; that tuple is then removed at every replica and the
//!   voters' reservations are released.
//! - **DUMP**: all replicas, contents concatenated in replica order.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::ensure;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::{
    ClientId, ReplicaId, RequestId, RetryId,
    collector::{GroupKey, OpKind, Payload, ResponseCollector, ResponseEntry},
    config::CoordinatorConfig,
    message::{ReplicaCall, ReplicaOp},
    topology::{ReplicaTopology, VoterPair, voter_pair},
    transport::{RemoteReplica, ReplicaClient},
    tuple::{ArgumentError, Pattern, validate_tuple},
};

pub type SharedReplica = Arc<dyn ReplicaClient>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    InvalidArgument(#[from] ArgumentError),
    #[error("expected one delay per replica ({expected}), got {got}")]
    DelayCount { expected: usize, got: usize },
    #[error("replica {replica} rejected {key}: {reason}")]
    Rejected {
        key: GroupKey,
        replica: ReplicaId,
        reason: String,
    },
    #[error("replica {replica} unreachable during {key}: {reason}")]
    Unreachable {
        key: GroupKey,
        replica: ReplicaId,
        reason: String,
    },
    #[error("no response from replica {replica} for {key}")]
    MissingResponse { key: GroupKey, replica: ReplicaId },
    #[error("gave up on {key} after {waited:?} waiting for {wanted} replies")]
    DeadlineExceeded {
        key: GroupKey,
        wanted: usize,
        waited: Duration,
    },
    #[error("voters {voters:?} found no common tuple for client {client_id} in {rounds} rounds")]
    TakeContended {
        client_id: ClientId,
        voters: VoterPair,
        rounds: u32,
    },
    #[error("protocol violation during {key}: {detail}")]
    ProtocolViolation { key: GroupKey, detail: String },
}

pub struct Coordinator {
    replicas: Vec<SharedReplica>,
    collector: Arc<ResponseCollector>,
    next_request_id: AtomicU64,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(replicas: Vec<SharedReplica>, config: CoordinatorConfig) -> anyhow::Result<Self> {
        ensure!(
            replicas.len() >= 2,
            "coordinator needs at least two replicas, got {}",
            replicas.len()
        );
        Ok(Self {
            replicas,
            collector: Arc::new(ResponseCollector::new()),
            next_request_id: AtomicU64::new(1),
            config,
        })
    }

    /// Coordinator talking to every replica of `topology` over TCP.
    pub fn connect(topology: &ReplicaTopology, config: CoordinatorConfig) -> anyhow::Result<Self> {
        let replicas = topology
            .addrs()
            .iter()
            .map(|addr| Arc::new(RemoteReplica::new(addr.clone())) as SharedReplica)
            .collect();
        Self::new(replicas, config)
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn voters(&self, client_id: ClientId) -> VoterPair {
        voter_pair(client_id, self.replicas.len())
    }

    pub fn collector(&self) -> &ResponseCollector {
        &self.collector
    }

    pub async fn put(&self, tuple: &str, delays: &[u64]) -> Result<(), CoordinatorError> {
        validate_tuple(tuple)?;
        let delays = self.delays_for(delays)?;
        let request_id = self.next_request_id();
        let key = GroupKey::new(request_id, OpKind::Put);
        info!(request_id, %tuple, "put received");

        let calls = self.fan_out(key, self.replica_ids(), |replica| {
            ReplicaCall::delayed(
                ReplicaOp::Put {
                    tuple: tuple.to_string(),
                },
                delays[replica],
            )
        });
        self.await_replies(calls, self.replica_count()).await?;

        for (replica, payload) in self.collect_all(key)? {
            if payload != Payload::Ack {
                return Err(self.unexpected(key, replica, payload));
            }
        }
        debug!(request_id, "put acknowledged by every replica");
        Ok(())
    }

    pub async fn read(&self, pattern: &str, delays: &[u64]) -> Result<String, CoordinatorError> {
        Pattern::new(pattern)?;
        let delays = self.delays_for(delays)?;
        let request_id = self.next_request_id();
        let key = GroupKey::new(request_id, OpKind::Read);
        info!(request_id, %pattern, "read received");

        let mut calls = self.fan_out(key, self.replica_ids(), |replica| {
            ReplicaCall::delayed(
                ReplicaOp::Read {
                    pattern: pattern.to_string(),
                },
                delays[replica],
            )
        });

        let total = self.replica_count();
        let mut wanted = 1;
        let outcome = loop {
            calls = self.await_replies(calls, wanted).await?;
            let responses = self.collector.responses(key);
            let hit = responses.iter().find_map(|(replica, payload)| match payload {
                Payload::Tuple(tuple) => Some((*replica, tuple.clone())),
                _ => None,
            });
            if let Some((replica, tuple)) = hit {
                debug!(request_id, replica, %tuple, "read answered");
                break Ok(tuple);
            }
            if responses.len() >= total {
                let (replica, payload) = responses[0].clone();
                break Err(self.unexpected(key, replica, payload));
            }
            wanted = responses.len() + 1;
        };

        self.drain(key, total);
        outcome
    }

    pub async fn take(
        &self,
        client_id: ClientId,
        pattern: &str,
        delays: &[u64],
    ) -> Result<String, CoordinatorError> {
        Pattern::new(pattern)?;
        let delays = self.delays_for(delays)?;
        let request_id = self.next_request_id();
        let voters = self.voters(client_id);
        info!(request_id, client_id, %pattern, voters = ?voters.ids(), "take received");

        let mut retry_id: RetryId = 0;
        let agreed = loop {
            match self
                .lock_round(request_id, retry_id, client_id, pattern, voters)
                .await
            {
                Ok(Some(tuple)) => break tuple,
                Ok(None) => {
                    self.release_voters(request_id, retry_id, client_id, voters)
                        .await?;
                    let rounds = retry_id + 1;
                    if !self.config.take_retry.allows_another(rounds) {
                        warn!(request_id, client_id, rounds, "take gave up on contention");
                        return Err(CoordinatorError::TakeContended {
                            client_id,
                            voters,
                            rounds,
                        });
                    }
                    let pause = self.config.take_retry.next_pause();
                    debug!(request_id, retry_id, ?pause, "no common tuple, retrying");
                    sleep(pause).await;
                    retry_id += 1;
                }
                Err(err) => {
                    if let Err(release_err) = self
                        .release_voters(request_id, retry_id, client_id, voters)
                        .await
                    {
                        warn!(request_id, error = %release_err, "failed to release locks");
                    }
                    return Err(err);
                }
            }
        };

        let removed = self
            .remove_everywhere(request_id, client_id, &agreed, &delays)
            .await;
        if let Err(err) = self
            .release_voters(request_id, retry_id, client_id, voters)
            .await
        {
            warn!(request_id, client_id, error = %err, "failed to release locks after take");
        }
        removed?;

        info!(request_id, client_id, tuple = %agreed, rounds = retry_id + 1, "take completed");
        Ok(agreed)
    }

    pub async fn dump(&self) -> Result<Vec<String>, CoordinatorError> {
        let request_id = self.next_request_id();
        let key = GroupKey::new(request_id, OpKind::Dump);
        info!(request_id, "dump received");

        let calls = self.fan_out(key, self.replica_ids(), |_| ReplicaCall::new(ReplicaOp::Dump));
        self.await_replies(calls, self.replica_count()).await?;

        for (replica, payload) in self.collect_all(key)? {
            if !matches!(payload, Payload::Tuples(_)) {
                return Err(self.unexpected(key, replica, payload));
            }
        }
        Ok(self.collector.merge(request_id, OpKind::Dump))
    }

    /// One locking round: ask both voters to reserve matches, then intersect.
    async fn lock_round(
        &self,
        request_id: RequestId,
        retry_id: RetryId,
        client_id: ClientId,
        pattern: &str,
        voters: VoterPair,
    ) -> Result<Option<String>, CoordinatorError> {
        let key = GroupKey::round(request_id, retry_id, OpKind::Lock);
        let calls = self.fan_out(key, voters.ids(), |_| {
            ReplicaCall::new(ReplicaOp::AcquireLock {
                client_id,
                pattern: pattern.to_string(),
            })
        });
        self.await_replies(calls, 2).await?;

        let first = self.claimed(key, voters.first)?;
        let second = self.claimed(key, voters.second)?;
        let common = intersect(&first, &second);
        debug!(request_id, retry_id, ?first, ?second, ?common, "lock round finished");
        Ok(common.into_iter().next())
    }

    fn claimed(&self, key: GroupKey, replica: ReplicaId) -> Result<Vec<String>, CoordinatorError> {
        match self.collector.get(key, replica) {
            Some(Payload::Tuples(tuples)) => Ok(tuples),
            Some(other) => Err(self.unexpected(key, replica, other)),
            None => Err(CoordinatorError::MissingResponse { key, replica }),
        }
    }

    /// Removes the agreed tuple at every replica, voters or not.
    async fn remove_everywhere(
        &self,
        request_id: RequestId,
        client_id: ClientId,
        agreed: &str,
        delays: &[Option<u64>],
    ) -> Result<(), CoordinatorError> {
        let key = GroupKey::new(request_id, OpKind::Take);
        let exact = Pattern::exact(agreed)?;
        let calls = self.fan_out(key, self.replica_ids(), |replica| {
            ReplicaCall::delayed(
                ReplicaOp::Take {
                    pattern: exact.as_str().to_string(),
                    client_id,
                },
                delays[replica],
            )
        });
        self.await_replies(calls, self.replica_count()).await?;

        for (replica, payload) in self.collect_all(key)? {
            match payload {
                Payload::Tuple(tuple) if tuple == agreed => {}
                other => {
                    return Err(self.violation(
                        key,
                        format!("replica {replica} removed {other:?} instead of {agreed}"),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn release_voters(
        &self,
        request_id: RequestId,
        retry_id: RetryId,
        client_id: ClientId,
        voters: VoterPair,
    ) -> Result<(), CoordinatorError> {
        let key = GroupKey::round(request_id, retry_id, OpKind::Unlock);
        let calls = self.fan_out(key, voters.ids(), |_| {
            ReplicaCall::new(ReplicaOp::ReleaseLock { client_id })
        });
        self.await_replies(calls, 2).await?;

        for replica in voters.ids() {
            match self.collector.get(key, replica) {
                Some(Payload::Ack) => {}
                Some(other) => return Err(self.unexpected(key, replica, other)),
                None => return Err(CoordinatorError::MissingResponse { key, replica }),
            }
        }
        Ok(())
    }

    /// Fires one call per target; each reply lands in the collector.
    fn fan_out<I, F>(&self, key: GroupKey, targets: I, call_for: F) -> InFlight
    where
        I: IntoIterator<Item = ReplicaId>,
        F: Fn(ReplicaId) -> ReplicaCall,
    {
        let mut tasks = Vec::new();
        for replica in targets {
            let call = call_for(replica);
            let client = Arc::clone(&self.replicas[replica]);
            let collector = Arc::clone(&self.collector);
            debug!(%key, replica, op = call.op.name(), "sending call");

            tasks.push(tokio::spawn(async move {
                let payload = Payload::from_call(client.call(call).await);
                if let Payload::Unreachable(reason) = &payload {
                    warn!(%key, replica, target = %client.describe(), %reason, "replica call failed");
                }
                let entry = ResponseEntry {
                    key,
                    replica,
                    payload,
                };
                if let Err(err) = collector.record(entry) {
                    error!(error = %err, "protocol violation: reply dropped");
                }
            }));
        }
        InFlight { key, tasks }
    }

    /// Waits until `wanted` replies for `calls` are in the collector.
    ///
    /// On deadline every call still running is cancelled before the error is
    /// returned, so no replica acts on it afterwards.
    async fn await_replies(
        &self,
        calls: InFlight,
        wanted: usize,
    ) -> Result<InFlight, CoordinatorError> {
        let key = calls.key;
        let waiting = self.collector.wait_for_count(key, wanted);
        let Some(limit) = self.config.wait_timeout else {
            waiting.await;
            return Ok(calls);
        };
        if timeout(limit, waiting).await.is_ok() {
            return Ok(calls);
        }

        warn!(%key, wanted, "deadline exceeded waiting for replies");
        calls.abandon().await;
        Err(CoordinatorError::DeadlineExceeded {
            key,
            wanted,
            waited: limit,
        })
    }

    /// Every replica's reply for `key`, or the first failure among them.
    fn collect_all(&self, key: GroupKey) -> Result<Vec<(ReplicaId, Payload)>, CoordinatorError> {
        let responses = self.collector.responses(key);
        for replica in self.replica_ids() {
            if !responses.iter().any(|(from, _)| *from == replica) {
                return Err(CoordinatorError::MissingResponse { key, replica });
            }
        }
        if let Some((replica, payload)) = responses.iter().find(|(_, payload)| payload.is_failure()) {
            return Err(self.unexpected(key, *replica, payload.clone()));
        }
        Ok(responses)
    }

    /// Waits for the remaining replies of `key` without holding up the caller.
    fn drain(&self, key: GroupKey, total: usize) {
        let collector = Arc::clone(&self.collector);
        tokio::spawn(async move {
            collector.wait_for_count(key, total).await;
            for (replica, payload) in collector.responses(key) {
                if payload.is_failure() {
                    warn!(%key, replica, ?payload, "straggler reply failed");
                }
            }
            debug!(%key, "all replies drained");
        });
    }

    fn unexpected(&self, key: GroupKey, replica: ReplicaId, payload: Payload) -> CoordinatorError {
        match payload {
            Payload::Rejected(reason) => CoordinatorError::Rejected {
                key,
                replica,
                reason,
            },
            Payload::Unreachable(reason) => CoordinatorError::Unreachable {
                key,
                replica,
                reason,
            },
            other => self.violation(key, format!("replica {replica} answered {other:?}")),
        }
    }

    fn violation(&self, key: GroupKey, detail: String) -> CoordinatorError {
        error!(%key, %detail, "protocol violation");
        CoordinatorError::ProtocolViolation { key, detail }
    }

    fn delays_for(&self, delays: &[u64]) -> Result<Vec<Option<u64>>, CoordinatorError> {
        match delays.len() {
            0 => Ok(vec![None; self.replica_count()]),
            n if n == self.replica_count() => Ok(delays.iter().copied().map(Some).collect()),
            got => Err(CoordinatorError::DelayCount {
                expected: self.replica_count(),
                got,
            }),
        }
    }

    fn replica_ids(&self) -> std::ops::Range<ReplicaId> {
        0..self.replicas.len()
    }

    fn next_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Replica calls of one fan-out that may still be running.
///
/// Dropping it detaches the calls; their replies still reach the collector.
struct InFlight {
    key: GroupKey,
    tasks: Vec<JoinHandle<()>>,
}

impl InFlight {
    /// Cancels every call that has not replied yet and waits until each task
    /// has stopped.
    async fn abandon(self) {
        for task in &self.tasks {
            task.abort();
        }
        let mut cancelled = 0;
        for task in self.tasks {
            if task.await.is_err_and(|err| err.is_cancelled()) {
                cancelled += 1;
            }
        }
        debug!(key = %self.key, cancelled, "outstanding calls abandoned");
    }
}

/// Tuples reserved at both voters, in the first voter's order, without repeats.
pub fn intersect(first: &[String], second: &[String]) -> Vec<String> {
    let second: HashSet<&str> = second.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    first
        .iter()
        .filter(|tuple| second.contains(tuple.as_str()) && seen.insert(tuple.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuples(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn intersection_keeps_only_tuples_held_by_both_voters() {
        let first = tuples(&["<x,1>", "<x,2>", "<x,3>"]);
        let second = tuples(&["<x,3>", "<x,2>", "<x,9>"]);
        assert_eq!(intersect(&first, &second), tuples(&["<x,2>", "<x,3>"]));
    }

    #[test]
    fn intersection_with_one_empty_side_is_empty() {
        let held = tuples(&["<x,1>"]);
        assert!(intersect(&held, &[]).is_empty());
        assert!(intersect(&[], &held).is_empty());
    }

    #[test]
    fn intersection_drops_duplicate_copies() {
        let first = tuples(&["<a>", "<a>", "<b>"]);
        let second = tuples(&["<a>"]);
        assert_eq!(intersect(&first, &second), tuples(&["<a>"]));
    }

    #[test]
    fn needs_two_replicas() {
        assert!(Coordinator::new(Vec::new(), CoordinatorConfig::default()).is_err());
    }
}
