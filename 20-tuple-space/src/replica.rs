//! Replica process: a [`TupleStore`] exposed over TCP.
//!
//! [`ReplicaService`] turns a [`ReplicaCall`] into store operations and holds
//! no state of its own beyond the store. [`ReplicaServer`] accepts
//! connections and runs each one on its own task, so a READ blocked on one
//! connection never holds up another.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    ReplicaId,
    message::{ReplicaCall, ReplicaOp, ReplicaReply, read_message, write_message},
    store::TupleStore,
    tuple::Pattern,
};

pub struct ReplicaService {
    id: ReplicaId,
    store: TupleStore,
}

impl ReplicaService {
    pub fn new(id: ReplicaId) -> Self {
        Self {
            id,
            store: TupleStore::new(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn store(&self) -> &TupleStore {
        &self.store
    }

    /// Executes one call, honouring its artificial delay first.
    pub async fn handle(&self, call: ReplicaCall) -> ReplicaReply {
        if let Some(delay) = call.delay_secs.filter(|secs| *secs > 0) {
            debug!(replica = self.id, delay, op = call.op.name(), "delaying call");
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        debug!(replica = self.id, op = ?call.op, "handling call");
        match call.op {
            ReplicaOp::Put { tuple } => {
                self.store.put(tuple);
                ReplicaReply::Ok
            }
            ReplicaOp::Read { pattern } => match Pattern::new(&pattern) {
                Ok(pattern) => ReplicaReply::Tuple {
                    tuple: self.store.read(&pattern).await,
                },
                Err(err) => reject(err),
            },
            ReplicaOp::Take { pattern, client_id } => match Pattern::new(&pattern) {
                Ok(pattern) => {
                    let tuple = self.store.take(&pattern).await;
                    debug!(replica = self.id, client_id, %tuple, "tuple taken");
                    ReplicaReply::Tuple { tuple }
                }
                Err(err) => reject(err),
            },
            ReplicaOp::Dump => ReplicaReply::Tuples {
                tuples: self.store.snapshot(),
            },
            ReplicaOp::AcquireLock { client_id, pattern } => match Pattern::new(&pattern) {
                Ok(pattern) => ReplicaReply::Tuples {
                    tuples: self.store.acquire_lock(client_id, &pattern).await,
                },
                Err(err) => reject(err),
            },
            ReplicaOp::ReleaseLock { client_id } => {
                self.store.release_lock(client_id);
                ReplicaReply::Ok
            }
        }
    }
}

fn reject(err: impl std::fmt::Display) -> ReplicaReply {
    ReplicaReply::Error {
        message: err.to_string(),
    }
}

pub struct ReplicaServer {
    listener: TcpListener,
    service: Arc<ReplicaService>,
}

impl ReplicaServer {
    pub fn new(listener: TcpListener, service: Arc<ReplicaService>) -> Self {
        Self { listener, service }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ReplicaServer { listener, service } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(replica = service.id(), "replica shutting down");
                    break;
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => spawn_connection(stream, peer, &service),
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, service: &Arc<ReplicaService>) {
    let service = Arc::clone(service);
    tokio::spawn(async move {
        if let Err(err) = serve_connection(stream, &service).await {
            warn!(peer = %peer, error = ?err, "replica connection closed with error");
        }
    });
}

async fn serve_connection(stream: TcpStream, service: &ReplicaService) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(call) = read_message::<_, ReplicaCall>(&mut reader).await? {
        let op = call.op.name();
        let reply = select! {
            biased;
            () = caller_gone(&mut reader) => {
                debug!(replica = service.id(), op, "caller hung up, call abandoned");
                return Ok(());
            }
            reply = service.handle(call) => reply,
        };
        write_message(&mut writer, &reply).await?;
    }
    Ok(())
}

/// Resolves once the peer has closed its side of the connection.
///
/// Bytes of a pipelined call are left in the buffer for the next read.
async fn caller_gone(reader: &mut BufReader<OwnedReadHalf>) {
    let open = matches!(reader.fill_buf().await, Ok(buf) if !buf.is_empty());
    if open {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LockState;

    #[tokio::test]
    async fn service_runs_the_lock_cycle() {
        let service = ReplicaService::new(1);
        service.handle(ReplicaCall::new(ReplicaOp::Put { tuple: "<a,1>".into() })).await;

        let reply = service
            .handle(ReplicaCall::new(ReplicaOp::AcquireLock {
                client_id: 9,
                pattern: "<a,.*>".into(),
            }))
            .await;
        assert_eq!(
            reply,
            ReplicaReply::Tuples {
                tuples: vec!["<a,1>".into()]
            }
        );

        let release = ReplicaCall::new(ReplicaOp::ReleaseLock { client_id: 9 });
        assert_eq!(service.handle(release.clone()).await, ReplicaReply::Ok);
        assert_eq!(service.handle(release).await, ReplicaReply::Ok);
    }

    #[tokio::test]
    async fn invalid_pattern_is_an_error_reply() {
        let service = ReplicaService::new(0);
        let reply = service
            .handle(ReplicaCall::new(ReplicaOp::Read {
                pattern: "<(".into(),
            }))
            .await;
        assert!(matches!(reply, ReplicaReply::Error { .. }));
    }

    #[tokio::test]
    async fn hung_up_caller_cancels_a_blocked_lock_request() -> Result<()> {
        let service = Arc::new(ReplicaService::new(0));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = ReplicaServer::new(listener, Arc::clone(&service));
        tokio::spawn(server.run_until(std::future::pending()));

        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        let call = ReplicaCall::new(ReplicaOp::AcquireLock {
            client_id: 7,
            pattern: "<z>".into(),
        });
        write_message(&mut writer, &call).await?;

        // Nothing matches yet, so the request parks at the store.
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(writer);
        drop(reader);
        tokio::time::sleep(Duration::from_millis(100)).await;

        service.store().put("<z>");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            service.store().lock_table(),
            vec![("<z>".to_string(), LockState::Free)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn delay_hook_sleeps_before_processing() {
        let service = ReplicaService::new(0);
        let started = tokio::time::Instant::now();
        service
            .handle(ReplicaCall::delayed(ReplicaOp::Dump, Some(1)))
            .await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
