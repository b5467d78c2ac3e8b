//! How the coordinator reaches a replica.
//!
//! The coordinator only sees [`ReplicaClient`]. [`RemoteReplica`] speaks the
//! JSON line protocol over TCP; [`LocalReplica`] calls a [`ReplicaService`]
//! in the same process and is what the protocol tests run against.
//!
//! Transports never retry. A failed call is reported once and the
//! coordinator decides what it means for the operation.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::{io::BufReader, net::TcpStream};

use crate::{
    message::{ReplicaCall, ReplicaReply, read_message, write_message},
    replica::ReplicaService,
};

#[async_trait]
pub trait ReplicaClient: Send + Sync {
    /// Sends one call and waits for its reply, however long the replica blocks.
    async fn call(&self, call: ReplicaCall) -> Result<ReplicaReply>;

    /// Human-readable target, used in logs.
    fn describe(&self) -> String;
}

/// Replica reached over TCP. Each call uses its own connection.
pub struct RemoteReplica {
    addr: String,
}

impl RemoteReplica {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl ReplicaClient for RemoteReplica {
    async fn call(&self, call: ReplicaCall) -> Result<ReplicaReply> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to replica {}", self.addr))?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_message(&mut writer, &call)
            .await
            .with_context(|| format!("failed to send {} to {}", call.op.name(), self.addr))?;
        read_message::<_, ReplicaReply>(&mut reader)
            .await
            .with_context(|| format!("failed to read reply from {}", self.addr))?
            .ok_or_else(|| anyhow!("replica {} closed the connection without replying", self.addr))
    }

    fn describe(&self) -> String {
        self.addr.clone()
    }
}

/// Replica living in the same process.
pub struct LocalReplica {
    service: Arc<ReplicaService>,
}

impl LocalReplica {
    pub fn new(service: Arc<ReplicaService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ReplicaClient for LocalReplica {
    async fn call(&self, call: ReplicaCall) -> Result<ReplicaReply> {
        Ok(self.service.handle(call).await)
    }

    fn describe(&self) -> String {
        format!("local replica {}", self.service.id())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;
    use crate::message::ReplicaOp;
    use crate::replica::ReplicaServer;

    #[tokio::test]
    async fn remote_replica_round_trip() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let service = Arc::new(ReplicaService::new(0));
        let server = ReplicaServer::new(listener, Arc::clone(&service));
        let addr = server.local_addr()?;
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        let remote = RemoteReplica::new(addr.to_string());
        let put = remote
            .call(ReplicaCall::new(ReplicaOp::Put {
                tuple: "<r,1>".into(),
            }))
            .await?;
        assert_eq!(put, ReplicaReply::Ok);
        assert_eq!(service.store().snapshot(), vec!["<r,1>"]);

        let _ = shutdown_tx.send(());
        handle.await??;
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_replica_is_an_error() -> Result<()> {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
        let remote = RemoteReplica::new(addr.to_string());
        let result = remote.call(ReplicaCall::new(ReplicaOp::Dump)).await;
        assert!(result.is_err());
        Ok(())
    }
}
