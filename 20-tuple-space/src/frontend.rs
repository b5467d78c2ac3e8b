//! Client-facing surface of the coordinator.
//!
//! [`FrontendServer`] accepts client connections and answers each
//! [`FrontendRequest`] through the shared [`Coordinator`]. Requests on one
//! connection are served in order; separate connections run concurrently.
//! [`FrontendClient`] is the typed counterpart used by the shell and tests.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::BufReader,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    ClientId,
    coordinator::Coordinator,
    message::{FrontendRequest, FrontendResponse, read_message, write_message},
};

pub struct FrontendServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
}

impl FrontendServer {
    pub fn new(listener: TcpListener, coordinator: Arc<Coordinator>) -> Self {
        Self {
            listener,
            coordinator,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let FrontendServer {
            listener,
            coordinator,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("frontend shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &coordinator);
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

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    coordinator: &Arc<Coordinator>,
) {
    match result {
        Ok((stream, peer)) => {
            let coordinator = Arc::clone(coordinator);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, &coordinator).await {
                    warn!(peer = %peer, error = ?err, "client connection closed with error");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn handle_connection(stream: TcpStream, coordinator: &Coordinator) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    info!(?peer, "client connected");

    while let Some(request) = read_message::<_, FrontendRequest>(&mut reader).await? {
        let response = execute(coordinator, request).await;
        write_message(&mut writer, &response).await?;
    }

    info!(?peer, "client disconnected");
    Ok(())
}

/// Runs one client request and folds the outcome into a response.
pub async fn execute(coordinator: &Coordinator, request: FrontendRequest) -> FrontendResponse {
    let outcome = match request {
        FrontendRequest::Put { tuple, delays } => coordinator
            .put(&tuple, &delays)
            .await
            .map(|()| FrontendResponse::Ok),
        FrontendRequest::Read { pattern, delays } => coordinator
            .read(&pattern, &delays)
            .await
            .map(|tuple| FrontendResponse::Tuple { tuple }),
        FrontendRequest::Take {
            pattern,
            client_id,
            delays,
        } => coordinator
            .take(client_id, &pattern, &delays)
            .await
            .map(|tuple| FrontendResponse::Tuple { tuple }),
        FrontendRequest::Dump => coordinator
            .dump()
            .await
            .map(|tuples| FrontendResponse::Tuples { tuples }),
    };

    outcome.unwrap_or_else(|err| {
        warn!(error = %err, "request failed");
        FrontendResponse::Error {
            message: err.to_string(),
        }
    })
}

/// Connection to a frontend, reused across requests.
pub struct FrontendClient {
    client_id: ClientId,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FrontendClient {
    pub async fn connect(addr: &str, client_id: ClientId) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            client_id,
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub async fn put(&mut self, tuple: &str, delays: Vec<u64>) -> Result<()> {
        let request = FrontendRequest::Put {
            tuple: tuple.to_string(),
            delays,
        };
        match self.round_trip(&request).await? {
            FrontendResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn read(&mut self, pattern: &str, delays: Vec<u64>) -> Result<String> {
        let request = FrontendRequest::Read {
            pattern: pattern.to_string(),
            delays,
        };
        match self.round_trip(&request).await? {
            FrontendResponse::Tuple { tuple } => Ok(tuple),
            other => Err(unexpected(other)),
        }
    }

    pub async fn take(&mut self, pattern: &str, delays: Vec<u64>) -> Result<String> {
        let request = FrontendRequest::Take {
            pattern: pattern.to_string(),
            client_id: self.client_id,
            delays,
        };
        match self.round_trip(&request).await? {
            FrontendResponse::Tuple { tuple } => Ok(tuple),
            other => Err(unexpected(other)),
        }
    }

    pub async fn dump(&mut self) -> Result<Vec<String>> {
        match self.round_trip(&FrontendRequest::Dump).await? {
            FrontendResponse::Tuples { tuples } => Ok(tuples),
            other => Err(unexpected(other)),
        }
    }

    async fn round_trip(&mut self, request: &FrontendRequest) -> Result<FrontendResponse> {
        write_message(&mut self.writer, request)
            .await
            .context("failed to send request")?;
        match read_message::<_, FrontendResponse>(&mut self.reader)
            .await
            .context("failed to read response")?
        {
            Some(response) => Ok(response),
            None => bail!("frontend closed the connection"),
        }
    }
}

fn unexpected(response: FrontendResponse) -> anyhow::Error {
    match response {
        FrontendResponse::Error { message } => anyhow!(message),
        other => anyhow!("unexpected response: {other:?}"),
    }
}
