//! Consensus RPC over TCP: length-delimited frames carrying JSON messages.
//!
//! Each peer gets one pooled connection; requests on it are strictly
//! request/response, so calls to the same peer are serialized. A failed,
//! timed-out or abandoned call drops the connection and the next call
//! reconnects.

use crate::distributed::raft::RaftNode;
use crate::distributed::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, JoinRequest, JoinResponse, VoteRequest, VoteResponse,
};
use crate::distributed::transport::Transport;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
enum RpcRequest {
    Vote(VoteRequest),
    Append(AppendEntriesRequest),
    Join(JoinRequest),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
enum RpcResponse {
    Vote(VoteResponse),
    Append(AppendEntriesResponse),
    Join(JoinResponse),
    Error(String),
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Client side: sends RPCs to peers by socket address
pub struct TcpTransport {
    timeout: Duration,
    connections: DashMap<String, Arc<Mutex<Option<Connection>>>>,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            connections: DashMap::new(),
        }
    }

    async fn call(&self, target: &str, request: RpcRequest) -> Result<RpcResponse> {
        let slot = Arc::clone(&self.connections.entry(target.to_string()).or_default());
        let mut pooled = slot.lock().await;
        // taken for the duration of the call: a call dropped midway leaves the
        // slot empty rather than holding a half-finished exchange
        let connection = pooled.take();
        match tokio::time::timeout(self.timeout, exchange(connection, target, &request)).await {
            Ok(Ok((connection, response))) => {
                *pooled = Some(connection);
                match response {
                    RpcResponse::Error(message) => Err(Error::Distributed(format!("{target}: {message}"))),
                    response => Ok(response),
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Distributed(format!("rpc to {target} timed out"))),
        }
    }
}

async fn exchange(
    connection: Option<Connection>,
    target: &str,
    request: &RpcRequest,
) -> Result<(Connection, RpcResponse)> {
    let mut framed = match connection {
        Some(framed) => framed,
        None => {
            let stream = TcpStream::connect(target).await?;
            stream.set_nodelay(true)?;
            debug!(peer = target, "connected");
            Framed::new(stream, codec())
        }
    };

    framed.send(Bytes::from(serde_json::to_vec(request)?)).await?;
    let frame = framed
        .next()
        .await
        .ok_or_else(|| Error::Distributed(format!("{target} closed the connection")))??;
    let response = serde_json::from_slice(&frame)?;
    Ok((framed, response))
}

fn unexpected(target: &str) -> Error {
    Error::Distributed(format!("unexpected response type from {target}"))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse> {
        match self.call(target, RpcRequest::Vote(request)).await? {
            RpcResponse::Vote(response) => Ok(response),
            _ => Err(unexpected(target)),
        }
    }

    async fn append_entries(&self, target: &str, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        match self.call(target, RpcRequest::Append(request)).await? {
            RpcResponse::Append(response) => Ok(response),
            _ => Err(unexpected(target)),
        }
    }

    async fn join(&self, target: &str, request: JoinRequest) -> Result<JoinResponse> {
        match self.call(target, RpcRequest::Join(request)).await? {
            RpcResponse::Join(response) => Ok(response),
            _ => Err(unexpected(target)),
        }
    }
}

/// Server side: accepts peer connections and hands requests to a node
pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    /// Bind before the node exists, so an ephemeral port can be used as the
    /// node's advertised address
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Distributed(format!("failed to bind {addr}: {e}")))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires
    pub async fn serve(self, node: Arc<RaftNode>, cancel: CancellationToken) {
        let local = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(addr = %local, node = node.node_id(), "rpc server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let node = Arc::clone(&node);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, node, cancel).await {
                                debug!(%peer, error = %e, "rpc connection closed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        info!(addr = %local, "rpc server stopped");
    }
}

async fn handle_connection(stream: TcpStream, node: Arc<RaftNode>, cancel: CancellationToken) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, codec());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        let response = match serde_json::from_slice::<RpcRequest>(&frame?) {
            Ok(request) => dispatch(&node, request).await,
            Err(e) => RpcResponse::Error(format!("malformed request: {e}")),
        };
        framed.send(Bytes::from(serde_json::to_vec(&response)?)).await?;
    }
}

async fn dispatch(node: &RaftNode, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Vote(request) => RpcResponse::Vote(node.handle_request_vote(request).await),
        RpcRequest::Append(request) => RpcResponse::Append(node.handle_append_entries(request).await),
        RpcRequest::Join(request) => RpcResponse::Join(node.handle_join(request).await),
    }
}
