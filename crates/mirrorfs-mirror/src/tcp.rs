//! TCP transport and request server
//!
//! Each connection carries a sequence of request/response frame pairs.
//! Idle client connections are pooled per peer address.

use crate::message::{MirrorRequest, MirrorResponse, read_frame, write_frame};
use crate::transport::{RequestHandler, Transport};
use async_trait::async_trait;
use mirrorfs_common::config::PeerConfig;
use mirrorfs_common::{Error, Result, TargetId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Idle connections kept per peer address
const MAX_IDLE_PER_PEER: usize = 8;

/// Client side of the mirroring protocol
pub struct TcpTransport {
    peers: RwLock<HashMap<TargetId, String>>,
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    connect_timeout: Duration,
}

impl TcpTransport {
    #[must_use]
    pub fn new(peers: &[PeerConfig], connect_timeout: Duration) -> Self {
        Self {
            peers: RwLock::new(
                peers
                    .iter()
                    .map(|p| (p.target, p.address.clone()))
                    .collect(),
            ),
            idle: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Add or replace the address of a target
    pub fn set_peer(&self, target: TargetId, address: impl Into<String>) {
        self.peers.write().insert(target, address.into());
    }

    fn address_of(&self, target: TargetId) -> Result<String> {
        self.peers
            .read()
            .get(&target)
            .cloned()
            .ok_or_else(|| Error::communication(format!("no address known for target {target}")))
    }

    fn take_idle(&self, address: &str) -> Option<TcpStream> {
        self.idle.lock().get_mut(address).and_then(Vec::pop)
    }

    fn put_idle(&self, address: String, stream: TcpStream) {
        let mut idle = self.idle.lock();
        let streams = idle.entry(address).or_default();
        if streams.len() < MAX_IDLE_PER_PEER {
            streams.push(stream);
        }
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::communication(format!("connect to {address} timed out")))?
            .map_err(|e| Error::communication(format!("connect to {address} failed: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// One request/response exchange; I/O failures become communication errors
async fn exchange(stream: &mut TcpStream, request: &MirrorRequest) -> Result<MirrorResponse> {
    let as_comm = |e: Error| match e {
        Error::Io(io) => Error::communication(io.to_string()),
        other => other,
    };
    write_frame(stream, request).await.map_err(as_comm)?;
    read_frame(stream)
        .await
        .map_err(as_comm)?
        .ok_or_else(|| Error::communication("connection closed by peer"))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        target: TargetId,
        request: MirrorRequest,
        timeout: Duration,
    ) -> Result<MirrorResponse> {
        let address = self.address_of(target)?;

        let attempt = async {
            // A pooled connection may have been closed by the peer meanwhile
            if let Some(mut stream) = self.take_idle(&address) {
                match exchange(&mut stream, &request).await {
                    Ok(response) => return Ok((stream, response)),
                    Err(e) => debug!(target_id = %target, "pooled connection failed: {}", e),
                }
            }
            let mut stream = self.connect(&address).await?;
            let response = exchange(&mut stream, &request).await?;
            Ok::<_, Error>((stream, response))
        };

        let (stream, response) = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| Error::Timeout)??;
        self.put_idle(address, stream);
        Ok(response)
    }
}

/// Accept connections on `listener` and hand every request to `handler`
pub async fn serve(listener: TcpListener, handler: Arc<dyn RequestHandler>) -> Result<()> {
    info!("Mirroring server listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer, handler).await {
                warn!(%peer, "connection ended with error: {}", e);
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RequestHandler>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    debug!(%peer, "connection accepted");
    while let Some(request) = read_frame::<_, MirrorRequest>(&mut stream).await? {
        let response = handler.handle(request).await;
        write_frame(&mut stream, &response).await?;
    }
    debug!(%peer, "connection closed");
    Ok(())
}
