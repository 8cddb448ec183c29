//! Hub control server.
//!
//! Each WebSocket connection carries JSON text frames for one node until its
//! first peer link is up. The server only translates: registration and
//! signals go to the hub's [`NodeHandle`], and whatever the node routes back
//! to the registered id is written out as `signal` replies. When the node
//! drops the id's sink (promotion or eviction) the socket is closed.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use weft_core::{ControlReply, ControlRequest, PeerId, SignalData};

use crate::config::HubConfig;
use crate::error::Result;
use crate::node::NodeHandle;

/// WebSocket front end of a hub node
#[derive(Debug)]
pub struct HubServer {
    listener: TcpListener,
    node: NodeHandle,
}

impl HubServer {
    /// Bind the listen address.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Io`](crate::MeshError::Io) if the address cannot be bound.
    pub async fn bind(config: &HubConfig, node: NodeHandle) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        Ok(Self { listener, node })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Io`](crate::MeshError::Io) if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the node stops.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Io`](crate::MeshError::Io) if accepting fails.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "hub control server listening");
        while self.node.is_running() {
            let (stream, addr) = self.listener.accept().await?;
            let node = self.node.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(stream, node).await {
                    debug!(%addr, error = %e, "control connection ended with error");
                }
            });
        }
        Ok(())
    }
}

async fn serve(stream: TcpStream, node: NodeHandle) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut outgoing, mut incoming) = ws.split();
    let mut registered: Option<PeerId> = None;
    let mut signals: Option<mpsc::UnboundedReceiver<SignalData>> = None;

    loop {
        tokio::select! {
            frame = incoming.next() => {
                let Some(frame) = frame else { break };
                let text = match frame? {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let request = match ControlRequest::parse(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "malformed control request ignored");
                        continue;
                    }
                };
                match request {
                    ControlRequest::Register { id, worker } => {
                        if registered.is_some() {
                            warn!("second register on one connection ignored");
                            continue;
                        }
                        let (tx, rx) = mpsc::unbounded_channel();
                        let outcome = node.register(id, worker, tx).await?;
                        let reply = ControlReply::Register {
                            id: outcome.hub,
                            success: outcome.accepted,
                        };
                        outgoing.send(Message::Text(reply.to_text()?)).await?;
                        if outcome.accepted {
                            registered = id;
                            signals = Some(rx);
                        }
                    }
                    ControlRequest::Signal { ice_data } => match registered {
                        Some(id) => node.control_signal(id, ice_data).await?,
                        None => debug!("signal before registration ignored"),
                    },
                    ControlRequest::Ahoy => {
                        debug!(peer = ?registered.map(|id| id.short()), "ahoy over control channel");
                    }
                }
            }
            signal = recv_signal(&mut signals) => match signal {
                Some(ice_data) => {
                    let reply = ControlReply::Signal { ice_data };
                    outgoing.send(Message::Text(reply.to_text()?)).await?;
                }
                None => {
                    debug!("control channel released by node");
                    break;
                }
            },
        }
    }

    let _ = outgoing.send(Message::Close(None)).await;
    if let Some(id) = registered {
        node.control_closed(id).await?;
    }
    Ok(())
}

async fn recv_signal(signals: &mut Option<mpsc::UnboundedReceiver<SignalData>>) -> Option<SignalData> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::memory::MemoryConnector;
    use crate::node::MeshNode;
    use std::sync::Arc;
    use std::time::Duration;
    use weft_files::MemoryStore;

    async fn start() -> SocketAddr {
        let node = MeshNode::hub(
            NodeConfig::default(),
            &HubConfig::default(),
            Arc::new(MemoryConnector::new()),
            Arc::new(MemoryStore::new()),
        );
        let (handle, _) = node.spawn();
        let config = HubConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..HubConfig::default()
        };
        let server = HubServer::bind(&config, handle).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        addr
    }

    async fn reply<S>(ws: &mut S) -> ControlReply
    where
        S: futures_util::Stream<
                Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        ControlReply::parse(frame.to_text().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_register_over_websocket() {
        let addr = start().await;
        let url = format!("ws://{addr}");
        let id = PeerId::random();

        let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let request = ControlRequest::Register {
            id: Some(id),
            worker: false,
        };
        first
            .send(Message::Text(request.to_text().unwrap()))
            .await
            .unwrap();
        let ControlReply::Register { id: hub, success } = reply(&mut first).await else {
            panic!("expected register reply");
        };
        assert!(success);
        assert_ne!(hub, id);

        // same id from another connection collides
        let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        second
            .send(Message::Text(request.to_text().unwrap()))
            .await
            .unwrap();
        let ControlReply::Register { success, .. } = reply(&mut second).await else {
            panic!("expected register reply");
        };
        assert!(!success);

        // missing id is refused
        let bare = r#"{"reason":"register"}"#;
        second.send(Message::Text(bare.into())).await.unwrap();
        let ControlReply::Register { success, .. } = reply(&mut second).await else {
            panic!("expected register reply");
        };
        assert!(!success);
    }

    #[tokio::test]
    async fn test_malformed_request_keeps_connection() {
        let addr = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws.send(Message::Text("not json".into())).await.unwrap();
        ws.send(Message::Text(
            r#"{"reason":"register","id":"not-a-uuid"}"#.into(),
        ))
        .await
        .unwrap();
        let request = ControlRequest::Register {
            id: Some(PeerId::random()),
            worker: true,
        };
        ws.send(Message::Text(request.to_text().unwrap()))
            .await
            .unwrap();
        let ControlReply::Register { success, .. } = reply(&mut ws).await else {
            panic!("expected register reply");
        };
        assert!(success);
    }
}
