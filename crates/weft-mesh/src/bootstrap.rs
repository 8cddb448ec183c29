//! Client and worker bootstrap.
//!
//! A node with no peers registers a fresh id with the hub over WebSocket,
//! then negotiates its first link to the hub with the control channel as the
//! signaling route. Once the hub is promoted to a connected peer the socket
//! is no longer needed; every later link is signaled through relays.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use weft_core::{ControlReply, ControlRequest, PeerId, SignalData};

use crate::config::BootstrapConfig;
use crate::error::{MeshError, Result};
use crate::node::{NodeEvent, NodeHandle};

/// Join the mesh through the hub at `config.hub_url`.
///
/// Returns the hub's id once the first link is up. Failed attempts are
/// retried with a new id after `config.backoff(attempt)`.
///
/// # Errors
///
/// Returns [`MeshError::BootstrapExhausted`] once every attempt has failed,
/// or the first non-transient error (for example [`MeshError::NodeStopped`]).
pub async fn bootstrap(config: &BootstrapConfig, node: &NodeHandle) -> Result<PeerId> {
    for attempt in 0..config.max_attempts {
        match attempt_once(config, node).await {
            Ok(hub) => return Ok(hub),
            Err(e) if e.is_transient() => {
                let delay = config.backoff(attempt);
                warn!(attempt = attempt + 1, error = %e, ?delay, "bootstrap attempt failed");
                if attempt + 1 < config.max_attempts {
                    sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(MeshError::BootstrapExhausted {
        attempts: config.max_attempts,
    })
}

async fn attempt_once(config: &BootstrapConfig, node: &NodeHandle) -> Result<PeerId> {
    let (ws, _) = timeout(
        config.reply_timeout,
        tokio_tungstenite::connect_async(config.hub_url.as_str()),
    )
    .await
    .map_err(|_| MeshError::timeout("hub connect"))??;
    let (mut outgoing, mut incoming) = ws.split();

    let id = PeerId::random();
    let register = ControlRequest::Register {
        id: Some(id),
        worker: config.worker,
    };
    outgoing.send(Message::Text(register.to_text()?)).await?;

    let hub = timeout(config.reply_timeout, register_reply(&mut incoming))
        .await
        .map_err(|_| MeshError::timeout("register reply"))??;
    info!(%id, hub = %hub.short(), "registered with hub");

    let mut events = node.subscribe();
    let (route, mut signals) = mpsc::unbounded_channel();
    node.dial_hub(id, hub, route).await?;

    let linked = timeout(
        config.connect_timeout,
        relay_until_linked(node, hub, &mut events, &mut signals, &mut outgoing, &mut incoming),
    )
    .await
    .unwrap_or(Err(MeshError::timeout("first link to hub")));

    match linked {
        Ok(()) => {
            if let Ok(text) = ControlRequest::Ahoy.to_text() {
                let _ = outgoing.send(Message::Text(text)).await;
            }
            let _ = outgoing.send(Message::Close(None)).await;
            info!(hub = %hub.short(), "joined mesh");
            Ok(hub)
        }
        Err(e) => {
            node.close(hub).await?;
            Err(e)
        }
    }
}

async fn register_reply<S>(incoming: &mut S) -> Result<PeerId>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = incoming.next().await {
        let Message::Text(text) = frame? else {
            continue;
        };
        match ControlReply::parse(&text)? {
            ControlReply::Register { id, success: true } => return Ok(id),
            ControlReply::Register { success: false, .. } => {
                return Err(MeshError::RegistrationRejected);
            }
            ControlReply::Signal { .. } => debug!("signal before register reply ignored"),
        }
    }
    Err(MeshError::WebSocket("closed before register reply".into()))
}

/// Carry signals between the node and the hub until the hub link is up.
///
/// The hub closes the socket once it has promoted us, which may happen
/// before our own node has seen the hub's Ahoy; only the node event ends
/// the wait.
async fn relay_until_linked<S, K>(
    node: &NodeHandle,
    hub: PeerId,
    events: &mut broadcast::Receiver<NodeEvent>,
    signals: &mut mpsc::UnboundedReceiver<SignalData>,
    outgoing: &mut K,
    incoming: &mut S,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    let mut socket_open = true;
    let mut route_open = true;
    loop {
        tokio::select! {
            signal = signals.recv(), if route_open => match signal {
                Some(ice_data) => {
                    let text = ControlRequest::Signal { ice_data }.to_text()?;
                    if socket_open && outgoing.send(Message::Text(text)).await.is_err() {
                        socket_open = false;
                    }
                }
                None => route_open = false,
            },
            frame = incoming.next(), if socket_open => match frame {
                Some(Ok(Message::Text(text))) => match ControlReply::parse(&text) {
                    Ok(ControlReply::Signal { ice_data }) => node.hub_signal(ice_data).await?,
                    Ok(other) => debug!(?other, "unexpected control reply"),
                    Err(e) => warn!(error = %e, "malformed control reply"),
                },
                Some(Ok(Message::Close(_)) | Err(_)) | None => socket_open = false,
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(NodeEvent::BootstrapComplete { hub: h }) if h == hub => return Ok(()),
                Ok(NodeEvent::PeerClosed { peer }) if peer == hub => {
                    return Err(MeshError::link("first link to hub closed"));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(MeshError::NodeStopped),
            },
        }
    }
}

/// Forward signals between a node's hub route and a control channel.
///
/// Used where the control channel is not a WebSocket, such as in-process
/// meshes.
pub async fn pump_control(
    node: NodeHandle,
    mut from_node: mpsc::UnboundedReceiver<SignalData>,
    mut from_hub: mpsc::UnboundedReceiver<SignalData>,
    hub: NodeHandle,
    id: PeerId,
) -> Result<()> {
    let (mut up, mut down) = (true, true);
    while up || down {
        tokio::select! {
            signal = from_node.recv(), if up => match signal {
                Some(signal) => hub.control_signal(id, signal).await?,
                None => up = false,
            },
            signal = from_hub.recv(), if down => match signal {
                Some(signal) => node.hub_signal(signal).await?,
                None => down = false,
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HubConfig, NodeConfig};
    use crate::memory::MemoryConnector;
    use crate::node::MeshNode;
    use crate::server::HubServer;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use weft_core::Role;
    use weft_files::MemoryStore;

    fn quick(url: String) -> BootstrapConfig {
        BootstrapConfig {
            hub_url: url,
            max_attempts: 2,
            backoff_base: Duration::from_millis(10),
            backoff_step: Duration::from_millis(10),
            reply_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
            ..BootstrapConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unreachable_hub_exhausts_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = Arc::new(MemoryConnector::new());
        let node = MeshNode::new(
            Role::Client,
            NodeConfig::default(),
            connector,
            Arc::new(MemoryStore::new()),
        );
        let (handle, _) = node.spawn();
        let err = bootstrap(&quick(format!("ws://{addr}")), &handle)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::BootstrapExhausted { attempts: 2 }));
    }

    #[tokio::test]
    async fn test_bootstrap_through_websocket_hub() {
        let connector = MemoryConnector::new();
        let hub = MeshNode::hub(
            NodeConfig::default(),
            &HubConfig::default(),
            Arc::new(connector.clone()),
            Arc::new(MemoryStore::new()),
        );
        let hub_id = hub.id();
        let (hub_handle, _) = hub.spawn();
        let server = HubServer::bind(
            &HubConfig {
                listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..HubConfig::default()
            },
            hub_handle.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let client = MeshNode::new(
            Role::Client,
            NodeConfig::default(),
            Arc::new(connector),
            Arc::new(MemoryStore::new()),
        );
        let (client_handle, _) = client.spawn();
        let joined = bootstrap(&quick(format!("ws://{addr}")), &client_handle)
            .await
            .unwrap();
        assert_eq!(joined, hub_id);

        let snap = client_handle.snapshot().await.unwrap();
        assert_eq!(snap.connected, vec![hub_id]);
        assert_eq!(snap.hub_peer, Some(hub_id));
    }

    #[tokio::test]
    async fn test_pump_control_links_in_process() {
        let connector = MemoryConnector::new();
        let hub = MeshNode::new(
            Role::Hub,
            NodeConfig::default(),
            Arc::new(connector.clone()),
            Arc::new(MemoryStore::new()),
        );
        let (hub, _) = hub.spawn();
        let worker = MeshNode::new(
            Role::Worker,
            NodeConfig::default(),
            Arc::new(connector),
            Arc::new(MemoryStore::new()),
        );
        let (worker, _) = worker.spawn();
        let mut events = worker.subscribe();

        let id = PeerId::random();
        let (to_worker, from_hub) = mpsc::unbounded_channel();
        let outcome = hub.register(Some(id), true, to_worker).await.unwrap();
        let (to_hub, from_worker) = mpsc::unbounded_channel();
        worker.dial_hub(id, outcome.hub, to_hub).await.unwrap();
        tokio::spawn(pump_control(worker.clone(), from_worker, from_hub, hub.clone(), id));

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let NodeEvent::BootstrapComplete { hub } = events.recv().await.unwrap() {
                    return hub;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, outcome.hub);
    }
}
