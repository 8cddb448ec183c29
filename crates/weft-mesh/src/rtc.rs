//! WebRTC data-channel links.
//!
//! One peer connection and one data channel per remote peer. Candidates are
//! trickled through the node as they are gathered; the node's negotiation
//! keeps them behind the local description.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use weft_core::{IceCandidate, SignalData};

use crate::error::{MeshError, Result};
use crate::link::{Connector, LinkCommand, LinkEvent, LinkQueues, LinkRequest, LinkSink, PeerLink};

/// Label of the single data channel each link opens
pub const CHANNEL_LABEL: &str = "weft";

/// Public STUN server used when none is configured
pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

impl From<webrtc::Error> for MeshError {
    fn from(err: webrtc::Error) -> Self {
        MeshError::Link(Cow::Owned(err.to_string()))
    }
}

/// Connector for WebRTC data channels
#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<String>,
}

impl Default for RtcConnector {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN.to_string()])
    }
}

impl RtcConnector {
    /// Create a connector using these STUN/TURN URLs
    #[must_use]
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

impl Connector for RtcConnector {
    fn open(&self, request: LinkRequest) -> Result<PeerLink> {
        let (link, queues) = PeerLink::channel(request.data_capacity);
        let ice_servers = self.ice_servers.clone();
        tokio::spawn(async move {
            let sink = request.sink.clone();
            let peer = sink.peer();
            if let Err(e) = run_link(request, ice_servers, queues).await {
                warn!(peer = %peer.short(), error = %e, "webrtc link failed");
            }
            sink.emit(LinkEvent::Closed);
        });
        Ok(link)
    }
}

enum Internal {
    Ready(Arc<RTCDataChannel>),
    Down,
}

async fn peer_connection(ice_servers: Vec<String>) -> Result<Arc<RTCPeerConnection>> {
    let mut media = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();
    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers,
                ..Default::default()
            }],
            ..Default::default()
        })
        .await?;
    Ok(Arc::new(pc))
}

fn attach(dc: &Arc<RTCDataChannel>, sink: LinkSink, internal: mpsc::UnboundedSender<Internal>) {
    let ready = Arc::clone(dc);
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = internal.send(Internal::Ready(ready));
        })
    }));
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(LinkEvent::Message(msg.data));
        })
    }));
}

async fn run_link(
    request: LinkRequest,
    ice_servers: Vec<String>,
    mut queues: LinkQueues,
) -> Result<()> {
    let LinkRequest {
        initiator, sink, ..
    } = request;
    let pc = peer_connection(ice_servers).await?;
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();

    let candidates = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    sink.emit(LinkEvent::Signal(SignalData::Candidate {
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        },
                    }));
                }
                Err(e) => warn!(error = %e, "candidate serialization failed"),
            }
        })
    }));

    let down = internal_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let down = down.clone();
        Box::pin(async move {
            debug!(?state, "peer connection state");
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed
            ) {
                let _ = down.send(Internal::Down);
            }
        })
    }));

    if initiator {
        let dc = pc.create_data_channel(CHANNEL_LABEL, None).await?;
        attach(&dc, sink.clone(), internal_tx.clone());
        let offer = pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer).await?;
        sink.emit(LinkEvent::Signal(SignalData::Offer { sdp }));
    } else {
        let channels = sink.clone();
        let ready = internal_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = channels.clone();
            let ready = ready.clone();
            Box::pin(async move {
                attach(&dc, sink, ready);
            })
        }));
    }

    let mut channel: Option<Arc<RTCDataChannel>> = None;
    let mut backlog: Vec<Bytes> = Vec::new();

    loop {
        tokio::select! {
            biased;
            internal = internal_rx.recv() => match internal {
                Some(Internal::Ready(dc)) => {
                    sink.emit(LinkEvent::Open);
                    for msg in backlog.drain(..) {
                        dc.send(&msg).await?;
                    }
                    channel = Some(dc);
                }
                Some(Internal::Down) | None => break,
            },
            cmd = queues.control.recv() => match cmd {
                None | Some(LinkCommand::Close) => break,
                Some(LinkCommand::Remote(signal)) => apply_remote(&pc, &sink, initiator, signal).await?,
                Some(LinkCommand::Send(msg)) => match &channel {
                    Some(dc) => {
                        dc.send(&msg).await?;
                    }
                    None => backlog.push(msg),
                },
            },
            frame = queues.data.recv(), if channel.is_some() => match (frame, &channel) {
                (Some(frame), Some(dc)) => {
                    dc.send(&frame).await?;
                }
                _ => break,
            },
        }
    }

    if let Some(dc) = channel {
        let _ = dc.close().await;
    }
    pc.close().await?;
    Ok(())
}

async fn apply_remote(
    pc: &Arc<RTCPeerConnection>,
    sink: &LinkSink,
    initiator: bool,
    signal: SignalData,
) -> Result<()> {
    match signal {
        SignalData::Offer { sdp } if !initiator => {
            pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
                .await?;
            let answer = pc.create_answer(None).await?;
            let sdp = answer.sdp.clone();
            pc.set_local_description(answer).await?;
            sink.emit(LinkEvent::Signal(SignalData::Answer { sdp }));
        }
        SignalData::Answer { sdp } if initiator => {
            pc.set_remote_description(RTCSessionDescription::answer(sdp)?)
                .await?;
        }
        SignalData::Candidate { candidate } => {
            pc.add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        }
        other => warn!(?other, "signal does not match link role"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ice_servers() {
        let connector = RtcConnector::default();
        assert_eq!(connector.ice_servers, vec![DEFAULT_STUN.to_string()]);
    }
}
