//! In-process direct transport
//!
//! Pairs transports through the endpoint id they embed in their session
//! descriptions. A pair reports `connected` and delivers each side's tracks
//! to the other once both descriptions are installed and at least one remote
//! candidate has been added. Tests inject arbitrary transport events with
//! [`LoopbackNetwork::emit`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    IceConnectionState, OfferOptions, PeerConnectionState, PeerError, PeerEvent, PeerTransport,
    PeerTransportFactory, SignalingState,
};
use crate::config::IceServer;
use crate::media::{MediaTrack, TrackKind};
use crate::models::{IceCandidate, SdpType, SessionDescription};

const ENDPOINT_ATTR: &str = "a=x-loopback-endpoint:";

struct EndpointState {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<MediaTrack>,
    remote_candidates: usize,
    gathered: bool,
    connection: PeerConnectionState,
}

struct Endpoint {
    id: String,
    state: Mutex<EndpointState>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl Endpoint {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<String, Arc<Endpoint>>,
    latest_by_owner: HashMap<String, String>,
    created_by_owner: HashMap<String, usize>,
    next_id: u64,
    hold_connections: bool,
}

/// Factory and switchboard for loopback transports
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// While held, pairs never report `connected` on their own.
    pub fn hold_connections(&self, hold: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.hold_connections = hold;
        }
    }

    fn latest(&self, owner: &str) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().ok()?;
        let id = inner.latest_by_owner.get(owner)?;
        inner.endpoints.get(id).cloned()
    }

    /// Raise `event` on the most recent transport created for `owner`.
    pub fn emit(&self, owner: &str, event: PeerEvent) -> bool {
        let Some(endpoint) = self.latest(owner) else {
            return false;
        };
        if let PeerEvent::ConnectionState(state) = &event {
            if let Ok(mut s) = endpoint.state.lock() {
                s.connection = *state;
            }
        }
        endpoint.events.send(event).is_ok()
    }

    /// How many transports `owner` has created.
    pub fn transports_created(&self, owner: &str) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|i| i.created_by_owner.get(owner).copied())
            .unwrap_or(0)
    }

    /// Whether the latest transport of `owner` has been closed.
    pub fn is_closed(&self, owner: &str) -> bool {
        self.latest(owner)
            .and_then(|e| e.state.lock().ok().map(|s| s.signaling == SignalingState::Closed))
            .unwrap_or(false)
    }

    fn endpoint(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.inner.lock().ok()?.endpoints.get(id).cloned()
    }

    fn holding(&self) -> bool {
        self.inner.lock().map(|i| i.hold_connections).unwrap_or(false)
    }
}

impl PeerTransportFactory for LoopbackNetwork {
    fn create(
        &self,
        owner: &str,
        ice_servers: &[IceServer],
    ) -> Result<(Box<dyn PeerTransport>, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PeerError::InvalidState("network poisoned".to_string()))?;

        inner.next_id += 1;
        let id = format!("{}-{}", owner, inner.next_id);
        let endpoint = Arc::new(Endpoint {
            id: id.clone(),
            state: Mutex::new(EndpointState {
                signaling: SignalingState::Stable,
                local: None,
                remote: None,
                tracks: Vec::new(),
                remote_candidates: 0,
                gathered: false,
                connection: PeerConnectionState::New,
            }),
            events: tx,
        });
        inner.endpoints.insert(id.clone(), endpoint.clone());
        inner.latest_by_owner.insert(owner.to_string(), id.clone());
        *inner.created_by_owner.entry(owner.to_string()).or_insert(0) += 1;

        tracing::debug!(
            "Loopback transport {} created ({} ICE servers)",
            id,
            ice_servers.len()
        );

        let transport = LoopbackTransport {
            endpoint,
            network: self.clone(),
        };
        Ok((Box::new(transport), rx))
    }
}

struct LoopbackTransport {
    endpoint: Arc<Endpoint>,
    network: LoopbackNetwork,
}

fn media_lines(audio: bool, video: bool) -> String {
    let mut lines = String::new();
    if audio {
        lines.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n");
    }
    if video {
        lines.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\n");
    }
    lines
}

fn build_sdp(endpoint_id: &str, media: &str) -> String {
    format!(
        "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{}{}\r\n{}",
        rand::random::<u32>(),
        ENDPOINT_ATTR,
        endpoint_id,
        media
    )
}

fn endpoint_of(description: &SessionDescription) -> Option<&str> {
    description
        .sdp
        .lines()
        .find_map(|line| line.strip_prefix(ENDPOINT_ATTR))
        .map(str::trim)
}

impl LoopbackTransport {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, EndpointState>, PeerError> {
        self.endpoint
            .state
            .lock()
            .map_err(|_| PeerError::InvalidState("transport poisoned".to_string()))
    }

    fn gather_candidates(&self) {
        let first = {
            let Ok(mut state) = self.lock() else {
                return;
            };
            !std::mem::replace(&mut state.gathered, true)
        };
        if !first {
            return;
        }
        let port = 40000 + (rand::random::<u16>() % 20000);
        for (n, kind) in ["host", "srflx"].iter().enumerate() {
            self.endpoint.emit(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp {} 127.0.0.1 {} typ {}",
                    n + 1,
                    2122260223 - n as u32,
                    port + n as u16,
                    kind
                ),
                sdp_mline_index: Some(0),
                sdp_mid: Some("0".to_string()),
            }));
        }
    }

    fn try_connect(&self) {
        if self.network.holding() {
            return;
        }
        let peer_id = {
            let Ok(mut state) = self.lock() else {
                return;
            };
            let ready = state.signaling == SignalingState::Stable
                && state.local.is_some()
                && state.remote_candidates > 0
                && state.connection == PeerConnectionState::New;
            let peer_id = state
                .remote
                .as_ref()
                .and_then(endpoint_of)
                .map(str::to_string);
            if !ready || peer_id.is_none() {
                return;
            }
            state.connection = PeerConnectionState::Connected;
            peer_id
        };

        self.endpoint
            .emit(PeerEvent::ConnectionState(PeerConnectionState::Connecting));
        self.endpoint
            .emit(PeerEvent::IceConnectionState(IceConnectionState::Checking));
        self.endpoint
            .emit(PeerEvent::IceConnectionState(IceConnectionState::Connected));
        self.endpoint
            .emit(PeerEvent::ConnectionState(PeerConnectionState::Connected));

        let remote_tracks = peer_id
            .and_then(|id| self.network.endpoint(&id))
            .and_then(|peer| peer.state.lock().ok().map(|s| s.tracks.clone()))
            .unwrap_or_default();
        for track in remote_tracks {
            let received = MediaTrack::with_id(track.id(), track.kind(), track.label());
            self.endpoint.emit(PeerEvent::Track(received));
        }
        tracing::debug!("Loopback transport {} connected", self.endpoint.id);
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError> {
        let state = self.lock()?;
        if state.signaling != SignalingState::Stable {
            return Err(PeerError::InvalidState(format!(
                "cannot create offer in {:?}",
                state.signaling
            )));
        }
        let has_audio = state.tracks.iter().any(|t| t.kind() == TrackKind::Audio);
        let has_video = state.tracks.iter().any(|t| t.kind() == TrackKind::Video);
        let media = media_lines(
            options.receive_audio || has_audio,
            options.receive_video || has_video,
        );
        Ok(SessionDescription::offer(build_sdp(&self.endpoint.id, &media)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.lock()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(PeerError::InvalidState(format!(
                "cannot create answer in {:?}",
                state.signaling
            )));
        }
        let offer = state.remote.as_ref().map(|d| d.sdp.as_str()).unwrap_or("");
        let media = media_lines(offer.contains("m=audio"), offer.contains("m=video"));
        Ok(SessionDescription::answer(build_sdp(&self.endpoint.id, &media)))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), PeerError> {
        {
            let mut state = self.lock()?;
            state.signaling = match (state.signaling, description.kind) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
                (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
                (current, kind) => {
                    return Err(PeerError::InvalidState(format!(
                        "cannot set local {:?} in {:?}",
                        kind, current
                    )))
                }
            };
            state.local = Some(description.clone());
        }
        self.gather_candidates();
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), PeerError> {
        if endpoint_of(description).is_none() {
            return Err(PeerError::Malformed("description without endpoint".to_string()));
        }
        {
            let mut state = self.lock()?;
            state.signaling = match (state.signaling, description.kind) {
                (SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
                (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
                (current, kind) => {
                    return Err(PeerError::InvalidState(format!(
                        "cannot set remote {:?} in {:?}",
                        kind, current
                    )))
                }
            };
            state.remote = Some(description.clone());
        }
        self.try_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        {
            let mut state = self.lock()?;
            if state.signaling == SignalingState::Closed {
                return Err(PeerError::Closed);
            }
            if state.remote.is_none() {
                return Err(PeerError::NoRemoteDescription);
            }
            if !candidate.candidate.starts_with("candidate:") {
                return Err(PeerError::Malformed(candidate.candidate.clone()));
            }
            state.remote_candidates += 1;
        }
        self.try_connect();
        Ok(())
    }

    fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.lock()?;
        if state.signaling == SignalingState::Closed {
            return Err(PeerError::Closed);
        }
        state.tracks.push(track.clone());
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.lock()
            .map(|s| s.signaling)
            .unwrap_or(SignalingState::Closed)
    }

    fn close(&self) {
        if let Ok(mut state) = self.lock() {
            state.signaling = SignalingState::Closed;
            state.connection = PeerConnectionState::Closed;
        }
    }
}
