//! WebRTC session engine.
//!
//! Sessions are `RTCPeerConnection`s with detached data channels. The engine
//! section of the configuration is forwarded to the setting engine as is.
//! Callbacks only post values onto channels; nothing is awaited inside them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::ice::network_type::NetworkType as IceNetworkType;
use webrtc::ice::udp_mux::UDPMux;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use peerlink_core::config::{CandidateType, DtlsRole, EngineConfig, NetworkType};
use peerlink_core::EngineError;

use super::{ChannelState, DataChannel, Engine, EngineSession, RawStream, SessionState};
use crate::lock;

fn backend(e: impl std::fmt::Display) -> EngineError {
    EngineError::Backend(e.to_string())
}

/// Engine backed by the `webrtc` crate.
#[derive(Clone, Default)]
pub struct WebRtcEngine {
    udp_mux: Option<Arc<dyn UDPMux + Send + Sync>>,
    configuration: Option<RTCConfiguration>,
}

impl WebRtcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve every session's ICE traffic from one shared UDP mux.
    /// Takes precedence over a configured port range.
    pub fn with_udp_mux(mut self, mux: Arc<dyn UDPMux + Send + Sync>) -> Self {
        self.udp_mux = Some(mux);
        self
    }

    /// Base peer connection configuration, e.g. to pin certificates.
    /// Its ICE servers win over the configured URLs when non-empty.
    pub fn with_configuration(mut self, configuration: RTCConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    fn setting_engine(&self, config: &EngineConfig) -> Result<SettingEngine, EngineError> {
        let mut setting = SettingEngine::default();
        setting.detach_data_channels();

        if !config.network_types.is_empty() {
            setting.set_network_types(
                config
                    .network_types
                    .iter()
                    .map(|t| ice_network_type(*t))
                    .collect(),
            );
        }
        if !config.interfaces.is_empty() {
            let allowed = config.interfaces.clone();
            setting.set_interface_filter(Box::new(move |name: &str| {
                allowed.iter().any(|a| a == name)
            }));
        }
        if let Some(nat) = &config.nat_1to1 {
            setting.set_nat_1to1_ips(nat.ips.clone(), ice_candidate_type(nat.candidate_type));
        }
        if let Some(mux) = &self.udp_mux {
            setting.set_udp_network(UDPNetwork::Muxed(mux.clone()));
        } else if let Some(range) = config.port_range {
            let ephemeral = EphemeralUDP::new(range.min, range.max).map_err(backend)?;
            setting.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }
        match config.answering_dtls_role {
            DtlsRole::Auto => {}
            DtlsRole::Client => setting
                .set_answering_dtls_role(DTLSRole::Client)
                .map_err(backend)?,
            DtlsRole::Server => setting
                .set_answering_dtls_role(DTLSRole::Server)
                .map_err(backend)?,
        }
        Ok(setting)
    }

    fn configuration(&self, config: &EngineConfig) -> RTCConfiguration {
        let mut configuration = self.configuration.clone().unwrap_or_default();
        if configuration.ice_servers.is_empty() && !config.ice_servers.is_empty() {
            configuration.ice_servers = vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }];
        }
        configuration
    }
}

fn ice_network_type(t: NetworkType) -> IceNetworkType {
    match t {
        NetworkType::Udp4 => IceNetworkType::Udp4,
        NetworkType::Udp6 => IceNetworkType::Udp6,
        NetworkType::Tcp4 => IceNetworkType::Tcp4,
        NetworkType::Tcp6 => IceNetworkType::Tcp6,
    }
}

fn ice_candidate_type(t: CandidateType) -> RTCIceCandidateType {
    match t {
        CandidateType::Host => RTCIceCandidateType::Host,
        CandidateType::Srflx => RTCIceCandidateType::Srflx,
    }
}

fn session_state(s: RTCPeerConnectionState) -> SessionState {
    match s {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => SessionState::New,
        RTCPeerConnectionState::Connecting => SessionState::Connecting,
        RTCPeerConnectionState::Connected => SessionState::Connected,
        RTCPeerConnectionState::Disconnected => SessionState::Disconnected,
        RTCPeerConnectionState::Failed => SessionState::Failed,
        RTCPeerConnectionState::Closed => SessionState::Closed,
    }
}

#[async_trait]
impl Engine for WebRtcEngine {
    async fn new_session(
        &self,
        config: &EngineConfig,
    ) -> Result<Arc<dyn EngineSession>, EngineError> {
        let api = APIBuilder::new()
            .with_media_engine(MediaEngine::default())
            .with_setting_engine(self.setting_engine(config)?)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(self.configuration(config))
                .await
                .map_err(backend)?,
        );

        let state = Arc::new(watch::channel(SessionState::New).0);
        {
            let state = state.clone();
            pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                state.send_replace(session_state(s));
                Box::pin(async {})
            }));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let _ = inbound_tx.send(RtcChannel::wrap(dc));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcSession {
            pc,
            state,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            gathering: Mutex::new(None),
        }))
    }
}

/// Encoded form of a session description.
#[derive(Serialize, Deserialize)]
struct WireDescription {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    state: Arc<watch::Sender<SessionState>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<RtcChannel>>>,
    gathering: Mutex<Option<mpsc::Receiver<()>>>,
}

impl RtcSession {
    /// Install `description` locally, arming the gathering promise first.
    async fn set_local(&self, description: RTCSessionDescription) -> Result<(), EngineError> {
        let promise = self.pc.gathering_complete_promise().await;
        *lock(&self.gathering) = Some(promise);
        self.pc
            .set_local_description(description)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl EngineSession for RtcSession {
    fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    async fn open_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EngineError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(backend)?;
        Ok(RtcChannel::wrap(dc))
    }

    async fn accept_channel(&self) -> Option<Arc<dyn DataChannel>> {
        let mut inbound = self.inbound.lock().await;
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;
            channel = inbound.recv() => channel.map(|c| c as Arc<dyn DataChannel>),
            _ = async {
                loop {
                    if state.borrow_and_update().is_terminal() {
                        return;
                    }
                    if state.changed().await.is_err() {
                        return;
                    }
                }
            } => None,
        }
    }

    async fn create_offer(&self) -> Result<(), EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        self.set_local(offer).await
    }

    async fn create_answer(&self) -> Result<(), EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        self.set_local(answer).await
    }

    async fn gathering_complete(&self) -> Result<(), EngineError> {
        let promise = lock(&self.gathering).take();
        match promise {
            Some(mut done) => {
                let _ = done.recv().await;
                Ok(())
            }
            None if self.pc.ice_gathering_state() == RTCIceGatheringState::Complete => Ok(()),
            None => Err(EngineError::InvalidState("no local description")),
        }
    }

    async fn local_description(&self) -> Option<Bytes> {
        let description = self.pc.local_description().await?;
        let wire = WireDescription {
            kind: description.sdp_type.to_string(),
            sdp: description.sdp,
        };
        serde_json::to_vec(&wire).ok().map(Bytes::from)
    }

    async fn set_remote_description(&self, description: Bytes) -> Result<(), EngineError> {
        let wire: WireDescription = serde_json::from_slice(&description)
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        let description = match RTCSdpType::from(wire.kind.as_str()) {
            RTCSdpType::Offer => RTCSessionDescription::offer(wire.sdp),
            RTCSdpType::Answer => RTCSessionDescription::answer(wire.sdp),
            RTCSdpType::Pranswer => RTCSessionDescription::pranswer(wire.sdp),
            _ => return Err(EngineError::Decode(format!("unsupported type {:?}", wire.kind))),
        }
        .map_err(|e| EngineError::Decode(e.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(backend)
    }

    async fn selected_path(&self) -> Option<(SocketAddr, SocketAddr)> {
        // The selected candidate pair does not expose its addresses.
        None
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(error = %e, "peer connection close failed");
        }
        self.state.send_replace(SessionState::Closed);
    }
}

struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    state: Arc<watch::Sender<ChannelState>>,
}

impl RtcChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let state = Arc::new(watch::channel(ChannelState::Connecting).0);
        {
            let state = state.clone();
            dc.on_open(Box::new(move || {
                state.send_if_modified(|s| {
                    if *s != ChannelState::Connecting {
                        return false;
                    }
                    *s = ChannelState::Open;
                    true
                });
                Box::pin(async {})
            }));
        }
        {
            let state = state.clone();
            dc.on_close(Box::new(move || {
                state.send_replace(ChannelState::Closed);
                Box::pin(async {})
            }));
        }
        match dc.ready_state() {
            RTCDataChannelState::Open => {
                state.send_if_modified(|s| {
                    if *s != ChannelState::Connecting {
                        return false;
                    }
                    *s = ChannelState::Open;
                    true
                });
            }
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
                state.send_replace(ChannelState::Closed);
            }
            _ => {}
        }
        Arc::new(Self { dc, state })
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn id(&self) -> u16 {
        self.dc.id()
    }

    fn state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    async fn detach(&self) -> Result<Arc<dyn RawStream>, EngineError> {
        let raw = self.dc.detach().await.map_err(backend)?;
        Ok(Arc::new(RtcStream {
            raw,
            state: self.state.clone(),
        }))
    }
}

struct RtcStream {
    raw: Arc<webrtc::data::data_channel::DataChannel>,
    state: Arc<watch::Sender<ChannelState>>,
}

#[async_trait]
impl RawStream for RtcStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError> {
        self.raw.read(buf).await.map_err(backend)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, EngineError> {
        if *self.state.borrow() == ChannelState::Closed {
            return Err(EngineError::ChannelClosed);
        }
        self.raw
            .write(&Bytes::copy_from_slice(buf))
            .await
            .map_err(backend)
    }

    async fn close(&self) -> Result<(), EngineError> {
        let out = self.raw.close().await.map_err(backend);
        self.state.send_replace(ChannelState::Closed);
        out
    }
}
