//! `webrtc`-crate backend for [`PeerConnector`] and [`MediaSource`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MeshConfig;
use crate::connection::{
    ConnectionEventKind, ConnectionEvents, LinkState, PeerConnection, PeerConnector,
};
use crate::error::{ConnectionError, MediaError};
use crate::media::{LocalMedia, MediaSource, RemoteMedia, TrackHandle};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

/// Duration of one Opus frame written by [`write_opus_frame`] callers.
pub const OPUS_FRAME: Duration = Duration::from_millis(20);

/// A single Opus frame encoding digital silence.
pub const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

fn build_api(setting: SettingEngine) -> Result<API, ConnectionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnector {
    pub fn new(config: &MeshConfig) -> Result<Self, ConnectionError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        Ok(Self {
            api: build_api(setting)?,
            ice_servers,
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(
        &self,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );
        tracing::trace!(
            target = "mesh",
            peer_id = %events.peer_id(),
            generation = events.generation(),
            "peer connection created"
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(ConnectionEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "mesh",
                            peer_id = %events.peer_id(),
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "mesh",
                    peer_id = %events.peer_id(),
                    generation = events.generation(),
                    state = %state,
                    "peer connection state changed"
                );
                if let Some(state) = link_state(state) {
                    events.emit(ConnectionEventKind::StateChanged(state));
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let media = RemoteMedia {
                        peer_id: events.peer_id().to_string(),
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        track: Some(track as TrackHandle),
                    };
                    events.emit(ConnectionEventKind::RemoteTrack(media));
                })
            },
        ));

        Ok(Arc::new(WebRtcConnection {
            pc,
            media_attached: AtomicBool::new(false),
        }))
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    media_attached: AtomicBool,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, ConnectionError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_setup_error)
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), ConnectionError> {
        if self.media_attached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(track) = media.track::<TrackLocalStaticSample>() else {
            self.media_attached.store(false, Ordering::SeqCst);
            return Err(ConnectionError::Setup(format!(
                "local media {} carries no webrtc audio track",
                media.id()
            )));
        };
        self.pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(to_setup_error)?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|err| ConnectionError::InvalidState(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|err| ConnectionError::InvalidState(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| ConnectionError::Candidate(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "mesh", error = %err, "peer connection close failed");
        }
    }
}

/// Local audio backed by a [`TrackLocalStaticSample`] carrying Opus.
///
/// Capture itself happens outside this crate; callers feed encoded frames
/// through [`write_opus_frame`].
pub struct OpusTrackSource {
    stream_id: String,
    current: parking_lot::Mutex<Option<LocalMedia>>,
}

impl OpusTrackSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            current: parking_lot::Mutex::new(None),
        }
    }

    /// The most recently acquired media, for the task feeding it frames.
    pub fn current(&self) -> Option<LocalMedia> {
        self.current
            .lock()
            .as_ref()
            .filter(|media| !media.is_released())
            .cloned()
    }
}

#[async_trait]
impl MediaSource for OpusTrackSource {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        ));
        let media = LocalMedia::with_track(format!("{}-audio", self.stream_id), track);
        *self.current.lock() = Some(media.clone());
        Ok(media)
    }
}

/// Writes one encoded frame to every connection the media is attached to.
/// Muted or released media drops the frame.
pub async fn write_opus_frame(
    media: &LocalMedia,
    frame: Bytes,
    duration: Duration,
) -> Result<bool, ConnectionError> {
    if !media.is_enabled() {
        return Ok(false);
    }
    let Some(track) = media.track::<TrackLocalStaticSample>() else {
        return Err(ConnectionError::Setup(format!(
            "local media {} carries no webrtc audio track",
            media.id()
        )));
    };
    track
        .write_sample(&Sample {
            data: frame,
            duration,
            ..Default::default()
        })
        .await
        .map_err(to_setup_error)?;
    Ok(true)
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> ConnectionError {
    ConnectionError::Setup(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn localhost_config() -> MeshConfig {
        MeshConfig {
            ice_servers: Vec::new(),
            ..MeshConfig::default()
        }
    }

    #[test]
    fn maps_every_concrete_connection_state() {
        assert_eq!(link_state(RTCPeerConnectionState::Connected), Some(LinkState::Connected));
        assert_eq!(link_state(RTCPeerConnectionState::Failed), Some(LinkState::Failed));
        assert_eq!(link_state(RTCPeerConnectionState::Closed), Some(LinkState::Closed));
        assert_eq!(link_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn offer_carries_an_opus_audio_section() {
        let connector = WebRtcConnector::new(&localhost_config()).expect("api");
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = connector
            .open(ConnectionEvents::new("bob", 1, tx))
            .await
            .expect("open");
        let media = OpusTrackSource::new("alice").acquire().await.expect("media");

        connection.attach_media(&media).await.expect("attach");
        connection.attach_media(&media).await.expect("second attach is a no-op");
        let offer = connection.create_offer().await.expect("offer");

        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.to_lowercase().contains("opus"));
        connection.close().await;
    }

    #[tokio::test]
    async fn media_without_a_webrtc_track_cannot_attach() {
        let connector = WebRtcConnector::new(&localhost_config()).expect("api");
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = connector
            .open(ConnectionEvents::new("bob", 1, tx))
            .await
            .expect("open");

        let err = connection
            .attach_media(&LocalMedia::new("bare"))
            .await
            .expect_err("no track");
        assert!(matches!(err, ConnectionError::Setup(_)));
        connection.close().await;
    }

    #[tokio::test]
    async fn muted_media_drops_frames() {
        let source = OpusTrackSource::new("alice");
        let media = source.acquire().await.expect("media");
        assert!(source.current().is_some_and(|current| current.ptr_eq(&media)));
        media.set_enabled(false);
        let written = write_opus_frame(&media, Bytes::from_static(&OPUS_SILENCE), OPUS_FRAME)
            .await
            .expect("write");
        assert!(!written);

        media.release();
        assert!(source.current().is_none());
    }
}
