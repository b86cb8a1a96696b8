use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use livekit::participant::ConnectionQuality as LkConnectionQuality;
use livekit::prelude::{RemoteParticipant, Room, RoomEvent, RoomOptions};
use livekit::track::{TrackKind as LkTrackKind, TrackSource as LkTrackSource};
use tokio::sync::{Mutex, mpsc};

use crate::config::SessionConfig;
use crate::health::ConnectionQualitySample;
use crate::roster::{AttendeePresence, AttendeeUpdate, RosterDelta};
use crate::transport::{OpenedSession, RawError, Transport, TransportEvent};

/// [`Transport`] backed by a LiveKit room.
///
/// LiveKit reports quality as four coarse levels; they are mapped onto
/// synthetic samples so the health monitor applies the same thresholds to
/// every transport.
pub struct LiveKitTransport {
    url: String,
    token: String,
    rooms: Mutex<HashMap<String, LiveRoom>>,
}

struct LiveRoom {
    room: Arc<Room>,
    /// Maintained by the event pump from the room's reconnect events.
    connected: Arc<AtomicBool>,
}

impl LiveKitTransport {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    fn presence(p: &RemoteParticipant) -> AttendeePresence {
        let is_muted = p
            .track_publications()
            .values()
            .any(|pub_| pub_.kind() == LkTrackKind::Audio && pub_.is_muted());
        let name = p.name().to_string();
        let identity = p.identity().to_string();
        AttendeePresence {
            display_name: if name.is_empty() { identity.clone() } else { name },
            attendee_id: identity,
            audio_enabled: !is_muted,
            // Video is reported once the track is actually subscribed.
            video_enabled: false,
        }
    }

    fn quality_sample(quality: LkConnectionQuality) -> ConnectionQualitySample {
        match quality {
            LkConnectionQuality::Excellent => ConnectionQualitySample::new(0.0, 1.0, 2_000),
            LkConnectionQuality::Good => ConnectionQualitySample::new(0.01, 0.8, 1_000),
            LkConnectionQuality::Poor => ConnectionQualitySample::new(0.1, 0.4, 300),
            LkConnectionQuality::Lost => ConnectionQualitySample::new(1.0, 0.0, 0),
        }
    }

    fn update(identity: String, f: impl FnOnce(&mut AttendeeUpdate)) -> TransportEvent {
        let mut update = AttendeeUpdate {
            attendee_id: identity,
            ..Default::default()
        };
        f(&mut update);
        TransportEvent::RosterDelta(RosterDelta {
            updated: vec![update],
            ..Default::default()
        })
    }

    fn translate(event: RoomEvent, local_identity: &str) -> Option<TransportEvent> {
        match event {
            RoomEvent::ParticipantConnected(participant) => Some(TransportEvent::RosterDelta(RosterDelta {
                added: vec![Self::presence(&participant)],
                ..Default::default()
            })),
            RoomEvent::ParticipantDisconnected(participant) => Some(TransportEvent::RosterDelta(RosterDelta {
                removed: vec![participant.identity().to_string()],
                ..Default::default()
            })),
            RoomEvent::TrackSubscribed { publication, participant, .. }
                if publication.kind() == LkTrackKind::Video =>
            {
                Some(Self::update(participant.identity().to_string(), |u| {
                    u.video_enabled = Some(true)
                }))
            }
            RoomEvent::TrackUnsubscribed { publication, participant, .. }
                if publication.kind() == LkTrackKind::Video =>
            {
                Some(Self::update(participant.identity().to_string(), |u| {
                    u.video_enabled = Some(false)
                }))
            }
            RoomEvent::TrackMuted { participant, publication }
                if publication.source() == LkTrackSource::Microphone =>
            {
                Some(Self::update(participant.identity().to_string(), |u| {
                    u.audio_enabled = Some(false)
                }))
            }
            RoomEvent::TrackUnmuted { participant, publication }
                if publication.source() == LkTrackSource::Microphone =>
            {
                Some(Self::update(participant.identity().to_string(), |u| {
                    u.audio_enabled = Some(true)
                }))
            }
            RoomEvent::ActiveSpeakersChanged { speakers } => Some(TransportEvent::ActiveSpeaker(
                speakers.first().map(|p| p.identity().to_string()),
            )),
            RoomEvent::ConnectionQualityChanged { quality, participant } => {
                if participant.identity().to_string() == local_identity {
                    Some(TransportEvent::QualitySample(Self::quality_sample(quality)))
                } else {
                    None
                }
            }
            RoomEvent::Disconnected { reason } => Some(TransportEvent::Error(
                RawError::new(format!("room disconnected: {reason:?}")).with_code("ConnectionLost"),
            )),
            other => {
                tracing::debug!("unhandled room event: {other:?}");
                None
            }
        }
    }
}

impl Transport for LiveKitTransport {
    async fn open_session(&self, config: &SessionConfig) -> Result<OpenedSession, RawError> {
        let mut options = RoomOptions::default();
        options.auto_subscribe = true;

        let (room, mut room_events) = Room::connect(&self.url, &self.token, options)
            .await
            .map_err(|e| RawError::new(e.to_string()).with_code("SignalingInternalServerError"))?;
        let room = Arc::new(room);

        let session_id = uuid::Uuid::new_v4().to_string();
        let local_identity = room.local_participant().identity().to_string();
        tracing::info!(meeting = %config.meeting, "connected to livekit room {session_id}");

        let (tx, rx) = mpsc::unbounded_channel();

        // Seed the roster with participants already in the room.
        let existing: Vec<AttendeePresence> = room
            .remote_participants()
            .values()
            .map(Self::presence)
            .collect();
        if !existing.is_empty() {
            let _ = tx.send(TransportEvent::RosterDelta(RosterDelta {
                added: existing,
                ..Default::default()
            }));
        }

        let connected = Arc::new(AtomicBool::new(true));
        self.rooms.lock().await.insert(
            session_id.clone(),
            LiveRoom {
                room,
                connected: connected.clone(),
            },
        );

        let identity = local_identity.clone();
        tokio::spawn(async move {
            while let Some(event) = room_events.recv().await {
                match &event {
                    RoomEvent::Reconnecting => {
                        tracing::info!("livekit signaling reconnecting");
                        connected.store(false, Ordering::SeqCst);
                    }
                    RoomEvent::Reconnected => {
                        tracing::info!("livekit signaling reconnected");
                        connected.store(true, Ordering::SeqCst);
                    }
                    RoomEvent::Disconnected { .. } => connected.store(false, Ordering::SeqCst),
                    _ => {}
                }
                let Some(translated) = Self::translate(event, &identity) else {
                    continue;
                };
                if tx.send(translated).is_err() {
                    break;
                }
            }
            tracing::info!("livekit event pump ended");
        });

        Ok(OpenedSession {
            session_id,
            local_attendee_id: local_identity,
            events: rx,
        })
    }

    async fn close_session(&self, session_id: &str) -> Result<(), RawError> {
        let live = self.rooms.lock().await.remove(session_id);
        match live {
            Some(live) => live.room.close().await.map_err(|e| RawError::new(e.to_string())),
            None => Ok(()),
        }
    }

    async fn reconnect(&self, session_id: &str) -> Result<(), RawError> {
        let rooms = self.rooms.lock().await;
        let Some(live) = rooms.get(session_id) else {
            return Err(RawError::new(format!("unknown session {session_id}")).with_code("ConnectionLost"));
        };
        // The SDK resumes the signaling connection on its own; a cycle
        // succeeds once the room reports itself reconnected.
        if live.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RawError::new("room is still reconnecting").with_code("ConnectionHealthReconnect"))
        }
    }
}
