use std::fmt;

/// Identifies a video rendering surface. Never reused within a roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(pub u32);

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attendee {
    pub attendee_id: String,
    pub display_name: String,
    pub audio_enabled: bool,
    pub video_tile_id: Option<TileId>,
    pub is_active_speaker: bool,
    pub is_local: bool,
}

/// Full description of an attendee as announced by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendeePresence {
    pub attendee_id: String,
    pub display_name: String,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl AttendeePresence {
    fn merge(&mut self, update: &AttendeeUpdate) {
        if let Some(name) = &update.display_name {
            self.display_name = name.clone();
        }
        if let Some(audio) = update.audio_enabled {
            self.audio_enabled = audio;
        }
        if let Some(video) = update.video_enabled {
            self.video_enabled = video;
        }
    }
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttendeeUpdate {
    pub attendee_id: String,
    pub display_name: Option<String>,
    pub audio_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDelta {
    pub added: Vec<AttendeePresence>,
    pub updated: Vec<AttendeeUpdate>,
    pub removed: Vec<String>,
}

/// One effective change produced by [`ParticipantRoster`], in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Joined(String),
    Updated(String),
    Left(String),
    TileBound { attendee_id: String, tile_id: TileId },
    TileReleased { attendee_id: String, tile_id: TileId },
    ActiveSpeakerChanged(Option<String>),
}

/// Maintains the attendees of a session and their video tiles.
///
/// Mutated only through deltas forwarded by the session controller.
/// Attendees are kept in join order.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRoster {
    attendees: Vec<Attendee>,
    next_tile: u32,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the local participant, optionally with a camera tile.
    pub fn set_local(
        &mut self,
        attendee_id: &str,
        display_name: &str,
        video_enabled: bool,
    ) -> Vec<RosterChange> {
        let presence = AttendeePresence {
            attendee_id: attendee_id.to_string(),
            display_name: display_name.to_string(),
            audio_enabled: true,
            video_enabled,
        };
        let mut changes = Vec::new();
        self.add(presence, &mut changes);
        if let Some(local) = self.attendee_mut(attendee_id) {
            local.is_local = true;
        }
        changes
    }

    /// Apply a roster delta. Applying the same delta twice is a no-op the
    /// second time: re-adds become updates, unknown updates and removals are
    /// ignored.
    ///
    /// Updates naming an attendee that the same delta adds are folded into
    /// the added presence, so the attendee is applied once in its final shape.
    pub fn apply_delta(&mut self, delta: &RosterDelta) -> Vec<RosterChange> {
        let mut changes = Vec::new();
        for presence in &delta.added {
            let mut merged = presence.clone();
            for update in delta.updated.iter().filter(|u| u.attendee_id == presence.attendee_id) {
                merged.merge(update);
            }
            self.add(merged, &mut changes);
        }
        for update in &delta.updated {
            if delta.added.iter().any(|p| p.attendee_id == update.attendee_id) {
                continue;
            }
            self.update(update, &mut changes);
        }
        for attendee_id in &delta.removed {
            self.remove(attendee_id, &mut changes);
        }
        changes
    }

    /// Mark `attendee_id` as the sole active speaker, or clear with `None`.
    pub fn set_active_speaker(&mut self, attendee_id: Option<&str>) -> Vec<RosterChange> {
        if let Some(id) = attendee_id {
            if self.attendee(id).is_none() {
                tracing::debug!("ignoring active speaker for unknown attendee {id}");
                return Vec::new();
            }
        }
        if self.active_speaker() == attendee_id {
            return Vec::new();
        }
        for a in &mut self.attendees {
            a.is_active_speaker = Some(a.attendee_id.as_str()) == attendee_id;
        }
        vec![RosterChange::ActiveSpeakerChanged(attendee_id.map(str::to_string))]
    }

    pub fn active_speaker(&self) -> Option<&str> {
        self.attendees
            .iter()
            .find(|a| a.is_active_speaker)
            .map(|a| a.attendee_id.as_str())
    }

    /// Attendees in join order.
    pub fn snapshot(&self) -> Vec<Attendee> {
        self.attendees.clone()
    }

    pub fn attendee(&self, attendee_id: &str) -> Option<&Attendee> {
        self.attendees.iter().find(|a| a.attendee_id == attendee_id)
    }

    pub fn len(&self) -> usize {
        self.attendees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attendees.is_empty()
    }

    /// Release every tile and drop every attendee.
    pub fn clear(&mut self) -> Vec<RosterChange> {
        let ids: Vec<String> = self.attendees.iter().map(|a| a.attendee_id.clone()).collect();
        let mut changes = Vec::new();
        for id in ids {
            self.remove(&id, &mut changes);
        }
        changes
    }

    fn attendee_mut(&mut self, attendee_id: &str) -> Option<&mut Attendee> {
        self.attendees.iter_mut().find(|a| a.attendee_id == attendee_id)
    }

    fn add(&mut self, presence: AttendeePresence, changes: &mut Vec<RosterChange>) {
        if self.attendee(&presence.attendee_id).is_some() {
            let update = AttendeeUpdate {
                attendee_id: presence.attendee_id,
                display_name: Some(presence.display_name),
                audio_enabled: Some(presence.audio_enabled),
                video_enabled: Some(presence.video_enabled),
            };
            self.update(&update, changes);
            return;
        }

        let attendee_id = presence.attendee_id.clone();
        self.attendees.push(Attendee {
            attendee_id: presence.attendee_id,
            display_name: presence.display_name,
            audio_enabled: presence.audio_enabled,
            video_tile_id: None,
            is_active_speaker: false,
            is_local: false,
        });
        changes.push(RosterChange::Joined(attendee_id.clone()));
        if presence.video_enabled {
            self.bind_tile(&attendee_id, changes);
        }
    }

    fn update(&mut self, update: &AttendeeUpdate, changes: &mut Vec<RosterChange>) {
        let Some(attendee) = self.attendee_mut(&update.attendee_id) else {
            tracing::debug!("ignoring update for unknown attendee {}", update.attendee_id);
            return;
        };

        let mut changed = false;
        if let Some(name) = &update.display_name {
            if attendee.display_name != *name {
                attendee.display_name = name.clone();
                changed = true;
            }
        }
        if let Some(audio) = update.audio_enabled {
            if attendee.audio_enabled != audio {
                attendee.audio_enabled = audio;
                changed = true;
            }
        }
        let has_tile = attendee.video_tile_id.is_some();
        if changed {
            changes.push(RosterChange::Updated(update.attendee_id.clone()));
        }

        match update.video_enabled {
            Some(true) if !has_tile => self.bind_tile(&update.attendee_id, changes),
            Some(false) if has_tile => self.release_tile(&update.attendee_id, changes),
            _ => {}
        }
    }

    fn remove(&mut self, attendee_id: &str, changes: &mut Vec<RosterChange>) {
        if self.attendee(attendee_id).is_none() {
            return;
        }
        // The tile must be gone before the attendee disappears.
        self.release_tile(attendee_id, changes);
        let was_speaking = self.active_speaker() == Some(attendee_id);
        self.attendees.retain(|a| a.attendee_id != attendee_id);
        changes.push(RosterChange::Left(attendee_id.to_string()));
        if was_speaking {
            changes.push(RosterChange::ActiveSpeakerChanged(None));
        }
    }

    fn bind_tile(&mut self, attendee_id: &str, changes: &mut Vec<RosterChange>) {
        self.next_tile += 1;
        let tile_id = TileId(self.next_tile);
        if let Some(attendee) = self.attendee_mut(attendee_id) {
            attendee.video_tile_id = Some(tile_id);
            changes.push(RosterChange::TileBound {
                attendee_id: attendee_id.to_string(),
                tile_id,
            });
        }
    }

    fn release_tile(&mut self, attendee_id: &str, changes: &mut Vec<RosterChange>) {
        let Some(attendee) = self.attendee_mut(attendee_id) else {
            return;
        };
        if let Some(tile_id) = attendee.video_tile_id.take() {
            changes.push(RosterChange::TileReleased {
                attendee_id: attendee_id.to_string(),
                tile_id,
            });
        }
    }
}
