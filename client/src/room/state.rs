//! Room session state.
//!
//! Transports, producers, consumers and the roster live in one struct owned
//! by the manager. The roster only changes through [`RosterCommand`]s.

use std::collections::HashMap;
use std::sync::Arc;

use rtc_common::{MediaKind, ParticipantRole};
use tracing::debug;

use super::transport::{Consumer, Producer, RecvTransport, SendTransport};
use crate::media::MediaStream;

/// Room lifecycle. Moves forward only; `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoomState {
    Connecting,
    Joined,
    Active,
    Terminated,
}

/// Snapshot of the room this session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub role: ParticipantRole,
    pub state: RoomState,
}

/// A remote participant.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: String,
    pub role: ParticipantRole,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub stream: Option<MediaStream>,
}

impl Participant {
    fn new(user_id: String, stream: Option<MediaStream>) -> Self {
        Self {
            user_id,
            role: ParticipantRole::Guest,
            is_muted: false,
            is_video_off: false,
            stream,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RosterCommand {
    /// Add the participant, or replace its stream if already present.
    Upsert { user_id: String, stream: MediaStream },
    SetMuted { user_id: String, muted: bool },
    SetVideoOff { user_id: String, video_off: bool },
    Remove { user_id: String },
    Clear,
}

/// Effect of one [`RosterCommand`].
#[derive(Debug, Clone)]
pub enum RosterChange {
    /// First sight of a participant.
    Joined(Participant),
    Updated(Participant),
    Left(String),
    Cleared(usize),
    /// The command referred to an unknown participant.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn apply(&mut self, command: RosterCommand) -> RosterChange {
        match command {
            RosterCommand::Upsert { user_id, stream } => {
                if let Some(existing) = self.find_mut(&user_id) {
                    existing.stream = Some(stream);
                    return RosterChange::Updated(existing.clone());
                }
                let participant = Participant::new(user_id, Some(stream));
                self.participants.push(participant.clone());
                RosterChange::Joined(participant)
            }
            RosterCommand::SetMuted { user_id, muted } => match self.find_mut(&user_id) {
                Some(p) => {
                    p.is_muted = muted;
                    RosterChange::Updated(p.clone())
                }
                None => RosterChange::Unchanged,
            },
            RosterCommand::SetVideoOff { user_id, video_off } => {
                match self.find_mut(&user_id) {
                    Some(p) => {
                        p.is_video_off = video_off;
                        RosterChange::Updated(p.clone())
                    }
                    None => RosterChange::Unchanged,
                }
            }
            RosterCommand::Remove { user_id } => {
                let before = self.participants.len();
                self.participants.retain(|p| p.user_id != user_id);
                if self.participants.len() == before {
                    RosterChange::Unchanged
                } else {
                    RosterChange::Left(user_id)
                }
            }
            RosterCommand::Clear => {
                let count = self.participants.len();
                self.participants.clear();
                RosterChange::Cleared(count)
            }
        }
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn find_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }
}

/// Everything released by one teardown.
#[derive(Default)]
pub(crate) struct Released {
    pub producers: Vec<Arc<dyn Producer>>,
    pub consumers: Vec<Arc<dyn Consumer>>,
    pub send_transport: Option<Arc<dyn SendTransport>>,
    pub recv_transport: Option<Arc<dyn RecvTransport>>,
    pub local_stream: Option<MediaStream>,
    /// Whether the server knows about us and needs a leave.
    pub was_joined: bool,
}

pub(crate) struct RoomSession {
    pub room: Room,
    pub connect_started: bool,
    /// Set once create/join succeeded; the server holds a membership until leave.
    pub server_joined: bool,
    pub send_transport: Option<Arc<dyn SendTransport>>,
    pub recv_transport: Option<Arc<dyn RecvTransport>>,
    pub producers: HashMap<MediaKind, Arc<dyn Producer>>,
    pub consumers: HashMap<String, Arc<dyn Consumer>>,
    pub local_stream: Option<MediaStream>,
    pub roster: Roster,
}

impl RoomSession {
    pub fn new(room_id: String, role: ParticipantRole) -> Self {
        Self {
            room: Room {
                id: room_id,
                role,
                state: RoomState::Connecting,
            },
            connect_started: false,
            server_joined: false,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            local_stream: None,
            roster: Roster::default(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.room.state == RoomState::Terminated
    }

    /// Move forward to `next`; a no-op for earlier states.
    pub fn advance(&mut self, next: RoomState) {
        if next > self.room.state {
            debug!(from = ?self.room.state, to = ?next, "Room state change");
            self.room.state = next;
        }
    }

    /// Mark terminated and hand back every resource for closing.
    pub fn terminate(&mut self) -> Released {
        let was_joined = std::mem::take(&mut self.server_joined);
        self.advance(RoomState::Terminated);
        self.roster.apply(RosterCommand::Clear);
        Released {
            producers: self.producers.drain().map(|(_, p)| p).collect(),
            consumers: self.consumers.drain().map(|(_, c)| c).collect(),
            send_transport: self.send_transport.take(),
            recv_transport: self.recv_transport.take(),
            local_stream: self.local_stream.take(),
            was_joined,
        }
    }
}
