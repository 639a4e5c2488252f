//! Shared Types

mod media;

pub use media::{MediaKind, ParticipantRole, TransportDirection};
