//! RTC Common Library
//!
//! Wire types shared by the session client and the SFU side: the signaling
//! protocol, the SFU REST contract and the server-pushed room events.

pub mod api;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use protocol::{IceCandidate, SdpType, SessionDescription, SignalMessage, TerminationSignal};
pub use types::*;
