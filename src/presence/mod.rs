//! Presence: local typing derivation, remote typing flags and read receipts.

pub mod receipts;
pub mod typing;
pub mod visibility;

pub use receipts::{latest_remote, ReadReceiptTracker};
pub use typing::{PeerTyping, TypingTracker, DEFAULT_PEER_TYPING_TTL, DEFAULT_TYPING_IDLE};
pub use visibility::VisibilityGate;
