//! SYN cookie node library
//!
//! Stateless answering of TCP SYNs under flood: adaptive mode control, two rotating
//! secret slots, keyed-MAC cookie ISNs and reconstruction of the original SYN from a
//! validated ACK.

pub mod config;
pub mod cookie;
pub mod engine;
pub mod error;
pub mod filter;
pub mod handshake;
pub mod mac;
pub mod management;
pub mod packet;
pub mod rotation;
pub mod secret;
pub mod status;
pub mod wire;

// Re-export commonly used types
pub use config::NodeConfig;
pub use engine::{SyncookieEngine, SyncookieSettings};
pub use error::{Result, SyncookieError};
pub use filter::{filter_tcp, restore_replay_tag, Verdict};
pub use handshake::{HalfOpenCounter, HandshakeTable};
pub use packet::{ConnectionDescriptor, Direction, SyntheticSegment, TcpFlags, TcpSegment};
pub use rotation::{KeyRotator, RotationSchedule, RotatorState};
pub use status::{FloodCheck, StatusSnapshot, SyncookieMode, SyncookieStatus};
pub use wire::{RecordingSender, SegmentSender};
