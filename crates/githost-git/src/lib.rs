//! Git smart HTTP protocol for githost.
//!
//! This crate implements the pack codec, reachability walks, want/have
//! negotiation and the receive-pack/upload-pack state machine on top of
//! `githost-storage`, enabling standard git clients to push to and fetch
//! from githost repositories. The HTTP transport itself lives elsewhere;
//! [`GitService`] is the async surface it calls.

mod config;
mod delta;
mod error;
mod negotiate;
mod pack;
mod pktline;
mod protocol;
mod service;
mod sideband;
mod walk;

pub use config::{Config, ConfigError, ProtocolConfig};
pub use delta::{apply_delta, delta_sizes, DeltaError};
pub use error::GitError;
pub use negotiate::{Acknowledgement, NegotiationSession, NegotiationState};
pub use pack::{DecodedPack, PackDecoder, PackEncoder, PackLimits};
pub use pktline::{PktLine, PktLineReader, PktLineWriter, MAX_PKT_DATA, MAX_PKT_LEN};
pub use protocol::{
    advertise_refs, receive_pack, upload_pack, Command, ProtocolEngine, ReceiveReport, RefStatus,
    Service, SessionState, UploadSummary, AGENT,
};
pub use service::{Access, AccessControl, AllowAll, GitService, RequestBody, ServiceResponse};
pub use sideband::{write_band, Band, SidebandWriter, MAX_BAND_DATA};
pub use walk::{ObjectSet, ReachabilityWalker};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
