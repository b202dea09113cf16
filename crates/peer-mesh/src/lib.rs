//! Full-mesh audio sessions over peer-to-peer connections.
//!
//! Every participant holds one link to every other participant. Links are
//! negotiated over a relay using perfect negotiation, trickle candidates are
//! buffered until they can be used, and failed links are renegotiated up to a
//! retry ceiling before the peer is abandoned.

pub mod candidates;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod mock;
pub mod negotiation;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod webrtc;

pub use config::MeshConfig;
pub use error::{ConnectionError, MediaError, MeshError, RelayError};
pub use media::{LocalMedia, MediaSource, RemoteMedia};
pub use protocol::PeerId;
pub use session::{MeshHandle, MeshNotification, MeshSession, MeshSnapshot, MeshStatus};
pub use supervisor::{Backoff, RetryPolicy};
