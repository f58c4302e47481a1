//! WebRTC stream signaling over a shared session store.
//!
//! A host publishes camera/microphone tracks to a viewer. The two exchange
//! offer, answer and ICE candidates through a [`store::SessionStore`] row and
//! its [`store::ChangeNotifier`]; [`StreamLifecycleController`] is the entry
//! point for both roles.

pub mod config;
pub mod controller;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{RetryPolicy, SignalingConfig, ViewerMode};
pub use controller::{Collaborators, StreamLifecycleController};
pub use error::{Error, ErrorKind, Phase, Result};
pub use logger::init_logging;
pub use peer::{
    IceCandidate, LocalMedia, MediaDevices, RemoteMedia, RtcBackend, ServerConfig,
    SessionDescription, WebRtcBackend,
};
pub use session::StreamSession;
pub use signaling::{Role, SignalingState};
