#![allow(dead_code)]

use std::time::Duration;

use stream_signal::session::StreamSession;
use stream_signal::store::SessionStore;
use stream_signal::testing::TestRig;

pub use stream_signal::testing::eventually;

pub const WAIT: Duration = Duration::from_secs(3);

/// Initialize tracing for tests (call once per test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn")
        .with_test_writer()
        .try_init();
}

pub async fn row(rig: &TestRig, stream_id: &str) -> StreamSession {
    rig.sessions
        .get(stream_id)
        .await
        .expect("store read")
        .expect("session row exists")
}
