//! Benchmark utilities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use rand::Rng;
use std::sync::Arc;
use tidesync_session::{
    AccessToken, ManualReconnectScheduler, RecordingTransport, SessionConfig, SessionCoordinator,
    SyncSession, SyncUser,
};

/// Generate `count` random waiter targets below `max`.
pub fn random_targets(count: usize, max: u64) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    (0..count).map(|_| rng.gen_range(0..max.max(1))).collect()
}

/// Open and activate a session backed by in-memory collaborators.
///
/// The coordinator is returned alongside the session to keep it alive.
pub fn active_session() -> (Arc<SessionCoordinator>, Arc<SyncSession>) {
    let user = SyncUser::new("bench", AccessToken::new("token"));
    let coordinator = SessionCoordinator::builder(user, Arc::new(RecordingTransport::new()))
        .scheduler(Arc::new(ManualReconnectScheduler::new()))
        .build();
    let session = coordinator
        .open_session(SessionConfig::new("wss://bench.example.com", "/bench"), None)
        .expect("Failed to open session");
    session.bind();
    (coordinator, session)
}
