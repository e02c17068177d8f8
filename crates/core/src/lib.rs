// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![forbid(unsafe_code)]

//! relay-core: shared types for the relay workspace — identifiers, the
//! injectable clock, the wire-level `Message`/`Subscription` data model, the
//! error taxonomy, the configuration value tree, and the `SessionStore`
//! capability consumed (but not implemented durably) by the core.

pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod message;
pub mod recovery_types;
pub mod session_store;
pub mod session_types;
pub mod subscription;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::Config;
pub use error::{ErrorKind, RelayError};
pub use id::{IdGen, SequentialIdGen, ShortId, UuidIdGen};
pub use message::{Message, MessageType};
pub use recovery_types::{
    BackoffFamily, CircuitBreakerState, CircuitState, ErrorClassification, RecoveryAction,
};
pub use session_store::{NoopSessionStore, SessionSnapshot, SessionStore, SessionStoreError};
pub use session_types::{SessionConfig, SessionState};
pub use subscription::{BackpressurePolicy, Subscription, SubscriptionId, Topic};

define_id! {
    /// Identifies a Session: a long-lived logical Claude conversation.
    pub struct SessionId;
}

define_id! {
    /// Identifies the workspace a Session belongs to.
    pub struct WorkspaceId;
}

define_id! {
    /// Identifies one Process Supervisor (one subprocess's controller).
    pub struct SupervisorId;
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn ids_display_as_their_string() {
        let s = SessionId::new("s-1");
        assert_eq!(s.to_string(), "s-1");
        let w = WorkspaceId::new("w-1");
        assert_eq!(w.as_str(), "w-1");
    }
}
