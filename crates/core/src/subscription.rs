// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A consumer's binding to a Bus topic.

use std::fmt;

define_id! {
    /// Identifies one Subscription on the Event Bus.
    pub struct SubscriptionId;
}

/// What a Subscription does when its local buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    DropOldest,
    DropNewest,
    #[default]
    Block,
    CloseOnOverflow,
}

/// A Bus topic: either one session's output or a workspace-wide fan-in.
///
/// A publish to `Topic::Session` is also delivered to subscribers of the
/// owning `Topic::Workspace` topic (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Session(crate::SessionId),
    Workspace(crate::WorkspaceId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Session(id) => write!(f, "session:{id}"),
            Topic::Workspace(id) => write!(f, "workspace:{id}"),
        }
    }
}

/// Metrics and lifecycle snapshot for one Subscription, as observed by a
/// caller (spec.md §3). The live delivery machinery lives in `relay-bus`;
/// this is the inert, cloneable view of it.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: Topic,
    pub buffer_size: usize,
    pub policy: BackpressurePolicy,
    pub last_delivered_sequence: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub closed: bool,
}

impl Subscription {
    pub fn new(id: SubscriptionId, topic: Topic, buffer_size: usize, policy: BackpressurePolicy) -> Self {
        Self {
            id,
            topic,
            buffer_size,
            policy,
            last_delivered_sequence: 0,
            delivered: 0,
            dropped: 0,
            closed: false,
        }
    }
}
