//! Transport Adapters: Telegram ingress/egress and the self-chat observer,
//! sharing the router downstream.
//!
//! Each adapter normalizes its own inbound events into a [`RouterOwner`]
//! plus message text, calls the router, and applies its own outbound
//! formatting rules (payload caps, self-addressing quirks) to whatever the
//! router produces. Neither adapter owns any pipeline logic — that all
//! lives in [`crate::router`].

pub mod selfchat;
pub mod telegram;

use thiserror::Error;

/// Errors surfaced by a transport adapter to the operator log. Never
/// propagated into a reply: every failure here is either retried with
/// backoff or silently dropped, matching §7's "auth failure / transport
/// stops, surfaced to operator log only" contract.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying HTTP client failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The remote API reported a non-success response.
    #[error("transport API error: {0}")]
    Api(String),
}

/// A small bounded FIFO set: tracks the most recent `capacity` distinct
/// values seen, evicting the oldest once full. Used by the self-chat
/// adapter for its multi-level de-duplication (by guid, by sender+text
/// tuple, by recent body, by recent reply) so memory stays bounded no
/// matter how long the process runs.
pub struct BoundedSet<T> {
    capacity: usize,
    order: std::collections::VecDeque<T>,
    members: std::collections::HashSet<T>,
}

impl<T> BoundedSet<T>
where
    T: Eq + std::hash::Hash + Clone,
{
    /// Build an empty set holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: std::collections::VecDeque::new(),
            members: std::collections::HashSet::new(),
        }
    }

    /// Whether `value` has been seen and is still within the window.
    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    /// Record `value` as seen, evicting the oldest entry if at capacity.
    /// Returns `true` if this is the first time `value` has been recorded.
    pub fn insert(&mut self, value: T) -> bool {
        if self.members.contains(&value) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(value.clone());
        self.members.insert(value);
        true
    }
}
