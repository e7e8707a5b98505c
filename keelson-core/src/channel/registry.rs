//! Process-wide table of live channels.
//!
//! A channel is inserted when it is created (or reused from a pool) and
//! removed by a listener on its close future, or when the last handle to a
//! channel that was never closed goes away.

use super::ChannelId;
use crate::future::CompletionFuture;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};

struct LiveChannel {
    parent: Option<ChannelId>,
    close_future: CompletionFuture,
}

static LIVE: Lazy<DashMap<ChannelId, LiveChannel>> = Lazy::new(DashMap::new);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn allocate_id() -> ChannelId {
    ChannelId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn register(id: ChannelId, parent: Option<ChannelId>, close_future: &CompletionFuture) {
    LIVE.insert(
        id,
        LiveChannel {
            parent,
            close_future: close_future.clone(),
        },
    );
    close_future.add_listener(move |_| {
        LIVE.remove(&id);
    });
}

pub(crate) fn unregister(id: ChannelId) {
    LIVE.remove(&id);
}

/// Number of channels whose close future is still pending.
#[must_use]
pub fn live_channels() -> usize {
    LIVE.len()
}

#[must_use]
pub fn is_live(id: ChannelId) -> bool {
    LIVE.contains_key(&id)
}

/// The parent recorded for a live channel, if it has one.
#[must_use]
pub fn parent_of(id: ChannelId) -> Option<ChannelId> {
    LIVE.get(&id).and_then(|entry| entry.parent)
}

/// Close future of a live channel.
#[must_use]
pub fn close_future_of(id: ChannelId) -> Option<CompletionFuture> {
    LIVE.get(&id).map(|entry| entry.close_future.clone())
}
