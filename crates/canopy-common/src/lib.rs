// SPDX-License-Identifier: MIT

//! Shared macros and the [EventBus] used by canopy's crates to hand events from one
//! component to another.

pub mod event_bus;
pub mod macros;

pub use event_bus::EventBus;
pub use event_bus::Subscription;

/// Returns the current unix time, in seconds.
///
/// A clock set before 1970 is treated as the epoch itself, every caller only uses this value to
/// compare against other timestamps taken by the same clock.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
