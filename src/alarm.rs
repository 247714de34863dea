//! Alarm evaluation
//!
//! Answers "is any alarm bound to this deployment breached?" on top of an
//! [`AlarmSource`](crate::ports::AlarmSource), with a short TTL cache so
//! tight soak-polling loops do not hammer the source.

pub mod watcher;

pub use watcher::AlarmWatcher;
