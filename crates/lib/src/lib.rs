//! Support relay core library — user <-> forum-topic mapping, topic
//! resolution, and the relay engine used by the `support-relay` binary.

pub mod channels;
pub mod config;
pub mod history;
pub mod mapping;
pub mod relay;
pub mod resolver;
