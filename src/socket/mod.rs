//! Connection core: dispatcher, writer task, stream registry, keepalive,
//! lease admission and resume bookkeeping, tied together by the duplex
//! socket.

pub(crate) mod dispatcher;
pub mod duplex;
pub(crate) mod keepalive;
pub mod lease;
pub mod registry;
pub mod resume;
pub mod writer;
