//! Command protocol spoken over the session's data channel.

pub mod channel;
pub mod protocol;

pub use channel::{execute, CommandChannel};
pub use protocol::{Command, ErrorReply, Reply, Response};
