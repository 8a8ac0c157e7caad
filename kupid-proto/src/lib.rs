//! Shared protocol definitions for the Kupid chat wire format.

pub mod codec;
pub mod event;
pub mod message;
pub mod presence;
pub mod room;
pub mod thread;
