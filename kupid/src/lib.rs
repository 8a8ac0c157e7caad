//! `kupid`: real-time messaging and presence engine for the Kupid client.

pub mod api;
pub mod chat;
pub mod clock;
pub mod config;
pub mod cue;
pub mod identity;
pub mod presence;
pub mod session;
pub mod threads;
pub mod transport;
