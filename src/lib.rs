//! voxrelay library.
//!
//! Relays chat traffic between short-lived mobile clients and long-lived
//! outbound bridge agents, and fans out speech transcription and
//! notification streams.

pub mod api;
pub mod bridge;
pub mod notify;
pub mod push;
pub mod relay;
pub mod settings;
pub mod stt;
