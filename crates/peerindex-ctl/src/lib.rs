//! peerindex-ctl — client library for the peerindex control and bulk planes.

pub mod client;

pub use client::ServerError;
