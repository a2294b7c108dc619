//! Health and metrics endpoints of the relayer.
//!
//! Components report metrics through a cheap, cloneable [Client]. Recording never blocks and
//! never fails from the caller's point of view, so the pipeline keeps running when the
//! monitoring server is disabled or overloaded.

mod endpoints;
mod server;

pub use endpoints::metrics;
pub use server::*;
