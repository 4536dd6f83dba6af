//! jobserver - shared package resolution for concurrent builds
//!
//! A long-lived job server answers package resolution requests from many
//! compiler processes over a message bus, computing each distinct request
//! at most once and recording the dependency graph as it goes.

pub mod bus;
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod graph;
pub mod packages;
pub mod protocol;
pub mod router;
pub mod server;

pub use error::{JobServerError, JobServerResult};
