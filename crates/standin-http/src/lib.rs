//! Standin: a configurable HTTP stand-in server.
//!
//! Declarative endpoint definitions route an inbound request to exactly one
//! matching response rule and synthesize the reply from a literal, a file, an
//! embedded script, or a proxied upstream call. A companion harness replays
//! declarative test cases against the same routing/synthesis path and tracks
//! per-rule coverage.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod harness;
pub mod matcher;
pub mod registry;
pub mod request;
pub mod response;
pub mod scripting;
pub mod server;

pub use error::{Result, StandinError};
pub use registry::EndpointRegistry;
pub use request::StandinRequest;
