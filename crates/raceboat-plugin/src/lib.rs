//! Plugin-facing contract for raceboat transport plugins.
//!
//! This crate defines nothing but vocabulary: identifiers, status enums, and
//! the two traits that make up the asynchronous callback protocol between
//! the core (§4.2/§4.3 of the design doc) and a transport plugin. It has no
//! opinion on what a transport actually does; `raceboat-transport-mem` is a
//! worked example.

mod ids;
mod pkg;
mod plugin;
mod properties;
mod response;
mod sdk;
mod status;

pub use ids::*;
pub use pkg::*;
pub use plugin::*;
pub use properties::*;
pub use response::*;
pub use sdk::*;
pub use status::*;
