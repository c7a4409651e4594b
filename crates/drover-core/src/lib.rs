// Wire model and resource arithmetic for the drover task runner.
//
// This crate holds the types every other crate agrees on: the JSON request
// envelope that arrives on queues, the resource specification tasks carry,
// and the byte-quantity parsing both of those depend on. It deliberately has
// no async or broker dependencies so the scheduler and runner crates can
// share it without dragging each other in.

pub mod bytes;
pub mod error;
pub mod request;
pub mod resource;

pub use bytes::ByteQuantity;
pub use error::{CoreError, Result};
pub use request::{Artifact, Config, Experiment, MetadataStore, Request, RunnerOptions};
pub use resource::Resource;
