// Task execution host for the drover runner.
//
// Turns an accepted queue message into a finished task: reserves resources,
// stages a per-task workspace, writes the runner script, supervises the
// interpreter subprocess, scrapes metadata out of its stdout, and pushes
// mutable artifacts back. The scheduler only sees the resulting
// `ProcessOutcome`.

pub mod error;
pub mod exec;
pub mod notify;
pub mod processor;
pub mod scrape;
pub mod script;
pub mod store;
pub mod workspace;

pub use error::{Result, RunnerError};
pub use notify::WebhookNotifier;
pub use processor::{TaskHost, TaskHostConfig};
pub use scrape::MetadataScraper;
pub use store::{ArtifactStore, LocalStore};
pub use workspace::TaskWorkspace;
