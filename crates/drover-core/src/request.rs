// The JSON request envelope pulled off task queues.
//
// Payloads have two top-level keys, `config` and `experiment`. Submitting
// clients attach fields this runner does not interpret (cloud provider
// blocks, git provenance, metric destinations); those are kept as raw JSON
// values and unknown keys are retained in flatten maps so a request can be
// re-serialized without loss.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::resource::Resource;

/// One unit of work as received from a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub config: Config,

    #[serde(default)]
    pub experiment: Experiment,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Request {
    /// Decode a request from raw message bytes.
    pub fn parse(data: &[u8]) -> Result<Request> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encode the request back to the wire form it arrived in.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Execution environment requested for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<Value>,

    #[serde(default)]
    pub database: MetadataStore,

    #[serde(rename = "saveWorkspaceFrequency", default)]
    pub save_workspace_frequency: String,

    /// Ceiling on how long the task may live, as a duration string.
    #[serde(rename = "experimentLifetime", default)]
    pub lifetime: String,

    #[serde(default)]
    pub verbose: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Extra packages installed on top of the task's own environment list.
    #[serde(default)]
    pub pip: Vec<String>,

    #[serde(default)]
    pub runner: RunnerOptions,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Runner-specific knobs carried inside the config block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerOptions {
    /// Destination channel for progress notifications, empty to disable.
    #[serde(rename = "slack_destination", default)]
    pub notify_destination: String,
}

/// Location of the metadata store the submitting client writes results to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataStore {
    #[serde(rename = "apiKey", default)]
    pub api_key: String,

    #[serde(rename = "authDomain", default)]
    pub auth_domain: String,

    #[serde(rename = "databaseURL", default)]
    pub database_url: String,

    #[serde(rename = "messagingSenderId", default)]
    pub messaging_sender_id: i64,

    #[serde(rename = "projectId", default)]
    pub project_id: String,

    #[serde(rename = "storageBucket", default)]
    pub storage_bucket: String,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(rename = "use_email_auth", default)]
    pub use_email_auth: bool,
}

/// The experiment block: what to run and what it needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Unique key for this task, also the workspace directory name.
    #[serde(default)]
    pub key: String,

    /// File handed to the interpreter.
    #[serde(default)]
    pub filename: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,

    /// Package list captured from the submitter's environment.
    #[serde(default)]
    pub pythonenv: Vec<String>,

    #[serde(rename = "pythonver", default)]
    pub python_ver: i64,

    #[serde(rename = "resources_needed", default)]
    pub resource: Resource,

    #[serde(default)]
    pub status: String,

    #[serde(rename = "time_added", default)]
    pub time_added: f64,

    #[serde(rename = "max_duration", default)]
    pub max_duration: String,

    // Opaque to the runner, preserved for round-tripping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<Value>,

    #[serde(rename = "time_finished", default, skip_serializing_if = "Option::is_none")]
    pub time_finished: Option<Value>,

    #[serde(
        rename = "time_last_checkpoint",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub time_last_checkpoint: Option<Value>,

    #[serde(rename = "time_started", default, skip_serializing_if = "Option::is_none")]
    pub time_started: Option<Value>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A file or archive moved between object storage and the task workspace.
///
/// Mutable artifacts are uploaded back on checkpoint and completion;
/// immutable ones are inputs only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default)]
    pub bucket: String,

    #[serde(default)]
    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,

    #[serde(default)]
    pub mutable: bool,

    /// Unpack the archive into the workspace rather than copying it whole.
    #[serde(default)]
    pub unpack: bool,

    /// Fully qualified source location, scheme included.
    #[serde(default)]
    pub qualified: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r##"{
        "config": {
            "cloud": {"type": "none"},
            "database": {"projectId": "sandbox", "type": "FireBase"},
            "experimentLifetime": "24h",
            "env": {"PATH": "/usr/bin"},
            "pip": ["pyopenssl"],
            "runner": {"slack_destination": "#experiments"},
            "vendor_hint": {"tier": "spot"}
        },
        "experiment": {
            "key": "exp-1700000000-aa",
            "filename": "train.py",
            "args": ["--epochs", "10"],
            "artifacts": {
                "workspace": {
                    "bucket": "experiments",
                    "key": "workspace.tar",
                    "mutable": false,
                    "unpack": true,
                    "qualified": "s3://experiments/workspace.tar"
                }
            },
            "pythonenv": ["numpy==1.26.0"],
            "pythonver": 3,
            "resources_needed": {"cpus": 2, "gpus": 0, "hdd": "10Gb", "ram": "4Gb"},
            "status": "waiting",
            "time_added": 1700000000.5,
            "max_duration": "20m",
            "git": {"url": "https://example.com/repo.git", "rev": "abc123"},
            "annotations": ["from-sweep-7"]
        },
        "schema_rev": 3
    }"##;

    #[test]
    fn parses_a_full_payload() {
        let req = Request::parse(PAYLOAD.as_bytes()).unwrap();
        assert_eq!(req.experiment.key, "exp-1700000000-aa");
        assert_eq!(req.experiment.resource.cpus, 2);
        assert_eq!(req.experiment.resource.hdd.as_u64(), 10_000_000_000);
        assert_eq!(req.config.lifetime, "24h");
        assert_eq!(req.config.runner.notify_destination, "#experiments");
        assert!(req.experiment.artifacts["workspace"].unpack);
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let req = Request::parse(PAYLOAD.as_bytes()).unwrap();
        assert_eq!(req.extra["schema_rev"], serde_json::json!(3));
        assert_eq!(
            req.config.extra["vendor_hint"],
            serde_json::json!({"tier": "spot"})
        );
        assert_eq!(
            req.experiment.extra["annotations"],
            serde_json::json!(["from-sweep-7"])
        );

        let bytes = req.to_vec().unwrap();
        let again = Request::parse(&bytes).unwrap();
        assert_eq!(again, req);
    }

    #[test]
    fn opaque_slots_are_kept_verbatim() {
        let req = Request::parse(PAYLOAD.as_bytes()).unwrap();
        let git = req.experiment.git.as_ref().unwrap();
        assert_eq!(git["rev"], "abc123");
        assert_eq!(req.config.cloud.as_ref().unwrap()["type"], "none");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(Request::parse(b"not json").is_err());
        assert!(Request::parse(b"[1,2,3]").is_err());
    }

    #[test]
    fn minimal_payload_defaults() {
        let req = Request::parse(br#"{"config": {}, "experiment": {"key": "k"}}"#).unwrap();
        assert_eq!(req.experiment.key, "k");
        assert!(req.experiment.resource.fits(&Resource::default()));
        assert!(req.experiment.git.is_none());
    }
}
