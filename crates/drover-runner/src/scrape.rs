// Metadata accumulation from task stdout.
//
// Tasks emit single-line JSON fragments among their ordinary output. Two
// kinds are recognized: plain objects, deep-merged into the accumulated
// document with later values winning at the leaves, and RFC 6902 patch
// arrays applied in order. Once the document says the task completed,
// further fragments may only add fields, never change existing ones.

use std::fs;
use std::path::Path;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{trace, warn};

use crate::error::{Result, RunnerError};

pub struct MetadataScraper {
    doc: Mutex<Value>,
}

impl MetadataScraper {
    pub fn new() -> Self {
        MetadataScraper {
            doc: Mutex::new(Value::Object(serde_json::Map::new())),
        }
    }

    /// Feed one line of task output. Lines that are not JSON are ignored;
    /// they are ordinary program output.
    pub fn ingest_line(&self, line: &str) {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
            return;
        }
        let fragment: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => return,
        };

        let mut doc = self.doc.lock();
        let frozen = is_completed(&doc);

        let mut candidate = doc.clone();
        match &fragment {
            Value::Object(_) => deep_merge(&mut candidate, &fragment),
            Value::Array(_) => {
                let patch: json_patch::Patch = match serde_json::from_value(fragment.clone()) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(error = %err, "json patch fragment rejected");
                        return;
                    }
                };
                if let Err(err) = json_patch::patch(&mut candidate, &patch) {
                    warn!(error = %err, "json patch fragment failed to apply");
                    return;
                }
            }
            _ => return,
        }

        // Annotations arriving after completion must not rewrite history.
        if frozen && !preserves_existing(&doc, &candidate) {
            warn!("fragment modifying a completed document dropped");
            return;
        }

        trace!("metadata fragment applied");
        *doc = candidate;
    }

    /// The accumulated document so far.
    pub fn document(&self) -> Value {
        self.doc.lock().clone()
    }

    /// Persist the accumulated document, pretty-printed for human eyes.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let doc = self.doc.lock();
        let text =
            serde_json::to_string_pretty(&*doc).map_err(|e| RunnerError::Process(e.to_string()))?;
        fs::write(path, text).map_err(|e| RunnerError::io(path, e))
    }
}

impl Default for MetadataScraper {
    fn default() -> Self {
        Self::new()
    }
}

fn is_completed(doc: &Value) -> bool {
    doc.pointer("/studioml/status")
        .and_then(Value::as_str)
        .map(|s| s == "completed")
        .unwrap_or(false)
}

/// Merge `src` into `dst`, recursing through objects; anything else is
/// replaced wholesale.
fn deep_merge(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (key, src_val) in src_map {
                match dst_map.get_mut(key) {
                    Some(dst_val) => deep_merge(dst_val, src_val),
                    None => {
                        dst_map.insert(key.clone(), src_val.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

/// True when every field present in `old` survives unchanged in `new`.
fn preserves_existing(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => old_map.iter().all(|(key, old_val)| {
            new_map
                .get(key)
                .map(|new_val| preserves_existing(old_val, new_val))
                .unwrap_or(false)
        }),
        (old, new) => old == new,
    }
}
