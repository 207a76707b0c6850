//! Line protocol spoken by a remote unit on stdout.
//!
//! A unit proves it started by printing `WEFT_DISPATCH_STARTED <dispatch_id>`
//! and then reports its result as `WEFT_RESULT <json>`. Anything else on
//! stdout is ignored.

use std::collections::BTreeMap;

use serde_json::Value;

pub const STARTED_MARKER: &str = "WEFT_DISPATCH_STARTED";
pub const RESULT_MARKER: &str = "WEFT_RESULT";

/// Environment variables handed to every remote unit.
pub mod env {
    pub const RUN_ID: &str = "WEFT_RUN_ID";
    pub const GRAPH_ID: &str = "WEFT_GRAPH_ID";
    pub const NODE_ID: &str = "WEFT_NODE_ID";
    pub const NODE_TYPE: &str = "WEFT_NODE_TYPE";
    pub const DISPATCH_ID: &str = "WEFT_DISPATCH_ID";
    pub const WORKSPACE_ID: &str = "WEFT_WORKSPACE_ID";
    pub const EXECUTION_INDEX: &str = "WEFT_EXECUTION_INDEX";
    pub const INPUT: &str = "WEFT_INPUT";
}

pub fn started_line(dispatch_id: &str) -> String {
    format!("{} {}", STARTED_MARKER, dispatch_id)
}

pub fn result_line(payload: &Value) -> String {
    format!("{} {}", RESULT_MARKER, payload)
}

/// Outcome of scanning a finished unit's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerScan {
    /// The unit proved it started; `payload` is its result, if it printed one.
    Confirmed { payload: Option<Value> },
    /// No valid startup marker. The unit may or may not have run.
    Missing(String),
    /// The marker was seen but the result line is not valid JSON.
    InvalidPayload(String),
}

/// Scan stdout for the startup marker of `dispatch_id` followed by a result.
pub fn scan(stdout: &str, dispatch_id: &str) -> MarkerScan {
    let mut started = false;
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(STARTED_MARKER) {
            let seen = rest.trim();
            if seen != dispatch_id {
                return MarkerScan::Missing(format!(
                    "startup marker carries dispatch id {:?}, expected {}",
                    seen, dispatch_id
                ));
            }
            started = true;
        } else if let Some(rest) = line.strip_prefix(RESULT_MARKER) {
            if !started {
                return MarkerScan::Missing("result payload printed before startup marker".into());
            }
            return match serde_json::from_str(rest.trim()) {
                Ok(payload) => MarkerScan::Confirmed {
                    payload: Some(payload),
                },
                Err(e) => MarkerScan::InvalidPayload(e.to_string()),
            };
        }
    }
    if started {
        MarkerScan::Confirmed { payload: None }
    } else {
        MarkerScan::Missing("no startup marker in unit output".into())
    }
}

/// Collect the unit environment from the current process, keyed by the
/// names in [`env`].
pub fn read_env() -> BTreeMap<&'static str, String> {
    [
        env::RUN_ID,
        env::GRAPH_ID,
        env::NODE_ID,
        env::NODE_TYPE,
        env::DISPATCH_ID,
        env::WORKSPACE_ID,
        env::EXECUTION_INDEX,
        env::INPUT,
    ]
    .into_iter()
    .filter_map(|k| std::env::var(k).ok().map(|v| (k, v)))
    .collect()
}
