//! One commit file is a sequence of UTF-8 JSON objects, one action per
//! line, newline-terminated. Unknown action kinds parse without failing the
//! replay; they are dropped whenever the log is rewritten (checkpoints).

use bytes::Bytes;
use itertools::Itertools;
use serde_json::Value;
use tracing::warn;

use crate::actions::Action;
use crate::error::{DlResult, Error};

/// Serialize actions into a commit file body. Order is preserved exactly.
pub(crate) fn encode_commit(actions: &[Action]) -> DlResult<Bytes> {
    let mut out = actions
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .join("\n");
    out.push('\n');
    Ok(Bytes::from(out))
}

/// Parse a commit file body. Lines carrying an unrecognized action kind are
/// kept out of the result but do not fail the parse; malformed JSON does.
pub(crate) fn decode_commit(bytes: &[u8]) -> DlResult<Vec<Action>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::validation(format!("commit file is not UTF-8: {e}")))?;
    let mut actions = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Action>(line) {
            Ok(action) => actions.push(action),
            Err(typed_err) => {
                // Distinguish "future action kind" from corruption: the
                // former is a well-formed single-key object under a key we
                // do not know.
                const KNOWN: [&str; 7] = [
                    "protocol",
                    "metaData",
                    "add",
                    "remove",
                    "cdc",
                    "txn",
                    "commitInfo",
                ];
                match serde_json::from_str::<Value>(line) {
                    Ok(Value::Object(obj))
                        if obj.len() == 1
                            && !KNOWN.contains(&obj.keys().next().map(String::as_str).unwrap_or("")) =>
                    {
                        warn!(
                            key = obj.keys().next().map(String::as_str).unwrap_or(""),
                            "skipping unrecognized action in commit file"
                        );
                    }
                    _ => return Err(Error::Json(typed_err)),
                }
            }
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Add, CommitInfo, Protocol};
    use std::collections::HashMap;

    fn sample_actions() -> Vec<Action> {
        vec![
            Action::CommitInfo(CommitInfo::new(1700000000000, "WRITE")),
            Action::Protocol(Protocol::default()),
            Action::Add(Add {
                path: "part-00000000000000000001-0.parquet".to_string(),
                partition_values: HashMap::new(),
                size: 1024,
                modification_time: 1700000000000,
                data_change: true,
                stats: None,
            }),
        ]
    }

    #[test]
    fn encode_decode_preserves_order() {
        let actions = sample_actions();
        let bytes = encode_commit(&actions).unwrap();
        assert!(bytes.ends_with(b"\n"));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 3);
        let decoded = decode_commit(&bytes).unwrap();
        assert_eq!(decoded, actions);
    }

    #[test]
    fn unknown_action_kinds_are_skipped() {
        let body = "{\"protocol\":{\"minReaderVersion\":1,\"minWriterVersion\":2}}\n\
                    {\"sidecar\":{\"path\":\"future.parquet\"}}\n";
        let decoded = decode_commit(body.as_bytes()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(matches!(decoded[0], Action::Protocol(_)));
    }

    #[test]
    fn corrupt_lines_fail() {
        assert!(decode_commit(b"{\"add\":").is_err());
        assert!(decode_commit(b"[1,2,3]\n").is_err());
    }
}
