use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{KernelError, Phase};

/// Reserved patch key carrying a control signal instead of evidence.
pub const CONTROL_KEY: &str = "$control";
/// `{"$append": [...]}` appends to an array instead of replacing it.
pub const APPEND_KEY: &str = "$append";

const APPROVALS_KEY: &str = "approvals";
const PIVOTS_KEY: &str = "pivots";

/// Lifecycle signals that travel through the ordinary commit path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlSignal {
    Abandon { reason: String },
    Fail { reason: String },
    Expire { checkpoint_name: String },
    Resume { checkpoint_name: String },
}

impl ControlSignal {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abandon { .. } => "abandon",
            Self::Fail { .. } => "fail",
            Self::Expire { .. } => "expire",
            Self::Resume { .. } => "resume",
        }
    }

    fn validate(&self) -> Result<(), KernelError> {
        let (field, value) = match self {
            Self::Abandon { reason } | Self::Fail { reason } => ("reason", reason),
            Self::Expire { checkpoint_name } | Self::Resume { checkpoint_name } => {
                ("checkpoint_name", checkpoint_name)
            }
        };
        if value.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "{CONTROL_KEY}.{field} MUST be non-empty"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPatch {
    pub document: Map<String, Value>,
    pub control: Option<ControlSignal>,
}

impl ParsedPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document.is_empty() && self.control.is_none()
    }
}

/// Splits a raw patch into its evidence document and optional control signal.
///
/// Rejects anything that would let a caller write system-owned state: the pivot log is
/// never patchable and approvals only arrive together with a matching `resume` control.
///
/// # Errors
/// Returns [`KernelError::Validation`] describing the first malformed part.
pub fn parse_patch(raw: Option<&Value>) -> Result<ParsedPatch, KernelError> {
    let Some(raw) = raw else {
        return Ok(ParsedPatch::default());
    };
    let Value::Object(map) = raw else {
        return Err(KernelError::Validation(
            "patch MUST be a JSON object".to_string(),
        ));
    };

    let mut document = map.clone();
    let control = match document.remove(CONTROL_KEY) {
        Some(value) => {
            let signal: ControlSignal = serde_json::from_value(value)
                .map_err(|err| KernelError::Validation(format!("invalid {CONTROL_KEY}: {err}")))?;
            signal.validate()?;
            Some(signal)
        }
        None => None,
    };

    for (key, value) in &document {
        if key == PIVOTS_KEY {
            return Err(KernelError::Validation(
                "pivots is system-owned and cannot be patched".to_string(),
            ));
        }
        if key == APPROVALS_KEY {
            check_approval_patch(value, control.as_ref())?;
            continue;
        }
        if Phase::parse(key).is_none() {
            return Err(KernelError::Validation(format!(
                "unknown structured_state partition `{key}`"
            )));
        }
        if !(value.is_object() || value.is_null()) {
            return Err(KernelError::Validation(format!(
                "patch for partition `{key}` MUST be an object or null"
            )));
        }
    }

    Ok(ParsedPatch { document, control })
}

fn check_approval_patch(value: &Value, control: Option<&ControlSignal>) -> Result<(), KernelError> {
    let Some(ControlSignal::Resume { checkpoint_name }) = control else {
        return Err(KernelError::Validation(
            "approvals can only be written by a checkpoint decision".to_string(),
        ));
    };
    match value {
        Value::Object(entries) if entries.len() == 1 && entries.contains_key(checkpoint_name) => {
            Ok(())
        }
        _ => Err(KernelError::Validation(format!(
            "a decision patch MUST contain exactly approvals.{checkpoint_name}"
        ))),
    }
}

/// Merges `patch` into `target`.
///
/// Objects merge key by key, `null` removes a key, arrays and scalars replace,
/// and `{"$append": [...]}` extends the existing array.
///
/// # Errors
/// Returns [`KernelError::Validation`] for malformed `$append` markers.
pub fn deep_merge(target: &mut Value, patch: &Value) -> Result<(), KernelError> {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return Ok(());
    };

    if let Some(items) = append_items(patch_map)? {
        match target {
            Value::Array(existing) => existing.extend(items.iter().cloned()),
            Value::Null => *target = Value::Array(items.clone()),
            _ => {
                return Err(KernelError::Validation(format!(
                    "{APPEND_KEY} target is not an array"
                )));
            }
        }
        return Ok(());
    }

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
                continue;
            }
            let slot = target_map.entry(key.clone()).or_insert(Value::Null);
            deep_merge(slot, value)?;
        }
    }
    Ok(())
}

fn append_items(map: &Map<String, Value>) -> Result<Option<&Vec<Value>>, KernelError> {
    let Some(value) = map.get(APPEND_KEY) else {
        return Ok(None);
    };
    if map.len() != 1 {
        return Err(KernelError::Validation(format!(
            "{APPEND_KEY} MUST be the only key of its object"
        )));
    }
    match value {
        Value::Array(items) => Ok(Some(items)),
        _ => Err(KernelError::Validation(format!(
            "{APPEND_KEY} MUST hold an array"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn must<T>(result: Result<T, KernelError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn objects_merge_and_arrays_replace() {
        let mut target = json!({
            "feasibility": {"constraints": ["a", "b"], "status": "orange"},
            "discovery": {"customer_segment": "smb"}
        });
        must(deep_merge(
            &mut target,
            &json!({"feasibility": {"constraints": ["c"]}}),
        ));
        assert_eq!(
            target,
            json!({
                "feasibility": {"constraints": ["c"], "status": "orange"},
                "discovery": {"customer_segment": "smb"}
            })
        );
    }

    #[test]
    fn append_marker_extends_arrays() {
        let mut target = json!({"feasibility": {"constraints": ["a"]}});
        must(deep_merge(
            &mut target,
            &json!({"feasibility": {"constraints": {"$append": ["b", "c"]}}}),
        ));
        assert_eq!(
            target,
            json!({"feasibility": {"constraints": ["a", "b", "c"]}})
        );

        let mut empty = json!({});
        must(deep_merge(
            &mut empty,
            &json!({"feasibility": {"constraints": {"$append": ["x"]}}}),
        ));
        assert_eq!(empty, json!({"feasibility": {"constraints": ["x"]}}));
    }

    #[test]
    fn append_marker_rejects_scalar_target_and_mixed_keys() {
        let mut target = json!({"discovery": {"customer_segment": "smb"}});
        let scalar = deep_merge(
            &mut target,
            &json!({"discovery": {"customer_segment": {"$append": ["x"]}}}),
        );
        assert!(matches!(scalar, Err(KernelError::Validation(_))));

        let mixed = deep_merge(
            &mut json!({}),
            &json!({"feasibility": {"constraints": {"$append": ["x"], "other": 1}}}),
        );
        assert!(matches!(mixed, Err(KernelError::Validation(_))));
    }

    #[test]
    fn null_removes_keys() {
        let mut target = json!({"viability": {"cac": 10.0, "ltv": 30.0}});
        must(deep_merge(&mut target, &json!({"viability": {"cac": null}})));
        assert_eq!(target, json!({"viability": {"ltv": 30.0}}));
    }

    #[test]
    fn parse_patch_extracts_control_signal() {
        let parsed = must(parse_patch(Some(&json!({
            "$control": {"kind": "abandon", "reason": "founder left"}
        }))));
        assert!(parsed.document.is_empty());
        assert_eq!(
            parsed.control,
            Some(ControlSignal::Abandon {
                reason: "founder left".to_string()
            })
        );
        assert!(must(parse_patch(None)).is_empty());
    }

    #[test]
    fn parse_patch_guards_system_owned_keys() {
        let not_object = parse_patch(Some(&json!("evidence")));
        assert!(matches!(not_object, Err(KernelError::Validation(_))));

        let pivots = parse_patch(Some(&json!({"pivots": []})));
        assert!(matches!(pivots, Err(KernelError::Validation(_))));

        let unknown = parse_patch(Some(&json!({"marketing": {}})));
        assert!(matches!(unknown, Err(KernelError::Validation(_))));

        let approval = json!({"decision": "approve", "decided_by": "ana", "decided_at": "2026-02-07T12:00:00Z"});
        let unsolicited = parse_patch(Some(&json!({"approvals": {"discovery_review": approval}})));
        assert!(matches!(unsolicited, Err(KernelError::Validation(_))));

        let mismatched = parse_patch(Some(&json!({
            "approvals": {"desirability_gate": approval},
            "$control": {"kind": "resume", "checkpoint_name": "discovery_review"}
        })));
        assert!(matches!(mismatched, Err(KernelError::Validation(_))));

        let matched = must(parse_patch(Some(&json!({
            "approvals": {"discovery_review": approval},
            "$control": {"kind": "resume", "checkpoint_name": "discovery_review"}
        }))));
        assert!(matched.document.contains_key("approvals"));

        let blank = parse_patch(Some(&json!({"$control": {"kind": "fail", "reason": ""}})));
        assert!(matches!(blank, Err(KernelError::Validation(_))));
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            (0i64..1000).prop_map(Value::from),
            "[a-z]{0,6}".prop_map(Value::String),
            prop::collection::vec((0i64..10).prop_map(Value::from), 0..4).prop_map(Value::Array),
        ]
    }

    fn object() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop::collection::btree_map("[a-d]", inner, 0..4)
                .prop_map(|entries| Value::Object(entries.into_iter().collect()))
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_merging_same_patch_twice_is_idempotent(base in object(), patch in object()) {
            let mut once = base.clone();
            must(deep_merge(&mut once, &patch));
            let mut twice = once.clone();
            must(deep_merge(&mut twice, &patch));
            prop_assert_eq!(once, twice);
        }
    }
}
