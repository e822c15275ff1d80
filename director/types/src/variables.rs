// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The variable-interpolation seam.
//!
//! Manifests embed `((placeholder))` syntax wherever a value lives in the
//! credential/variable store.  Comparisons must be interpolation-aware:
//! a placeholder resolving to the same concrete value under the "before"
//! and "after" variable sets is not a change.  The comparator therefore
//! calls through this trait rather than comparing raw text.
//!
//! The real implementation talks to the config-server over the network and
//! may be slow; callers are expected to wrap calls in a timeout (the
//! planning pool does).

use crate::records::VariableSet;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Clone, Debug, thiserror::Error)]
pub enum InterpolationError {
    #[error("variable '{name}' not found in variable set {set}")]
    MissingVariable { name: String, set: String },
    #[error("variable store request failed: {0}")]
    Backend(String),
    #[error("interpolation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Does this value contain `((...))` placeholder syntax anywhere?
pub fn contains_placeholders(value: &Value) -> bool {
    match value {
        Value::String(s) => {
            s.contains("((") && s.contains("))")
        }
        Value::Array(items) => items.iter().any(contains_placeholders),
        Value::Object(map) => map.values().any(contains_placeholders),
        _ => false,
    }
}

/// Interpolates raw manifest values through a versioned variable set.
#[async_trait]
pub trait VariablesInterpolator: Send + Sync {
    /// Replace every placeholder in `raw` with the concrete value the
    /// given variable-set version pins.
    async fn interpolate(
        &self,
        raw: &Value,
        set: &VariableSet,
    ) -> Result<Value, InterpolationError>;

    /// Would `before` under `before_set` and `after` under `after_set`
    /// interpolate to different concrete values?
    ///
    /// Short-circuits to structural comparison when neither side contains
    /// placeholders, so comparisons of plain values never touch the store.
    async fn interpolated_values_differ(
        &self,
        before: &Value,
        after: &Value,
        before_set: &VariableSet,
        after_set: &VariableSet,
    ) -> Result<bool, InterpolationError> {
        if !contains_placeholders(before) && !contains_placeholders(after) {
            return Ok(before != after);
        }
        let before = self.interpolate(before, before_set).await?;
        let after = self.interpolate(after, after_set).await?;
        Ok(before != after)
    }
}

/// Interpolator that passes values through unchanged.
///
/// Correct for deployments that use no variables at all, and convenient in
/// tests; anything with real placeholders needs the config-server-backed
/// implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityInterpolator;

#[async_trait]
impl VariablesInterpolator for IdentityInterpolator {
    async fn interpolate(
        &self,
        raw: &Value,
        _set: &VariableSet,
    ) -> Result<Value, InterpolationError> {
        Ok(raw.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ids::VariableSetId;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn set() -> VariableSet {
        VariableSet {
            id: VariableSetId::new_v4(),
            deployment: "prod".to_string(),
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn test_placeholder_detection() {
        assert!(contains_placeholders(&json!("((db_password))")));
        assert!(contains_placeholders(&json!({"a": {"b": ["x", "((v))"]}})));
        assert!(!contains_placeholders(&json!({"a": "plain", "n": 7})));
        assert!(!contains_placeholders(&json!("just (parens)")));
    }

    #[tokio::test]
    async fn test_differ_short_circuits_without_placeholders() {
        let interp = IdentityInterpolator;
        let (a, b) = (json!({"x": 1}), json!({"x": 2}));
        assert!(interp
            .interpolated_values_differ(&a, &b, &set(), &set())
            .await
            .unwrap());
        assert!(!interp
            .interpolated_values_differ(&a, &a.clone(), &set(), &set())
            .await
            .unwrap());
    }
}
