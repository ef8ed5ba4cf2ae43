//! Choice-state evaluation: comparator semantics, type coercions, and the
//! first-match-wins rule selection.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::DateTime;
use serde_json::Value;
use tracing::warn;

use crate::definition::{ChoiceRule, ChoiceState};
use crate::error::{ExecutionError, PathError};
use crate::paths;

// ---------------------------------------------------------------------------
// Comparators
// ---------------------------------------------------------------------------

/// The value family a comparator operates on.  Both sides of a comparison
/// are coerced to this family before comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFamily {
    String,
    Numeric,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equals,
    GreaterThan,
    GreaterThanEquals,
    LessThan,
    LessThanEquals,
}

/// A parsed comparator key such as `NumericGreaterThanEquals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparator {
    pub family: CompareFamily,
    pub op: CompareOp,
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let (family, rest) = if let Some(rest) = key.strip_prefix("String") {
            (CompareFamily::String, rest)
        } else if let Some(rest) = key.strip_prefix("Numeric") {
            (CompareFamily::Numeric, rest)
        } else if let Some(rest) = key.strip_prefix("Boolean") {
            (CompareFamily::Boolean, rest)
        } else if let Some(rest) = key.strip_prefix("Timestamp") {
            (CompareFamily::Timestamp, rest)
        } else {
            return Err(format!("unknown comparator '{key}'"));
        };

        let op = match rest {
            "Equals" => CompareOp::Equals,
            "GreaterThan" => CompareOp::GreaterThan,
            "GreaterThanEquals" => CompareOp::GreaterThanEquals,
            "LessThan" => CompareOp::LessThan,
            "LessThanEquals" => CompareOp::LessThanEquals,
            _ => return Err(format!("unknown comparator '{key}'")),
        };

        // Ordering is only defined for String/Numeric/Timestamp.
        if family == CompareFamily::Boolean && op != CompareOp::Equals {
            return Err(format!("'{key}': Boolean only supports Equals"));
        }

        Ok(Comparator { family, op })
    }
}

// ---------------------------------------------------------------------------
// Rule classification
// ---------------------------------------------------------------------------

/// A structurally-checked view of one [`ChoiceRule`].
pub enum RuleKind<'a> {
    And(&'a [ChoiceRule]),
    Or(&'a [ChoiceRule]),
    Not(&'a ChoiceRule),
    Comparison {
        variable: &'a str,
        comparator: Comparator,
        operand: &'a Value,
    },
}

impl<'a> RuleKind<'a> {
    pub fn nested_rules(&self) -> &'a [ChoiceRule] {
        match self {
            RuleKind::And(rules) | RuleKind::Or(rules) => rules,
            RuleKind::Not(rule) => std::slice::from_ref(rule),
            RuleKind::Comparison { .. } => &[],
        }
    }
}

/// Classify a rule as combinator or comparison leaf, enforcing the
/// invariants: at most one combinator key, no comparator beside a
/// combinator, and a leaf with a `Variable` plus exactly one comparator.
pub fn rule_kind(rule: &ChoiceRule) -> Result<RuleKind<'_>, String> {
    let combinators = [rule.and.is_some(), rule.or.is_some(), rule.not.is_some()]
        .iter()
        .filter(|set| **set)
        .count();
    if combinators > 1 {
        return Err("rule mixes And/Or/Not at the same level".into());
    }

    if combinators == 1 {
        if !rule.comparators.is_empty() || rule.variable.is_some() {
            return Err("combinator rule must contain only nested rules".into());
        }
        if let Some(rules) = &rule.and {
            return Ok(RuleKind::And(rules));
        }
        if let Some(rules) = &rule.or {
            return Ok(RuleKind::Or(rules));
        }
        if let Some(rule) = &rule.not {
            return Ok(RuleKind::Not(rule));
        }
    }

    let variable = rule
        .variable
        .as_deref()
        .ok_or_else(|| "no Variable in comparison rule".to_string())?;

    if rule.comparators.len() != 1 {
        return Err(format!(
            "expected exactly one comparator key, found {}",
            rule.comparators.len()
        ));
    }
    // len() == 1 just checked
    let (key, operand) = match rule.comparators.iter().next() {
        Some(entry) => entry,
        None => return Err("expected exactly one comparator key, found 0".into()),
    };

    Ok(RuleKind::Comparison {
        variable,
        comparator: key.parse()?,
        operand,
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate one rule against the state's scoped input.
pub fn evaluate(rule: &ChoiceRule, data: &Value) -> Result<bool, ExecutionError> {
    match rule_kind(rule).map_err(ExecutionError::Comparison)? {
        RuleKind::Not(inner) => Ok(!evaluate(inner, data)?),
        RuleKind::And(rules) => {
            for nested in rules {
                if !evaluate(nested, data)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        RuleKind::Or(rules) => {
            for nested in rules {
                if evaluate(nested, data)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        RuleKind::Comparison {
            variable,
            comparator,
            operand,
        } => {
            let actual = paths::resolve(data, variable)?;
            compare(comparator, actual, operand)
        }
    }
}

/// Pick the transition for a Choice state: rules in declared order, first
/// match wins; `Default` if none match.
///
/// A rule whose `Variable` matches nothing in the data fails the execution
/// unless the state carries a `Default`, in which case the rule is treated
/// as unmatched and evaluation moves on.  A malformed `Variable` path is a
/// definition bug and always propagates.
pub fn select_next<'a>(
    state_name: &str,
    state: &'a ChoiceState,
    data: &Value,
) -> Result<&'a str, ExecutionError> {
    for rule in &state.choices {
        match evaluate(rule, data) {
            Ok(true) => {
                return rule.next.as_deref().ok_or_else(|| {
                    ExecutionError::Comparison(format!(
                        "matched rule in state '{state_name}' has no Next"
                    ))
                });
            }
            Ok(false) => {}
            Err(ExecutionError::Path(path_err @ PathError::NoMatch { .. }))
                if state.default.is_some() =>
            {
                warn!(
                    state = state_name,
                    error = %path_err,
                    "choice rule variable did not resolve; falling through"
                );
            }
            Err(other) => return Err(other),
        }
    }

    state
        .default
        .as_deref()
        .ok_or_else(|| ExecutionError::NoMatchingChoice {
            state: state_name.to_owned(),
        })
}

fn compare(comparator: Comparator, actual: &Value, operand: &Value) -> Result<bool, ExecutionError> {
    let mismatch = |side: &str, expected: &str, value: &Value| {
        ExecutionError::Comparison(format!("{side} is not a {expected}: {value}"))
    };

    let ordering = match comparator.family {
        CompareFamily::Numeric => {
            let a = actual
                .as_f64()
                .ok_or_else(|| mismatch("variable value", "number", actual))?;
            let b = operand
                .as_f64()
                .ok_or_else(|| mismatch("comparison operand", "number", operand))?;
            // JSON numbers are never NaN, so a total order exists.
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        CompareFamily::String => {
            let a = actual
                .as_str()
                .ok_or_else(|| mismatch("variable value", "string", actual))?;
            let b = operand
                .as_str()
                .ok_or_else(|| mismatch("comparison operand", "string", operand))?;
            a.cmp(b)
        }
        CompareFamily::Boolean => {
            let a = actual
                .as_bool()
                .ok_or_else(|| mismatch("variable value", "boolean", actual))?;
            let b = operand
                .as_bool()
                .ok_or_else(|| mismatch("comparison operand", "boolean", operand))?;
            return Ok(a == b);
        }
        CompareFamily::Timestamp => {
            let a = parse_timestamp_millis(actual)
                .ok_or_else(|| mismatch("variable value", "timestamp", actual))?;
            let b = parse_timestamp_millis(operand)
                .ok_or_else(|| mismatch("comparison operand", "timestamp", operand))?;
            a.cmp(&b)
        }
    };

    Ok(match comparator.op {
        CompareOp::Equals => ordering == Ordering::Equal,
        CompareOp::GreaterThan => ordering == Ordering::Greater,
        CompareOp::GreaterThanEquals => ordering != Ordering::Less,
        CompareOp::LessThan => ordering == Ordering::Less,
        CompareOp::LessThanEquals => ordering != Ordering::Greater,
    })
}

/// Timestamps are logically strings; comparisons happen on epoch
/// milliseconds after an RFC 3339 parse.
fn parse_timestamp_millis(value: &Value) -> Option<i64> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(value: Value) -> ChoiceRule {
        serde_json::from_value(value).expect("rule should deserialize")
    }

    fn choice_state(value: Value) -> ChoiceState {
        serde_json::from_value(value).expect("choice state should deserialize")
    }

    #[test]
    fn comparator_keys_parse_into_family_and_op() {
        let c: Comparator = "NumericGreaterThanEquals".parse().unwrap();
        assert_eq!(c.family, CompareFamily::Numeric);
        assert_eq!(c.op, CompareOp::GreaterThanEquals);

        let c: Comparator = "TimestampLessThan".parse().unwrap();
        assert_eq!(c.family, CompareFamily::Timestamp);
        assert_eq!(c.op, CompareOp::LessThan);

        assert!("BooleanGreaterThan".parse::<Comparator>().is_err());
        assert!("MagicEquals".parse::<Comparator>().is_err());
    }

    #[test]
    fn numeric_comparisons() {
        let data = json!({"n": 10});
        for (key, operand, expected) in [
            ("NumericEquals", json!(10), true),
            ("NumericEquals", json!(9), false),
            ("NumericGreaterThan", json!(5), true),
            ("NumericGreaterThan", json!(10), false),
            ("NumericGreaterThanEquals", json!(10), true),
            ("NumericLessThan", json!(11), true),
            ("NumericLessThanEquals", json!(9), false),
        ] {
            let r = rule(json!({"Variable": "$.n", key: operand, "Next": "X"}));
            assert_eq!(
                evaluate(&r, &data).unwrap(),
                expected,
                "{key} against {operand}"
            );
        }
    }

    #[test]
    fn string_and_boolean_comparisons() {
        let data = json!({"name": "beta", "flag": true});

        let eq = rule(json!({"Variable": "$.name", "StringEquals": "beta", "Next": "X"}));
        assert!(evaluate(&eq, &data).unwrap());

        let gt = rule(json!({"Variable": "$.name", "StringGreaterThan": "alpha", "Next": "X"}));
        assert!(evaluate(&gt, &data).unwrap());

        let boolean = rule(json!({"Variable": "$.flag", "BooleanEquals": true, "Next": "X"}));
        assert!(evaluate(&boolean, &data).unwrap());

        let boolean_ne = rule(json!({"Variable": "$.flag", "BooleanEquals": false, "Next": "X"}));
        assert!(!evaluate(&boolean_ne, &data).unwrap());
    }

    #[test]
    fn timestamp_comparisons_use_epoch_millis() {
        let data = json!({"at": "2020-01-01T12:00:00Z"});

        let eq = rule(json!({
            // same instant, different zone spelling
            "Variable": "$.at", "TimestampEquals": "2020-01-01T13:00:00+01:00", "Next": "X"
        }));
        assert!(evaluate(&eq, &data).unwrap());

        let lt = rule(json!({
            "Variable": "$.at", "TimestampLessThan": "2020-06-01T00:00:00Z", "Next": "X"
        }));
        assert!(evaluate(&lt, &data).unwrap());
    }

    #[test]
    fn type_mismatch_is_a_comparison_error() {
        let data = json!({"n": "not-a-number"});
        let r = rule(json!({"Variable": "$.n", "NumericGreaterThan": 5, "Next": "X"}));
        assert!(matches!(
            evaluate(&r, &data),
            Err(ExecutionError::Comparison(_))
        ));
    }

    #[test]
    fn not_negates_and_and_or_combine() {
        let data = json!({"n": 10});

        let not = rule(json!({
            "Not": {"Variable": "$.n", "NumericEquals": 3},
            "Next": "X"
        }));
        assert!(evaluate(&not, &data).unwrap());

        let and = rule(json!({
            "And": [
                {"Variable": "$.n", "NumericGreaterThan": 5},
                {"Variable": "$.n", "NumericLessThan": 20}
            ],
            "Next": "X"
        }));
        assert!(evaluate(&and, &data).unwrap());

        let and_false = rule(json!({
            "And": [
                {"Variable": "$.n", "NumericGreaterThan": 5},
                {"Variable": "$.n", "NumericGreaterThan": 50}
            ],
            "Next": "X"
        }));
        assert!(!evaluate(&and_false, &data).unwrap());

        let or = rule(json!({
            "Or": [
                {"Variable": "$.n", "NumericEquals": 1},
                {"Variable": "$.n", "NumericEquals": 10}
            ],
            "Next": "X"
        }));
        assert!(evaluate(&or, &data).unwrap());
    }

    #[test]
    fn and_short_circuits_before_a_bad_rule() {
        // Second operand would be a type error, but the first is false.
        let data = json!({"n": 1, "s": "text"});
        let and = rule(json!({
            "And": [
                {"Variable": "$.n", "NumericEquals": 2},
                {"Variable": "$.s", "NumericEquals": 5}
            ],
            "Next": "X"
        }));
        assert!(!evaluate(&and, &data).unwrap());
    }

    #[test]
    fn first_matching_rule_wins_in_declared_order() {
        let state = choice_state(json!({
            "Choices": [
                {"Variable": "$.n", "NumericGreaterThan": 0, "Next": "x"},
                {"Variable": "$.n", "NumericGreaterThan": 5, "Next": "y"}
            ]
        }));
        // both rules match; the earlier one must win
        let next = select_next("C", &state, &json!({"n": 10})).unwrap();
        assert_eq!(next, "x");
    }

    #[test]
    fn default_catches_unmatched_input() {
        let state = choice_state(json!({
            "Choices": [
                {"Variable": "$.n", "NumericGreaterThan": 5, "Next": "Big"}
            ],
            "Default": "Small"
        }));
        assert_eq!(select_next("C", &state, &json!({"n": 10})).unwrap(), "Big");
        assert_eq!(select_next("C", &state, &json!({"n": 1})).unwrap(), "Small");
    }

    #[test]
    fn no_match_and_no_default_fails() {
        let state = choice_state(json!({
            "Choices": [
                {"Variable": "$.n", "NumericGreaterThan": 5, "Next": "Big"}
            ]
        }));
        assert!(matches!(
            select_next("C", &state, &json!({"n": 1})),
            Err(ExecutionError::NoMatchingChoice { .. })
        ));
    }

    #[test]
    fn unresolvable_variable_propagates_without_default() {
        let state = choice_state(json!({
            "Choices": [
                {"Variable": "$.missing", "NumericEquals": 1, "Next": "X"}
            ]
        }));
        assert!(matches!(
            select_next("C", &state, &json!({})),
            Err(ExecutionError::Path(_))
        ));
    }

    #[test]
    fn unresolvable_variable_falls_to_default_when_present() {
        let state = choice_state(json!({
            "Choices": [
                {"Variable": "$.missing", "NumericEquals": 1, "Next": "X"}
            ],
            "Default": "Fallback"
        }));
        assert_eq!(select_next("C", &state, &json!({})).unwrap(), "Fallback");
    }

    #[test]
    fn malformed_variable_path_propagates_despite_default() {
        // A typo'd path is a definition bug; the Default must not hide it.
        let state = choice_state(json!({
            "Choices": [
                {"Variable": "$[oops", "NumericEquals": 1, "Next": "X"}
            ],
            "Default": "Fallback"
        }));
        assert!(matches!(
            select_next("C", &state, &json!({"n": 1})),
            Err(ExecutionError::Path(PathError::Malformed { .. }))
        ));
    }
}
