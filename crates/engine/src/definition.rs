//! Core definition model: one or more named state machines, validated at
//! load time and immutable afterwards.
//!
//! These types are the source of truth for what a state machine looks like
//! in memory.  They deserialize from the Amazon-States-Language-shaped JSON
//! document the configuration loader supplies.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::Value;
use tasks::HandlerRef;

use crate::choice::rule_kind;
use crate::error::DefinitionError;
use crate::paths::PathSpec;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One named step in the graph, closed over the seven ASL state types.
/// Exhaustive matching in the driver replaces the original's runtime string
/// dispatch; an unknown `Type` is a load error, not a silent fall-through.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type")]
pub enum State {
    Task(TaskState),
    Pass(PassState),
    Wait(WaitState),
    Choice(ChoiceState),
    Succeed(SucceedState),
    Fail(FailState),
    Parallel(ParallelState),
}

impl State {
    pub fn kind(&self) -> &'static str {
        match self {
            State::Task(_) => "Task",
            State::Pass(_) => "Pass",
            State::Wait(_) => "Wait",
            State::Choice(_) => "Choice",
            State::Succeed(_) => "Succeed",
            State::Fail(_) => "Fail",
            State::Parallel(_) => "Parallel",
        }
    }

    /// The state's `InputPath`; every state scopes its input before acting.
    pub fn input_path(&self) -> &PathSpec {
        match self {
            State::Task(s) => &s.input_path,
            State::Pass(s) => &s.input_path,
            State::Wait(s) => &s.input_path,
            State::Choice(s) => &s.input_path,
            State::Succeed(s) => &s.input_path,
            State::Fail(_) | State::Parallel(_) => &PathSpec::Identity,
        }
    }

    pub fn next(&self) -> Option<&str> {
        match self {
            State::Task(s) => s.next.as_deref(),
            State::Pass(s) => s.next.as_deref(),
            State::Wait(s) => s.next.as_deref(),
            State::Parallel(s) => s.next.as_deref(),
            State::Choice(_) | State::Succeed(_) | State::Fail(_) => None,
        }
    }

    pub fn is_end(&self) -> bool {
        match self {
            State::Task(s) => s.end,
            State::Pass(s) => s.end,
            State::Wait(s) => s.end,
            State::Parallel(s) => s.end,
            State::Choice(_) | State::Succeed(_) | State::Fail(_) => false,
        }
    }
}

/// `Type: Task` — invokes a user handler in an isolated worker.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskState {
    /// `module.function` reference resolved by the invoker.
    #[serde(rename = "Handler", alias = "handler", alias = "Resource")]
    pub handler: HandlerRef,
    /// Per-task timeout; overrides the executor's configured default.
    #[serde(rename = "TimeoutSeconds")]
    pub timeout_seconds: Option<u64>,
    #[serde(rename = "Next")]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(rename = "InputPath", default)]
    pub input_path: PathSpec,
    #[serde(rename = "ResultPath", default)]
    pub result_path: PathSpec,
    #[serde(rename = "OutputPath", default)]
    pub output_path: PathSpec,
    #[serde(rename = "Comment")]
    pub comment: Option<String>,
}

/// `Type: Pass` — no action; its input (or a literal `Result`) flows through
/// the transform pipeline unchanged.
#[derive(Debug, Clone, Deserialize)]
pub struct PassState {
    #[serde(rename = "Result")]
    pub result: Option<Value>,
    #[serde(rename = "Next")]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(rename = "InputPath", default)]
    pub input_path: PathSpec,
    #[serde(rename = "ResultPath", default)]
    pub result_path: PathSpec,
    #[serde(rename = "OutputPath", default)]
    pub output_path: PathSpec,
    #[serde(rename = "Comment")]
    pub comment: Option<String>,
}

/// `Type: Wait` — delays the execution; exactly one duration field.
#[derive(Debug, Clone, Deserialize)]
pub struct WaitState {
    #[serde(rename = "Seconds")]
    pub seconds: Option<f64>,
    #[serde(rename = "SecondsPath")]
    pub seconds_path: Option<String>,
    /// RFC 3339 timestamp literal.
    #[serde(rename = "Timestamp")]
    pub timestamp: Option<String>,
    #[serde(rename = "TimestampPath")]
    pub timestamp_path: Option<String>,
    #[serde(rename = "Next")]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(rename = "InputPath", default)]
    pub input_path: PathSpec,
    #[serde(rename = "OutputPath", default)]
    pub output_path: PathSpec,
    #[serde(rename = "Comment")]
    pub comment: Option<String>,
}

impl WaitState {
    /// How many of the four duration fields are set.
    pub fn duration_field_count(&self) -> usize {
        [
            self.seconds.is_some(),
            self.seconds_path.is_some(),
            self.timestamp.is_some(),
            self.timestamp_path.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// `Type: Choice` — branching; first matching rule wins, `Default` catches
/// the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceState {
    #[serde(rename = "Choices")]
    pub choices: Vec<ChoiceRule>,
    #[serde(rename = "Default")]
    pub default: Option<String>,
    #[serde(rename = "InputPath", default)]
    pub input_path: PathSpec,
    #[serde(rename = "Comment")]
    pub comment: Option<String>,
}

/// `Type: Succeed` — terminal success.
#[derive(Debug, Clone, Deserialize)]
pub struct SucceedState {
    #[serde(rename = "InputPath", default)]
    pub input_path: PathSpec,
    #[serde(rename = "Comment")]
    pub comment: Option<String>,
}

/// `Type: Fail` — terminal failure with optional diagnostics.
#[derive(Debug, Clone, Deserialize)]
pub struct FailState {
    #[serde(rename = "Error")]
    pub error: Option<String>,
    #[serde(rename = "Cause")]
    pub cause: Option<String>,
    #[serde(rename = "Comment")]
    pub comment: Option<String>,
}

/// `Type: Parallel` — recognized but unsupported; reaching one fails the
/// execution explicitly instead of silently doing nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct ParallelState {
    #[serde(rename = "Next")]
    pub next: Option<String>,
    #[serde(rename = "End", default)]
    pub end: bool,
    #[serde(rename = "Comment")]
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// ChoiceRule
// ---------------------------------------------------------------------------

/// One rule in a Choice state: either a comparison leaf (`Variable` +
/// exactly one comparator key) or an `And`/`Or`/`Not` combinator over nested
/// rules.  Structural correctness is checked by `Definitions::load`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceRule {
    #[serde(rename = "Variable")]
    pub variable: Option<String>,
    #[serde(rename = "Next")]
    pub next: Option<String>,
    #[serde(rename = "And")]
    pub and: Option<Vec<ChoiceRule>>,
    #[serde(rename = "Or")]
    pub or: Option<Vec<ChoiceRule>>,
    #[serde(rename = "Not")]
    pub not: Option<Box<ChoiceRule>>,
    /// Whatever keys remain are comparator candidates, e.g.
    /// `"NumericGreaterThan": 5`.  A leaf must have exactly one.
    #[serde(flatten)]
    pub comparators: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// StateMachine / Definitions
// ---------------------------------------------------------------------------

/// One named state machine: a start state plus the state graph.
#[derive(Debug, Clone, Deserialize)]
pub struct StateMachine {
    #[serde(rename = "StartAt")]
    pub start_at: String,
    #[serde(rename = "States")]
    pub states: HashMap<String, State>,
    #[serde(rename = "Comment")]
    pub comment: Option<String>,
    #[serde(rename = "Version")]
    pub version: Option<String>,
}

impl StateMachine {
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }
}

/// The validated, immutable definition table: machine name → machine.
/// Safe for concurrent reads by any number of in-flight executions; share
/// it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Definitions {
    machines: HashMap<String, StateMachine>,
}

impl Definitions {
    /// Parse and validate a definitions document.
    ///
    /// # Errors
    /// Returns the first [`DefinitionError`] found: malformed JSON, a
    /// dangling `StartAt`/`Next`/`Default`, an invalid choice rule, a Wait
    /// state without a duration, or a bad Next/End combination.
    pub fn load(raw: &str) -> Result<Self, DefinitionError> {
        let document: Value = serde_json::from_str(raw)?;
        Self::from_value(document)
    }

    /// Like [`Definitions::load`] but from an already-parsed document.
    ///
    /// Accepts both the bare `{machine: {StartAt, States}}` map and the
    /// wrapped shape deployment tooling emits
    /// (`{"stateMachines": {machine: {"definition": {...}}}}`).
    pub fn from_value(document: Value) -> Result<Self, DefinitionError> {
        let root = match document {
            Value::Object(mut map) => match map.remove("stateMachines") {
                Some(inner) => inner,
                None => Value::Object(map),
            },
            other => other,
        };

        let root = match root {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(name, mut machine)| {
                        if let Some(definition) = machine
                            .as_object_mut()
                            .and_then(|m| m.remove("definition"))
                        {
                            (name, definition)
                        } else {
                            (name, machine)
                        }
                    })
                    .collect(),
            ),
            other => other,
        };

        let machines: HashMap<String, StateMachine> = serde_json::from_value(root)?;
        let definitions = Self { machines };
        definitions.validate()?;
        Ok(definitions)
    }

    pub fn machine(&self, name: &str) -> Option<&StateMachine> {
        self.machines.get(name)
    }

    pub fn machine_names(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }

    /// Fetch one state node, as the driver does every step.
    pub fn state(&self, machine: &str, state: &str) -> Option<&State> {
        self.machines.get(machine).and_then(|m| m.state(state))
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        for (machine_name, machine) in &self.machines {
            if !machine.states.contains_key(&machine.start_at) {
                return Err(DefinitionError::MissingStartState {
                    machine: machine_name.clone(),
                    start_at: machine.start_at.clone(),
                });
            }

            for (state_name, state) in &machine.states {
                validate_state(machine_name, machine, state_name, state)?;
            }
        }
        Ok(())
    }
}

fn validate_state(
    machine_name: &str,
    machine: &StateMachine,
    state_name: &str,
    state: &State,
) -> Result<(), DefinitionError> {
    let check_target = |target: &str| -> Result<(), DefinitionError> {
        if machine.states.contains_key(target) {
            Ok(())
        } else {
            Err(DefinitionError::DanglingTransition {
                machine: machine_name.to_owned(),
                state: state_name.to_owned(),
                target: target.to_owned(),
            })
        }
    };

    match state {
        State::Succeed(_) | State::Fail(_) => {}

        State::Choice(choice) => {
            if let Some(default) = &choice.default {
                check_target(default)?;
            }
            for rule in &choice.choices {
                validate_rule(machine_name, state_name, rule, true)?;
                if let Some(next) = &rule.next {
                    check_target(next)?;
                }
            }
        }

        State::Task(_) | State::Pass(_) | State::Wait(_) | State::Parallel(_) => {
            // Exactly one of Next / End.
            if state.next().is_some() == state.is_end() {
                return Err(DefinitionError::InvalidTransition {
                    machine: machine_name.to_owned(),
                    state: state_name.to_owned(),
                });
            }
            if let Some(next) = state.next() {
                check_target(next)?;
            }
            if let State::Wait(wait) = state {
                if wait.duration_field_count() != 1 {
                    return Err(DefinitionError::InvalidWait {
                        machine: machine_name.to_owned(),
                        state: state_name.to_owned(),
                    });
                }
            }
        }
    }

    Ok(())
}

fn validate_rule(
    machine_name: &str,
    state_name: &str,
    rule: &ChoiceRule,
    top_level: bool,
) -> Result<(), DefinitionError> {
    let invalid = |detail: String| DefinitionError::InvalidChoiceRule {
        machine: machine_name.to_owned(),
        state: state_name.to_owned(),
        detail,
    };

    if top_level && rule.next.is_none() {
        return Err(invalid("top-level rule is missing Next".into()));
    }

    // rule_kind enforces the leaf/combinator invariants.
    let kind = rule_kind(rule).map_err(invalid)?;
    for nested in kind.nested_rules() {
        validate_rule(machine_name, state_name, nested, false)?;
    }
    Ok(())
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(document: Value) -> Result<Definitions, DefinitionError> {
        Definitions::from_value(document)
    }

    #[test]
    fn minimal_machine_loads_and_walks() {
        let defs = load(json!({
            "demo": {
                "StartAt": "A",
                "States": {
                    "A": { "Type": "Pass", "Next": "B" },
                    "B": { "Type": "Succeed" }
                }
            }
        }))
        .expect("definition should be valid");

        let machine = defs.machine("demo").expect("machine exists");
        assert_eq!(machine.start_at, "A");
        assert!(matches!(defs.state("demo", "A"), Some(State::Pass(_))));
        assert!(matches!(defs.state("demo", "B"), Some(State::Succeed(_))));
        assert!(defs.state("demo", "C").is_none());
    }

    #[test]
    fn wrapped_document_shape_is_accepted() {
        let defs = load(json!({
            "stateMachines": {
                "wrapped": {
                    "definition": {
                        "StartAt": "Only",
                        "States": { "Only": { "Type": "Succeed" } }
                    }
                }
            }
        }))
        .expect("wrapped shape should load");
        assert!(defs.machine("wrapped").is_some());
    }

    #[test]
    fn missing_start_state_is_rejected() {
        let err = load(json!({
            "demo": {
                "StartAt": "Ghost",
                "States": { "A": { "Type": "Succeed" } }
            }
        }))
        .expect_err("start state does not exist");
        assert!(matches!(err, DefinitionError::MissingStartState { .. }));
    }

    #[test]
    fn dangling_next_is_rejected() {
        let err = load(json!({
            "demo": {
                "StartAt": "A",
                "States": { "A": { "Type": "Pass", "Next": "Ghost" } }
            }
        }))
        .expect_err("Next references a missing state");
        assert!(matches!(
            err,
            DefinitionError::DanglingTransition { target, .. } if target == "Ghost"
        ));
    }

    #[test]
    fn dangling_choice_default_is_rejected() {
        let err = load(json!({
            "demo": {
                "StartAt": "C",
                "States": {
                    "C": {
                        "Type": "Choice",
                        "Choices": [
                            { "Variable": "$.n", "NumericEquals": 1, "Next": "C" }
                        ],
                        "Default": "Ghost"
                    }
                }
            }
        }))
        .expect_err("Default references a missing state");
        assert!(matches!(err, DefinitionError::DanglingTransition { .. }));
    }

    #[test]
    fn unknown_state_type_is_a_parse_error() {
        let err = load(json!({
            "demo": {
                "StartAt": "A",
                "States": { "A": { "Type": "Teleport", "Next": "A" } }
            }
        }))
        .expect_err("unknown Type must not load");
        assert!(matches!(err, DefinitionError::Parse(_)));
    }

    #[test]
    fn leaf_with_two_comparators_is_rejected() {
        let err = load(json!({
            "demo": {
                "StartAt": "C",
                "States": {
                    "C": {
                        "Type": "Choice",
                        "Choices": [{
                            "Variable": "$.n",
                            "NumericEquals": 1,
                            "StringEquals": "1",
                            "Next": "Done"
                        }]
                    },
                    "Done": { "Type": "Succeed" }
                }
            }
        }))
        .expect_err("two comparator keys on one leaf");
        assert!(matches!(err, DefinitionError::InvalidChoiceRule { .. }));
    }

    #[test]
    fn leaf_with_no_comparator_is_rejected() {
        let err = load(json!({
            "demo": {
                "StartAt": "C",
                "States": {
                    "C": {
                        "Type": "Choice",
                        "Choices": [{ "Variable": "$.n", "Next": "Done" }]
                    },
                    "Done": { "Type": "Succeed" }
                }
            }
        }))
        .expect_err("leaf without a comparator");
        assert!(matches!(err, DefinitionError::InvalidChoiceRule { .. }));
    }

    #[test]
    fn wait_without_duration_field_is_rejected() {
        let err = load(json!({
            "demo": {
                "StartAt": "W",
                "States": {
                    "W": { "Type": "Wait", "Next": "Done" },
                    "Done": { "Type": "Succeed" }
                }
            }
        }))
        .expect_err("Wait must carry a duration");
        assert!(matches!(err, DefinitionError::InvalidWait { .. }));
    }

    #[test]
    fn next_and_end_together_are_rejected() {
        let err = load(json!({
            "demo": {
                "StartAt": "A",
                "States": {
                    "A": { "Type": "Pass", "Next": "B", "End": true },
                    "B": { "Type": "Succeed" }
                }
            }
        }))
        .expect_err("Next and End are mutually exclusive");
        assert!(matches!(err, DefinitionError::InvalidTransition { .. }));
    }

    #[test]
    fn neither_next_nor_end_is_rejected() {
        let err = load(json!({
            "demo": {
                "StartAt": "A",
                "States": { "A": { "Type": "Pass" } }
            }
        }))
        .expect_err("non-terminal state must transition somewhere");
        assert!(matches!(err, DefinitionError::InvalidTransition { .. }));
    }

    #[test]
    fn handler_field_accepts_all_spellings() {
        for field in ["Handler", "handler", "Resource"] {
            let defs = load(json!({
                "demo": {
                    "StartAt": "T",
                    "States": {
                        "T": { "Type": "Task", field: "mod.func", "End": true }
                    }
                }
            }))
            .unwrap_or_else(|e| panic!("'{field}' spelling should load: {e}"));

            match defs.state("demo", "T") {
                Some(State::Task(task)) => {
                    assert_eq!(task.handler.module, "mod");
                    assert_eq!(task.handler.function, "func");
                }
                other => panic!("expected Task state, got {other:?}"),
            }
        }
    }

    #[test]
    fn nested_combinator_rules_validate_recursively() {
        // A "Not" wrapping a leaf with two comparators must be caught.
        let err = load(json!({
            "demo": {
                "StartAt": "C",
                "States": {
                    "C": {
                        "Type": "Choice",
                        "Choices": [{
                            "Not": {
                                "Variable": "$.n",
                                "NumericEquals": 1,
                                "BooleanEquals": true
                            },
                            "Next": "Done"
                        }]
                    },
                    "Done": { "Type": "Succeed" }
                }
            }
        }))
        .expect_err("nested leaf is invalid");
        assert!(matches!(err, DefinitionError::InvalidChoiceRule { .. }));
    }
}
