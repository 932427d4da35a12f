use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::NodeId;

type GuardFn = Box<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Predicate over a node's output, erased to check against any output type.
pub struct Guard {
    check: GuardFn,
    type_id: TypeId,
    type_name: &'static str,
}

impl Guard {
    pub fn new<O, F>(predicate: F) -> Self
    where
        O: 'static,
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        Self {
            check: Box::new(move |value: &dyn Any| value.downcast_ref::<O>().is_some_and(&predicate)),
            type_id: TypeId::of::<O>(),
            type_name: type_name::<O>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn accepts(&self, output: &dyn Any) -> bool {
        (self.check)(output)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard<{}>", self.type_name)
    }
}

/// Outgoing transition of a node. Transitions are evaluated in declaration
/// order and the first accepting one is taken.
#[derive(Debug)]
pub struct Advancer {
    target: NodeId,
    guard: Option<Guard>,
    label: Option<String>,
}

impl Advancer {
    pub(crate) fn new(target: NodeId, guard: Option<Guard>, label: Option<String>) -> Self {
        Self {
            target,
            guard,
            label,
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }

    /// Unguarded transitions accept every output.
    pub fn accepts(&self, output: &dyn Any) -> bool {
        self.guard.as_ref().map_or(true, |g| g.accepts(output))
    }
}

/// Transition between two nodes of a declarative graph file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: EdgeCondition,
    #[serde(default)]
    pub label: Option<String>,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    #[default]
    Always,
    /// Evaluated against the handoff data the source node produced.
    /// See [`evaluate_condition`].
    Conditional { expr: String },
}

impl Edge {
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
            label: None,
        }
    }

    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Conditional { expr: expr.into() },
            label: None,
        }
    }

    /// Label shown in events and traces; defaults to the expression.
    pub fn display_label(&self) -> Option<String> {
        self.label.clone().or_else(|| match &self.condition {
            EdgeCondition::Always => None,
            EdgeCondition::Conditional { expr } => Some(expr.clone()),
        })
    }
}

/// Evaluate a simple conditional expression against handoff data.
///
/// Supported expressions:
/// - `key == "value"` and `key != "value"`
/// - `key contains "substr"`
/// - `key < 3`, `key <= 3`, `key > 3`, `key >= 3` (numeric)
///
/// Non-string values compare by their JSON rendering, so `approved == true`
/// matches a boolean. Returns `false` for unparseable expressions and for
/// missing keys.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return lookup(context, key).is_some_and(|s| s.contains(substr));
    }
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup(context, key).is_some_and(|s| s != value);
    }
    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup(context, key).is_some_and(|s| s == value);
    }
    for op in [">=", "<=", ">", "<"] {
        if let Some((key, value)) = parse_operator(expr, op) {
            let (Some(lhs), Ok(rhs)) = (numeric(context, key), value.parse::<f64>()) else {
                return false;
            };
            return match op {
                ">=" => lhs >= rhs,
                "<=" => lhs <= rhs,
                ">" => lhs > rhs,
                _ => lhs < rhs,
            };
        }
    }
    false
}

fn lookup(context: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    context.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn numeric(context: &HashMap<String, serde_json::Value>, key: &str) -> Option<f64> {
    match context.get(key)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn guard_checks_only_its_own_type() {
        let guard = Guard::new(|n: &u32| *n > 2);
        assert!(guard.accepts(&5u32));
        assert!(!guard.accepts(&1u32));
        assert!(!guard.accepts(&"five"));
        assert_eq!(guard.type_id(), TypeId::of::<u32>());
    }

    #[test]
    fn unguarded_advancer_accepts_anything() {
        let advancer = Advancer::new(NodeId(0), None, None);
        assert!(advancer.accepts(&()));
        assert!(!advancer.is_guarded());
    }

    #[test]
    fn equality_conditions() {
        let data = ctx(&[("status", json!("success")), ("approved", json!(true))]);
        assert!(evaluate_condition(r#"status == "success""#, &data));
        assert!(!evaluate_condition(r#"status == "failure""#, &data));
        assert!(evaluate_condition(r#"status != "failure""#, &data));
        assert!(evaluate_condition("approved == true", &data));
        assert!(!evaluate_condition("approved != true", &data));
    }

    #[test]
    fn contains_condition() {
        let data = ctx(&[("output", json!("The file was created successfully."))]);
        assert!(evaluate_condition(r#"output contains "created""#, &data));
        assert!(!evaluate_condition(r#"output contains "deleted""#, &data));
    }

    #[test]
    fn numeric_conditions() {
        let data = ctx(&[("draft_visits", json!(2)), ("score", json!("7.5"))]);
        assert!(evaluate_condition("draft_visits < 3", &data));
        assert!(!evaluate_condition("draft_visits >= 3", &data));
        assert!(evaluate_condition("score > 7", &data));
        assert!(evaluate_condition("score <= 7.5", &data));
        assert!(!evaluate_condition("score < abc", &data));
    }

    #[test]
    fn missing_key_or_garbage_is_false() {
        let data = HashMap::new();
        assert!(!evaluate_condition(r#"missing == "value""#, &data));
        assert!(!evaluate_condition("missing < 3", &data));
        assert!(!evaluate_condition("this is not valid", &data));
        assert!(!evaluate_condition(r#"== "x""#, &data));
    }

    #[test]
    fn label_defaults_to_expression() {
        let edge = Edge::conditional("a", "b", r#"ok == "yes""#);
        assert_eq!(edge.display_label().as_deref(), Some(r#"ok == "yes""#));
        assert_eq!(Edge::always("a", "b").display_label(), None);
    }
}
