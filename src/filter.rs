use serde_json::{json, Map, Value};

use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// Filter DSL.
//
// Two node shapes, modelled as a discriminated union:
//
//   comparison: {"field": "meta.category", "operator": "==", "value": "x"}
//   logic:      {"operator": "AND", "conditions": [...]}
//
// Field names use dotted payload paths (e.g. `meta.category`). Translation
// to the store-native filter AST is a pure function; both operator sets are
// closed and checked exhaustively, and anything outside them surfaces
// `InvalidFilter`.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
}

impl CompareOp {
    fn parse(raw: &str) -> Result<CompareOp> {
        match raw {
            "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            ">" => Ok(CompareOp::Gt),
            ">=" => Ok(CompareOp::Gte),
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Lte),
            "in" => Ok(CompareOp::In),
            "not in" => Ok(CompareOp::NotIn),
            other => Err(PipelineError::InvalidFilter(format!(
                "unknown comparison operator: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
    Not,
}

impl LogicOp {
    fn parse(raw: &str) -> Result<LogicOp> {
        match raw {
            "AND" => Ok(LogicOp::And),
            "OR" => Ok(LogicOp::Or),
            "NOT" => Ok(LogicOp::Not),
            other => Err(PipelineError::InvalidFilter(format!(
                "unknown logic operator: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Compare {
        field: String,
        operator: CompareOp,
        value: Value,
    },
    Logic {
        operator: LogicOp,
        conditions: Vec<FilterNode>,
    },
}

impl FilterNode {
    pub fn eq(field: &str, value: impl Into<Value>) -> FilterNode {
        FilterNode::Compare {
            field: field.to_string(),
            operator: CompareOp::Eq,
            value: value.into(),
        }
    }

    pub fn and(conditions: Vec<FilterNode>) -> FilterNode {
        FilterNode::Logic {
            operator: LogicOp::And,
            conditions,
        }
    }

    /// Parse a JSON filter node. Rejects nodes that are neither a comparison
    /// nor a logic node, and unknown operators in either position.
    pub fn parse(raw: &Value) -> Result<FilterNode> {
        let obj = raw.as_object().ok_or_else(|| {
            PipelineError::InvalidFilter("filter node must be a JSON object".into())
        })?;

        if obj.contains_key("field") {
            let field = obj
                .get("field")
                .and_then(Value::as_str)
                .ok_or_else(|| PipelineError::InvalidFilter("'field' must be a string".into()))?;
            let operator = obj
                .get("operator")
                .and_then(Value::as_str)
                .ok_or_else(|| PipelineError::InvalidFilter("'operator' must be a string".into()))?;
            let value = obj.get("value").cloned().ok_or_else(|| {
                PipelineError::InvalidFilter(format!("comparison on '{field}' is missing 'value'"))
            })?;
            return Ok(FilterNode::Compare {
                field: field.to_string(),
                operator: CompareOp::parse(operator)?,
                value,
            });
        }

        if obj.contains_key("conditions") {
            let operator = obj
                .get("operator")
                .and_then(Value::as_str)
                .ok_or_else(|| PipelineError::InvalidFilter("'operator' must be a string".into()))?;
            let conditions = obj
                .get("conditions")
                .and_then(Value::as_array)
                .ok_or_else(|| PipelineError::InvalidFilter("'conditions' must be an array".into()))?;
            let parsed: Result<Vec<FilterNode>> = conditions.iter().map(FilterNode::parse).collect();
            return Ok(FilterNode::Logic {
                operator: LogicOp::parse(operator)?,
                conditions: parsed?,
            });
        }

        Err(PipelineError::InvalidFilter(
            "filter node must carry either 'field' or 'conditions'".into(),
        ))
    }

    /// Translate to the store-native filter AST (a JSON object with `must`,
    /// `must_not`, and `should` condition arrays).
    pub fn to_store_filter(&self) -> Result<Value> {
        match self {
            FilterNode::Compare {
                field,
                operator,
                value,
            } => translate_comparison(field, *operator, value),
            FilterNode::Logic {
                operator,
                conditions,
            } => {
                let children: Result<Vec<Value>> =
                    conditions.iter().map(FilterNode::to_store_filter).collect();
                let children = children?;
                match operator {
                    LogicOp::And => Ok(merge_and(children)),
                    LogicOp::Or => Ok(json!({ "should": children })),
                    LogicOp::Not => Ok(negate(children)),
                }
            }
        }
    }
}

fn as_list(value: &Value) -> Value {
    match value {
        Value::Array(_) => value.clone(),
        other => json!([other]),
    }
}

fn translate_comparison(field: &str, operator: CompareOp, value: &Value) -> Result<Value> {
    let condition = |body: Value| json!({ "key": field, "match": body });
    let range = |bound: &str| {
        let mut body = Map::new();
        body.insert(bound.to_string(), value.clone());
        json!({ "key": field, "range": body })
    };

    Ok(match operator {
        CompareOp::Eq => json!({ "must": [condition(json!({ "value": value }))] }),
        CompareOp::Ne => json!({ "must_not": [condition(json!({ "value": value }))] }),
        CompareOp::Gt => json!({ "must": [range("gt")] }),
        CompareOp::Gte => json!({ "must": [range("gte")] }),
        CompareOp::Lt => json!({ "must": [range("lt")] }),
        CompareOp::Lte => json!({ "must": [range("lte")] }),
        CompareOp::In => json!({ "must": [condition(json!({ "any": as_list(value) }))] }),
        CompareOp::NotIn => json!({ "must_not": [condition(json!({ "any": as_list(value) }))] }),
    })
}

fn take_array(obj: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// AND: merge the children's must / must_not / should arrays.
fn merge_and(children: Vec<Value>) -> Value {
    let mut must = Vec::new();
    let mut must_not = Vec::new();
    let mut should = Vec::new();

    for child in children {
        if let Value::Object(mut obj) = child {
            must.extend(take_array(&mut obj, "must"));
            must_not.extend(take_array(&mut obj, "must_not"));
            should.extend(take_array(&mut obj, "should"));
        }
    }

    let mut out = Map::new();
    if !must.is_empty() {
        out.insert("must".into(), Value::Array(must));
    }
    if !must_not.is_empty() {
        out.insert("must_not".into(), Value::Array(must_not));
    }
    if !should.is_empty() {
        out.insert("should".into(), Value::Array(should));
    }
    Value::Object(out)
}

/// NOT: flip must and must_not. A single child with only `must` becomes
/// `must_not` (and vice versa, for double negation); anything more complex is
/// wrapped whole under `must_not`.
fn negate(children: Vec<Value>) -> Value {
    if children.len() == 1 {
        if let Value::Object(mut obj) = children[0].clone() {
            let must = take_array(&mut obj, "must");
            let must_not = take_array(&mut obj, "must_not");
            if !must.is_empty() && must_not.is_empty() && obj.is_empty() {
                return json!({ "must_not": must });
            }
            if !must_not.is_empty() && must.is_empty() && obj.is_empty() {
                return json!({ "must": must_not });
            }
        }
    }
    json!({ "must_not": children })
}

/// Parse-and-translate an optional JSON filter argument in one step.
pub fn translate_optional(raw: Option<&Value>) -> Result<Option<Value>> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(FilterNode::parse(v)?.to_store_filter()?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_becomes_must_match() {
        let node = FilterNode::parse(&json!({
            "field": "meta.category", "operator": "==", "value": "user_rule"
        }))
        .unwrap();
        let f = node.to_store_filter().unwrap();
        assert_eq!(
            f,
            json!({ "must": [{ "key": "meta.category", "match": { "value": "user_rule" } }] })
        );
    }

    #[test]
    fn inequality_becomes_must_not() {
        let node = FilterNode::parse(&json!({
            "field": "meta.status", "operator": "!=", "value": "deprecated"
        }))
        .unwrap();
        let f = node.to_store_filter().unwrap();
        assert!(f.get("must").is_none());
        assert_eq!(f["must_not"][0]["key"], "meta.status");
    }

    #[test]
    fn range_operators_translate_to_range_conditions() {
        for (op, bound) in [(">", "gt"), (">=", "gte"), ("<", "lt"), ("<=", "lte")] {
            let node = FilterNode::parse(&json!({
                "field": "meta.chunk_index", "operator": op, "value": 3
            }))
            .unwrap();
            let f = node.to_store_filter().unwrap();
            assert_eq!(f["must"][0]["range"][bound], 3, "operator {op}");
        }
    }

    #[test]
    fn in_operator_wraps_scalar_into_any_list() {
        let node = FilterNode::parse(&json!({
            "field": "meta.category", "operator": "in", "value": "user_rule"
        }))
        .unwrap();
        let f = node.to_store_filter().unwrap();
        assert_eq!(f["must"][0]["match"]["any"], json!(["user_rule"]));
    }

    #[test]
    fn and_merges_child_arrays_and_not_flips() {
        // The canonical translation check: AND(category == user_rule,
        // NOT(status == deprecated)) puts the category match under `must`
        // and the status match under `must_not`.
        let node = FilterNode::parse(&json!({
            "operator": "AND",
            "conditions": [
                { "field": "meta.category", "operator": "==", "value": "user_rule" },
                { "operator": "NOT", "conditions": [
                    { "field": "meta.status", "operator": "==", "value": "deprecated" }
                ]}
            ]
        }))
        .unwrap();
        let f = node.to_store_filter().unwrap();
        assert_eq!(f["must"][0]["key"], "meta.category");
        assert_eq!(f["must"][0]["match"]["value"], "user_rule");
        assert_eq!(f["must_not"][0]["key"], "meta.status");
        assert_eq!(f["must_not"][0]["match"]["value"], "deprecated");
    }

    #[test]
    fn or_produces_should() {
        let node = FilterNode::parse(&json!({
            "operator": "OR",
            "conditions": [
                { "field": "meta.category", "operator": "==", "value": "design_doc" },
                { "field": "meta.category", "operator": "==", "value": "other" }
            ]
        }))
        .unwrap();
        let f = node.to_store_filter().unwrap();
        assert_eq!(f["should"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn double_negation_restores_must() {
        let node = FilterNode::parse(&json!({
            "operator": "NOT",
            "conditions": [
                { "operator": "NOT", "conditions": [
                    { "field": "meta.status", "operator": "==", "value": "active" }
                ]}
            ]
        }))
        .unwrap();
        let f = node.to_store_filter().unwrap();
        assert_eq!(f["must"][0]["key"], "meta.status");
    }

    #[test]
    fn unknown_operator_is_invalid_filter() {
        let err = FilterNode::parse(&json!({
            "field": "meta.category", "operator": "~=", "value": "x"
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "InvalidFilter");

        let err = FilterNode::parse(&json!({
            "operator": "XOR", "conditions": []
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "InvalidFilter");
    }

    #[test]
    fn malformed_node_is_invalid_filter() {
        let err = FilterNode::parse(&json!({ "operator": "==" })).unwrap_err();
        assert_eq!(err.kind(), "InvalidFilter");
        let err = FilterNode::parse(&json!("meta.category == x")).unwrap_err();
        assert_eq!(err.kind(), "InvalidFilter");
    }
}
