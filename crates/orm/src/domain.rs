//! Search domains.
//!
//! Wire form is prefix notation: `"&"`, `"|"` and `"!"` operators followed by
//! their operands, leaves `[path, operator, value]`, and an implicit AND
//! between the top-level terms. `[1, "=", 1]` and `[0, "=", 1]` are the
//! constant true and false leaves.

use std::fmt;
use std::str::FromStr;

use serde_json::{Value as JsonValue, json};
use strata_core::{OrmError, OrmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Like,
    NotLike,
    ILike,
    NotILike,
    EqLike,
    EqILike,
    ChildOf,
    ParentOf,
    Any,
    NotAny,
}

impl Operator {
    pub const ALL: [Operator; 18] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Lt,
        Operator::Le,
        Operator::Gt,
        Operator::Ge,
        Operator::In,
        Operator::NotIn,
        Operator::Like,
        Operator::NotLike,
        Operator::ILike,
        Operator::NotILike,
        Operator::EqLike,
        Operator::EqILike,
        Operator::ChildOf,
        Operator::ParentOf,
        Operator::Any,
        Operator::NotAny,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::Like => "like",
            Operator::NotLike => "not like",
            Operator::ILike => "ilike",
            Operator::NotILike => "not ilike",
            Operator::EqLike => "=like",
            Operator::EqILike => "=ilike",
            Operator::ChildOf => "child_of",
            Operator::ParentOf => "parent_of",
            Operator::Any => "any",
            Operator::NotAny => "not any",
        }
    }

    /// The operator selecting exactly the complement, nulls included.
    ///
    /// Ordering operators have no such counterpart under null semantics.
    pub fn negate(self) -> Option<Operator> {
        Some(match self {
            Operator::Eq => Operator::Ne,
            Operator::Ne => Operator::Eq,
            Operator::In => Operator::NotIn,
            Operator::NotIn => Operator::In,
            Operator::Like => Operator::NotLike,
            Operator::NotLike => Operator::Like,
            Operator::ILike => Operator::NotILike,
            Operator::NotILike => Operator::ILike,
            Operator::Any => Operator::NotAny,
            Operator::NotAny => Operator::Any,
            _ => return None,
        })
    }

    /// Operators selecting the complement of a positive match.
    pub fn is_negative(self) -> bool {
        matches!(
            self,
            Operator::Ne | Operator::NotIn | Operator::NotLike | Operator::NotILike | Operator::NotAny
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = OrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            other => Operator::ALL
                .into_iter()
                .find(|op| op.as_str() == other)
                .ok_or_else(|| OrmError::validation(format!("invalid domain operator '{s}'")))?,
        };
        Ok(op)
    }
}

/// Boolean tree over `(path, operator, value)` leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    True,
    False,
    And(Vec<Domain>),
    Or(Vec<Domain>),
    Not(Box<Domain>),
    Leaf {
        path: String,
        op: Operator,
        value: JsonValue,
    },
}

impl Default for Domain {
    fn default() -> Self {
        Domain::True
    }
}

impl Domain {
    pub fn leaf(path: impl Into<String>, op: Operator, value: impl Into<JsonValue>) -> Self {
        Domain::Leaf {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    pub fn and(items: impl IntoIterator<Item = Domain>) -> Self {
        let mut flat = Vec::new();
        for item in items {
            match item {
                Domain::True => {}
                Domain::False => return Domain::False,
                Domain::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Domain::True,
            1 => flat.pop().unwrap_or(Domain::True),
            _ => Domain::And(flat),
        }
    }

    pub fn or(items: impl IntoIterator<Item = Domain>) -> Self {
        let mut flat = Vec::new();
        for item in items {
            match item {
                Domain::False => {}
                Domain::True => return Domain::True,
                Domain::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Domain::False,
            1 => flat.pop().unwrap_or(Domain::False),
            _ => Domain::Or(flat),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(domain: Domain) -> Self {
        match domain {
            Domain::True => Domain::False,
            Domain::False => Domain::True,
            Domain::Not(inner) => *inner,
            other => Domain::Not(Box::new(other)),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Domain::True)
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Domain::False)
    }

    /// Whether any leaf filters on `field` (as the first segment of its path).
    pub fn mentions(&self, field: &str) -> bool {
        match self {
            Domain::True | Domain::False => false,
            Domain::And(items) | Domain::Or(items) => items.iter().any(|d| d.mentions(field)),
            Domain::Not(inner) => inner.mentions(field),
            Domain::Leaf { path, .. } => path.split('.').next() == Some(field),
        }
    }

    /// Field paths of every leaf, in order.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Domain::True | Domain::False => Vec::new(),
            Domain::And(items) | Domain::Or(items) => items.iter().flat_map(Domain::paths).collect(),
            Domain::Not(inner) => inner.paths(),
            Domain::Leaf { path, .. } => vec![path.as_str()],
        }
    }

    /// Push negations down to the leaves and flatten nested AND/OR.
    pub fn normalize(self) -> Domain {
        match self {
            Domain::And(items) => Domain::and(items.into_iter().map(Domain::normalize)),
            Domain::Or(items) => Domain::or(items.into_iter().map(Domain::normalize)),
            Domain::Not(inner) => match *inner {
                Domain::True => Domain::False,
                Domain::False => Domain::True,
                Domain::Not(x) => x.normalize(),
                Domain::And(items) => Domain::or(
                    items
                        .into_iter()
                        .map(|d| Domain::Not(Box::new(d)).normalize()),
                ),
                Domain::Or(items) => Domain::and(
                    items
                        .into_iter()
                        .map(|d| Domain::Not(Box::new(d)).normalize()),
                ),
                Domain::Leaf { path, op, value } => match op.negate() {
                    Some(neg) => Domain::Leaf {
                        path,
                        op: neg,
                        value,
                    },
                    None => Domain::Not(Box::new(Domain::Leaf { path, op, value })),
                },
            },
            other => other,
        }
    }

    /// Parse the JSON prefix notation.
    pub fn from_json(value: &JsonValue) -> OrmResult<Domain> {
        let items = match value {
            JsonValue::Null | JsonValue::Bool(false) => return Ok(Domain::True),
            JsonValue::Array(items) => items,
            other => {
                return Err(OrmError::validation(format!(
                    "a domain must be a list, got {other}"
                )));
            }
        };

        // Reading right to left, every operator finds its operands on the stack.
        let mut stack: Vec<Domain> = Vec::new();
        for item in items.iter().rev() {
            match item {
                JsonValue::String(op) if op == "&" || op == "|" => {
                    let (Some(a), Some(b)) = (stack.pop(), stack.pop()) else {
                        return Err(OrmError::validation(format!(
                            "domain operator '{op}' needs two operands"
                        )));
                    };
                    stack.push(if op == "&" {
                        Domain::and([a, b])
                    } else {
                        Domain::or([a, b])
                    });
                }
                JsonValue::String(op) if op == "!" => {
                    let Some(a) = stack.pop() else {
                        return Err(OrmError::validation("domain operator '!' needs an operand"));
                    };
                    stack.push(Domain::not(a));
                }
                JsonValue::Array(leaf) => stack.push(Self::parse_leaf(leaf)?),
                other => {
                    return Err(OrmError::validation(format!("invalid domain term {other}")));
                }
            }
        }
        stack.reverse();
        Ok(Domain::and(stack))
    }

    fn parse_leaf(leaf: &[JsonValue]) -> OrmResult<Domain> {
        let [left, op, right] = leaf else {
            return Err(OrmError::validation(format!(
                "a domain leaf has three elements, got {}",
                leaf.len()
            )));
        };
        let op_str = op
            .as_str()
            .ok_or_else(|| OrmError::validation(format!("invalid domain operator {op}")))?;
        match (left, op_str, right) {
            (JsonValue::Number(a), "=", JsonValue::Number(b)) if a.as_i64() == Some(1) && b.as_i64() == Some(1) => {
                Ok(Domain::True)
            }
            (JsonValue::Number(a), "=", JsonValue::Number(b)) if a.as_i64() == Some(0) && b.as_i64() == Some(1) => {
                Ok(Domain::False)
            }
            (JsonValue::String(path), _, _) if !path.is_empty() => Ok(Domain::Leaf {
                path: path.clone(),
                op: op_str.parse()?,
                value: right.clone(),
            }),
            _ => Err(OrmError::validation(format!(
                "invalid domain leaf [{left}, {op}, {right}]"
            ))),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut out = Vec::new();
        self.write_json(&mut out);
        JsonValue::Array(out)
    }

    fn write_json(&self, out: &mut Vec<JsonValue>) {
        match self {
            Domain::True => out.push(json!([1, "=", 1])),
            Domain::False => out.push(json!([0, "=", 1])),
            Domain::And(items) | Domain::Or(items) => {
                let op = if matches!(self, Domain::And(_)) { "&" } else { "|" };
                for _ in 1..items.len() {
                    out.push(json!(op));
                }
                for item in items {
                    item.write_json(out);
                }
            }
            Domain::Not(inner) => {
                out.push(json!("!"));
                inner.write_json(out);
            }
            Domain::Leaf { path, op, value } => out.push(json!([path, op.as_str(), value])),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn implicit_and_between_terms() {
        let d = Domain::from_json(&json!([["a", "=", 1], ["b", "!=", 2]])).unwrap();
        assert_eq!(
            d,
            Domain::And(vec![
                Domain::leaf("a", Operator::Eq, 1),
                Domain::leaf("b", Operator::Ne, 2),
            ])
        );
    }

    #[test]
    fn prefix_operators_take_following_terms() {
        let d = Domain::from_json(&json!(["|", ["a", "=", 1], "!", ["b", "=", 2], ["c", "=", 3]]))
            .unwrap();
        assert_eq!(
            d,
            Domain::And(vec![
                Domain::Or(vec![
                    Domain::leaf("a", Operator::Eq, 1),
                    Domain::Not(Box::new(Domain::leaf("b", Operator::Eq, 2))),
                ]),
                Domain::leaf("c", Operator::Eq, 3),
            ])
        );
    }

    #[test]
    fn constants_and_empty_domains() {
        assert_eq!(Domain::from_json(&json!([])).unwrap(), Domain::True);
        assert_eq!(Domain::from_json(&json!([[1, "=", 1]])).unwrap(), Domain::True);
        assert_eq!(
            Domain::from_json(&json!([["a", "=", 1], [0, "=", 1]])).unwrap(),
            Domain::False
        );
    }

    #[test]
    fn malformed_domains_are_rejected() {
        assert!(Domain::from_json(&json!(["&", ["a", "=", 1]])).is_err());
        assert!(Domain::from_json(&json!([["a", "~", 1]])).is_err());
        assert!(Domain::from_json(&json!([["a", "="]])).is_err());
        assert!(Domain::from_json(&json!("a = 1")).is_err());
    }

    #[test]
    fn normalization_pushes_negation_to_leaves() {
        let d = Domain::not(Domain::and([
            Domain::leaf("a", Operator::In, json!([1, 2])),
            Domain::leaf("b", Operator::Lt, 3),
        ]))
        .normalize();
        assert_eq!(
            d,
            Domain::Or(vec![
                Domain::leaf("a", Operator::NotIn, json!([1, 2])),
                Domain::Not(Box::new(Domain::leaf("b", Operator::Lt, 3))),
            ])
        );
    }

    #[test]
    fn mentions_checks_first_path_segment() {
        let d = Domain::from_json(&json!([["partner_id.active", "=", true]])).unwrap();
        assert!(d.mentions("partner_id"));
        assert!(!d.mentions("active"));
    }

    // ── properties ───────────────────────────────────────────────────────

    fn arb_leaf() -> impl Strategy<Value = Domain> {
        (
            prop::sample::select(vec!["a", "b", "c"]),
            prop::sample::select(vec![Operator::Eq, Operator::Ne, Operator::In, Operator::NotIn, Operator::Lt]),
            0i64..4,
        )
            .prop_map(|(path, op, v)| match op {
                Operator::In | Operator::NotIn => Domain::leaf(path, op, json!([v, v + 1])),
                _ => Domain::leaf(path, op, v),
            })
    }

    fn arb_domain() -> impl Strategy<Value = Domain> {
        arb_leaf().prop_recursive(4, 24, 3, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 2..4).prop_map(Domain::And),
                prop::collection::vec(inner.clone(), 2..4).prop_map(Domain::Or),
                inner.prop_map(|d| Domain::Not(Box::new(d))),
            ]
        })
    }

    /// Reference semantics over a record where `None` is a null cell.
    fn eval(d: &Domain, rec: &[(&str, Option<i64>)]) -> bool {
        match d {
            Domain::True => true,
            Domain::False => false,
            Domain::And(items) => items.iter().all(|i| eval(i, rec)),
            Domain::Or(items) => items.iter().any(|i| eval(i, rec)),
            Domain::Not(inner) => !eval(inner, rec),
            Domain::Leaf { path, op, value } => {
                let cell = rec.iter().find(|(k, _)| k == path).and_then(|(_, v)| *v);
                let list: Vec<i64> = value
                    .as_array()
                    .map(|a| a.iter().filter_map(JsonValue::as_i64).collect())
                    .unwrap_or_default();
                let scalar = value.as_i64();
                match (op, cell) {
                    (Operator::Eq, Some(c)) => Some(c) == scalar,
                    (Operator::Ne, Some(c)) => Some(c) != scalar,
                    (Operator::Ne, None) => true,
                    (Operator::In, Some(c)) => list.contains(&c),
                    (Operator::NotIn, Some(c)) => !list.contains(&c),
                    (Operator::NotIn, None) => true,
                    (Operator::Lt, Some(c)) => scalar.is_some_and(|s| c < s),
                    _ => false,
                }
            }
        }
    }

    proptest! {
        #[test]
        fn json_round_trip_preserves_structure(d in arb_domain()) {
            let flat = Domain::and([d]);
            let parsed = Domain::from_json(&flat.to_json()).unwrap();
            prop_assert_eq!(parsed.clone(), Domain::from_json(&parsed.to_json()).unwrap());
        }

        #[test]
        fn normalize_is_idempotent(d in arb_domain()) {
            let once = d.normalize();
            prop_assert_eq!(once.clone().normalize(), once);
        }

        #[test]
        fn normalize_preserves_meaning(
            d in arb_domain(),
            a in prop::option::of(0i64..4),
            b in prop::option::of(0i64..4),
            c in prop::option::of(0i64..4),
        ) {
            let rec = [("a", a), ("b", b), ("c", c)];
            prop_assert_eq!(eval(&d, &rec), eval(&d.clone().normalize(), &rec));
        }
    }
}
