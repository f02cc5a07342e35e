//! Restricted comparison grammar used by `IfCondition` and condition-driven loops.
//!
//! A condition compares two templated operands. Operands are resolved against the
//! run's bindings first; the comparison itself only ever sees plain strings.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::variables::{self, Bindings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    #[serde(alias = "greater")]
    GreaterThan,
    #[serde(alias = "less")]
    LessThan,
    Exists,
    NotExists,
}

impl ConditionOperator {
    /// EXISTS/NOT_EXISTS only look at the left operand.
    pub fn is_unary(self) -> bool {
        matches!(self, ConditionOperator::Exists | ConditionOperator::NotExists)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ConditionOperator::Equals => "==",
            ConditionOperator::NotEquals => "!=",
            ConditionOperator::Contains => "contains",
            ConditionOperator::NotContains => "!contains",
            ConditionOperator::GreaterThan => ">",
            ConditionOperator::LessThan => "<",
            ConditionOperator::Exists => "exists",
            ConditionOperator::NotExists => "!exists",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub left: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub right: String,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operator.is_unary() {
            write!(f, "{} {}", self.left, self.operator.symbol())
        } else {
            write!(f, "{} {} {:?}", self.left, self.operator.symbol(), self.right)
        }
    }
}

/// Outcome of evaluating a condition, with the operand values it actually compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub result: bool,
    pub left: String,
    pub right: String,
    pub unresolved: Vec<String>,
}

impl Condition {
    pub fn new(
        left: impl Into<String>,
        operator: ConditionOperator,
        right: impl Into<String>,
    ) -> Self {
        Self {
            left: left.into(),
            operator,
            right: right.into(),
        }
    }

    pub fn evaluate(&self, bindings: &Bindings) -> Evaluation {
        let left = variables::resolve(&self.left, bindings);
        let right = if self.operator.is_unary() {
            variables::Resolved {
                value: String::new(),
                unresolved: Vec::new(),
            }
        } else {
            variables::resolve(&self.right, bindings)
        };

        let mut unresolved = left.unresolved;
        for name in right.unresolved {
            if !unresolved.contains(&name) {
                unresolved.push(name);
            }
        }

        Evaluation {
            result: compare(&left.value, self.operator, &right.value),
            left: left.value,
            right: right.value,
            unresolved,
        }
    }
}

/// Compares two already-resolved operands.
pub fn compare(left: &str, operator: ConditionOperator, right: &str) -> bool {
    match operator {
        ConditionOperator::Equals => left == right,
        ConditionOperator::NotEquals => left != right,
        ConditionOperator::Contains => left.contains(right),
        ConditionOperator::NotContains => !left.contains(right),
        ConditionOperator::GreaterThan => compare_values_smart(left, right) == Ordering::Greater,
        ConditionOperator::LessThan => compare_values_smart(left, right) == Ordering::Less,
        ConditionOperator::Exists => !left.is_empty(),
        ConditionOperator::NotExists => left.is_empty(),
    }
}

// Numeric when both sides parse as numbers, lexicographic otherwise.
fn compare_values_smart(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.cmp(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Bindings {
        let mut b = Bindings::new();
        b.set("matched_text", "완료");
        b.set("count", "10");
        b.set("empty", "");
        b
    }

    #[test]
    fn equality_on_resolved_values() {
        let c = Condition::new("${matched_text}", ConditionOperator::Equals, "완료");
        let eval = c.evaluate(&vars());
        assert!(eval.result);
        assert_eq!(eval.left, "완료");
        assert!(eval.unresolved.is_empty());

        let c = Condition::new("${matched_text}", ConditionOperator::NotEquals, "완료");
        assert!(!c.evaluate(&vars()).result);
    }

    #[test]
    fn numeric_comparison_beats_lexicographic() {
        // "10" < "9" lexicographically, but 10 > 9 numerically.
        let c = Condition::new("${count}", ConditionOperator::GreaterThan, "9");
        assert!(c.evaluate(&vars()).result);
        let c = Condition::new("${count}", ConditionOperator::LessThan, "9.5");
        assert!(!c.evaluate(&vars()).result);
        assert!(compare("apple", ConditionOperator::LessThan, "banana"));
    }

    #[test]
    fn contains_operators() {
        assert!(compare("저장 완료됨", ConditionOperator::Contains, "완료"));
        assert!(compare("error", ConditionOperator::NotContains, "완료"));
    }

    #[test]
    fn exists_checks_left_operand_only() {
        let b = vars();
        assert!(
            Condition::new("${matched_text}", ConditionOperator::Exists, "")
                .evaluate(&b)
                .result
        );
        assert!(!Condition::new("${empty}", ConditionOperator::Exists, "").evaluate(&b).result);

        let missing =
            Condition::new("${nope}", ConditionOperator::NotExists, "${also_nope}").evaluate(&b);
        assert!(missing.result);
        assert_eq!(missing.unresolved, vec!["nope".to_string()]);
    }

    #[test]
    fn unresolved_operands_compare_as_empty() {
        let eval = Condition::new("${missing}", ConditionOperator::Equals, "").evaluate(&vars());
        assert!(eval.result);
        assert_eq!(eval.unresolved, vec!["missing".to_string()]);
    }

    #[test]
    fn operator_wire_names_and_aliases() {
        let op: ConditionOperator = serde_json::from_str("\"greater\"").unwrap();
        assert_eq!(op, ConditionOperator::GreaterThan);
        assert_eq!(serde_json::to_string(&op).unwrap(), "\"greater_than\"");
        assert!(serde_json::from_str::<ConditionOperator>("\"matches\"").is_err());
    }
}
