// ABOUTME: Boolean dependency expressions gating node readiness
// ABOUTME: Evaluates AND/OR/NOT trees over node references against a status lookup

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::result::NodeStatus;

/// A boolean formula over other nodes' outcomes.
///
/// In definitions it is written as a node id (`depends_on: fetch`), a list of
/// ids meaning "all of" (`depends_on: [a, b]`), or a single-key map using
/// `and`, `or` or `not`:
///
/// ```yaml
/// depends_on:
///   or:
///     - primary
///     - { not: primary }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DependencySpec", into = "DependencySpec")]
pub enum DependencyExpr {
    Leaf(String),
    And(Vec<DependencyExpr>),
    Or(Vec<DependencyExpr>),
    Not(Box<DependencyExpr>),
}

/// Three-valued view of an expression given the statuses known so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Satisfied,
    Unsatisfied,
    /// At least one referenced node has not finished and its outcome matters.
    Undecided,
}

impl DependencyExpr {
    pub fn leaf(id: impl Into<String>) -> Self {
        DependencyExpr::Leaf(id.into())
    }

    pub fn all<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DependencyExpr::And(ids.into_iter().map(DependencyExpr::leaf).collect())
    }

    pub fn any<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DependencyExpr::Or(ids.into_iter().map(DependencyExpr::leaf).collect())
    }

    pub fn negate(expr: DependencyExpr) -> Self {
        DependencyExpr::Not(Box::new(expr))
    }

    /// Conjunction of two expressions, flattening nested `And`s.
    pub fn and(self, other: DependencyExpr) -> Self {
        let mut terms = match self {
            DependencyExpr::And(terms) => terms,
            expr => vec![expr],
        };
        match other {
            DependencyExpr::And(more) => terms.extend(more),
            expr => terms.push(expr),
        }
        DependencyExpr::And(terms)
    }

    /// Two-valued readiness check.
    ///
    /// `Leaf` holds only once the node is SUCCESS; `Not` holds for every other
    /// status, including PENDING and RUNNING.
    pub fn is_satisfied<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> NodeStatus,
    {
        match self {
            DependencyExpr::Leaf(id) => lookup(id) == NodeStatus::Success,
            DependencyExpr::And(terms) => terms.iter().all(|t| t.is_satisfied(lookup)),
            DependencyExpr::Or(terms) => terms.iter().any(|t| t.is_satisfied(lookup)),
            DependencyExpr::Not(inner) => !inner.is_satisfied(lookup),
        }
    }

    /// Kleene evaluation where unfinished leaves are undecided.
    ///
    /// `Unsatisfied` means no future outcome of the unfinished nodes can make
    /// the expression hold, so the gated node can never run.
    pub fn resolve<F>(&self, lookup: &F) -> Resolution
    where
        F: Fn(&str) -> NodeStatus,
    {
        match self {
            DependencyExpr::Leaf(id) => match lookup(id) {
                NodeStatus::Success => Resolution::Satisfied,
                NodeStatus::Pending | NodeStatus::Running => Resolution::Undecided,
                _ => Resolution::Unsatisfied,
            },
            DependencyExpr::And(terms) => {
                let mut undecided = false;
                for term in terms {
                    match term.resolve(lookup) {
                        Resolution::Unsatisfied => return Resolution::Unsatisfied,
                        Resolution::Undecided => undecided = true,
                        Resolution::Satisfied => {}
                    }
                }
                if undecided {
                    Resolution::Undecided
                } else {
                    Resolution::Satisfied
                }
            }
            DependencyExpr::Or(terms) => {
                let mut undecided = false;
                for term in terms {
                    match term.resolve(lookup) {
                        Resolution::Satisfied => return Resolution::Satisfied,
                        Resolution::Undecided => undecided = true,
                        Resolution::Unsatisfied => {}
                    }
                }
                if undecided {
                    Resolution::Undecided
                } else {
                    Resolution::Unsatisfied
                }
            }
            DependencyExpr::Not(inner) => match inner.resolve(lookup) {
                Resolution::Satisfied => Resolution::Unsatisfied,
                Resolution::Unsatisfied => Resolution::Satisfied,
                Resolution::Undecided => Resolution::Undecided,
            },
        }
    }

    /// Every node id referenced anywhere in the expression, in first-seen order.
    pub fn referenced_nodes(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        self.collect_refs(&mut seen, &mut ordered);
        ordered
    }

    fn collect_refs<'a>(&'a self, seen: &mut BTreeSet<&'a str>, out: &mut Vec<&'a str>) {
        match self {
            DependencyExpr::Leaf(id) => {
                if seen.insert(id.as_str()) {
                    out.push(id.as_str());
                }
            }
            DependencyExpr::And(terms) | DependencyExpr::Or(terms) => {
                for term in terms {
                    term.collect_refs(seen, out);
                }
            }
            DependencyExpr::Not(inner) => inner.collect_refs(seen, out),
        }
    }

    /// Returns true if an `and`/`or` group anywhere in the tree is empty.
    pub fn has_empty_group(&self) -> bool {
        match self {
            DependencyExpr::Leaf(_) => false,
            DependencyExpr::And(terms) | DependencyExpr::Or(terms) => {
                terms.is_empty() || terms.iter().any(|t| t.has_empty_group())
            }
            DependencyExpr::Not(inner) => inner.has_empty_group(),
        }
    }
}

impl fmt::Display for DependencyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, terms: &[DependencyExpr], op: &str| {
            write!(f, "(")?;
            for (i, term) in terms.iter().enumerate() {
                if i > 0 {
                    write!(f, " {} ", op)?;
                }
                write!(f, "{}", term)?;
            }
            write!(f, ")")
        };
        match self {
            DependencyExpr::Leaf(id) => write!(f, "{}", id),
            DependencyExpr::And(terms) => join(f, terms, "and"),
            DependencyExpr::Or(terms) => join(f, terms, "or"),
            DependencyExpr::Not(inner) => write!(f, "not {}", inner),
        }
    }
}

/// Wire form of a dependency expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DependencySpec {
    Leaf(String),
    All(Vec<DependencyExpr>),
    Op(DependencyOp),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    and: Option<Vec<DependencyExpr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    or: Option<Vec<DependencyExpr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    not: Option<Box<DependencyExpr>>,
}

impl TryFrom<DependencySpec> for DependencyExpr {
    type Error = String;

    fn try_from(spec: DependencySpec) -> Result<Self, Self::Error> {
        match spec {
            DependencySpec::Leaf(id) => Ok(DependencyExpr::Leaf(id)),
            DependencySpec::All(terms) => Ok(DependencyExpr::And(terms)),
            DependencySpec::Op(op) => match (op.and, op.or, op.not) {
                (Some(terms), None, None) => Ok(DependencyExpr::And(terms)),
                (None, Some(terms), None) => Ok(DependencyExpr::Or(terms)),
                (None, None, Some(inner)) => Ok(DependencyExpr::Not(inner)),
                _ => Err("dependency map must contain exactly one of 'and', 'or', 'not'".to_string()),
            },
        }
    }
}

impl From<DependencyExpr> for DependencySpec {
    fn from(expr: DependencyExpr) -> Self {
        match expr {
            DependencyExpr::Leaf(id) => DependencySpec::Leaf(id),
            DependencyExpr::And(terms) => DependencySpec::Op(DependencyOp {
                and: Some(terms),
                ..Default::default()
            }),
            DependencyExpr::Or(terms) => DependencySpec::Op(DependencyOp {
                or: Some(terms),
                ..Default::default()
            }),
            DependencyExpr::Not(inner) => DependencySpec::Op(DependencyOp {
                not: Some(inner),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(entries: &[(&str, NodeStatus)]) -> impl Fn(&str) -> NodeStatus {
        let map: HashMap<String, NodeStatus> = entries
            .iter()
            .map(|(id, status)| (id.to_string(), *status))
            .collect();
        move |id: &str| map.get(id).copied().unwrap_or(NodeStatus::Pending)
    }

    #[test]
    fn test_leaf_requires_success() {
        let expr = DependencyExpr::leaf("a");
        assert!(expr.is_satisfied(&lookup_from(&[("a", NodeStatus::Success)])));
        for status in [
            NodeStatus::Pending,
            NodeStatus::Running,
            NodeStatus::Failed,
            NodeStatus::Skipped,
            NodeStatus::Cancelled,
        ] {
            assert!(!expr.is_satisfied(&lookup_from(&[("a", status)])));
        }
    }

    #[test]
    fn test_and_or_combinations() {
        let lookup = lookup_from(&[("a", NodeStatus::Success), ("b", NodeStatus::Failed)]);
        assert!(!DependencyExpr::all(["a", "b"]).is_satisfied(&lookup));
        assert!(DependencyExpr::any(["a", "b"]).is_satisfied(&lookup));
        assert!(DependencyExpr::all(Vec::<String>::new()).is_satisfied(&lookup));
    }

    #[test]
    fn test_not_holds_while_pending_or_running() {
        let expr = DependencyExpr::negate(DependencyExpr::leaf("primary"));
        assert!(expr.is_satisfied(&lookup_from(&[("primary", NodeStatus::Pending)])));
        assert!(expr.is_satisfied(&lookup_from(&[("primary", NodeStatus::Running)])));
        assert!(expr.is_satisfied(&lookup_from(&[("primary", NodeStatus::Cancelled)])));
        assert!(!expr.is_satisfied(&lookup_from(&[("primary", NodeStatus::Success)])));
    }

    #[test]
    fn test_satisfaction_ignores_unrelated_nodes() {
        let expr = DependencyExpr::any(["a", "b"]).and(DependencyExpr::negate(
            DependencyExpr::leaf("c"),
        ));
        let before = lookup_from(&[("a", NodeStatus::Success), ("z", NodeStatus::Pending)]);
        let after = lookup_from(&[("a", NodeStatus::Success), ("z", NodeStatus::Failed)]);
        assert_eq!(expr.is_satisfied(&before), expr.is_satisfied(&after));
        assert_eq!(expr.resolve(&before), expr.resolve(&after));
    }

    #[test]
    fn test_resolve_detects_dead_expressions() {
        let expr = DependencyExpr::all(["a", "b"]);
        let lookup = lookup_from(&[("a", NodeStatus::Failed)]);
        assert_eq!(expr.resolve(&lookup), Resolution::Unsatisfied);

        let expr = DependencyExpr::any(["a", "b"]);
        assert_eq!(expr.resolve(&lookup), Resolution::Undecided);

        let expr = DependencyExpr::negate(DependencyExpr::leaf("a"));
        let lookup = lookup_from(&[("a", NodeStatus::Success)]);
        assert_eq!(expr.resolve(&lookup), Resolution::Unsatisfied);
    }

    #[test]
    fn test_referenced_nodes_deduplicates_in_order() {
        let expr = DependencyExpr::Or(vec![
            DependencyExpr::leaf("b"),
            DependencyExpr::all(["a", "b"]),
            DependencyExpr::negate(DependencyExpr::leaf("c")),
        ]);
        assert_eq!(expr.referenced_nodes(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_deserialize_shorthand_forms() {
        let leaf: DependencyExpr = serde_yaml::from_str("fetch").unwrap();
        assert_eq!(leaf, DependencyExpr::leaf("fetch"));

        let list: DependencyExpr = serde_yaml::from_str("[a, b]").unwrap();
        assert_eq!(list, DependencyExpr::all(["a", "b"]));

        let nested: DependencyExpr =
            serde_yaml::from_str("or: [primary, { not: primary }]").unwrap();
        assert_eq!(
            nested,
            DependencyExpr::Or(vec![
                DependencyExpr::leaf("primary"),
                DependencyExpr::negate(DependencyExpr::leaf("primary")),
            ])
        );
    }

    #[test]
    fn test_deserialize_rejects_ambiguous_operator_map() {
        let result: Result<DependencyExpr, _> = serde_yaml::from_str("{ and: [a], or: [b] }");
        assert!(result.is_err());
    }

    #[test]
    fn test_display() {
        let expr = DependencyExpr::all(["a", "b"]).and(DependencyExpr::negate(
            DependencyExpr::leaf("c"),
        ));
        assert_eq!(expr.to_string(), "(a and b and not c)");
    }
}
