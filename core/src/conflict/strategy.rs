//! Resolution strategies and pluggable resolvers

use super::{Conflict, ConflictKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Strategy applied to semantic conflicts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Accept the LWW winner
    KeepLatest,
    /// Flag for an external decision; state stays structurally merged
    ManualReview,
    /// Delegate to a resolver registered under this name
    Custom(String),
}

impl Default for StrategyKind {
    fn default() -> Self {
        StrategyKind::ManualReview
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::KeepLatest => f.write_str("keep-latest"),
            StrategyKind::ManualReview => f.write_str("manual-review"),
            StrategyKind::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// Outcome proposed by a resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Settle on this workflow state
    ChooseState(String),
    /// Fall back to the LWW winner
    KeepLatest,
    /// No opinion; queue for manual review
    Defer,
}

/// Custom conflict resolver
///
/// Resolvers must be deterministic: replicas resolving the same conflict
/// independently should pick the same outcome.
pub trait ConflictResolver: Send + Sync {
    /// Identity recorded in the audit trail
    fn name(&self) -> &str;

    fn resolve(&self, conflict: &Conflict) -> Decision;
}

/// Resolver backed by a closure
pub struct FnResolver<F> {
    name: String,
    f: F,
}

impl<F> FnResolver<F>
where
    F: Fn(&Conflict) -> Decision + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> ConflictResolver for FnResolver<F>
where
    F: Fn(&Conflict) -> Decision + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, conflict: &Conflict) -> Decision {
        (self.f)(conflict)
    }
}

/// Picks the candidate state ranked highest in a fixed priority list
///
/// Candidates missing from the list are ignored; if none are ranked the
/// conflict is deferred.
///
/// # Example
///
/// ```
/// use meshkit_core::conflict::PriorityResolver;
///
/// // A rejection always beats an approval
/// let resolver = PriorityResolver::new("reject-wins", ["rejected", "approved"]);
/// ```
#[derive(Debug, Clone)]
pub struct PriorityResolver {
    name: String,
    ranking: Vec<String>,
}

impl PriorityResolver {
    pub fn new<I, S>(name: impl Into<String>, ranking: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            ranking: ranking.into_iter().map(Into::into).collect(),
        }
    }
}

impl ConflictResolver for PriorityResolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, conflict: &Conflict) -> Decision {
        let ConflictKind::ConcurrentTransition { conflict } = &conflict.kind else {
            return Decision::Defer;
        };
        self.ranking
            .iter()
            .find(|state| conflict.candidates.iter().any(|t| &&t.to_state == state))
            .map(|state| Decision::ChooseState(state.clone()))
            .unwrap_or(Decision::Defer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::detect;
    use crate::crdt::{Crdt, CrdtValue, WorkflowCrdt};
    use crate::sync::LamportClock;

    fn conflict() -> Conflict {
        let mut clock1 = LamportClock::new();
        let mut a = WorkflowCrdt::with_initial("pending", &mut clock1, "n1");
        let mut b = a.clone();
        let mut clock2 = clock1;
        a.advance("approved", &mut clock1, "n1").unwrap();
        b.advance("rejected", &mut clock2, "n2").unwrap();
        a.merge(&b);
        detect("wf", None, &CrdtValue::from(a), None, true).remove(0)
    }

    #[test]
    fn test_default_strategy_is_manual_review() {
        assert_eq!(StrategyKind::default(), StrategyKind::ManualReview);
    }

    #[test]
    fn test_strategy_names_parse_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: StrategyKind,
        }
        let parsed: Wrapper = toml::from_str("strategy = \"keep-latest\"").unwrap();
        assert_eq!(parsed.strategy, StrategyKind::KeepLatest);
    }

    #[test]
    fn test_priority_resolver() {
        let resolver = PriorityResolver::new("reject-wins", ["rejected", "approved"]);
        assert_eq!(
            resolver.resolve(&conflict()),
            Decision::ChooseState("rejected".to_string())
        );

        let unrelated = PriorityResolver::new("none", ["archived"]);
        assert_eq!(unrelated.resolve(&conflict()), Decision::Defer);
    }

    #[test]
    fn test_fn_resolver() {
        let resolver = FnResolver::new("latest", |_: &Conflict| Decision::KeepLatest);
        assert_eq!(resolver.name(), "latest");
        assert_eq!(resolver.resolve(&conflict()), Decision::KeepLatest);
    }
}
