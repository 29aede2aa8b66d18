//! CRDT (Conflict-free Replicated Data Types) implementations
//!
//! Every type here is a join-semilattice: `merge` is commutative,
//! associative and idempotent, so replicas that have seen the same set of
//! updates hold equal state regardless of delivery order or duplication.
//!
//! # CRDTs Implemented
//!
//! Primitives:
//!
//! - **G-Counter:** grow-only counter, one slot per replica
//! - **PN-Counter:** increment/decrement counter built from two G-Counters
//! - **G-Set:** grow-only set
//! - **LWW-Register:** last-writer-wins value with replica tie-break
//! - **OR-Set:** observed-remove set (add wins over concurrent remove)
//!
//! Composites:
//!
//! - **TimeSeries:** ordered samples with incremental window aggregates
//! - **Graph:** OR-Set vertices and edges with LWW edge attributes
//! - **Workflow:** state machine with an auditable transition history
//!
//! Mutators return a *delta* of the same type. Shipping the delta and
//! merging it remotely has the same effect as shipping the whole state.
//!
//! # References
//!
//! - "A comprehensive study of CRDTs" by Marc Shapiro et al.
//! - "Delta State Replicated Data Types" by Almeida, Shoker and Baquero

pub mod g_counter;
pub mod g_set;
pub mod graph;
pub mod lww_register;
pub mod or_set;
pub(crate) mod pairs;
pub mod pn_counter;
pub mod tag;
pub mod time_series;
pub mod workflow;

pub use g_counter::GCounter;
pub use g_set::GSet;
pub use graph::{EdgeKey, GraphCrdt, GraphSnapshot, VertexId};
pub use lww_register::LwwRegister;
pub use or_set::OrSet;
pub use pn_counter::PnCounter;
pub use tag::Tag;
pub use time_series::{AggregateFn, EntryKey, PartialAggregate, Sample, TimeSeriesCrdt, WindowValue};
pub use workflow::{Transition, TransitionConflict, TransitionId, WorkflowCrdt, WorkflowHead};

use crate::error::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Common interface of every replicated type
pub trait Crdt:
    Clone + Default + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Read-only projection returned by [`Crdt::value`]
    type Value: Serialize;

    /// Join with another state (least upper bound)
    fn merge(&mut self, other: &Self);

    fn value(&self) -> Self::Value;

    /// State containing exactly what `self` has and `since` lacks
    ///
    /// Returns `None` when `since` already covers `self`. Merging the result
    /// into `since` yields a state at least as large as `self`.
    fn to_delta(&self, since: &Self) -> Option<Self>;

    /// Fold in a delta produced by a mutator or [`Crdt::to_delta`]
    ///
    /// Deltas are states of the same type, so this is a merge.
    fn apply_delta(&mut self, delta: &Self) {
        self.merge(delta);
    }

    /// Check internal invariants (e.g. no tag reuse)
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Merge into a copy, leaving `self` untouched
    fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Encode the full state
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a state and check its invariants
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let state: Self = serde_json::from_slice(bytes)?;
        state.validate()?;
        Ok(state)
    }
}

/// Bound for set elements and map keys
pub trait Element:
    Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Element for T where
    T: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bound for LWW register payloads
pub trait RegisterValue:
    Clone + PartialEq + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> RegisterValue for T where
    T: Clone + PartialEq + Debug + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Discriminant of [`CrdtValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrdtKind {
    GCounter,
    GSet,
    LwwRegister,
    OrSet,
    PnCounter,
    TimeSeries,
    Graph,
    Workflow,
}

impl CrdtKind {
    pub const ALL: [CrdtKind; 8] = [
        CrdtKind::GCounter,
        CrdtKind::GSet,
        CrdtKind::LwwRegister,
        CrdtKind::OrSet,
        CrdtKind::PnCounter,
        CrdtKind::TimeSeries,
        CrdtKind::Graph,
        CrdtKind::Workflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CrdtKind::GCounter => "g_counter",
            CrdtKind::GSet => "g_set",
            CrdtKind::LwwRegister => "lww_register",
            CrdtKind::OrSet => "or_set",
            CrdtKind::PnCounter => "pn_counter",
            CrdtKind::TimeSeries => "time_series",
            CrdtKind::Graph => "graph",
            CrdtKind::Workflow => "workflow",
        }
    }

    pub fn parse(name: &str) -> Result<CrdtKind> {
        CrdtKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| SyncError::Protocol(format!("unknown CRDT kind '{}'", name)))
    }
}

impl fmt::Display for CrdtKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any replicated object the store can hold
///
/// The set of variants is closed; merging two values of different variants
/// is a structural error rather than a panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "state", rename_all = "snake_case")]
pub enum CrdtValue {
    GCounter(GCounter),
    GSet(GSet<String>),
    LwwRegister(LwwRegister<serde_json::Value>),
    OrSet(OrSet<String>),
    PnCounter(PnCounter),
    TimeSeries(TimeSeriesCrdt),
    Graph(GraphCrdt),
    Workflow(WorkflowCrdt),
}

macro_rules! for_each_variant {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            CrdtValue::GCounter($inner) => $body,
            CrdtValue::GSet($inner) => $body,
            CrdtValue::LwwRegister($inner) => $body,
            CrdtValue::OrSet($inner) => $body,
            CrdtValue::PnCounter($inner) => $body,
            CrdtValue::TimeSeries($inner) => $body,
            CrdtValue::Graph($inner) => $body,
            CrdtValue::Workflow($inner) => $body,
        }
    };
}

macro_rules! for_each_pair {
    ($left:expr, $right:expr, $a:ident, $b:ident => $body:expr, mismatch => $mismatch:expr) => {
        match ($left, $right) {
            (CrdtValue::GCounter($a), CrdtValue::GCounter($b)) => $body,
            (CrdtValue::GSet($a), CrdtValue::GSet($b)) => $body,
            (CrdtValue::LwwRegister($a), CrdtValue::LwwRegister($b)) => $body,
            (CrdtValue::OrSet($a), CrdtValue::OrSet($b)) => $body,
            (CrdtValue::PnCounter($a), CrdtValue::PnCounter($b)) => $body,
            (CrdtValue::TimeSeries($a), CrdtValue::TimeSeries($b)) => $body,
            (CrdtValue::Graph($a), CrdtValue::Graph($b)) => $body,
            (CrdtValue::Workflow($a), CrdtValue::Workflow($b)) => $body,
            _ => $mismatch,
        }
    };
}

impl CrdtValue {
    /// Bottom element of the given kind
    pub fn empty(kind: CrdtKind) -> CrdtValue {
        match kind {
            CrdtKind::GCounter => CrdtValue::GCounter(GCounter::default()),
            CrdtKind::GSet => CrdtValue::GSet(GSet::default()),
            CrdtKind::LwwRegister => CrdtValue::LwwRegister(LwwRegister::default()),
            CrdtKind::OrSet => CrdtValue::OrSet(OrSet::default()),
            CrdtKind::PnCounter => CrdtValue::PnCounter(PnCounter::default()),
            CrdtKind::TimeSeries => CrdtValue::TimeSeries(TimeSeriesCrdt::default()),
            CrdtKind::Graph => CrdtValue::Graph(GraphCrdt::default()),
            CrdtKind::Workflow => CrdtValue::Workflow(WorkflowCrdt::default()),
        }
    }

    pub fn kind(&self) -> CrdtKind {
        match self {
            CrdtValue::GCounter(_) => CrdtKind::GCounter,
            CrdtValue::GSet(_) => CrdtKind::GSet,
            CrdtValue::LwwRegister(_) => CrdtKind::LwwRegister,
            CrdtValue::OrSet(_) => CrdtKind::OrSet,
            CrdtValue::PnCounter(_) => CrdtKind::PnCounter,
            CrdtValue::TimeSeries(_) => CrdtKind::TimeSeries,
            CrdtValue::Graph(_) => CrdtKind::Graph,
            CrdtValue::Workflow(_) => CrdtKind::Workflow,
        }
    }

    /// Join with another value of the same variant
    ///
    /// # Errors
    ///
    /// `StructuralMerge` when the variants differ; `self` is left unchanged.
    pub fn merge(&mut self, other: &CrdtValue) -> Result<()> {
        let (left, right) = (self.kind(), other.kind());
        for_each_pair!(self, other, a, b => {
            a.merge(b);
            Ok(())
        }, mismatch => Err(mismatch(left, right)))
    }

    /// Same as [`CrdtValue::merge`]; deltas are states
    pub fn apply_delta(&mut self, delta: &CrdtValue) -> Result<()> {
        self.merge(delta)
    }

    /// Difference between `self` and an older state of the same variant
    pub fn to_delta(&self, since: &CrdtValue) -> Result<Option<CrdtValue>> {
        let (left, right) = (self.kind(), since.kind());
        for_each_pair!(self, since, a, b => {
            Ok(a.to_delta(b).map(CrdtVariant::into_value))
        }, mismatch => Err(mismatch(left, right)))
    }

    pub fn validate(&self) -> Result<()> {
        for_each_variant!(self, inner => inner.validate())
    }

    /// Read-only projection as JSON
    pub fn value_json(&self) -> Result<serde_json::Value> {
        for_each_variant!(self, inner => Ok(serde_json::to_value(inner.value())?))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a tagged value and check its invariants
    pub fn from_bytes(bytes: &[u8]) -> Result<CrdtValue> {
        let value: CrdtValue = serde_json::from_slice(bytes)?;
        value.validate()?;
        Ok(value)
    }

    /// Decode a state of a known kind (wire payloads carry the kind separately)
    pub fn from_state_bytes(kind: CrdtKind, bytes: &[u8]) -> Result<CrdtValue> {
        let value = match kind {
            CrdtKind::GCounter => GCounter::from_bytes(bytes)?.into_value(),
            CrdtKind::GSet => GSet::<String>::from_bytes(bytes)?.into_value(),
            CrdtKind::LwwRegister => LwwRegister::<serde_json::Value>::from_bytes(bytes)?.into_value(),
            CrdtKind::OrSet => OrSet::<String>::from_bytes(bytes)?.into_value(),
            CrdtKind::PnCounter => PnCounter::from_bytes(bytes)?.into_value(),
            CrdtKind::TimeSeries => TimeSeriesCrdt::from_bytes(bytes)?.into_value(),
            CrdtKind::Graph => GraphCrdt::from_bytes(bytes)?.into_value(),
            CrdtKind::Workflow => WorkflowCrdt::from_bytes(bytes)?.into_value(),
        };
        Ok(value)
    }

    /// Encode the inner state only
    pub fn state_bytes(&self) -> Result<Vec<u8>> {
        for_each_variant!(self, inner => inner.to_bytes())
    }

    /// Borrow the inner state as a concrete type
    pub fn downcast_ref<T: CrdtVariant>(&self) -> Result<&T> {
        let found = self.kind();
        T::from_value(self).ok_or(SyncError::TypeMismatch {
            expected: T::KIND.as_str(),
            found: found.as_str(),
        })
    }

    pub fn downcast_mut<T: CrdtVariant>(&mut self) -> Result<&mut T> {
        let found = self.kind();
        T::from_value_mut(self).ok_or(SyncError::TypeMismatch {
            expected: T::KIND.as_str(),
            found: found.as_str(),
        })
    }
}

fn mismatch(left: CrdtKind, right: CrdtKind) -> SyncError {
    SyncError::StructuralMerge(format!("cannot merge {} with {}", left, right))
}

/// Concrete types that live inside [`CrdtValue`]
pub trait CrdtVariant: Crdt {
    const KIND: CrdtKind;

    fn into_value(self) -> CrdtValue;

    fn from_value(value: &CrdtValue) -> Option<&Self>;

    fn from_value_mut(value: &mut CrdtValue) -> Option<&mut Self>;
}

macro_rules! impl_variant {
    ($ty:ty, $variant:ident) => {
        impl CrdtVariant for $ty {
            const KIND: CrdtKind = CrdtKind::$variant;

            fn into_value(self) -> CrdtValue {
                CrdtValue::$variant(self)
            }

            fn from_value(value: &CrdtValue) -> Option<&Self> {
                match value {
                    CrdtValue::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn from_value_mut(value: &mut CrdtValue) -> Option<&mut Self> {
                match value {
                    CrdtValue::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for CrdtValue {
            fn from(inner: $ty) -> CrdtValue {
                CrdtValue::$variant(inner)
            }
        }
    };
}

impl_variant!(GCounter, GCounter);
impl_variant!(GSet<String>, GSet);
impl_variant!(LwwRegister<serde_json::Value>, LwwRegister);
impl_variant!(OrSet<String>, OrSet);
impl_variant!(PnCounter, PnCounter);
impl_variant!(TimeSeriesCrdt, TimeSeries);
impl_variant!(GraphCrdt, Graph);
impl_variant!(WorkflowCrdt, Workflow);
