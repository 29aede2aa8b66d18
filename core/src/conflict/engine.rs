//! Conflict engine: detection, strategy dispatch and auditing

use super::{
    detect, AuditEntry, AuditLog, Conflict, ConflictClass, ConflictKind, ConflictResolver,
    Decision, Resolution, StrategyKind, WorkflowDefinition,
};
use crate::config::ConflictConfig;
use crate::crdt::{Crdt, CrdtKind, CrdtValue, WorkflowCrdt};
use crate::error::{Result, SyncError};
use crate::sync::TimestampSource;
use crate::{ObjectId, ReplicaId};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of evaluating one merge
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// Conflicts present after the merge
    pub conflicts: Vec<Conflict>,
    /// Conflicts audited for the first time by this evaluation
    pub newly_recorded: Vec<Conflict>,
    /// Delta written by an automatic resolution, to be replicated
    pub repair: Option<CrdtValue>,
    /// New audit entries, to be replicated
    pub audit_delta: Option<AuditLog>,
}

impl Evaluation {
    pub fn class(&self) -> ConflictClass {
        ConflictClass::of(&self.conflicts)
    }
}

/// Runs after every merge of an object and records what it finds
pub struct ConflictEngine {
    replica: ReplicaId,
    default_strategy: StrategyKind,
    kind_strategies: HashMap<CrdtKind, StrategyKind>,
    object_strategies: HashMap<ObjectId, StrategyKind>,
    resolvers: HashMap<String, Arc<dyn ConflictResolver>>,
    definitions: HashMap<ObjectId, WorkflowDefinition>,
    audit: AuditLog,
}

impl ConflictEngine {
    /// Engine with `manual-review` as the default strategy
    pub fn new(replica: impl Into<ReplicaId>) -> Self {
        Self {
            replica: replica.into(),
            default_strategy: StrategyKind::ManualReview,
            kind_strategies: HashMap::new(),
            object_strategies: HashMap::new(),
            resolvers: HashMap::new(),
            definitions: HashMap::new(),
            audit: AuditLog::new(),
        }
    }

    pub fn from_config(replica: impl Into<ReplicaId>, config: &ConflictConfig) -> Result<Self> {
        let mut engine = Self::new(replica);
        engine.default_strategy = config.default_strategy.clone();
        for (kind, strategy) in &config.overrides {
            engine
                .kind_strategies
                .insert(CrdtKind::parse(kind)?, strategy.clone());
        }
        Ok(engine)
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    pub fn set_default_strategy(&mut self, strategy: StrategyKind) {
        self.default_strategy = strategy;
    }

    /// Strategy for one object, overriding kind and default strategies
    pub fn set_strategy(&mut self, object_id: impl Into<ObjectId>, strategy: StrategyKind) {
        self.object_strategies.insert(object_id.into(), strategy);
    }

    pub fn register_resolver(&mut self, resolver: Arc<dyn ConflictResolver>) {
        self.resolvers.insert(resolver.name().to_string(), resolver);
    }

    pub fn define_workflow(&mut self, object_id: impl Into<ObjectId>, definition: WorkflowDefinition) {
        self.definitions.insert(object_id.into(), definition);
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Fold in audit entries recorded by other replicas
    pub fn merge_audit(&mut self, other: &AuditLog) {
        self.audit.merge(other);
    }

    pub fn pending_reviews(&self) -> Vec<&AuditEntry> {
        self.audit.pending_reviews()
    }

    fn strategy_for(&self, object_id: &str, kind: CrdtKind) -> &StrategyKind {
        self.object_strategies
            .get(object_id)
            .or_else(|| self.kind_strategies.get(&kind))
            .unwrap_or(&self.default_strategy)
    }

    /// Inspect an object after a merge and apply strategies
    ///
    /// `after` is the merged state; automatic resolutions are written into
    /// it and returned as `repair`. Conflicts already audited by this
    /// replica are reported but not recorded again.
    pub fn evaluate<C: TimestampSource>(
        &mut self,
        object_id: &str,
        before: Option<&CrdtValue>,
        after: &mut CrdtValue,
        remote: bool,
        clock: &mut C,
    ) -> Result<Evaluation> {
        let conflicts = detect(
            object_id,
            before,
            after,
            self.definitions.get(object_id),
            remote,
        );
        let mut evaluation = Evaluation::default();
        let mut audit_delta = AuditLog::new();

        let settled: BTreeSet<String> = self.audit.settled().into_iter().map(String::from).collect();
        for conflict in &conflicts {
            if settled.contains(&conflict.fingerprint)
                || self.audit.has_record(&self.replica, &conflict.fingerprint)
            {
                continue;
            }

            let (resolution, resolver) = match conflict.class {
                ConflictClass::None => continue,
                ConflictClass::StructuralOnly => {
                    debug!(object = object_id, conflict = %conflict.description, "structural conflict settled by merge");
                    (Resolution::Accepted, "merge".to_string())
                }
                ConflictClass::Semantic => {
                    warn!(object = object_id, conflict = %conflict.description, "semantic conflict detected");
                    let strategy = self.strategy_for(object_id, after.kind()).clone();
                    let (resolution, resolver, repair) =
                        self.apply_strategy(&strategy, conflict, after, clock)?;
                    if let Some(repair) = repair {
                        merge_repair(&mut evaluation.repair, repair)?;
                    }
                    (resolution, resolver)
                }
            };

            let delta = self.record(conflict, resolution, resolver);
            audit_delta.merge(&delta);
            evaluation.newly_recorded.push(conflict.clone());
        }

        self.supersede_stale(object_id, &conflicts, &mut audit_delta);

        if !audit_delta.is_empty() {
            evaluation.audit_delta = Some(audit_delta);
        }
        evaluation.conflicts = conflicts;
        Ok(evaluation)
    }

    fn apply_strategy<C: TimestampSource>(
        &self,
        strategy: &StrategyKind,
        conflict: &Conflict,
        after: &mut CrdtValue,
        clock: &mut C,
    ) -> Result<(Resolution, String, Option<CrdtValue>)> {
        match strategy {
            StrategyKind::KeepLatest => {
                let (state, repair) = self.keep_latest(conflict, after, clock)?;
                Ok((Resolution::KeptLatest { state }, strategy.to_string(), repair))
            }
            StrategyKind::ManualReview => {
                info!(object = %conflict.object_id, fingerprint = %conflict.fingerprint, "conflict queued for manual review");
                Ok((Resolution::PendingReview, strategy.to_string(), None))
            }
            StrategyKind::Custom(name) => {
                let Some(resolver) = self.resolvers.get(name) else {
                    warn!(resolver = %name, "resolver not registered, falling back to manual review");
                    return Ok((Resolution::PendingReview, StrategyKind::ManualReview.to_string(), None));
                };
                let identity = format!("custom:{}", resolver.name());
                match resolver.resolve(conflict) {
                    Decision::ChooseState(state) => {
                        let repair = self.choose(conflict, &state, after, clock)?;
                        Ok((Resolution::Chosen { state }, identity, repair))
                    }
                    Decision::KeepLatest => {
                        let (state, repair) = self.keep_latest(conflict, after, clock)?;
                        Ok((Resolution::KeptLatest { state }, identity, repair))
                    }
                    Decision::Defer => Ok((Resolution::PendingReview, identity, None)),
                }
            }
        }
    }

    fn keep_latest<C: TimestampSource>(
        &self,
        conflict: &Conflict,
        after: &mut CrdtValue,
        clock: &mut C,
    ) -> Result<(Option<String>, Option<CrdtValue>)> {
        match &conflict.kind {
            ConflictKind::ConcurrentTransition { conflict: transitions } => {
                let Some(winner) = transitions.lww_winner() else {
                    return Ok((None, None));
                };
                let state = winner.to_state.clone();
                let workflow = after.downcast_mut::<WorkflowCrdt>()?;
                let delta = workflow.resolve(transitions, &state, clock, &self.replica);
                Ok((Some(state), Some(CrdtValue::from(delta))))
            }
            // Nothing to write: the merged state already is the LWW outcome
            _ => Ok((after_state(after), None)),
        }
    }

    fn choose<C: TimestampSource>(
        &self,
        conflict: &Conflict,
        state: &str,
        after: &mut CrdtValue,
        clock: &mut C,
    ) -> Result<Option<CrdtValue>> {
        let workflow = after.downcast_mut::<WorkflowCrdt>()?;
        let delta = match &conflict.kind {
            ConflictKind::ConcurrentTransition { conflict: transitions } => {
                workflow.resolve(transitions, state, clock, &self.replica)
            }
            ConflictKind::InvalidTransition { .. } => {
                if workflow.current_state().as_deref() == Some(state) {
                    return Ok(None);
                }
                workflow.advance(state, clock, &self.replica)?
            }
            _ => {
                return Err(SyncError::InvalidOperation(format!(
                    "conflict {} has no state to choose",
                    conflict.fingerprint
                )))
            }
        };
        Ok(Some(CrdtValue::from(delta)))
    }

    /// Record a reviewer's decision on a pending conflict
    ///
    /// `value` must be the current state of the conflicting object; the
    /// returned delta carries the resolving transition.
    pub fn decide<C: TimestampSource>(
        &mut self,
        fingerprint: &str,
        chosen_state: &str,
        reviewer: &str,
        value: &mut CrdtValue,
        clock: &mut C,
    ) -> Result<(Option<CrdtValue>, AuditLog)> {
        let pending = self
            .audit
            .pending_reviews()
            .into_iter()
            .find(|entry| entry.fingerprint == fingerprint)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("no pending review {}", fingerprint)))?;

        let current = detect(
            &pending.object_id,
            None,
            value,
            self.definitions.get(&pending.object_id),
            false,
        );
        let conflict = current
            .into_iter()
            .find(|c| c.fingerprint == fingerprint)
            .ok_or_else(|| {
                SyncError::NotFound(format!("conflict {} no longer present", fingerprint))
            })?;

        let repair = self.choose(&conflict, chosen_state, value, clock)?;
        let audit_delta = self.record(
            &conflict,
            Resolution::Chosen {
                state: chosen_state.to_string(),
            },
            format!("manual:{}", reviewer),
        );
        info!(fingerprint, reviewer, state = chosen_state, "manual review decided");
        Ok((repair, audit_delta))
    }

    /// Close pending reviews on `object_id` whose conflict is gone
    fn supersede_stale(&mut self, object_id: &str, current: &[Conflict], audit_delta: &mut AuditLog) {
        let live: BTreeSet<&str> = current.iter().map(|c| c.fingerprint.as_str()).collect();
        let stale: Vec<AuditEntry> = self
            .audit
            .pending_reviews()
            .into_iter()
            .filter(|entry| entry.object_id == object_id)
            .filter(|entry| !live.contains(entry.fingerprint.as_str()))
            .cloned()
            .collect();

        for entry in stale {
            debug!(fingerprint = %entry.fingerprint, "pending review superseded");
            let delta = self.audit.append(
                &self.replica,
                AuditEntry {
                    recorded_at: Utc::now(),
                    resolution: Resolution::Superseded,
                    resolver: self.replica.clone(),
                    ..entry
                },
            );
            audit_delta.merge(&delta);
        }
    }

    fn record(&mut self, conflict: &Conflict, resolution: Resolution, resolver: String) -> AuditLog {
        let entry = AuditEntry {
            object_id: conflict.object_id.clone(),
            fingerprint: conflict.fingerprint.clone(),
            class: conflict.class,
            recorded_at: Utc::now(),
            operations: conflict.operations(),
            resolution,
            resolver,
            description: conflict.description.clone(),
        };
        self.audit.append(&self.replica, entry)
    }
}

fn after_state(value: &CrdtValue) -> Option<String> {
    match value {
        CrdtValue::Workflow(workflow) => workflow.current_state(),
        _ => None,
    }
}

fn merge_repair(slot: &mut Option<CrdtValue>, repair: CrdtValue) -> Result<()> {
    match slot {
        Some(existing) => existing.merge(&repair),
        None => {
            *slot = Some(repair);
            Ok(())
        }
    }
}
