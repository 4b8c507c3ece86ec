//! Fixed interpreter over compiled policy rules.

use super::rules::{Decision, Operation, PolicyConfig, PolicyContext, Rule, RuleClass};
use crate::error::{Result, SyncError};
use crate::types::{Identity, Record};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// One immutable policy epoch.
#[derive(Debug)]
pub struct CompiledPolicy {
    epoch: u64,
    fingerprint: String,
    by_class: BTreeMap<RuleClass, Vec<Rule>>,
}

impl CompiledPolicy {
    fn compile(config: &PolicyConfig, epoch: u64) -> Self {
        let mut by_class: BTreeMap<RuleClass, Vec<Rule>> = BTreeMap::new();
        for rule in &config.rules {
            by_class.entry(rule.class).or_default().push(rule.clone());
        }
        Self {
            epoch,
            fingerprint: config.fingerprint(),
            by_class,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// First matching rule grants; every later matching rule can only narrow.
    /// No matching rule denies.
    fn class_decision(&self, class: RuleClass, ctx: &PolicyContext<'_>) -> Decision {
        let mut result: Option<Decision> = None;
        for rule in self.by_class.get(&class).into_iter().flatten() {
            if !rule.predicate.matches(ctx) {
                continue;
            }
            result = Some(match result {
                None => rule.effect.clone(),
                Some(current) => current.narrow(&rule.effect),
            });
            if matches!(result, Some(Decision::Deny)) {
                break;
            }
        }
        result.unwrap_or(Decision::Deny)
    }

    pub fn admit(&self, identity: &Identity) -> Decision {
        let ctx = PolicyContext {
            identity: Some(identity),
            record_type: None,
            record: None,
            operation: Operation::Connect,
            scope: None,
        };
        self.class_decision(RuleClass::Connection, &ctx)
    }

    pub fn evaluate(
        &self,
        identity: &Identity,
        record: &Record,
        operation: Operation,
        attribute: Option<&str>,
    ) -> Decision {
        let mut decision = self.admit(identity);
        if operation != Operation::Connect && !decision.is_deny() {
            let class = match operation {
                Operation::Read => RuleClass::Broadcast,
                Operation::Query => RuleClass::Scope,
                _ => RuleClass::Change,
            };
            let ctx = PolicyContext {
                identity: Some(identity),
                record_type: Some(&record.key.record_type),
                record: Some(record),
                operation,
                scope: None,
            };
            decision = decision.narrow(&self.class_decision(class, &ctx));
        }
        match attribute {
            Some(attribute) if decision.allows(attribute) => Decision::AllowFull,
            Some(_) => Decision::Deny,
            None => decision,
        }
    }

    pub fn scope_decision(&self, record_type: &str, scope: &str) -> Decision {
        let ctx = PolicyContext {
            identity: None,
            record_type: Some(record_type),
            record: None,
            operation: Operation::Query,
            scope: Some(scope),
        };
        self.class_decision(RuleClass::Scope, &ctx)
    }
}

/// Pure decision function over (session identity, record, operation, attribute).
///
/// Reads take a snapshot of the current epoch, so a concurrent [`reload`]
/// is never observed half-applied.
///
/// [`reload`]: PolicyEvaluator::reload
pub struct PolicyEvaluator {
    current: RwLock<Arc<CompiledPolicy>>,
}

impl PolicyEvaluator {
    /// Compile the initial epoch. An empty rule set is a configuration error.
    pub fn new(config: &PolicyConfig) -> Result<Self> {
        if config.is_empty() {
            return Err(SyncError::ConfigurationMissing(
                "policy has no rules".to_string(),
            ));
        }
        Ok(Self {
            current: RwLock::new(Arc::new(CompiledPolicy::compile(config, 1))),
        })
    }

    /// The epoch in force right now.
    pub fn snapshot(&self) -> Arc<CompiledPolicy> {
        Arc::clone(&self.current.read())
    }

    pub fn epoch(&self) -> u64 {
        self.current.read().epoch
    }

    /// Install a new rule set as a new epoch. Identical rules keep the epoch.
    pub fn reload(&self, config: &PolicyConfig) -> Result<u64> {
        if config.is_empty() {
            return Err(SyncError::ConfigurationMissing(
                "policy has no rules".to_string(),
            ));
        }
        let mut current = self.current.write();
        if current.fingerprint == config.fingerprint() {
            return Ok(current.epoch);
        }
        let compiled = CompiledPolicy::compile(config, current.epoch + 1);
        let short = &compiled.fingerprint[..12];
        info!(
            epoch = compiled.epoch,
            fingerprint = %short,
            rules = config.rules.len(),
            "policy epoch installed"
        );
        *current = Arc::new(compiled);
        Ok(current.epoch)
    }

    /// Connection admission.
    pub fn admit(&self, identity: &Identity) -> Decision {
        self.snapshot().admit(identity)
    }

    /// Decide what `identity` may do with `record`. With `attribute`, the
    /// answer is reduced to `AllowFull` or `Deny` for that attribute alone.
    pub fn evaluate(
        &self,
        identity: &Identity,
        record: &Record,
        operation: Operation,
        attribute: Option<&str>,
    ) -> Decision {
        self.snapshot()
            .evaluate(identity, record, operation, attribute)
    }

    /// Scope regulation, independent of any session.
    pub fn scope_decision(&self, record_type: &str, scope: &str) -> Decision {
        self.snapshot().scope_decision(record_type, scope)
    }
}
