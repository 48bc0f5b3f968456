//! Validators and delete rules attached to a service.
//!
//! A service declares its hooks once, in
//! [`ServiceSpec::register_rules`](crate::service::ServiceSpec::register_rules), through a
//! [`RuleSetBuilder`]. The resulting [`RuleSet`] is built on first use and cached for the
//! lifetime of the process, one per service and driver type.
//!
//! # Hooks
//!
//! - **Validators** run before an insert or update reaches the database. They receive the
//!   payload, the update filter (for updates) and the caller's session.
//! - **Delete rules** run around a deletion with the list of ids being deleted:
//!   `deny` rules run first, outside the transaction, and may only reject; `pre` rules run
//!   inside the transaction before the documents are removed; `post` rules run inside the
//!   transaction after removal.
//!
//! Delete rules receive a service whose database handle is one cascade level deeper than the
//! caller's. Deletes issued through it, or through services created from its
//! [`database`](crate::service::Service::database), count against
//! [`ServiceConfig::max_cascade_depth`](crate::config::ServiceConfig::max_cascade_depth).
//!
//! Hooks run in registration order within their kind or phase. Registering a hook under a
//! name that is already taken replaces the earlier hook in place, which is how a service
//! that reuses another service's rules overrides one of them.
//!
//! # Example
//!
//! ```ignore
//! fn register_rules<D: Driver>(rules: &mut RuleSetBuilder<Self, D>) {
//!     rules.delete_rule("delete_children", DeletePhase::Pre, |service, session, ids| {
//!         Box::pin(async move {
//!             service.delete_many(PARENT.is_in(ids.to_vec())?, Some(session)).await?;
//!             Ok(())
//!         })
//!     });
//! }
//! ```

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use bson::Document;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    driver::Driver,
    error::ServiceResult,
    service::{Service, ServiceSpec},
};

/// The write operations a validator applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidatorKind {
    /// Runs before inserts.
    Insert,
    /// Runs before updates.
    Update,
    /// Runs before inserts and updates.
    InsertUpdate,
}

impl ValidatorKind {
    /// Whether a validator tagged `self` applies to an operation of kind `operation`.
    pub fn applies_to(self, operation: ValidatorKind) -> bool {
        self == operation
            || self == ValidatorKind::InsertUpdate
            || operation == ValidatorKind::InsertUpdate
    }
}

/// When a delete rule runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletePhase {
    /// Before the transaction; may only reject.
    Deny,
    /// Inside the transaction, before the documents are removed.
    Pre,
    /// Inside the transaction, after the documents are removed.
    Post,
}

/// The data a validator is asked to check.
pub enum Payload<'a, S: ServiceSpec> {
    /// Data about to be inserted.
    Insert(&'a S::Insert),
    /// Changes about to be applied.
    Update(&'a S::Update),
}

impl<S: ServiceSpec> Clone for Payload<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: ServiceSpec> Copy for Payload<'_, S> {}

impl<S: ServiceSpec> fmt::Debug for Payload<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Insert(_) => f.write_str("Payload::Insert"),
            Payload::Update(_) => f.write_str("Payload::Update"),
        }
    }
}

/// Validator callback.
///
/// Arguments: the service, the payload, the update filter (`None` for inserts) and the
/// caller's session.
pub type ValidatorFn<S, D> = Arc<
    dyn for<'a> Fn(
            &'a Service<S, D>,
            Payload<'a, S>,
            Option<&'a Document>,
            Option<&'a mut <D as Driver>::Session>,
        ) -> BoxFuture<'a, ServiceResult<()>>
        + Send
        + Sync,
>;

/// Delete rule callback.
///
/// Arguments: the service, the session of the deletion and the ids being deleted.
pub type DeleteRuleFn<S, D> = Arc<
    dyn for<'a> Fn(
            &'a Service<S, D>,
            &'a mut <D as Driver>::Session,
            &'a [<S as ServiceSpec>::Id],
        ) -> BoxFuture<'a, ServiceResult<()>>
        + Send
        + Sync,
>;

/// A named validator.
pub struct Validator<S: ServiceSpec, D: Driver> {
    name: Cow<'static, str>,
    kind: ValidatorKind,
    pub(crate) callback: ValidatorFn<S, D>,
}

impl<S: ServiceSpec, D: Driver> Validator<S, D> {
    /// The name the validator was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operations the validator applies to.
    pub fn kind(&self) -> ValidatorKind {
        self.kind
    }
}

impl<S: ServiceSpec, D: Driver> Clone for Validator<S, D> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), kind: self.kind, callback: Arc::clone(&self.callback) }
    }
}

impl<S: ServiceSpec, D: Driver> fmt::Debug for Validator<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A named delete rule.
pub struct DeleteRule<S: ServiceSpec, D: Driver> {
    name: Cow<'static, str>,
    phase: DeletePhase,
    pub(crate) callback: DeleteRuleFn<S, D>,
}

impl<S: ServiceSpec, D: Driver> DeleteRule<S, D> {
    /// The name the rule was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the rule runs.
    pub fn phase(&self) -> DeletePhase {
        self.phase
    }
}

impl<S: ServiceSpec, D: Driver> Clone for DeleteRule<S, D> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), phase: self.phase, callback: Arc::clone(&self.callback) }
    }
}

impl<S: ServiceSpec, D: Driver> fmt::Debug for DeleteRule<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteRule")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// The validators and delete rules of a service.
pub struct RuleSet<S: ServiceSpec, D: Driver> {
    validators: Vec<Validator<S, D>>,
    delete_rules: Vec<DeleteRule<S, D>>,
}

type RegistryMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

static REGISTRY: LazyLock<RwLock<RegistryMap>> = LazyLock::new(|| RwLock::new(HashMap::new()));

impl<S: ServiceSpec, D: Driver> RuleSet<S, D> {
    /// Creates an empty builder.
    pub fn builder() -> RuleSetBuilder<S, D> {
        RuleSetBuilder::new()
    }

    /// Returns the cached rule set of service `S` on driver `D`, building it on first use.
    pub fn for_service() -> Arc<Self> {
        let key = TypeId::of::<(S, D)>();
        if let Some(cached) = REGISTRY.read().get(&key).cloned()
            && let Ok(rules) = cached.downcast::<Self>()
        {
            return rules;
        }

        // Built outside the lock: registration may resolve other services' rules.
        let mut builder = RuleSetBuilder::new();
        S::register_rules(&mut builder);
        let built = Arc::new(builder.build());
        debug!(
            service = std::any::type_name::<S>(),
            validators = built.validators.len(),
            delete_rules = built.delete_rules.len(),
            "registered service rules"
        );

        let entry = REGISTRY
            .write()
            .entry(key)
            .or_insert_with(|| built.clone() as Arc<dyn Any + Send + Sync>)
            .clone();
        entry.downcast::<Self>().unwrap_or(built)
    }

    /// Validators that apply to operations of the given kind, in registration order.
    pub fn validators(&self, kind: ValidatorKind) -> impl Iterator<Item = &Validator<S, D>> {
        self.validators
            .iter()
            .filter(move |validator| validator.kind.applies_to(kind))
    }

    /// Delete rules of the given phase, in registration order.
    pub fn delete_rules(&self, phase: DeletePhase) -> impl Iterator<Item = &DeleteRule<S, D>> {
        self.delete_rules
            .iter()
            .filter(move |rule| rule.phase == phase)
    }

    /// Rules that may reject a deletion before its transaction starts.
    pub fn deny_delete_rules(&self) -> impl Iterator<Item = &DeleteRule<S, D>> {
        self.delete_rules(DeletePhase::Deny)
    }

    /// Rules run inside the transaction before the documents are removed.
    pub fn pre_delete_rules(&self) -> impl Iterator<Item = &DeleteRule<S, D>> {
        self.delete_rules(DeletePhase::Pre)
    }

    /// Rules run inside the transaction after the documents are removed.
    pub fn post_delete_rules(&self) -> impl Iterator<Item = &DeleteRule<S, D>> {
        self.delete_rules(DeletePhase::Post)
    }

    /// Whether deletions need to go through the rule pipeline.
    pub fn has_delete_rules(&self) -> bool {
        !self.delete_rules.is_empty()
    }
}

impl<S: ServiceSpec, D: Driver> Clone for RuleSet<S, D> {
    fn clone(&self) -> Self {
        Self { validators: self.validators.clone(), delete_rules: self.delete_rules.clone() }
    }
}

impl<S: ServiceSpec, D: Driver> Default for RuleSet<S, D> {
    fn default() -> Self {
        Self { validators: Vec::new(), delete_rules: Vec::new() }
    }
}

impl<S: ServiceSpec, D: Driver> fmt::Debug for RuleSet<S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("validators", &self.validators)
            .field("delete_rules", &self.delete_rules)
            .finish()
    }
}

/// Collects the hooks of a service.
pub struct RuleSetBuilder<S: ServiceSpec, D: Driver> {
    rules: RuleSet<S, D>,
}

impl<S: ServiceSpec, D: Driver> Default for RuleSetBuilder<S, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ServiceSpec, D: Driver> RuleSetBuilder<S, D> {
    /// Creates a builder with no rules.
    pub fn new() -> Self {
        Self { rules: RuleSet::default() }
    }

    /// Registers a validator, replacing any validator with the same name in place.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique name of the validator, used in error messages and for overriding
    /// * `kind` - The operations the validator applies to
    /// * `callback` - The validator itself
    pub fn validator<F>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        kind: ValidatorKind,
        callback: F,
    ) -> &mut Self
    where
        F: for<'a> Fn(
                &'a Service<S, D>,
                Payload<'a, S>,
                Option<&'a Document>,
                Option<&'a mut D::Session>,
            ) -> BoxFuture<'a, ServiceResult<()>>
            + Send
            + Sync
            + 'static,
    {
        let validator = Validator { name: name.into(), kind, callback: Arc::new(callback) };
        match self
            .rules
            .validators
            .iter_mut()
            .find(|existing| existing.name == validator.name)
        {
            Some(existing) => *existing = validator,
            None => self.rules.validators.push(validator),
        }
        self
    }

    /// Registers a delete rule, replacing any delete rule with the same name in place.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique name of the rule, used in error messages and for overriding
    /// * `phase` - When the rule runs
    /// * `callback` - The rule itself
    pub fn delete_rule<F>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        phase: DeletePhase,
        callback: F,
    ) -> &mut Self
    where
        F: for<'a> Fn(
                &'a Service<S, D>,
                &'a mut D::Session,
                &'a [S::Id],
            ) -> BoxFuture<'a, ServiceResult<()>>
            + Send
            + Sync
            + 'static,
    {
        let rule = DeleteRule { name: name.into(), phase, callback: Arc::new(callback) };
        match self
            .rules
            .delete_rules
            .iter_mut()
            .find(|existing| existing.name == rule.name)
        {
            Some(existing) => *existing = rule,
            None => self.rules.delete_rules.push(rule),
        }
        self
    }

    /// Removes the validator or delete rule registered under `name`.
    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.rules.validators.retain(|validator| validator.name != name);
        self.rules.delete_rules.retain(|rule| rule.name != name);
        self
    }

    /// Finishes registration.
    pub fn build(self) -> RuleSet<S, D> {
        self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_kinds_overlap_with_insert_update() {
        assert!(ValidatorKind::Insert.applies_to(ValidatorKind::Insert));
        assert!(!ValidatorKind::Insert.applies_to(ValidatorKind::Update));
        assert!(ValidatorKind::InsertUpdate.applies_to(ValidatorKind::Update));
        assert!(ValidatorKind::Update.applies_to(ValidatorKind::InsertUpdate));
    }
}
