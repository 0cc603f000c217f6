//! Subscription records keyed by their deterministic identity.

use super::resource::ResourceType;
use crate::error::{Result, SyncError};
use crate::identity::subscription_identity;
use crate::types::{CacheMeta, EntityKind, EntityRef, Params, SubscriptionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Per-registration options.
#[derive(Clone, Debug)]
pub struct RegisterOptions {
    /// Send cached validators as conditional headers.
    /// Default: true
    pub conditional: bool,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self { conditional: true }
    }
}

/// One polled remote resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: SubscriptionId,
    pub resource: ResourceType,
    pub params: Params,
    pub conditional: bool,
    pub cache: CacheMeta,
    /// Identities of fetched entities (of `resource.entity_kind()`), in
    /// first-seen order.
    pub fetched: Vec<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl SubscriptionRecord {
    pub fn entity_kind(&self) -> EntityKind {
        self.resource.entity_kind()
    }

    pub fn fetched_refs(&self) -> impl Iterator<Item = EntityRef> + '_ {
        let kind = self.entity_kind();
        self.fetched.iter().map(move |id| EntityRef::new(kind, id.clone()))
    }
}

/// Result of [`SubscriptionRegistry::register`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registered {
    pub id: SubscriptionId,
    /// False when the subscription already existed.
    pub created: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRegistry {
    records: BTreeMap<SubscriptionId, SubscriptionRecord>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity a registration of `(resource, params)` would get.
    pub fn identity_of(resource: ResourceType, params: &Params) -> SubscriptionId {
        SubscriptionId(subscription_identity(resource.as_str(), params))
    }

    /// Register a subscription. An existing record is returned unchanged.
    pub fn register(
        &mut self,
        resource: ResourceType,
        params: Params,
        options: &RegisterOptions,
    ) -> Result<Registered> {
        resource.validate(&params)?;

        let id = Self::identity_of(resource, &params);
        if self.records.contains_key(&id) {
            return Ok(Registered { id, created: false });
        }

        let now = Timestamp::now();
        self.records.insert(
            id.clone(),
            SubscriptionRecord {
                id: id.clone(),
                resource,
                params,
                conditional: options.conditional,
                cache: CacheMeta::default(),
                fetched: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(Registered { id, created: true })
    }

    /// Append unseen entity ids and replace the cache metadata.
    ///
    /// Returns how many ids were new to this subscription.
    pub fn record_fetch_result(
        &mut self,
        id: &SubscriptionId,
        entity_ids: &[String],
        cache: CacheMeta,
    ) -> Result<usize> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| SyncError::SubscriptionNotFound(id.clone()))?;

        let mut known: HashSet<String> = record.fetched.iter().cloned().collect();
        let before = record.fetched.len();
        for entity_id in entity_ids {
            if known.insert(entity_id.clone()) {
                record.fetched.push(entity_id.clone());
            }
        }

        record.cache = cache;
        record.updated_at = Timestamp::now();
        Ok(record.fetched.len() - before)
    }

    /// Keep only the fetched ids `keep` accepts, in their existing order.
    /// Returns how many were dropped.
    pub fn retain_fetched(&mut self, id: &SubscriptionId, mut keep: impl FnMut(&str) -> bool) -> usize {
        let Some(record) = self.records.get_mut(id) else {
            return 0;
        };
        let before = record.fetched.len();
        record.fetched.retain(|entity_id| keep(entity_id));
        before - record.fetched.len()
    }

    /// Remove a record. Fetched entities are left for the garbage collector.
    pub fn unregister(&mut self, id: &SubscriptionId) -> Option<SubscriptionRecord> {
        self.records.remove(id)
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<&SubscriptionRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.records.contains_key(id)
    }

    pub fn ids(&self) -> BTreeSet<SubscriptionId> {
        self.records.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Params {
        Params::from([("username".to_string(), "alice".to_string())])
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        let options = RegisterOptions::default();

        let first = registry.register(ResourceType::UserEvents, alice(), &options).unwrap();
        assert!(first.created);

        let mut shouted = Params::new();
        shouted.insert("username".into(), "ALICE".into());
        let second = registry.register(ResourceType::UserEvents, shouted, &options).unwrap();

        assert_eq!(first.id, second.id);
        assert!(!second.created);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&first.id).unwrap().params["username"], "alice");
    }

    #[test]
    fn test_register_validates_params() {
        let mut registry = SubscriptionRegistry::new();
        let result = registry.register(ResourceType::OrgEvents, Params::new(), &RegisterOptions::default());
        assert!(matches!(result, Err(SyncError::MissingParameter { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_record_fetch_result_unions_in_order() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry
            .register(ResourceType::UserEvents, alice(), &RegisterOptions::default())
            .unwrap()
            .id;

        let cache = CacheMeta {
            etag: Some("\"v1\"".into()),
            ..Default::default()
        };
        let added = registry
            .record_fetch_result(&id, &["e3".into(), "e2".into()], cache)
            .unwrap();
        assert_eq!(added, 2);

        let cache = CacheMeta {
            etag: Some("\"v2\"".into()),
            ..Default::default()
        };
        let added = registry
            .record_fetch_result(&id, &["e4".into(), "e3".into(), "e4".into()], cache)
            .unwrap();
        assert_eq!(added, 1);

        let record = registry.get(&id).unwrap();
        assert_eq!(record.fetched, vec!["e3", "e2", "e4"]);
        assert_eq!(record.cache.etag.as_deref(), Some("\"v2\""));
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn test_retain_fetched_keeps_order() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry
            .register(ResourceType::UserEvents, alice(), &RegisterOptions::default())
            .unwrap()
            .id;
        registry
            .record_fetch_result(&id, &["e1".into(), "e2".into(), "e3".into()], CacheMeta::default())
            .unwrap();

        assert_eq!(registry.retain_fetched(&id, |e| e != "e2"), 1);
        assert_eq!(registry.get(&id).unwrap().fetched, vec!["e1", "e3"]);
        assert_eq!(registry.retain_fetched(&SubscriptionId("ghost".into()), |_| false), 0);
    }

    #[test]
    fn test_unknown_and_unregister() {
        let mut registry = SubscriptionRegistry::new();
        let ghost = SubscriptionId("ghost".into());
        assert!(matches!(
            registry.record_fetch_result(&ghost, &[], CacheMeta::default()),
            Err(SyncError::SubscriptionNotFound(_))
        ));

        let id = registry
            .register(ResourceType::PublicEvents, Params::new(), &RegisterOptions::default())
            .unwrap()
            .id;
        assert!(registry.unregister(&id).is_some());
        assert!(registry.unregister(&id).is_none());
        assert!(registry.ids().is_empty());
    }
}
