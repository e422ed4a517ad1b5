//! Storage abstraction for the resource tree.
//!
//! The [`Storage`] trait covers four persisted families: the primary
//! resource map keyed by `ri`, the identifier records carrying the
//! secondary indices (`srn` ↔ `ri`, `csi` → `ri`, parent → children),
//! the flattened subscription records consulted on every resource event,
//! and the batch-notification queues keyed by `(subscription ri, target
//! uri)`.
//!
//! Guarantees required from implementations:
//!
//! * mutations to a single `ri` are serialized;
//! * the secondary indices are consistent with the primary map after
//!   every call returns;
//! * a write that would duplicate an `ri`, an `srn`, or a sibling `rn`
//!   fails with [`StorageError::Conflict`] and leaves no partial state.

pub mod errors;
pub mod in_memory;

pub use errors::StorageError;
pub use in_memory::InMemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::resource::{Resource, ResourceType};
use crate::validation::parse_iso8601_duration;

/// Secondary-index record kept per resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierRecord {
    pub ri: String,
    pub pi: String,
    pub srn: String,
    pub ty: ResourceType,
}

/// Flattened subscription data, denormalized from the `<sub>` resource
/// for cheap per-event matching.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub ri: String,
    pub pi: String,
    /// Subscription creator; self-notifications are suppressed for it
    pub originator: String,
    pub nus: Vec<String>,
    /// Notification event types (empty means resourceUpdate only)
    pub net: Vec<i64>,
    /// Child-type filter for create/delete-direct-child events
    pub chty: Option<Vec<i64>>,
    /// Modified-attribute filter for update events
    pub atr: Option<Vec<String>>,
    pub bn_num: Option<u64>,
    pub bn_dur: Option<Duration>,
    pub ln: bool,
    pub nct: i64,
    pub exc: Option<u32>,
    pub acrs: Vec<String>,
    pub su: Option<String>,
}

impl SubscriptionRecord {
    /// Build the record from a validated `<sub>` resource.
    pub fn from_resource(resource: &Resource, originator: &str) -> Self {
        let enc = resource.attr("enc").and_then(Value::as_object);
        let net = enc
            .and_then(|e| e.get("net"))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_else(|| vec![1]);
        let chty = enc
            .and_then(|e| e.get("chty"))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_i64).collect());
        let atr = enc.and_then(|e| e.get("atr")).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });
        let bn = resource.attr("bn").and_then(Value::as_object);
        Self {
            ri: resource.ri().to_string(),
            pi: resource.pi().to_string(),
            originator: originator.to_string(),
            nus: resource.str_list_attr("nu"),
            net,
            chty,
            atr,
            bn_num: bn
                .and_then(|b| b.get("num"))
                .and_then(Value::as_i64)
                .map(|n| n as u64),
            bn_dur: bn
                .and_then(|b| b.get("dur"))
                .and_then(Value::as_str)
                .and_then(parse_iso8601_duration),
            ln: resource.bool_attr("ln").unwrap_or(false),
            nct: resource.int_attr("nct").unwrap_or(1),
            exc: resource.int_attr("exc").map(|n| n as u32),
            acrs: resource.str_list_attr("acrs"),
            su: resource.str_attr("su").map(str::to_string),
        }
    }

    pub fn has_batching(&self) -> bool {
        self.bn_num.is_some() || self.bn_dur.is_some()
    }
}

/// One stored batch notification.
#[derive(Debug, Clone)]
pub struct BatchNotificationRecord {
    pub tstamp: DateTime<Utc>,
    pub request: Value,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new resource with its structured name.
    async fn put_resource(&self, resource: &Resource, srn: &str) -> Result<(), StorageError>;

    /// Replace the attributes of an existing resource.
    async fn update_resource(&self, resource: &Resource) -> Result<(), StorageError>;

    /// Remove a single resource and its index entries. Children are the
    /// dispatcher's responsibility.
    async fn delete_resource(&self, ri: &str) -> Result<(), StorageError>;

    async fn resource_by_ri(&self, ri: &str) -> Result<Option<Resource>, StorageError>;

    /// Look up a CSEBase or remoteCSE resource by its CSE-ID.
    async fn resource_by_csi(&self, csi: &str) -> Result<Option<Resource>, StorageError>;

    /// Direct children in creation order, optionally filtered by type.
    async fn children_of(
        &self,
        ri: &str,
        ty: Option<ResourceType>,
    ) -> Result<Vec<Resource>, StorageError>;

    async fn count_children(
        &self,
        ri: &str,
        ty: Option<ResourceType>,
    ) -> Result<usize, StorageError>;

    /// Map a structured name to a resource identifier.
    async fn resolve_srn(&self, srn: &str) -> Result<Option<String>, StorageError>;

    async fn identifier(&self, ri: &str) -> Result<Option<IdentifierRecord>, StorageError>;

    /// Resources whose `et` lies at or before `now`.
    async fn resources_expiring_before(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Resource>, StorageError>;

    async fn add_subscription(&self, record: SubscriptionRecord) -> Result<(), StorageError>;

    async fn update_subscription(&self, record: SubscriptionRecord) -> Result<(), StorageError>;

    async fn remove_subscription(&self, ri: &str) -> Result<bool, StorageError>;

    async fn subscription(&self, ri: &str) -> Result<Option<SubscriptionRecord>, StorageError>;

    async fn subscriptions_for_parent(
        &self,
        pi: &str,
    ) -> Result<Vec<SubscriptionRecord>, StorageError>;

    async fn add_batch_notification(
        &self,
        sub_ri: &str,
        nu: &str,
        request: Value,
        tstamp: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Stored batch notifications ordered by enqueue timestamp.
    async fn batch_notifications(
        &self,
        sub_ri: &str,
        nu: &str,
    ) -> Result<Vec<BatchNotificationRecord>, StorageError>;

    async fn count_batch_notifications(
        &self,
        sub_ri: &str,
        nu: &str,
    ) -> Result<usize, StorageError>;

    async fn remove_batch_notifications(
        &self,
        sub_ri: &str,
        nu: &str,
    ) -> Result<bool, StorageError>;

    /// Drop everything. Used by reset-on-startup.
    async fn clear(&self) -> Result<(), StorageError>;
}
