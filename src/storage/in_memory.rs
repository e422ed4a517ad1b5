//! In-memory storage implementation.
//!
//! Thread-safe maps behind a single async RwLock; holding the write
//! guard across each mutation serializes updates per resource and keeps
//! the secondary indices consistent with the primary map. Suitable for
//! testing and for deployments that accept reset-on-restart semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::resource::{Resource, ResourceType};

use super::{
    BatchNotificationRecord, IdentifierRecord, Storage, StorageError, SubscriptionRecord,
};

#[derive(Default)]
struct Inner {
    /// ri -> resource
    resources: HashMap<String, Resource>,
    /// ri -> identifier record
    identifiers: HashMap<String, IdentifierRecord>,
    /// srn -> ri
    structured: HashMap<String, String>,
    /// csi -> ri
    csi_index: HashMap<String, String>,
    /// pi -> child ris in creation order
    children: HashMap<String, Vec<String>>,
    /// sub ri -> record
    subscriptions: HashMap<String, SubscriptionRecord>,
    /// (sub ri, nu) -> queued notifications
    batches: HashMap<(String, String), Vec<BatchNotificationRecord>>,
}

#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn csi_of(resource: &Resource) -> Option<String> {
    match resource.ty() {
        ResourceType::CseBase | ResourceType::Csr => {
            resource.str_attr("csi").map(str::to_string)
        }
        _ => None,
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_resource(&self, resource: &Resource, srn: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let ri = resource.ri().to_string();
        let pi = resource.pi().to_string();
        let rn = resource.rn();

        if inner.resources.contains_key(&ri) {
            return Err(StorageError::conflict(format!("duplicate ri '{ri}'")));
        }
        if inner.structured.contains_key(srn) {
            return Err(StorageError::conflict(format!("duplicate srn '{srn}'")));
        }
        if let Some(siblings) = inner.children.get(&pi) {
            for sibling in siblings {
                if inner
                    .resources
                    .get(sibling)
                    .is_some_and(|s| s.rn() == rn)
                {
                    return Err(StorageError::conflict(format!(
                        "resource name '{rn}' already exists under '{pi}'"
                    )));
                }
            }
        }

        if let Some(csi) = csi_of(resource) {
            inner.csi_index.insert(csi, ri.clone());
        }
        inner.identifiers.insert(
            ri.clone(),
            IdentifierRecord {
                ri: ri.clone(),
                pi: pi.clone(),
                srn: srn.to_string(),
                ty: resource.ty(),
            },
        );
        inner.structured.insert(srn.to_string(), ri.clone());
        inner.children.entry(pi).or_default().push(ri.clone());
        inner.resources.insert(ri, resource.clone());
        Ok(())
    }

    async fn update_resource(&self, resource: &Resource) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let ri = resource.ri().to_string();
        if !inner.resources.contains_key(&ri) {
            return Err(StorageError::not_found(ri));
        }
        if let Some(csi) = csi_of(resource) {
            inner.csi_index.insert(csi, ri.clone());
        }
        inner.resources.insert(ri, resource.clone());
        Ok(())
    }

    async fn delete_resource(&self, ri: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        let Some(resource) = inner.resources.remove(ri) else {
            return Err(StorageError::not_found(ri));
        };
        if let Some(record) = inner.identifiers.remove(ri) {
            inner.structured.remove(&record.srn);
            if let Some(siblings) = inner.children.get_mut(&record.pi) {
                siblings.retain(|child| child != ri);
            }
        }
        if let Some(csi) = csi_of(&resource) {
            inner.csi_index.remove(&csi);
        }
        inner.children.remove(ri);
        Ok(())
    }

    async fn resource_by_ri(&self, ri: &str) -> Result<Option<Resource>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.resources.get(ri).cloned())
    }

    async fn resource_by_csi(&self, csi: &str) -> Result<Option<Resource>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .csi_index
            .get(csi)
            .and_then(|ri| inner.resources.get(ri))
            .cloned())
    }

    async fn children_of(
        &self,
        ri: &str,
        ty: Option<ResourceType>,
    ) -> Result<Vec<Resource>, StorageError> {
        let inner = self.inner.read().await;
        let children = inner
            .children
            .get(ri)
            .map(|ris| {
                ris.iter()
                    .filter_map(|child| inner.resources.get(child))
                    .filter(|child| ty.is_none_or(|t| child.ty() == t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(children)
    }

    async fn count_children(
        &self,
        ri: &str,
        ty: Option<ResourceType>,
    ) -> Result<usize, StorageError> {
        Ok(self.children_of(ri, ty).await?.len())
    }

    async fn resolve_srn(&self, srn: &str) -> Result<Option<String>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.structured.get(srn).cloned())
    }

    async fn identifier(&self, ri: &str) -> Result<Option<IdentifierRecord>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.identifiers.get(ri).cloned())
    }

    async fn resources_expiring_before(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Resource>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .values()
            .filter(|resource| resource.is_expired(now))
            .cloned()
            .collect())
    }

    async fn add_subscription(&self, record: SubscriptionRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner.subscriptions.insert(record.ri.clone(), record);
        Ok(())
    }

    async fn update_subscription(&self, record: SubscriptionRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        if !inner.subscriptions.contains_key(&record.ri) {
            return Err(StorageError::not_found(record.ri));
        }
        inner.subscriptions.insert(record.ri.clone(), record);
        Ok(())
    }

    async fn remove_subscription(&self, ri: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().await;
        let existed = inner.subscriptions.remove(ri).is_some();
        inner.batches.retain(|(sub_ri, _), _| sub_ri != ri);
        Ok(existed)
    }

    async fn subscription(&self, ri: &str) -> Result<Option<SubscriptionRecord>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.subscriptions.get(ri).cloned())
    }

    async fn subscriptions_for_parent(
        &self,
        pi: &str,
    ) -> Result<Vec<SubscriptionRecord>, StorageError> {
        let inner = self.inner.read().await;
        let mut records: Vec<SubscriptionRecord> = inner
            .subscriptions
            .values()
            .filter(|record| record.pi == pi)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.ri.cmp(&b.ri));
        Ok(records)
    }

    async fn add_batch_notification(
        &self,
        sub_ri: &str,
        nu: &str,
        request: Value,
        tstamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        inner
            .batches
            .entry((sub_ri.to_string(), nu.to_string()))
            .or_default()
            .push(BatchNotificationRecord { tstamp, request });
        Ok(())
    }

    async fn batch_notifications(
        &self,
        sub_ri: &str,
        nu: &str,
    ) -> Result<Vec<BatchNotificationRecord>, StorageError> {
        let inner = self.inner.read().await;
        let mut records = inner
            .batches
            .get(&(sub_ri.to_string(), nu.to_string()))
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|record| record.tstamp);
        Ok(records)
    }

    async fn count_batch_notifications(
        &self,
        sub_ri: &str,
        nu: &str,
    ) -> Result<usize, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .batches
            .get(&(sub_ri.to_string(), nu.to_string()))
            .map(Vec::len)
            .unwrap_or(0))
    }

    async fn remove_batch_notifications(
        &self,
        sub_ri: &str,
        nu: &str,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .batches
            .remove(&(sub_ri.to_string(), nu.to_string()))
            .is_some())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(ty: ResourceType, ri: &str, rn: &str, pi: &str) -> Resource {
        let attrs = json!({"ri": ri, "rn": rn, "pi": pi, "ty": ty.code()});
        Resource::new(ty, attrs.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn indices_stay_consistent() {
        let storage = InMemoryStorage::new();
        let cse = resource(ResourceType::CseBase, "cse-ri", "cse", "");
        storage.put_resource(&cse, "cse").await.unwrap();
        let ae = resource(ResourceType::Ae, "ae-ri", "myAe", "cse-ri");
        storage.put_resource(&ae, "cse/myAe").await.unwrap();

        assert_eq!(
            storage.resolve_srn("cse/myAe").await.unwrap(),
            Some("ae-ri".to_string())
        );
        assert_eq!(storage.children_of("cse-ri", None).await.unwrap().len(), 1);

        storage.delete_resource("ae-ri").await.unwrap();
        assert_eq!(storage.resolve_srn("cse/myAe").await.unwrap(), None);
        assert!(storage.children_of("cse-ri", None).await.unwrap().is_empty());
        assert!(storage.resource_by_ri("ae-ri").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sibling_name_collision_conflicts() {
        let storage = InMemoryStorage::new();
        let cse = resource(ResourceType::CseBase, "cse-ri", "cse", "");
        storage.put_resource(&cse, "cse").await.unwrap();
        let first = resource(ResourceType::Cnt, "cnt-1", "data", "cse-ri");
        storage.put_resource(&first, "cse/data").await.unwrap();

        let second = resource(ResourceType::Cnt, "cnt-2", "data", "cse-ri");
        let err = storage.put_resource(&second, "cse/data2").await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
        // no partial state
        assert!(storage.resource_by_ri("cnt-2").await.unwrap().is_none());
        assert_eq!(storage.resolve_srn("cse/data2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn csi_lookup() {
        let storage = InMemoryStorage::new();
        let mut cse = resource(ResourceType::CseBase, "cse-ri", "cse", "");
        cse.set_attr("csi", json!("/id-in"));
        storage.put_resource(&cse, "cse").await.unwrap();
        assert_eq!(
            storage
                .resource_by_csi("/id-in")
                .await
                .unwrap()
                .unwrap()
                .ri(),
            "cse-ri"
        );
    }

    #[tokio::test]
    async fn batch_notifications_ordered_by_timestamp() {
        let storage = InMemoryStorage::new();
        let base = Utc::now();
        storage
            .add_batch_notification("sub", "http://x", json!({"n": 2}), base + chrono::Duration::seconds(1))
            .await
            .unwrap();
        storage
            .add_batch_notification("sub", "http://x", json!({"n": 1}), base)
            .await
            .unwrap();
        let records = storage.batch_notifications("sub", "http://x").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].request, json!({"n": 1}));
        assert!(storage.remove_batch_notifications("sub", "http://x").await.unwrap());
        assert_eq!(
            storage.count_batch_notifications("sub", "http://x").await.unwrap(),
            0
        );
    }
}
