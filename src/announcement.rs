//! Announcement of resources to remote CSEs.
//!
//! A resource created or updated with a non-empty `at` list is mirrored
//! to each listed CSE as its *Annc* variant, carrying the mandatory-
//! announced attributes, the optional attributes named in `aa`, and a
//! `lnk` back to the original. After a successful announce the local
//! `at` entry is rewritten to `<csi>/<remote ri>` so the original points
//! at its mirrors; removing a target (or deleting the resource) deletes
//! the mirror. Mirroring runs off-request on the event worker.

use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::cse::Cse;
use crate::error::CseResult;
use crate::event::ResourceEvent;
use crate::request::Operation;
use crate::resource::{Resource, ResourceType};
use crate::validation::PolicyRegistry;

/// One live mirror of a local resource.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mirror {
    csi: String,
    remote_ri: String,
}

#[derive(Debug, Default)]
pub struct AnnouncementManager {
    /// local ri -> mirrors
    mirrors: Mutex<HashMap<String, Vec<Mirror>>>,
}

impl AnnouncementManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite `aa` in place: non-announceable attribute names are
    /// silently stripped. When every requested attribute was
    /// non-announceable the key stays with a null value.
    pub fn normalize_aa(&self, registry: &PolicyRegistry, resource: &mut Resource) {
        if !resource.has_attr("aa") {
            return;
        }
        let requested = resource.aa();
        let (_, optional) = registry.announced_attributes(resource.ty());
        let kept: Vec<String> = requested
            .iter()
            .filter(|name| optional.contains(&name.as_str()))
            .cloned()
            .collect();
        if kept.is_empty() {
            resource.set_attr("aa", Value::Null);
        } else {
            resource.set_attr("aa", json!(kept));
        }
    }

    pub async fn on_resource_event(&self, cse: &Cse, event: &ResourceEvent) {
        let result = match event {
            ResourceEvent::Created { resource, .. } => self.sync_mirrors(cse, resource).await,
            ResourceEvent::Updated { resource, modified } => {
                if modified.contains_key("at")
                    || modified.contains_key("aa")
                    || self.has_mirrors(resource.ri()).await
                {
                    self.sync_mirrors(cse, resource).await
                } else {
                    Ok(())
                }
            }
            ResourceEvent::Deleted { resource } | ResourceEvent::Expired { resource } => {
                self.deannounce_all(cse, resource).await;
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("announcement handling failed: {err}");
        }
    }

    async fn has_mirrors(&self, ri: &str) -> bool {
        self.mirrors
            .lock()
            .await
            .get(ri)
            .is_some_and(|mirrors| !mirrors.is_empty())
    }

    /// Bring the mirrors of a resource in line with its `at` list:
    /// announce new targets, update surviving mirrors, delete dropped
    /// ones, and rewrite `at` to the mirror addresses.
    async fn sync_mirrors(&self, cse: &Cse, resource: &Resource) -> CseResult<()> {
        let at = resource.at();
        let current = self
            .mirrors
            .lock()
            .await
            .get(resource.ri())
            .cloned()
            .unwrap_or_default();

        // Bare CSE-IDs are announce requests; `<csi>/<ri>` entries refer
        // to mirrors that already exist.
        let pending: Vec<String> = at
            .iter()
            .filter(|entry| is_bare_csi(entry))
            .cloned()
            .collect();
        let referenced: Vec<&str> = at
            .iter()
            .filter(|entry| !is_bare_csi(entry))
            .map(|s| s.as_str())
            .collect();

        let mut kept = Vec::new();
        for mirror in &current {
            let address = mirror_address(mirror);
            if referenced.contains(&address.as_str()) || pending.contains(&mirror.csi) {
                kept.push(mirror.clone());
            } else {
                self.delete_mirror(cse, mirror).await;
            }
        }

        // Update surviving mirrors with the current projection.
        if let Some(annc_ty) = resource.ty().announced() {
            for mirror in &kept {
                let body = self.projection(cse, resource, annc_ty, false);
                let path = format!("/{}", mirror.remote_ri);
                if let Err(err) = cse
                    .requests
                    .send_remote_operation(cse, Operation::Update, &mirror.csi, &path, None, Some(body))
                    .await
                {
                    warn!(
                        "updating mirror of '{}' on '{}' failed: {err}",
                        resource.ri(),
                        mirror.csi
                    );
                }
            }
        }

        // Announce to new targets.
        for csi in pending {
            if kept.iter().any(|mirror| mirror.csi == csi) {
                continue;
            }
            match self.announce_to(cse, resource, &csi).await {
                Ok(mirror) => kept.push(mirror),
                Err(err) => warn!(
                    "announcing '{}' to '{csi}' failed: {err}",
                    resource.ri()
                ),
            }
        }

        self.mirrors
            .lock()
            .await
            .insert(resource.ri().to_string(), kept.clone());

        // Rewrite the local `at` to point at the mirrors. Bare targets
        // whose announce failed stay in place for a later retry.
        if let Ok(Some(mut stored)) = cse.storage.resource_by_ri(resource.ri()).await {
            let mut addresses: Vec<String> = kept.iter().map(mirror_address).collect();
            for entry in stored.at() {
                if is_bare_csi(&entry) && !kept.iter().any(|mirror| mirror.csi == entry) {
                    addresses.push(entry);
                }
            }
            if stored.at() != addresses {
                if addresses.is_empty() {
                    stored.remove_attr("at");
                } else {
                    stored.set_attr("at", json!(addresses));
                }
                let _ = cse.storage.update_resource(&stored).await;
            }
        }
        Ok(())
    }

    /// Create the *Annc* mirror on one remote CSE.
    async fn announce_to(&self, cse: &Cse, resource: &Resource, csi: &str) -> CseResult<Mirror> {
        let annc_ty = resource.ty().announced().ok_or_else(|| {
            crate::error::CseError::bad_request(format!(
                "resource type {} cannot be announced",
                resource.ty()
            ))
        })?;
        let body = self.projection(cse, resource, annc_ty, true);
        debug!("announcing '{}' to '{csi}'", resource.ri());
        let response = cse
            .requests
            .send_remote_operation(cse, Operation::Create, csi, "", Some(annc_ty), Some(body))
            .await?;
        let remote_ri = response
            .body
            .as_ref()
            .and_then(|body| body.get(annc_ty.type_prefix()))
            .and_then(|inner| inner.get("ri"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                crate::error::CseError::internal("announce response carries no resource identifier")
            })?
            .to_string();
        info!(
            "announced '{}' to '{csi}' as '{remote_ri}'",
            resource.ri()
        );
        Ok(Mirror {
            csi: csi.to_string(),
            remote_ri,
        })
    }

    /// The announced representation: mandatory-announced attributes and
    /// the optional attributes listed in `aa`. Create requests
    /// additionally carry the mirror name and the `lnk` back-reference.
    fn projection(
        &self,
        cse: &Cse,
        resource: &Resource,
        annc_ty: ResourceType,
        is_create: bool,
    ) -> Value {
        let registry = cse.validator.registry();
        let (mandatory, optional) = registry.announced_attributes(resource.ty());
        let mut attributes = Map::new();
        if is_create {
            attributes.insert("rn".into(), json!(format!("{}_Annc", resource.rn())));
            attributes.insert(
                "lnk".into(),
                json!(format!("{}/{}", cse.config.csi, resource.ri())),
            );
        }
        for name in mandatory {
            if let Some(value) = resource.attr(name) {
                attributes.insert(name.to_string(), value.clone());
            }
        }
        for name in resource.aa() {
            if optional.contains(&name.as_str()) {
                if let Some(value) = resource.attr(&name) {
                    attributes.insert(name, value.clone());
                }
            }
        }
        json!({ (annc_ty.type_prefix()): Value::Object(attributes) })
    }

    /// Remove every mirror of a deleted resource. Delivery errors are
    /// logged and ignored.
    pub async fn deannounce_all(&self, cse: &Cse, resource: &Resource) {
        let mirrors = self
            .mirrors
            .lock()
            .await
            .remove(resource.ri())
            .unwrap_or_default();
        for mirror in mirrors {
            self.delete_mirror(cse, &mirror).await;
        }
    }

    async fn delete_mirror(&self, cse: &Cse, mirror: &Mirror) {
        debug!("removing mirror '{}' on '{}'", mirror.remote_ri, mirror.csi);
        let path = format!("/{}", mirror.remote_ri);
        if let Err(err) = cse
            .requests
            .send_remote_operation(cse, Operation::Delete, &mirror.csi, &path, None, None)
            .await
        {
            warn!(
                "deleting mirror '{}' on '{}' failed: {err}",
                mirror.remote_ri, mirror.csi
            );
        }
    }
}

fn is_bare_csi(entry: &str) -> bool {
    entry.starts_with('/') && entry[1..].split('/').count() == 1
}

fn mirror_address(mirror: &Mirror) -> String {
    format!("{}/{}", mirror.csi, mirror.remote_ri)
}
