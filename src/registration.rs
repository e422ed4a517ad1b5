//! Registration lifecycle hooks and the expiration monitor.
//!
//! Creation hooks run after validation and before persistence: AEs get
//! their `aei` assigned (and duplicate registrations rejected),
//! containers get their counters initialized. Container counters are
//! maintained after every contentInstance add/remove, trimming the
//! oldest instances to honour `mni`/`mbs`. The expiration monitor
//! periodically deletes resources whose `et` has passed, acting as the
//! CSE itself.

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cse::{Cse, DeleteCause};
use crate::error::{CseError, CseResult, ResponseStatusCode};
use crate::resource::{Resource, ResourceType, unique_aei};

#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrationManager;

impl RegistrationManager {
    pub fn new() -> Self {
        Self
    }

    /// Hook for resource creation. May rewrite attributes (AE `aei`);
    /// returns the originator the response should carry, when it
    /// differs from the request originator.
    pub async fn check_resource_creation(
        &self,
        cse: &Cse,
        resource: &mut Resource,
        _parent: &Resource,
        originator: &str,
    ) -> CseResult<Option<String>> {
        match resource.ty() {
            ResourceType::Ae => self.handle_ae_registration(cse, resource, originator).await,
            ResourceType::Cnt => {
                resource.set_attr("st", json!(0));
                resource.set_attr("cni", json!(0));
                resource.set_attr("cbs", json!(0));
                Ok(None)
            }
            ResourceType::Csr => {
                info!(
                    "remote CSE '{}' registering",
                    resource.str_attr("csi").unwrap_or_default()
                );
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// AE registration: assign the AE-ID. A bootstrap originator (empty,
    /// `C` or `S`) gets a generated `aei` with that stem; a concrete
    /// originator becomes the `aei` itself and must not be registered
    /// twice.
    async fn handle_ae_registration(
        &self,
        cse: &Cse,
        resource: &mut Resource,
        originator: &str,
    ) -> CseResult<Option<String>> {
        let aei = match originator {
            "" | "C" | "S" => {
                let stem = if originator == "S" { "S" } else { "C" };
                unique_aei(stem)
            }
            _ => {
                let registered = cse
                    .storage
                    .children_of(&cse.config.ri, Some(ResourceType::Ae))
                    .await?;
                if registered
                    .iter()
                    .any(|ae| ae.str_attr("aei") == Some(originator))
                {
                    return Err(CseError::with_debug(
                        ResponseStatusCode::OriginatorHasAlreadyRegistered,
                        format!("originator '{originator}' already registered an AE"),
                    ));
                }
                originator.to_string()
            }
        };
        debug!("assigning aei '{aei}'");
        resource.set_attr("aei", json!(aei));
        resource.set_attr_default("rr", json!(false));
        Ok(Some(aei))
    }

    /// Hook for resource deletion of registration-relevant resources.
    pub fn check_resource_deletion(&self, resource: &Resource) {
        match resource.ty() {
            ResourceType::Ae => {
                info!("AE '{}' deregistering", resource.str_attr("aei").unwrap_or_default());
            }
            ResourceType::Csr => {
                info!(
                    "remote CSE '{}' deregistering",
                    resource.str_attr("csi").unwrap_or_default()
                );
            }
            _ => {}
        }
    }

    /// A contentInstance was added under `cnt_ri`: bump the state tag,
    /// trim to `mni`/`mbs`, and refresh `cni`/`cbs`.
    pub async fn container_child_added(&self, cse: &Cse, cnt_ri: &str) -> CseResult<()> {
        let Some(mut cnt) = cse.storage.resource_by_ri(cnt_ri).await? else {
            return Ok(());
        };
        let st = cnt.int_attr("st").unwrap_or(0) + 1;
        cnt.set_attr("st", json!(st));

        let mni = cnt.int_attr("mni");
        let mbs = cnt.int_attr("mbs");
        loop {
            let instances = cse
                .storage
                .children_of(cnt_ri, Some(ResourceType::Cin))
                .await?;
            let cni = instances.len() as i64;
            let cbs: i64 = instances
                .iter()
                .map(|cin| cin.int_attr("cs").unwrap_or(0))
                .sum();
            let over_mni = mni.is_some_and(|limit| cni > limit);
            let over_mbs = mbs.is_some_and(|limit| cbs > limit);
            if !(over_mni || over_mbs) {
                cnt.set_attr("cni", json!(cni));
                cnt.set_attr("cbs", json!(cbs));
                break;
            }
            let Some(oldest) = instances.first() else { break };
            debug!("trimming oldest contentInstance '{}' from '{cnt_ri}'", oldest.ri());
            cse.delete_resource_tree(oldest.ri(), &cse.config.originator, DeleteCause::Trim)
                .await?;
        }
        cse.storage.update_resource(&cnt).await?;
        Ok(())
    }

    /// A contentInstance was removed under `cnt_ri`: refresh the usage
    /// counters.
    pub async fn container_child_removed(&self, cse: &Cse, cnt_ri: &str) -> CseResult<()> {
        let Some(mut cnt) = cse.storage.resource_by_ri(cnt_ri).await? else {
            return Ok(());
        };
        let instances = cse
            .storage
            .children_of(cnt_ri, Some(ResourceType::Cin))
            .await?;
        let cbs: i64 = instances
            .iter()
            .map(|cin| cin.int_attr("cs").unwrap_or(0))
            .sum();
        cnt.set_attr("cni", json!(instances.len()));
        cnt.set_attr("cbs", json!(cbs));
        cse.storage.update_resource(&cnt).await?;
        Ok(())
    }

}

/// One pass of the expiration sweep: delete everything whose `et` has
/// elapsed, acting as the CSE.
pub async fn expiration_sweep(cse: &Arc<Cse>) {
    let now = Utc::now();
    let expired = match cse.storage.resources_expiring_before(now).await {
        Ok(expired) => expired,
        Err(err) => {
            warn!("expiration sweep could not list resources: {err}");
            return;
        }
    };
    for resource in expired {
        // a parent deleted earlier in this pass may already have taken
        // the subtree with it
        if matches!(cse.storage.resource_by_ri(resource.ri()).await, Ok(Some(_))) {
            info!("resource '{}' expired, deleting", resource.ri());
            if let Err(err) = cse
                .delete_resource_tree(resource.ri(), &cse.config.originator, DeleteCause::Expired)
                .await
            {
                warn!("failed to delete expired resource '{}': {err}", resource.ri());
            }
        }
    }
}

/// Background task running the expiration sweep at the configured
/// interval.
pub fn spawn_expiration_monitor(cse: Arc<Cse>) -> JoinHandle<()> {
    let interval = std::time::Duration::from_secs(cse.config.expiration_check_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            expiration_sweep(&cse).await;
        }
    })
}

/// Background task probing the registrar CSE at the configured
/// interval. Reachability changes are logged; requests keep flowing
/// either way and fail individually when the registrar is down.
pub fn spawn_remote_heartbeat(cse: Arc<Cse>) -> Option<JoinHandle<()>> {
    let remote = cse.config.remote.clone()?;
    let interval = std::time::Duration::from_secs(remote.check_interval_secs.max(1));
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut reachable = true;
        loop {
            ticker.tick().await;
            let result = cse
                .requests
                .send_remote_operation(
                    &cse,
                    crate::request::Operation::Retrieve,
                    &remote.csi,
                    "",
                    None,
                    None,
                )
                .await;
            match result {
                Ok(response) if response.rsc.is_success() => {
                    if !reachable {
                        info!("registrar CSE '{}' is reachable again", remote.csi);
                        reachable = true;
                    }
                }
                _ => {
                    if reachable {
                        warn!("registrar CSE '{}' is not reachable", remote.csi);
                        reachable = false;
                    }
                }
            }
        }
    }))
}
