//! Access control evaluation.
//!
//! Permissions are a bitmask over the six oneM2M operations. Access is
//! evaluated against the ACPs referenced from the target's `acpi` list,
//! with the special cases of the standard: group targets consult `macp`,
//! ACP targets consult their own self-privileges (`pvs`), subscription
//! targets additionally require RETRIEVE on the subscribed-to parent,
//! and resource types flagged as inheriting walk up to the parent when
//! `acpi` is empty.

use log::debug;
use serde_json::Value;

use crate::error::CseResult;
use crate::resource::{Resource, ResourceType};
use crate::storage::Storage;

/// Operation bits used in `acop`.
pub mod permission {
    pub const CREATE: u32 = 1;
    pub const RETRIEVE: u32 = 2;
    pub const UPDATE: u32 = 4;
    pub const DELETE: u32 = 8;
    pub const NOTIFY: u32 = 16;
    pub const DISCOVERY: u32 = 32;
    pub const ALL: u32 = 63;
}

/// Originator strings that stand for an unregistered AE requesting
/// bootstrap registration.
const BOOTSTRAP_ORIGINATORS: &[&str] = &["C", "S"];

/// Parameters of a single access check.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub originator: &'a str,
    pub resource: &'a Resource,
    pub permission: u32,
    /// Evaluate self-privileges (`pvs`) instead of `pv`
    pub check_self: bool,
    /// Resource type being created, for create requests
    pub ty: Option<ResourceType>,
    pub is_create_request: bool,
    /// Parent of the target, required for subscription targets
    pub parent: Option<&'a Resource>,
}

impl<'a> AccessRequest<'a> {
    pub fn new(originator: &'a str, resource: &'a Resource, permission: u32) -> Self {
        Self {
            originator,
            resource,
            permission,
            check_self: false,
            ty: None,
            is_create_request: false,
            parent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityManager {
    enable_acp_checks: bool,
}

impl SecurityManager {
    pub fn new(enable_acp_checks: bool) -> Self {
        Self { enable_acp_checks }
    }

    /// Decide whether `originator` may perform `permission` on the
    /// target resource.
    pub async fn has_access(
        &self,
        storage: &dyn Storage,
        request: AccessRequest<'_>,
    ) -> CseResult<bool> {
        if !self.enable_acp_checks {
            return Ok(true);
        }

        // An unregistered AE may create itself.
        if request.originator.is_empty() || BOOTSTRAP_ORIGINATORS.contains(&request.originator) {
            if request.ty == Some(ResourceType::Ae) && request.is_create_request {
                debug!("bootstrap originator for AE create, granted");
                return Ok(true);
            }
        }

        if request.permission > permission::ALL {
            return Ok(false);
        }

        // Subscriptions require retrieve access on the subscribed-to
        // resource in addition to the regular checks.
        if request.resource.ty() == ResourceType::Sub {
            if let Some(parent) = request.parent {
                if !self
                    .resource_access(storage, request.originator, parent, permission::RETRIEVE, false)
                    .await?
                {
                    debug!(
                        "originator '{}' lacks retrieve access on subscribed-to resource",
                        request.originator
                    );
                    return Ok(false);
                }
            }
        }

        let granted = self
            .resource_access(
                storage,
                request.originator,
                request.resource,
                request.permission,
                request.check_self,
            )
            .await?;
        debug!(
            "access check originator='{}' ri='{}' permission={} -> {}",
            request.originator,
            request.resource.ri(),
            request.permission,
            granted
        );
        Ok(granted)
    }

    /// Core evaluation against a single resource: group `macp`, ACP
    /// self-privileges, or the `acpi` list with the inherit walk.
    async fn resource_access(
        &self,
        storage: &dyn Storage,
        originator: &str,
        resource: &Resource,
        requested: u32,
        check_self: bool,
    ) -> CseResult<bool> {
        if resource.ty() == ResourceType::Grp {
            let macp = resource.str_list_attr("macp");
            if !macp.is_empty() {
                for acp_ri in macp {
                    if let Some(acp) = storage.resource_by_ri(&acp_ri).await? {
                        if check_permission(&acp, originator, requested) {
                            return Ok(true);
                        }
                    }
                }
                return Ok(false);
            }
            // fall through to acpi below
        }

        if resource.ty() == ResourceType::Acp {
            return Ok(check_self_permission(resource, originator, requested));
        }

        let mut current = resource.clone();
        loop {
            let acpi = current.acpi();
            if acpi.is_empty() {
                if current.ty().inherits_acp() && !current.pi().is_empty() {
                    match storage.resource_by_ri(current.pi()).await? {
                        Some(parent) => {
                            current = parent;
                            continue;
                        }
                        None => return Ok(false),
                    }
                }
                debug!("no acpi on '{}', denied", current.ri());
                return Ok(false);
            }
            for acp_ri in acpi {
                let Some(acp) = storage.resource_by_ri(&acp_ri).await? else {
                    continue;
                };
                let granted = if check_self {
                    check_self_permission(&acp, originator, requested)
                } else {
                    check_permission(&acp, originator, requested)
                };
                if granted {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
    }
}

/// Access-control rule entries of a privilege attribute, normalized to
/// `(acor, acop)` pairs. Accepts both the list form and a bare object.
fn access_control_rules(privileges: Option<&Value>) -> Vec<(Vec<String>, u32)> {
    let Some(rules) = privileges.and_then(|pv| pv.get("acr")) else {
        return Vec::new();
    };
    let entries: Vec<&Value> = match rules {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![rules],
        _ => return Vec::new(),
    };
    entries
        .into_iter()
        .filter_map(|entry| {
            let acop = entry.get("acop").and_then(Value::as_i64)? as u32;
            let acor = entry
                .get("acor")
                .and_then(Value::as_array)?
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            Some((acor, acop))
        })
        .collect()
}

/// Evaluate `pv` of an ACP.
///
/// The NOTIFY relaxation is deliberate: a request for exactly NOTIFY
/// passes the originator match when the operation bit fits, so verified
/// subscriptions can deliver without enumerating every possible sender.
pub fn check_permission(acp: &Resource, originator: &str, requested: u32) -> bool {
    for (acor, acop) in access_control_rules(acp.attr("pv")) {
        if requested & acop == 0 {
            continue;
        }
        if acor.iter().any(|o| o == "all" || o == originator) || requested == permission::NOTIFY {
            return true;
        }
    }
    false
}

/// Evaluate `pvs` of an ACP (no NOTIFY relaxation).
pub fn check_self_permission(acp: &Resource, originator: &str, requested: u32) -> bool {
    for (acor, acop) in access_control_rules(acp.attr("pvs")) {
        if requested & acop == 0 {
            continue;
        }
        if acor.iter().any(|o| o == "all" || o == originator) {
            return true;
        }
    }
    false
}
