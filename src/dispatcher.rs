//! CRUD orchestration.
//!
//! Operations arrive as canonical [`CseRequest`]s whose target has
//! already been confirmed local. Each operation resolves the target
//! (including virtual children), checks permissions, runs the per-type
//! hooks and commits through storage, publishing a resource event on
//! success. Group fan-out evaluates every member independently and
//! aggregates the member responses.

use chrono::{Duration, Utc};
use log::{debug, info, warn};
use serde_json::{Map, Value, json};

use crate::addressing::{self, child_srn};
use crate::cse::{Cse, DeleteCause};
use crate::error::{CseError, CseResult, ResponseStatusCode};
use crate::event::ResourceEvent;
use crate::request::CseRequest;
use crate::resource::{
    Resource, ResourceType, behavior, format_timestamp, now_timestamp, unique_ri,
};
use crate::security::{AccessRequest, permission};
use crate::validation::RequestOperation;

type OperationResult = (ResponseStatusCode, Option<Value>);

impl Cse {
    /// RETRIEVE: resolve, delegate virtuals, check permission, run the
    /// retrieve hook, shape the result content.
    pub async fn handle_retrieve(&self, request: &CseRequest) -> CseResult<OperationResult> {
        let (resource, virtual_name) = self.resolve_local(&request.to).await?;
        if let Some(virtual_name) = virtual_name {
            return match virtual_name.as_str() {
                "la" | "ol" => {
                    let cin = self.latest_oldest(&resource, &virtual_name).await?;
                    self.retrieve_resource(&cin, request).await
                }
                "fopt" => self.fanout(&resource, request).await,
                _ => Err(CseError::with_debug(
                    ResponseStatusCode::NotImplemented,
                    format!("virtual resource '{virtual_name}' is not supported"),
                )),
            };
        }
        if request.fc.is_discovery() {
            return self.discover(&resource, request).await;
        }
        self.retrieve_resource(&resource, request).await
    }

    async fn retrieve_resource(
        &self,
        resource: &Resource,
        request: &CseRequest,
    ) -> CseResult<OperationResult> {
        // subscriptions additionally require retrieve access on the
        // subscribed-to resource
        let parent = if resource.ty() == ResourceType::Sub {
            self.storage.resource_by_ri(resource.pi()).await?
        } else {
            None
        };
        self.check_access(
            &request.originator,
            resource,
            permission::RETRIEVE,
            parent.as_ref(),
            false,
        )
        .await?;
        behavior::will_be_retrieved(self, resource).await?;

        debug!("retrieved '{}' for '{}'", resource.ri(), request.originator);
        let pc = match request.rcn {
            0 => None,
            4 => Some(self.with_child_resources(resource).await?),
            _ => Some(resource.to_wire()),
        };
        Ok((ResponseStatusCode::Ok, pc))
    }

    /// CREATE: validate payload, enforce the parent's child-type set,
    /// check permission on the parent, run registration and activation
    /// hooks, persist, fire the create event.
    pub async fn handle_create(&self, request: &CseRequest) -> CseResult<OperationResult> {
        let (parent, virtual_name) = self.resolve_local(&request.to).await?;
        if let Some(virtual_name) = virtual_name {
            return match virtual_name.as_str() {
                "fopt" => self.fanout(&parent, request).await,
                _ => Err(CseError::operation_not_allowed(format!(
                    "cannot create under virtual resource '{virtual_name}'"
                ))),
            };
        }
        let created = self.create_under(&parent, request).await?;
        Ok((ResponseStatusCode::Created, Some(created.to_wire())))
    }

    pub(crate) async fn create_under(
        &self,
        parent: &Resource,
        request: &CseRequest,
    ) -> CseResult<Resource> {
        let ty = request
            .ty
            .ok_or_else(|| CseError::bad_request("create without resource type"))?;
        let pc = request
            .pc
            .as_ref()
            .ok_or_else(|| CseError::bad_request("create without content"))?;

        let mut resource = self.factory.from_request(Some(ty), pc)?;
        let cnd = resource.str_attr("cnd").map(str::to_string);
        self.validator.validate_payload(
            ty,
            cnd.as_deref(),
            resource.attributes(),
            RequestOperation::Create,
        )?;

        if !parent.ty().allowed_children().contains(&ty) {
            return Err(CseError::with_debug(
                ResponseStatusCode::InvalidChildResourceType,
                format!("{} cannot be created under {}", ty, parent.ty()),
            ));
        }

        let mut access = AccessRequest::new(&request.originator, parent, permission::CREATE);
        access.ty = Some(ty);
        access.is_create_request = true;
        if !self.security.has_access(self.storage.as_ref(), access).await? {
            return Err(CseError::no_privilege(format!(
                "originator '{}' may not create under '{}'",
                request.originator,
                parent.ri()
            )));
        }

        // Server-assigned attributes.
        let prefix = stem(ty.type_prefix());
        let ri = unique_ri(prefix);
        if resource.str_attr("rn").is_none() {
            resource.set_attr("rn", json!(format!("{prefix}_{}", &ri[prefix.len()..])));
        }
        resource.set_attr("ri", json!(ri.clone()));
        resource.set_attr("pi", json!(parent.ri()));
        resource.set_attr("ty", json!(ty.code()));
        let now = now_timestamp();
        resource.set_attr("ct", json!(now.clone()));
        resource.set_attr("lt", json!(now));
        if !ty.is_unexpirable() {
            resource.set_attr_default(
                "et",
                json!(format_timestamp(
                    Utc::now() + Duration::seconds(self.config.expiration_delta_secs)
                )),
            );
        }

        // Sibling name collision must surface before any side effect.
        let rn = resource.rn().to_string();
        let siblings = self.storage.children_of(parent.ri(), None).await?;
        if siblings.iter().any(|sibling| sibling.rn() == rn) {
            return Err(CseError::conflict(format!(
                "resource name '{rn}' already exists under '{}'",
                parent.ri()
            )));
        }

        let response_originator = self
            .registration
            .check_resource_creation(self, &mut resource, parent, &request.originator)
            .await?;
        let effective_originator = response_originator
            .clone()
            .unwrap_or_else(|| request.originator.clone());

        self.validator
            .check_acpi_references(self.storage.as_ref(), &resource)
            .await?;
        behavior::prepare(self, &mut resource, parent, &effective_originator).await?;
        self.announcement
            .normalize_aa(self.validator.registry(), &mut resource);
        self.validator.validate_resource(&resource, Some(parent))?;
        behavior::activate(self, &mut resource, parent, &effective_originator).await?;

        let parent_srn = self.structured_name(parent.ri()).await?;
        let srn = child_srn(&parent_srn, resource.rn());
        if let Err(err) = self.storage.put_resource(&resource, &srn).await {
            // verification-time subscription state must not leak
            if resource.ty() == ResourceType::Sub {
                let _ = self.storage.remove_subscription(resource.ri()).await;
            }
            return Err(err.into());
        }

        if resource.ty() == ResourceType::Cin {
            self.registration
                .container_child_added(self, parent.ri())
                .await?;
        }

        info!(
            "created {} '{}' under '{}'",
            resource.ty(),
            resource.ri(),
            parent.ri()
        );
        self.events.publish(ResourceEvent::Created {
            resource: resource.clone(),
            parent_ri: parent.ri().to_string(),
        });
        Ok(resource)
    }

    /// UPDATE: per-type update gate, attribute diff, re-validation,
    /// persist with a new `lt`, fire the update event.
    pub async fn handle_update(&self, request: &CseRequest) -> CseResult<OperationResult> {
        let (resource, virtual_name) = self.resolve_local(&request.to).await?;
        if let Some(virtual_name) = virtual_name {
            return match virtual_name.as_str() {
                "fopt" => self.fanout(&resource, request).await,
                _ => Err(CseError::operation_not_allowed(format!(
                    "cannot update virtual resource '{virtual_name}'"
                ))),
            };
        }
        let updated = self.update_resource_from(&resource, request).await?;
        Ok((ResponseStatusCode::Updated, Some(updated.to_wire())))
    }

    pub(crate) async fn update_resource_from(
        &self,
        resource: &Resource,
        request: &CseRequest,
    ) -> CseResult<Resource> {
        behavior::check_update(resource)?;
        let pc = request
            .pc
            .as_ref()
            .ok_or_else(|| CseError::bad_request("update without content"))?;
        let payload = self.factory.update_payload(resource, pc)?;
        let cnd = resource.str_attr("cnd").map(str::to_string);
        self.validator.validate_payload(
            resource.ty(),
            cnd.as_deref(),
            &payload,
            RequestOperation::Update,
        )?;

        let parent = self.storage.resource_by_ri(resource.pi()).await?;
        self.check_access(
            &request.originator,
            resource,
            permission::UPDATE,
            parent.as_ref(),
            false,
        )
        .await?;

        let mut updated = resource.clone();
        let previous_nus = resource.str_list_attr("nu");
        let modified = updated.apply_update(&payload);
        updated.set_attr("lt", json!(now_timestamp()));
        if modified.contains_key("aa") {
            self.announcement
                .normalize_aa(self.validator.registry(), &mut updated);
        }

        self.validator.validate_resource(&updated, parent.as_ref())?;
        self.validator
            .check_acpi_references(self.storage.as_ref(), &updated)
            .await?;
        if updated.ty() == ResourceType::Grp && modified.contains_key("mid") {
            behavior::check_group_members(self, &mut updated).await?;
        }

        if updated.ty() == ResourceType::Sub && !modified.is_empty() {
            self.notification
                .update_subscription(self, &updated, &previous_nus, &request.originator)
                .await?;
        }

        self.storage.update_resource(&updated).await?;
        info!("updated '{}' ({} attributes)", updated.ri(), modified.len());
        self.events.publish(ResourceEvent::Updated {
            resource: updated.clone(),
            modified,
        });
        Ok(updated)
    }

    /// DELETE: permission check, recursive depth-first removal with
    /// per-type deactivation, fire delete events.
    pub async fn handle_delete(&self, request: &CseRequest) -> CseResult<OperationResult> {
        let (resource, virtual_name) = self.resolve_local(&request.to).await?;
        if let Some(virtual_name) = virtual_name {
            return match virtual_name.as_str() {
                "la" | "ol" => {
                    let cin = self.latest_oldest(&resource, &virtual_name).await?;
                    self.delete_resource_checked(&cin, request).await
                }
                "fopt" => self.fanout(&resource, request).await,
                _ => Err(CseError::operation_not_allowed(format!(
                    "cannot delete virtual resource '{virtual_name}'"
                ))),
            };
        }
        self.delete_resource_checked(&resource, request).await
    }

    async fn delete_resource_checked(
        &self,
        resource: &Resource,
        request: &CseRequest,
    ) -> CseResult<OperationResult> {
        if resource.ty() == ResourceType::CseBase {
            return Err(CseError::operation_not_allowed("cannot delete the CSEBase"));
        }
        let parent = self.storage.resource_by_ri(resource.pi()).await?;
        self.check_access(
            &request.originator,
            resource,
            permission::DELETE,
            parent.as_ref(),
            false,
        )
        .await?;
        self.delete_resource_tree(resource.ri(), &request.originator, DeleteCause::Request)
            .await?;
        Ok((ResponseStatusCode::Deleted, None))
    }

    /// Delete a subtree, children before parents. Deactivation hooks run
    /// per resource; events fire per resource. A child that fails to
    /// delete aborts the cascade and surfaces `internalServerError`.
    pub async fn delete_resource_tree(
        &self,
        ri: &str,
        originator: &str,
        cause: DeleteCause,
    ) -> CseResult<()> {
        let root = self
            .storage
            .resource_by_ri(ri)
            .await?
            .ok_or_else(|| CseError::not_found(format!("'{ri}' not found")))?;

        // Collect the subtree breadth-first, then delete in reverse so
        // children go before their parents.
        let mut ordered = vec![root.clone()];
        let mut index = 0;
        while index < ordered.len() {
            let current_ri = ordered[index].ri().to_string();
            let children = self.storage.children_of(&current_ri, None).await?;
            ordered.extend(children);
            index += 1;
        }

        for resource in ordered.iter().rev() {
            behavior::deactivate(self, resource).await?;
            self.registration.check_resource_deletion(resource);
            self.storage.delete_resource(resource.ri()).await.map_err(|err| {
                warn!("cascading delete failed at '{}': {err}", resource.ri());
                CseError::internal(format!("could not delete '{}'", resource.ri()))
            })?;
            let event = if cause == DeleteCause::Expired && resource.ri() == root.ri() {
                ResourceEvent::Expired {
                    resource: resource.clone(),
                }
            } else {
                ResourceEvent::Deleted {
                    resource: resource.clone(),
                }
            };
            self.events.publish(event);
        }

        // Deleting a contentInstance directly leaves its container's
        // usage counters stale.
        if root.ty() == ResourceType::Cin && cause != DeleteCause::Trim {
            self.registration
                .container_child_removed(self, root.pi())
                .await?;
        }
        info!(
            "deleted '{}' and {} descendants (originator '{originator}')",
            root.ri(),
            ordered.len() - 1
        );
        Ok(())
    }

    /// Group fan-out: run the member operation for every `mid` entry
    /// with independent permission checks; partial success yields an
    /// aggregated response.
    async fn fanout(
        &self,
        group: &Resource,
        request: &CseRequest,
    ) -> CseResult<OperationResult> {
        if group.ty() != ResourceType::Grp {
            return Err(CseError::operation_not_allowed(
                "'fopt' is only valid on a group resource",
            ));
        }
        let mut responses = Vec::new();
        for mid in group.str_list_attr("mid") {
            let result = self.fanout_member(&mid, request).await;
            let (rsc, pc) = match result {
                Ok((rsc, pc)) => (rsc, pc),
                Err(err) => (err.rsc, err.debug.map(|dbg| json!({ "m2m:dbg": dbg }))),
            };
            let mut entry = Map::new();
            entry.insert("rsc".into(), json!(rsc.numeric()));
            entry.insert("to".into(), json!(mid));
            if let Some(pc) = pc {
                entry.insert("pc".into(), pc);
            }
            responses.push(Value::Object(entry));
        }
        Ok((
            ResponseStatusCode::Ok,
            Some(json!({ "m2m:agr": { "m2m:rsp": responses } })),
        ))
    }

    async fn fanout_member(
        &self,
        mid: &str,
        request: &CseRequest,
    ) -> CseResult<OperationResult> {
        let member = self.load_by_id(mid).await?;
        match request.operation {
            crate::request::Operation::Retrieve => self.retrieve_resource(&member, request).await,
            crate::request::Operation::Create => {
                let created = self.create_under(&member, request).await?;
                Ok((ResponseStatusCode::Created, Some(created.to_wire())))
            }
            crate::request::Operation::Update => {
                let updated = self.update_resource_from(&member, request).await?;
                Ok((ResponseStatusCode::Updated, Some(updated.to_wire())))
            }
            crate::request::Operation::Delete => self.delete_resource_checked(&member, request).await,
            crate::request::Operation::Notify => Err(CseError::with_debug(
                ResponseStatusCode::NotImplemented,
                "notify fan-out is not supported",
            )),
        }
    }

    /// Discovery (`fu=1`): subtree walk filtered by the filter criteria,
    /// answered as a URI list shaped by `drt`.
    async fn discover(
        &self,
        root: &Resource,
        request: &CseRequest,
    ) -> CseResult<OperationResult> {
        self.check_access(
            &request.originator,
            root,
            permission::DISCOVERY,
            None,
            false,
        )
        .await?;

        let mut found = Vec::new();
        let mut queue = vec![root.ri().to_string()];
        while let Some(ri) = queue.pop() {
            for child in self.storage.children_of(&ri, None).await? {
                if request.fc.matches(&child) {
                    let path = if request.drt == 2 {
                        child.ri().to_string()
                    } else {
                        self.structured_name(child.ri()).await?
                    };
                    found.push(path);
                }
                queue.push(child.ri().to_string());
            }
        }
        found.sort();
        Ok((ResponseStatusCode::Ok, Some(json!({ "m2m:uril": found }))))
    }

    /// Resolve a local target path to its resource, reporting a virtual
    /// trailing name separately. Expired-but-unswept resources answer
    /// `notFound`.
    pub(crate) async fn resolve_local(
        &self,
        to: &str,
    ) -> CseResult<(Resource, Option<String>)> {
        let target = addressing::resolve_target(
            self.storage.as_ref(),
            to,
            &self.config.rn,
            &self.config.csi,
        )
        .await?;
        if target.is_foreign() {
            return Err(CseError::not_found(format!(
                "'{to}' is not a local resource"
            )));
        }
        let ri = target
            .ri
            .ok_or_else(|| CseError::not_found(format!("'{to}' not found")))?;
        let resource = self
            .storage
            .resource_by_ri(&ri)
            .await?
            .ok_or_else(|| CseError::not_found(format!("'{to}' not found")))?;
        if resource.is_expired(Utc::now()) {
            debug!("'{ri}' is expired, treating as not found");
            return Err(CseError::not_found(format!("'{to}' not found")));
        }
        Ok((resource, target.virtual_name))
    }

    async fn load_by_id(&self, id: &str) -> CseResult<Resource> {
        let ri = match self.storage.resource_by_ri(id).await? {
            Some(resource) => return Ok(resource),
            None => self
                .storage
                .resolve_srn(id)
                .await?
                .ok_or_else(|| CseError::not_found(format!("'{id}' not found")))?,
        };
        self.storage
            .resource_by_ri(&ri)
            .await?
            .ok_or_else(|| CseError::not_found(format!("'{id}' not found")))
    }

    /// `la`/`ol` under a container: newest/oldest contentInstance.
    async fn latest_oldest(&self, parent: &Resource, which: &str) -> CseResult<Resource> {
        let instances = self
            .storage
            .children_of(parent.ri(), Some(ResourceType::Cin))
            .await?;
        let cin = if which == "la" {
            instances.into_iter().next_back()
        } else {
            instances.into_iter().next()
        };
        cin.ok_or_else(|| {
            CseError::not_found(format!("container '{}' has no instances", parent.ri()))
        })
    }

    async fn check_access(
        &self,
        originator: &str,
        resource: &Resource,
        requested: u32,
        parent: Option<&Resource>,
        check_self: bool,
    ) -> CseResult<()> {
        let mut access = AccessRequest::new(originator, resource, requested);
        access.parent = parent;
        access.check_self = check_self;
        if self.security.has_access(self.storage.as_ref(), access).await? {
            Ok(())
        } else {
            Err(CseError::no_privilege(format!(
                "originator '{originator}' has no privilege on '{}'",
                resource.ri()
            )))
        }
    }

    /// Attribute representation plus one level of child resources,
    /// grouped by their type prefix (`rcn=4`).
    async fn with_child_resources(&self, resource: &Resource) -> CseResult<Value> {
        let mut attributes = resource.attributes().clone();
        let mut by_prefix: Map<String, Value> = Map::new();
        for child in self.storage.children_of(resource.ri(), None).await? {
            let entry = by_prefix
                .entry(child.type_prefix().to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(Value::Object(child.attributes().clone()));
            }
        }
        attributes.extend(by_prefix);
        Ok(json!({ (resource.type_prefix()): Value::Object(attributes) }))
    }

    pub(crate) async fn structured_name(&self, ri: &str) -> CseResult<String> {
        Ok(self
            .storage
            .identifier(ri)
            .await?
            .map(|record| record.srn)
            .unwrap_or_default())
    }
}

fn stem(tpe: &str) -> &str {
    tpe.split(':').next_back().unwrap_or(tpe)
}
