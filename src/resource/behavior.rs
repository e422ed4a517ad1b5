//! Per-type resource behavior.
//!
//! The original per-class behavior is expressed as a fixed dispatch on
//! [`ResourceType`]: activation when a resource comes to life, an update
//! gate, deactivation before removal, and a retrieve hook. Anything not
//! listed here behaves like a plain data resource.

use log::debug;
use serde_json::{Value, json};

use crate::cse::Cse;
use crate::error::{CseError, CseResult, ResponseStatusCode};
use crate::resource::{Resource, ResourceType};

/// Attribute-computation hook, run before validation. Must be free of
/// side effects so a later validation failure leaves no trace.
pub async fn prepare(
    cse: &Cse,
    resource: &mut Resource,
    parent: &Resource,
    originator: &str,
) -> CseResult<()> {
    match resource.ty() {
        ResourceType::Cin => {
            resource.set_attr_default("con", json!(""));
            let cs = content_size(resource.attr("con"));
            resource.set_attr("cs", json!(cs));
            // stateTag carries the container's state after this
            // addition; the container itself is bumped post-persist
            resource.set_attr("st", json!(parent.int_attr("st").unwrap_or(0) + 1));
            resource.set_attr_default("cr", json!(originator));
            Ok(())
        }
        ResourceType::Sub => {
            resource.set_attr_default("nct", json!(1));
            resource.set_attr_default("cr", json!(originator));
            Ok(())
        }
        ResourceType::Grp => check_group_members(cse, resource).await,
        ResourceType::Cnt => {
            resource.set_attr_default("cr", json!(originator));
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Side-effect hook, run after validation and immediately before the
/// resource is persisted.
pub async fn activate(
    cse: &Cse,
    resource: &mut Resource,
    _parent: &Resource,
    originator: &str,
) -> CseResult<()> {
    match resource.ty() {
        ResourceType::Sub => {
            // Verification requests go out before anything is stored;
            // a single failure aborts the create.
            cse.notification
                .add_subscription(cse, resource, originator)
                .await
        }
        _ => Ok(()),
    }
}

/// Member checks for a group: members must exist locally and agree with
/// the declared member type. Also refreshes `cnm`/`mtv`.
pub(crate) async fn check_group_members(cse: &Cse, resource: &mut Resource) -> CseResult<()> {
    let mt = resource.int_attr("mt").unwrap_or(0);
    let mids = resource.str_list_attr("mid");
    for mid in &mids {
        let member = match cse.storage.resource_by_ri(mid).await? {
            Some(member) => member,
            None => {
                let Some(ri) = cse.storage.resolve_srn(mid).await? else {
                    return Err(CseError::not_found(format!("group member '{mid}' not found")));
                };
                cse.storage
                    .resource_by_ri(&ri)
                    .await?
                    .ok_or_else(|| CseError::not_found(format!("group member '{mid}' not found")))?
            }
        };
        if mt != 0 && member.ty().code() as i64 != mt {
            return Err(CseError::with_debug(
                ResponseStatusCode::GroupMemberTypeInconsistent,
                format!("member '{mid}' is not of member type {mt}"),
            ));
        }
    }
    resource.set_attr("cnm", json!(mids.len()));
    resource.set_attr("mtv", json!(true));
    Ok(())
}

/// Gate run before an update is applied. Content instances are immutable.
pub fn check_update(resource: &Resource) -> CseResult<()> {
    match resource.ty() {
        ResourceType::Cin => Err(CseError::operation_not_allowed(
            "contentInstance resources cannot be updated",
        )),
        _ => Ok(()),
    }
}

/// Hook run while a resource is being removed, before storage delete.
pub async fn deactivate(cse: &Cse, resource: &Resource) -> CseResult<()> {
    match resource.ty() {
        ResourceType::Sub => {
            // flushes batches and sends the deletion notices
            cse.notification.remove_subscription(cse, resource.ri()).await;
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Hook run before a retrieved representation is returned; may veto the
/// retrieval.
pub async fn will_be_retrieved(cse: &Cse, resource: &Resource) -> CseResult<()> {
    match resource.ty() {
        ResourceType::Cin => {
            let parent = cse.storage.resource_by_ri(resource.pi()).await?;
            if parent
                .as_ref()
                .and_then(|p| p.bool_attr("disr"))
                .unwrap_or(false)
            {
                debug!("retrieval disabled on parent container of '{}'", resource.ri());
                return Err(CseError::operation_not_allowed(
                    "retrieval is disabled for the parent container",
                ));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Size of a content attribute: string length for text, serialized
/// length otherwise.
pub fn content_size(con: Option<&Value>) -> usize {
    match con {
        Some(Value::String(text)) => text.len(),
        Some(value) => value.to_string().len(),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cin_refuses_update() {
        let cin = Resource::new(
            ResourceType::Cin,
            json!({"ri": "cin-1", "con": "x"}).as_object().cloned().unwrap(),
        );
        let err = check_update(&cin).unwrap_err();
        assert_eq!(err.rsc, ResponseStatusCode::OperationNotAllowed);

        let cnt = Resource::new(
            ResourceType::Cnt,
            json!({"ri": "cnt-1"}).as_object().cloned().unwrap(),
        );
        assert!(check_update(&cnt).is_ok());
    }

    #[test]
    fn content_sizes() {
        assert_eq!(content_size(Some(&json!("abcd"))), 4);
        assert_eq!(content_size(Some(&json!({"a": 1}))), 7);
        assert_eq!(content_size(None), 0);
    }
}
