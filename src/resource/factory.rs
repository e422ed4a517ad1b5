//! Resource factory: the single entry point for type dispatch.
//!
//! A create/update payload arrives as `{ "<tpe>": { ...attributes } }`.
//! The factory resolves the outer key against the type vocabulary,
//! cross-checks it with the type declared in the request (`ty` content
//! type parameter) and produces a typed [`Resource`]. Unknown outer keys
//! are rejected, except for flexContainer specializations which carry
//! their own namespaced key and are identified by the declared type.

use serde_json::{Map, Value};

use crate::error::{CseError, CseResult};
use crate::resource::{MgmtDefinition, Resource, ResourceType};

#[derive(Debug, Clone, Copy, Default)]
pub struct Factory;

impl Factory {
    pub fn new() -> Self {
        Self
    }

    /// Build a typed resource from a request payload.
    ///
    /// `declared` is the resource type announced by the request (for
    /// CREATE); UPDATE payloads resolve solely through the outer key of
    /// the stored resource.
    pub fn from_request(
        &self,
        declared: Option<ResourceType>,
        payload: &Value,
    ) -> CseResult<Resource> {
        let (tpe, attributes) = unwrap_envelope(payload)?;

        let resolved = ResourceType::from_type_prefix(&tpe);
        let ty = match (declared, resolved) {
            (Some(declared), Some(resolved)) if declared != resolved => {
                return Err(CseError::bad_request(format!(
                    "content key '{tpe}' does not match requested type {declared}"
                )));
            }
            (_, Some(resolved)) => resolved,
            // A namespaced custom key is only legal for flexContainers.
            (Some(ResourceType::FlexContainer), None) => ResourceType::FlexContainer,
            (Some(ResourceType::FlexContainerAnnc), None) => ResourceType::FlexContainerAnnc,
            _ => {
                return Err(CseError::bad_request(format!(
                    "unknown resource key '{tpe}'"
                )));
            }
        };

        // mgmtObj payloads must carry a known specialization.
        if ty == ResourceType::MgmtObj {
            let mgd = attributes.get("mgd").and_then(Value::as_i64);
            if let Some(mgd) = mgd {
                if MgmtDefinition::from_code(mgd as i32).is_none() {
                    return Err(CseError::bad_request(format!(
                        "unknown mgmtDefinition {mgd}"
                    )));
                }
            }
        }

        Ok(Resource::with_type_prefix(ty, tpe, attributes))
    }

    /// The update payload for an existing resource: the outer key must
    /// match the stored resource's key.
    pub fn update_payload(
        &self,
        existing: &Resource,
        payload: &Value,
    ) -> CseResult<Map<String, Value>> {
        let (tpe, attributes) = unwrap_envelope(payload)?;
        if tpe != existing.type_prefix() {
            return Err(CseError::bad_request(format!(
                "content key '{tpe}' does not match resource '{}'",
                existing.type_prefix()
            )));
        }
        Ok(attributes)
    }
}

fn unwrap_envelope(payload: &Value) -> CseResult<(String, Map<String, Value>)> {
    let obj = payload
        .as_object()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| CseError::bad_request("content must be a single-key object"))?;
    let (tpe, inner) = obj.iter().next().unwrap();
    let attributes = inner
        .as_object()
        .cloned()
        .ok_or_else(|| CseError::bad_request("resource content must be an object"))?;
    Ok((tpe.clone(), attributes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_type_from_outer_key() {
        let factory = Factory::new();
        let resource = factory
            .from_request(Some(ResourceType::Cnt), &json!({"m2m:cnt": {"mni": 5}}))
            .unwrap();
        assert_eq!(resource.ty(), ResourceType::Cnt);
        assert_eq!(resource.type_prefix(), "m2m:cnt");
    }

    #[test]
    fn mismatched_declaration_rejected() {
        let factory = Factory::new();
        let err = factory
            .from_request(Some(ResourceType::Ae), &json!({"m2m:cnt": {}}))
            .unwrap_err();
        assert!(err.debug.unwrap().contains("m2m:cnt"));
    }

    #[test]
    fn unknown_key_rejected() {
        let factory = Factory::new();
        assert!(
            factory
                .from_request(None, &json!({"m2m:zzz": {}}))
                .is_err()
        );
    }

    #[test]
    fn flex_container_custom_key_allowed() {
        let factory = Factory::new();
        let resource = factory
            .from_request(
                Some(ResourceType::FlexContainer),
                &json!({"cod:color": {"cnd": "org.onem2m.common.moduleclass.colour"}}),
            )
            .unwrap();
        assert_eq!(resource.ty(), ResourceType::FlexContainer);
        assert_eq!(resource.type_prefix(), "cod:color");
    }

    #[test]
    fn multi_key_envelope_rejected() {
        let factory = Factory::new();
        assert!(
            factory
                .from_request(None, &json!({"m2m:cnt": {}, "m2m:ae": {}}))
                .is_err()
        );
    }
}
