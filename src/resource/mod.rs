//! Core resource representation.
//!
//! A [`Resource`] is a typed view over a JSON attribute map keyed by
//! oneM2M short names. Universal attributes (`ri`, `rn`, `pi`, ...) get
//! typed accessors; everything else stays in the flexible map so that
//! per-type attributes and flexContainer custom attributes need no
//! schema-specific structs. Validation against the attribute-policy
//! registry happens separately in [`crate::validation`].

pub mod behavior;
pub mod factory;
pub mod types;

pub use factory::Factory;
pub use types::{MgmtDefinition, ResourceType};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};

use crate::error::{CseError, CseResult};

/// A single resource in the tree.
#[derive(Debug, Clone)]
pub struct Resource {
    ty: ResourceType,
    /// Outer key of the wire representation; differs from the type's
    /// default prefix for mgmtObj and flexContainer specializations.
    tpe: String,
    attributes: Map<String, Value>,
}

impl Resource {
    pub fn new(ty: ResourceType, attributes: Map<String, Value>) -> Self {
        Self {
            ty,
            tpe: ty.type_prefix().to_string(),
            attributes,
        }
    }

    pub fn with_type_prefix(ty: ResourceType, tpe: String, attributes: Map<String, Value>) -> Self {
        Self { ty, tpe, attributes }
    }

    /// Rebuild a resource from its wire envelope `{tpe: {...}}`.
    pub fn from_wire(value: &Value) -> CseResult<Self> {
        let obj = value
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| CseError::bad_request("resource must be a single-key object"))?;
        let (tpe, inner) = obj.iter().next().unwrap();
        let attributes = inner
            .as_object()
            .cloned()
            .ok_or_else(|| CseError::bad_request("resource content must be an object"))?;
        let ty = attributes
            .get("ty")
            .and_then(Value::as_i64)
            .and_then(|c| ResourceType::from_code(c as i32))
            .or_else(|| ResourceType::from_type_prefix(tpe))
            .ok_or_else(|| CseError::bad_request(format!("unknown resource key '{tpe}'")))?;
        Ok(Self {
            ty,
            tpe: tpe.clone(),
            attributes,
        })
    }

    pub fn ty(&self) -> ResourceType {
        self.ty
    }

    pub fn type_prefix(&self) -> &str {
        &self.tpe
    }

    pub fn ri(&self) -> &str {
        self.str_attr("ri").unwrap_or_default()
    }

    pub fn rn(&self) -> &str {
        self.str_attr("rn").unwrap_or_default()
    }

    pub fn pi(&self) -> &str {
        self.str_attr("pi").unwrap_or_default()
    }

    pub fn et(&self) -> Option<DateTime<Utc>> {
        self.str_attr("et").and_then(parse_timestamp)
    }

    pub fn acpi(&self) -> Vec<String> {
        self.str_list_attr("acpi")
    }

    pub fn at(&self) -> Vec<String> {
        self.str_list_attr("at")
    }

    pub fn aa(&self) -> Vec<String> {
        self.str_list_attr("aa")
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        self.attributes.get(name).and_then(Value::as_i64)
    }

    pub fn bool_attr(&self, name: &str) -> Option<bool> {
        self.attributes.get(name).and_then(Value::as_bool)
    }

    /// A multi-valued string attribute; absent or null yields empty.
    pub fn str_list_attr(&self, name: &str) -> Vec<String> {
        self.attributes
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_attr(&mut self, name: &str, value: Value) {
        self.attributes.insert(name.to_string(), value);
    }

    /// Set only when the attribute is not present yet.
    pub fn set_attr_default(&mut self, name: &str, value: Value) {
        if !self.attributes.contains_key(name) {
            self.attributes.insert(name.to_string(), value);
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    /// Apply an update payload: null values remove attributes, everything
    /// else replaces. Returns the modified-attribute map used for update
    /// notifications (removed attributes appear with a null value).
    pub fn apply_update(&mut self, payload: &Map<String, Value>) -> Map<String, Value> {
        let mut modified = Map::new();
        for (name, value) in payload {
            if value.is_null() {
                if self.attributes.remove(name).is_some() {
                    modified.insert(name.clone(), Value::Null);
                }
            } else if self.attributes.get(name) != Some(value) {
                self.attributes.insert(name.clone(), value.clone());
                modified.insert(name.clone(), value.clone());
            }
        }
        modified
    }

    /// Wire representation: `{ "<tpe>": { ...attributes } }`.
    pub fn to_wire(&self) -> Value {
        json!({ (self.tpe.clone()): Value::Object(self.attributes.clone()) })
    }

    /// True when `et` lies in the past.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.et().is_some_and(|et| et <= now)
    }
}

/// Current time in the canonical resource timestamp format.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Generate a resource identifier. Identifiers never contain a virtual
/// short-name so that hybrid addressing stays unambiguous.
pub fn unique_ri(prefix: &str) -> String {
    loop {
        let id = uuid::Uuid::new_v4().simple().to_string();
        if !types::VIRTUAL_NAMES.iter().any(|vr| id.contains(vr)) {
            return format!("{prefix}{id}");
        }
    }
}

/// Generate an AE identifier with the given ID stem prefix (`C` or `S`).
pub fn unique_aei(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cnt_resource() -> Resource {
        let mut attrs = Map::new();
        attrs.insert("ri".into(), json!("cnt-1"));
        attrs.insert("rn".into(), json!("sensor"));
        attrs.insert("pi".into(), json!("ae-1"));
        attrs.insert("ty".into(), json!(3));
        attrs.insert("lbl".into(), json!(["room1"]));
        Resource::new(ResourceType::Cnt, attrs)
    }

    #[test]
    fn wire_round_trip() {
        let resource = cnt_resource();
        let wire = resource.to_wire();
        let back = Resource::from_wire(&wire).unwrap();
        assert_eq!(back.ty(), ResourceType::Cnt);
        assert_eq!(back.ri(), "cnt-1");
        assert_eq!(back.to_wire(), wire);
    }

    #[test]
    fn update_reports_modified_attributes_only() {
        let mut resource = cnt_resource();
        let mut payload = Map::new();
        payload.insert("lbl".into(), json!(["room2"]));
        payload.insert("rn".into(), json!("sensor"));

        let modified = resource.apply_update(&payload);
        assert_eq!(modified.len(), 1);
        assert_eq!(modified.get("lbl"), Some(&json!(["room2"])));
    }

    #[test]
    fn update_with_null_removes_attribute() {
        let mut resource = cnt_resource();
        let mut payload = Map::new();
        payload.insert("lbl".into(), Value::Null);

        let modified = resource.apply_update(&payload);
        assert!(!resource.has_attr("lbl"));
        assert_eq!(modified.get("lbl"), Some(&Value::Null));
    }

    #[test]
    fn expiration_uses_et() {
        let mut resource = cnt_resource();
        assert!(!resource.is_expired(Utc::now()));
        resource.set_attr("et", json!("2000-01-01T00:00:00.000Z"));
        assert!(resource.is_expired(Utc::now()));
    }

    #[test]
    fn generated_ids_avoid_virtual_names() {
        for _ in 0..64 {
            let ri = unique_ri("cnt");
            assert!(!ri.contains("fopt"));
        }
    }
}
