//! Request payload and resource validation.
//!
//! The [`Validator`] checks payloads and merged resources against the
//! attribute-policy registry, in the fixed rule order: unknown
//! attributes, missing mandatory attributes, attributes not allowed in
//! the request, data type and range violations, and finally per-type
//! custom rules.

pub mod policy;
pub mod registry;

pub use policy::{
    AnnouncePolicy, AttributePolicy, AttributeType, Cardinality, RequestOptionality,
};
pub use registry::PolicyRegistry;

use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{CseError, CseResult, ResponseStatusCode, ValidationError};
use crate::resource::{Resource, ResourceType, parse_timestamp};
use crate::storage::Storage;

/// Request operation the payload is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOperation {
    Create,
    Update,
}

#[derive(Debug, Default)]
pub struct Validator {
    registry: PolicyRegistry,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            registry: PolicyRegistry::new(),
        }
    }

    pub fn with_registry(registry: PolicyRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Validate a request payload (the inner attribute object) against
    /// the policies of `ty`. Covers rules 1-3: unknown attributes,
    /// missing mandatory-on-create attributes, and attributes the
    /// request must not carry.
    pub fn validate_payload(
        &self,
        ty: ResourceType,
        cnd: Option<&str>,
        payload: &Map<String, Value>,
        operation: RequestOperation,
    ) -> CseResult<()> {
        let table = self
            .registry
            .attributes_of(ty)
            .ok_or_else(|| CseError::bad_request(format!("no policies for type {ty}")))?;

        for name in payload.keys() {
            if self.registry.policy(ty, cnd, name).is_none() {
                return Err(ValidationError::UnknownAttribute {
                    attribute: name.clone(),
                    ty: ty.to_string(),
                }
                .into());
            }
        }

        for (name, policy) in table {
            let optionality = match operation {
                RequestOperation::Create => policy.create,
                RequestOperation::Update => policy.update,
            };
            match optionality {
                RequestOptionality::Mandatory => {
                    if operation == RequestOperation::Create && !payload.contains_key(*name) {
                        return Err(ValidationError::MissingMandatoryAttribute {
                            attribute: (*name).to_string(),
                        }
                        .into());
                    }
                }
                RequestOptionality::NotPresent => {
                    if payload.contains_key(*name) {
                        return Err(ValidationError::AttributeNotAllowed {
                            attribute: (*name).to_string(),
                        }
                        .into());
                    }
                }
                RequestOptionality::Optional => {}
            }
        }

        Ok(())
    }

    /// Validate the full (merged) resource: data types, ranges and
    /// per-type custom rules. `parent` is the would-be or current parent.
    pub fn validate_resource(
        &self,
        resource: &Resource,
        parent: Option<&Resource>,
    ) -> CseResult<()> {
        let cnd = resource.str_attr("cnd").map(str::to_string);
        for (name, value) in resource.attributes() {
            if let Some(policy) = self.registry.policy(resource.ty(), cnd.as_deref(), name) {
                check_value(name, value, policy)?;
            }
        }
        self.custom_checks(resource, parent)
    }

    /// Every ACP referenced from `acpi` must exist; a dangling reference
    /// fails the operation.
    pub async fn check_acpi_references(
        &self,
        storage: &dyn Storage,
        resource: &Resource,
    ) -> CseResult<()> {
        for acpi in resource.acpi() {
            match storage.resource_by_ri(&acpi).await? {
                Some(acp) if acp.ty() == ResourceType::Acp => {}
                Some(_) => {
                    return Err(CseError::bad_request(format!(
                        "acpi reference '{acpi}' is not an ACP"
                    )));
                }
                None => {
                    return Err(CseError::bad_request(format!(
                        "acpi references unknown resource '{acpi}'"
                    )));
                }
            }
        }
        Ok(())
    }

    fn custom_checks(&self, resource: &Resource, parent: Option<&Resource>) -> CseResult<()> {
        match resource.ty() {
            ResourceType::Sub => self.check_subscription(resource),
            ResourceType::Acp => {
                check_privileges(resource.attr("pv"), "pv")?;
                check_privileges(resource.attr("pvs"), "pvs")
            }
            ResourceType::Cin => check_content_instance(resource, parent),
            ResourceType::MgmtObj => check_mgmt_obj(resource),
            ResourceType::Grp => check_group(resource),
            _ => Ok(()),
        }
    }

    fn check_subscription(&self, resource: &Resource) -> CseResult<()> {
        if resource.str_list_attr("nu").is_empty() {
            return Err(ValidationError::InvalidAttributeValue {
                attribute: "nu".into(),
                message: "notification URI list must not be empty".into(),
            }
            .into());
        }
        if resource.has_attr("acrs") && resource.str_list_attr("acrs").is_empty() {
            return Err(ValidationError::InvalidAttributeValue {
                attribute: "acrs".into(),
                message: "cross-resource subscription list must not be empty".into(),
            }
            .into());
        }
        if let Some(nct) = resource.int_attr("nct") {
            if !matches!(nct, 1 | 2 | 3 | 5) {
                return Err(ValidationError::InvalidAttributeValue {
                    attribute: "nct".into(),
                    message: format!("unsupported notificationContentType {nct}"),
                }
                .into());
            }
        }
        if let Some(enc) = resource.attr("enc") {
            let enc = enc.as_object().ok_or(ValidationError::InvalidAttributeType {
                attribute: "enc".into(),
                expected: "object",
            })?;
            if let Some(net) = enc.get("net") {
                let net = net.as_array().ok_or(ValidationError::InvalidAttributeType {
                    attribute: "enc/net".into(),
                    expected: "list",
                })?;
                for value in net {
                    match value.as_i64() {
                        Some(1 | 2 | 3 | 4 | 8) => {}
                        _ => {
                            return Err(ValidationError::InvalidAttributeValue {
                                attribute: "enc/net".into(),
                                message: format!("unsupported notificationEventType {value}"),
                            }
                            .into());
                        }
                    }
                }
            }
        }
        if let Some(bn) = resource.attr("bn") {
            let bn = bn.as_object().ok_or(ValidationError::InvalidAttributeType {
                attribute: "bn".into(),
                expected: "object",
            })?;
            if let Some(num) = bn.get("num") {
                if num.as_i64().is_none_or(|n| n < 1) {
                    return Err(ValidationError::InvalidAttributeValue {
                        attribute: "bn/num".into(),
                        message: "batch size must be a positive integer".into(),
                    }
                    .into());
                }
            }
            if let Some(dur) = bn.get("dur") {
                let dur = dur.as_str().ok_or(ValidationError::InvalidAttributeType {
                    attribute: "bn/dur".into(),
                    expected: "string",
                })?;
                if parse_iso8601_duration(dur).is_none() {
                    return Err(ValidationError::InvalidAttributeValue {
                        attribute: "bn/dur".into(),
                        message: format!("'{dur}' is not a duration"),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

fn check_value(name: &str, value: &Value, policy: &AttributePolicy) -> CseResult<()> {
    use AttributeType::*;
    let ok = match policy.data_type {
        String | Timestamp => value.is_string(),
        Integer => value.is_i64() || value.is_u64(),
        PositiveInteger => value.as_i64().is_some_and(|n| n >= 1),
        NonNegInteger => value.as_i64().is_some_and(|n| n >= 0),
        Bool => value.is_boolean(),
        ListOfStrings => value
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string)),
        List => value.is_array(),
        Complex => value.is_object(),
        Any => true,
    };
    if !ok {
        return Err(ValidationError::InvalidAttributeType {
            attribute: name.to_string(),
            expected: policy.data_type.name(),
        }
        .into());
    }
    if policy.data_type == AttributeType::Timestamp {
        let text = value.as_str().unwrap_or_default();
        if parse_timestamp(text).is_none() {
            return Err(ValidationError::InvalidAttributeValue {
                attribute: name.to_string(),
                message: format!("'{text}' is not a timestamp"),
            }
            .into());
        }
    }
    Ok(())
}

/// Access-control rules inside `pv`/`pvs`: a list (or single object) of
/// `{acor: [originators], acop: bitmask}` entries.
fn check_privileges(value: Option<&Value>, attribute: &str) -> CseResult<()> {
    let Some(value) = value else { return Ok(()) };
    let rules = value
        .get("acr")
        .ok_or_else(|| ValidationError::InvalidAttributeValue {
            attribute: attribute.to_string(),
            message: "missing 'acr'".into(),
        })?;
    let entries: Vec<&Value> = match rules {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![rules],
        _ => {
            return Err(ValidationError::InvalidAttributeType {
                attribute: format!("{attribute}/acr"),
                expected: "list",
            }
            .into());
        }
    };
    for entry in entries {
        let acop = entry
            .get("acop")
            .and_then(Value::as_i64)
            .ok_or_else(|| ValidationError::InvalidAttributeValue {
                attribute: format!("{attribute}/acr/acop"),
                message: "missing operation bitmask".into(),
            })?;
        if !(0..=63).contains(&acop) {
            return Err(ValidationError::InvalidAttributeValue {
                attribute: format!("{attribute}/acr/acop"),
                message: format!("bitmask {acop} out of range"),
            }
            .into());
        }
        let acor_ok = entry
            .get("acor")
            .and_then(Value::as_array)
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !acor_ok {
            return Err(ValidationError::InvalidAttributeValue {
                attribute: format!("{attribute}/acr/acor"),
                message: "originator list missing or malformed".into(),
            }
            .into());
        }
    }
    Ok(())
}

fn check_content_instance(resource: &Resource, parent: Option<&Resource>) -> CseResult<()> {
    if let (Some(cs), Some(mbs)) = (
        resource.int_attr("cs"),
        parent.and_then(|p| p.int_attr("mbs")),
    ) {
        if cs > mbs {
            return Err(CseError::with_debug(
                ResponseStatusCode::NotAcceptable,
                format!("content size {cs} exceeds container maxByteSize {mbs}"),
            ));
        }
    }
    Ok(())
}

fn check_mgmt_obj(resource: &Resource) -> CseResult<()> {
    // dataCollection: periodic and event-driven settings are exclusive
    if resource.has_attr("rpsc") && resource.has_attr("rpil") {
        return Err(ValidationError::custom("rpsc and rpil shall not be set together").into());
    }
    if resource.has_attr("mesc") && resource.has_attr("meil") {
        return Err(ValidationError::custom("mesc and meil shall not be set together").into());
    }
    Ok(())
}

fn check_group(resource: &Resource) -> CseResult<()> {
    if let Some(mt) = resource.int_attr("mt") {
        // 0 denotes mixed membership
        if mt != 0 && ResourceType::from_code(mt as i32).is_none() {
            return Err(ValidationError::InvalidAttributeValue {
                attribute: "mt".into(),
                message: format!("unknown member type {mt}"),
            }
            .into());
        }
    }
    if let (Some(mnm), Some(mid)) = (resource.int_attr("mnm"), resource.attr("mid")) {
        let members = mid.as_array().map(Vec::len).unwrap_or(0);
        if members as i64 > mnm {
            return Err(ValidationError::InvalidAttributeValue {
                attribute: "mid".into(),
                message: format!("{members} members exceed maxNrOfMembers {mnm}"),
            }
            .into());
        }
    }
    if let Some(csy) = resource.int_attr("csy") {
        if !matches!(csy, 1..=3) {
            return Err(ValidationError::InvalidAttributeValue {
                attribute: "csy".into(),
                message: format!("invalid consistencyStrategy {csy}"),
            }
            .into());
        }
    }
    Ok(())
}

/// Parse an ISO 8601 duration of the form `PnDTnHnMnS` (date part days
/// only). Returns `None` for anything malformed.
pub fn parse_iso8601_duration(text: &str) -> Option<Duration> {
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    let mut seconds = 0.0_f64;
    let mut parse_segments = |part: &str, units: &[(char, f64)]| -> Option<()> {
        let mut number = std::string::String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                number.push(ch);
            } else {
                let (_, factor) = units.iter().find(|(unit, _)| *unit == ch)?;
                let value: f64 = number.parse().ok()?;
                seconds += value * factor;
                number.clear();
            }
        }
        if number.is_empty() { Some(()) } else { None }
    };

    if !date_part.is_empty() {
        parse_segments(date_part, &[('D', 86_400.0)])?;
    }
    match time_part {
        Some(t) if !t.is_empty() => {
            parse_segments(t, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?
        }
        Some(_) => return None,
        None => {}
    }
    if seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(ty: ResourceType, attrs: Value) -> Resource {
        Resource::new(ty, attrs.as_object().cloned().unwrap())
    }

    #[test]
    fn unknown_attribute_rejected() {
        let validator = Validator::new();
        let payload = json!({"mni": 2, "frobnicate": true});
        let err = validator
            .validate_payload(
                ResourceType::Cnt,
                None,
                payload.as_object().unwrap(),
                RequestOperation::Create,
            )
            .unwrap_err();
        assert_eq!(err.rsc, ResponseStatusCode::BadRequest);
        assert!(err.debug.unwrap().contains("frobnicate"));
    }

    #[test]
    fn missing_mandatory_on_create() {
        let validator = Validator::new();
        let payload = json!({"enc": {"net": [3]}});
        let err = validator
            .validate_payload(
                ResourceType::Sub,
                None,
                payload.as_object().unwrap(),
                RequestOperation::Create,
            )
            .unwrap_err();
        assert!(err.debug.unwrap().contains("nu"));
    }

    #[test]
    fn server_managed_attribute_rejected_on_update() {
        let validator = Validator::new();
        let payload = json!({"cni": 7});
        let err = validator
            .validate_payload(
                ResourceType::Cnt,
                None,
                payload.as_object().unwrap(),
                RequestOperation::Update,
            )
            .unwrap_err();
        assert!(err.debug.unwrap().contains("cni"));
    }

    #[test]
    fn type_violations_are_caught() {
        let validator = Validator::new();
        let cnt = resource(ResourceType::Cnt, json!({"mni": "two"}));
        assert!(validator.validate_resource(&cnt, None).is_err());

        let cnt = resource(ResourceType::Cnt, json!({"mni": 2}));
        assert!(validator.validate_resource(&cnt, None).is_ok());
    }

    #[test]
    fn subscription_rules() {
        let validator = Validator::new();
        let sub = resource(
            ResourceType::Sub,
            json!({"nu": [], "enc": {"net": [3]}}),
        );
        assert!(validator.validate_resource(&sub, None).is_err());

        let sub = resource(
            ResourceType::Sub,
            json!({"nu": ["http://client"], "enc": {"net": [7]}}),
        );
        assert!(validator.validate_resource(&sub, None).is_err());

        let sub = resource(
            ResourceType::Sub,
            json!({"nu": ["http://client"], "enc": {"net": [3]}, "exc": 2}),
        );
        assert!(validator.validate_resource(&sub, None).is_ok());
    }

    #[test]
    fn data_collection_exclusive_settings() {
        let validator = Validator::new();
        let datc = resource(
            ResourceType::MgmtObj,
            json!({"mgd": 1021, "rpsc": 30, "rpil": ["target"]}),
        );
        assert!(validator.validate_resource(&datc, None).is_err());

        let datc = resource(ResourceType::MgmtObj, json!({"mgd": 1021, "rpsc": 30}));
        assert!(validator.validate_resource(&datc, None).is_ok());
    }

    #[test]
    fn content_size_vs_parent_limit() {
        let validator = Validator::new();
        let cnt = resource(ResourceType::Cnt, json!({"mbs": 4}));
        let cin = resource(ResourceType::Cin, json!({"con": "abcdefgh", "cs": 8}));
        let err = validator.validate_resource(&cin, Some(&cnt)).unwrap_err();
        assert_eq!(err.rsc, ResponseStatusCode::NotAcceptable);
    }

    #[test]
    fn durations() {
        assert_eq!(
            parse_iso8601_duration("PT5S"),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            parse_iso8601_duration("PT1M30S"),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_iso8601_duration("P1DT1H"),
            Some(Duration::from_secs(90_000))
        );
        assert_eq!(parse_iso8601_duration("5S"), None);
        assert_eq!(parse_iso8601_duration("PT5X"), None);
    }
}
