//! Request primitives and the request manager.
//!
//! Bindings deliver a [`RawRequest`]; [`RequestManager::dissect`] turns
//! it into the canonical [`CseRequest`] or rejects it with a structured
//! error. Local targets are routed to the dispatcher; targets owned by
//! another CSE are retargeted through the outbound [`RequestSender`],
//! preserving originator, request identifier and release version.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;

use crate::addressing;
use crate::binding::headers;
use crate::config::CseConfig;
use crate::cse::{Cse, CseResponse};
use crate::error::{CseError, CseResult, ResponseStatusCode};
use crate::resource::{Resource, ResourceType, parse_timestamp};

/// oneM2M request operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Retrieve,
    Update,
    Delete,
    Notify,
}

impl Operation {
    pub fn code(&self) -> i64 {
        match self {
            Operation::Create => 1,
            Operation::Retrieve => 2,
            Operation::Update => 3,
            Operation::Delete => 4,
            Operation::Notify => 5,
        }
    }
}

/// Content serializations this CSE understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSerialization {
    Json,
}

/// Filter criteria of retrieve/discovery requests. The multi-valued
/// members collect every occurrence of their query parameter.
#[derive(Debug, Clone, Default)]
pub struct FilterCriteria {
    pub ty: Vec<ResourceType>,
    pub lbl: Vec<String>,
    pub cty: Vec<String>,
    /// Filter usage; `1` marks a discovery request
    pub fu: Option<i64>,
}

impl FilterCriteria {
    pub fn is_discovery(&self) -> bool {
        self.fu == Some(1)
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if !self.ty.is_empty() && !self.ty.contains(&resource.ty()) {
            return false;
        }
        if !self.lbl.is_empty() {
            let labels = resource.str_list_attr("lbl");
            if !self.lbl.iter().any(|l| labels.contains(l)) {
                return false;
            }
        }
        if !self.cty.is_empty() {
            let cnf = resource.str_attr("cnf").unwrap_or_default();
            if !self.cty.iter().any(|c| c == cnf) {
                return false;
            }
        }
        true
    }
}

/// The canonical request object processed by the dispatcher.
#[derive(Debug, Clone)]
pub struct CseRequest {
    pub operation: Operation,
    pub to: String,
    pub originator: String,
    pub rqi: String,
    pub rvi: String,
    pub ty: Option<ResourceType>,
    pub pc: Option<Value>,
    pub serialization: ContentSerialization,
    /// Result content; `1` (attributes) unless requested otherwise
    pub rcn: i64,
    /// Discovery result type; `1` structured, `2` unstructured
    pub drt: i64,
    pub rp: Option<String>,
    pub ec: Option<String>,
    pub rqet: Option<DateTime<Utc>>,
    pub rset: Option<DateTime<Utc>>,
    pub oet: Option<String>,
    pub rtu: Vec<String>,
    pub vsi: Option<String>,
    pub fc: FilterCriteria,
}

/// Transport-agnostic shape of an inbound request as produced by a
/// binding: operation, target path (prefix already stripped), headers,
/// query parameters and the undecoded body.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub operation: Operation,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

impl RawRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn query_values(&self, name: &str) -> Vec<String> {
        self.query
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
            .collect()
    }

    fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// An outbound request towards a remote CSE or notification target.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub operation: Operation,
    pub uri: String,
    pub originator: String,
    pub rqi: String,
    pub rvi: String,
    pub ty: Option<ResourceType>,
    pub body: Option<Value>,
    pub ec: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub rsc: ResponseStatusCode,
    pub body: Option<Value>,
}

/// Outbound delivery seam. The HTTP implementation is the production
/// path; tests substitute a recording sender.
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> CseResult<OutboundResponse>;
}

/// `reqwest`-backed sender used for notifications, announcements and
/// retargeted requests.
pub struct HttpRequestSender {
    client: reqwest::Client,
}

impl HttpRequestSender {
    pub fn new(timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl RequestSender for HttpRequestSender {
    async fn send(&self, request: OutboundRequest) -> CseResult<OutboundResponse> {
        let method = match request.operation {
            Operation::Create | Operation::Notify => reqwest::Method::POST,
            Operation::Retrieve => reqwest::Method::GET,
            Operation::Update => reqwest::Method::PUT,
            Operation::Delete => reqwest::Method::DELETE,
        };
        let content_type = match request.ty {
            Some(ty) => format!("application/json;ty={}", ty.code()),
            None => "application/json".to_string(),
        };
        let mut builder = self
            .client
            .request(method, &request.uri)
            .header("Content-Type", content_type)
            .header(headers::ORIGINATOR, &request.originator)
            .header(headers::REQUEST_ID, &request.rqi)
            .header(headers::RELEASE_VERSION, &request.rvi);
        if let Some(ec) = &request.ec {
            builder = builder.header(headers::EVENT_CATEGORY, ec);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|err| {
            CseError::with_debug(
                ResponseStatusCode::TargetNotReachable,
                format!("request to '{}' failed: {err}", request.uri),
            )
        })?;

        let rsc = response
            .headers()
            .get(headers::RESPONSE_STATUS)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u32>().ok())
            .and_then(ResponseStatusCode::from_numeric)
            .unwrap_or_else(|| {
                if response.status().is_success() {
                    ResponseStatusCode::Ok
                } else {
                    ResponseStatusCode::TargetNotReachable
                }
            });
        let body = response.json::<Value>().await.ok();
        Ok(OutboundResponse { rsc, body })
    }
}

/// Fills, validates and routes request primitives.
pub struct RequestManager {
    sender: Arc<dyn RequestSender>,
}

impl RequestManager {
    pub fn new(sender: Arc<dyn RequestSender>) -> Self {
        Self { sender }
    }

    pub fn sender(&self) -> &Arc<dyn RequestSender> {
        &self.sender
    }

    /// Turn a bound request into a canonical [`CseRequest`].
    pub fn dissect(&self, config: &CseConfig, raw: &RawRequest) -> CseResult<CseRequest> {
        let originator = raw.header(headers::ORIGINATOR).unwrap_or_default().to_string();

        let ty = raw
            .content_type
            .as_deref()
            .and_then(content_type_ty)
            .map(|code| {
                ResourceType::from_code(code)
                    .ok_or_else(|| CseError::bad_request(format!("unknown resource type {code}")))
            })
            .transpose()?;

        if originator.is_empty()
            && !(raw.operation == Operation::Create && ty == Some(ResourceType::Ae))
        {
            return Err(CseError::bad_request("originator missing"));
        }

        let rqi = raw
            .header(headers::REQUEST_ID)
            .ok_or_else(|| CseError::bad_request("request identifier missing"))?
            .to_string();

        let rvi = raw
            .header(headers::RELEASE_VERSION)
            .ok_or_else(|| CseError::bad_request("release version indicator missing"))?
            .to_string();
        if !config.supported_release_versions.contains(&rvi) {
            return Err(CseError::with_debug(
                ResponseStatusCode::ReleaseVersionNotSupported,
                format!("release version '{rvi}' not supported"),
            ));
        }

        if let Some(ct) = raw.content_type.as_deref() {
            if !ct.contains("json") {
                return Err(CseError::bad_request(format!(
                    "unsupported content serialization '{ct}'"
                )));
            }
        }

        let rqet = raw
            .header(headers::REQUEST_EXPIRATION)
            .map(|value| parse_expiration(value))
            .transpose()?;
        if let Some(rqet) = rqet {
            if rqet <= Utc::now() {
                return Err(CseError::with_debug(
                    ResponseStatusCode::RequestTimeout,
                    "request expired",
                ));
            }
        }
        let rset = raw
            .header(headers::RESULT_EXPIRATION)
            .map(|value| parse_expiration(value))
            .transpose()?;

        let pc = raw
            .body
            .as_deref()
            .filter(|body| !body.is_empty())
            .map(|body| {
                serde_json::from_slice::<Value>(body)
                    .map_err(|err| CseError::bad_request(format!("malformed content: {err}")))
            })
            .transpose()?;

        let mut fc = FilterCriteria::default();
        for value in raw.query_values("ty") {
            let code = value
                .parse::<i32>()
                .map_err(|_| CseError::bad_request("filter 'ty' must be an integer"))?;
            fc.ty.push(
                ResourceType::from_code(code)
                    .ok_or_else(|| CseError::bad_request(format!("unknown resource type {code}")))?,
            );
        }
        fc.lbl = raw.query_values("lbl");
        fc.cty = raw.query_values("cty");
        fc.fu = raw
            .query_value("fu")
            .map(|value| {
                value
                    .parse::<i64>()
                    .map_err(|_| CseError::bad_request("filter 'fu' must be an integer"))
            })
            .transpose()?;

        let rcn = raw
            .query_value("rcn")
            .map(|value| {
                value
                    .parse::<i64>()
                    .map_err(|_| CseError::bad_request("'rcn' must be an integer"))
            })
            .transpose()?
            .unwrap_or(1);
        let drt = raw
            .query_value("drt")
            .map(|value| {
                value
                    .parse::<i64>()
                    .map_err(|_| CseError::bad_request("'drt' must be an integer"))
            })
            .transpose()?
            .unwrap_or(1);

        Ok(CseRequest {
            operation: raw.operation,
            to: raw.path.clone(),
            originator,
            rqi,
            rvi,
            ty,
            pc,
            serialization: ContentSerialization::Json,
            rcn,
            drt,
            rp: raw.query_value("rp").map(str::to_string),
            ec: raw.header(headers::EVENT_CATEGORY).map(str::to_string),
            rqet,
            rset,
            oet: raw.header(headers::OPERATION_EXECUTION_TIME).map(str::to_string),
            rtu: raw
                .header(headers::RESPONSE_TARGET_URI)
                .map(|value| value.split('&').map(str::to_string).collect())
                .unwrap_or_default(),
            vsi: raw.header(headers::VENDOR_INFO).map(str::to_string),
            fc,
        })
    }

    /// Entry point for bindings: dissect, route, and fold errors into a
    /// response primitive.
    pub async fn handle_raw(&self, cse: &Arc<Cse>, raw: RawRequest) -> CseResponse {
        let rqi = raw.header(headers::REQUEST_ID).map(str::to_string);
        let rvi = raw.header(headers::RELEASE_VERSION).map(str::to_string);
        let vsi = raw.header(headers::VENDOR_INFO).map(str::to_string);

        let request = match self.dissect(&cse.config, &raw) {
            Ok(request) => request,
            Err(err) => {
                debug!("request rejected during dissect: {err}");
                return CseResponse::error(err, rqi, rvi, vsi);
            }
        };

        match self.route(cse, &request).await {
            Ok((rsc, pc)) => CseResponse {
                rsc,
                rqi: Some(request.rqi),
                rvi: Some(request.rvi),
                vsi: request.vsi,
                pc,
            },
            Err(err) => CseResponse::error(err, Some(request.rqi), Some(request.rvi), request.vsi),
        }
    }

    /// Route a canonical request: retarget foreign addresses, otherwise
    /// dispatch the operation locally.
    pub async fn route(
        &self,
        cse: &Arc<Cse>,
        request: &CseRequest,
    ) -> CseResult<(ResponseStatusCode, Option<Value>)> {
        let kind = addressing::classify(&request.to);
        if kind != addressing::PathKind::CseRelative {
            let target = addressing::resolve_target(
                cse.storage.as_ref(),
                &request.to,
                &cse.config.rn,
                &cse.config.csi,
            )
            .await?;
            if let (Some(csi), Some(remainder)) = (&target.csi, &target.remainder) {
                return self.retarget(cse, request, csi, remainder).await;
            }
        }

        match request.operation {
            Operation::Retrieve => cse.handle_retrieve(request).await,
            Operation::Create => cse.handle_create(request).await,
            Operation::Update => cse.handle_update(request).await,
            Operation::Delete => cse.handle_delete(request).await,
            Operation::Notify => self.forward_notify(cse, request).await,
        }
    }

    /// Forward a request addressed to another CSE, preserving the
    /// originator, request identifier and release version.
    async fn retarget(
        &self,
        cse: &Arc<Cse>,
        request: &CseRequest,
        csi: &str,
        remainder: &str,
    ) -> CseResult<(ResponseStatusCode, Option<Value>)> {
        let poa = self.poa_of_csi(cse, csi).await?;
        let uri = format!("{}/~{}", poa.trim_end_matches('/'), remainder);
        info!("retargeting request {} to {uri}", request.rqi);
        let response = self
            .sender
            .send(OutboundRequest {
                operation: request.operation,
                uri,
                originator: request.originator.clone(),
                rqi: request.rqi.clone(),
                rvi: request.rvi.clone(),
                ty: request.ty,
                body: request.pc.clone(),
                ec: request.ec.clone(),
            })
            .await?;
        Ok((response.rsc, response.body))
    }

    /// Deliver an inbound NOTIFY to the target's point of access.
    async fn forward_notify(
        &self,
        cse: &Arc<Cse>,
        request: &CseRequest,
    ) -> CseResult<(ResponseStatusCode, Option<Value>)> {
        let target = addressing::resolve_target(
            cse.storage.as_ref(),
            &request.to,
            &cse.config.rn,
            &cse.config.csi,
        )
        .await?;
        let ri = target
            .ri
            .ok_or_else(|| CseError::not_found(format!("'{}' not found", request.to)))?;
        let resource = cse
            .storage
            .resource_by_ri(&ri)
            .await?
            .ok_or_else(|| CseError::not_found(format!("'{ri}' not found")))?;
        let poa = resource
            .str_list_attr("poa")
            .into_iter()
            .next()
            .ok_or_else(|| {
                CseError::with_debug(
                    ResponseStatusCode::TargetNotReachable,
                    format!("'{ri}' has no point of access"),
                )
            })?;
        let response = self
            .sender
            .send(OutboundRequest {
                operation: Operation::Notify,
                uri: poa,
                originator: request.originator.clone(),
                rqi: request.rqi.clone(),
                rvi: request.rvi.clone(),
                ty: None,
                body: request.pc.clone(),
                ec: request.ec.clone(),
            })
            .await?;
        Ok((response.rsc, response.body))
    }

    /// Send a notification to `target`: a URL is used directly, a
    /// resource identifier resolves through its `poa`.
    pub async fn send_notify(
        &self,
        cse: &Cse,
        target: &str,
        body: Value,
        ec: Option<String>,
    ) -> CseResult<OutboundResponse> {
        let uri = if is_url(target) {
            target.to_string()
        } else {
            let resolved = addressing::resolve_target(
                cse.storage.as_ref(),
                target,
                &cse.config.rn,
                &cse.config.csi,
            )
            .await?;
            let ri = resolved
                .ri
                .ok_or_else(|| CseError::not_found(format!("notification target '{target}'")))?;
            let resource = cse
                .storage
                .resource_by_ri(&ri)
                .await?
                .ok_or_else(|| CseError::not_found(format!("notification target '{target}'")))?;
            resource
                .str_list_attr("poa")
                .into_iter()
                .next()
                .ok_or_else(|| {
                    CseError::with_debug(
                        ResponseStatusCode::TargetNotReachable,
                        format!("notification target '{target}' has no point of access"),
                    )
                })?
        };

        let response = self
            .sender
            .send(OutboundRequest {
                operation: Operation::Notify,
                uri,
                originator: cse.config.csi.clone(),
                rqi: uuid::Uuid::new_v4().simple().to_string(),
                rvi: cse.config.release_version.clone(),
                ty: None,
                body: Some(body),
                ec,
            })
            .await?;
        if !response.rsc.is_success() {
            warn!("notification to '{target}' answered rsc {}", response.rsc);
            return Err(CseError::with_debug(
                ResponseStatusCode::TargetNotReachable,
                format!("notification target '{target}' answered rsc {}", response.rsc),
            ));
        }
        Ok(response)
    }

    /// Perform an operation on a remote CSE identified by `csi`.
    pub async fn send_remote_operation(
        &self,
        cse: &Cse,
        operation: Operation,
        csi: &str,
        path: &str,
        ty: Option<ResourceType>,
        body: Option<Value>,
    ) -> CseResult<OutboundResponse> {
        let poa = self.poa_of_csi(cse, csi).await?;
        let uri = format!("{}/~{}{}", poa.trim_end_matches('/'), csi, path);
        self.sender
            .send(OutboundRequest {
                operation,
                uri,
                originator: cse.config.csi.clone(),
                rqi: uuid::Uuid::new_v4().simple().to_string(),
                rvi: cse.config.release_version.clone(),
                ty,
                body,
                ec: None,
            })
            .await
    }

    /// Point of access of a remote CSE: its registered `<remoteCSE>`
    /// resource, or the configured registrar.
    async fn poa_of_csi(&self, cse: &Cse, csi: &str) -> CseResult<String> {
        if let Some(csr) = cse.storage.resource_by_csi(csi).await? {
            if let Some(poa) = csr.str_list_attr("poa").into_iter().next() {
                return Ok(poa);
            }
        }
        if let Some(remote) = &cse.config.remote {
            if remote.csi == csi {
                return Ok(remote.address.clone());
            }
        }
        Err(CseError::with_debug(
            ResponseStatusCode::TargetNotReachable,
            format!("no point of access for CSE '{csi}'"),
        ))
    }
}

/// `ty` parameter of a `Content-Type` header, e.g.
/// `application/json;ty=3`.
fn content_type_ty(content_type: &str) -> Option<i32> {
    content_type.split(';').find_map(|part| {
        part.trim()
            .strip_prefix("ty=")
            .and_then(|value| value.parse().ok())
    })
}

/// Request/result expiration: an absolute timestamp, or a relative
/// offset in milliseconds. Negative offsets are rejected outright.
fn parse_expiration(value: &str) -> CseResult<DateTime<Utc>> {
    if let Ok(offset_ms) = value.parse::<i64>() {
        if offset_ms < 0 {
            return Err(CseError::with_debug(
                ResponseStatusCode::RequestTimeout,
                "negative relative expiration",
            ));
        }
        return Ok(Utc::now() + Duration::milliseconds(offset_ms));
    }
    parse_timestamp(value)
        .ok_or_else(|| CseError::bad_request(format!("'{value}' is not an expiration time")))
}

fn is_url(target: &str) -> bool {
    target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("mqtt://")
        || target.starts_with("mqtts://")
        || target.starts_with("coap://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(headers: &[(&str, &str)], query: &[(&str, &str)]) -> RawRequest {
        RawRequest {
            operation: Operation::Retrieve,
            path: "cse-in".into(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: None,
            content_type: None,
        }
    }

    struct NullSender;

    #[async_trait]
    impl RequestSender for NullSender {
        async fn send(&self, _request: OutboundRequest) -> CseResult<OutboundResponse> {
            Ok(OutboundResponse {
                rsc: ResponseStatusCode::Ok,
                body: None,
            })
        }
    }

    fn manager() -> RequestManager {
        RequestManager::new(Arc::new(NullSender))
    }

    #[test]
    fn missing_originator_is_rejected() {
        let config = CseConfig::default();
        let raw = raw(&[("X-M2M-RI", "r1"), ("X-M2M-RVI", "3")], &[]);
        let err = manager().dissect(&config, &raw).unwrap_err();
        assert_eq!(err.rsc, ResponseStatusCode::BadRequest);
    }

    #[test]
    fn unknown_release_version() {
        let config = CseConfig::default();
        let raw = raw(
            &[
                ("X-M2M-Origin", "CAdmin"),
                ("X-M2M-RI", "r1"),
                ("X-M2M-RVI", "1"),
            ],
            &[],
        );
        let err = manager().dissect(&config, &raw).unwrap_err();
        assert_eq!(err.rsc, ResponseStatusCode::ReleaseVersionNotSupported);
    }

    #[test]
    fn expired_request_times_out() {
        let config = CseConfig::default();
        let raw1 = raw(
            &[
                ("X-M2M-Origin", "CAdmin"),
                ("X-M2M-RI", "r1"),
                ("X-M2M-RVI", "3"),
                ("X-M2M-RET", "2000-01-01T00:00:00.000Z"),
            ],
            &[],
        );
        let err = manager().dissect(&config, &raw1).unwrap_err();
        assert_eq!(err.rsc, ResponseStatusCode::RequestTimeout);

        let raw2 = raw(
            &[
                ("X-M2M-Origin", "CAdmin"),
                ("X-M2M-RI", "r1"),
                ("X-M2M-RVI", "3"),
                ("X-M2M-RET", "-100"),
            ],
            &[],
        );
        let err = manager().dissect(&config, &raw2).unwrap_err();
        assert_eq!(err.rsc, ResponseStatusCode::RequestTimeout);
    }

    #[test]
    fn multi_valued_filters_collected() {
        let config = CseConfig::default();
        let raw = raw(
            &[
                ("X-M2M-Origin", "CAdmin"),
                ("X-M2M-RI", "r1"),
                ("X-M2M-RVI", "3"),
            ],
            &[("ty", "3"), ("ty", "4"), ("lbl", "a"), ("lbl", "b"), ("rcn", "4")],
        );
        let request = manager().dissect(&config, &raw).unwrap();
        assert_eq!(
            request.fc.ty,
            vec![ResourceType::Cnt, ResourceType::Cin]
        );
        assert_eq!(request.fc.lbl, vec!["a", "b"]);
        assert_eq!(request.rcn, 4);
    }

    #[test]
    fn content_type_carries_resource_type() {
        assert_eq!(content_type_ty("application/json;ty=3"), Some(3));
        assert_eq!(content_type_ty("application/json; ty=23"), Some(23));
        assert_eq!(content_type_ty("application/json"), None);
    }
}
