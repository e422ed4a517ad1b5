//! Shared test harness: a CSE over in-memory storage with a recording
//! outbound sender.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use cse_server::error::{CseError, CseResult, ResponseStatusCode};
use cse_server::event::EventWorker;
use cse_server::request::{
    CseRequest, FilterCriteria, Operation, OutboundRequest, OutboundResponse, RequestSender,
};
use cse_server::storage::InMemoryStorage;
use cse_server::{Cse, CseConfig, RemoteCseConfig, ResourceType};

/// Records every outbound request; CREATEs answer with a generated
/// remote resource identifier, everything else with OK.
pub struct MockSender {
    pub sent: Mutex<Vec<OutboundRequest>>,
    pub failing: Mutex<HashSet<String>>,
    counter: AtomicUsize,
}

impl MockSender {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            counter: AtomicUsize::new(0),
        }
    }

    pub async fn fail_target(&self, uri_prefix: &str) {
        self.failing.lock().await.insert(uri_prefix.to_string());
    }

    /// Sent notification bodies (`m2m:sgn` and `m2m:agn` requests).
    pub async fn notifications(&self) -> Vec<Value> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|request| request.operation == Operation::Notify)
            .filter_map(|request| request.body.clone())
            .collect()
    }

    pub async fn requests_of(&self, operation: Operation) -> Vec<OutboundRequest> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|request| request.operation == operation)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RequestSender for MockSender {
    async fn send(&self, request: OutboundRequest) -> CseResult<OutboundResponse> {
        let failing = self.failing.lock().await;
        if failing.iter().any(|prefix| request.uri.starts_with(prefix)) {
            return Err(CseError::with_debug(
                ResponseStatusCode::TargetNotReachable,
                format!("mock failure for '{}'", request.uri),
            ));
        }
        drop(failing);

        let response = match request.operation {
            Operation::Create => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                let tpe = request
                    .ty
                    .map(|ty| ty.type_prefix().to_string())
                    .unwrap_or_else(|| "m2m:res".to_string());
                OutboundResponse {
                    rsc: ResponseStatusCode::Created,
                    body: Some(json!({ (tpe): { "ri": format!("annc{n}") } })),
                }
            }
            _ => OutboundResponse {
                rsc: ResponseStatusCode::Ok,
                body: None,
            },
        };
        self.sent.lock().await.push(request);
        Ok(response)
    }
}

pub struct TestCse {
    pub cse: Arc<Cse>,
    pub worker: EventWorker,
    pub sender: Arc<MockSender>,
}

/// A CSE with `admin` as administrator and a registrar remote CSE
/// (`/id-mn`) known at boot.
pub async fn test_cse() -> TestCse {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = CseConfig {
        originator: "admin".to_string(),
        notification_retries: 0,
        notification_retry_backoff_ms: 1,
        remote: Some(RemoteCseConfig {
            address: "http://remote.example:8080".to_string(),
            csi: "/id-mn".to_string(),
            rn: "cse-mn".to_string(),
            originator: "/id-in".to_string(),
            check_interval_secs: 60,
        }),
        ..CseConfig::default()
    };
    let sender = Arc::new(MockSender::new());
    let (cse, worker) = Cse::new(
        config,
        Arc::new(InMemoryStorage::new()),
        sender.clone() as Arc<dyn RequestSender>,
    )
    .await
    .expect("boot test CSE");
    TestCse { cse, worker, sender }
}

pub fn request(operation: Operation, to: &str, originator: &str) -> CseRequest {
    CseRequest {
        operation,
        to: to.to_string(),
        originator: originator.to_string(),
        rqi: format!("rqi-{}", uuid_like()),
        rvi: "3".to_string(),
        ty: None,
        pc: None,
        serialization: cse_server::request::ContentSerialization::Json,
        rcn: 1,
        drt: 1,
        rp: None,
        ec: None,
        rqet: None,
        rset: None,
        oet: None,
        rtu: Vec::new(),
        vsi: None,
        fc: FilterCriteria::default(),
    }
}

pub fn create_request(to: &str, originator: &str, ty: ResourceType, pc: Value) -> CseRequest {
    let mut req = request(Operation::Create, to, originator);
    req.ty = Some(ty);
    req.pc = Some(pc);
    req
}

pub fn update_request(to: &str, originator: &str, pc: Value) -> CseRequest {
    let mut req = request(Operation::Update, to, originator);
    req.pc = Some(pc);
    req
}

static RQI: AtomicUsize = AtomicUsize::new(0);

fn uuid_like() -> usize {
    RQI.fetch_add(1, Ordering::SeqCst)
}

/// Route a request through the request manager and unwrap success.
pub async fn send_ok(cse: &Arc<Cse>, req: CseRequest) -> (ResponseStatusCode, Option<Value>) {
    cse.requests
        .route(cse, &req)
        .await
        .unwrap_or_else(|err| panic!("request to '{}' failed: {err}", req.to))
}

/// Route a request and unwrap the error.
pub async fn send_err(cse: &Arc<Cse>, req: CseRequest) -> CseError {
    match cse.requests.route(cse, &req).await {
        Ok((rsc, _)) => panic!("request to '{}' unexpectedly succeeded with {rsc}", req.to),
        Err(err) => err,
    }
}

/// The `ri` inside a create/retrieve response envelope.
pub fn ri_of(pc: &Value) -> String {
    pc.as_object()
        .and_then(|obj| obj.values().next())
        .and_then(|inner| inner.get("ri"))
        .and_then(Value::as_str)
        .expect("response carries a resource identifier")
        .to_string()
}
