//! The CSE context object.
//!
//! One [`Cse`] wires configuration, storage, the validator, the
//! security/registration/notification/announcement managers and the
//! event bus together, and is threaded through the request pipeline
//! explicitly. Construction boots the resource tree (CSEBase, default
//! ACP, registrar remoteCSE) and hands back the event worker that the
//! embedder runs (or drains, in tests).

use chrono::{Duration, Utc};
use log::info;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::announcement::AnnouncementManager;
use crate::config::{CseConfig, CseType};
use crate::error::{CseError, CseResult, ResponseStatusCode};
use crate::event::{EventBus, EventWorker};
use crate::notification::NotificationManager;
use crate::registration::{self, RegistrationManager};
use crate::request::{HttpRequestSender, RawRequest, RequestManager, RequestSender};
use crate::resource::{Factory, Resource, ResourceType, format_timestamp, now_timestamp, unique_ri};
use crate::security::{SecurityManager, permission};
use crate::storage::{InMemoryStorage, Storage};
use crate::validation::Validator;

/// Why a resource (sub)tree is being deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteCause {
    /// A DELETE request (or an internal removal on its behalf)
    Request,
    /// The expiration sweep
    Expired,
    /// Container trimming to `mni`/`mbs`
    Trim,
}

/// Response primitive handed back to a binding.
#[derive(Debug, Clone)]
pub struct CseResponse {
    pub rsc: ResponseStatusCode,
    pub rqi: Option<String>,
    pub rvi: Option<String>,
    pub vsi: Option<String>,
    pub pc: Option<Value>,
}

impl CseResponse {
    pub fn error(
        err: CseError,
        rqi: Option<String>,
        rvi: Option<String>,
        vsi: Option<String>,
    ) -> Self {
        Self {
            rsc: err.rsc,
            rqi,
            rvi,
            vsi,
            pc: err.debug.map(|debug| json!({ "m2m:dbg": debug })),
        }
    }
}

pub struct Cse {
    pub config: CseConfig,
    pub storage: Arc<dyn Storage>,
    pub validator: Validator,
    pub factory: Factory,
    pub security: SecurityManager,
    pub registration: RegistrationManager,
    pub notification: NotificationManager,
    pub announcement: AnnouncementManager,
    pub requests: RequestManager,
    pub events: EventBus,
}

impl Cse {
    /// Build a CSE over the given storage and outbound sender and boot
    /// the resource tree. Returns the context and the event worker.
    pub async fn new(
        config: CseConfig,
        storage: Arc<dyn Storage>,
        sender: Arc<dyn RequestSender>,
    ) -> CseResult<(Arc<Self>, EventWorker)> {
        let (events, rx) = EventBus::channel();
        let security = SecurityManager::new(config.enable_acp_checks);
        let cse = Arc::new(Self {
            security,
            validator: Validator::new(),
            factory: Factory::new(),
            registration: RegistrationManager::new(),
            notification: NotificationManager::new(),
            announcement: AnnouncementManager::new(),
            requests: RequestManager::new(sender),
            events,
            storage,
            config,
        });
        cse.bootstrap().await?;
        let worker = EventWorker::new(Arc::clone(&cse), rx);
        Ok((cse, worker))
    }

    /// Convenience constructor: in-memory storage and the HTTP sender.
    pub async fn with_config(config: CseConfig) -> CseResult<(Arc<Self>, EventWorker)> {
        let sender = Arc::new(HttpRequestSender::new(config.notification_timeout_ms));
        Self::new(config, Arc::new(InMemoryStorage::new()), sender).await
    }

    /// Create the CSEBase, the default ACP and the registrar remoteCSE
    /// unless they already exist.
    async fn bootstrap(&self) -> CseResult<()> {
        if self.config.reset_storage_on_startup {
            self.storage.clear().await?;
        }
        if self.storage.resource_by_ri(&self.config.ri).await?.is_some() {
            return Ok(());
        }
        info!(
            "booting CSEBase '{}' ({})",
            self.config.rn, self.config.csi
        );
        let now = now_timestamp();
        let cst = match self.config.cse_type {
            CseType::In => 1,
            CseType::Mn => 2,
            CseType::Asn => 3,
        };
        let supported: Vec<i32> = [
            ResourceType::Acp,
            ResourceType::Ae,
            ResourceType::Cnt,
            ResourceType::Cin,
            ResourceType::CseBase,
            ResourceType::Grp,
            ResourceType::MgmtObj,
            ResourceType::Nod,
            ResourceType::Csr,
            ResourceType::Sub,
            ResourceType::FlexContainer,
        ]
        .iter()
        .map(ResourceType::code)
        .collect();

        let mut attributes = Map::new();
        attributes.insert("ri".into(), json!(self.config.ri));
        attributes.insert("rn".into(), json!(self.config.rn));
        attributes.insert("pi".into(), json!(""));
        attributes.insert("ty".into(), json!(ResourceType::CseBase.code()));
        attributes.insert("ct".into(), json!(now.clone()));
        attributes.insert("lt".into(), json!(now.clone()));
        attributes.insert("csi".into(), json!(self.config.csi));
        attributes.insert("cst".into(), json!(cst));
        attributes.insert("srt".into(), json!(supported));
        attributes.insert(
            "poa".into(),
            json!([format!(
                "http://{}:{}",
                self.config.http_interface, self.config.http_port
            )]),
        );
        let mut cse_base = Resource::new(ResourceType::CseBase, attributes);

        // Default ACP: full privileges for the administrator originator.
        let acp_ri = unique_ri("acp");
        let acp_attributes = json!({
            "ri": acp_ri,
            "rn": self.config.default_acp_rn,
            "pi": self.config.ri,
            "ty": ResourceType::Acp.code(),
            "ct": now,
            "lt": now,
            "et": format_timestamp(Utc::now() + Duration::days(365 * 5)),
            "pv":  { "acr": [ { "acor": [self.config.originator], "acop": permission::ALL } ] },
            "pvs": { "acr": [ { "acor": [self.config.originator], "acop": permission::ALL } ] },
        });
        let acp = Resource::new(
            ResourceType::Acp,
            acp_attributes.as_object().cloned().unwrap(),
        );

        cse_base.set_attr("acpi", json!([acp_ri]));
        self.storage.put_resource(&cse_base, &self.config.rn).await?;
        let acp_srn = format!("{}/{}", self.config.rn, self.config.default_acp_rn);
        self.storage.put_resource(&acp, &acp_srn).await?;

        if let Some(remote) = self.config.remote.clone() {
            let csr_ri = unique_ri("csr");
            let rn = remote.csi.trim_start_matches('/').to_string();
            let csr_attributes = json!({
                "ri": csr_ri,
                "rn": rn,
                "pi": self.config.ri,
                "ty": ResourceType::Csr.code(),
                "ct": now_timestamp(),
                "lt": now_timestamp(),
                "csi": remote.csi,
                "cb": remote.rn,
                "poa": [remote.address],
                "rr": true,
            });
            let csr = Resource::new(
                ResourceType::Csr,
                csr_attributes.as_object().cloned().unwrap(),
            );
            let srn = format!("{}/{}", self.config.rn, csr.rn());
            self.storage.put_resource(&csr, &srn).await?;
            info!("registrar CSE '{}' registered at boot", remote.csi);
        }
        Ok(())
    }

    /// Handle a bound request end to end.
    pub async fn handle_raw_request(self: &Arc<Self>, raw: RawRequest) -> CseResponse {
        self.requests.handle_raw(self, raw).await
    }

    /// Spawn the background tasks: the expiration monitor and, when a
    /// registrar is configured, the remote CSE heartbeat.
    pub fn start_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![registration::spawn_expiration_monitor(Arc::clone(self))];
        if let Some(heartbeat) = registration::spawn_remote_heartbeat(Arc::clone(self)) {
            tasks.push(heartbeat);
        }
        tasks
    }

    /// Cancel pending timers. Call before dropping the runtime.
    pub async fn shutdown(&self) {
        self.notification.cancel_batch_workers().await;
        info!("CSE shut down");
    }
}
