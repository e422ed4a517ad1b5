//! # oneM2M CSE core for Rust
//!
//! A Common Services Entity: a typed resource tree with access control,
//! subscriptions/notifications and resource announcement, driven by
//! canonical oneM2M request primitives.
//!
//! The pipeline is: a binding produces a [`request::RawRequest`]; the
//! [`request::RequestManager`] dissects and routes it (retargeting
//! requests owned by other CSEs); the dispatcher resolves the target,
//! consults the [`security::SecurityManager`] and the attribute-policy
//! [`validation::Validator`], and commits through [`storage::Storage`].
//! Committed mutations fan out over the internal event bus to the
//! [`notification::NotificationManager`] and the
//! [`announcement::AnnouncementManager`] without blocking the request.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use cse_server::{Cse, CseConfig, binding};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CseConfig::default();
//!     let (cse, worker) = Cse::with_config(config).await?;
//!
//!     // notification/announcement fan-out runs off-request
//!     tokio::spawn(worker.run());
//!     let _tasks = cse.start_background_tasks();
//!
//!     // serve the HTTP binding
//!     binding::http::serve(cse).await?;
//!     Ok(())
//! }
//! ```

pub mod addressing;
pub mod announcement;
pub mod binding;
pub mod config;
pub mod cse;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod notification;
pub mod registration;
pub mod request;
pub mod resource;
pub mod security;
pub mod storage;
pub mod validation;

// Core re-exports for library users
pub use config::{CseConfig, CseType, RemoteCseConfig};
pub use cse::{Cse, CseResponse, DeleteCause};
pub use error::{CseError, CseResult, ResponseStatusCode, ValidationError};
pub use event::{EventBus, EventWorker, ResourceEvent};
pub use request::{
    CseRequest, Operation, OutboundRequest, OutboundResponse, RawRequest, RequestManager,
    RequestSender,
};
pub use resource::{Factory, MgmtDefinition, Resource, ResourceType};
pub use security::{AccessRequest, SecurityManager, permission};
pub use storage::{InMemoryStorage, Storage, StorageError, SubscriptionRecord};
pub use validation::{PolicyRegistry, Validator};
