//! Transport bindings.
//!
//! Bindings translate between a transport protocol and the canonical
//! request/response primitives; everything protocol-specific stays on
//! this side of the [`crate::request::RawRequest`] boundary. HTTP is the
//! implemented binding.
//!
//! An MQTT binding would exchange the same primitives over the topics
//! `<prefix>/oneM2M/{req|resp|reg_req|reg_resp}/<from>/<to>/<ct>` with
//! the serialized primitive as payload; it is not part of this crate.

pub mod http;

/// oneM2M HTTP header names.
pub mod headers {
    pub const ORIGINATOR: &str = "X-M2M-Origin";
    pub const REQUEST_ID: &str = "X-M2M-RI";
    pub const RELEASE_VERSION: &str = "X-M2M-RVI";
    pub const REQUEST_EXPIRATION: &str = "X-M2M-RET";
    pub const RESULT_EXPIRATION: &str = "X-M2M-RST";
    pub const OPERATION_EXECUTION_TIME: &str = "X-M2M-OET";
    pub const RESPONSE_TARGET_URI: &str = "X-M2M-RTU";
    pub const VENDOR_INFO: &str = "X-M2M-VSI";
    pub const EVENT_CATEGORY: &str = "X-M2M-EC";
    pub const RESPONSE_STATUS: &str = "X-M2M-RSC";
}
