//! Registration handshake messages.
//!
//! Both messages are created fresh for every dial attempt and discarded once
//! the handshake finishes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::code::ResponseCode;
use super::VERSION;

/// Sent by a listener to register itself under a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterListenerRequest {
    /// Protocol version spoken by the listener.
    pub version: u32,
    /// Namespace the listener registers under.
    pub service: String,
    /// Free-form metadata. Authenticators put credentials here.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl RegisterListenerRequest {
    /// Creates a request for `namespace` at the current protocol version.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            version: VERSION,
            service: namespace.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// The relay's answer to a [`RegisterListenerRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterListenerResponse {
    pub code: ResponseCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_current_version() {
        let req = RegisterListenerRequest::new("billing");
        assert_eq!(req.version, VERSION);
        assert_eq!(req.service, "billing");
        assert!(req.metadata.is_empty());
    }

    #[test]
    fn empty_metadata_is_omitted() {
        let json = serde_json::to_value(RegisterListenerRequest::new("billing")).unwrap();
        assert_eq!(json, serde_json::json!({ "version": 1, "service": "billing" }));
    }

    #[test]
    fn request_without_metadata_decodes() {
        let req: RegisterListenerRequest =
            serde_json::from_str(r#"{"version":1,"service":"ns"}"#).unwrap();
        assert!(req.metadata.is_empty());
    }

    #[test]
    fn metadata_is_carried() {
        let mut req = RegisterListenerRequest::new("ns");
        req.metadata
            .insert("Authorization".to_string(), "Bearer abc".to_string());
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["metadata"]["Authorization"], "Bearer abc");
    }

    #[test]
    fn response_decodes_code_ordinal() {
        let resp: RegisterListenerResponse = serde_json::from_str(r#"{"code":3}"#).unwrap();
        assert_eq!(resp.code, ResponseCode::Unauthorized);
    }
}
