use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{RequestedSecurityLevel, SessionId};

/// Per-session properties supplied by the host when opening a session.
#[derive(Default, Debug, Clone)]
pub struct ClientPropertySet {
    pub security_level: RequestedSecurityLevel,
    pub use_privacy_mode: bool,
    /// Serialized SignedDrmCertificate, or empty to negotiate one from the
    /// server when privacy mode is on.
    pub service_certificate: Vec<u8>,
    pub app_id: String,
    pub session_sharing_enabled: bool,
}

/// Host-wide configuration. Constructed explicitly by the embedder and
/// handed to the engine; there is no global fallback.
#[derive(Debug, Clone)]
pub struct HostProperties {
    /// Sessions are identified by their key set id instead of a counter id.
    pub always_use_key_set_ids: bool,
    /// Privacy mode without a certificate may fetch one from the server.
    pub allow_service_certificate_requests: bool,
    /// Provisioning messages are raw bytes rather than web-safe base64 in a
    /// JSON wrapper.
    pub provisioning_messages_are_binary: bool,
    /// Provisioning requests identify the origin by the service
    /// certificate's provider id rather than the legacy stable id.
    pub use_provider_id_in_provisioning_request: bool,
}

impl Default for HostProperties {
    fn default() -> Self {
        HostProperties {
            always_use_key_set_ids: false,
            allow_service_certificate_requests: true,
            provisioning_messages_are_binary: false,
            use_provider_id_in_provisioning_request: true,
        }
    }
}

/// Engine-owned registry binding session ids to their property sets.
pub struct PropertyRegistry {
    host: HostProperties,
    sessions: Mutex<HashMap<SessionId, ClientPropertySet>>,
}

impl PropertyRegistry {
    pub fn new(host: HostProperties) -> Self {
        PropertyRegistry {
            host,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &HostProperties {
        &self.host
    }

    pub fn register(&self, session_id: &str, properties: ClientPropertySet) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_owned(), properties);
    }

    pub fn unregister(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    pub fn use_privacy_mode(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .is_some_and(|p| p.use_privacy_mode)
    }

    pub fn service_certificate(&self, session_id: &str) -> Vec<u8> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|p| p.service_certificate.clone())
            .unwrap_or_default()
    }

    pub fn app_id(&self, session_id: &str) -> String {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|p| p.app_id.clone())
            .unwrap_or_default()
    }
}
