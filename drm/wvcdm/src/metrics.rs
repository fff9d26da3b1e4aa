//! Observational metrics: counts, error counts and latencies recorded
//! alongside outward API calls. Strictly read-only with respect to engine
//! behavior; nothing here affects return values.
//!
//! The engine's contract is exposed as the [`ContentDecryptionModule`]
//! operation set; [`MetricsDecorator`] is one implementation of it that
//! measures and delegates to another.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::engine::{AddKeyResult, CdmEngine};
use crate::error::CdmResult;
use crate::events::EventListener;
use crate::init_data::InitData;
use crate::properties::ClientPropertySet;
use crate::types::{
    AppParameterMap, CertificateType, DecryptParams, KeyRequest, LicenseType, SessionId,
};

/// Aggregate for one operation.
#[derive(Default, Debug, Clone, Copy)]
pub struct OperationMetrics {
    pub calls: u64,
    pub errors: u64,
    pub total_micros: u64,
}

/// Engine-wide metric sink.
#[derive(Default)]
pub struct EngineMetrics {
    operations: Mutex<BTreeMap<&'static str, OperationMetrics>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &'static str, is_ok: bool, elapsed_micros: u64) {
        let mut operations = self.operations.lock().unwrap();
        let entry = operations.entry(operation).or_default();
        entry.calls += 1;
        if !is_ok {
            entry.errors += 1;
        }
        entry.total_micros += elapsed_micros;
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, OperationMetrics> {
        self.operations.lock().unwrap().clone()
    }
}

/// The outward operation set of a CDM engine, abstracted so that
/// cross-cutting wrappers can interpose without inheriting from the
/// concrete engine.
pub trait ContentDecryptionModule {
    fn open_session(
        &self,
        key_system: &str,
        property_set: &ClientPropertySet,
        event_listener: Option<std::sync::Arc<dyn EventListener>>,
    ) -> CdmResult<SessionId>;
    fn close_session(&self, session_id: &str) -> CdmResult<()>;
    fn generate_key_request(
        &self,
        session_id: &str,
        key_set_id: &str,
        init_data: &InitData,
        license_type: LicenseType,
        app_parameters: &AppParameterMap,
    ) -> CdmResult<KeyRequest>;
    fn add_key(
        &self,
        session_id: &str,
        key_data: &[u8],
        key_set_id: &str,
    ) -> CdmResult<AddKeyResult>;
    fn restore_key(&self, session_id: &str, key_set_id: &str) -> CdmResult<()>;
    fn generate_renewal_request(&self, session_id: &str) -> CdmResult<KeyRequest>;
    fn renew_key(&self, session_id: &str, key_data: &[u8]) -> CdmResult<()>;
    fn decrypt(&self, session_id: &str, params: &DecryptParams) -> CdmResult<Vec<u8>>;
    fn get_provisioning_request(
        &self,
        cert_type: CertificateType,
        cert_authority: &str,
        service_certificate: &[u8],
    ) -> CdmResult<(Vec<u8>, String)>;
    fn handle_provisioning_response(&self, response: &[u8]) -> CdmResult<(Vec<u8>, Vec<u8>)>;
    fn on_timer_event(&self);
}

impl ContentDecryptionModule for CdmEngine {
    fn open_session(
        &self,
        key_system: &str,
        property_set: &ClientPropertySet,
        event_listener: Option<std::sync::Arc<dyn EventListener>>,
    ) -> CdmResult<SessionId> {
        CdmEngine::open_session(self, key_system, property_set, event_listener)
    }

    fn close_session(&self, session_id: &str) -> CdmResult<()> {
        CdmEngine::close_session(self, session_id)
    }

    fn generate_key_request(
        &self,
        session_id: &str,
        key_set_id: &str,
        init_data: &InitData,
        license_type: LicenseType,
        app_parameters: &AppParameterMap,
    ) -> CdmResult<KeyRequest> {
        CdmEngine::generate_key_request(
            self,
            session_id,
            key_set_id,
            init_data,
            license_type,
            app_parameters,
        )
    }

    fn add_key(
        &self,
        session_id: &str,
        key_data: &[u8],
        key_set_id: &str,
    ) -> CdmResult<AddKeyResult> {
        CdmEngine::add_key(self, session_id, key_data, key_set_id)
    }

    fn restore_key(&self, session_id: &str, key_set_id: &str) -> CdmResult<()> {
        CdmEngine::restore_key(self, session_id, key_set_id)
    }

    fn generate_renewal_request(&self, session_id: &str) -> CdmResult<KeyRequest> {
        CdmEngine::generate_renewal_request(self, session_id)
    }

    fn renew_key(&self, session_id: &str, key_data: &[u8]) -> CdmResult<()> {
        CdmEngine::renew_key(self, session_id, key_data)
    }

    fn decrypt(&self, session_id: &str, params: &DecryptParams) -> CdmResult<Vec<u8>> {
        CdmEngine::decrypt(self, session_id, params)
    }

    fn get_provisioning_request(
        &self,
        cert_type: CertificateType,
        cert_authority: &str,
        service_certificate: &[u8],
    ) -> CdmResult<(Vec<u8>, String)> {
        CdmEngine::get_provisioning_request(self, cert_type, cert_authority, service_certificate)
    }

    fn handle_provisioning_response(&self, response: &[u8]) -> CdmResult<(Vec<u8>, Vec<u8>)> {
        CdmEngine::handle_provisioning_response(self, response)
    }

    fn on_timer_event(&self) {
        CdmEngine::on_timer_event(self)
    }
}

/// Wraps any [`ContentDecryptionModule`], measuring each call before
/// delegating.
pub struct MetricsDecorator<C> {
    inner: C,
    metrics: EngineMetrics,
}

impl<C: ContentDecryptionModule> MetricsDecorator<C> {
    pub fn new(inner: C) -> Self {
        MetricsDecorator {
            inner,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn measure<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&C) -> CdmResult<T>,
    ) -> CdmResult<T> {
        let started = Instant::now();
        let result = f(&self.inner);
        self.metrics.record(
            operation,
            result.is_ok(),
            started.elapsed().as_micros() as u64,
        );
        result
    }
}

impl<C: ContentDecryptionModule> ContentDecryptionModule for MetricsDecorator<C> {
    fn open_session(
        &self,
        key_system: &str,
        property_set: &ClientPropertySet,
        event_listener: Option<std::sync::Arc<dyn EventListener>>,
    ) -> CdmResult<SessionId> {
        self.measure("open_session", |c| {
            c.open_session(key_system, property_set, event_listener)
        })
    }

    fn close_session(&self, session_id: &str) -> CdmResult<()> {
        self.measure("close_session", |c| c.close_session(session_id))
    }

    fn generate_key_request(
        &self,
        session_id: &str,
        key_set_id: &str,
        init_data: &InitData,
        license_type: LicenseType,
        app_parameters: &AppParameterMap,
    ) -> CdmResult<KeyRequest> {
        self.measure("generate_key_request", |c| {
            c.generate_key_request(session_id, key_set_id, init_data, license_type, app_parameters)
        })
    }

    fn add_key(
        &self,
        session_id: &str,
        key_data: &[u8],
        key_set_id: &str,
    ) -> CdmResult<AddKeyResult> {
        self.measure("add_key", |c| c.add_key(session_id, key_data, key_set_id))
    }

    fn restore_key(&self, session_id: &str, key_set_id: &str) -> CdmResult<()> {
        self.measure("restore_key", |c| c.restore_key(session_id, key_set_id))
    }

    fn generate_renewal_request(&self, session_id: &str) -> CdmResult<KeyRequest> {
        self.measure("generate_renewal_request", |c| {
            c.generate_renewal_request(session_id)
        })
    }

    fn renew_key(&self, session_id: &str, key_data: &[u8]) -> CdmResult<()> {
        self.measure("renew_key", |c| c.renew_key(session_id, key_data))
    }

    fn decrypt(&self, session_id: &str, params: &DecryptParams) -> CdmResult<Vec<u8>> {
        self.measure("decrypt", |c| c.decrypt(session_id, params))
    }

    fn get_provisioning_request(
        &self,
        cert_type: CertificateType,
        cert_authority: &str,
        service_certificate: &[u8],
    ) -> CdmResult<(Vec<u8>, String)> {
        self.measure("get_provisioning_request", |c| {
            c.get_provisioning_request(cert_type, cert_authority, service_certificate)
        })
    }

    fn handle_provisioning_response(&self, response: &[u8]) -> CdmResult<(Vec<u8>, Vec<u8>)> {
        self.measure("handle_provisioning_response", |c| {
            c.handle_provisioning_response(response)
        })
    }

    fn on_timer_event(&self) {
        let started = Instant::now();
        self.inner.on_timer_event();
        self.metrics
            .record("on_timer_event", true, started.elapsed().as_micros() as u64);
    }
}
