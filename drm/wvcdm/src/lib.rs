//! Widevine CDM core: session management, license protocol, policy
//! enforcement, usage accounting and provisioning, over a trusted crypto
//! engine and a blob store supplied by the embedder.

mod client_identification;
mod clock;
mod constants;
mod crypto;
mod device_files;
mod engine;
mod error;
mod events;
mod file_store;
mod init_data;
mod key_status;
mod license;
mod metrics;
mod policy;
mod properties;
mod provisioning;
mod service_certificate;
mod session;
mod session_map;
mod tce;
mod types;
mod usage_table;

#[cfg(test)]
pub(crate) mod testutil;

pub use self::clock::{SystemClock, WallClock};
pub use self::constants::WIDEVINE_SYSTEM_ID;
pub use self::device_files::{
    DeviceFiles, LicenseRecord, ReservedKeySetIds, UsageEntryInfo, UsageEntryStorageType,
    UsageRecord,
};
pub use self::engine::{AddKeyResult, CdmEngine, EngineConfig};
pub use self::error::{CdmError, CdmResult, ParseError};
pub use self::events::{EventListener, NullEventListener};
pub use self::file_store::{FileStore, FileSystemStore, MemoryStore};
pub use self::init_data::InitData;
pub use self::metrics::{ContentDecryptionModule, EngineMetrics, MetricsDecorator};
pub use self::properties::{ClientPropertySet, HostProperties};
pub use self::service_certificate::ServiceCertificate;
pub use self::tce::{
    AnalogOutputCapabilities, CryptoSession, SupportedCertificateTypes, TceLocks, TceSession,
    TrustedCryptoEngine,
};
pub use self::types::{
    AddKeyOutcome, AppParameterMap, CertificateType, CipherMode, ClientTokenType, CryptoKey,
    DecryptParams, EncryptionAlgorithm, HdcpVersion, HlsMethod, KeyAllowedUsage, KeyId,
    KeyRequest, KeyRequestType, KeySecurityClass, KeySetId, KeyStatus, KeyStatusMap,
    LicenseKeyType, LicenseType, OfflineLicenseState, QueryMap, RequestedSecurityLevel,
    SecurityLevel, SessionId, SigningAlgorithm, UsageDurationStatus, UsageReport,
    UsageSupportType, QUERY_KEY_LICENSE_DURATION_REMAINING, QUERY_KEY_LICENSE_TYPE,
    QUERY_KEY_OEMCRYPTO_SESSION_ID, QUERY_KEY_PERSIST_ALLOWED,
    QUERY_KEY_PLAYBACK_DURATION_REMAINING, QUERY_KEY_PLAY_ALLOWED,
    QUERY_KEY_RENEWAL_SERVER_URL, QUERY_KEY_RENEW_ALLOWED, QUERY_KEY_SECURITY_LEVEL,
    SUBSAMPLE_IS_FIRST, SUBSAMPLE_IS_LAST,
};
pub use self::usage_table::UsageTableHeader;
