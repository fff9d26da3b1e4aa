use thiserror::Error;

/// Errors surfaced by the CDM core.
///
/// Every public entry point returns one of these; no string messages are
/// contractual, only the variant. Variants that carry text do so purely for
/// diagnostics.
#[derive(Debug, Clone, Error)]
pub enum CdmError {
    // ── Input / contract ──────────────────────────────────────────────
    #[error("empty key data")]
    EmptyKeyData,
    #[error("key system not supported: {0}")]
    InvalidKeySystem(String),
    #[error("duplicate session id '{0}'")]
    DuplicateSessionId(String),
    #[error("unsupported init data: {0}")]
    UnsupportedInitData(String),
    #[error("init data absent")]
    InitDataNotFound,
    #[error("unrecognized license type")]
    InvalidLicenseType,
    #[error("unrecognized query key '{0}'")]
    InvalidQueryKey(String),

    // ── Not found ─────────────────────────────────────────────────────
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("key set id '{0}' not found")]
    KeySetIdNotFound(String),
    #[error("key not found in license")]
    KeyNotFound,
    #[error("no usage info for request")]
    UsageInfoNotFound,
    #[error("stored license '{0}' not found")]
    LicenseNotFound(String),

    // ── State ─────────────────────────────────────────────────────────
    #[error("already initialized")]
    Reinit,
    #[error("not initialized")]
    NotInitialized,
    #[error("empty session id")]
    EmptySessionId,
    #[error("empty key set id")]
    EmptyKeySetId,
    #[error("session type prohibits storage")]
    StorageProhibited,
    #[error("license policy prohibits offline storage")]
    OfflineLicenseProhibited,
    #[error("license renewal prohibited")]
    RenewalProhibited,
    #[error("license start time is in the future")]
    DecryptNotReady,
    #[error("insufficient output protection")]
    InsufficientOutputProtection,
    #[error("key needed")]
    NeedKey,
    #[error("key prohibited at this security level")]
    KeyProhibitedForSecurityLevel,
    #[error("offline license has already been released")]
    GetReleasedLicense,
    #[error("privacy mode requires a service certificate")]
    PrivacyMode,

    // ── Crypto & device ───────────────────────────────────────────────
    #[error("nonce generation failed")]
    NonceGeneration,
    #[error("request signature empty")]
    SignatureEmpty,
    #[error("signature verification failed")]
    SignatureMismatch,
    #[error("bad key material size: {0}")]
    KeySize(&'static str),
    #[error("crypto session lost state")]
    SessionLostState,
    #[error("crypto system invalidated")]
    SystemInvalidated,
    #[error("insufficient crypto resources")]
    InsufficientCryptoResources,
    #[error("device needs provisioning")]
    NeedProvisioning,
    #[error("device certificate revoked")]
    DeviceRevoked,
    #[error("device cannot be reprovisioned")]
    DeviceCannotReprovision,
    #[error("crypto engine failure: {0}")]
    CryptoEngine(String),
    #[error("RSA key parse failed: {0}")]
    RsaKeyParse(String),
    #[error("RSA operation failed: {0}")]
    RsaOperation(String),
    #[error("invalid AES-CBC input: {0}")]
    AesCbcInvalidInput(String),
    #[error("invalid PKCS#7 padding")]
    Pkcs7PaddingInvalid,

    // ── Persistence ───────────────────────────────────────────────────
    #[error("stored file hash mismatch")]
    FileHashMismatch,
    #[error("file read failed: {0}")]
    FileRead(String),
    #[error("file write failed: {0}")]
    FileWrite(String),
    #[error("file store base path unavailable")]
    BasePathUnavailable,
    #[error("stored file has wrong type or version")]
    IncorrectFileType,
    #[error("stored file parse failed")]
    FileParse,

    // ── Protocol ──────────────────────────────────────────────────────
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
    #[error("protobuf decode failed: {0}")]
    ProtobufDecode(String),
    #[error("empty license response")]
    EmptyLicenseResponse,
    #[error("unexpected signed message type {0}")]
    InvalidResponseType(i32),
    #[error("license response is not signed")]
    SignatureMissing,
    #[error("no session key in license response")]
    SessionKeysNotFound,
    #[error("no content keys in license response")]
    NoContentKeys,
    #[error("license id not present")]
    LicenseIdNotFound,
    #[error("license server error")]
    KeyError,
    #[error("certificate decode failed: {0}")]
    CertificateDecode(String),
    #[error("provisioning response invalid: {0}")]
    ProvisioningResponse(&'static str),

    // ── Usage table ───────────────────────────────────────────────────
    #[error("new usage entry number out of range")]
    UsageInvalidEntry,
    #[error("usage entry number mismatch")]
    UsageEntryNumberMismatch,
    #[error("no usage entries present")]
    NoUsageEntries,
    #[error("operation unsupported for this usage support type")]
    IncorrectUsageSupportType,
}

impl From<prost::DecodeError> for CdmError {
    fn from(e: prost::DecodeError) -> Self {
        Self::ProtobufDecode(e.to_string())
    }
}

/// Type alias for results that may return a [`CdmError`].
pub type CdmResult<T> = std::result::Result<T, CdmError>;

/// Error returned by `FromStr` implementations on enum types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}
