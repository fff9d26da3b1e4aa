use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use crate::error::ParseError;

/// Opaque per-process session identifier.
pub type SessionId = String;

/// Persistent handle used to look up an offline license or secure stop.
pub type KeySetId = String;

/// Raw key identifier bytes as they appear in licenses and samples.
pub type KeyId = Vec<u8>;

/// Application-supplied parameters echoed into license requests.
/// Ordered so serialized requests are deterministic.
pub type AppParameterMap = BTreeMap<String, String>;

/// String key/value result map for the query entry points.
pub type QueryMap = BTreeMap<&'static str, String>;

/// Per-key status map handed to key-change listeners.
pub type KeyStatusMap = BTreeMap<KeyId, KeyStatus>;

pub const QUERY_KEY_SECURITY_LEVEL: &str = "SecurityLevel";
pub const QUERY_KEY_LICENSE_TYPE: &str = "LicenseType";
pub const QUERY_KEY_PLAY_ALLOWED: &str = "PlayAllowed";
pub const QUERY_KEY_PERSIST_ALLOWED: &str = "PersistAllowed";
pub const QUERY_KEY_RENEW_ALLOWED: &str = "RenewAllowed";
pub const QUERY_KEY_LICENSE_DURATION_REMAINING: &str = "LicenseDurationRemaining";
pub const QUERY_KEY_PLAYBACK_DURATION_REMAINING: &str = "PlaybackDurationRemaining";
pub const QUERY_KEY_RENEWAL_SERVER_URL: &str = "RenewalServerUrl";
pub const QUERY_KEY_OEMCRYPTO_SESSION_ID: &str = "OemCryptoSessionId";

/// Device security level reported by the trusted crypto engine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl SecurityLevel {
    pub const fn from_u8(u: u8) -> Option<Self> {
        match u {
            1 => Some(Self::L1),
            2 => Some(Self::L2),
            3 => Some(Self::L3),
            _ => None,
        }
    }

    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => f.write_str("L1"),
            Self::L2 => f.write_str("L2"),
            Self::L3 => f.write_str("L3"),
        }
    }
}

impl FromStr for SecurityLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "L1" => Ok(Self::L1),
            "L2" => Ok(Self::L2),
            "L3" => Ok(Self::L3),
            _ => Err(ParseError {
                kind: "security level",
                value: s.to_owned(),
            }),
        }
    }
}

/// What the host asked for when opening a TCE session: the device default,
/// or an explicit downgrade to L3.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedSecurityLevel {
    #[default]
    Default,
    Level3,
}

/// License type as requested by the host application.
///
/// `EmbeddedKeyData` is a key-rotation event carried in init data rather
/// than a server round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseType {
    Temporary,
    Streaming,
    Offline,
    Release,
    EmbeddedKeyData,
}

/// Which kind of key hierarchy the loaded license carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseKeyType {
    Content,
    Entitlement,
}

/// What kind of message `generate_key_request` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRequestType {
    Initial,
    Renewal,
    Release,
    /// No outgoing message (e.g. embedded key rotation handled locally).
    None,
}

/// An outgoing license protocol message plus routing metadata.
#[derive(Debug, Clone)]
pub struct KeyRequest {
    pub message: Vec<u8>,
    pub request_type: KeyRequestType,
    pub url: String,
}

/// Outcome of feeding a server response into `add_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddKeyOutcome {
    /// Keys were loaded; decryption may proceed.
    KeysLoaded,
    /// The response was a service certificate; it is now installed and the
    /// caller should regenerate the key request.
    ServiceCertificateLoaded,
}

/// Per-key lifecycle status, as reported through key-change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Usable,
    UsableInFuture,
    Expired,
    OutputNotAllowed,
    InternalError,
    KeyUnknown,
}

/// HDCP levels, ordered weakest to strongest.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HdcpVersion {
    None = 0,
    V1 = 1,
    V2 = 2,
    V2_1 = 3,
    V2_2 = 4,
    V2_3 = 5,
    NoDigitalOutput = 6,
}

/// Media cipher mode selected by the license's protection-scheme four-CC.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    #[default]
    Ctr,
    Cbc,
}

const FOUR_CC_CBC1: u32 = 0x6362_6331;
const FOUR_CC_CBCS: u32 = 0x6362_6373;
const FOUR_CC_CBC1_LE: u32 = 0x3163_6263;
const FOUR_CC_CBCS_LE: u32 = 0x7363_6263;

impl CipherMode {
    /// Map a protection-scheme four-CC to a cipher mode.
    ///
    /// `cbc1`/`cbcs` and their byte-swapped forms select CBC; every other
    /// value, including the default `cenc` and unknown codes, selects CTR.
    pub const fn from_protection_scheme(four_cc: u32) -> Self {
        match four_cc {
            FOUR_CC_CBC1 | FOUR_CC_CBCS | FOUR_CC_CBC1_LE | FOUR_CC_CBCS_LE => Self::Cbc,
            _ => Self::Ctr,
        }
    }
}

/// Security class a content key demands of the pipeline that handles it.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySecurityClass {
    SwSecureCrypto,
    SwSecureDecode,
    HwSecureCrypto,
    HwSecureDecode,
    HwSecureAll,
    #[default]
    Unset,
}

/// Usage permitted for a key, as granted by the license.
///
/// Content keys populate the decrypt fields and `security_class`; operator
/// session keys populate the generic-operation fields.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAllowedUsage {
    pub decrypt_to_secure_buffer: bool,
    pub decrypt_to_clear_buffer: bool,
    pub generic_encrypt: bool,
    pub generic_decrypt: bool,
    pub generic_sign: bool,
    pub generic_verify: bool,
    pub security_class: KeySecurityClass,
}

/// How the trusted crypto engine tracks usage records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSupportType {
    NonSecure,
    LegacyTable,
    Entry,
}

/// State of a persisted offline license.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineLicenseState {
    #[default]
    Active,
    Releasing,
    Unknown,
}

/// Token the device presents when it has not yet been provisioned with a
/// DRM certificate, or the certificate itself afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTokenType {
    Keybox,
    OemCert,
    DrmCert,
}

/// Certificate flavor requested during provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateType {
    WidevineDrm,
    X509,
}

/// HLS encryption method from an EXT-X-KEY attribute list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlsMethod {
    None,
    Aes128,
    SampleAes,
}

/// Signing/verification algorithms for the generic crypto operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    HmacSha256,
}

/// Encryption algorithms for the generic crypto operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    AesCbc128NoPadding,
}

pub const SUBSAMPLE_IS_FIRST: u32 = 1;
pub const SUBSAMPLE_IS_LAST: u32 = 2;

/// One subsample handed to `decrypt`.
#[derive(Debug, Clone, Copy)]
pub struct DecryptParams<'a> {
    pub is_encrypted: bool,
    /// Destination is a secure buffer the host cannot read.
    pub is_secure: bool,
    pub cipher_mode: CipherMode,
    pub key_id: &'a [u8],
    pub iv: &'a [u8],
    pub input: &'a [u8],
    /// Offset into the current crypto block for CTR pattern continuation.
    pub block_offset: usize,
    pub subsample_flags: u32,
}

/// Key material extracted from a license, destined for the TCE `load_keys`
/// primitive. Key data stays wrapped; only the TCE can unwrap it.
#[derive(Default, Debug, Clone)]
pub struct CryptoKey {
    pub key_id: Vec<u8>,
    pub key_data: Vec<u8>,
    pub key_data_iv: Vec<u8>,
    pub key_control: Vec<u8>,
    pub key_control_iv: Vec<u8>,
    pub entitlement_key_id: Vec<u8>,
    pub track_label: String,
    pub cipher_mode: CipherMode,
}

/// Validity of usage durations returned by a TCE usage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDurationStatus {
    Invalid,
    Valid,
    PlaybackNotBegun,
}

/// A usage report plus its playback timing, from `generate_usage_report`.
#[derive(Debug, Clone)]
pub struct UsageReport {
    pub report: Vec<u8>,
    pub duration_status: UsageDurationStatus,
    pub seconds_since_started: i64,
    pub seconds_since_last_played: i64,
}
