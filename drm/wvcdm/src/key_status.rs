use std::collections::BTreeMap;

use wvcdm_proto::license::KeyContainer;
use wvcdm_proto::license::key_container::output_protection::Hdcp as ProtoHdcp;
use wvcdm_proto::license::key_container::{
    KeyType as ProtoKeyType, SecurityLevel as ProtoKeyLevel,
};
use wvcdm_proto::widevine_pssh_data::EntitledKey;

use crate::types::{
    HdcpVersion, KeyAllowedUsage, KeyId, KeySecurityClass, KeyStatus, KeyStatusMap, SecurityLevel,
};

/// Resolution meaning "not reported"; constraint bands are not applied then.
pub const UNSPECIFIED_VIDEO_RESOLUTION: u32 = 0;

fn proto_hdcp_to_hdcp(input: ProtoHdcp) -> HdcpVersion {
    match input {
        ProtoHdcp::None => HdcpVersion::None,
        ProtoHdcp::V1 => HdcpVersion::V1,
        ProtoHdcp::V2 => HdcpVersion::V2,
        ProtoHdcp::V21 => HdcpVersion::V2_1,
        ProtoHdcp::V22 => HdcpVersion::V2_2,
        ProtoHdcp::V23 => HdcpVersion::V2_3,
        ProtoHdcp::NoDigitalOutput => HdcpVersion::NoDigitalOutput,
    }
}

#[derive(Debug, Clone)]
struct ResolutionConstraint {
    min_pixels: u32,
    max_pixels: u32,
    required_hdcp: Option<HdcpVersion>,
}

/// Tracked state for one key delivered by the license.
#[derive(Debug, Clone)]
pub struct LicenseKeyStatus {
    is_content_key: bool,
    status: KeyStatus,
    meets_constraints: bool,
    meets_security_level_constraints: bool,
    allowed_usage: KeyAllowedUsage,
    constraints: Vec<ResolutionConstraint>,
    default_hdcp: HdcpVersion,
}

impl LicenseKeyStatus {
    fn from_container(key: &KeyContainer, security_level: SecurityLevel) -> Self {
        let mut status = LicenseKeyStatus {
            is_content_key: false,
            status: KeyStatus::InternalError,
            meets_constraints: true,
            meets_security_level_constraints: true,
            allowed_usage: KeyAllowedUsage::default(),
            constraints: Vec::new(),
            default_hdcp: HdcpVersion::None,
        };

        match key.r#type.and_then(|t| ProtoKeyType::try_from(t).ok()) {
            Some(ProtoKeyType::Content) | Some(ProtoKeyType::Entitlement) => {
                status.parse_content_key(key, security_level);
            }
            Some(ProtoKeyType::OperatorSession) => status.parse_operator_session_key(key),
            _ => {}
        }
        status
    }

    fn parse_content_key(&mut self, key: &KeyContainer, security_level: SecurityLevel) {
        self.is_content_key = true;

        let level = key.level.and_then(|l| ProtoKeyLevel::try_from(l).ok());
        match level {
            Some(ProtoKeyLevel::HwSecureDecode) | Some(ProtoKeyLevel::HwSecureAll) => {
                self.allowed_usage.decrypt_to_clear_buffer = false;
                self.allowed_usage.decrypt_to_secure_buffer = true;
            }
            _ => {
                self.allowed_usage.decrypt_to_clear_buffer = true;
                self.allowed_usage.decrypt_to_secure_buffer = true;
            }
        }

        match level {
            Some(level) => {
                self.allowed_usage.security_class = match level {
                    ProtoKeyLevel::SwSecureCrypto => KeySecurityClass::SwSecureCrypto,
                    ProtoKeyLevel::SwSecureDecode => KeySecurityClass::SwSecureDecode,
                    ProtoKeyLevel::HwSecureCrypto => KeySecurityClass::HwSecureCrypto,
                    ProtoKeyLevel::HwSecureDecode => KeySecurityClass::HwSecureDecode,
                    ProtoKeyLevel::HwSecureAll => KeySecurityClass::HwSecureAll,
                };
                self.meets_security_level_constraints = match security_level {
                    SecurityLevel::L1 => true,
                    SecurityLevel::L2 => matches!(
                        level,
                        ProtoKeyLevel::SwSecureCrypto
                            | ProtoKeyLevel::SwSecureDecode
                            | ProtoKeyLevel::HwSecureCrypto
                    ),
                    SecurityLevel::L3 => matches!(
                        level,
                        ProtoKeyLevel::SwSecureCrypto | ProtoKeyLevel::SwSecureDecode
                    ),
                };
            }
            None => {
                self.allowed_usage.security_class = KeySecurityClass::Unset;
                self.meets_security_level_constraints = true;
            }
        }

        for constraint in &key.video_resolution_constraints {
            if let (Some(min), Some(max)) =
                (constraint.min_resolution_pixels, constraint.max_resolution_pixels)
            {
                self.constraints.push(ResolutionConstraint {
                    min_pixels: min,
                    max_pixels: max,
                    required_hdcp: constraint
                        .required_protection
                        .as_ref()
                        .and_then(|p| p.hdcp)
                        .and_then(|h| ProtoHdcp::try_from(h).ok())
                        .map(proto_hdcp_to_hdcp),
                });
            }
        }

        if let Some(protection) = &key.required_protection
            && let Some(hdcp) = protection.hdcp.and_then(|h| ProtoHdcp::try_from(h).ok())
        {
            self.default_hdcp = proto_hdcp_to_hdcp(hdcp);
        }
    }

    fn parse_operator_session_key(&mut self, key: &KeyContainer) {
        self.is_content_key = false;
        if let Some(permissions) = &key.operator_session_key_permissions {
            self.allowed_usage.generic_encrypt = permissions.allow_encrypt.unwrap_or(false);
            self.allowed_usage.generic_decrypt = permissions.allow_decrypt.unwrap_or(false);
            self.allowed_usage.generic_sign = permissions.allow_sign.unwrap_or(false);
            self.allowed_usage.generic_verify =
                permissions.allow_signature_verify.unwrap_or(false);
        }
    }

    pub fn is_content_key(&self) -> bool {
        self.is_content_key
    }

    pub fn key_status(&self) -> KeyStatus {
        self.status
    }

    pub fn can_decrypt_content(&self) -> bool {
        self.is_content_key && self.status == KeyStatus::Usable
    }

    pub fn allowed_usage(&self) -> KeyAllowedUsage {
        self.allowed_usage
    }

    pub fn meets_constraints(&self) -> bool {
        self.meets_constraints
    }

    pub fn meets_security_level_constraints(&self) -> bool {
        self.meets_security_level_constraints
    }

    /// Set the key's status, overriding `Usable` to `OutputNotAllowed` when
    /// device constraints are not met. Returns (changed, newly usable).
    pub fn apply_status_change(&mut self, new_status: KeyStatus) -> (bool, bool) {
        if !self.is_content_key {
            return (false, false);
        }
        let mut updated = new_status;
        if updated == KeyStatus::Usable
            && (!self.meets_constraints || !self.meets_security_level_constraints)
        {
            updated = KeyStatus::OutputNotAllowed;
        }
        if self.status != updated {
            self.status = updated;
            (true, updated == KeyStatus::Usable)
        } else {
            (false, false)
        }
    }

    /// Re-evaluate constraint bands against the device's current resolution
    /// and HDCP level.
    ///
    /// If the key has bands and the resolution is known, the band containing
    /// the resolution applies; no matching band fails the test outright. The
    /// applicable HDCP floor is the band's, or the key's default when the
    /// band (or key) has none.
    pub fn apply_constraints(&mut self, video_pixels: u32, device_hdcp: HdcpVersion) {
        let mut current: Option<&ResolutionConstraint> = None;
        if !self.constraints.is_empty() && video_pixels != UNSPECIFIED_VIDEO_RESOLUTION {
            current = self
                .constraints
                .iter()
                .find(|c| video_pixels >= c.min_pixels && video_pixels <= c.max_pixels);
            if current.is_none() {
                self.meets_constraints = false;
                return;
            }
        }

        let desired = current
            .and_then(|c| c.required_hdcp)
            .unwrap_or(self.default_hdcp);
        self.meets_constraints = device_hdcp >= desired;
    }
}

/// All keys of one session's license, plus the entitlement-key lookthrough
/// map for two-level key hierarchies.
pub struct LicenseKeys {
    security_level: SecurityLevel,
    statuses: BTreeMap<KeyId, LicenseKeyStatus>,
    content_to_entitlement: BTreeMap<KeyId, KeyId>,
}

impl LicenseKeys {
    pub fn new(security_level: SecurityLevel) -> Self {
        LicenseKeys {
            security_level,
            statuses: BTreeMap::new(),
            content_to_entitlement: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn clear(&mut self) {
        self.statuses.clear();
        self.content_to_entitlement.clear();
    }

    /// Rebuild from a parsed license, keeping content, entitlement, and
    /// operator-session containers.
    pub fn set_from_license(&mut self, license: &wvcdm_proto::License) {
        self.clear();
        for key in &license.key {
            let Some(id) = key.id.as_ref() else { continue };
            let keeps = matches!(
                key.r#type.and_then(|t| ProtoKeyType::try_from(t).ok()),
                Some(ProtoKeyType::Content)
                    | Some(ProtoKeyType::OperatorSession)
                    | Some(ProtoKeyType::Entitlement)
            );
            if keeps {
                self.statuses
                    .insert(id.clone(), LicenseKeyStatus::from_container(key, self.security_level));
            }
        }
    }

    /// Record content-key → entitlement-key mappings for wrapped keys whose
    /// entitlement key is present in this license.
    pub fn set_entitled_keys(&mut self, wrapped_keys: &[EntitledKey]) {
        for wrapped in wrapped_keys {
            let Some(entitlement_id) = wrapped.entitlement_key_id.as_ref() else {
                continue;
            };
            if !self.statuses.contains_key(entitlement_id) {
                continue;
            }
            if let Some(content_id) = wrapped.key_id.as_ref() {
                self.content_to_entitlement
                    .insert(content_id.clone(), entitlement_id.clone());
            }
        }
    }

    fn resolve(&self, key_id: &[u8]) -> Option<&LicenseKeyStatus> {
        if let Some(status) = self.statuses.get(key_id) {
            return Some(status);
        }
        self.content_to_entitlement
            .get(key_id)
            .and_then(|entitlement_id| self.statuses.get(entitlement_id))
    }

    pub fn is_content_key(&self, key_id: &[u8]) -> bool {
        if let Some(status) = self.statuses.get(key_id) {
            status.is_content_key()
        } else {
            self.content_to_entitlement.contains_key(key_id)
        }
    }

    pub fn can_decrypt_content(&self, key_id: &[u8]) -> bool {
        self.resolve(key_id)
            .map(LicenseKeyStatus::can_decrypt_content)
            .unwrap_or(false)
    }

    pub fn key_status(&self, key_id: &[u8]) -> KeyStatus {
        self.statuses
            .get(key_id)
            .map(LicenseKeyStatus::key_status)
            .unwrap_or(KeyStatus::KeyUnknown)
    }

    pub fn allowed_usage(&self, key_id: &[u8]) -> Option<KeyAllowedUsage> {
        self.resolve(key_id).map(LicenseKeyStatus::allowed_usage)
    }

    /// Unknown keys never block decryption on constraints.
    pub fn meets_constraints(&self, key_id: &[u8]) -> bool {
        self.statuses
            .get(key_id)
            .map(LicenseKeyStatus::meets_constraints)
            .unwrap_or(true)
    }

    pub fn meets_security_level_constraints(&self, key_id: &[u8]) -> bool {
        self.statuses
            .get(key_id)
            .map(LicenseKeyStatus::meets_security_level_constraints)
            .unwrap_or(true)
    }

    /// Apply a status to every content key. Returns (any changed, any
    /// newly usable).
    pub fn apply_status_change(&mut self, new_status: KeyStatus) -> (bool, bool) {
        let mut changed = false;
        let mut newly_usable = false;
        for status in self.statuses.values_mut() {
            let (key_changed, key_usable) = status.apply_status_change(new_status);
            changed |= key_changed;
            newly_usable |= key_usable;
        }
        (changed, newly_usable)
    }

    pub fn apply_constraints(&mut self, resolution_pixels: u32, device_hdcp: HdcpVersion) {
        for status in self.statuses.values_mut() {
            status.apply_constraints(resolution_pixels, device_hdcp);
        }
    }

    /// Statuses of content keys only, for key-change events.
    pub fn extract_key_statuses(&self) -> KeyStatusMap {
        self.statuses
            .iter()
            .filter(|(_, s)| s.is_content_key())
            .map(|(id, s)| (id.clone(), s.key_status()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wvcdm_proto::License;
    use wvcdm_proto::license::key_container::{
        OperatorSessionKeyPermissions, OutputProtection, VideoResolutionConstraint,
    };

    fn content_key(id: &[u8], level: Option<ProtoKeyLevel>) -> KeyContainer {
        KeyContainer {
            id: Some(id.to_vec()),
            r#type: Some(ProtoKeyType::Content as i32),
            level: level.map(|l| l as i32),
            ..Default::default()
        }
    }

    fn license_with_keys(keys: Vec<KeyContainer>) -> License {
        License {
            key: keys,
            ..Default::default()
        }
    }

    #[test]
    fn security_class_matrix() {
        let classes = [
            ProtoKeyLevel::SwSecureCrypto,
            ProtoKeyLevel::SwSecureDecode,
            ProtoKeyLevel::HwSecureCrypto,
            ProtoKeyLevel::HwSecureDecode,
            ProtoKeyLevel::HwSecureAll,
        ];
        let admissible = |session: SecurityLevel, class: ProtoKeyLevel| {
            let mut keys = LicenseKeys::new(session);
            keys.set_from_license(&license_with_keys(vec![content_key(b"k", Some(class))]));
            keys.meets_security_level_constraints(b"k")
        };

        for class in classes {
            assert!(admissible(SecurityLevel::L1, class), "L1 admits {class:?}");
        }
        assert!(admissible(SecurityLevel::L2, ProtoKeyLevel::SwSecureCrypto));
        assert!(admissible(SecurityLevel::L2, ProtoKeyLevel::SwSecureDecode));
        assert!(admissible(SecurityLevel::L2, ProtoKeyLevel::HwSecureCrypto));
        assert!(!admissible(SecurityLevel::L2, ProtoKeyLevel::HwSecureDecode));
        assert!(!admissible(SecurityLevel::L2, ProtoKeyLevel::HwSecureAll));
        assert!(admissible(SecurityLevel::L3, ProtoKeyLevel::SwSecureCrypto));
        assert!(admissible(SecurityLevel::L3, ProtoKeyLevel::SwSecureDecode));
        assert!(!admissible(SecurityLevel::L3, ProtoKeyLevel::HwSecureCrypto));
        assert!(!admissible(SecurityLevel::L3, ProtoKeyLevel::HwSecureDecode));
        assert!(!admissible(SecurityLevel::L3, ProtoKeyLevel::HwSecureAll));
    }

    #[test]
    fn unset_class_is_always_admissible() {
        for session in [SecurityLevel::L1, SecurityLevel::L2, SecurityLevel::L3] {
            let mut keys = LicenseKeys::new(session);
            keys.set_from_license(&license_with_keys(vec![content_key(b"k", None)]));
            assert!(keys.meets_security_level_constraints(b"k"));
            assert_eq!(
                keys.allowed_usage(b"k").unwrap().security_class,
                KeySecurityClass::Unset
            );
        }
    }

    #[test]
    fn hw_decode_keys_forbid_clear_buffers() {
        let mut keys = LicenseKeys::new(SecurityLevel::L1);
        keys.set_from_license(&license_with_keys(vec![
            content_key(b"hw", Some(ProtoKeyLevel::HwSecureAll)),
            content_key(b"sw", Some(ProtoKeyLevel::SwSecureCrypto)),
        ]));
        let hw = keys.allowed_usage(b"hw").unwrap();
        assert!(hw.decrypt_to_secure_buffer && !hw.decrypt_to_clear_buffer);
        let sw = keys.allowed_usage(b"sw").unwrap();
        assert!(sw.decrypt_to_secure_buffer && sw.decrypt_to_clear_buffer);
    }

    #[test]
    fn status_change_reports_transitions_once() {
        let mut keys = LicenseKeys::new(SecurityLevel::L1);
        keys.set_from_license(&license_with_keys(vec![content_key(b"k", None)]));

        let (changed, usable) = keys.apply_status_change(KeyStatus::Usable);
        assert!(changed && usable);
        assert!(keys.can_decrypt_content(b"k"));

        // Same status again: no change.
        let (changed, usable) = keys.apply_status_change(KeyStatus::Usable);
        assert!(!changed && !usable);

        let (changed, usable) = keys.apply_status_change(KeyStatus::Expired);
        assert!(changed && !usable);
        assert!(!keys.can_decrypt_content(b"k"));
    }

    #[test]
    fn constraint_band_selection() {
        let band = |min: u32, max: u32, hdcp: Option<ProtoHdcp>| VideoResolutionConstraint {
            min_resolution_pixels: Some(min),
            max_resolution_pixels: Some(max),
            required_protection: hdcp.map(|h| OutputProtection {
                hdcp: Some(h as i32),
                ..Default::default()
            }),
        };
        let mut key = content_key(b"k", None);
        key.required_protection = Some(OutputProtection {
            hdcp: Some(ProtoHdcp::V1 as i32),
            ..Default::default()
        });
        key.video_resolution_constraints = vec![
            band(0, 409_920, None),                          // SD: key default (V1)
            band(409_921, 2_073_600, Some(ProtoHdcp::V2)), // HD: V2
        ];
        let mut keys = LicenseKeys::new(SecurityLevel::L1);
        keys.set_from_license(&license_with_keys(vec![key]));

        // SD at device V1: band has no HDCP, default floor V1 applies.
        keys.apply_constraints(640 * 480, HdcpVersion::V1);
        assert!(keys.meets_constraints(b"k"));

        // HD at device V1: band floor V2 not met.
        keys.apply_constraints(1920 * 1080, HdcpVersion::V1);
        assert!(!keys.meets_constraints(b"k"));
        keys.apply_constraints(1920 * 1080, HdcpVersion::V2_2);
        assert!(keys.meets_constraints(b"k"));

        // 4K: no band covers it at all.
        keys.apply_constraints(3840 * 2160, HdcpVersion::NoDigitalOutput);
        assert!(!keys.meets_constraints(b"k"));

        // Unknown resolution: bands are skipped, default floor applies.
        keys.apply_constraints(UNSPECIFIED_VIDEO_RESOLUTION, HdcpVersion::V1);
        assert!(keys.meets_constraints(b"k"));
        keys.apply_constraints(UNSPECIFIED_VIDEO_RESOLUTION, HdcpVersion::None);
        assert!(!keys.meets_constraints(b"k"));
    }

    #[test]
    fn unmet_constraints_override_usable() {
        let mut key = content_key(b"k", None);
        key.required_protection = Some(OutputProtection {
            hdcp: Some(ProtoHdcp::V2 as i32),
            ..Default::default()
        });
        let mut keys = LicenseKeys::new(SecurityLevel::L1);
        keys.set_from_license(&license_with_keys(vec![key]));

        keys.apply_constraints(UNSPECIFIED_VIDEO_RESOLUTION, HdcpVersion::None);
        keys.apply_status_change(KeyStatus::Usable);
        assert_eq!(keys.key_status(b"k"), KeyStatus::OutputNotAllowed);
        assert!(!keys.can_decrypt_content(b"k"));
    }

    #[test]
    fn entitlement_lookthrough() {
        let entitlement = KeyContainer {
            id: Some(b"ent".to_vec()),
            r#type: Some(ProtoKeyType::Entitlement as i32),
            ..Default::default()
        };
        let mut keys = LicenseKeys::new(SecurityLevel::L1);
        keys.set_from_license(&license_with_keys(vec![entitlement]));
        keys.apply_status_change(KeyStatus::Usable);

        keys.set_entitled_keys(&[
            EntitledKey {
                entitlement_key_id: Some(b"ent".to_vec()),
                key_id: Some(b"content".to_vec()),
                ..Default::default()
            },
            // Unknown entitlement id: ignored.
            EntitledKey {
                entitlement_key_id: Some(b"nope".to_vec()),
                key_id: Some(b"orphan".to_vec()),
                ..Default::default()
            },
        ]);

        assert!(keys.is_content_key(b"content"));
        assert!(keys.can_decrypt_content(b"content"));
        assert!(!keys.can_decrypt_content(b"orphan"));
        assert!(keys.allowed_usage(b"content").is_some());
    }

    #[test]
    fn operator_session_keys_are_not_content_keys() {
        let operator = KeyContainer {
            id: Some(b"op".to_vec()),
            r#type: Some(ProtoKeyType::OperatorSession as i32),
            operator_session_key_permissions: Some(OperatorSessionKeyPermissions {
                allow_sign: Some(true),
                allow_signature_verify: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut keys = LicenseKeys::new(SecurityLevel::L1);
        keys.set_from_license(&license_with_keys(vec![operator]));

        assert!(!keys.is_content_key(b"op"));
        let usage = keys.allowed_usage(b"op").unwrap();
        assert!(usage.generic_sign && usage.generic_verify);
        assert!(!usage.generic_encrypt && !usage.generic_decrypt);
        // Status changes only touch content keys.
        let (changed, _) = keys.apply_status_change(KeyStatus::Usable);
        assert!(!changed);
        assert!(keys.extract_key_statuses().is_empty());
    }
}
