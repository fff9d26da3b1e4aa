use prost::Message;
use wvcdm_proto::WidevinePsshData;
use wvcdm_proto::widevine_pssh_data::EntitledKey;

use crate::constants::WIDEVINE_SYSTEM_ID;
use crate::error::{CdmError, CdmResult};
use crate::types::HlsMethod;

pub const CENC_INIT_DATA_FORMAT: &str = "cenc";
pub const WEBM_INIT_DATA_FORMAT: &str = "webm";
pub const HLS_INIT_DATA_FORMAT: &str = "hls";

const HLS_BASE64_URI_PREFIX: &str = "data:text/plain;base64,";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Cenc,
    Webm,
    Hls,
    Unknown,
}

/// Initialization data from the media container, normalized to the payload
/// that goes into a license request's content id.
///
/// For CENC and HLS sources `data` is the selected Widevine pssh payload (a
/// serialized WidevinePsshData); for WebM it is the raw key-id header.
#[derive(Debug, Clone)]
pub struct InitData {
    format: Format,
    type_name: String,
    data: Vec<u8>,
    contains_entitled_keys: bool,
    hls_method: HlsMethod,
    hls_iv: Vec<u8>,
}

impl InitData {
    /// Dispatch on the init-data type token supplied by the host.
    /// `prefer_entitlements` biases CENC pssh selection toward boxes that
    /// carry entitled-key metadata.
    pub fn parse(type_name: &str, data: &[u8], prefer_entitlements: bool) -> Self {
        match type_name {
            CENC_INIT_DATA_FORMAT | "video/mp4" | "audio/mp4" => {
                Self::cenc(data, prefer_entitlements)
            }
            WEBM_INIT_DATA_FORMAT | "video/webm" | "audio/webm" => Self::webm(data),
            HLS_INIT_DATA_FORMAT => match std::str::from_utf8(data) {
                Ok(attributes) => {
                    Self::hls(attributes).unwrap_or_else(|_| Self::unknown(type_name))
                }
                Err(_) => Self::unknown(type_name),
            },
            other => Self::unknown(other),
        }
    }

    /// CENC: a sequence of ISO-BMFF pssh boxes. Picks the Widevine box,
    /// preferring one carrying entitled keys when asked to.
    pub fn cenc(data: &[u8], prefer_entitlements: bool) -> Self {
        let payloads = extract_widevine_pssh_payloads(data);
        let selected = if prefer_entitlements {
            payloads
                .iter()
                .find(|p| payload_has_entitled_keys(p))
                .or_else(|| payloads.first())
        } else {
            payloads.first()
        };
        let data = selected.cloned().unwrap_or_default();
        let contains_entitled_keys = payload_has_entitled_keys(&data);
        InitData {
            format: Format::Cenc,
            type_name: CENC_INIT_DATA_FORMAT.to_owned(),
            data,
            contains_entitled_keys,
            hls_method: HlsMethod::None,
            hls_iv: Vec::new(),
        }
    }

    /// WebM: the raw key-id header, passed through untouched.
    pub fn webm(data: &[u8]) -> Self {
        InitData {
            format: Format::Webm,
            type_name: WEBM_INIT_DATA_FORMAT.to_owned(),
            data: data.to_vec(),
            contains_entitled_keys: false,
            hls_method: HlsMethod::None,
            hls_iv: Vec::new(),
        }
    }

    /// HLS: an EXT-X-KEY attribute list. The URI attribute holds a
    /// base64-encoded Widevine init payload.
    pub fn hls(attribute_list: &str) -> CdmResult<Self> {
        let method = match extract_attribute(attribute_list, "METHOD") {
            Some(m) if m == "AES-128" => HlsMethod::Aes128,
            Some(m) if m == "SAMPLE-AES" => HlsMethod::SampleAes,
            Some(m) if m == "NONE" => HlsMethod::None,
            _ => {
                return Err(CdmError::UnsupportedInitData(
                    "HLS METHOD missing or unrecognized".into(),
                ));
            }
        };

        let uri = extract_quoted_attribute(attribute_list, "URI")
            .ok_or_else(|| CdmError::UnsupportedInitData("HLS URI missing".into()))?;
        let encoded = uri.strip_prefix(HLS_BASE64_URI_PREFIX).ok_or_else(|| {
            CdmError::UnsupportedInitData("HLS URI is not base64 text/plain".into())
        })?;
        let data = data_encoding::BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| CdmError::InvalidBase64(format!("HLS URI: {e}")))?;

        let hls_iv = match extract_attribute(attribute_list, "IV") {
            Some(iv_hex) => {
                let digits = iv_hex
                    .strip_prefix("0x")
                    .or_else(|| iv_hex.strip_prefix("0X"))
                    .unwrap_or(&iv_hex);
                hex::decode(digits)
                    .map_err(|e| CdmError::UnsupportedInitData(format!("HLS IV: {e}")))?
            }
            None => Vec::new(),
        };

        let contains_entitled_keys = payload_has_entitled_keys(&data);
        Ok(InitData {
            format: Format::Hls,
            type_name: HLS_INIT_DATA_FORMAT.to_owned(),
            data,
            contains_entitled_keys,
            hls_method: method,
            hls_iv,
        })
    }

    fn unknown(type_name: &str) -> Self {
        InitData {
            format: Format::Unknown,
            type_name: type_name.to_owned(),
            data: Vec::new(),
            contains_entitled_keys: false,
            hls_method: HlsMethod::None,
            hls_iv: Vec::new(),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.format != Format::Unknown
    }

    pub fn is_cenc(&self) -> bool {
        self.format == Format::Cenc
    }

    pub fn is_webm(&self) -> bool {
        self.format == Format::Webm
    }

    pub fn is_hls(&self) -> bool {
        self.format == Format::Hls
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hls_method(&self) -> HlsMethod {
        self.hls_method
    }

    pub fn hls_iv(&self) -> &[u8] {
        &self.hls_iv
    }

    pub fn contains_entitled_keys(&self) -> bool {
        self.contains_entitled_keys
    }

    /// Entitled-key records embedded in the init payload, for the two-level
    /// key hierarchy.
    pub fn extract_wrapped_keys(&self) -> Vec<EntitledKey> {
        WidevinePsshData::decode(self.data.as_slice())
            .map(|pssh| pssh.entitled_keys)
            .unwrap_or_default()
    }
}

fn payload_has_entitled_keys(payload: &[u8]) -> bool {
    WidevinePsshData::decode(payload)
        .map(|pssh| !pssh.entitled_keys.is_empty())
        .unwrap_or(false)
}

/// Walk a sequence of ISO-BMFF pssh boxes, returning the data payload of
/// every box bearing the Widevine system id.
///
/// Box layout:
///   [0..4]   box_size: u32 big-endian (0 = to end of input)
///   [4..8]   box_type: "pssh"
///   [8]      version (0 or 1)
///   [9..12]  flags
///   [12..28] system_id
///   v1 only: key_id_count + key_ids
///   [..]     data_size, data
fn extract_widevine_pssh_payloads(input: &[u8]) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    let mut cursor = 0usize;

    while input.len() - cursor >= 32 {
        let rest = &input[cursor..];
        let declared = read_u32_be(rest, 0) as usize;
        let box_size = if declared == 0 { rest.len() } else { declared };
        if box_size < 32 || box_size > rest.len() {
            break;
        }
        let bx = &rest[..box_size];
        cursor += box_size;

        if &bx[4..8] != b"pssh" {
            continue;
        }
        let version = bx[8];
        if version > 1 {
            continue;
        }
        let mut offset = 28;
        if version == 1 {
            if offset + 4 > bx.len() {
                continue;
            }
            let kid_count = read_u32_be(bx, offset) as usize;
            offset += 4 + kid_count * 16;
        }
        if offset + 4 > bx.len() {
            continue;
        }
        let data_size = read_u32_be(bx, offset) as usize;
        offset += 4;
        if offset + data_size > bx.len() {
            continue;
        }
        if bx[12..28] == WIDEVINE_SYSTEM_ID {
            payloads.push(bx[offset..offset + data_size].to_vec());
        }
    }

    payloads
}

fn read_u32_be(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Pull `KEY=value` out of an attribute list, stopping at the next comma.
fn extract_attribute(attribute_list: &str, key: &str) -> Option<String> {
    let value = attribute_value(attribute_list, key)?;
    Some(value.split(',').next().unwrap_or("").trim().to_owned())
}

/// Pull `KEY="value"` out of an attribute list.
fn extract_quoted_attribute(attribute_list: &str, key: &str) -> Option<String> {
    let value = attribute_value(attribute_list, key)?;
    let rest = value.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_owned())
}

fn attribute_value<'a>(attribute_list: &'a str, key: &str) -> Option<&'a str> {
    let mut search = attribute_list;
    loop {
        let idx = search.find(key)?;
        let after = &search[idx + key.len()..];
        let at_boundary = idx == 0
            || matches!(
                search.as_bytes()[idx - 1],
                b',' | b' ' | b'\t' | b':' | b';'
            );
        if at_boundary && let Some(value) = after.strip_prefix('=') {
            return Some(value);
        }
        search = after;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wvcdm_proto::widevine_pssh_data::Type as PsshType;

    fn widevine_payload(entitled: bool) -> Vec<u8> {
        let pssh = WidevinePsshData {
            key_id: vec![vec![0x11u8; 16]],
            r#type: entitled.then_some(PsshType::EntitledKey as i32),
            entitled_keys: if entitled {
                vec![EntitledKey {
                    entitlement_key_id: Some(vec![1u8; 16]),
                    key_id: Some(vec![2u8; 16]),
                    key: Some(vec![3u8; 32]),
                    iv: Some(vec![4u8; 16]),
                    ..Default::default()
                }]
            } else {
                Vec::new()
            },
            ..Default::default()
        };
        pssh.encode_to_vec()
    }

    fn pssh_box(system_id: &[u8; 16], payload: &[u8]) -> Vec<u8> {
        let size = 32 + payload.len();
        let mut bx = Vec::with_capacity(size);
        bx.extend_from_slice(&(size as u32).to_be_bytes());
        bx.extend_from_slice(b"pssh");
        bx.extend_from_slice(&[0u8; 4]); // version 0 + flags
        bx.extend_from_slice(system_id);
        bx.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bx.extend_from_slice(payload);
        bx
    }

    const OTHER_SYSTEM_ID: [u8; 16] = [0xau8; 16];

    #[test]
    fn picks_widevine_box_among_others() {
        let payload = widevine_payload(false);
        let mut stream = pssh_box(&OTHER_SYSTEM_ID, b"opaque");
        stream.extend_from_slice(&pssh_box(&WIDEVINE_SYSTEM_ID, &payload));

        let init_data = InitData::cenc(&stream, false);
        assert!(init_data.is_supported());
        assert!(!init_data.is_empty());
        assert_eq!(init_data.data(), payload.as_slice());
        assert!(!init_data.contains_entitled_keys());
    }

    #[test]
    fn prefers_entitled_box_when_asked() {
        let plain = widevine_payload(false);
        let entitled = widevine_payload(true);
        let mut stream = pssh_box(&WIDEVINE_SYSTEM_ID, &plain);
        stream.extend_from_slice(&pssh_box(&WIDEVINE_SYSTEM_ID, &entitled));

        let without_preference = InitData::cenc(&stream, false);
        assert_eq!(without_preference.data(), plain.as_slice());

        let with_preference = InitData::cenc(&stream, true);
        assert_eq!(with_preference.data(), entitled.as_slice());
        assert!(with_preference.contains_entitled_keys());
        assert_eq!(with_preference.extract_wrapped_keys().len(), 1);
    }

    #[test]
    fn version_1_box_skips_key_ids() {
        let payload = widevine_payload(false);
        let size = 32 + 4 + 16 + payload.len();
        let mut bx = Vec::new();
        bx.extend_from_slice(&(size as u32).to_be_bytes());
        bx.extend_from_slice(b"pssh");
        bx.push(1); // version
        bx.extend_from_slice(&[0u8; 3]);
        bx.extend_from_slice(&WIDEVINE_SYSTEM_ID);
        bx.extend_from_slice(&1u32.to_be_bytes());
        bx.extend_from_slice(&[0x22u8; 16]);
        bx.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bx.extend_from_slice(&payload);

        let init_data = InitData::cenc(&bx, false);
        assert_eq!(init_data.data(), payload.as_slice());
    }

    #[test]
    fn truncated_box_yields_empty() {
        let payload = widevine_payload(false);
        let mut bx = pssh_box(&WIDEVINE_SYSTEM_ID, &payload);
        bx.truncate(bx.len() - 1);
        // Declared size exceeds input; nothing selected.
        assert!(InitData::cenc(&bx, false).is_empty());
    }

    #[test]
    fn webm_passes_header_through() {
        let init_data = InitData::parse("webm", b"webm-key-id", false);
        assert!(init_data.is_webm());
        assert_eq!(init_data.data(), b"webm-key-id");
    }

    #[test]
    fn hls_attribute_list_parses() {
        let payload = widevine_payload(false);
        let encoded = data_encoding::BASE64.encode(&payload);
        let attributes = format!(
            "METHOD=SAMPLE-AES,URI=\"data:text/plain;base64,{encoded}\",\
             IV=0x000102030405060708090a0b0c0d0e0f"
        );
        let init_data = InitData::hls(&attributes).unwrap();
        assert!(init_data.is_hls());
        assert_eq!(init_data.hls_method(), HlsMethod::SampleAes);
        assert_eq!(init_data.data(), payload.as_slice());
        assert_eq!(init_data.hls_iv().len(), 16);
        assert_eq!(init_data.hls_iv()[15], 0x0f);
    }

    #[test]
    fn hls_without_method_is_rejected() {
        assert!(InitData::hls("URI=\"data:text/plain;base64,AAAA\"").is_err());
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let init_data = InitData::parse("fairplay", b"whatever", false);
        assert!(!init_data.is_supported());
    }
}
