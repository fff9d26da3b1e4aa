use wvcdm_proto::ClientIdentification;
use wvcdm_proto::client_identification::client_capabilities::{
    AnalogOutputCapabilities as ProtoAnalogCaps, HdcpVersion as ProtoHdcpVersion,
};
use wvcdm_proto::client_identification::{ClientCapabilities, NameValue, TokenType};

use crate::tce::CryptoSession;
use crate::types::{AppParameterMap, ClientTokenType, HdcpVersion};

fn hdcp_to_proto(version: HdcpVersion) -> ProtoHdcpVersion {
    match version {
        HdcpVersion::None => ProtoHdcpVersion::HdcpNone,
        HdcpVersion::V1 => ProtoHdcpVersion::HdcpV1,
        HdcpVersion::V2 => ProtoHdcpVersion::HdcpV2,
        HdcpVersion::V2_1 => ProtoHdcpVersion::HdcpV21,
        HdcpVersion::V2_2 => ProtoHdcpVersion::HdcpV22,
        HdcpVersion::V2_3 => ProtoHdcpVersion::HdcpV23,
        HdcpVersion::NoDigitalOutput => ProtoHdcpVersion::HdcpNoDigitalOutput,
    }
}

/// Assemble the ClientIdentification message for license and provisioning
/// requests: the client token, the name/value fleet, and the device's
/// capability report.
pub fn build_client_id(
    token_type: ClientTokenType,
    token: &[u8],
    device_id: &[u8],
    app_id: &str,
    app_parameters: &AppParameterMap,
    provider_client_token: &[u8],
    crypto_session: &CryptoSession,
) -> ClientIdentification {
    let proto_token_type = match token_type {
        ClientTokenType::Keybox => TokenType::Keybox,
        ClientTokenType::OemCert => TokenType::OemDeviceCertificate,
        ClientTokenType::DrmCert => TokenType::DrmDeviceCertificate,
    };

    let mut client_info = Vec::new();
    let mut push = |name: &str, value: String| {
        client_info.push(NameValue {
            name: Some(name.to_owned()),
            value: Some(value),
        });
    };
    if !app_id.is_empty() {
        push("application_name", app_id.to_owned());
    }
    if !device_id.is_empty() {
        push("device_id", hex::encode(device_id));
    }
    let level = crypto_session.requested_security_level();
    let engine = crypto_session.engine();
    push("build_info", engine.build_information(level));
    for (name, value) in app_parameters {
        push(name, value.clone());
    }

    let max_hdcp = crypto_session
        .hdcp_capabilities()
        .map(|(_current, max)| max)
        .unwrap_or(HdcpVersion::None);
    let analog = engine.analog_output_capabilities(level);
    let analog_caps = if !analog.supported {
        ProtoAnalogCaps::AnalogOutputNone
    } else if analog.supports_cgms_a {
        ProtoAnalogCaps::AnalogOutputSupportsCgmsA
    } else {
        ProtoAnalogCaps::AnalogOutputSupported
    };

    let capabilities = ClientCapabilities {
        client_token: Some(true),
        video_resolution_constraints: Some(true),
        max_hdcp_version: Some(hdcp_to_proto(max_hdcp) as i32),
        oem_crypto_api_version: Some(engine.api_version(level)),
        srm_version: engine.srm_version(level).ok(),
        can_update_srm: Some(engine.is_srm_update_supported(level)),
        analog_output_capabilities: Some(analog_caps as i32),
        can_disable_analog_output: Some(analog.can_disable),
        resource_rating_tier: Some(engine.resource_rating_tier(level)),
        ..Default::default()
    };

    ClientIdentification {
        r#type: Some(proto_token_type as i32),
        token: Some(token.to_vec()),
        client_info,
        provider_client_token: (!provider_client_token.is_empty())
            .then(|| provider_client_token.to_vec()),
        client_capabilities: Some(capabilities),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_mock_crypto_session;

    #[test]
    fn includes_token_and_capabilities() {
        let crypto = open_mock_crypto_session();
        let mut app_parameters = AppParameterMap::new();
        app_parameters.insert("package".into(), "com.example".into());

        let id = build_client_id(
            ClientTokenType::DrmCert,
            b"cert-token",
            b"serial",
            "app",
            &app_parameters,
            b"",
            &crypto,
        );

        assert_eq!(id.r#type, Some(TokenType::DrmDeviceCertificate as i32));
        assert_eq!(id.token.as_deref(), Some(b"cert-token".as_slice()));
        assert!(id.provider_client_token.is_none());
        let names: Vec<_> = id
            .client_info
            .iter()
            .filter_map(|nv| nv.name.as_deref())
            .collect();
        assert!(names.contains(&"application_name"));
        assert!(names.contains(&"package"));

        let caps = id.client_capabilities.unwrap();
        assert_eq!(caps.oem_crypto_api_version, Some(15));
        assert_eq!(
            caps.max_hdcp_version,
            Some(ProtoHdcpVersion::HdcpV23 as i32)
        );
    }
}
