//! Generated protobuf types for the Widevine license protocol and for the
//! CDM's persistent storage records.

include!(concat!(env!("OUT_DIR"), "/license_protocol.rs"));

pub mod storage {
    include!(concat!(env!("OUT_DIR"), "/storage.rs"));
}
