//! Client-side crypto primitives.
//!
//! Only what the CDM itself must compute: service-certificate signature
//! verification and privacy-mode client-id encryption. Everything touching
//! device or content keys happens behind the TCE boundary.

pub mod aes;
pub mod padding;
pub mod rsa;
