//! Decoding of certificate and CRL bundles.
//!
//! Inputs are accepted either as one or more PEM blocks or as a single raw
//! DER structure. Errors are returned as plain strings; callers decide
//! whether a bad bundle is a configuration error or a request fault.

use x509_parser::pem::Pem;
use x509_parser::{parse_x509_certificate, parse_x509_crl};

const CERTIFICATE_LABEL: &str = "CERTIFICATE";
const CRL_LABEL: &str = "X509 CRL";

/// Decode a certificate bundle into DER certificates.
///
/// Every block must parse as an X.509 certificate. Empty input yields an
/// empty list.
pub fn certificates(input: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let ders = blocks(input, CERTIFICATE_LABEL)?;
    for (i, der) in ders.iter().enumerate() {
        parse_x509_certificate(der).map_err(|e| format!("certificate #{i}: {e}"))?;
    }
    Ok(ders)
}

/// Decode a CRL bundle into DER revocation lists.
pub fn crls(input: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let ders = blocks(input, CRL_LABEL)?;
    for (i, der) in ders.iter().enumerate() {
        parse_x509_crl(der).map_err(|e| format!("crl #{i}: {e}"))?;
    }
    Ok(ders)
}

fn blocks(input: &[u8], label: &str) -> Result<Vec<Vec<u8>>, String> {
    if input.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    if !looks_like_pem(input) {
        return Ok(vec![input.to_vec()]);
    }

    let mut out = Vec::new();
    for pem in Pem::iter_from_buffer(input) {
        let pem = pem.map_err(|e| format!("invalid PEM: {e}"))?;
        if pem.label == label {
            out.push(pem.contents);
        }
    }
    if out.is_empty() {
        return Err(format!("no {label} block found"));
    }
    Ok(out)
}

fn looks_like_pem(input: &[u8]) -> bool {
    input.windows(11).any(|w| w == b"-----BEGIN ")
}
