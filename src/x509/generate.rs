//! Certificate generation for `authorize tls` commands and tests.
//!
//! [`CertGenerator`] wraps `rcgen` so operators can stand up a client CA,
//! issue client certificates and publish revocation lists without
//! `openssl`. All output is PEM.

use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyIdMethod, KeyPair,
    KeyUsagePurpose, RevocationReason, RevokedCertParams, SanType, SerialNumber,
};
use rcgen::string::Ia5String;
use time::{Duration, OffsetDateTime};

use crate::{Error, Result};

/// Parameters for a CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name (e.g. `"Edge Client CA"`).
    pub cn: &'a str,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Parameters for a client certificate.
#[derive(Debug, Default)]
pub struct ClientCertParams<'a> {
    /// Common Name.
    pub cn: &'a str,
    /// Serial number; random when `None`.
    pub serial: Option<u64>,
    /// SAN DNS entries.
    pub san_dns: Vec<String>,
    /// SAN email entries.
    pub san_emails: Vec<String>,
    /// SAN URI entries (e.g. SPIFFE IDs).
    pub san_uris: Vec<String>,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Parameters for a certificate revocation list.
#[derive(Debug, Default)]
pub struct CrlParams {
    /// Serials to revoke.
    pub revoked_serials: Vec<u64>,
    /// Monotonic CRL number.
    pub crl_number: u64,
    /// Days until `nextUpdate`.
    pub validity_days: u32,
}

/// Generated certificate and key pair in PEM format.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Certificate generator backed by `rcgen`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA allowed to sign certificates and CRLs.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate CA key: {e}")))?;
        let cert = ca_params(params.cn, params.validity_days, BasicConstraints::Unconstrained)
            .self_signed(&key)
            .map_err(|e| Error::Config(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Issue an intermediate CA signed by `ca_cert_pem` / `ca_key_pem`.
    pub fn issue_intermediate(
        params: &CaParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let issuer = load_issuer(ca_cert_pem, ca_key_pem)?;
        let key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate intermediate key: {e}")))?;
        let cert = ca_params(params.cn, params.validity_days, BasicConstraints::Constrained(0))
            .signed_by(&key, &issuer)
            .map_err(|e| Error::Config(format!("Intermediate signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Issue a client-authentication leaf signed by `ca_cert_pem` /
    /// `ca_key_pem`.
    pub fn issue_client(
        params: &ClientCertParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let issuer = load_issuer(ca_cert_pem, ca_key_pem)?;
        let key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate client key: {e}")))?;

        let mut leaf = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.cn);
        leaf.distinguished_name = dn;
        leaf.serial_number = params.serial.map(SerialNumber::from);
        leaf.not_after = days_from_now(params.validity_days);
        leaf.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        leaf.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let mut sans = Vec::new();
        for dns in &params.san_dns {
            sans.push(SanType::DnsName(ia5(dns, "DNS")?));
        }
        for email in &params.san_emails {
            sans.push(SanType::Rfc822Name(ia5(email, "email")?));
        }
        for uri in &params.san_uris {
            sans.push(SanType::URI(ia5(uri, "URI")?));
        }
        leaf.subject_alt_names = sans;

        let cert = leaf
            .signed_by(&key, &issuer)
            .map_err(|e| Error::Config(format!("Client cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Issue a PEM CRL revoking `params.revoked_serials`.
    pub fn issue_crl(params: &CrlParams, ca_cert_pem: &str, ca_key_pem: &str) -> Result<String> {
        let issuer = load_issuer(ca_cert_pem, ca_key_pem)?;
        let now = OffsetDateTime::now_utc();

        let crl = CertificateRevocationListParams {
            this_update: now,
            next_update: days_from_now(params.validity_days.max(1)),
            crl_number: SerialNumber::from(params.crl_number),
            issuing_distribution_point: None,
            revoked_certs: params
                .revoked_serials
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from(*serial),
                    revocation_time: now,
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        }
        .signed_by(&issuer)
        .map_err(|e| Error::Config(format!("CRL signing failed: {e}")))?;

        crl.pem()
            .map_err(|e| Error::Config(format!("CRL serialisation failed: {e}")))
    }

    /// Write `<stem>.crt` and `<stem>.key` under `dir`.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Cannot create dir '{}': {e}", dir.display())))?;
        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)
            .map_err(|e| Error::Config(format!("Cannot write cert: {e}")))?;
        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)
            .map_err(|e| Error::Config(format!("Cannot write key: {e}")))?;
        Ok(())
    }
}

fn ca_params(cn: &str, validity_days: u32, constraints: BasicConstraints) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(constraints);
    params.not_after = days_from_now(validity_days);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

fn load_issuer(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Issuer<'static, KeyPair>> {
    let key = KeyPair::from_pem(ca_key_pem)
        .map_err(|e| Error::Config(format!("Failed to parse CA key: {e}")))?;
    Issuer::from_ca_cert_pem(ca_cert_pem, key)
        .map_err(|e| Error::Config(format!("Failed to parse CA cert: {e}")))
}

fn ia5(value: &str, kind: &str) -> Result<Ia5String> {
    Ia5String::try_from(value)
        .map_err(|e| Error::Config(format!("Invalid {kind} SAN '{value}': {e}")))
}

fn days_from_now(days: u32) -> OffsetDateTime {
    OffsetDateTime::now_utc() + Duration::days(i64::from(days))
}
