//! Identity-assertion signing key.
//!
//! The key is resolved once per snapshot build: decoded from configured
//! material, carried over from the previous snapshot, or generated fresh.
//! Supported algorithms are Ed25519 (`EdDSA`, the default for generated
//! keys), P-256 (`ES256`) and P-384 (`ES384`).
//!
//! The key id is the RFC 7638 JWK thumbprint of the public key, so the same
//! key material always yields the same `kid`.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rcgen::{KeyPair, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384, PKCS_ED25519};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Asymmetric key used to sign identity assertions.
#[derive(Clone)]
pub struct SigningKey {
    algorithm: Algorithm,
    key_id: String,
    encoding: EncodingKey,
    public_jwk: serde_json::Value,
}

impl SigningKey {
    /// Generate a fresh Ed25519 key.
    pub fn generate() -> Result<Self> {
        Self::from_pem(&generate_pem()?)
    }

    /// Decode configured key material: a PKCS#8 PEM, either raw or
    /// base64-encoded.
    pub fn from_config(material: &str) -> Result<Self> {
        let material = material.trim();
        if material.starts_with("-----BEGIN") {
            return Self::from_pem(material);
        }
        let decoded = STANDARD
            .decode(material)
            .map_err(|e| Error::Config(format!("signing key is neither PEM nor base64: {e}")))?;
        let pem = String::from_utf8(decoded)
            .map_err(|_| Error::Config("signing key base64 does not contain PEM text".into()))?;
        Self::from_pem(&pem)
    }

    /// Decode a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let pair = KeyPair::from_pem(pem)
            .map_err(|e| Error::Config(format!("invalid signing key: {e}")))?;
        let raw = pair.public_key_raw();

        let (algorithm, encoding, public_jwk) = if pair.algorithm() == &PKCS_ED25519 {
            let encoding = EncodingKey::from_ed_pem(pem.as_bytes())
                .map_err(|e| Error::Config(format!("invalid Ed25519 signing key: {e}")))?;
            let jwk = json!({
                "kty": "OKP",
                "crv": "Ed25519",
                "x": URL_SAFE_NO_PAD.encode(raw),
            });
            (Algorithm::EdDSA, encoding, jwk)
        } else if pair.algorithm() == &PKCS_ECDSA_P256_SHA256 {
            (Algorithm::ES256, ec_encoding(pem)?, ec_jwk("P-256", raw, 32)?)
        } else if pair.algorithm() == &PKCS_ECDSA_P384_SHA384 {
            (Algorithm::ES384, ec_encoding(pem)?, ec_jwk("P-384", raw, 48)?)
        } else {
            return Err(Error::Config(
                "unsupported signing key algorithm (expected Ed25519, P-256 or P-384)".into(),
            ));
        };

        let key_id = thumbprint(&public_jwk)?;
        let mut public_jwk = public_jwk;
        if let Some(obj) = public_jwk.as_object_mut() {
            obj.insert("kid".into(), json!(key_id));
            obj.insert("alg".into(), json!(format!("{algorithm:?}")));
            obj.insert("use".into(), json!("sig"));
        }

        Ok(Self {
            algorithm,
            key_id,
            encoding,
            public_jwk,
        })
    }

    /// JWS algorithm.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Key id (JWK thumbprint).
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Public key as a JWK.
    #[must_use]
    pub fn public_jwk(&self) -> &serde_json::Value {
        &self.public_jwk
    }

    /// Sign `claims` as a compact JWS.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.key_id.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("assertion signing failed: {e}")))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Generate a PKCS#8 PEM Ed25519 private key.
pub fn generate_pem() -> Result<String> {
    KeyPair::generate_for(&PKCS_ED25519)
        .map(|k| k.serialize_pem())
        .map_err(|e| Error::Config(format!("failed to generate signing key: {e}")))
}

fn ec_encoding(pem: &str) -> Result<EncodingKey> {
    EncodingKey::from_ec_pem(pem.as_bytes())
        .map_err(|e| Error::Config(format!("invalid EC signing key: {e}")))
}

/// Uncompressed point `04 || X || Y` to an EC JWK.
fn ec_jwk(crv: &str, raw: &[u8], coord: usize) -> Result<serde_json::Value> {
    if raw.len() != 1 + 2 * coord || raw[0] != 0x04 {
        return Err(Error::Config(format!("unexpected {crv} public key encoding")));
    }
    Ok(json!({
        "kty": "EC",
        "crv": crv,
        "x": URL_SAFE_NO_PAD.encode(&raw[1..=coord]),
        "y": URL_SAFE_NO_PAD.encode(&raw[1 + coord..]),
    }))
}

/// RFC 7638 thumbprint over the required members in lexicographic order.
fn thumbprint(jwk: &serde_json::Value) -> Result<String> {
    let member = |name: &str| {
        jwk.get(name)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::Internal(format!("jwk missing {name}")))
    };
    let canonical = match member("kty")? {
        "OKP" => format!(
            r#"{{"crv":"{}","kty":"OKP","x":"{}"}}"#,
            member("crv")?,
            member("x")?
        ),
        _ => format!(
            r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
            member("crv")?,
            member("x")?,
            member("y")?
        ),
    };
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}
