//! Configuration management

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::evaluator::client_cert::ClientCertConstraints;
use crate::route::RoutePolicy;
use crate::{Error, Result};

/// Evaluator configuration, pushed at construction and on every reload.
///
/// Certificate and key material can be given inline (PEM text or base64 of
/// PEM) or as a file path; file fields are read by [`EvaluatorConfig::load`]
/// and take precedence over inline values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Route policies, in configuration order.
    pub policies: Vec<RoutePolicy>,
    /// Global client CA bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ca: Option<String>,
    /// Path of the global client CA bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ca_file: Option<PathBuf>,
    /// Client certificate revocation lists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_crl: Option<String>,
    /// Path of the client CRL bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_crl_file: Option<PathBuf>,
    /// Inject the built-in invalid-client-certificate deny rule.
    ///
    /// Unset means "on for every route that has a client CA".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_default_client_certificate_rule: Option<bool>,
    /// Post-chain certificate constraints.
    pub client_cert_constraints: ClientCertConstraints,
    /// Assertion signing key (PKCS#8 PEM, raw or base64). Generated when
    /// unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
    /// Path of the assertion signing key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key_file: Option<PathBuf>,
    /// URL of the authenticate service; its host is the assertion issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticate_url: Option<String>,
    /// Service account used for serverless upstream authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serverless_service_account: Option<String>,
    /// Claim name → outbound header name.
    pub jwt_claim_headers: BTreeMap<String, String>,
}

impl EvaluatorConfig {
    /// Load configuration from a YAML file merged with `AUTHORIZE_`
    /// environment variables (`__` separates nesting levels).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTHORIZE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.resolve_files(path.and_then(Path::parent))?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read `*_file` fields into their inline counterparts. Relative paths
    /// resolve against `base`.
    fn resolve_files(&mut self, base: Option<&Path>) -> Result<()> {
        let read = |p: &Path| {
            let full = match base {
                Some(b) if p.is_relative() => b.join(p),
                _ => p.to_path_buf(),
            };
            fs::read_to_string(&full)
                .map_err(|e| Error::Config(format!("Cannot read '{}': {e}", full.display())))
        };
        if let Some(p) = &self.client_ca_file {
            self.client_ca = Some(read(p)?);
        }
        if let Some(p) = &self.client_crl_file {
            self.client_crl = Some(read(p)?);
        }
        if let Some(p) = &self.signing_key_file {
            self.signing_key = Some(read(p)?);
        }
        Ok(())
    }

    /// Global client CA as bytes (empty when unset).
    pub fn client_ca_bytes(&self) -> Result<Vec<u8>> {
        decode_material("client_ca", self.client_ca.as_deref())
    }

    /// Client CRL as bytes (empty when unset).
    pub fn client_crl_bytes(&self) -> Result<Vec<u8>> {
        decode_material("client_crl", self.client_crl.as_deref())
    }

    /// Host of the authenticate service URL.
    pub fn issuer(&self) -> Result<Option<String>> {
        let Some(raw) = self.authenticate_url.as_deref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let url = url::Url::parse(raw)
            .map_err(|e| Error::Config(format!("invalid authenticate_url '{raw}': {e}")))?;
        Ok(url.host_str().map(str::to_owned))
    }

    /// Builder: append a route policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RoutePolicy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Builder: global client CA (PEM).
    #[must_use]
    pub fn with_client_ca(mut self, pem: impl Into<String>) -> Self {
        self.client_ca = Some(pem.into());
        self
    }

    /// Builder: client CRL (PEM).
    #[must_use]
    pub fn with_client_crl(mut self, pem: impl Into<String>) -> Self {
        self.client_crl = Some(pem.into());
        self
    }

    /// Builder: force the built-in client certificate rule on or off.
    #[must_use]
    pub fn with_default_client_certificate_rule(mut self, enabled: bool) -> Self {
        self.add_default_client_certificate_rule = Some(enabled);
        self
    }

    /// Builder: post-chain certificate constraints.
    #[must_use]
    pub fn with_client_cert_constraints(mut self, constraints: ClientCertConstraints) -> Self {
        self.client_cert_constraints = constraints;
        self
    }

    /// Builder: signing key material.
    #[must_use]
    pub fn with_signing_key(mut self, key: impl Into<String>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    /// Builder: authenticate service URL.
    #[must_use]
    pub fn with_authenticate_url(mut self, url: impl Into<String>) -> Self {
        self.authenticate_url = Some(url.into());
        self
    }

    /// Builder: serverless service account.
    #[must_use]
    pub fn with_serverless_service_account(mut self, account: impl Into<String>) -> Self {
        self.serverless_service_account = Some(account.into());
        self
    }

    /// Builder: expose `claim` as the `header` outbound header.
    #[must_use]
    pub fn with_jwt_claim_header(
        mut self,
        claim: impl Into<String>,
        header: impl Into<String>,
    ) -> Self {
        self.jwt_claim_headers.insert(claim.into(), header.into());
        self
    }
}

/// PEM text is used as is; anything else must be base64 of PEM or DER.
fn decode_material(field: &str, value: Option<&str>) -> Result<Vec<u8>> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(Vec::new());
    };
    if value.contains("-----BEGIN") {
        return Ok(value.as_bytes().to_vec());
    }
    STANDARD
        .decode(value)
        .map_err(|e| Error::Config(format!("{field} is neither PEM nor base64: {e}")))
}
