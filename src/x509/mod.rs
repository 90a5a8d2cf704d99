//! X.509 plumbing for client certificate validation.
//!
//! # Modules
//!
//! - [`pem`]: PEM/DER decoding of certificate and CRL bundles
//! - [`identity`]: subject alternative name extraction (`CertIdentity`)
//! - [`chain`]: trust anchors, chain verification and revocation checks
//! - [`generate`]: `rcgen`-backed CA, client certificate and CRL minting
//!
//! Trust anchors and CRLs are parsed into `rustls-webpki` types once per
//! snapshot. Presented certificates stay DER; `x509-parser` reads them for
//! SAN extraction.

pub mod chain;
pub mod generate;
pub mod identity;
pub mod pem;

pub use chain::{ChainPolicy, RevocationList, TrustAnchors};
pub use generate::{CaParams, CertGenerator, ClientCertParams, CrlParams, GeneratedCert};
pub use identity::CertIdentity;
