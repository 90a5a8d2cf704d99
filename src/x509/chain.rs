//! Chain verification and revocation, backed by `rustls-webpki`.
//!
//! Path building, signature checks (certificates and CRLs), validity,
//! basic constraints and path length, key usage, client-auth extended key
//! usage, name constraints and CRL `nextUpdate` are all enforced by webpki.
//! This module owns the parsed anchors and CRLs of a snapshot, the depth
//! bound, and the mapping of webpki errors onto [`ChainError`].

use std::fmt;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, SignatureVerificationAlgorithm, TrustAnchor, UnixTime};
use webpki::{
    CertRevocationList, EndEntityCert, ExpirationPolicy, KeyUsage, OwnedCertRevocationList,
    RevocationCheckDepth, RevocationOptionsBuilder, UnknownStatusPolicy,
};

use super::pem;

/// Default maximum number of intermediates between leaf and anchor.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Why a structurally well-formed chain was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// A certificate on the path is outside its validity window.
    #[error("certificate not valid at evaluation time")]
    NotValidAtTime,

    /// No path to a trust anchor.
    #[error("no path to a trusted root")]
    Untrusted,

    /// A certificate on the path is listed on its issuer's CRL.
    #[error("certificate revoked")]
    Revoked,

    /// The verified path has more intermediates than allowed.
    #[error("path has {found} intermediates, at most {max} allowed")]
    DepthExceeded {
        /// Intermediates on the verified path.
        found: usize,
        /// Configured bound.
        max: usize,
    },

    /// Any other webpki rejection (EKU, name constraints, path length,
    /// stale or badly signed CRL, malformed DER).
    #[error("certificate rejected: {0}")]
    Rejected(String),
}

impl From<webpki::Error> for ChainError {
    fn from(e: webpki::Error) -> Self {
        match e {
            webpki::Error::CertExpired { .. } | webpki::Error::CertNotValidYet { .. } => {
                Self::NotValidAtTime
            }
            webpki::Error::UnknownIssuer => Self::Untrusted,
            webpki::Error::CertRevoked => Self::Revoked,
            other => Self::Rejected(format!("{other:?}")),
        }
    }
}

/// Inputs fixed for one validation call.
#[derive(Debug, Clone, Copy)]
pub struct ChainPolicy {
    /// Evaluation instant, seconds since the Unix epoch.
    pub now: i64,
    /// Maximum number of intermediates; `None` leaves only webpki's own
    /// path length bound.
    pub max_depth: Option<usize>,
}

impl ChainPolicy {
    fn time(&self) -> UnixTime {
        UnixTime::since_unix_epoch(Duration::from_secs(u64::try_from(self.now).unwrap_or(0)))
    }
}

/// Trusted root certificates.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    roots: Vec<TrustAnchor<'static>>,
}

impl TrustAnchors {
    /// Decode a PEM or DER bundle of roots.
    pub fn from_bundle(bytes: &[u8]) -> Result<Self, String> {
        let roots = pem::certificates(bytes)?
            .iter()
            .map(|der| {
                webpki::anchor_from_trusted_cert(&CertificateDer::from(der.as_slice()))
                    .map(|anchor| anchor.to_owned())
                    .map_err(|e| format!("trust anchor: {e:?}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { roots })
    }

    /// Whether no roots are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Verify the DER `leaf` up to one of the anchors for client
    /// authentication, using the presented DER `intermediates`.
    pub fn verify(
        &self,
        leaf: &[u8],
        intermediates: &[Vec<u8>],
        crl: &RevocationList,
        policy: ChainPolicy,
    ) -> Result<(), ChainError> {
        let leaf_der = CertificateDer::from(leaf);
        let leaf = EndEntityCert::try_from(&leaf_der)?;
        let intermediates: Vec<CertificateDer<'_>> = intermediates
            .iter()
            .map(|der| CertificateDer::from(der.as_slice()))
            .collect();

        let crls: Vec<&CertRevocationList<'_>> = crl.crls.iter().collect();
        let revocation = match RevocationOptionsBuilder::new(&crls) {
            Ok(builder) => Some(
                builder
                    .with_depth(RevocationCheckDepth::Chain)
                    .with_status_policy(UnknownStatusPolicy::Allow)
                    .with_expiration_policy(ExpirationPolicy::Enforce)
                    .build(),
            ),
            // no CRLs configured
            Err(_) => None,
        };

        let path = leaf.verify_for_usage(
            signature_algorithms(),
            &self.roots,
            &intermediates,
            policy.time(),
            KeyUsage::client_auth(),
            revocation,
            None,
        )?;

        if let Some(max) = policy.max_depth {
            let found = path.intermediate_certificates().count();
            if found > max {
                return Err(ChainError::DepthExceeded { found, max });
            }
        }
        Ok(())
    }
}

fn signature_algorithms() -> &'static [&'static dyn SignatureVerificationAlgorithm] {
    rustls::crypto::aws_lc_rs::default_provider()
        .signature_verification_algorithms
        .all
}

/// Certificate revocation lists, parsed once per snapshot.
#[derive(Default)]
pub struct RevocationList {
    crls: Vec<CertRevocationList<'static>>,
}

impl RevocationList {
    /// Decode a PEM or DER bundle of CRLs.
    pub fn from_bundle(bytes: &[u8]) -> Result<Self, String> {
        let crls = pem::crls(bytes)?
            .iter()
            .map(|der| {
                OwnedCertRevocationList::from_der(der)
                    .map(CertRevocationList::from)
                    .map_err(|e| format!("CRL: {e:?}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { crls })
    }
}

impl fmt::Debug for RevocationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevocationList")
            .field("crls", &self.crls.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, CertificateRevocationListParams, DistinguishedName,
        DnType, ExtendedKeyUsagePurpose, GeneralSubtree, IsCa, Issuer, KeyIdMethod, KeyPair,
        KeyUsagePurpose, NameConstraints, RevokedCertParams, SanType, SerialNumber,
    };
    use time::OffsetDateTime;

    const DAY: i64 = 86_400;

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn policy() -> ChainPolicy {
        ChainPolicy {
            now: now(),
            max_depth: Some(DEFAULT_MAX_DEPTH),
        }
    }

    /// A CA that can sign certificates and CRLs in tests.
    struct Ca {
        der: Vec<u8>,
        issuer: Issuer<'static, KeyPair>,
    }

    impl Ca {
        fn root(cn: &str) -> Self {
            Self::build(cn, 1, BasicConstraints::Unconstrained, None, None)
        }

        fn root_excluding_dns(cn: &str, dns: &str) -> Self {
            let nc = NameConstraints {
                permitted_subtrees: vec![],
                excluded_subtrees: vec![GeneralSubtree::DnsName(dns.to_string())],
            };
            Self::build(cn, 1, BasicConstraints::Unconstrained, Some(nc), None)
        }

        fn intermediate(&self, cn: &str, serial: u64, constraints: BasicConstraints) -> Self {
            Self::build(cn, serial, constraints, None, Some(self))
        }

        fn build(
            cn: &str,
            serial: u64,
            constraints: BasicConstraints,
            name_constraints: Option<NameConstraints>,
            parent: Option<&Ca>,
        ) -> Self {
            let mut params = CertificateParams::default();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, cn);
            params.distinguished_name = dn;
            params.serial_number = Some(SerialNumber::from(serial));
            params.is_ca = IsCa::Ca(constraints);
            params.name_constraints = name_constraints;
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            let key = KeyPair::generate().unwrap();
            let cert = match parent {
                Some(p) => params.signed_by(&key, &p.issuer).unwrap(),
                None => params.self_signed(&key).unwrap(),
            };
            Self {
                der: cert.der().to_vec(),
                issuer: Issuer::new(params, key),
            }
        }

        fn leaf_with(&self, serial: u64, eku: ExtendedKeyUsagePurpose, days: i64) -> Vec<u8> {
            let mut params = CertificateParams::default();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "client");
            params.distinguished_name = dn;
            params.serial_number = Some(SerialNumber::from(serial));
            params.not_after = OffsetDateTime::now_utc() + time::Duration::days(days);
            params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
            params.extended_key_usages = vec![eku];
            params.subject_alt_names =
                vec![SanType::DnsName("client.corp.example".try_into().unwrap())];
            let key = KeyPair::generate().unwrap();
            params.signed_by(&key, &self.issuer).unwrap().der().to_vec()
        }

        fn leaf(&self, serial: u64) -> Vec<u8> {
            self.leaf_with(serial, ExtendedKeyUsagePurpose::ClientAuth, 30)
        }

        fn crl(&self, revoked: &[u64], days: i64) -> RevocationList {
            let at = OffsetDateTime::now_utc();
            let crl = CertificateRevocationListParams {
                this_update: at,
                next_update: at + time::Duration::days(days),
                crl_number: SerialNumber::from(1u64),
                issuing_distribution_point: None,
                revoked_certs: revoked
                    .iter()
                    .map(|s| RevokedCertParams {
                        serial_number: SerialNumber::from(*s),
                        revocation_time: at,
                        reason_code: None,
                        invalidity_date: None,
                    })
                    .collect(),
                key_identifier_method: KeyIdMethod::Sha256,
            }
            .signed_by(&self.issuer)
            .unwrap();
            RevocationList::from_bundle(crl.der().as_ref()).unwrap()
        }

        fn anchors(&self) -> TrustAnchors {
            TrustAnchors::from_bundle(&self.der).unwrap()
        }
    }

    #[test]
    fn leaf_signed_by_anchor_verifies() {
        let root = Ca::root("Root");
        let leaf = root.leaf(1);
        assert_eq!(
            root.anchors().verify(&leaf, &[], &RevocationList::default(), policy()),
            Ok(())
        );
    }

    #[test]
    fn leaf_from_foreign_ca_is_untrusted() {
        let root = Ca::root("Root");
        let other = Ca::root("Other");
        assert_eq!(
            root.anchors()
                .verify(&other.leaf(1), &[], &RevocationList::default(), policy()),
            Err(ChainError::Untrusted)
        );
    }

    #[test]
    fn path_through_presented_intermediate_verifies() {
        // GIVEN: root → intermediate → leaf, intermediate presented by client
        let root = Ca::root("Root");
        let inter = root.intermediate("Issuing CA", 2, BasicConstraints::Constrained(0));
        let leaf = inter.leaf(9);
        let none = RevocationList::default();
        let anchors = root.anchors();
        // THEN: verifies with the intermediate, fails without it
        assert_eq!(anchors.verify(&leaf, &[inter.der.clone()], &none, policy()), Ok(()));
        assert_eq!(
            anchors.verify(&leaf, &[], &none, policy()),
            Err(ChainError::Untrusted)
        );
    }

    #[test]
    fn depth_bound_counts_intermediates() {
        // GIVEN: one intermediate on the path
        let root = Ca::root("Root");
        let inter = root.intermediate("Issuing CA", 2, BasicConstraints::Unconstrained);
        let leaf = inter.leaf(3);
        let none = RevocationList::default();
        let anchors = root.anchors();
        let with = |max_depth| ChainPolicy {
            max_depth,
            ..policy()
        };
        let presented = [inter.der.clone()];
        // THEN: a bound of one or no bound accepts, a bound of zero rejects
        assert_eq!(anchors.verify(&leaf, &presented, &none, with(Some(1))), Ok(()));
        assert_eq!(anchors.verify(&leaf, &presented, &none, with(None)), Ok(()));
        assert_eq!(
            anchors.verify(&leaf, &presented, &none, with(Some(0))),
            Err(ChainError::DepthExceeded { found: 1, max: 0 })
        );
    }

    #[test]
    fn path_length_constraint_of_issuer_is_enforced() {
        // GIVEN: root → CA with pathLen 0 → sub-CA → leaf
        let root = Ca::root("Root");
        let inter = root.intermediate("Issuing CA", 2, BasicConstraints::Constrained(0));
        let sub = inter.intermediate("Sub CA", 3, BasicConstraints::Unconstrained);
        let leaf = sub.leaf(4);
        // THEN: the sub-CA is beyond the allowed path length
        let result = root.anchors().verify(
            &leaf,
            &[inter.der.clone(), sub.der.clone()],
            &RevocationList::default(),
            policy(),
        );
        assert!(result.is_err(), "{result:?}");
    }

    #[test]
    fn excluded_dns_subtree_rejects_leaf() {
        // GIVEN: a root that excludes corp.example and a leaf for client.corp.example
        let root = Ca::root_excluding_dns("Root", "corp.example");
        let leaf = root.leaf(5);
        // THEN: the name constraint rejects the leaf
        assert!(matches!(
            root.anchors()
                .verify(&leaf, &[], &RevocationList::default(), policy()),
            Err(ChainError::Rejected(_))
        ));
    }

    #[test]
    fn server_auth_only_leaf_is_rejected() {
        let root = Ca::root("Root");
        let leaf = root.leaf_with(6, ExtendedKeyUsagePurpose::ServerAuth, 30);
        assert!(matches!(
            root.anchors()
                .verify(&leaf, &[], &RevocationList::default(), policy()),
            Err(ChainError::Rejected(_))
        ));
    }

    #[test]
    fn expired_leaf_is_rejected() {
        let root = Ca::root("Root");
        let leaf = root.leaf(1);
        let later = ChainPolicy {
            now: now() + 60 * DAY,
            ..policy()
        };
        assert_eq!(
            root.anchors()
                .verify(&leaf, &[], &RevocationList::default(), later),
            Err(ChainError::NotValidAtTime)
        );
    }

    #[test]
    fn revoked_serial_is_rejected() {
        // GIVEN: a CRL from the root revoking serial 77
        let root = Ca::root("Root");
        let crl = root.crl(&[77], 7);
        let anchors = root.anchors();
        // THEN: serial 77 is revoked, serial 78 is not
        assert_eq!(
            anchors.verify(&root.leaf(77), &[], &crl, policy()),
            Err(ChainError::Revoked)
        );
        assert_eq!(anchors.verify(&root.leaf(78), &[], &crl, policy()), Ok(()));
    }

    #[test]
    fn revoked_intermediate_rejects_its_leaves() {
        // GIVEN: the root revokes the intermediate's serial
        let root = Ca::root("Root");
        let inter = root.intermediate("Issuing CA", 40, BasicConstraints::Constrained(0));
        let crl = root.crl(&[40], 7);
        // THEN: a leaf under it is rejected even though the leaf itself is not listed
        assert_eq!(
            root.anchors()
                .verify(&inter.leaf(41), &[inter.der.clone()], &crl, policy()),
            Err(ChainError::Revoked)
        );
    }

    #[test]
    fn crl_from_other_issuer_does_not_apply() {
        let root = Ca::root("Root");
        let other = Ca::root("Other");
        let crl = other.crl(&[5], 7);
        assert_eq!(root.anchors().verify(&root.leaf(5), &[], &crl, policy()), Ok(()));
    }

    #[test]
    fn stale_crl_is_rejected() {
        // GIVEN: a CRL whose nextUpdate is in the past at evaluation time
        let root = Ca::root("Root");
        let crl = root.crl(&[], 1);
        let later = ChainPolicy {
            now: now() + 3 * DAY,
            ..policy()
        };
        // THEN: the leaf it covers cannot be checked and is rejected
        assert!(matches!(
            root.anchors().verify(&root.leaf(7), &[], &crl, later),
            Err(ChainError::Rejected(_))
        ));
    }

    #[test]
    fn crl_signed_by_another_key_is_rejected() {
        // GIVEN: an impostor CA sharing the root's name issues a CRL
        let root = Ca::root("Root");
        let impostor = Ca::root("Root");
        let crl = impostor.crl(&[], 7);
        // THEN: the CRL signature fails under the real root's key
        assert!(
            root.anchors()
                .verify(&root.leaf(8), &[], &crl, policy())
                .is_err()
        );
    }

    #[test]
    fn garbage_bundle_is_an_error() {
        assert!(TrustAnchors::from_bundle(b"not a certificate").is_err());
        assert!(RevocationList::from_bundle(b"not a crl").is_err());
    }
}
