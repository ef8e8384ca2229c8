//! # Key Generation
//!
//! ECDSA P-256 signing keys for components whose spec leaves the key unset,
//! and the certificate chain a timestamping key is issued under.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("key generation failed: {0}")]
pub struct KeyError(String);

/// PEM-encoded key pair
#[derive(Clone)]
pub struct GeneratedKeyPair {
    /// PKCS#8 private key
    pub private_pem: String,
    /// SubjectPublicKeyInfo public key
    pub public_pem: String,
}

impl std::fmt::Debug for GeneratedKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedKeyPair")
            .field("public_pem", &self.public_pem)
            .finish_non_exhaustive()
    }
}

/// Generate an ECDSA P-256 key pair
pub fn generate_key_pair() -> Result<GeneratedKeyPair, KeyError> {
    let key_pair = KeyPair::generate().map_err(key_error)?;
    Ok(GeneratedKeyPair {
        private_pem: key_pair.serialize_pem(),
        public_pem: key_pair.public_key_pem(),
    })
}

fn key_error(e: rcgen::Error) -> KeyError {
    KeyError(e.to_string())
}

/// Subject of a generated certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub common_name: String,
    pub organization: Option<String>,
}

impl Subject {
    pub fn new(common_name: impl Into<String>, organization: Option<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization,
        }
    }

    fn params(&self) -> CertificateParams {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(self.common_name.clone()));
        if let Some(organization) = &self.organization {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(organization.clone()));
        }
        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params
    }
}

/// Timestamping key with the chain it is issued under
#[derive(Clone)]
pub struct GeneratedChain {
    /// PKCS#8 private key of the leaf
    pub private_pem: String,
    /// Leaf, intermediate and root certificates, in that order
    pub chain_pem: String,
}

impl std::fmt::Debug for GeneratedChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedChain")
            .field("chain_pem", &self.chain_pem)
            .finish_non_exhaustive()
    }
}

fn ca(subject: &Subject, constraints: BasicConstraints) -> CertificateParams {
    let mut params = subject.params();
    params.is_ca = IsCa::Ca(constraints);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params
}

fn issue(
    params: CertificateParams,
    key: &KeyPair,
    issuer: &Certificate,
    issuer_key: &KeyPair,
) -> Result<Certificate, KeyError> {
    params.signed_by(key, issuer, issuer_key).map_err(key_error)
}

/// Generate a root CA, an intermediate CA and a leaf restricted to timestamping
pub fn generate_timestamping_chain(
    root: &Subject,
    intermediate: &Subject,
    leaf: &Subject,
) -> Result<GeneratedChain, KeyError> {
    let root_key = KeyPair::generate().map_err(key_error)?;
    let root_cert = ca(root, BasicConstraints::Unconstrained)
        .self_signed(&root_key)
        .map_err(key_error)?;

    let intermediate_key = KeyPair::generate().map_err(key_error)?;
    let intermediate_cert = issue(
        ca(intermediate, BasicConstraints::Constrained(0)),
        &intermediate_key,
        &root_cert,
        &root_key,
    )?;

    let leaf_key = KeyPair::generate().map_err(key_error)?;
    let mut leaf_params = leaf.params();
    leaf_params.is_ca = IsCa::ExplicitNoCa;
    leaf_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::TimeStamping];
    let leaf_cert = issue(leaf_params, &leaf_key, &intermediate_cert, &intermediate_key)?;

    Ok(GeneratedChain {
        private_pem: leaf_key.serialize_pem(),
        chain_pem: [leaf_cert.pem(), intermediate_cert.pem(), root_cert.pem()].concat(),
    })
}
