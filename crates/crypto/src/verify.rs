//! Enrollment certificate verification against configured trust anchors.

use color_eyre::eyre::WrapErr as _;
use x509_parser::prelude::*;

/// Verifies an enrollment identity certificate.
pub trait CertVerifier: Send + Sync {
    fn verify(&self, cert_der: &[u8]) -> color_eyre::eyre::Result<()>;
}

/// Chain verifier over a pool of trusted roots and optional intermediates.
///
/// Checks the validity window, walks issuers up to a root, verifies each
/// signature along the way, and requires the clientAuth extended key usage
/// on the leaf when the leaf carries an EKU extension at all.
pub struct ChainVerifier {
    roots: Vec<Vec<u8>>,
    intermediates: Vec<Vec<u8>>,
}

const MAX_CHAIN_DEPTH: usize = 4;

impl ChainVerifier {
    /// Build a verifier from PEM bundles. The roots bundle must contain at
    /// least one certificate.
    pub fn from_pem(
        roots_pem: &[u8],
        intermediates_pem: Option<&[u8]>,
    ) -> color_eyre::eyre::Result<Self> {
        let roots = parse_pem_bundle(roots_pem).wrap_err("parsing CA roots")?;
        if roots.is_empty() {
            color_eyre::eyre::bail!("no CA certificates supplied");
        }
        let intermediates = match intermediates_pem {
            Some(pem) => parse_pem_bundle(pem).wrap_err("parsing intermediates")?,
            None => Vec::new(),
        };
        Ok(Self {
            roots,
            intermediates,
        })
    }

    fn find_issuer(&self, subject_cert: &X509Certificate<'_>) -> Option<(&[u8], bool)> {
        for (der, is_root) in self
            .roots
            .iter()
            .map(|d| (d, true))
            .chain(self.intermediates.iter().map(|d| (d, false)))
        {
            let Ok((_, candidate)) = X509Certificate::from_der(der) else {
                continue;
            };
            if candidate.subject().as_raw() == subject_cert.issuer().as_raw() {
                return Some((der.as_slice(), is_root));
            }
        }
        None
    }
}

impl CertVerifier for ChainVerifier {
    fn verify(&self, cert_der: &[u8]) -> color_eyre::eyre::Result<()> {
        let (_, leaf) =
            X509Certificate::from_der(cert_der).map_err(|e| color_eyre::eyre::eyre!("{e}"))?;
        if !leaf.validity().is_valid() {
            color_eyre::eyre::bail!("certificate outside its validity window");
        }
        if let Ok(Some(eku)) = leaf.extended_key_usage() {
            if !eku.value.client_auth && !eku.value.any {
                color_eyre::eyre::bail!("certificate lacks clientAuth key usage");
            }
        }

        let mut current = cert_der.to_vec();
        for _ in 0..MAX_CHAIN_DEPTH {
            let (_, cert) = X509Certificate::from_der(&current)
                .map_err(|e| color_eyre::eyre::eyre!("{e}"))?;
            let Some((issuer_der, is_root)) = self.find_issuer(&cert) else {
                color_eyre::eyre::bail!("no issuer found for {}", cert.subject());
            };
            let (_, issuer) = X509Certificate::from_der(issuer_der)
                .map_err(|e| color_eyre::eyre::eyre!("{e}"))?;
            cert.verify_signature(Some(issuer.public_key()))
                .map_err(|e| color_eyre::eyre::eyre!("signature verification: {e}"))?;
            if is_root {
                return Ok(());
            }
            current = issuer_der.to_vec();
        }
        color_eyre::eyre::bail!("certificate chain too deep")
    }
}

/// Accepts any certificate. For migration endpoints and tests only.
pub struct AcceptAllVerifier;

impl CertVerifier for AcceptAllVerifier {
    fn verify(&self, _cert_der: &[u8]) -> color_eyre::eyre::Result<()> {
        Ok(())
    }
}

fn parse_pem_bundle(pem_bytes: &[u8]) -> color_eyre::eyre::Result<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(pem_bytes).wrap_err("parsing PEM")?;
    Ok(blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| b.into_contents())
        .collect())
}
