//! Certificate utilities.

use color_eyre::eyre::WrapErr as _;
use sha2::{Digest as _, Sha256};
use x509_parser::der_parser::asn1_rs::{oid, Oid};
use x509_parser::prelude::*;

/// The subject UID attribute holding the APNs topic of a push certificate.
const UID_OID: Oid<'static> = oid!(0.9.2342.19200300.100.1.1);

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
///
/// This is the hash used everywhere a certificate is associated with an
/// enrollment.
pub fn cert_hash(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Extract the APNs topic from a push certificate's subject UID attribute.
pub fn topic_from_cert(cert_der: &[u8]) -> color_eyre::eyre::Result<String> {
    let (_, cert) =
        X509Certificate::from_der(cert_der).map_err(|e| color_eyre::eyre::eyre!("{e}"))?;
    for rdn in cert.subject().iter() {
        for attr in rdn.iter() {
            if *attr.attr_type() == UID_OID {
                let value = attr
                    .attr_value()
                    .as_str()
                    .map_err(|e| color_eyre::eyre::eyre!("UID attribute value: {e}"))?;
                return Ok(value.to_string());
            }
        }
    }
    color_eyre::eyre::bail!("no UID attribute in certificate subject")
}

/// Extract the APNs topic from a PEM push certificate.
pub fn topic_from_pem_cert(pem_cert: &[u8]) -> color_eyre::eyre::Result<String> {
    topic_from_cert(&decode_pem_certificate(pem_cert)?)
}

/// Decode a single PEM `CERTIFICATE` block to DER.
pub fn decode_pem_certificate(pem_bytes: &[u8]) -> color_eyre::eyre::Result<Vec<u8>> {
    let block = ::pem::parse(pem_bytes).wrap_err("parsing PEM")?;
    if block.tag() != "CERTIFICATE" {
        color_eyre::eyre::bail!("PEM block is not a certificate: {:?}", block.tag());
    }
    Ok(block.into_contents())
}

/// Encode a DER certificate as PEM.
pub fn pem_certificate(cert_der: &[u8]) -> String {
    ::pem::encode(&::pem::Pem::new("CERTIFICATE", cert_der.to_vec()))
}

/// Parse a certificate out of an RFC 9440-style header value: the
/// base64-encoded DER certificate surrounded by colons.
pub fn extract_rfc9440(header_value: &str) -> color_eyre::eyre::Result<Vec<u8>> {
    if header_value.len() < 3 {
        color_eyre::eyre::bail!("header too short");
    }
    if !header_value.starts_with(':') || !header_value.ends_with(':') {
        color_eyre::eyre::bail!("invalid prefix or suffix");
    }
    use base64::Engine as _;
    let cert_der = base64::engine::general_purpose::STANDARD
        .decode(&header_value[1..header_value.len() - 1])
        .wrap_err("decoding base64")?;
    // make sure it actually parses before handing it out
    X509Certificate::from_der(&cert_der).map_err(|e| color_eyre::eyre::eyre!("{e}"))?;
    Ok(cert_der)
}

/// Parse a PEM certificate from a URL query-escaped header value.
///
/// This is ostensibly to support Nginx' `$ssl_client_escaped_cert` in a
/// `proxy_set_header` directive, though any reverse proxy setting a similar
/// header works.
pub fn extract_query_escaped_pem(header_value: &str) -> color_eyre::eyre::Result<Vec<u8>> {
    if header_value.is_empty() {
        color_eyre::eyre::bail!("header too short");
    }
    let cert_pem = urlencoding::decode(header_value).wrap_err("query unescape")?;
    decode_pem_certificate(cert_pem.as_bytes()).wrap_err("decode certificate")
}

/// A PEM certificate and private key split out of one concatenated body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemCertAndKey {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Split a concatenated PEM certificate + private key body.
///
/// Supports `cat push.pem push.key | curl -T -`-style uploads where the PEM
/// blocks may be mushed together with no separating newline.
pub fn split_pem_cert_and_key(body: &[u8]) -> color_eyre::eyre::Result<PemCertAndKey> {
    let body = String::from_utf8_lossy(body).replace("----------", "-----\n-----");
    let blocks = ::pem::parse_many(body.as_bytes()).wrap_err("parsing PEM blocks")?;
    let mut cert_pem = None;
    let mut key_pem = None;
    for block in blocks {
        match block.tag() {
            "CERTIFICATE" => cert_pem = Some(::pem::encode(&block).into_bytes()),
            "RSA PRIVATE KEY" | "PRIVATE KEY" | "EC PRIVATE KEY" => {
                key_pem = Some(::pem::encode(&block).into_bytes())
            }
            other => color_eyre::eyre::bail!("unrecognized PEM type: {other:?}"),
        }
    }
    let cert_pem = cert_pem.ok_or_else(|| color_eyre::eyre::eyre!("cert not found"))?;
    let key_pem = key_pem.ok_or_else(|| color_eyre::eyre::eyre!("private key not found"))?;
    Ok(PemCertAndKey { cert_pem, key_pem })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_hash_is_lowercase_hex_sha256() {
        // SHA-256 of the empty input is a well-known value.
        assert_eq!(
            cert_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(cert_hash(b"").len(), 64);
    }

    #[test]
    fn rfc9440_rejects_bad_framing() {
        assert!(extract_rfc9440("dGVzdA==").is_err());
        assert!(extract_rfc9440(":").is_err());
    }

    #[test]
    fn rfc9440_rejects_non_certificates() {
        // valid base64, not a certificate
        assert!(extract_rfc9440(":dGVzdA==:").is_err());
    }

    #[test]
    fn splits_concatenated_cert_and_key() {
        let cert = ::pem::encode(&::pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        let key = ::pem::encode(&::pem::Pem::new("RSA PRIVATE KEY", vec![4, 5, 6]));
        let body = format!("{cert}{key}");
        let split = split_pem_cert_and_key(body.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(split.cert_pem).unwrap(), cert);
        assert_eq!(String::from_utf8(split.key_pem).unwrap(), key);
    }

    #[test]
    fn split_requires_both_blocks() {
        let cert = ::pem::encode(&::pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        assert!(split_pem_cert_and_key(cert.as_bytes()).is_err());
    }

    #[test]
    fn split_handles_mushed_blocks() {
        let cert = ::pem::encode(&::pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        let key = ::pem::encode(&::pem::Pem::new("PRIVATE KEY", vec![4, 5, 6]));
        let body = format!("{}{}", cert.trim_end(), key);
        let split = split_pem_cert_and_key(body.as_bytes()).unwrap();
        assert!(!split.key_pem.is_empty());
    }
}
