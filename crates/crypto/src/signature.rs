//! `Mdm-Signature` header verification.
//!
//! Devices enrolled with `SignMessage` send a base64-encoded CMS (PKCS#7)
//! detached signature of the request body in the `Mdm-Signature` header.
//! Verification extracts the signer certificate from the SignedData, checks
//! the message digest, and verifies the RSA signature, returning the signer
//! certificate DER on success.

use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use color_eyre::eyre::WrapErr as _;
use der::asn1::OctetString;
use der::{Decode as _, Encode as _};
use rsa::pkcs8::DecodePublicKey as _;
use rsa::RsaPublicKey;
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use x509_cert::Certificate;

const OID_SHA1: &str = "1.3.14.3.2.26";
const OID_SHA256: &str = "2.16.840.1.101.3.4.2.1";
const OID_MESSAGE_DIGEST: &str = "1.2.840.113549.1.9.4";

/// Verify an `Mdm-Signature` header value against the request body.
///
/// Returns the DER-encoded signer certificate. Chain validation against
/// trust anchors is the verifier middleware's concern, not this function's.
pub fn verify_mdm_signature(
    header_value: &str,
    body: &[u8],
) -> color_eyre::eyre::Result<Vec<u8>> {
    use base64::Engine as _;

    // some clients wrap the base64 across lines
    let compact: String = header_value.split_whitespace().collect();
    let signature_der = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .wrap_err("decoding Mdm-Signature base64")?;

    let content_info =
        ContentInfo::from_der(&signature_der).map_err(|e| color_eyre::eyre::eyre!("{e}"))?;
    let content = content_info
        .content
        .to_der()
        .map_err(|e| color_eyre::eyre::eyre!("re-encoding SignedData content: {e}"))?;
    let signed_data = SignedData::from_der(&content)
        .map_err(|e| color_eyre::eyre::eyre!("decoding SignedData: {e}"))?;

    let signer = signed_data
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or_else(|| color_eyre::eyre::eyre!("no signer info"))?;

    let cert = find_signer_certificate(&signed_data, signer)?;
    let cert_der = cert
        .to_der()
        .map_err(|e| color_eyre::eyre::eyre!("re-encoding signer certificate: {e}"))?;

    let digest_oid = signer.digest_alg.oid.to_string();
    let body_digest = digest(&digest_oid, body)?;

    // With signed attributes the signature covers the attributes, which in
    // turn carry the body digest. Without them it covers the body directly.
    let signed_payload_digest = match &signer.signed_attrs {
        Some(attrs) => {
            let message_digest = attrs
                .iter()
                .find(|attr| attr.oid.to_string() == OID_MESSAGE_DIGEST)
                .and_then(|attr| attr.values.iter().next())
                .ok_or_else(|| color_eyre::eyre::eyre!("no messageDigest attribute"))?;
            let message_digest_der = message_digest
                .to_der()
                .map_err(|e| color_eyre::eyre::eyre!("re-encoding messageDigest: {e}"))?;
            let message_digest = OctetString::from_der(&message_digest_der)
                .map_err(|e| color_eyre::eyre::eyre!("decoding messageDigest: {e}"))?;
            if message_digest.as_bytes() != body_digest.as_slice() {
                color_eyre::eyre::bail!("message digest mismatch");
            }
            let attrs_der = attrs
                .to_der()
                .map_err(|e| color_eyre::eyre::eyre!("encoding signed attributes: {e}"))?;
            digest(&digest_oid, &attrs_der)?
        }
        None => body_digest,
    };

    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| color_eyre::eyre::eyre!("encoding SPKI: {e}"))?;
    let public_key =
        RsaPublicKey::from_public_key_der(&spki_der).wrap_err("parsing RSA public key")?;

    let scheme = match digest_oid.as_str() {
        OID_SHA1 => rsa::Pkcs1v15Sign::new::<Sha1>(),
        OID_SHA256 => rsa::Pkcs1v15Sign::new::<Sha256>(),
        other => color_eyre::eyre::bail!("unsupported digest algorithm: {other}"),
    };
    public_key
        .verify(scheme, &signed_payload_digest, signer.signature.as_bytes())
        .wrap_err("verifying signature")?;

    Ok(cert_der)
}

fn find_signer_certificate<'a>(
    signed_data: &'a SignedData,
    signer: &SignerInfo,
) -> color_eyre::eyre::Result<&'a Certificate> {
    let certs = signed_data
        .certificates
        .as_ref()
        .ok_or_else(|| color_eyre::eyre::eyre!("no certificates in SignedData"))?;

    let mut first = None;
    for choice in certs.0.iter() {
        let CertificateChoices::Certificate(cert) = choice else {
            continue;
        };
        if first.is_none() {
            first = Some(cert);
        }
        if let SignerIdentifier::IssuerAndSerialNumber(isn) = &signer.sid {
            if cert.tbs_certificate.serial_number == isn.serial_number
                && cert.tbs_certificate.issuer == isn.issuer
            {
                return Ok(cert);
            }
        }
    }
    // fall back to the first certificate when the identifier doesn't match
    // any entry (some clients only embed the leaf)
    first.ok_or_else(|| color_eyre::eyre::eyre!("no signer certificate in SignedData"))
}

fn digest(oid: &str, data: &[u8]) -> color_eyre::eyre::Result<Vec<u8>> {
    match oid {
        OID_SHA1 => Ok(Sha1::digest(data).to_vec()),
        OID_SHA256 => Ok(Sha256::digest(data).to_vec()),
        other => color_eyre::eyre::bail!("unsupported digest algorithm: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_base64() {
        assert!(verify_mdm_signature("!!not-base64!!", b"body").is_err());
    }

    #[test]
    fn rejects_non_cms_payload() {
        use base64::Engine as _;
        let bogus = base64::engine::general_purpose::STANDARD.encode(b"not CMS");
        assert!(verify_mdm_signature(&bogus, b"body").is_err());
    }
}
