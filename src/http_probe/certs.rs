use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use openssl::hash::{MessageDigest, hash};
use openssl::x509::X509;
use x509_parser::parse_x509_certificate;
use x509_parser::prelude::X509Certificate;

use super::result::CertificateRecord;
use crate::error::{ExtractionError, SetupError};

/// SHA-256 fingerprints of the roots shipped with the system trust bundle.
/// A chain ending anywhere else was anchored by a manually installed CA.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    fingerprints: HashSet<String>,
}

impl TrustAnchors {
    pub fn from_pem_bundle(pem: &[u8]) -> Result<Self, openssl::error::ErrorStack> {
        let mut anchors = TrustAnchors::default();
        for cert in X509::stack_from_pem(pem)? {
            anchors.insert_der(&cert.to_der()?)?;
        }
        Ok(anchors)
    }

    pub fn load(path: &Path) -> Result<Self, SetupError> {
        let pem = std::fs::read(path).map_err(|source| SetupError::CaBundle {
            path: path.to_path_buf(),
            source,
        })?;
        let anchors =
            TrustAnchors::from_pem_bundle(&pem).map_err(|source| SetupError::CaBundleParse {
                path: path.to_path_buf(),
                source,
            })?;
        log::info!("Loaded {} trust anchors from {}", anchors.len(), path.display());
        Ok(anchors)
    }

    pub fn insert_der(&mut self, der: &[u8]) -> Result<(), openssl::error::ErrorStack> {
        self.fingerprints
            .insert(fingerprint(MessageDigest::sha256(), der)?);
        Ok(())
    }

    pub fn contains(&self, sha256_fingerprint: &str) -> bool {
        self.fingerprints.contains(sha256_fingerprint)
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// Colon-separated uppercase hex digest of a DER certificate.
pub fn fingerprint(
    digest: MessageDigest,
    der: &[u8],
) -> Result<String, openssl::error::ErrorStack> {
    let bytes = hash(digest, der)?;
    Ok(bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":"))
}

fn timestamp(seconds: i64, index: usize) -> Result<DateTime<Utc>, ExtractionError> {
    DateTime::from_timestamp(seconds, 0).ok_or(ExtractionError::Validity { index })
}

fn record(
    index: usize,
    der: &[u8],
    parsed: &X509Certificate<'_>,
) -> Result<CertificateRecord, ExtractionError> {
    let common_name = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    let issuer_organization = parsed
        .issuer()
        .iter_organization()
        .next()
        .and_then(|o| o.as_str().ok())
        .map(str::to_string);

    Ok(CertificateRecord {
        common_name,
        issuer_organization,
        sha1_fingerprint: fingerprint(MessageDigest::sha1(), der)?,
        sha256_fingerprint: fingerprint(MessageDigest::sha256(), der)?,
        not_before: timestamp(parsed.validity().not_before.timestamp(), index)?,
        not_after: timestamp(parsed.validity().not_after.timestamp(), index)?,
        is_built_in_root: None,
    })
}

/// Walks a DER chain from the leaf through each issuer until no certificate
/// in `chain` issued the current one, or the current one is self-issued.
///
/// Certificates that are not on the leaf's issuer path are skipped. The last
/// record gets `is_built_in_root` when trust anchors are known.
pub fn extract_chain(
    chain: &[Vec<u8>],
    anchors: &TrustAnchors,
) -> Result<Vec<CertificateRecord>, ExtractionError> {
    let mut parsed = Vec::with_capacity(chain.len());
    for (index, der) in chain.iter().enumerate() {
        let (_, cert) = parse_x509_certificate(der).map_err(|e| ExtractionError::Parse {
            index,
            reason: e.to_string(),
        })?;
        parsed.push(cert);
    }

    let mut records = Vec::with_capacity(parsed.len());
    let mut visited = vec![false; parsed.len()];
    let mut current = match parsed.first() {
        Some(_) => 0,
        None => return Ok(records),
    };

    loop {
        visited[current] = true;
        records.push(record(current, &chain[current], &parsed[current])?);

        let cert = &parsed[current];
        if cert.subject().as_raw() == cert.issuer().as_raw() {
            break;
        }
        let issuer = (0..parsed.len())
            .find(|&i| !visited[i] && parsed[i].subject().as_raw() == cert.issuer().as_raw());
        match issuer {
            Some(next) => current = next,
            None => break,
        }
    }

    if !anchors.is_empty() {
        if let Some(root) = records.last_mut() {
            root.is_built_in_root = Some(anchors.contains(&root.sha256_fingerprint));
        }
    }
    Ok(records)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;
    use openssl::pkey::{PKey, Private};
    use openssl::x509::extension::BasicConstraints;
    use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509NameRef};

    fn key() -> PKey<Private> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
    }

    fn name(cn: &str, org: &str) -> X509Name {
        let mut builder = X509NameBuilder::new().unwrap();
        builder.append_entry_by_text("O", org).unwrap();
        builder.append_entry_by_text("CN", cn).unwrap();
        builder.build()
    }

    fn build(
        subject: &X509NameRef,
        issuer: &X509NameRef,
        key: &PKey<Private>,
        signer: &PKey<Private>,
        ca: bool,
    ) -> X509 {
        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let mut serial = BigNum::new().unwrap();
        serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(subject).unwrap();
        builder.set_issuer_name(issuer).unwrap();
        builder.set_pubkey(key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        if ca {
            builder
                .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
                .unwrap();
        }
        builder.sign(signer, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    /// A leaf → intermediate → root chain as DER, leaf first.
    pub(crate) fn test_chain() -> Vec<Vec<u8>> {
        let root_key = key();
        let root_name = name("Test Root CA", "Probe Test Roots");
        let root = build(&root_name, &root_name, &root_key, &root_key, true);

        let mid_key = key();
        let mid_name = name("Test Intermediate", "Probe Test Intermediates");
        let mid = build(&mid_name, &root_name, &mid_key, &root_key, true);

        let leaf_key = key();
        let leaf_name = name("enabled.example.com", "Example Site");
        let leaf = build(&leaf_name, &mid_name, &leaf_key, &mid_key, false);

        vec![
            leaf.to_der().unwrap(),
            mid.to_der().unwrap(),
            root.to_der().unwrap(),
        ]
    }

    #[test]
    fn test_chain_order_is_preserved() {
        let chain = test_chain();
        let records = extract_chain(&chain, &TrustAnchors::default()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].common_name.as_deref(), Some("enabled.example.com"));
        assert_eq!(
            records[0].issuer_organization.as_deref(),
            Some("Probe Test Intermediates")
        );
        assert_eq!(records[1].common_name.as_deref(), Some("Test Intermediate"));
        assert_eq!(records[2].common_name.as_deref(), Some("Test Root CA"));
        assert!(records.iter().all(|r| r.is_built_in_root.is_none()));

        // same input, same output
        assert_eq!(extract_chain(&chain, &TrustAnchors::default()).unwrap(), records);
    }

    #[test]
    fn test_shuffled_served_chain_is_walked_by_issuer() {
        let chain = test_chain();
        let served = vec![chain[0].clone(), chain[2].clone(), chain[1].clone()];
        let records = extract_chain(&served, &TrustAnchors::default()).unwrap();
        let names: Vec<_> = records
            .iter()
            .map(|r| r.common_name.clone().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["enabled.example.com", "Test Intermediate", "Test Root CA"]
        );
    }

    #[test]
    fn test_short_chains() {
        assert!(
            extract_chain(&[], &TrustAnchors::default())
                .unwrap()
                .is_empty()
        );
        let chain = test_chain();
        let single = extract_chain(&chain[2..], &TrustAnchors::default()).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].common_name.as_deref(), Some("Test Root CA"));
    }

    #[test]
    fn test_built_in_root_detection() {
        let chain = test_chain();
        let mut anchors = TrustAnchors::default();
        anchors.insert_der(&chain[2]).unwrap();
        let records = extract_chain(&chain, &anchors).unwrap();
        assert_eq!(records[2].is_built_in_root, Some(true));
        assert_eq!(records[0].is_built_in_root, None);

        let mut other = TrustAnchors::default();
        other.insert_der(&chain[0]).unwrap();
        let records = extract_chain(&chain, &other).unwrap();
        assert_eq!(records[2].is_built_in_root, Some(false));
    }

    #[test]
    fn test_garbage_der_is_an_extraction_error() {
        let mut chain = test_chain();
        chain[1] = vec![0x30, 0x03, 0x01];
        assert!(matches!(
            extract_chain(&chain, &TrustAnchors::default()),
            Err(ExtractionError::Parse { index: 1, .. })
        ));
    }

    #[test]
    fn test_fingerprint_format() {
        let chain = test_chain();
        let fp = fingerprint(MessageDigest::sha256(), &chain[0]).unwrap();
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.split(':').all(|byte| byte.len() == 2));
        assert_eq!(fp, fp.to_uppercase());
    }

    #[test]
    fn test_anchors_from_pem_bundle() {
        let chain = test_chain();
        let root = X509::from_der(&chain[2]).unwrap();
        let pem = root.to_pem().unwrap();
        let anchors = TrustAnchors::from_pem_bundle(&pem).unwrap();
        assert_eq!(anchors.len(), 1);
        let fp = fingerprint(MessageDigest::sha256(), &chain[2]).unwrap();
        assert!(anchors.contains(&fp));
    }
}
