use anyhow::{Context, Result};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyUsagePurpose,
    SanType, PKCS_ECDSA_P256_SHA256,
};
use rustls::{Certificate, PrivateKey, RootCertStore};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;

/// Loads a certificate chain from a PEM file
pub fn load_cert(path: impl AsRef<Path>) -> Result<Vec<Certificate>> {
    let file = File::open(path.as_ref())
        .context(format!("Failed to open certificate file: {:?}", path.as_ref()))?;

    let mut reader = BufReader::new(file);

    let certs: Vec<Certificate> = certs(&mut reader)?
        .into_iter()
        .map(Certificate)
        .collect();

    if certs.is_empty() {
        anyhow::bail!("No certificates found in file: {:?}", path.as_ref());
    }

    Ok(certs)
}

/// Loads a PKCS#8 private key from a PEM file
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKey> {
    let file = File::open(path.as_ref())
        .context(format!("Failed to open private key file: {:?}", path.as_ref()))?;

    let mut reader = BufReader::new(file);

    let mut keys = pkcs8_private_keys(&mut reader)?;

    if keys.is_empty() {
        anyhow::bail!("No private keys found in file: {:?}", path.as_ref());
    }

    if keys.len() > 1 {
        tracing::warn!("Multiple keys found in file, using first one: {:?}", path.as_ref());
    }

    Ok(PrivateKey(keys.remove(0)))
}

/// Loads every certificate in a PEM file into a RootCertStore
pub fn load_ca_cert(path: impl AsRef<Path>) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();

    for cert in load_cert(path.as_ref()).context("Failed to load CA certificate")? {
        root_store
            .add(&cert)
            .context("Failed to add CA certificate to root store")?;
    }

    Ok(root_store)
}

/// Generates a self-signed ECDSA P-256 certificate valid for `hosts`.
///
/// The first host becomes the common name. IP literals are added as IP
/// SANs, everything else as DNS names. The certificate is usable for both
/// server and client authentication, so one file pair serves both ends of
/// the demo. Returns `(cert_pem, key_pem)`.
pub fn generate_self_signed(hosts: &[&str]) -> Result<(String, String)> {
    let Some(common_name) = hosts.first() else {
        anyhow::bail!("At least one host is required");
    };

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, *common_name);
    dn.push(DnType::OrganizationName, "multiplex");
    params.distinguished_name = dn;

    params.subject_alt_names = hosts
        .iter()
        .map(|host| match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string()),
        })
        .collect();

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    // One year
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(365);

    params.alg = &PKCS_ECDSA_P256_SHA256;

    let cert = rcgen::Certificate::from_params(params)
        .context("Failed to generate certificate")?;

    let cert_pem = cert.serialize_pem().context("Failed to serialize certificate")?;
    let key_pem = cert.serialize_private_key_pem();

    Ok((cert_pem, key_pem))
}
