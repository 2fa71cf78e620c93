//! Certificate Authority. Mints per-host leaf certificates signed by a
//! long-lived local root CA so the MITM TLS engine in `conn.rs` can
//! terminate a client's TLS session under any hostname.
//!
//! Grounded in `examples/Distracted-E421-nixos-cursor`'s
//! `generate_ca`/`load_ca`/`generate_cert_for_domain`
//! (`rcgen::CertificateParams` + `signed_by`/`self_signed`), generalized
//! from one hardcoded domain to an arbitrary-host cache.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;

use crate::error::{ProxyError, ProxyResult};

const CA_COMMON_NAME: &str = "Proxy CA";
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
const RSA_KEY_BITS: usize = 2048;

/// Cached leaf material for one host.
#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

pub struct CertificateAuthority {
    cert_dir: PathBuf,
    ca_key: KeyPair,
    ca_cert: Certificate,
    /// host -> single-flight cell resolving to the minted leaf. Concurrent
    /// mints for the same host join the same cell rather than racing.
    cache: DashMap<String, Arc<OnceCell<LeafEntry>>>,
}

fn ca_params() -> Result<CertificateParams, rcgen::Error> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
    Ok(params)
}

fn generate_rsa_keypair(host: &str) -> ProxyResult<KeyPair> {
    let mut rng = rand::rngs::OsRng;
    let private_key = rsa::RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    KeyPair::from_der(der.as_bytes()).map_err(|e| ProxyError::CertMintFailed {
        host: host.to_string(),
        source: e,
    })
}

async fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

impl CertificateAuthority {
    /// Idempotent: loads `{cert_dir}/ca.{key,crt}` if both exist, else
    /// generates and persists a fresh root CA. Fails on I/O or
    /// cryptographic error, and on the disallowed half-present state where
    /// exactly one of the two files exists.
    pub async fn ensure_ca(cert_dir: impl Into<PathBuf>) -> ProxyResult<Self> {
        let cert_dir = cert_dir.into();
        tokio::fs::create_dir_all(&cert_dir).await?;

        let key_path = cert_dir.join("ca.key");
        let cert_path = cert_dir.join("ca.crt");
        let key_exists = tokio::fs::try_exists(&key_path).await.unwrap_or(false);
        let cert_exists = tokio::fs::try_exists(&cert_path).await.unwrap_or(false);

        let (ca_key, ca_cert) = match (key_exists, cert_exists) {
            (true, true) => {
                let key_pem = tokio::fs::read_to_string(&key_path).await?;
                let ca_key = KeyPair::from_pem(&key_pem).map_err(|e| ProxyError::CertMintFailed {
                    host: "<ca>".into(),
                    source: e,
                })?;
                // Only the key material matters for signing leaves; the
                // params are reconstructed identically to describe the
                // same issuer rather than persisted and reparsed.
                let params = ca_params()?;
                let ca_cert = params
                    .self_signed(&ca_key)
                    .map_err(|e| ProxyError::CertMintFailed {
                        host: "<ca>".into(),
                        source: e,
                    })?;
                (ca_key, ca_cert)
            }
            (false, false) => {
                let ca_key = generate_rsa_keypair("<ca>")?;
                let params = ca_params()?;
                let ca_cert = params
                    .self_signed(&ca_key)
                    .map_err(|e| ProxyError::CertMintFailed {
                        host: "<ca>".into(),
                        source: e,
                    })?;
                write_atomically(&key_path, ca_key.serialize_pem().as_bytes()).await?;
                write_atomically(&cert_path, ca_cert.pem().as_bytes()).await?;
                (ca_key, ca_cert)
            }
            _ => {
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "CA key and cert files must both exist or neither exist",
                )));
            }
        };

        Ok(Self {
            cert_dir,
            ca_key,
            ca_cert,
            cache: DashMap::new(),
        })
    }

    /// Returns the cached leaf for `host`, minting and persisting one if
    /// absent. Concurrent calls for the same host share one mint.
    pub async fn get_leaf(&self, host: &str) -> ProxyResult<(PathBuf, PathBuf)> {
        let cell = self
            .cache
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let entry = cell
            .get_or_try_init(|| self.mint_leaf(host))
            .await?
            .clone();
        Ok((entry.cert_path, entry.key_path))
    }

    async fn mint_leaf(&self, host: &str) -> ProxyResult<LeafEntry> {
        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into().map_err(|_| ProxyError::CertMintFailed {
                host: host.to_string(),
                source: rcgen::Error::InvalidNameType,
            })?),
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];

        let mut serial_bytes = [0u8; 20];
        rand::rngs::OsRng.fill_bytes(&mut serial_bytes);
        params.serial_number = Some(SerialNumber::from_slice(&serial_bytes));

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair = generate_rsa_keypair(host)?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::CertMintFailed {
                host: host.to_string(),
                source: e,
            })?;

        let cert_path = self.cert_dir.join(format!("{host}.crt"));
        let key_path = self.cert_dir.join(format!("{host}.key"));
        write_atomically(&cert_path, cert.pem().as_bytes()).await?;
        write_atomically(&key_path, key_pair.serialize_pem().as_bytes()).await?;

        Ok(LeafEntry {
            cert_path,
            key_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[tokio::test]
    async fn mints_leaf_with_matching_cn_and_san() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::ensure_ca(dir.path()).await.unwrap();
        let (cert_path, key_path) = ca.get_leaf("example.org").await.unwrap();
        assert!(tokio::fs::try_exists(&cert_path).await.unwrap());
        assert!(tokio::fs::try_exists(&key_path).await.unwrap());

        let pem = std::fs::read(&cert_path).unwrap();
        let (_, pem) = x509_parser::pem::parse_x509_pem(&pem).unwrap();
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap();
        assert_eq!(cn, "example.org");
    }

    #[tokio::test]
    async fn repeat_get_leaf_reuses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::ensure_ca(dir.path()).await.unwrap();
        let first = ca.get_leaf("example.org").await.unwrap();
        let second = ca.get_leaf("example.org").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ensure_ca_is_idempotent_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let _first = CertificateAuthority::ensure_ca(dir.path()).await.unwrap();
        let ca_key_bytes = tokio::fs::read(dir.path().join("ca.key")).await.unwrap();
        let _second = CertificateAuthority::ensure_ca(dir.path()).await.unwrap();
        let ca_key_bytes_after = tokio::fs::read(dir.path().join("ca.key")).await.unwrap();
        assert_eq!(ca_key_bytes, ca_key_bytes_after);
    }
}
