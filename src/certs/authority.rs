//! Root and per-host certificate minting for TLS interception
//!
//! The root is loaded from the certificate cache or generated on first run.
//! Leaf certificates are loaded from the cache or minted on demand, signed by
//! the root, persisted, and turned into rustls `ServerConfig`s that are kept
//! in memory per host.

use super::cache::{CertificateCache, StoredCertificate};
use crate::error::CertError;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

const ROOT_COMMON_NAME: &str = "Intercept Proxy Root CA";
const ROOT_ORGANIZATION: &str = "Intercept Proxy";

pub struct CertificateAuthority {
    cache: CertificateCache,

    /// Root certificate used for signing leaves
    root_cert: Certificate,

    root_key: KeyPair,

    /// Root certificate PEM as persisted (the one users trust)
    root_pem: String,

    /// ServerConfig per host, built lazily
    server_configs: DashMap<String, Arc<ServerConfig>>,

    created_root: bool,
}

impl CertificateAuthority {
    /// Load the root from `cache`, or generate and persist a new one
    pub fn load_or_create(cache: CertificateCache) -> Result<Self, CertError> {
        let (root_cert, root_key, root_pem, created_root) = match cache.load_root() {
            Some(stored) => {
                tracing::info!(path = %cache.root_path().display(), "Loading existing root certificate");
                let key = KeyPair::from_pem(&stored.key_pem)
                    .map_err(|e| CertError::Invalid(e.to_string()))?;
                // rcgen cannot parse a certificate back into a signer, so the
                // signing certificate is rebuilt from the same subject and key
                let cert = Self::root_params()?
                    .self_signed(&key)
                    .map_err(|e| CertError::Generation(e.to_string()))?;
                (cert, key, stored.cert_pem, false)
            }
            None => {
                tracing::info!("Generating new root certificate");
                let (cert, key) = Self::generate_root()?;
                let pem = cert.pem();
                cache.save_root(&StoredCertificate::new(pem.clone(), key.serialize_pem()))?;
                // leaves signed by a previous root are useless now
                cache.clear();
                tracing::info!(path = %cache.root_path().display(), "Saved root certificate");
                (cert, key, pem, true)
            }
        };

        Ok(Self {
            cache,
            root_cert,
            root_key,
            root_pem,
            server_configs: DashMap::new(),
            created_root,
        })
    }

    fn root_params() -> Result<CertificateParams, CertError> {
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CertError::Generation(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);
        dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365);

        Ok(params)
    }

    fn generate_root() -> Result<(Certificate, KeyPair), CertError> {
        let key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
        let cert = Self::root_params()?
            .self_signed(&key)
            .map_err(|e| CertError::Generation(e.to_string()))?;
        Ok((cert, key))
    }

    /// Mint a leaf for `subject` signed by the root. IP literals get an IP SAN.
    fn generate_leaf(&self, subject: &str) -> Result<StoredCertificate, CertError> {
        let mut params = CertificateParams::new(vec![subject.to_string()])
            .map_err(|e| CertError::Generation(format!("Invalid subject '{subject}': {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject);
        params.distinguished_name = dn;
        params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(90);

        let key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
        let cert = params
            .signed_by(&key, &self.root_cert, &self.root_key)
            .map_err(|e| CertError::Generation(e.to_string()))?;

        Ok(StoredCertificate::new(cert.pem(), key.serialize_pem()))
    }

    /// Leaf for `subject`, from the cache when possible
    pub fn leaf(&self, subject: &str) -> Result<StoredCertificate, CertError> {
        if let Some(stored) = self.cache.load_leaf(subject) {
            tracing::debug!(subject, "Using cached leaf certificate");
            return Ok(stored);
        }

        tracing::debug!(subject, "Minting leaf certificate");
        let leaf = self.generate_leaf(subject)?;
        if let Err(e) = self.cache.save_leaf(subject, &leaf) {
            // a leaf that cannot be persisted is still usable for this run
            tracing::warn!(subject, error = %e, "Failed to persist leaf certificate");
        }
        Ok(leaf)
    }

    /// rustls server configuration presenting a leaf for `host`
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
        if let Some(config) = self.server_configs.get(host) {
            return Ok(config.clone());
        }

        let leaf = self.leaf(host)?;
        let chain_pem = format!("{}\n{}", leaf.cert_pem.trim_end(), self.root_pem.trim_end());
        let chain = rustls_pemfile::certs(&mut chain_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CertError::Invalid(e.to_string()))?;
        let key = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
            .map_err(|e| CertError::Invalid(e.to_string()))?
            .ok_or_else(|| CertError::Invalid(format!("No private key for '{host}'")))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| CertError::Invalid(e.to_string()))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.server_configs.insert(host.to_string(), config.clone());
        Ok(config)
    }

    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    pub fn root_path(&self) -> PathBuf {
        self.cache.root_path()
    }

    /// Whether this run generated the root (it must be trusted before use)
    pub fn created_root(&self) -> bool {
        self.created_root
    }

    pub fn cache(&self) -> &CertificateCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_root_created_then_reloaded() {
        let dir = TempDir::new().unwrap();

        let first = CertificateAuthority::load_or_create(CertificateCache::new(dir.path())).unwrap();
        assert!(first.created_root());
        assert!(first.root_pem().contains("BEGIN CERTIFICATE"));
        assert!(first.root_path().exists());

        let second =
            CertificateAuthority::load_or_create(CertificateCache::new(dir.path())).unwrap();
        assert!(!second.created_root());
        assert_eq!(first.root_pem(), second.root_pem());
    }

    #[test]
    fn test_leaf_is_persisted_and_reused() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::load_or_create(CertificateCache::new(dir.path())).unwrap();

        let leaf = ca.leaf("api.example.com").unwrap();
        assert!(ca.cache().leaf_path("api.example.com").exists());
        assert_eq!(ca.leaf("api.example.com").unwrap(), leaf);
    }

    #[test]
    fn test_server_config_cached_per_host() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::load_or_create(CertificateCache::new(dir.path())).unwrap();

        let a = ca.server_config("api.example.com").unwrap();
        let b = ca.server_config("api.example.com").unwrap();
        let c = ca.server_config("127.0.0.1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
