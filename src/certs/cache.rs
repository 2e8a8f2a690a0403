//! On-disk certificate cache
//!
//! The filesystem is the source of truth: nothing is held in memory here. The
//! root lives in a fixed file, leaves live under `crts/` named after their
//! subject. Each file holds the certificate PEM followed by its private key PEM.

use crate::error::CertError;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "intercept-proxy";
const ROOT_FILE: &str = "rootCert.pem";
const LEAF_DIR: &str = "crts";

/// A certificate and its private key, both PEM encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

impl StoredCertificate {
    pub fn new(cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    fn to_file_contents(&self) -> String {
        let mut out = String::with_capacity(self.cert_pem.len() + self.key_pem.len() + 1);
        out.push_str(self.cert_pem.trim_end());
        out.push('\n');
        out.push_str(self.key_pem.trim_end());
        out.push('\n');
        out
    }

    /// Split a cache file back into certificate and key. Anything that does not
    /// parse as at least one certificate plus one private key is rejected.
    fn from_file_contents(contents: &str) -> Option<Self> {
        let mut cert_pem = String::new();
        let mut key_pem = None;

        for (label, block) in pem_blocks(contents) {
            if label == "CERTIFICATE" {
                cert_pem.push_str(block);
                cert_pem.push('\n');
            } else if label.ends_with("PRIVATE KEY") && key_pem.is_none() {
                key_pem = Some(format!("{block}\n"));
            }
        }

        let key_pem = key_pem?;
        let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .ok()?;
        if certs.is_empty() {
            return None;
        }
        rustls_pemfile::private_key(&mut key_pem.as_bytes()).ok()??;

        Some(Self { cert_pem, key_pem })
    }
}

/// Yields `(label, full block text)` for every PEM block in `text`
fn pem_blocks(text: &str) -> Vec<(&str, &str)> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("-----BEGIN ") {
        let after_begin = &rest[start + "-----BEGIN ".len()..];
        let Some(label_end) = after_begin.find("-----") else {
            break;
        };
        let label = &after_begin[..label_end];
        let end_marker = format!("-----END {label}-----");
        let Some(end) = rest[start..].find(&end_marker) else {
            break;
        };
        let block_end = start + end + end_marker.len();
        blocks.push((label, &rest[start..block_end]));
        rest = &rest[block_end..];
    }

    blocks
}

/// Leaf file name for a subject; wildcards and separators are not portable
fn leaf_file_name(subject: &str) -> String {
    let name: String = subject
        .chars()
        .map(|c| match c {
            '*' => '_',
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' => c,
            _ => '_',
        })
        .collect();
    format!("{name}.pem")
}

#[derive(Debug, Clone)]
pub struct CertificateCache {
    dir: PathBuf,
}

impl CertificateCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Use `dir_override` when given, else the OS application-data directory,
    /// else the directory of the running executable.
    pub fn resolve(dir_override: Option<&Path>) -> Result<Self, CertError> {
        if let Some(dir) = dir_override {
            return Ok(Self::new(dir));
        }

        if let Some(data) = dirs::data_dir() {
            return Ok(Self::new(data.join(APP_DIR)));
        }

        let exe = std::env::current_exe()?;
        exe.parent()
            .map(Self::new)
            .ok_or(CertError::NoStorageDir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root_path(&self) -> PathBuf {
        self.dir.join(ROOT_FILE)
    }

    pub fn leaf_dir(&self) -> PathBuf {
        self.dir.join(LEAF_DIR)
    }

    pub fn leaf_path(&self, subject: &str) -> PathBuf {
        self.leaf_dir().join(leaf_file_name(subject))
    }

    pub fn load_root(&self) -> Option<StoredCertificate> {
        Self::load(&self.root_path())
    }

    pub fn save_root(&self, cert: &StoredCertificate) -> Result<(), CertError> {
        Self::save(&self.root_path(), cert)
    }

    pub fn load_leaf(&self, subject: &str) -> Option<StoredCertificate> {
        Self::load(&self.leaf_path(subject))
    }

    pub fn save_leaf(&self, subject: &str, cert: &StoredCertificate) -> Result<(), CertError> {
        Self::save(&self.leaf_path(subject), cert)
    }

    /// Delete every cached leaf. Errors are ignored: leaves can always be
    /// minted again from the root.
    pub fn clear(&self) {
        let dir = self.leaf_dir();
        match fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!(dir = %dir.display(), "Cleared leaf certificate cache"),
            Err(e) => tracing::trace!(dir = %dir.display(), error = %e, "Leaf cache not cleared"),
        }
    }

    fn load(path: &Path) -> Option<StoredCertificate> {
        let contents = fs::read_to_string(path).ok()?;
        let parsed = StoredCertificate::from_file_contents(&contents);
        if parsed.is_none() {
            tracing::warn!(path = %path.display(), "Ignoring unparseable certificate file");
        }
        parsed
    }

    fn save(path: &Path, cert: &StoredCertificate) -> Result<(), CertError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, cert.to_file_contents())?;
        Ok(())
    }
}
