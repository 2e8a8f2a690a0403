//! Certificates needed to intercept encrypted connections

pub mod authority;
pub mod cache;

pub use authority::CertificateAuthority;
pub use cache::{CertificateCache, StoredCertificate};
