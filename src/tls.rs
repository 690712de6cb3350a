//! TLS handshake snapshots, cipher-suite identities, and TLS versions.
//!
//! The TLS socket itself is an external collaborator; this module carries
//! the data the core needs from a completed handshake: what was negotiated
//! and which certificates the peer presented.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;

use crate::error::{Error, Result};

/// A cipher suite, identified by its Java/IANA-form name.
///
/// Instances are interned process-wide so equality and hashing compare a
/// canonical form: the `TLS_`/`SSL_` prefix is ignored, thus
/// `TLS_RSA_WITH_AES_128_CBC_SHA == SSL_RSA_WITH_AES_128_CBC_SHA`.
#[derive(Clone)]
pub struct CipherSuite {
    name: Arc<str>,
}

fn intern_table() -> &'static Mutex<HashMap<String, Arc<str>>> {
    static TABLE: OnceLock<Mutex<HashMap<String, Arc<str>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn canonical_form(name: &str) -> &str {
    name.strip_prefix("TLS_")
        .or_else(|| name.strip_prefix("SSL_"))
        .unwrap_or(name)
}

impl CipherSuite {
    /// Look up or create the interned cipher suite for `name`.
    pub fn from_name(name: &str) -> Self {
        let key = canonical_form(name).to_string();
        let mut table = intern_table().lock().unwrap_or_else(|e| e.into_inner());
        let interned = table
            .entry(key)
            .or_insert_with(|| Arc::from(name))
            .clone();
        Self { name: interned }
    }

    /// The name this suite was first interned under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for CipherSuite {
    fn eq(&self, other: &Self) -> bool {
        canonical_form(&self.name) == canonical_form(&other.name)
    }
}

impl Eq for CipherSuite {}

impl std::hash::Hash for CipherSuite {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        canonical_form(&self.name).hash(state);
    }
}

impl fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// TLS protocol versions, named as in stored cache metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    Ssl30,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn java_name(self) -> &'static str {
        match self {
            Self::Ssl30 => "SSLv3",
            Self::Tls10 => "TLSv1",
            Self::Tls11 => "TLSv1.1",
            Self::Tls12 => "TLSv1.2",
            Self::Tls13 => "TLSv1.3",
        }
    }

    pub fn from_java_name(name: &str) -> Result<Self> {
        match name {
            "SSLv3" => Ok(Self::Ssl30),
            "TLSv1" => Ok(Self::Tls10),
            "TLSv1.1" => Ok(Self::Tls11),
            "TLSv1.2" => Ok(Self::Tls12),
            "TLSv1.3" => Ok(Self::Tls13),
            other => Err(Error::tls(format!("unexpected TLS version: {other}"))),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.java_name())
    }
}

/// A certificate presented during a handshake.
///
/// The TLS collaborator supplies the DER encoding, the DER-encoded
/// SubjectPublicKeyInfo (what pins hash), and the subject alternative
/// names (what connection coalescing matches hostnames against).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub der: Bytes,
    pub subject_public_key_info: Bytes,
    pub subject_alt_names: Vec<String>,
}

impl Certificate {
    pub fn new(der: impl Into<Bytes>, spki: impl Into<Bytes>) -> Self {
        Self {
            der: der.into(),
            subject_public_key_info: spki.into(),
            subject_alt_names: Vec::new(),
        }
    }

    pub fn with_subject_alt_names(mut self, names: Vec<String>) -> Self {
        self.subject_alt_names = names;
        self
    }

    /// Whether this certificate covers `hostname` via its alt names,
    /// honoring a single leading `*.` wildcard label.
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        self.subject_alt_names.iter().any(|san| {
            let san = san.to_ascii_lowercase();
            if let Some(suffix) = san.strip_prefix("*.") {
                match hostname.split_once('.') {
                    Some((label, rest)) => !label.is_empty() && rest == suffix,
                    None => false,
                }
            } else {
                san == hostname
            }
        })
    }
}

/// Record of a completed TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub tls_version: TlsVersion,
    pub cipher_suite: CipherSuite,
    pub peer_certificates: Vec<Certificate>,
    pub local_certificates: Vec<Certificate>,
}

impl Handshake {
    pub fn new(tls_version: TlsVersion, cipher_suite: CipherSuite) -> Self {
        Self {
            tls_version,
            cipher_suite,
            peer_certificates: Vec::new(),
            local_certificates: Vec::new(),
        }
    }

    pub fn with_peer_certificates(mut self, certs: Vec<Certificate>) -> Self {
        self.peer_certificates = certs;
        self
    }

    pub fn with_local_certificates(mut self, certs: Vec<Certificate>) -> Self {
        self.local_certificates = certs;
        self
    }
}
