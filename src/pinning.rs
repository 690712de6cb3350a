//! Certificate pinning: constrain which peer certificates are accepted
//! for a host, by SPKI hash.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::tls::Certificate;

/// Hash algorithm a pin uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinAlgorithm {
    Sha1,
    Sha256,
}

impl PinAlgorithm {
    fn prefix(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1/",
            Self::Sha256 => "sha256/",
        }
    }

    fn hash(self, spki: &[u8]) -> Bytes {
        match self {
            Self::Sha1 => Bytes::copy_from_slice(&Sha1::digest(spki)),
            Self::Sha256 => Bytes::copy_from_slice(&Sha256::digest(spki)),
        }
    }
}

/// One pin: a host pattern, an algorithm, and the expected SPKI hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePin {
    pattern: String,
    algorithm: PinAlgorithm,
    hash: Bytes,
}

impl CertificatePin {
    /// Parse `pin` in `sha256/<base64>` or `sha1/<base64>` form.
    pub fn new(pattern: impl Into<String>, pin: &str) -> Result<Self> {
        let pattern = pattern.into();
        let (algorithm, encoded) = if let Some(rest) = pin.strip_prefix("sha256/") {
            (PinAlgorithm::Sha256, rest)
        } else if let Some(rest) = pin.strip_prefix("sha1/") {
            (PinAlgorithm::Sha1, rest)
        } else {
            return Err(Error::tls(format!("pins must start with sha256/ or sha1/: {pin}")));
        };
        let hash = BASE64
            .decode(encoded)
            .map_err(|e| Error::tls(format!("invalid pin hash {pin}: {e}")))?;
        Ok(Self {
            pattern,
            algorithm,
            hash: Bytes::from(hash),
        })
    }

    /// Pattern grammar: exact host; `*.H` matches exactly one extra label;
    /// `**.H` matches any number of extra labels, including zero.
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        let pattern = self.pattern.to_ascii_lowercase();
        if let Some(suffix) = pattern.strip_prefix("**.") {
            hostname == suffix
                || hostname
                    .strip_suffix(suffix)
                    .is_some_and(|head| head.ends_with('.') && head.len() > 1)
        } else if let Some(suffix) = pattern.strip_prefix("*.") {
            match hostname.split_once('.') {
                Some((label, rest)) => !label.is_empty() && rest == suffix,
                None => false,
            }
        } else {
            hostname == pattern
        }
    }

    fn render_hash(&self) -> String {
        format!("{}{}", self.algorithm.prefix(), BASE64.encode(&self.hash))
    }
}

impl fmt::Display for CertificatePin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.pattern, self.render_hash())
    }
}

/// Normalizes a presented chain into an ordered path from the leaf to a
/// trust anchor. The real implementation lives with the TLS collaborator.
pub trait ChainCleaner: Send + Sync {
    fn clean(&self, chain: &[Certificate], hostname: &str) -> Result<Vec<Certificate>>;
}

/// Cleaner that trusts the presented order.
#[derive(Debug, Default, Clone, Copy)]
pub struct PresentedOrderChainCleaner;

impl ChainCleaner for PresentedOrderChainCleaner {
    fn clean(&self, chain: &[Certificate], _hostname: &str) -> Result<Vec<Certificate>> {
        Ok(chain.to_vec())
    }
}

/// Validates peer certificate chains against pinned SPKI hashes.
pub struct CertificatePinner {
    pins: Vec<CertificatePin>,
    chain_cleaner: Arc<dyn ChainCleaner>,
}

impl CertificatePinner {
    pub fn builder() -> CertificatePinnerBuilder {
        CertificatePinnerBuilder::default()
    }

    /// A pinner with no pins: every chain passes.
    pub fn empty() -> Self {
        Self {
            pins: Vec::new(),
            chain_cleaner: Arc::new(PresentedOrderChainCleaner),
        }
    }

    pub fn has_pins(&self) -> bool {
        !self.pins.is_empty()
    }

    /// Pins whose pattern matches `hostname`.
    pub fn pins_for_host(&self, hostname: &str) -> Vec<&CertificatePin> {
        self.pins
            .iter()
            .filter(|pin| pin.matches_hostname(hostname))
            .collect()
    }

    /// Check `chain` against the pins for `hostname`.
    ///
    /// Passes when no pin matches the hostname, or when any certificate in
    /// the cleaned chain hashes to any matching pin. Fails otherwise with
    /// a message enumerating what was presented and what was expected.
    pub fn check(&self, hostname: &str, chain: &[Certificate]) -> Result<()> {
        let pins = self.pins_for_host(hostname);
        if pins.is_empty() {
            return Ok(());
        }
        let chain = self.chain_cleaner.clean(chain, hostname)?;

        for certificate in &chain {
            // Hash only with the algorithms the matching pins name.
            let mut sha1_hash: Option<Bytes> = None;
            let mut sha256_hash: Option<Bytes> = None;
            for pin in &pins {
                let computed = match pin.algorithm {
                    PinAlgorithm::Sha1 => sha1_hash.get_or_insert_with(|| {
                        PinAlgorithm::Sha1.hash(&certificate.subject_public_key_info)
                    }),
                    PinAlgorithm::Sha256 => sha256_hash.get_or_insert_with(|| {
                        PinAlgorithm::Sha256.hash(&certificate.subject_public_key_info)
                    }),
                };
                if constant_time_eq(computed, &pin.hash) {
                    return Ok(());
                }
            }
        }

        let mut message = String::from("\n  Peer certificate chain:");
        for certificate in &chain {
            let hash = PinAlgorithm::Sha256.hash(&certificate.subject_public_key_info);
            message.push_str("\n    sha256/");
            message.push_str(&BASE64.encode(&hash));
        }
        message.push_str("\n  Pinned certificates for ");
        message.push_str(hostname);
        message.push(':');
        for pin in &pins {
            message.push_str("\n    ");
            message.push_str(&pin.render_hash());
        }
        Err(Error::TlsPinning(message))
    }
}

impl fmt::Debug for CertificatePinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificatePinner")
            .field("pins", &self.pins)
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Builder for [`CertificatePinner`].
#[derive(Default)]
pub struct CertificatePinnerBuilder {
    pins: Vec<CertificatePin>,
    chain_cleaner: Option<Arc<dyn ChainCleaner>>,
}

impl CertificatePinnerBuilder {
    pub fn add(mut self, pattern: &str, pin: &str) -> Result<Self> {
        self.pins.push(CertificatePin::new(pattern, pin)?);
        Ok(self)
    }

    pub fn chain_cleaner(mut self, cleaner: Arc<dyn ChainCleaner>) -> Self {
        self.chain_cleaner = Some(cleaner);
        self
    }

    pub fn build(self) -> CertificatePinner {
        CertificatePinner {
            pins: self.pins,
            chain_cleaner: self
                .chain_cleaner
                .unwrap_or_else(|| Arc::new(PresentedOrderChainCleaner)),
        }
    }
}
