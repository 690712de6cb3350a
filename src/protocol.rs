//! Application-layer protocol identifiers, named by their ALPN tokens.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A protocol this client may speak, identified by its ALPN token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// `http/1.0`: obsolete plaintext framing with no persistent connections.
    Http10,
    /// `http/1.1`: one exchange at a time per connection.
    Http11,
    /// `h2`: binary framing, multiplexed streams, requires TLS + ALPN.
    H2,
    /// `h2_prior_knowledge`: HTTP/2 over cleartext without upgrade.
    H2PriorKnowledge,
    /// `quic`: reserved for an external HTTP/3 transport hook.
    Quic,
    /// `spdy/3.1`: recognized when parsing stored metadata, never selectable.
    Spdy3,
}

impl Protocol {
    /// True for protocols that carry several exchanges concurrently.
    pub fn is_multiplexed(self) -> bool {
        matches!(self, Self::H2 | Self::H2PriorKnowledge)
    }

    /// Validate a protocol list chosen by client configuration.
    ///
    /// `spdy/3.1` parses (legacy cache entries mention it) but is rejected
    /// here; `h2_prior_knowledge` must be the only entry when present.
    pub fn validate_selection(protocols: &[Protocol]) -> Result<()> {
        if protocols.is_empty() {
            return Err(Error::protocol("protocols must not be empty"));
        }
        if protocols.contains(&Protocol::Spdy3) {
            return Err(Error::protocol("spdy/3.1 cannot be selected"));
        }
        if protocols.contains(&Protocol::H2PriorKnowledge) && protocols.len() > 1 {
            return Err(Error::protocol(
                "h2_prior_knowledge cannot be mixed with other protocols",
            ));
        }
        if !protocols.contains(&Protocol::Http11)
            && !protocols.contains(&Protocol::H2PriorKnowledge)
        {
            return Err(Error::protocol("protocols must contain http/1.1"));
        }
        Ok(())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "http/1.0",
            Self::Http11 => "http/1.1",
            Self::H2 => "h2",
            Self::H2PriorKnowledge => "h2_prior_knowledge",
            Self::Quic => "quic",
            Self::Spdy3 => "spdy/3.1",
        }
    }

    /// The `HTTP/x.y` form used in status lines and stored metadata.
    pub fn status_line_token(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
            Self::H2 | Self::H2PriorKnowledge => "HTTP/2",
            Self::Quic => "HTTP/3",
            Self::Spdy3 => "spdy/3.1",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http/1.0" => Ok(Self::Http10),
            "http/1.1" => Ok(Self::Http11),
            "h2" => Ok(Self::H2),
            "h2_prior_knowledge" => Ok(Self::H2PriorKnowledge),
            "quic" => Ok(Self::Quic),
            "spdy/3.1" => Ok(Self::Spdy3),
            other => Err(Error::protocol(format!("unexpected protocol: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        for p in [
            Protocol::Http10,
            Protocol::Http11,
            Protocol::H2,
            Protocol::H2PriorKnowledge,
            Protocol::Quic,
            Protocol::Spdy3,
        ] {
            assert_eq!(p.as_str().parse::<Protocol>().unwrap(), p);
        }
    }

    #[test]
    fn spdy_parses_but_cannot_be_selected() {
        assert_eq!("spdy/3.1".parse::<Protocol>().unwrap(), Protocol::Spdy3);
        assert!(Protocol::validate_selection(&[Protocol::Spdy3, Protocol::Http11]).is_err());
    }

    #[test]
    fn prior_knowledge_is_exclusive() {
        assert!(Protocol::validate_selection(&[Protocol::H2PriorKnowledge]).is_ok());
        assert!(
            Protocol::validate_selection(&[Protocol::H2PriorKnowledge, Protocol::Http11]).is_err()
        );
    }

    #[test]
    fn default_selection_is_valid() {
        assert!(Protocol::validate_selection(&[Protocol::H2, Protocol::Http11]).is_ok());
    }
}
