//! `Cache-Control` directive parsing and rendering.

use std::fmt;

use http::header::HeaderMap;

use crate::headers::parse_seconds;

/// Parsed cache directives from a request or response.
///
/// Numeric fields hold `-1` when the directive is absent. A `max-stale`
/// with no argument means "accept any staleness" and parses to `i64::MAX`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age_secs: i64,
    pub s_max_age_secs: i64,
    pub is_private: bool,
    pub is_public: bool,
    pub must_revalidate: bool,
    pub max_stale_secs: i64,
    pub min_fresh_secs: i64,
    pub only_if_cached: bool,
    pub no_transform: bool,
    pub immutable: bool,
}

impl CacheControl {
    /// Directives forcing a full refresh over the network.
    pub fn force_network() -> Self {
        Self {
            no_cache: true,
            ..Self::absent()
        }
    }

    /// Directives forcing the cache, however stale, and never the network.
    pub fn force_cache() -> Self {
        Self {
            only_if_cached: true,
            max_stale_secs: i64::MAX,
            ..Self::absent()
        }
    }

    fn absent() -> Self {
        Self {
            max_age_secs: -1,
            s_max_age_secs: -1,
            max_stale_secs: -1,
            min_fresh_secs: -1,
            ..Self::default()
        }
    }

    /// Parse all `Cache-Control` headers (and a legacy `Pragma: no-cache`)
    /// from `headers`. Unknown directives are dropped.
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut cc = Self::absent();
        let mut saw_cache_control = false;
        for value in headers.get_all(http::header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            saw_cache_control = true;
            for (directive, argument) in directives(value) {
                match directive.as_str() {
                    "no-cache" => cc.no_cache = true,
                    "no-store" => cc.no_store = true,
                    "max-age" => cc.max_age_secs = parse_seconds(&argument, -1),
                    "s-maxage" => cc.s_max_age_secs = parse_seconds(&argument, -1),
                    "private" => cc.is_private = true,
                    "public" => cc.is_public = true,
                    "must-revalidate" => cc.must_revalidate = true,
                    "max-stale" => {
                        cc.max_stale_secs = if argument.is_empty() {
                            i64::MAX
                        } else {
                            parse_seconds(&argument, -1)
                        };
                    }
                    "min-fresh" => cc.min_fresh_secs = parse_seconds(&argument, -1),
                    "only-if-cached" => cc.only_if_cached = true,
                    "no-transform" => cc.no_transform = true,
                    "immutable" => cc.immutable = true,
                    _ => {}
                }
            }
        }
        // Pragma is honored only when no Cache-Control header is present.
        if !saw_cache_control {
            for value in headers.get_all(http::header::PRAGMA) {
                if value
                    .to_str()
                    .is_ok_and(|v| v.trim().eq_ignore_ascii_case("no-cache"))
                {
                    cc.no_cache = true;
                }
            }
        }
        cc
    }

    /// True when no directive at all is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::absent()
    }
}

/// Split a header value into `(directive, argument)` pairs, handling
/// quoted arguments.
fn directives(value: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = value;
    while !rest.is_empty() {
        let (token, remaining) = next_directive(rest);
        rest = remaining;
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('=') {
            Some((name, arg)) => out.push((
                name.trim().to_ascii_lowercase(),
                arg.trim().trim_matches('"').to_string(),
            )),
            None => out.push((token.to_ascii_lowercase(), String::new())),
        }
    }
    out
}

fn next_directive(value: &str) -> (&str, &str) {
    let mut in_quotes = false;
    for (i, b) in value.bytes().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => return (&value[..i], &value[i + 1..]),
            _ => {}
        }
    }
    (value, "")
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut write = |f: &mut fmt::Formatter<'_>, s: &str| -> fmt::Result {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            f.write_str(s)
        };
        if self.no_cache {
            write(f, "no-cache")?;
        }
        if self.no_store {
            write(f, "no-store")?;
        }
        if self.max_age_secs != -1 {
            write(f, &format!("max-age={}", self.max_age_secs))?;
        }
        if self.s_max_age_secs != -1 {
            write(f, &format!("s-maxage={}", self.s_max_age_secs))?;
        }
        if self.is_private {
            write(f, "private")?;
        }
        if self.is_public {
            write(f, "public")?;
        }
        if self.must_revalidate {
            write(f, "must-revalidate")?;
        }
        if self.max_stale_secs != -1 {
            if self.max_stale_secs == i64::MAX {
                write(f, "max-stale")?;
            } else {
                write(f, &format!("max-stale={}", self.max_stale_secs))?;
            }
        }
        if self.min_fresh_secs != -1 {
            write(f, &format!("min-fresh={}", self.min_fresh_secs))?;
        }
        if self.only_if_cached {
            write(f, "only-if-cached")?;
        }
        if self.no_transform {
            write(f, "no-transform")?;
        }
        if self.immutable {
            write(f, "immutable")?;
        }
        Ok(())
    }
}
