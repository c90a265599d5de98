//! Bypass rules: URLs that must not go through a proxy.
//!
//! Supported forms:
//! - `example.com` exact host
//! - `*.example.com` or `.example.com` the domain and any subdomain
//! - `example.com:8443` host and port
//! - `<local>` hosts without a dot
//! - `*` everything

use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    Any,
    Local,
    Host(String),
    Suffix(String),
    HostPort(String, u16),
}

impl Rule {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            return Some(Self::Any);
        }
        if raw == "<local>" {
            return Some(Self::Local);
        }
        if let Some(domain) = raw.strip_prefix("*.").or_else(|| raw.strip_prefix('.')) {
            return Some(Self::Suffix(domain.to_string()));
        }
        if let Some((host, port)) = raw.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Some(Self::HostPort(host.to_string(), port));
            }
        }
        Some(Self::Host(raw))
    }

    fn matches(&self, host: &str, port: Option<u16>) -> bool {
        match self {
            Self::Any => true,
            Self::Local => !host.contains('.') && !host.contains(':'),
            Self::Host(h) => host == h,
            Self::Suffix(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
            Self::HostPort(h, p) => host == h && port == Some(*p),
        }
    }
}

/// A parsed set of bypass rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassRules {
    rules: Vec<Rule>,
}

impl BypassRules {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            rules: patterns.iter().filter_map(|p| Rule::parse(p.as_ref())).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Extend with more patterns.
    pub fn with<S: AsRef<str>>(mut self, patterns: &[S]) -> Self {
        self.rules
            .extend(patterns.iter().filter_map(|p| Rule::parse(p.as_ref())));
        self
    }

    /// True if `url` should bypass the proxy. Unparseable URLs never bypass.
    pub fn matches(&self, url: &str) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
        let port = parsed.port_or_known_default();
        self.rules.iter().any(|r| r.matches(&host, port))
    }
}
