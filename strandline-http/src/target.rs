//! Target identity: where a request goes and how the channel is secured.
//!
//! Two requests share pooled connections and breaker state only when their
//! targets are equal, which includes the full security identity.

use std::fmt;
use std::path::PathBuf;

use crate::error::HttpError;

/// Transport security for a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Security {
    Plain,
    Secure {
        /// Verify the server certificate chain and name.
        verify_peer: bool,
        /// PEM file of trust anchors replacing the built-in roots.
        trust_anchor: Option<PathBuf>,
    },
}

/// A server endpoint plus its transport security.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
    security: Security,
}

impl Target {
    /// Cleartext HTTP target.
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            security: Security::Plain,
        }
    }

    /// TLS target verified against the built-in web PKI roots.
    pub fn secure(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            security: Security::Secure {
                verify_peer: true,
                trust_anchor: None,
            },
        }
    }

    /// Verify against the certificates in a PEM file instead of the
    /// built-in roots. No effect on plain targets.
    pub fn with_trust_anchor(mut self, pem: impl Into<PathBuf>) -> Self {
        if let Security::Secure { trust_anchor, .. } = &mut self.security {
            *trust_anchor = Some(pem.into());
        }
        self
    }

    /// Skip certificate verification. No effect on plain targets.
    pub fn without_verification(mut self) -> Self {
        if let Security::Secure { verify_peer, .. } = &mut self.security {
            *verify_peer = false;
        }
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.security, Security::Secure { .. })
    }

    pub fn scheme(&self) -> &'static str {
        if self.is_secure() { "https" } else { "http" }
    }

    fn default_port(&self) -> u16 {
        if self.is_secure() { 443 } else { 80 }
    }

    /// `host` or `host:port` when the port is not the scheme default.
    /// Used for `Host` and `:authority`.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// Encodes verification mode and trust anchor, e.g.
    /// `verify=on;anchor=/etc/ca.pem`. Plain targets yield `plain`.
    pub fn security_identity(&self) -> String {
        match &self.security {
            Security::Plain => "plain".to_string(),
            Security::Secure {
                verify_peer,
                trust_anchor,
            } => {
                let mut id = format!("verify={}", if *verify_peer { "on" } else { "off" });
                if let Some(path) = trust_anchor {
                    id.push_str(";anchor=");
                    id.push_str(&path.to_string_lossy());
                }
                id
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), HttpError> {
        if self.host.is_empty() {
            return Err(HttpError::InvalidArgument("target host is empty".into()));
        }
        if self
            .host
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control() || b == b'/')
        {
            return Err(HttpError::InvalidArgument(format!(
                "invalid target host {:?}",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(HttpError::InvalidArgument("target port is 0".into()));
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn authority_omits_default_port() {
        assert_eq!(Target::plain("example.com", 80).authority(), "example.com");
        assert_eq!(
            Target::plain("example.com", 8080).authority(),
            "example.com:8080"
        );
        assert_eq!(Target::secure("example.com", 443).authority(), "example.com");
        assert_eq!(Target::secure("::1", 8443).authority(), "[::1]:8443");
    }

    #[test]
    fn security_identity_strings() {
        assert_eq!(Target::plain("a", 80).security_identity(), "plain");
        assert_eq!(Target::secure("a", 443).security_identity(), "verify=on");
        assert_eq!(
            Target::secure("a", 443)
                .with_trust_anchor("/etc/ca.pem")
                .security_identity(),
            "verify=on;anchor=/etc/ca.pem"
        );
        assert_eq!(
            Target::secure("a", 443)
                .without_verification()
                .security_identity(),
            "verify=off"
        );
    }

    #[test]
    fn identity_distinguishes_security() {
        let mut set = HashSet::new();
        set.insert(Target::secure("a", 443));
        set.insert(Target::secure("a", 443).without_verification());
        set.insert(Target::secure("a", 443).with_trust_anchor("/ca.pem"));
        set.insert(Target::plain("a", 443));
        set.insert(Target::secure("a", 443));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn plain_ignores_tls_options() {
        let target = Target::plain("a", 80).with_trust_anchor("/ca.pem");
        assert_eq!(target, Target::plain("a", 80));
    }

    #[test]
    fn validation() {
        assert!(Target::plain("", 80).validate().is_err());
        assert!(Target::plain("a b", 80).validate().is_err());
        assert!(Target::plain("a\r\nX-Injected: 1", 80).validate().is_err());
        assert!(Target::plain("a", 0).validate().is_err());
        Target::plain("localhost", 8080).validate().unwrap();
    }
}
