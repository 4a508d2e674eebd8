// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The authentication seam. Mechanism evaluation is pluggable in principle;
//! this daemon ships PLAIN, with credentials optionally pinned in the
//! configuration. Without configured credentials any well-formed PLAIN
//! exchange is accepted, which is the development and test mode.

/// Mechanisms advertised by SASL_LIST_MECHS.
pub const MECHANISMS: &str = "PLAIN";

/// Outcome of evaluating an authentication exchange.
#[derive(Debug, PartialEq, Eq)]
pub enum SaslOutcome {
    /// authentication complete
    Ok { username: String },
    /// mechanism wants another round trip
    Continue,
    /// bad mechanism or bad credentials
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct PlainAuthenticator {
    username: Option<String>,
    password: Option<String>,
}

impl PlainAuthenticator {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self { username, password }
    }

    pub fn from_config<T: config::SaslConfig>(config: &T) -> Self {
        let sasl = config.sasl();
        Self::new(
            sasl.username().map(|s| s.to_string()),
            sasl.password().map(|s| s.to_string()),
        )
    }

    /// Evaluate the initial (and for PLAIN, only) client message:
    /// `authzid \0 authcid \0 password`.
    pub fn start(&self, mechanism: &str, data: &[u8]) -> SaslOutcome {
        if !mechanism.trim().eq_ignore_ascii_case("PLAIN") {
            return SaslOutcome::Failed;
        }

        let mut parts = data.split(|b| *b == 0);
        let _authzid = match parts.next() {
            Some(p) => p,
            None => return SaslOutcome::Failed,
        };
        let authcid = match parts.next().map(String::from_utf8_lossy) {
            Some(name) if !name.is_empty() => name.into_owned(),
            _ => return SaslOutcome::Failed,
        };
        let password = parts.next().map(String::from_utf8_lossy).unwrap_or_default();

        if let Some(expected) = &self.username {
            if &authcid != expected {
                return SaslOutcome::Failed;
            }
            if self.password.as_deref().unwrap_or("") != password {
                return SaslOutcome::Failed;
            }
        }

        SaslOutcome::Ok { username: authcid }
    }

    /// PLAIN completes in one round; any continuation is a protocol error by
    /// the client.
    pub fn step(&self, _mechanism: &str, _data: &[u8]) -> SaslOutcome {
        SaslOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mode_accepts_any_user() {
        let auth = PlainAuthenticator::default();
        assert_eq!(
            auth.start("PLAIN", b"\0someone\0whatever"),
            SaslOutcome::Ok {
                username: "someone".to_string()
            }
        );
    }

    #[test]
    fn pinned_credentials() {
        let auth =
            PlainAuthenticator::new(Some("admin".to_string()), Some("secret".to_string()));
        assert_eq!(
            auth.start("PLAIN", b"\0admin\0secret"),
            SaslOutcome::Ok {
                username: "admin".to_string()
            }
        );
        assert_eq!(auth.start("PLAIN", b"\0admin\0wrong"), SaslOutcome::Failed);
        assert_eq!(auth.start("PLAIN", b"\0other\0secret"), SaslOutcome::Failed);
    }

    #[test]
    fn rejects_unknown_mechanism() {
        let auth = PlainAuthenticator::default();
        assert_eq!(auth.start("SCRAM-SHA1", b"\0a\0b"), SaslOutcome::Failed);
        assert_eq!(auth.step("PLAIN", b""), SaslOutcome::Failed);
    }

    #[test]
    fn malformed_exchange() {
        let auth = PlainAuthenticator::default();
        assert_eq!(auth.start("PLAIN", b""), SaslOutcome::Failed);
        assert_eq!(auth.start("PLAIN", b"no-separators"), SaslOutcome::Failed);
    }
}
