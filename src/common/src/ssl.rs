// Copyright 2023 The Skua Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use config::TlsConfig;

use rustls::{Certificate, PrivateKey, ServerConfig};

use std::fs::File;
use std::io::{BufReader, Error, ErrorKind, Result};
use std::sync::Arc;

/// Build a TLS acceptor from the configuration. Returns `None` when TLS is
/// not configured, an error when it is configured incorrectly.
pub fn tls_acceptor(config: &config::Tls) -> Result<Option<net::TlsAcceptor>> {
    let (chain, key) = match (config.certificate_chain(), config.private_key()) {
        (Some(chain), Some(key)) => (chain, key),
        (None, None) => return Ok(None),
        _ => {
            return Err(Error::new(
                ErrorKind::Other,
                "tls requires both certificate_chain and private_key",
            ));
        }
    };

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(chain)?))?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(Error::new(ErrorKind::Other, "no certificates in chain"));
    }

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(key)?))?;
    let key = match keys.pop() {
        Some(key) => PrivateKey(key),
        None => return Err(Error::new(ErrorKind::Other, "no private key found")),
    };

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::new(ErrorKind::Other, e))?;

    Ok(Some(net::TlsAcceptor::new(Arc::new(config))))
}

/// Convenience wrapper taking anything which carries a TLS section.
pub fn tls_acceptor_for<T: TlsConfig>(config: &T) -> Result<Option<net::TlsAcceptor>> {
    tls_acceptor(config.tls())
}
