/*
 * net.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portiere, an asynchronous HTTP and WebSocket server.
 *
 * Portiere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portiere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portiere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! TLS termination with rustls: acceptor built from PEM certificate and key
//! files, with optional client verification and cipher-suite narrowing.

use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig as RustlsServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// Read every certificate from a PEM file.
fn load_certs(path: &std::path::Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| invalid(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = io::BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| invalid(format!("bad certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(invalid(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
fn load_key(path: &std::path::Path) -> io::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| invalid(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| invalid(format!("bad private key PEM: {}", e)))?
        .ok_or_else(|| invalid(format!("no private key in {}", path.display())))
}

/// Build the TLS acceptor from the configuration. Requires certificate and
/// key paths; CA file enables (and `ssl_verify_client` mandates) client
/// certificate verification. The optional cipher list narrows the default
/// suite set by rustls suite name.
pub fn build_acceptor(config: &ServerConfig) -> io::Result<TlsAcceptor> {
    let cert_path = config
        .ssl_certificate_file
        .as_ref()
        .ok_or_else(|| invalid("ssl_certificate_file is required for HTTPS".to_string()))?;
    let key_path = config
        .ssl_private_key_file
        .as_ref()
        .ok_or_else(|| invalid("ssl_private_key_file is required for HTTPS".to_string()))?;
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let provider = Arc::new(narrowed_provider(config.ssl_cipher_list.as_deref())?);
    let builder = RustlsServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(tokio_rustls::rustls::DEFAULT_VERSIONS)
        .map_err(|e| invalid(format!("TLS protocol setup: {}", e)))?;

    let builder = if config.ssl_verify_client {
        let ca_path = config
            .ssl_ca_file
            .as_ref()
            .ok_or_else(|| invalid("ssl_verify_client requires ssl_ca_file".to_string()))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| invalid(format!("bad CA certificate: {}", e)))?;
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| invalid(format!("client verifier: {}", e)))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut tls_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| invalid(format!("certificate/key mismatch: {}", e)))?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Default crypto provider, optionally restricted to the named cipher suites.
/// Names are matched case-insensitively against the rustls suite identifiers
/// (e.g. `TLS13_AES_128_GCM_SHA256`); separators are ':' or ','.
fn narrowed_provider(
    cipher_list: Option<&str>,
) -> io::Result<tokio_rustls::rustls::crypto::CryptoProvider> {
    let mut provider = tokio_rustls::rustls::crypto::ring::default_provider();
    let list = match cipher_list {
        Some(l) if !l.trim().is_empty() => l,
        _ => return Ok(provider),
    };
    let wanted: Vec<String> = list
        .split([':', ','])
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    provider.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite());
        wanted.iter().any(|w| name.eq_ignore_ascii_case(w))
    });
    if provider.cipher_suites.is_empty() {
        return Err(invalid(format!("no usable cipher suites in list: {}", list)));
    }
    Ok(provider)
}

/// Perform the TLS handshake on an accepted socket.
pub async fn accept_tls(
    acceptor: &TlsAcceptor,
    socket: TcpStream,
) -> io::Result<TlsStream<TcpStream>> {
    acceptor.accept(socket).await
}
