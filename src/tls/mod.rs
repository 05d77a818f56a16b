//! TLS termination: context construction from config (rustls), session
//! ticket rotation, and kernel TLS offload.

pub mod ktls;
pub mod ticket;

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::PrivateKeyDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedCipherSuite};

use crate::config::{CipherPolicy, ClientCertPolicy, KtlsMode, TlsConfig, TlsVersion};
use crate::error::TlsSetupError;
use crate::tls::ticket::TicketKeyStore;

/// Shared, immutable TLS context built from one [`TlsConfig`] snapshot.
///
/// Hot reload replaces the server's `Arc<TlsContext>`; connections keep a
/// strong reference to the context they started with, so a mid-handshake
/// reload never invalidates in-flight state.
#[derive(Debug)]
pub struct TlsContext {
    pub server_config: Arc<ServerConfig>,
    pub alpn_must_match: bool,
    pub ktls: KtlsMode,
    pub handshake_timeout: Duration,
    pub handshake_rate_limit: u32,
}

impl TlsContext {
    pub fn build(
        config: &TlsConfig,
        ticket_store: Arc<TicketKeyStore>,
    ) -> Result<TlsContext, TlsSetupError> {
        let cert_pem = config.cert.read().map_err(TlsSetupError::Pem)?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<_, _>>()
            .map_err(TlsSetupError::Pem)?;
        if certs.is_empty() {
            return Err(TlsSetupError::MissingCertificate);
        }

        let key_pem = config.key.read().map_err(TlsSetupError::Pem)?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(TlsSetupError::Pem)?
            .ok_or(TlsSetupError::MissingPrivateKey)?;

        let provider = build_provider(&config.cipher_policy);
        let versions = protocol_versions(config.min_version, config.max_version);

        let builder = ServerConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&versions)?;

        let builder = match config.client_cert {
            ClientCertPolicy::None => builder.with_no_client_auth(),
            policy => {
                let mut roots = RootCertStore::empty();
                for source in &config.client_roots {
                    let pem = source.read().map_err(TlsSetupError::Pem)?;
                    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                        let cert = cert.map_err(TlsSetupError::Pem)?;
                        let _ = roots.add(cert);
                    }
                }
                let verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
                let verifier = if policy == ClientCertPolicy::Request {
                    verifier_builder.allow_unauthenticated().build()?
                } else {
                    verifier_builder.build()?
                };
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut server_config = builder.with_single_cert(certs, key)?;

        server_config.alpn_protocols = config
            .alpn
            .iter()
            .map(|protocol| protocol.clone().into_bytes())
            .collect();

        if config.session_tickets.enabled {
            server_config.ticketer = ticket_store;
        } else {
            server_config.send_tls13_tickets = 0;
        }

        // kTLS needs the traffic secrets after the handshake.
        server_config.enable_secret_extraction = config.ktls != KtlsMode::Disabled;

        Ok(TlsContext {
            server_config: Arc::new(server_config),
            alpn_must_match: config.alpn_must_match,
            ktls: config.ktls,
            handshake_timeout: config.handshake_timeout,
            handshake_rate_limit: config.handshake_rate_limit,
        })
    }
}

fn protocol_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let mut versions = Vec::with_capacity(2);
    if min <= TlsVersion::Tls12 && max >= TlsVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    if max >= TlsVersion::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    versions
}

fn build_provider(policy: &CipherPolicy) -> rustls::crypto::CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    let keep = |suite: &SupportedCipherSuite| -> bool {
        let name = format!("{:?}", suite.suite());
        match policy {
            CipherPolicy::Default | CipherPolicy::Compatibility | CipherPolicy::Legacy => true,
            // Modern: TLS 1.3 suites and ECDHE+AEAD TLS 1.2 suites only.
            CipherPolicy::Modern => {
                name.starts_with("TLS13_")
                    || (name.contains("ECDHE") && name.contains("GCM"))
                    || name.contains("CHACHA20")
            }
            CipherPolicy::Explicit(list) => list.iter().any(|wanted| wanted == &name),
        }
    };
    provider.cipher_suites.retain(keep);
    if provider.cipher_suites.is_empty() {
        // An unsatisfiable explicit list would make every handshake fail
        // opaquely; fall back to the full set instead.
        log::warn!("cipher policy matched no suites; using provider defaults");
        provider = rustls::crypto::ring::default_provider();
    }
    provider
}
