use std::io;

use thiserror::Error;

/// Configuration rejected by validation, at construction or when a posted
/// update is applied.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// TLS material or context construction failure.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("failed to read PEM material: {0}")]
    Pem(#[source] io::Error),
    #[error("no certificate found in PEM material")]
    MissingCertificate,
    #[error("no private key found in PEM material")]
    MissingPrivateKey,
    #[error("rejected TLS material: {0}")]
    Material(#[from] rustls::Error),
    #[error("client certificate verifier: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),
}

/// Setup-path errors. Hot-path I/O stays `io::Result` close to the
/// syscalls and is mapped to typed outcomes, never surfaced through this.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error(transparent)]
    Tls(#[from] TlsSetupError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
