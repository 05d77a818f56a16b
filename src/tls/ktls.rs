//! Kernel TLS offload (`TCP_ULP` + `SOL_TLS` crypto state install).
//!
//! After a successful install the kernel performs record encryption and
//! decryption, which makes plain `send`/`recv` and `sendfile(2)` work on a
//! TLS stream. Constants and structs mirror `<linux/tls.h>`; they are not
//! exposed by the libc crate.

use std::io;
use std::mem::size_of;
use std::os::fd::RawFd;

use rustls::crypto::cipher::{AeadKey, Iv};
use rustls::{ConnectionTrafficSecrets, ExtractedSecrets, ProtocolVersion};

const TCP_ULP: libc::c_int = 31;
const SOL_TLS: libc::c_int = 282;
const TLS_TX: libc::c_int = 1;
const TLS_RX: libc::c_int = 2;

const TLS_1_2_VERSION: u16 = 0x0303;
const TLS_1_3_VERSION: u16 = 0x0304;

const TLS_CIPHER_AES_GCM_128: u16 = 51;
const TLS_CIPHER_AES_GCM_256: u16 = 52;
const TLS_CIPHER_CHACHA20_POLY1305: u16 = 54;

#[repr(C)]
struct TlsCryptoInfo {
    version: u16,
    cipher_type: u16,
}

#[repr(C)]
struct CryptoInfoAesGcm128 {
    info: TlsCryptoInfo,
    iv: [u8; 8],
    key: [u8; 16],
    salt: [u8; 4],
    rec_seq: [u8; 8],
}

#[repr(C)]
struct CryptoInfoAesGcm256 {
    info: TlsCryptoInfo,
    iv: [u8; 8],
    key: [u8; 32],
    salt: [u8; 4],
    rec_seq: [u8; 8],
}

#[repr(C)]
struct CryptoInfoChacha20 {
    info: TlsCryptoInfo,
    iv: [u8; 12],
    key: [u8; 32],
    salt: [u8; 0],
    rec_seq: [u8; 8],
}

/// Whether the negotiated parameters can be expressed to the kernel at
/// all. Checked before secrets are extracted, because extraction consumes
/// the user-space session irrevocably.
pub fn suite_supported(version: Option<ProtocolVersion>) -> bool {
    matches!(
        version,
        Some(ProtocolVersion::TLSv1_2) | Some(ProtocolVersion::TLSv1_3)
    )
}

/// Attach the kernel TLS ULP to the socket. Fails with `ENOENT` when the
/// `tls` module is unavailable; that maps to "unsupported", not an error.
pub fn attach_ulp(fd: RawFd) -> io::Result<()> {
    const ULP_NAME: &[u8] = b"tls";
    syscall!(setsockopt(
        fd,
        libc::SOL_TCP,
        TCP_ULP,
        ULP_NAME.as_ptr() as *const libc::c_void,
        ULP_NAME.len() as libc::socklen_t,
    ))
    .map(|_| ())
}

/// Install both traffic directions. Must follow a successful
/// [`attach_ulp`]; failure at this point is unrecoverable for the
/// connection because the user-space session was already consumed.
pub fn install_secrets(
    fd: RawFd,
    version: ProtocolVersion,
    secrets: ExtractedSecrets,
) -> io::Result<()> {
    let (tx_seq, tx_secrets) = secrets.tx;
    let (rx_seq, rx_secrets) = secrets.rx;
    install_direction(fd, TLS_TX, version, tx_seq, &tx_secrets)?;
    install_direction(fd, TLS_RX, version, rx_seq, &rx_secrets)
}

fn install_direction(
    fd: RawFd,
    direction: libc::c_int,
    version: ProtocolVersion,
    seq: u64,
    secrets: &ConnectionTrafficSecrets,
) -> io::Result<()> {
    let version = match version {
        ProtocolVersion::TLSv1_2 => TLS_1_2_VERSION,
        ProtocolVersion::TLSv1_3 => TLS_1_3_VERSION,
        _ => return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
    };
    let rec_seq = seq.to_be_bytes();

    match secrets {
        ConnectionTrafficSecrets::Aes128Gcm { key, iv } => {
            let mut info: CryptoInfoAesGcm128 = unsafe { std::mem::zeroed() };
            info.info = TlsCryptoInfo {
                version,
                cipher_type: TLS_CIPHER_AES_GCM_128,
            };
            let (salt, iv8) = split_gcm_iv(iv);
            info.salt = salt;
            info.iv = iv8;
            info.key.copy_from_slice(key_bytes(key, 16)?);
            info.rec_seq = rec_seq;
            set_crypto_info(fd, direction, &info)
        }
        ConnectionTrafficSecrets::Aes256Gcm { key, iv } => {
            let mut info: CryptoInfoAesGcm256 = unsafe { std::mem::zeroed() };
            info.info = TlsCryptoInfo {
                version,
                cipher_type: TLS_CIPHER_AES_GCM_256,
            };
            let (salt, iv8) = split_gcm_iv(iv);
            info.salt = salt;
            info.iv = iv8;
            info.key.copy_from_slice(key_bytes(key, 32)?);
            info.rec_seq = rec_seq;
            set_crypto_info(fd, direction, &info)
        }
        ConnectionTrafficSecrets::Chacha20Poly1305 { key, iv } => {
            let mut info: CryptoInfoChacha20 = unsafe { std::mem::zeroed() };
            info.info = TlsCryptoInfo {
                version,
                cipher_type: TLS_CIPHER_CHACHA20_POLY1305,
            };
            info.iv.copy_from_slice(iv.as_ref());
            info.key.copy_from_slice(key_bytes(key, 32)?);
            info.rec_seq = rec_seq;
            set_crypto_info(fd, direction, &info)
        }
        _ => Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP)),
    }
}

// GCM: the kernel wants the 4-byte implicit salt and 8-byte explicit IV
// separately; rustls hands out the joined 12-byte IV.
fn split_gcm_iv(iv: &Iv) -> ([u8; 4], [u8; 8]) {
    let bytes = iv.as_ref();
    let mut salt = [0u8; 4];
    let mut explicit = [0u8; 8];
    salt.copy_from_slice(&bytes[..4]);
    explicit.copy_from_slice(&bytes[4..12]);
    (salt, explicit)
}

fn key_bytes(key: &AeadKey, expected: usize) -> io::Result<&[u8]> {
    let bytes = key.as_ref();
    if bytes.len() < expected {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    Ok(&bytes[..expected])
}

fn set_crypto_info<T>(fd: RawFd, direction: libc::c_int, info: &T) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        SOL_TLS,
        direction,
        info as *const T as *const libc::c_void,
        size_of::<T>() as libc::socklen_t,
    ))
    .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulp_attach_on_unconnected_socket_fails_cleanly() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        use std::os::fd::AsRawFd;
        // kTLS requires an established connection (and the tls module);
        // either way this must surface as io::Error, never a panic.
        let result = attach_ulp(listener.as_raw_fd());
        assert!(result.is_err());
    }

    #[test]
    fn supported_versions() {
        assert!(suite_supported(Some(ProtocolVersion::TLSv1_2)));
        assert!(suite_supported(Some(ProtocolVersion::TLSv1_3)));
        assert!(!suite_supported(Some(ProtocolVersion::TLSv1_1)));
        assert!(!suite_supported(None));
    }
}
