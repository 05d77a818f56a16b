use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use rustls::server::ProducesTickets;

use crate::config::SessionTicketConfig;

const KEY_NAME_LEN: usize = 4;
const NONCE_LEN: usize = 12;

struct TicketKey {
    name: [u8; KEY_NAME_LEN],
    key: LessSafeKey,
    created: Instant,
}

struct StoreInner {
    // Newest key first; encryption always uses the newest, decryption
    // accepts any retained key so resumption survives rotation.
    keys: Vec<TicketKey>,
}

/// Rotating session-ticket keys, shared by every worker so a resuming
/// client can land on any of them.
///
/// Accessed from TLS callbacks that may run on any worker thread, hence
/// the mutex; ticket operations are far off the per-request hot path.
pub struct TicketKeyStore {
    inner: Mutex<StoreInner>,
    lifetime: Duration,
    max_keys: usize,
    // Static keys never rotate (deterministic across processes).
    rotate: bool,
    rng: SystemRandom,
}

impl fmt::Debug for TicketKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketKeyStore")
            .field("lifetime", &self.lifetime)
            .field("max_keys", &self.max_keys)
            .finish()
    }
}

impl TicketKeyStore {
    pub fn new(config: &SessionTicketConfig) -> TicketKeyStore {
        let rng = SystemRandom::new();
        let mut keys = Vec::new();
        let rotate = config.static_keys.is_empty();
        if rotate {
            if let Some(key) = generate_key(&rng) {
                keys.push(key);
            }
        } else {
            for (index, material) in config.static_keys.iter().enumerate() {
                if let Some(key) = static_key(index as u32, material) {
                    keys.push(key);
                }
            }
        }
        TicketKeyStore {
            inner: Mutex::new(StoreInner { keys }),
            lifetime: config.lifetime,
            max_keys: config.max_keys.max(1),
            rotate,
            rng,
        }
    }

    fn rotation_period(&self) -> Duration {
        // Retire keys well before the advertised ticket lifetime runs out.
        self.lifetime / (self.max_keys as u32).max(2)
    }
}

impl ProducesTickets for TicketKeyStore {
    fn enabled(&self) -> bool {
        true
    }

    fn lifetime(&self) -> u32 {
        self.lifetime.as_secs().min(u64::from(u32::MAX)) as u32
    }

    fn encrypt(&self, plain: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().ok()?;

        if self.rotate {
            let rotate_due = inner
                .keys
                .first()
                .map_or(true, |key| key.created.elapsed() >= self.rotation_period());
            if rotate_due {
                if let Some(key) = generate_key(&self.rng) {
                    inner.keys.insert(0, key);
                    inner.keys.truncate(self.max_keys);
                }
            }
        }

        let key = inner.keys.first()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).ok()?;

        let mut out = Vec::with_capacity(KEY_NAME_LEN + NONCE_LEN + plain.len() + 16);
        out.extend_from_slice(&key.name);
        out.extend_from_slice(&nonce_bytes);
        let mut sealed = plain.to_vec();
        key.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(key.name),
                &mut sealed,
            )
            .ok()?;
        out.extend_from_slice(&sealed);
        Some(out)
    }

    fn decrypt(&self, cipher: &[u8]) -> Option<Vec<u8>> {
        if cipher.len() < KEY_NAME_LEN + NONCE_LEN + 16 {
            return None;
        }
        let (name, rest) = cipher.split_at(KEY_NAME_LEN);
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);

        let inner = self.inner.lock().ok()?;
        let key = inner.keys.iter().find(|key| key.name == name)?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);
        let mut buffer = sealed.to_vec();
        let name_aad: [u8; KEY_NAME_LEN] = key.name;
        let plain = key
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(name_aad),
                &mut buffer,
            )
            .ok()?;
        Some(plain.to_vec())
    }
}

fn generate_key(rng: &SystemRandom) -> Option<TicketKey> {
    let mut name = [0u8; KEY_NAME_LEN];
    rng.fill(&mut name).ok()?;
    let mut material = [0u8; 32];
    rng.fill(&mut material).ok()?;
    let unbound = UnboundKey::new(&AES_256_GCM, &material).ok()?;
    Some(TicketKey {
        name,
        key: LessSafeKey::new(unbound),
        created: Instant::now(),
    })
}

fn static_key(index: u32, material: &[u8]) -> Option<TicketKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, material).ok()?;
    let mut name = [0u8; KEY_NAME_LEN];
    name.copy_from_slice(&index.to_be_bytes());
    Some(TicketKey {
        name,
        key: LessSafeKey::new(unbound),
        created: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let store = TicketKeyStore::new(&SessionTicketConfig::default());
        let ticket = store.encrypt(b"session state").unwrap();
        assert_ne!(ticket, b"session state");
        assert_eq!(store.decrypt(&ticket).unwrap(), b"session state");
    }

    #[test]
    fn tampered_ticket_rejected() {
        let store = TicketKeyStore::new(&SessionTicketConfig::default());
        let mut ticket = store.encrypt(b"session state").unwrap();
        let last = ticket.len() - 1;
        ticket[last] ^= 0x01;
        assert!(store.decrypt(&ticket).is_none());
    }

    #[test]
    fn unknown_key_name_rejected() {
        let store = TicketKeyStore::new(&SessionTicketConfig::default());
        let other = TicketKeyStore::new(&SessionTicketConfig::default());
        let ticket = store.encrypt(b"x").unwrap();
        assert!(other.decrypt(&ticket).is_none());
    }

    #[test]
    fn static_keys_decrypt_across_stores() {
        let config = SessionTicketConfig {
            static_keys: vec![vec![7u8; 32]],
            ..SessionTicketConfig::default()
        };
        let store_a = TicketKeyStore::new(&config);
        let store_b = TicketKeyStore::new(&config);
        let ticket = store_a.encrypt(b"shared").unwrap();
        assert_eq!(store_b.decrypt(&ticket).unwrap(), b"shared");
    }
}
