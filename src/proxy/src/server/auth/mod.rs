pub mod native_password;

use crate::protocol::mariadb::constants::SCRAMBLE_SIZE;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha1::Digest;
use sha2::Sha256;

/// Outcome of one client-side authentication round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientExchange {
    /// Send this packet to the client and wait for its next reply.
    Continue(Vec<u8>),
    /// The exchange is finished; `authenticate` decides the verdict.
    Done,
    Fail,
}

/// Final authentication verdict for a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Ok,
    Fail {
        code: u16,
        sqlstate: &'static [u8; 5],
        message: String,
    },
}

/// Outcome of one backend-side authentication round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendExchange {
    /// Send this packet to the backend and read its next reply.
    Send(Vec<u8>),
    Fail,
}

/// Stored credentials the plugins verify against; produced by the external
/// user-account layer.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Client-side authentication plugin, driven from the AUTH_EXCHANGE state.
/// Identified by name in the handshake.
pub trait ClientAuthPlugin: Send {
    fn name(&self) -> &'static str;

    /// Feed one packet received from the client; may iterate multiple
    /// rounds (auth switch, multi-round plugins).
    fn exchange(&mut self, packet: &[u8]) -> ClientExchange;

    /// Verdict once the exchange is done.
    fn authenticate(&self, salt: &[u8], credentials: &Credentials) -> AuthResult;
}

/// Backend-side authentication plugin, driven from the AUTHENTICATING state
/// of the backend connection.
pub trait BackendAuthPlugin: Send {
    fn name(&self) -> &'static str;

    /// React to a server packet (initial scramble or AuthSwitchRequest).
    fn exchange(&mut self, packet: &[u8]) -> BackendExchange;
}

/// Look up a client plugin by the name advertised in the handshake.
pub fn client_plugin_by_name(name: &[u8]) -> Option<Box<dyn ClientAuthPlugin>> {
    match name {
        b"" | b"mysql_native_password" => {
            Some(Box::new(native_password::NativePasswordClient::default()))
        }
        _ => None,
    }
}

pub fn backend_plugin_by_name(
    name: &[u8],
    password: &str,
) -> Option<Box<dyn BackendAuthPlugin>> {
    match name {
        b"" | b"mysql_native_password" => Some(Box::new(
            native_password::NativePasswordBackend::new(password.to_string()),
        )),
        _ => None,
    }
}

// Only for test purpose.
pub fn default_salt() -> [u8; SCRAMBLE_SIZE] {
    let bs = ";X,po_k}>o6^Wz!/kM}N".as_bytes();
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    for i in 0..SCRAMBLE_SIZE {
        salt[i] = bs[i];
        if salt[i] == b'\0' || salt[i] == b'$' {
            salt[i] += 1;
        }
    }
    salt
}

/// Generate a random scramble from printable ASCII, avoiding NUL and '$'.
#[inline]
pub fn gen_user_salt() -> [u8; SCRAMBLE_SIZE] {
    let mut salt: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for salt_item in salt.iter_mut() {
        let salt_rand = r.gen_range(0..127) as u8;
        *salt_item = salt_rand;
        if *salt_item == b'\0' || *salt_item == b'$' {
            *salt_item += 1;
        }
    }
    salt
}

fn to_u8_32(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut out = [0; 32];
    (out[..]).copy_from_slice(bytes.as_ref());
    out
}

pub fn sha256_1(bytes: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha256_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    to_u8_32(hasher.finalize())
}

pub fn sha1_1(bytes: impl AsRef<[u8]>) -> [u8; 20] {
    sha1::Sha1::digest(bytes).into()
}

pub fn sha1_2(bytes1: impl AsRef<[u8]>, bytes2: impl AsRef<[u8]>) -> [u8; 20] {
    let mut hasher = sha1::Sha1::new();
    hasher.update(bytes1.as_ref());
    hasher.update(bytes2.as_ref());
    hasher.finalize().into()
}

pub fn xor<T, U>(mut left: T, right: U) -> T
where
    T: AsMut<[u8]>,
    U: AsRef<[u8]>,
{
    left.as_mut()
        .iter_mut()
        .zip(right.as_ref().iter())
        .map(|(l, r)| *l ^= r)
        .last();
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_avoids_separator_bytes() {
        for _ in 0..32 {
            let salt = gen_user_salt();
            assert!(!salt.contains(&b'\0'));
            assert!(!salt.contains(&b'$'));
        }
    }

    #[test]
    fn xor_is_involutive() {
        let a = *b"12345678901234567890";
        let b = default_salt();
        let once = xor(a, b);
        let twice = xor(once, b);
        assert_eq!(twice, a);
    }

    #[test]
    fn plugin_lookup_by_name() {
        assert!(client_plugin_by_name(b"mysql_native_password").is_some());
        assert!(client_plugin_by_name(b"").is_some());
        assert!(client_plugin_by_name(b"caching_sha2_password").is_none());
    }
}
