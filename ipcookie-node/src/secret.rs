use rand::RngCore;
use std::fmt;
use subtle::ConstantTimeEq;

/// Length of a stateless cookie secret in bytes
pub const SECRET_KEY_LEN: usize = 32;

/// Wrapper keeping cookie key material out of logs
///
/// `Debug` and `Display` print a placeholder; the bytes are reachable only
/// through `expose_secret`.
#[derive(Clone)]
pub struct Secret<T> {
    inner: T,
}

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self { inner: value }
    }

    /// Raw key material, for the cookie function only
    pub fn expose_secret(&self) -> &T {
        &self.inner
    }
}

/// Key material for the stateless cookie function
pub type SecretKey = Secret<[u8; SECRET_KEY_LEN]>;

impl Secret<[u8; SECRET_KEY_LEN]> {
    /// Draw a fresh key from the OS-seeded thread RNG
    pub fn random() -> Self {
        let mut key = [0u8; SECRET_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    /// Constant-time check whether two keys hold the same bytes
    pub fn same_key(&self, other: &Self) -> bool {
        self.expose_secret()[..].ct_eq(&other.expose_secret()[..]).into()
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug() {
        let secret = SecretKey::new([0x5A; SECRET_KEY_LEN]);
        let debug_output = format!("{:?}", secret);
        assert_eq!(debug_output, "[REDACTED]");
        assert!(!debug_output.contains("5a"));
    }

    #[test]
    fn test_secret_display() {
        let secret = Secret::new("my-secret-password".to_string());
        let display_output = format!("{}", secret);
        assert_eq!(display_output, "[REDACTED]");
    }

    #[test]
    fn test_random_keys_differ() {
        let a = SecretKey::random();
        let b = SecretKey::random();
        assert!(!a.same_key(&b));
        assert!(a.same_key(&a.clone()));
    }
}
