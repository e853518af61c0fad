use crate::error::{Result, SyncookieError};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use syncookie_common::KEY_LEN;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret value that prevents accidental logging
///
/// The wrapped value is only reachable through [`Secret::expose_secret`].
#[derive(Clone)]
pub struct Secret<T> {
    inner: T,
}

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self { inner: value }
    }

    /// Expose the secret value (use with caution)
    pub fn expose_secret(&self) -> &T {
        &self.inner
    }
}

impl Secret<String> {
    /// Create a secret from an environment variable
    ///
    /// # Errors
    /// Returns an error if the environment variable is not set or is empty
    pub fn from_env(var_name: &str) -> Result<Self> {
        let value = std::env::var(var_name).map_err(|e| {
            SyncookieError::Config(format!("Environment variable '{}' not set: {}", var_name, e))
        })?;
        if value.is_empty() {
            return Err(SyncookieError::Config(format!(
                "Environment variable '{}' is empty",
                var_name
            )));
        }
        Ok(Self::new(value))
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

impl Serialize for Secret<String> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Never serialize the actual value
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret<String> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Secret::new(value))
    }
}

/// Key material of one secret slot
///
/// Starts zeroed, is refilled from a cryptographic RNG on rotation and wiped when the
/// mechanism quiesces. Dropping a key zeroes it.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    pub const fn zeroed() -> Self {
        Self {
            bytes: [0; KEY_LEN],
        }
    }

    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = Self::zeroed();
        key.refill(rng);
        key
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Replace the key with fresh random bytes
    pub fn refill<R: RngCore + CryptoRng>(&mut self, rng: &mut R) {
        rng.fill_bytes(&mut self.bytes);
    }

    /// Zero the key with volatile writes
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
    }

    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    pub fn expose_secret(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Default for SecretKey {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}
