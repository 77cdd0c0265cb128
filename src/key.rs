use std::{fmt, str::FromStr};

use ed25519_dalek::SigningKey;
use n0_error::{AnyError, anyerr};
use zeroize::Zeroize;

/// Length of both key forms in bytes.
pub const KEY_LEN: usize = 32;

/// The caller's long-lived identity key.
///
/// The relay codec uses it to authenticate the client during its handshake;
/// this crate only derives the public half and passes the secret through.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let key = SigningKey::from_bytes(&bytes);
        bytes.zeroize();
        Self(key)
    }

    /// Restores a key from its raw byte form.
    pub fn from_bytes(bytes: &[u8; KEY_LEN]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    /// The derived public key.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    /// The raw secret bytes, for key persistence.
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret half.
        write!(f, "SecretKey({})", self.public().fmt_short())
    }
}

/// A peer identity on the relay: 32 opaque bytes, hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Shortened hex form for log lines.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fmt_short())
    }
}

impl FromStr for PublicKey {
    type Err = AnyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|err| anyerr!("invalid hex key: {err}"))?;
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| anyerr!("key must be {KEY_LEN} bytes"))?;
        Ok(Self(bytes))
    }
}
