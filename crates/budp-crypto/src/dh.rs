//! Diffie-Hellman key exchange over a small prime field.
//!
//! Both peers share the public generator [`DH_G`] and modulus [`DH_P`].
//! Each handshake draws a fresh [`EphemeralKey`]; the shared secret is
//! `peer_public ^ local_exponent mod p`, which both sides arrive at because
//! `(g^a)^b = (g^b)^a = g^(a*b) mod p`.
//!
//! # Security
//!
//! A 32-bit modulus gives no real protection against an active or even a
//! patient passive attacker. The exchange exists to agree on a keystream
//! secret without sending it in clear, not to provide a hardened channel.

use rand::rngs::OsRng;
use rand::{CryptoRng, Rng};
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Public generator.
pub const DH_G: u64 = 5;

/// Public prime modulus (the largest prime below 2^32).
pub const DH_P: u64 = 4_294_967_291;

/// Smallest ephemeral exponent drawn.
pub const EPHEMERAL_MIN: u64 = 2;

/// Largest ephemeral exponent drawn.
pub const EPHEMERAL_MAX: u64 = DH_P - 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyExchangeError {
    #[error("peer public value {0} is outside [2, p-2]")]
    InvalidPublic(u64),

    #[error("key agreement produced a degenerate secret")]
    DegenerateSecret,
}

/// Square-and-multiply modular exponentiation.
///
/// Intermediate products are widened to 128 bits, so any `u64` modulus is
/// safe.
///
/// # Panics
/// Panics if `modulus` is 0.
pub fn modpow(base: u64, exponent: u64, modulus: u64) -> u64 {
    assert!(modulus != 0, "modulus must be non-zero");
    if modulus == 1 {
        return 0;
    }

    let m = modulus as u128;
    let mut result: u128 = 1;
    let mut base = base as u128 % m;
    let mut exp = exponent;

    while exp > 0 {
        if exp & 1 == 1 {
            result = result * base % m;
        }
        base = base * base % m;
        exp >>= 1;
    }

    result as u64
}

/// djb2 string hash.
pub fn seed_hash(seed: &str) -> u64 {
    seed.bytes()
        .fold(5381u64, |hash, c| hash.wrapping_mul(33).wrapping_add(c as u64))
}

/// Long-lived local identity derived from an operator seed.
///
/// The exponent is a plain string hash of the seed. It gives a process a
/// stable public identity that peers can pin across restarts; it is not
/// secret key material and anyone who knows the seed can reproduce it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LocalIdentity {
    exponent: u64,
}

impl LocalIdentity {
    pub fn from_seed(seed: &str) -> Self {
        Self {
            exponent: seed_hash(seed),
        }
    }

    pub fn exponent(&self) -> u64 {
        self.exponent
    }

    /// Public identity advertised in `CONN` and `AUTH`: `g^exponent mod p`.
    pub fn public(&self) -> u64 {
        modpow(DH_G, self.exponent, DH_P)
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalIdentity(public={})", self.public())
    }
}

/// Per-handshake private exponent.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EphemeralKey {
    exponent: u64,
}

impl EphemeralKey {
    /// Draw a fresh exponent from the OS CSPRNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    pub fn generate_with<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        Self {
            exponent: rng.gen_range(EPHEMERAL_MIN..=EPHEMERAL_MAX),
        }
    }

    /// Build a key from a known exponent.
    pub fn from_exponent(exponent: u64) -> Self {
        Self { exponent }
    }

    /// Public value sent to the peer: `g^exponent mod p`.
    pub fn public(&self) -> u64 {
        modpow(DH_G, self.exponent, DH_P)
    }

    /// Combine with the peer's public value.
    pub fn agree(&self, peer_public: u64) -> Result<SharedSecret, KeyExchangeError> {
        if !(EPHEMERAL_MIN..=DH_P - 2).contains(&peer_public) {
            return Err(KeyExchangeError::InvalidPublic(peer_public));
        }

        let secret = modpow(peer_public, self.exponent, DH_P);
        if secret <= 1 {
            return Err(KeyExchangeError::DegenerateSecret);
        }

        Ok(SharedSecret(secret))
    }
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EphemeralKey(..)")
    }
}

/// Secret agreed by a completed key exchange. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(u64);

impl SharedSecret {
    pub fn from_value(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}
