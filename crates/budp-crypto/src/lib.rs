//! Cryptographic pieces of a BUDP session.
//!
//! This crate provides:
//! - Diffie-Hellman key agreement over a fixed prime field
//! - The XOR keystream applied to encrypted frame payloads
//! - Trust-on-first-use pinning of server identities
//!
//! None of this is a hardened channel. The keystream has no authentication
//! beyond the frame checksum and the modulus is 32 bits wide.

#![forbid(unsafe_code)]

pub mod dh;
pub mod keystream;
pub mod pinning;

pub use dh::{EphemeralKey, KeyExchangeError, LocalIdentity, SharedSecret};
pub use pinning::{
    check_pin, namespace_for_seed, FsPinStore, MemoryPinStore, PinStatus, PinStore,
    PinStoreError,
};
