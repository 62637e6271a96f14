//! Payload obfuscation applied to every envelope before framing.

pub mod cipher;

pub use cipher::{Cipher, CipherError};
