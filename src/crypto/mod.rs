//! Crypto — tokens are encrypted at rest, channel tokens are HMAC-signed.

mod engine;

pub use engine::CryptoEngine;
