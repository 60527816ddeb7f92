//! Authenticated encryption for backup artifacts.

pub mod cipher;

pub use cipher::{StreamCipher, CHUNK_SIZE, FORMAT_V0, FORMAT_V1};
