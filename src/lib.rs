//! MGFN-18R linear cryptanalysis toolkit.
//!
//! A linear-cryptanalytic attack on an 18-round reduced variant of a
//! Feistel-like 64-bit block cipher with a 128-bit master key. Given a large
//! dataset of chosen/known (plaintext, ciphertext) pairs under a fixed
//! unknown key, [`analyzer::linear_attack_recover_keys`] recovers three
//! 32-bit round subkeys by statistical bias accumulation, and
//! [`search::find_master_key`] reconstructs the full 128-bit master key from
//! those subkeys by constrained exhaustive search.
//!
//! Module layout mirrors the components of the attack:
//! [`primitives`] (S-box, T-tables, rotations) underlies [`key_schedule`]
//! (master-key expansion and its inverse) and [`cipher`] (encryption and
//! partial-round decryption), which [`dataset`] uses to produce (P, C)
//! pairs and [`analyzer`]/[`search`] consume to recover the key.

pub mod analyzer;
pub mod cipher;
pub mod config;
pub mod dataset;
pub mod error;
pub mod key_schedule;
pub mod primitives;
pub mod search;

/// The known-answer master key from the attack's regression scenario
/// (spec §8, scenario 1): used by the CLI driver's default demo run and by
/// cross-module tests that need a shared, non-trivial key.
pub const DEMO_MASTER_KEY: [u8; 16] = [
    0xB7, 0x45, 0xC5, 0xC6, 0x10, 0x61, 0x98, 0xF3, 0xCA, 0x4C, 0xD4, 0x5E, 0x2B, 0x9F, 0x91, 0x0F,
];
