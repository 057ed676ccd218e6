//! Error taxonomy shared by the library. Library functions return
//! `Result<T, Error>`; the binary wraps these with `anyhow` for contextual
//! reporting, matching the teacher's `storage.rs` convention.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dataset I/O failed")]
    Io(#[from] std::io::Error),

    #[error("round {round} stage {stage} needed {needed} pairs but only {available} were available")]
    InsufficientData {
        round: usize,
        stage: usize,
        needed: u64,
        available: u64,
    },

    #[error("master-key search exhausted all candidates without a match")]
    SearchExhausted,

    #[error("recovered key does not reproduce the reference ciphertexts")]
    Mismatch { expected: [u8; 16], actual: [u8; 16] },
}

pub type Result<T> = std::result::Result<T, Error>;
