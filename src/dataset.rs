//! Dataset production and streaming readback.
//!
//! The on-disk format is a flat, unframed sequence of 16-byte records: two
//! little-endian `u64`s, plaintext then ciphertext. Records are parsed the
//! way the teacher's `keystore::parse_blob` parses its binary blob — fixed
//! slices through `TryInto<[u8; 8]>` and `u64::from_le_bytes`, no
//! deserialization crate, since there is no framing to speak of.

use crate::error::{Error, Result};
use crate::key_schedule::KeySchedule;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::convert::TryInto;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// I/O buffer size, in records, used both for writing and for reading.
pub const BUFFER_PAIRS: usize = 4096;

const RECORD_SIZE: usize = 16;

/// One known plaintext/ciphertext pair under the attack's target key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair {
    pub plaintext: u64,
    pub ciphertext: u64,
}

fn seed_for_thread(thread_index: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ thread_index.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Generate `pairs` random (P, C) pairs under `ks` and append them to
/// `path`, splitting the work across `threads` scoped worker threads. Each
/// thread buffers up to [`BUFFER_PAIRS`] records locally and flushes under a
/// single mutex guarding the file handle, mirroring the reference's
/// thread-local-buffer-plus-critical-write pattern.
pub fn generate_dataset(ks: &KeySchedule, path: &Path, pairs: u64, threads: usize) -> Result<()> {
    let file = Mutex::new(File::create(path)?);
    let global_cnt = AtomicU64::new(0);
    let threads = threads.max(1) as u64;
    let per_thread = pairs / threads;
    let remainder = pairs % threads;

    std::thread::scope(|scope| -> Result<()> {
        let mut handles = Vec::with_capacity(threads as usize);
        for t in 0..threads {
            let file = &file;
            let global_cnt = &global_cnt;
            let count = per_thread + u64::from(t < remainder);
            handles.push(scope.spawn(move || -> std::io::Result<()> {
                let mut rng = StdRng::seed_from_u64(seed_for_thread(t));
                let mut buf = Vec::with_capacity(BUFFER_PAIRS * RECORD_SIZE);

                for _ in 0..count {
                    let plaintext: u64 = rng.gen();
                    let ciphertext = crate::cipher::encrypt(plaintext, ks);
                    buf.extend_from_slice(&plaintext.to_le_bytes());
                    buf.extend_from_slice(&ciphertext.to_le_bytes());

                    if buf.len() == BUFFER_PAIRS * RECORD_SIZE {
                        file.lock().expect("dataset file mutex poisoned").write_all(&buf)?;
                        buf.clear();
                    }

                    let done = global_cnt.fetch_add(1, Ordering::Relaxed) + 1;
                    if t == 0 && done & 0xFFFF == 0 {
                        let pct = done as f64 / pairs as f64 * 100.0;
                        tracing::info!(done, total = pairs, pct, "dataset generation progress");
                    }
                }

                if !buf.is_empty() {
                    file.lock().expect("dataset file mutex poisoned").write_all(&buf)?;
                }
                Ok(())
            }));
        }

        for handle in handles {
            handle.join().expect("dataset worker panicked")?;
        }
        Ok(())
    })
}

/// Streaming reader over a dataset file, used by the linear analyzer: it
/// rewinds once per (round, stage) and re-reads chunks sequentially.
pub struct DatasetReader {
    file: File,
}

impl DatasetReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }

    /// Number of pairs stored in the file.
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() / RECORD_SIZE as u64)
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Read up to `want` pairs. Returns fewer than `want` at end-of-file; an
    /// empty result means no more pairs are available.
    pub fn read_chunk(&mut self, want: usize) -> Result<Vec<Pair>> {
        let mut raw = vec![0u8; want * RECORD_SIZE];
        let mut filled = 0usize;
        while filled < raw.len() {
            let n = self.file.read(&mut raw[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        let full_records = filled / RECORD_SIZE;
        let mut pairs = Vec::with_capacity(full_records);
        for i in 0..full_records {
            let off = i * RECORD_SIZE;
            let plaintext = u64::from_le_bytes(raw[off..off + 8].try_into().map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated dataset record",
                ))
            })?);
            let ciphertext = u64::from_le_bytes(raw[off + 8..off + 16].try_into().map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated dataset record",
                ))
            })?);
            pairs.push(Pair { plaintext, ciphertext });
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_schedule::key_schedule;

    const DEMO_KEY: [u8; 16] = [
        0xB7, 0x45, 0xC5, 0xC6, 0x10, 0x61, 0x98, 0xF3, 0xCA, 0x4C, 0xD4, 0x5E, 0x2B, 0x9F, 0x91,
        0x0F,
    ];

    #[test]
    fn generate_then_read_round_trips_every_pair() {
        let dir = std::env::temp_dir().join(format!("mgfn-attack-dataset-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pairs.bin");

        let ks = key_schedule(&DEMO_KEY);
        generate_dataset(&ks, &path, 500, 4).unwrap();

        let mut reader = DatasetReader::open(&path).unwrap();
        assert_eq!(reader.len().unwrap(), 500);

        let mut total = Vec::new();
        loop {
            let chunk = reader.read_chunk(64).unwrap();
            if chunk.is_empty() {
                break;
            }
            total.extend(chunk);
        }
        assert_eq!(total.len(), 500);
        for pair in &total {
            assert_eq!(crate::cipher::encrypt(pair.plaintext, &ks), pair.ciphertext);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rewind_allows_rereading_the_same_prefix() {
        let dir = std::env::temp_dir().join(format!("mgfn-attack-dataset-rewind-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pairs.bin");

        let ks = key_schedule(&DEMO_KEY);
        generate_dataset(&ks, &path, 128, 2).unwrap();

        let mut reader = DatasetReader::open(&path).unwrap();
        let first_pass = reader.read_chunk(128).unwrap();
        reader.rewind().unwrap();
        let second_pass = reader.read_chunk(128).unwrap();
        assert_eq!(first_pass, second_pass);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn short_file_yields_fewer_pairs_than_requested() {
        let dir = std::env::temp_dir().join(format!("mgfn-attack-dataset-short-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pairs.bin");

        let ks = key_schedule(&DEMO_KEY);
        generate_dataset(&ks, &path, 10, 1).unwrap();

        let mut reader = DatasetReader::open(&path).unwrap();
        let chunk = reader.read_chunk(4096).unwrap();
        assert_eq!(chunk.len(), 10);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
