//! Linear cryptanalysis: per-round, per-stage nibble recovery by parity-bias
//! accumulation.
//!
//! The per-(round, stage) parity expressions in [`parity`] are transcribed
//! bit-for-bit from `original_source/MGFN_18R_LC.c`'s
//! `linear_attack_recover_keys` — spec.md §9 explicitly calls these out as
//! undocumented but intentional constants of the cipher's linear trail that
//! must not be "simplified". They are reproduced verbatim, including the
//! asymmetric bit-selection patterns (e.g. the `(C >> 15) & 0xE` /
//! `(C >> 31) & 1` combination that recurs across stages) and the exact set
//! of already-recovered nibbles each stage consumes.

use crate::cipher::{decrypt_half_one_round, decrypt_half_two_round};
use crate::dataset::{DatasetReader, Pair, BUFFER_PAIRS};
use crate::error::{Error, Result};
use crate::primitives::substitute_with_sbox;
use std::path::Path;

/// Maps stage index to the nibble position it determines within a round's
/// 9-entry key array.
pub const POS: [usize; 8] = [8, 1, 5, 7, 4, 6, 2, 3];

/// `2^STAGE_EXP[round][stage]` pairs are required to resolve that stage.
pub const STAGE_EXP: [[u32; 8]; 3] = [
    [29, 31, 31, 29, 33, 33, 33, 33],
    [29, 31, 31, 29, 31, 31, 31, 31],
    [27, 29, 29, 27, 29, 29, 29, 29],
];

/// Counters for the 16 nibble candidates of one (round, stage) pair.
pub type ParityBucket = [u64; 16];

#[inline]
fn bit64(x: u64, n: u32) -> u64 {
    (x >> n) & 1
}

#[inline]
fn bit32(x: u32, n: u32) -> u64 {
    ((x >> n) & 1) as u64
}

#[inline]
fn rotated_c(c: u64) -> u8 {
    ((((c >> 15) & 0xE) ^ ((c >> 31) & 1)) & 0xF) as u8
}

#[inline]
fn sbox(x: u8) -> u8 {
    substitute_with_sbox(x)
}

/// Evaluate the single parity bit for (round, stage) over one (P, C) pair,
/// given the already-recovered nibbles of the current round (`rk_nib`) and
/// the trial candidate `key`.
#[allow(clippy::too_many_arguments)]
fn parity(round: usize, stage: usize, p: u64, c: u64, d1: u32, d2: u32, rk_nib: &[u8; 9], key: u8) -> u64 {
    let rc = rotated_c(c);
    match (round, stage) {
        (0, 0) => {
            let mut t = bit64(p, 48);
            t ^= bit64(c, 48);
            t ^= bit64(c, 16);
            t ^= (sbox(rc ^ key) & 1) as u64;
            t
        }
        (0, 1) => {
            let mut t = bit64(p, 48);
            t ^= bit64(c, 16);
            t ^= bit64(c, 50);
            t ^= ((sbox((((c >> 8) & 0xF) as u8) ^ key) >> 2) & 1) as u64;
            t
        }
        (0, 2) => {
            let mut t = bit64(p, 48);
            t ^= bit64(c, 16);
            t ^= bit64(c, 50);
            t ^= bit64(c, 63);
            t ^= ((sbox((((c >> 8) & 0xF) as u8) ^ rk_nib[1]) >> 2) & 1) as u64;
            t ^= (sbox((((c >> 19) & 0xF) as u8) ^ key) & 1) as u64;
            t
        }
        (0, 3) => {
            let mut t = bit64(p, 48);
            t ^= bit64(c, 16);
            t ^= bit64(c, 49);
            t ^= bit64(c, 63);
            t ^= (sbox((((c >> 19) & 0xF) as u8) ^ rk_nib[5]) & 1) as u64;
            t ^= (sbox((((c >> 27) & 0xF) as u8) ^ key) & 1) as u64;
            t
        }
        (0, 4) => {
            let mut t = bit64(p, 16);
            t ^= bit64(c, 18) ^ bit64(c, 40) ^ bit64(c, 43) ^ bit64(c, 48);
            t ^= (sbox(rc ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox((((c >> 8) & 0xF) as u8) ^ rk_nib[1]) >> 1) & 1) as u64;
            t ^= ((sbox((((c >> 4) & 0xF) as u8) ^ key) >> 1) & 1) as u64;
            t
        }
        (0, 5) => {
            let mut t = bit64(p, 16);
            t ^= bit64(c, 18) ^ bit64(c, 41) ^ bit64(c, 43) ^ bit64(c, 48);
            t ^= (sbox(rc ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox((((c >> 8) & 0xF) as u8) ^ rk_nib[1]) >> 1) & 1) as u64;
            t ^= (sbox((((c >> 23) & 0xF) as u8) ^ key) & 1) as u64;
            t
        }
        (0, 6) => {
            let mut t = bit64(p, 16);
            t ^= bit64(c, 17) ^ bit64(c, 31) ^ bit64(c, 48) ^ bit64(c, 51) ^ bit64(c, 53) ^ bit64(c, 59) ^ bit64(c, 61);
            t ^= (sbox(rc ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox(rc ^ rk_nib[8]) >> 3) & 1) as u64;
            t ^= ((sbox((((c >> 19) & 0xF) as u8) ^ rk_nib[5]) >> 3) & 1) as u64;
            t ^= ((sbox((((c >> 4) & 0xF) as u8) ^ rk_nib[4]) >> 2) & 1) as u64;
            t ^= ((sbox((((c >> 12) & 0xF) as u8) ^ key) >> 1) & 1) as u64;
            t
        }
        (0, 7) => {
            let mut t = bit64(p, 16);
            t ^= bit64(c, 17) ^ bit64(c, 31) ^ bit64(c, 48) ^ bit64(c, 51) ^ bit64(c, 53) ^ bit64(c, 60);
            t ^= (sbox(rc ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox((((c >> 19) & 0xF) as u8) ^ rk_nib[5]) >> 3) & 1) as u64;
            t ^= ((sbox((((c >> 12) & 0xF) as u8) ^ rk_nib[2]) >> 1) & 1) as u64;
            t ^= ((sbox(((c & 0xF) as u8) ^ key) >> 3) & 1) as u64;
            t
        }
        (1, 0) => {
            let mut t = bit32(d1, 16);
            t ^= bit64(p, 16);
            t ^= bit64(c, 16);
            t ^= (sbox((((((d1 >> 15) & 0xE) ^ ((d1 >> 31) & 1)) as u8)) ^ key) & 1) as u64;
            t
        }
        (1, 1) => {
            let mut t = bit64(p, 16);
            t ^= bit64(c, 18);
            t ^= bit32(d1, 16);
            t ^= ((sbox((((d1 >> 8) & 0xF) as u8) ^ key) >> 2) & 1) as u64;
            t
        }
        (1, 2) => {
            let mut t = bit64(p, 16);
            t ^= bit64(c, 18);
            t ^= bit64(c, 31);
            t ^= bit32(d1, 16);
            t ^= ((sbox((((d1 >> 8) & 0xF) as u8) ^ rk_nib[1]) >> 2) & 1) as u64;
            t ^= (sbox((((d1 >> 19) & 0xF) as u8) ^ key) & 1) as u64;
            t
        }
        (1, 3) => {
            let mut t = bit64(p, 16);
            t ^= bit64(c, 17);
            t ^= bit64(c, 31);
            t ^= bit32(d1, 16);
            t ^= (sbox((((d1 >> 19) & 0xF) as u8) ^ rk_nib[5]) & 1) as u64;
            t ^= (sbox((((d1 >> 27) & 0xF) as u8) ^ key) & 1) as u64;
            t
        }
        (1, 4) => {
            let mut t = bit64(p, 48);
            t ^= bit64(p, 16);
            t ^= bit64(c, 8);
            t ^= bit64(c, 11);
            t ^= bit64(c, 16);
            t ^= bit32(d1, 18);
            t ^= (sbox((((((d1 >> 15) & 0xE) ^ ((d1 >> 31) & 1)) as u8)) ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox((((d1 >> 8) & 0xF) as u8) ^ rk_nib[1]) >> 1) & 1) as u64;
            t ^= ((sbox((((d1 >> 4) & 0xF) as u8) ^ key) >> 1) & 1) as u64;
            t
        }
        (1, 5) => {
            let mut t = bit64(p, 48);
            t ^= bit64(p, 16);
            t ^= bit64(c, 9);
            t ^= bit64(c, 11);
            t ^= bit64(c, 16);
            t ^= bit32(d1, 18);
            t ^= (sbox((((((d1 >> 15) & 0xE) ^ ((d1 >> 31) & 1)) as u8)) ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox((((d1 >> 8) & 0xF) as u8) ^ rk_nib[1]) >> 1) & 1) as u64;
            t ^= (sbox((((d1 >> 23) & 0xF) as u8) ^ key) & 1) as u64;
            t
        }
        (1, 6) => {
            let mut t = bit64(p, 48);
            t ^= bit64(p, 16);
            t ^= bit64(c, 16);
            t ^= bit64(c, 19);
            t ^= bit64(c, 21);
            t ^= bit64(c, 27);
            t ^= bit64(c, 29);
            t ^= bit32(d1, 17);
            t ^= bit32(d1, 31);
            let rd1 = (((d1 >> 15) & 0xE) ^ ((d1 >> 31) & 1)) as u8;
            t ^= (sbox(rd1 ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox(rd1 ^ rk_nib[8]) >> 3) & 1) as u64;
            t ^= ((sbox((((d1 >> 19) & 0xF) as u8) ^ rk_nib[5]) >> 3) & 1) as u64;
            t ^= ((sbox((((d1 >> 4) & 0xF) as u8) ^ rk_nib[4]) >> 2) & 1) as u64;
            t ^= ((sbox((((d1 >> 12) & 0xF) as u8) ^ key) >> 1) & 1) as u64;
            t
        }
        (1, 7) => {
            let mut t = bit64(p, 48);
            t ^= bit64(p, 16);
            t ^= bit64(c, 16);
            t ^= bit64(c, 19);
            t ^= bit64(c, 21);
            t ^= bit64(c, 28);
            t ^= bit32(d1, 17);
            t ^= bit32(d1, 31);
            let rd1 = (((d1 >> 15) & 0xE) ^ ((d1 >> 31) & 1)) as u8;
            t ^= (sbox(rd1 ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox((((d1 >> 19) & 0xF) as u8) ^ rk_nib[5]) >> 3) & 1) as u64;
            t ^= ((sbox((((d1 >> 12) & 0xF) as u8) ^ rk_nib[2]) >> 1) & 1) as u64;
            t ^= ((sbox(((d1 & 0xF) as u8) ^ key) >> 3) & 1) as u64;
            t
        }
        (2, 0) => {
            let mut t = bit64(p, 48);
            t ^= bit64(p, 16);
            t ^= bit32(d1, 16);
            t ^= bit32(d2, 16);
            t ^= (sbox((((((d2 >> 15) & 0xE) ^ ((d2 >> 31) & 1)) as u8)) ^ key) & 1) as u64;
            t
        }
        (2, 1) => {
            let mut t = bit64(p, 48);
            t ^= bit64(p, 16);
            t ^= bit32(d1, 18);
            t ^= bit32(d2, 16);
            t ^= ((sbox((((d2 >> 8) & 0xF) as u8) ^ key) >> 2) & 1) as u64;
            t
        }
        (2, 2) => {
            let mut t = bit64(p, 48);
            t ^= bit64(p, 16);
            t ^= bit32(d1, 18);
            t ^= bit32(d1, 31);
            t ^= bit32(d2, 16);
            t ^= ((sbox((((d2 >> 8) & 0xF) as u8) ^ rk_nib[1]) >> 2) & 1) as u64;
            t ^= (sbox((((d2 >> 19) & 0xF) as u8) ^ key) & 1) as u64;
            t
        }
        (2, 3) => {
            let mut t = bit64(p, 48);
            t ^= bit64(p, 16);
            t ^= bit32(d1, 17);
            t ^= bit32(d1, 31);
            t ^= bit32(d2, 16);
            t ^= (sbox((((d2 >> 19) & 0xF) as u8) ^ rk_nib[5]) & 1) as u64;
            t ^= (sbox((((d2 >> 27) & 0xF) as u8) ^ key) & 1) as u64;
            t
        }
        (2, 4) => {
            let mut t = bit64(p, 48);
            t ^= bit32(d1, 8);
            t ^= bit32(d1, 11);
            t ^= bit32(d1, 16);
            t ^= bit32(d2, 18);
            t ^= (sbox((((((d2 >> 15) & 0xE) ^ ((d2 >> 31) & 1)) as u8)) ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox((((d2 >> 8) & 0xF) as u8) ^ rk_nib[1]) >> 1) & 1) as u64;
            t ^= ((sbox((((d2 >> 4) & 0xF) as u8) ^ key) >> 1) & 1) as u64;
            t
        }
        (2, 5) => {
            let mut t = bit64(p, 48);
            t ^= bit32(d1, 9);
            t ^= bit32(d1, 11);
            t ^= bit32(d1, 16);
            t ^= bit32(d2, 18);
            t ^= (sbox((((((d2 >> 15) & 0xE) ^ ((d2 >> 31) & 1)) as u8)) ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox((((d2 >> 8) & 0xF) as u8) ^ rk_nib[1]) >> 1) & 1) as u64;
            t ^= (sbox((((d2 >> 23) & 0xF) as u8) ^ key) & 1) as u64;
            t
        }
        (2, 6) => {
            let mut t = bit64(p, 48);
            t ^= bit32(d1, 16);
            t ^= bit32(d1, 19);
            t ^= bit32(d1, 21);
            t ^= bit32(d1, 27);
            t ^= bit32(d1, 29);
            t ^= bit32(d2, 17);
            t ^= bit32(d2, 31);
            let rd2 = (((d2 >> 15) & 0xE) ^ ((d2 >> 31) & 1)) as u8;
            t ^= (sbox(rd2 ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox(rd2 ^ rk_nib[8]) >> 3) & 1) as u64;
            t ^= ((sbox((((d2 >> 19) & 0xF) as u8) ^ rk_nib[5]) >> 3) & 1) as u64;
            t ^= ((sbox((((d2 >> 4) & 0xF) as u8) ^ rk_nib[4]) >> 2) & 1) as u64;
            t ^= ((sbox((((d2 >> 12) & 0xF) as u8) ^ key) >> 1) & 1) as u64;
            t
        }
        (2, 7) => {
            let mut t = bit64(p, 48);
            t ^= bit32(d1, 16);
            t ^= bit32(d1, 19);
            t ^= bit32(d1, 21);
            t ^= bit32(d1, 28);
            t ^= bit32(d2, 17);
            t ^= bit32(d2, 31);
            let rd2 = (((d2 >> 15) & 0xE) ^ ((d2 >> 31) & 1)) as u8;
            t ^= (sbox(rd2 ^ rk_nib[8]) & 1) as u64;
            t ^= ((sbox((((d2 >> 19) & 0xF) as u8) ^ rk_nib[5]) >> 3) & 1) as u64;
            t ^= ((sbox((((d2 >> 12) & 0xF) as u8) ^ rk_nib[2]) >> 1) & 1) as u64;
            t ^= ((sbox(((d2 & 0xF) as u8) ^ key) >> 3) & 1) as u64;
            t
        }
        _ => unreachable!("round must be 0..3 and stage 0..8"),
    }
}

/// Pick the candidate with the largest deviation from `used / 2`; ties
/// favor the smallest index.
fn find_max_deviation_index(bucket: &ParityBucket, used: u64) -> u8 {
    let half = used / 2;
    let mut best = 0usize;
    let mut max_diff = 0u64;
    for (i, &value) in bucket.iter().enumerate() {
        let diff = value.abs_diff(half);
        tracing::debug!(candidate = i, value, diff, "stage candidate bucket");
        if diff > max_diff {
            max_diff = diff;
            best = i;
        }
    }
    best as u8
}

/// Recover one (round, stage) nibble from the dataset. `all_nib[round]` is
/// the current round's partial nibble array (consulted by [`parity`] for
/// the positions already resolved this round); `all_nib[0]` and
/// `all_nib[1]` (when fully populated from earlier rounds) feed the
/// [`decrypt_half_one_round`]/[`decrypt_half_two_round`] peelers. Streams
/// the dataset in [`BUFFER_PAIRS`]-sized chunks, accumulating a 16-wide
/// parity bucket across `threads` scoped workers. `stage_exp` is threaded
/// through rather than read off the global [`STAGE_EXP`] table so a
/// scaled-down sample-size table can be substituted for synthetic runs.
fn recover_round_stage(
    reader: &mut DatasetReader,
    round: usize,
    stage: usize,
    all_nib: &[[u8; 9]; 3],
    stage_exp: &[[u32; 8]; 3],
    threads: usize,
) -> Result<(u8, u64)> {
    reader.rewind()?;
    let need = 1u64 << stage_exp[round][stage];
    let mut used = 0u64;
    let mut bucket: ParityBucket = [0; 16];

    loop {
        if used >= need {
            break;
        }
        let want = std::cmp::min(BUFFER_PAIRS as u64, need - used) as usize;
        let chunk = reader.read_chunk(want)?;
        if chunk.is_empty() {
            break;
        }

        let sums = accumulate_chunk(round, stage, &chunk, all_nib, threads);
        for (k, sum) in sums.into_iter().enumerate() {
            bucket[k] += sum;
        }
        used += chunk.len() as u64;
    }

    if used < need {
        let err = Error::InsufficientData {
            round,
            stage,
            needed: need,
            available: used,
        };
        tracing::warn!("{err}");
    }

    let best = find_max_deviation_index(&bucket, used);
    Ok((best, used))
}

/// Partition the 16 candidates across `threads` scoped workers (clamped to
/// `1..=16`), each summing the parity bit over the whole chunk for its own
/// subset of candidates. The partition only changes which worker computes
/// which candidate's sum; because the per-candidate sums are independent
/// and integer addition commutes (spec.md §5), the resulting bucket is
/// identical for any thread count.
fn accumulate_chunk(round: usize, stage: usize, chunk: &[Pair], all_nib: &[[u8; 9]; 3], threads: usize) -> [u64; 16] {
    let rk_nib = &all_nib[round];
    let threads = threads.clamp(1, 16);
    let mut sums = [0u64; 16];
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(threads);
        let per_worker = (16 + threads - 1) / threads;
        for w in 0..threads {
            let start = w * per_worker;
            let end = (start + per_worker).min(16);
            if start >= end {
                continue;
            }
            handles.push((start, scope.spawn(move || {
                let mut local = vec![0u64; end - start];
                for (i, key) in (start as u8..end as u8).enumerate() {
                    let mut local_sum = 0u64;
                    for pair in chunk {
                        let d1 = if round >= 1 {
                            decrypt_half_one_round(pair.ciphertext, &all_nib[0])
                        } else {
                            0
                        };
                        let d2 = if round >= 2 {
                            decrypt_half_two_round(pair.ciphertext, &all_nib[0], &all_nib[1])
                        } else {
                            0
                        };
                        local_sum += parity(round, stage, pair.plaintext, pair.ciphertext, d1, d2, rk_nib, key);
                    }
                    local[i] = local_sum;
                }
                local
            })));
        }
        for (start, handle) in handles {
            let local = handle.join().expect("analyzer worker panicked");
            for (i, sum) in local.into_iter().enumerate() {
                sums[start + i] = sum;
            }
        }
    });
    sums
}

/// Run the full analyzer with the standard sample-size table and a thread
/// count matching available parallelism: three rounds, eight stages each,
/// strictly sequential (each stage depends on the nibbles recovered so
/// far), filling three 9-entry nibble-key arrays for rounds 18, 17, and 16
/// respectively.
pub fn linear_attack_recover_keys(dataset_path: &Path) -> Result<[[u8; 9]; 3]> {
    let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    recover_keys_with(dataset_path, &STAGE_EXP, threads)
}

/// Same as [`linear_attack_recover_keys`], but takes an explicit sample-size
/// table and thread count. This lets a reduced `stage_exp` table (lowering
/// every exponent by a fixed offset, per spec.md §8 scenario 3) drive a
/// complete, in-memory synthetic run of the whole round/stage pipeline, and
/// lets callers exercise the analyzer at different thread counts.
pub fn recover_keys_with(dataset_path: &Path, stage_exp: &[[u32; 8]; 3], threads: usize) -> Result<[[u8; 9]; 3]> {
    let mut rk_nib = [[0u8; 9]; 3];
    let mut reader = DatasetReader::open(dataset_path)?;

    for round in 0..3 {
        for stage in 0..8 {
            let (best, _used) = recover_round_stage(&mut reader, round, stage, &rk_nib, stage_exp, threads)?;
            let pos = POS[stage];
            rk_nib[round][pos] = best;
            tracing::info!(round, stage, pos, key = best, "recovered nibble");
        }
    }

    Ok(rk_nib)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{generate_dataset, DatasetReader};
    use crate::key_schedule::key_schedule;

    const DEMO_KEY: [u8; 16] = [
        0xB7, 0x45, 0xC5, 0xC6, 0x10, 0x61, 0x98, 0xF3, 0xCA, 0x4C, 0xD4, 0x5E, 0x2B, 0x9F, 0x91,
        0x0F,
    ];

    fn temp_dataset(name: &str, ks: &crate::key_schedule::KeySchedule, pairs: u64) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("mgfn-attack-analyzer-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pairs.bin");
        generate_dataset(ks, &path, pairs, 2).unwrap();
        path
    }

    #[test]
    fn pos_table_matches_the_reference() {
        assert_eq!(POS, [8, 1, 5, 7, 4, 6, 2, 3]);
    }

    #[test]
    fn stage_exp_table_matches_the_reference() {
        assert_eq!(STAGE_EXP[0], [29, 31, 31, 29, 33, 33, 33, 33]);
        assert_eq!(STAGE_EXP[1], [29, 31, 31, 29, 31, 31, 31, 31]);
        assert_eq!(STAGE_EXP[2], [27, 29, 29, 27, 29, 29, 29, 29]);
    }

    #[test]
    fn max_deviation_picks_the_largest_bias_breaking_ties_low() {
        let mut bucket: ParityBucket = [0; 16];
        bucket[3] = 700;
        bucket[9] = 700;
        bucket[0] = 500;
        assert_eq!(find_max_deviation_index(&bucket, 1000), 3);
    }

    #[test]
    fn parity_is_deterministic_for_a_fixed_candidate() {
        let rk_nib = [0u8; 9];
        let p = 0x1122_3344_5566_7788u64;
        let c = 0x99AA_BBCC_DDEE_FF00u64;
        let a = parity(0, 0, p, c, 0, 0, &rk_nib, 5);
        let b = parity(0, 0, p, c, 0, 0, &rk_nib, 5);
        assert_eq!(a, b);
        assert!(a == 0 || a == 1);
    }

    #[test]
    fn accumulate_chunk_is_deterministic_across_thread_counts() {
        let ks = key_schedule(&DEMO_KEY);
        let path = temp_dataset("determinism", &ks, 512);
        let mut reader = DatasetReader::open(&path).unwrap();
        let chunk = reader.read_chunk(512).unwrap();
        let all_nib = [[0u8; 9]; 3];

        let single = accumulate_chunk(0, 0, &chunk, &all_nib, 1);
        let eight = accumulate_chunk(0, 0, &chunk, &all_nib, 8);
        let sixteen = accumulate_chunk(0, 0, &chunk, &all_nib, 16);
        assert_eq!(single, eight);
        assert_eq!(single, sixteen);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn insufficient_data_is_reported_when_the_dataset_is_short() {
        let ks = key_schedule(&DEMO_KEY);
        // Dataset holds fewer pairs than this (inflated) stage_exp demands.
        let path = temp_dataset("insufficient", &ks, 40);
        let mut reader = DatasetReader::open(&path).unwrap();
        let all_nib = [[0u8; 9]; 3];
        let tiny_stage_exp = [[6u32; 8]; 3];

        let (_best, used) = recover_round_stage(&mut reader, 0, 0, &all_nib, &tiny_stage_exp, 4).unwrap();
        assert!(used < (1u64 << tiny_stage_exp[0][0]));

        let err = Error::InsufficientData {
            round: 0,
            stage: 0,
            needed: 1u64 << tiny_stage_exp[0][0],
            available: used,
        };
        assert!(err.to_string().contains("needed"));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn recover_keys_with_runs_end_to_end_on_a_reduced_stage_exp_table() {
        let ks = key_schedule(&DEMO_KEY);
        // Lower every STAGE_EXP entry by a fixed offset so the whole
        // three-round, eight-stage-per-round pipeline completes in memory
        // (spec.md §8 scenario 3's reduced-delta configuration).
        const DELTA: u32 = 20;
        let reduced: [[u32; 8]; 3] = [
            STAGE_EXP[0].map(|e| e.saturating_sub(DELTA).max(4)),
            STAGE_EXP[1].map(|e| e.saturating_sub(DELTA).max(4)),
            STAGE_EXP[2].map(|e| e.saturating_sub(DELTA).max(4)),
        ];
        let max_needed = reduced.iter().flatten().map(|e| 1u64 << *e).max().unwrap();
        let path = temp_dataset("reduced", &ks, max_needed);

        let first = recover_keys_with(&path, &reduced, 1).unwrap();
        let second = recover_keys_with(&path, &reduced, 8).unwrap();
        // Same dataset prefix and same reduced table must pick the same
        // candidate regardless of worker count, since accumulation is
        // order-independent (exercised directly above for one bucket, and
        // here across the whole round/stage driver).
        assert_eq!(first, second);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
