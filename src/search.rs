//! Constrained master-key search: given the three recovered subkeys for
//! rounds 16, 17, and 18, and two known (plaintext, ciphertext) pairs,
//! recover the full 128-bit master key.
//!
//! [`search_one`]'s bit expansion is transcribed field-for-field from
//! `original_source/recover_masterkey.c`: six free input bits select one of
//! 64 outer templates, which together with `RK16`/`RK17`/`RK18` fix all but
//! 29 bits of the 128-bit key (bits 29..58 of the low half plus the top 29
//! bits of the high half, laid in as `i` and `i ^ (RK17 & 0x1FFFFFFF)`); the
//! remaining 2^29 candidates per template are enumerated and verified by
//! re-encryption.

use crate::cipher::encrypt;
use crate::error::Error;
use crate::key_schedule::{join_master_key, unpermute_key};
use crate::primitives::inv_substitute_with_sbox;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One known (plaintext, ciphertext) pair under the target key.
#[derive(Debug, Clone, Copy)]
pub struct Pair {
    pub plaintext: u64,
    pub ciphertext: u64,
}

fn inv4(x: u8) -> u8 {
    inv_substitute_with_sbox(x)
}

/// Re-encrypt both reference pairs under the candidate key and compare.
fn verify_master_key(pairs: &[Pair; 2], hi: u64, lo: u64) -> Option<[u8; 16]> {
    let mk = join_master_key(hi, lo);
    let ks = crate::key_schedule::key_schedule(&mk);

    if encrypt(pairs[0].plaintext, &ks) != pairs[0].ciphertext {
        return None;
    }
    if encrypt(pairs[1].plaintext, &ks) != pairs[1].ciphertext {
        return None;
    }
    Some(mk)
}

/// Expand one of the 64 outer templates (`in_bits`, 6 bits) together with
/// the three recovered subkeys into the fixed bits of the 128-bit
/// pre-permutation state. Split out from [`search_one`] so the fixed-bit
/// computation can be exercised on its own.
fn build_template(in_bits: u8, rk16: u32, rk17: u32, rk18: u32) -> (u64, u64) {
    let mk64 = (in_bits >> 5) & 1;
    let mk63 = (in_bits >> 4) & 1;
    let mk62 = (in_bits >> 3) & 1;
    let mk61 = (in_bits >> 2) & 1;
    let mk60 = (in_bits >> 1) & 1;
    let mk59 = in_bits & 1;

    let a = inv4((mk62 << 3) | (mk61 << 2) | (mk60 << 1) | mk59) ^ 0x8 ^ ((rk16 >> 1) & 0xF) as u8;
    let b = inv4(((a & 3) << 2) | (mk64 << 1) | mk63) ^ 0x4 ^ ((rk16 >> 5) & 0xF) as u8;

    let mk68 = (a >> 3) & 1;
    let mk67 = (a >> 2) & 1;
    let mk66 = (a >> 1) & 1;
    let mk65 = a & 1;
    let mk72 = (b >> 3) & 1;
    let mk71 = (b >> 2) & 1;
    let mk70 = (b >> 1) & 1;
    let mk69 = b & 1;

    let xor1 = |x: u8, off: u32| x ^ ((rk18 >> off) & 1) as u8;
    let xor2 = |x: u8, off: u32| x ^ ((rk16 >> off) & 1) as u8;

    let mk125 = xor1(mk64, 0);
    let mk126 = xor1(mk65, 1);
    let mk127 = xor1(mk66, 2);
    let mk0 = xor1(mk67, 3);
    let mk1 = xor1(mk68, 4);
    let mk2 = xor1(mk69, 5) ^ 1;
    let mk3 = xor1(mk70, 6);
    let mk4 = xor1(mk71, 7) ^ 1;
    let mk5 = xor1(mk72, 8);

    let mk58 = xor2(mk64, 0);
    let mk73 = xor2(mk67, 9);
    let mk74 = xor2(mk68, 10);
    let mk75 = xor2(mk69, 11);
    let mk76 = xor2(mk70, 12);
    let mk77 = xor2(mk71, 13);
    let mk78 = xor2(mk72, 14);

    let mk6 = xor1(mk73, 9);
    let mk7 = xor1(mk74, 10);
    let mk8 = xor1(mk75, 11);
    let mk9 = xor1(mk76, 12);
    let mk10 = xor1(mk77, 13);
    let mk11 = xor1(mk78, 14);

    let mk79 = xor2(mk73, 15);
    let mk80 = xor2(mk74, 16);
    let mk81 = xor2(mk75, 17);
    let mk82 = xor2(mk76, 18);
    let mk83 = xor2(mk77, 19);
    let mk84 = xor2(mk78, 20);

    let mk12 = xor1(mk79, 15);
    let mk13 = xor1(mk80, 16);
    let mk14 = xor1(mk81, 17);
    let mk15 = xor1(mk82, 18);
    let mk16 = xor1(mk83, 19);
    let mk17 = xor1(mk84, 20);

    let mk85 = xor2(mk79, 21);
    let mk86 = xor2(mk80, 22);
    let mk87 = xor2(mk81, 23);
    let mk88 = xor2(mk82, 24);
    let mk89 = xor2(mk83, 25);
    let mk90 = xor2(mk84, 26);

    let mk18 = xor1(mk85, 21);
    let mk19 = xor1(mk86, 22);
    let mk20 = xor1(mk87, 23);
    let mk21 = xor1(mk88, 24);
    let mk22 = xor1(mk89, 25);
    let mk23 = xor1(mk90, 26);

    let mk91 = xor2(mk85, 27);
    let mk92 = xor2(mk86, 28);
    let mk93 = xor2(mk87, 29);
    let mk94 = xor2(mk88, 30);
    let mk95 = xor2(mk89, 31);

    let mk24 = xor1(mk91, 27);
    let mk25 = xor1(mk92, 28);
    let mk26 = xor1(mk93, 29);
    let mk27 = xor1(mk94, 30);
    let mk28 = xor1(mk95, 31);

    let mut tmpl_hi = 0u64;
    let mut tmpl_lo = 0u64;
    let set_h = |tmpl_hi: &mut u64, pos: u32, val: u8| *tmpl_hi |= (val as u64) << pos;
    let set_l = |tmpl_lo: &mut u64, pos: u32, val: u8| *tmpl_lo |= (val as u64) << pos;

    set_h(&mut tmpl_hi, 0, mk64);
    set_h(&mut tmpl_hi, 1, mk65);
    set_h(&mut tmpl_hi, 2, mk66);
    set_h(&mut tmpl_hi, 3, mk67);
    set_h(&mut tmpl_hi, 4, mk68);
    set_h(&mut tmpl_hi, 5, mk69);
    set_h(&mut tmpl_hi, 6, mk70);
    set_h(&mut tmpl_hi, 7, mk71);
    set_h(&mut tmpl_hi, 8, mk72);
    set_h(&mut tmpl_hi, 9, mk73);
    set_h(&mut tmpl_hi, 10, mk74);
    set_h(&mut tmpl_hi, 11, mk75);
    set_h(&mut tmpl_hi, 12, mk76);
    set_h(&mut tmpl_hi, 13, mk77);
    set_h(&mut tmpl_hi, 14, mk78);
    set_h(&mut tmpl_hi, 15, mk79);
    set_h(&mut tmpl_hi, 16, mk80);
    set_h(&mut tmpl_hi, 17, mk81);
    set_h(&mut tmpl_hi, 18, mk82);
    set_h(&mut tmpl_hi, 19, mk83);
    set_h(&mut tmpl_hi, 20, mk84);
    set_h(&mut tmpl_hi, 21, mk85);
    set_h(&mut tmpl_hi, 22, mk86);
    set_h(&mut tmpl_hi, 23, mk87);
    set_h(&mut tmpl_hi, 24, mk88);
    set_h(&mut tmpl_hi, 25, mk89);
    set_h(&mut tmpl_hi, 26, mk90);
    set_h(&mut tmpl_hi, 27, mk91);
    set_h(&mut tmpl_hi, 28, mk92);
    set_h(&mut tmpl_hi, 29, mk93);
    set_h(&mut tmpl_hi, 30, mk94);
    set_h(&mut tmpl_hi, 31, mk95);
    set_h(&mut tmpl_hi, 61, mk125);
    set_h(&mut tmpl_hi, 62, mk126);
    set_h(&mut tmpl_hi, 63, mk127);

    set_l(&mut tmpl_lo, 0, mk0);
    set_l(&mut tmpl_lo, 1, mk1);
    set_l(&mut tmpl_lo, 2, mk2);
    set_l(&mut tmpl_lo, 3, mk3);
    set_l(&mut tmpl_lo, 4, mk4);
    set_l(&mut tmpl_lo, 5, mk5);
    set_l(&mut tmpl_lo, 6, mk6);
    set_l(&mut tmpl_lo, 7, mk7);
    set_l(&mut tmpl_lo, 8, mk8);
    set_l(&mut tmpl_lo, 9, mk9);
    set_l(&mut tmpl_lo, 10, mk10);
    set_l(&mut tmpl_lo, 11, mk11);
    set_l(&mut tmpl_lo, 12, mk12);
    set_l(&mut tmpl_lo, 13, mk13);
    set_l(&mut tmpl_lo, 14, mk14);
    set_l(&mut tmpl_lo, 15, mk15);
    set_l(&mut tmpl_lo, 16, mk16);
    set_l(&mut tmpl_lo, 17, mk17);
    set_l(&mut tmpl_lo, 18, mk18);
    set_l(&mut tmpl_lo, 19, mk19);
    set_l(&mut tmpl_lo, 20, mk20);
    set_l(&mut tmpl_lo, 21, mk21);
    set_l(&mut tmpl_lo, 22, mk22);
    set_l(&mut tmpl_lo, 23, mk23);
    set_l(&mut tmpl_lo, 24, mk24);
    set_l(&mut tmpl_lo, 25, mk25);
    set_l(&mut tmpl_lo, 26, mk26);
    set_l(&mut tmpl_lo, 27, mk27);
    set_l(&mut tmpl_lo, 28, mk28);
    set_l(&mut tmpl_lo, 58, mk58);
    set_l(&mut tmpl_lo, 59, mk59);
    set_l(&mut tmpl_lo, 60, mk60);
    set_l(&mut tmpl_lo, 61, mk61);
    set_l(&mut tmpl_lo, 62, mk62);
    set_l(&mut tmpl_lo, 63, mk63);

    (tmpl_hi, tmpl_lo)
}

/// Fold free-bit candidate `i` (0..2^29) into the fixed template, producing
/// one 128-bit pre-permutation state to try.
fn candidate_state(tmpl_hi: u64, tmpl_lo: u64, rk17: u32, i: u64) -> (u64, u64) {
    let rk17_mask = (rk17 & 0x1FFF_FFFF) as u64;
    let hi = tmpl_hi | ((i ^ rk17_mask) << 32);
    let lo = tmpl_lo | (i << 29);
    (hi, lo)
}

/// Enumerate the 2^29 free-bit candidates for one outer template in
/// parallel, stopping early if `found` is already set by another template.
fn search_one(
    in_bits: u8,
    rk16: u32,
    rk17: u32,
    rk18: u32,
    pairs: &[Pair; 2],
    threads: usize,
    found: &AtomicBool,
    found_key: &Mutex<Option<[u8; 16]>>,
) {
    let (tmpl_hi, tmpl_lo) = build_template(in_bits, rk16, rk17, rk18);

    let space = 1u64 << 29;
    let threads = threads.max(1) as u64;

    std::thread::scope(|scope| {
        let per_thread = (space + threads - 1) / threads;
        for t in 0..threads {
            let start = t * per_thread;
            let end = (start + per_thread).min(space);
            if start >= end {
                continue;
            }
            let found = &found;
            let found_key = &found_key;
            scope.spawn(move || {
                for i in start..end {
                    if found.load(Ordering::Relaxed) {
                        return;
                    }
                    let (hi, lo) = candidate_state(tmpl_hi, tmpl_lo, rk17, i);

                    let (rh, rl) = unpermute_key(hi, lo);
                    if let Some(mk) = verify_master_key(pairs, rh, rl) {
                        *found_key.lock().expect("found-key mutex poisoned") = Some(mk);
                        found.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            });
        }
    });
}

/// Recover the 128-bit master key from two known (plaintext, ciphertext)
/// pairs and the three subkeys the linear analyzer recovered for rounds 16,
/// 17, and 18. Enumerates the 64 outer templates in turn, stopping as soon
/// as any template's inner search verifies a candidate.
pub fn find_master_key(pairs: [Pair; 2], rk16: u32, rk17: u32, rk18: u32, threads: usize) -> Option<[u8; 16]> {
    let found = AtomicBool::new(false);
    let found_key: Mutex<Option<[u8; 16]>> = Mutex::new(None);

    for in_bits in 0u8..64 {
        if found.load(Ordering::Relaxed) {
            break;
        }
        tracing::debug!(template = in_bits, "searching master-key template");
        search_one(in_bits, rk16, rk17, rk18, &pairs, threads, &found, &found_key);
    }

    let result = found_key.into_inner().expect("found-key mutex poisoned");
    if result.is_some() {
        tracing::info!("master-key search succeeded");
    } else {
        let err = Error::SearchExhausted;
        tracing::warn!("{err}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_schedule::{key_schedule, split_master_key};

    const DEMO_KEY: [u8; 16] = [
        0xB7, 0x45, 0xC5, 0xC6, 0x10, 0x61, 0x98, 0xF3, 0xCA, 0x4C, 0xD4, 0x5E, 0x2B, 0x9F, 0x91,
        0x0F,
    ];

    #[test]
    fn verify_master_key_rejects_a_wrong_key() {
        let ks = key_schedule(&DEMO_KEY);
        let pairs = [
            Pair { plaintext: 0, ciphertext: crate::cipher::encrypt(0, &ks) },
            Pair { plaintext: 1, ciphertext: crate::cipher::encrypt(1, &ks) },
        ];
        let (hi, lo) = split_master_key(&[0u8; 16]);
        assert!(verify_master_key(&pairs, hi, lo).is_none());
    }

    #[test]
    fn verify_master_key_accepts_the_correct_key() {
        let ks = key_schedule(&DEMO_KEY);
        let pairs = [
            Pair { plaintext: 0, ciphertext: crate::cipher::encrypt(0, &ks) },
            Pair { plaintext: 1, ciphertext: crate::cipher::encrypt(1, &ks) },
        ];
        let (hi, lo) = split_master_key(&DEMO_KEY);
        assert_eq!(verify_master_key(&pairs, hi, lo), Some(DEMO_KEY));
    }

    /// Builds a key directly from the template/candidate machinery (fixed
    /// template 0, free-bit index 0, all-zero recovered subkeys) so the
    /// resulting master key and the templated search agree by construction,
    /// then checks `find_master_key` locates it — this exercises the
    /// threading, early-exit, and verification plumbing around the
    /// templated bit expansion without depending on a hand-computed
    /// expected value.
    #[test]
    fn find_master_key_locates_a_key_matching_its_own_template() {
        let (tmpl_hi, tmpl_lo) = build_template(0, 0, 0, 0);
        let (hi, lo) = candidate_state(tmpl_hi, tmpl_lo, 0, 0);
        let (rh, rl) = unpermute_key(hi, lo);
        let mk = crate::key_schedule::join_master_key(rh, rl);

        let ks = key_schedule(&mk);
        let pairs = [
            Pair { plaintext: 0x1111_2222_3333_4444, ciphertext: crate::cipher::encrypt(0x1111_2222_3333_4444, &ks) },
            Pair { plaintext: 0x5555_6666_7777_8888, ciphertext: crate::cipher::encrypt(0x5555_6666_7777_8888, &ks) },
        ];

        let found = find_master_key(pairs, 0, 0, 0, 2);
        assert_eq!(found, Some(mk));
    }

    #[test]
    fn candidate_state_folds_the_free_bit_index_into_distinct_positions() {
        let (tmpl_hi, tmpl_lo) = build_template(5, 0x1234, 0x5678, 0x9ABC);
        let (hi_a, lo_a) = candidate_state(tmpl_hi, tmpl_lo, 0x5678, 0);
        let (hi_b, lo_b) = candidate_state(tmpl_hi, tmpl_lo, 0x5678, 1);
        assert_ne!((hi_a, lo_a), (hi_b, lo_b));
    }
}
