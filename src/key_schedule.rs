//! 128-bit master key expansion into the round-key material the encryptor
//! consumes, and its inverse as used by the master-key searcher.
//!
//! The per-round permutation step (rotate, substitute the top byte, fold in
//! a round constant) and its inverse `unpermute_key` are reproduced literally
//! from the reference recovery code — that code only makes sense as the
//! exact inverse of this forward schedule. The extraction of the 14
//! `round_keys` from the permutation's intermediate states, and their
//! expansion into the 26-word `rk` consumed by the round function, are not
//! present anywhere in the retrieved reference source (only the struct
//! layout is declared); the scheme below is a documented, deterministic
//! choice — see DESIGN.md.

use crate::primitives::{inv_substitute_with_sbox, rot_left_67, rotate_right_61, rotate_right_67, substitute_with_sbox};

/// Number of inner permutation rounds applied while building the schedule.
const SCHEDULE_ROUNDS: u8 = 10;

/// Expanded round-key material for one attack run.
#[derive(Debug, Clone)]
pub struct KeySchedule {
    /// The 14 raw round keys extracted from the permutation trace.
    pub round_keys: [u64; 14],
    /// The 26-word schedule consumed by the round function.
    pub rk: [u64; 26],
}

/// Split a 16-byte master key into its big-endian (hi, lo) halves.
pub fn split_master_key(master_key: &[u8; 16]) -> (u64, u64) {
    let mut hi = 0u64;
    let mut lo = 0u64;
    for i in 0..8 {
        hi = (hi << 8) | master_key[i] as u64;
    }
    for i in 0..8 {
        lo = (lo << 8) | master_key[8 + i] as u64;
    }
    (hi, lo)
}

/// Pack a big-endian (hi, lo) pair back into 16 bytes.
pub fn join_master_key(hi: u64, lo: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..8 {
        out[i] = (hi >> (56 - 8 * i)) as u8;
    }
    for i in 0..8 {
        out[8 + i] = (lo >> (56 - 8 * i)) as u8;
    }
    out
}

/// Apply round `r`'s forward permutation step to the evolving (hi, lo) state.
fn forward_round(mut hi: u64, mut lo: u64, r: u8) -> (u64, u64) {
    let (nh, nl) = rotate_right_67(hi, lo);
    hi = nh;
    lo = nl;

    let top = (hi >> 56) as u8;
    let n0 = substitute_with_sbox(top >> 4);
    let n1 = substitute_with_sbox(top & 0xF);
    hi = (hi & 0x00FF_FFFF_FFFF_FFFF) | ((n0 as u64) << 60) | ((n1 as u64) << 56);

    let up = ((r >> 2) & 3) as u64;
    let dn = (r & 3) as u64;
    hi = (hi & !3u64) | ((hi & 3) ^ up);
    lo = (lo & !(3u64 << 62)) | ((((lo >> 62) & 3) ^ dn) << 62);

    (hi, lo)
}

/// Expand a master key into the full [`KeySchedule`].
pub fn key_schedule(master_key: &[u8; 16]) -> KeySchedule {
    let (mut hi, mut lo) = split_master_key(master_key);

    // states[0] is the initial (hi, lo); states[r] is the state after round r.
    let mut states = Vec::with_capacity(SCHEDULE_ROUNDS as usize + 1);
    states.push((hi, lo));
    for r in 1..=SCHEDULE_ROUNDS {
        let (nh, nl) = forward_round(hi, lo, r);
        hi = nh;
        lo = nl;
        states.push((hi, lo));
    }
    let (final_hi, final_lo) = rotate_right_61(hi, lo);
    states.push((final_hi, final_lo));

    // round_keys[2k] / round_keys[2k+1] are the hi/lo halves of states[4+k],
    // for k in 0..7 — the seven latest permutation states, which is where
    // the round constants and S-box substitutions have had the most effect.
    let mut round_keys = [0u64; 14];
    for k in 0..7 {
        let (h, l) = states[4 + k];
        round_keys[2 * k] = h;
        round_keys[2 * k + 1] = l;
    }

    let rk = expand_rk(&round_keys);

    KeySchedule { round_keys, rk }
}

/// Expand the 14 raw round keys into the 26-word schedule the round
/// function consumes: the first 14 words are the round keys themselves, the
/// remaining 12 are pairwise XOR-folds carrying extra diffusion into the
/// later rounds.
fn expand_rk(round_keys: &[u64; 14]) -> [u64; 26] {
    let mut rk = [0u64; 26];
    rk[..14].copy_from_slice(round_keys);
    for i in 0..12 {
        rk[14 + i] = round_keys[i].rotate_left(13) ^ round_keys[(i + 2) % 14];
    }
    rk
}

/// Undo the key schedule's final permutation, recovering the (hi, lo) state
/// 10 rounds earlier. This is the exact inverse of [`key_schedule`]'s round
/// loop plus final rotation, reproduced from the reference recovery code.
pub fn unpermute_key(mkh: u64, mkl: u64) -> (u64, u64) {
    let (mut hi, mut lo) = rot_left_61_pub(mkh, mkl);

    for r in (1..=SCHEDULE_ROUNDS).rev() {
        let rc = r;
        let up = ((rc >> 2) & 3) as u64;
        let dn = (rc & 3) as u64;
        hi = (hi & !3u64) | ((hi & 3) ^ up);
        lo = (lo & !(3u64 << 62)) | ((((lo >> 62) & 3) ^ dn) << 62);

        let sb = (hi >> 56) as u8;
        let n0 = inv_substitute_with_sbox(sb >> 4);
        let n1 = inv_substitute_with_sbox(sb & 0xF);
        hi &= 0x00FF_FFFF_FFFF_FFFF;
        hi |= (n0 as u64) << 60 | (n1 as u64) << 56;

        let (nh, nl) = rot_left_67(hi, lo);
        hi = nh;
        lo = nl;
    }

    (hi, lo)
}

#[inline]
fn rot_left_61_pub(hi: u64, lo: u64) -> (u64, u64) {
    crate::primitives::rot_left_61(hi, lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO_KEY: [u8; 16] = [
        0xB7, 0x45, 0xC5, 0xC6, 0x10, 0x61, 0x98, 0xF3, 0xCA, 0x4C, 0xD4, 0x5E, 0x2B, 0x9F, 0x91,
        0x0F,
    ];

    #[test]
    fn split_and_join_round_trip() {
        let (hi, lo) = split_master_key(&DEMO_KEY);
        assert_eq!(hi, 0xB745_C5C6_1061_98F3);
        assert_eq!(lo, 0xCA4C_D45E_2B9F_910F);
        assert_eq!(join_master_key(hi, lo), DEMO_KEY);
    }

    #[test]
    fn unpermute_key_inverts_the_forward_schedule() {
        let (hi, lo) = split_master_key(&DEMO_KEY);
        let mut h = hi;
        let mut l = lo;
        for r in 1..=SCHEDULE_ROUNDS {
            let (nh, nl) = forward_round(h, l, r);
            h = nh;
            l = nl;
        }
        let (final_hi, final_lo) = rotate_right_61(h, l);

        let (rh, rl) = unpermute_key(final_hi, final_lo);
        assert_eq!((rh, rl), (hi, lo));
    }

    #[test]
    fn key_schedule_is_deterministic() {
        let ks1 = key_schedule(&DEMO_KEY);
        let ks2 = key_schedule(&DEMO_KEY);
        assert_eq!(ks1.round_keys, ks2.round_keys);
        assert_eq!(ks1.rk, ks2.rk);
    }
}
