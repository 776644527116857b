//! Allowed-token sets as packed `u32` words, the layout samplers consume.
//!
//! Bit `i % 32` of word `i / 32` is set when token `i` may be sampled.
//! Words past the vocabulary are kept zero.

pub fn bitmask_size(vocab_size: usize) -> usize {
    vocab_size.div_ceil(32)
}

/// Bits of word `w` that belong to a vocabulary of `vocab_size` tokens.
fn vocab_bits(vocab_size: usize, w: usize) -> u32 {
    match vocab_size.saturating_sub(w * 32) {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => (1u32 << n) - 1,
    }
}

#[inline]
pub fn set_bit(bitmask: &mut [u32], i: usize) {
    bitmask[i / 32] |= 1 << (i % 32);
}

#[inline]
pub fn clear_bit(bitmask: &mut [u32], i: usize) {
    bitmask[i / 32] &= !(1 << (i % 32));
}

#[inline]
pub fn get_bit(bitmask: &[u32], i: usize) -> bool {
    bitmask[i / 32] & (1 << (i % 32)) != 0
}

/// Allow every token of the vocabulary.
pub fn reset_bitmask(bitmask: &mut [u32], vocab_size: usize) {
    for (w, word) in bitmask.iter_mut().enumerate() {
        *word = vocab_bits(vocab_size, w);
    }
}

pub fn clear_bitmask(bitmask: &mut [u32]) {
    bitmask.fill(0);
}

/// Push the logits of rejected tokens to `-inf`.
pub fn apply_token_bitmask_inplace(logits: &mut [f32], bitmask: &[u32]) {
    for (chunk, &word) in logits.chunks_mut(32).zip(bitmask) {
        for (bit, logit) in chunk.iter_mut().enumerate() {
            if word & (1 << bit) == 0 {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
    let covered = bitmask.len() * 32;
    if logits.len() > covered {
        logits[covered..].fill(f32::NEG_INFINITY);
    }
}

pub fn is_bitmask_all_ones(bitmask: &[u32], vocab_size: usize) -> bool {
    (0..bitmask_size(vocab_size)).all(|w| {
        let expected = vocab_bits(vocab_size, w);
        bitmask[w] & expected == expected
    })
}

pub fn count_allowed(bitmask: &[u32], vocab_size: usize) -> usize {
    bitmask
        .iter()
        .enumerate()
        .map(|(w, &word)| (word & vocab_bits(vocab_size, w)).count_ones() as usize)
        .sum()
}

/// Ids of allowed tokens, ascending.
pub fn allowed_tokens(bitmask: &[u32], vocab_size: usize) -> Vec<u32> {
    let mut ids = Vec::with_capacity(count_allowed(bitmask, vocab_size));
    for (w, &word) in bitmask.iter().enumerate() {
        let mut bits = word & vocab_bits(vocab_size, w);
        while bits != 0 {
            ids.push((w * 32) as u32 + bits.trailing_zeros());
            bits &= bits - 1;
        }
    }
    ids
}
