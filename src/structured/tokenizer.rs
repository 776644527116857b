//! Tokenizer vocabulary handling.
//!
//! `TokenizerInfo` encapsulates the vocabulary of an LLM tokenizer, providing:
//! - Decoded vocabulary (token id → raw bytes; a byte-level token may hold
//!   half of a multi-byte character)
//! - Lexicographically sorted vocabulary for prefix-sharing iteration
//! - Trie subtree ranges for batch prefix rejection during candidate search

use std::sync::LazyLock;

use anyhow::{Result, anyhow, bail};

/// The type of vocabulary encoding used by the tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabType {
    /// Tokens are used as-is, no decoding needed.
    Raw,
    /// Byte fallback encoding: `<0xAB>` → byte 0xAB, `▁` (U+2581) → space.
    /// Used by SentencePiece tokenizers (e.g., Llama).
    ByteFallback,
    /// Byte-level BPE: each byte is mapped to a unique Unicode character.
    /// Used by GPT-2/GPT-3 style tokenizers.
    ByteLevel,
}

/// Tokenizer vocabulary information for grammar-guided generation.
#[derive(Debug, Clone)]
pub struct TokenizerInfo {
    /// decoded_vocab[token_id] = decoded bytes.
    decoded_vocab: Vec<Vec<u8>>,
    /// Non-empty tokens sorted by decoded bytes: (token_id, bytes).
    sorted_vocab: Vec<(u32, Vec<u8>)>,
    /// Total vocabulary size (may exceed decoded_vocab.len() due to padding).
    vocab_size: usize,
    vocab_type: VocabType,
    /// Tokens that decode to nothing; never produced by a grammar.
    special_token_ids: Vec<u32>,
    /// For sorted_vocab[i], the index of the first entry that does NOT start
    /// with sorted_vocab[i]'s bytes.
    trie_subtree_end: Vec<usize>,
}

impl TokenizerInfo {
    /// Create a new TokenizerInfo from an encoded vocabulary.
    ///
    /// - `encoded_vocab`: The raw token strings from the tokenizer.
    /// - `vocab_type`: How to decode token strings.
    /// - `vocab_size`: Total vocabulary size (if larger than encoded_vocab.len(), extra tokens are
    ///   treated as special).
    pub fn new(
        encoded_vocab: &[String],
        vocab_type: VocabType,
        vocab_size: Option<usize>,
    ) -> Result<Self> {
        let vocab_size = vocab_size.unwrap_or(encoded_vocab.len());
        if vocab_size < encoded_vocab.len() {
            bail!(
                "vocab_size ({}) must be >= encoded_vocab.len() ({})",
                vocab_size,
                encoded_vocab.len()
            );
        }

        let decoded_vocab: Vec<Vec<u8>> = encoded_vocab
            .iter()
            .map(|tok| decode_token(tok, vocab_type))
            .collect::<Result<Vec<_>>>()?;

        let mut sorted_vocab = Vec::new();
        let mut special_token_ids = Vec::new();
        for (id, decoded) in decoded_vocab.iter().enumerate() {
            if decoded.is_empty() {
                special_token_ids.push(id as u32);
            } else {
                sorted_vocab.push((id as u32, decoded.clone()));
            }
        }
        sorted_vocab.sort_by(|a, b| a.1.cmp(&b.1));

        let trie_subtree_end = build_trie_subtree_ranges(&sorted_vocab);

        Ok(Self {
            decoded_vocab,
            sorted_vocab,
            vocab_size,
            vocab_type,
            special_token_ids,
            trie_subtree_end,
        })
    }

    pub fn vocab_type(&self) -> VocabType {
        self.vocab_type
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn decoded_vocab(&self) -> &[Vec<u8>] {
        &self.decoded_vocab
    }

    pub fn sorted_vocab(&self) -> &[(u32, Vec<u8>)] {
        &self.sorted_vocab
    }

    pub fn special_token_ids(&self) -> &[u32] {
        &self.special_token_ids
    }

    pub fn trie_subtree_end(&self) -> &[usize] {
        &self.trie_subtree_end
    }

    /// Get the decoded bytes for a token ID.
    pub fn decode_token(&self, token_id: u32) -> Option<&[u8]> {
        self.decoded_vocab.get(token_id as usize).map(|s| s.as_slice())
    }
}

fn decode_token(encoded: &str, vocab_type: VocabType) -> Result<Vec<u8>> {
    match vocab_type {
        VocabType::Raw => Ok(encoded.as_bytes().to_vec()),
        VocabType::ByteFallback => decode_byte_fallback(encoded),
        VocabType::ByteLevel => Ok(decode_byte_level(encoded)),
    }
}

/// `<0xAB>` → byte 0xAB, `▁` (U+2581) → space.
fn decode_byte_fallback(encoded: &str) -> Result<Vec<u8>> {
    if encoded.len() == 6 && encoded.starts_with("<0x") && encoded.ends_with('>') {
        let byte = u8::from_str_radix(&encoded[3..5], 16)
            .map_err(|_| anyhow!("invalid byte fallback token: {}", encoded))?;
        return Ok(vec![byte]);
    }
    Ok(encoded.replace('\u{2581}', " ").into_bytes())
}

/// Inverse of GPT-2's `bytes_to_unicode()`: bytes outside the printable
/// identity ranges were shifted to 256.. in ascending order.
static BYTE_LEVEL_GAP_BYTES: LazyLock<Vec<u8>> = LazyLock::new(|| {
    (0u8..=255)
        .filter(|&b| byte_level_identity(b as u32).is_none())
        .collect()
});

fn byte_level_identity(cp: u32) -> Option<u8> {
    match cp {
        0x21..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF => Some(cp as u8),
        _ => None,
    }
}

fn decode_byte_level(encoded: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(encoded.len());
    for c in encoded.chars() {
        let cp = c as u32;
        let mapped = byte_level_identity(cp).or_else(|| {
            cp.checked_sub(256)
                .and_then(|offset| BYTE_LEVEL_GAP_BYTES.get(offset as usize).copied())
        });
        match mapped {
            Some(b) => bytes.push(b),
            // not part of the mapping (added tokens): keep as UTF-8
            None => bytes.extend_from_slice(c.encode_utf8(&mut [0u8; 4]).as_bytes()),
        }
    }
    bytes
}

fn build_trie_subtree_ranges(sorted_vocab: &[(u32, Vec<u8>)]) -> Vec<usize> {
    let n = sorted_vocab.len();
    let mut ranges = vec![n; n];
    let mut stack: Vec<(usize, &[u8])> = Vec::new();

    for (i, (_, bytes)) in sorted_vocab.iter().enumerate() {
        while let Some(&(idx, prefix)) = stack.last() {
            if bytes.starts_with(prefix) {
                break;
            }
            ranges[idx] = i;
            stack.pop();
        }
        stack.push((i, bytes));
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_vocab() {
        let vocab: Vec<String> = vec!["hello".into(), "world".into(), "!".into()];
        let info = TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap();
        assert_eq!(info.vocab_size(), 3);
        assert_eq!(info.decode_token(1), Some(&b"world"[..]));
        assert_eq!(info.decode_token(7), None);
    }

    #[test]
    fn test_byte_fallback_decode() {
        assert_eq!(decode_byte_fallback("<0x41>").unwrap(), b"A");
        assert_eq!(decode_byte_fallback("<0xE2>").unwrap(), vec![0xE2]);
        assert_eq!(decode_byte_fallback("▁hello").unwrap(), b" hello");
        assert!(decode_byte_fallback("<0xZZ>").is_err());
    }

    #[test]
    fn test_byte_level_decode() {
        assert_eq!(decode_byte_level("A"), b"A");
        // 'Ġ' (U+0120) is byte 0x20
        assert_eq!(decode_byte_level("Ġhi"), b" hi");
        // 'Ċ' (U+010A) is byte 0x0A
        assert_eq!(decode_byte_level("Ċ"), b"\n");
        // half of "é" (0xC3 0xA9) survives as raw bytes
        assert_eq!(decode_byte_level("Ã"), vec![0xC3]);
    }

    #[test]
    fn test_special_tokens() {
        let vocab: Vec<String> = vec!["hello".into(), "".into(), "world".into()];
        let info = TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap();
        assert_eq!(info.special_token_ids(), &[1]);
        assert_eq!(info.sorted_vocab().len(), 2);
    }

    #[test]
    fn test_trie_subtree_ranges() {
        let vocab: Vec<String> = ["bc", "a", "abc", "b", "ab"].iter().map(|s| s.to_string()).collect();
        let info = TokenizerInfo::new(&vocab, VocabType::Raw, None).unwrap();

        let sorted: Vec<&[u8]> = info.sorted_vocab().iter().map(|(_, s)| s.as_slice()).collect();
        assert_eq!(sorted, vec![&b"a"[..], b"ab", b"abc", b"b", b"bc"]);
        assert_eq!(info.trie_subtree_end(), &[3, 3, 3, 5, 5]);
    }

    #[test]
    fn test_vocab_size_bounds() {
        let vocab: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let info = TokenizerInfo::new(&vocab, VocabType::Raw, Some(100)).unwrap();
        assert_eq!(info.vocab_size(), 100);
        assert!(TokenizerInfo::new(&vocab, VocabType::Raw, Some(2)).is_err());
    }
}
