//! Byte-level BPE tokenizer loaded from a HuggingFace `tokenizer.json`,
//! plus the training-side adapter that produces padded-free encoded examples.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Deserialize)]
struct RawTokenizer {
    model: RawModel,
    #[serde(default)]
    added_tokens: Vec<RawAddedToken>,
}

#[derive(Deserialize)]
struct RawModel {
    vocab: HashMap<String, u32>,
    #[serde(default)]
    merges: Vec<RawMerge>,
}

/// Merges appear either as `"a b"` strings or `["a", "b"]` pairs depending
/// on the tokenizers version that wrote the file.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawMerge {
    Joined(String),
    Pair([String; 2]),
}

#[derive(Deserialize)]
struct RawAddedToken {
    id: u32,
    content: String,
}

/// Byte-level BPE tokenizer.
///
/// Bytes are first mapped to the GPT-2 printable alphabet, then merged
/// greedily by rank. Added tokens are matched literally before BPE runs.
pub struct BpeTokenizer {
    vocab: HashMap<String, u32>,
    decoder: HashMap<u32, String>,
    merge_ranks: HashMap<(String, String), usize>,
    /// Added tokens, longest content first
    specials: Vec<(String, u32)>,
    byte_to_char: Vec<char>,
    char_to_byte: HashMap<char, u8>,
    /// Original file content, written back by `save_pretrained`
    raw_json: String,
    pad_id: u32,
    eos_id: Option<u32>,
}

impl BpeTokenizer {
    /// Load from a `tokenizer.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Tokenizer(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Parse from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawTokenizer = serde_json::from_str(json)
            .map_err(|e| Error::Tokenizer(format!("invalid tokenizer JSON: {e}")))?;

        let mut vocab = raw.model.vocab;
        let mut specials: Vec<(String, u32)> = Vec::new();
        for added in raw.added_tokens {
            vocab.entry(added.content.clone()).or_insert(added.id);
            specials.push((added.content, added.id));
        }
        specials.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut merge_ranks = HashMap::new();
        for (rank, merge) in raw.model.merges.iter().enumerate() {
            let (left, right) = match merge {
                RawMerge::Joined(s) => {
                    let mut parts = s.splitn(2, ' ');
                    match (parts.next(), parts.next()) {
                        (Some(l), Some(r)) => (l.to_string(), r.to_string()),
                        _ => {
                            return Err(Error::Tokenizer(format!(
                                "malformed merge rule '{s}' at rank {rank}"
                            )))
                        }
                    }
                }
                RawMerge::Pair([l, r]) => (l.clone(), r.clone()),
            };
            merge_ranks.insert((left, right), rank);
        }

        let decoder = vocab.iter().map(|(tok, &id)| (id, tok.clone())).collect();
        let (byte_to_char, char_to_byte) = byte_unicode_maps();

        let token_id = |name: &str| vocab.get(name).copied();
        let eos_id = token_id("</s>")
            .or_else(|| token_id("<|im_end|>"))
            .or_else(|| token_id("<|endoftext|>"));
        // Pad falls back to EOS when the vocabulary has no dedicated pad token
        let pad_id = token_id("<pad>").or(eos_id).unwrap_or(0);

        Ok(Self {
            vocab,
            decoder,
            merge_ranks,
            specials,
            byte_to_char,
            char_to_byte,
            raw_json: json.to_string(),
            pad_id,
            eos_id,
        })
    }

    /// Padding token id.
    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// End-of-sequence token id, if the vocabulary defines one.
    pub fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }

    /// Encode text to token ids.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut rest = text;

        while !rest.is_empty() {
            // Earliest special match wins; specials are longest-first so a
            // tie at the same position prefers the longer token.
            let next_special = self
                .specials
                .iter()
                .filter_map(|(content, id)| rest.find(content.as_str()).map(|at| (at, content, *id)))
                .min_by_key(|(at, content, _)| (*at, usize::MAX - content.len()));

            match next_special {
                Some((at, content, id)) => {
                    self.bpe_append(&rest[..at], &mut ids);
                    ids.push(id);
                    rest = &rest[at + content.len()..];
                }
                None => {
                    self.bpe_append(rest, &mut ids);
                    break;
                }
            }
        }

        ids
    }

    /// Decode token ids back to text. Unknown ids are skipped.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for id in ids {
            let Some(token) = self.decoder.get(id) else { continue };
            if self.specials.iter().any(|(content, _)| content == token) {
                bytes.extend_from_slice(token.as_bytes());
                continue;
            }
            for c in token.chars() {
                match self.char_to_byte.get(&c) {
                    Some(&b) => bytes.push(b),
                    None => bytes.extend_from_slice(c.to_string().as_bytes()),
                }
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Write the tokenizer file into the output directory.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("tokenizer.json"), &self.raw_json)?;
        Ok(())
    }

    /// Run byte-level BPE on a plain text segment, appending ids.
    fn bpe_append(&self, segment: &str, out: &mut Vec<u32>) {
        if segment.is_empty() {
            return;
        }

        let mut symbols: Vec<String> = segment
            .bytes()
            .map(|b| self.byte_to_char[b as usize].to_string())
            .collect();

        // Greedy merging: always apply the lowest-ranked adjacent pair
        loop {
            let mut best: Option<(usize, usize)> = None; // (rank, position)
            for i in 0..symbols.len().saturating_sub(1) {
                let key = (symbols[i].clone(), symbols[i + 1].clone());
                if let Some(&rank) = self.merge_ranks.get(&key) {
                    if best.map_or(true, |(r, _)| rank < r) {
                        best = Some((rank, i));
                    }
                }
            }
            let Some((_, pos)) = best else { break };
            let merged = format!("{}{}", symbols[pos], symbols[pos + 1]);
            symbols[pos] = merged;
            symbols.remove(pos + 1);
        }

        for symbol in symbols {
            if let Some(&id) = self.vocab.get(&symbol) {
                out.push(id);
            } else {
                // Unmergeable unknown: fall back to per-character lookup
                for c in symbol.chars() {
                    if let Some(&id) = self.vocab.get(c.to_string().as_str()) {
                        out.push(id);
                    }
                }
            }
        }
    }
}

/// GPT-2 byte/unicode bijection: printable bytes map to themselves, the rest
/// shift into the 256+ range so every byte has a visible representative.
fn byte_unicode_maps() -> (Vec<char>, HashMap<char, u8>) {
    let mut byte_to_char = Vec::with_capacity(256);
    let mut char_to_byte = HashMap::with_capacity(256);
    let mut shifted = 0u32;

    for b in 0u32..256 {
        let printable =
            (33..=126).contains(&b) || (161..=172).contains(&b) || (174..=255).contains(&b);
        let c = if printable {
            char::from_u32(b).expect("byte range codepoint")
        } else {
            let c = char::from_u32(256 + shifted).expect("shifted codepoint");
            shifted += 1;
            c
        };
        byte_to_char.push(c);
        char_to_byte.insert(c, b as u8);
    }

    (byte_to_char, char_to_byte)
}

/// One tokenized training example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    /// All ones at this stage; collation pads with zeros
    pub attention_mask: Vec<u32>,
    /// Copy of `input_ids` taken at tokenization time
    pub labels: Vec<u32>,
}

/// Tokenizer plus the truncation policy used for training examples.
pub struct TokenizerAdapter {
    tokenizer: BpeTokenizer,
    max_len: usize,
}

impl TokenizerAdapter {
    pub fn new(tokenizer: BpeTokenizer, max_len: usize) -> Self {
        Self { tokenizer, max_len }
    }

    /// Encode one formatted example: truncate to `max_len`, mask all ones,
    /// labels equal to the input ids.
    pub fn encode(&self, text: &str) -> TokenizedExample {
        let mut input_ids = self.tokenizer.encode(text);
        input_ids.truncate(self.max_len);
        let attention_mask = vec![1; input_ids.len()];
        let labels = input_ids.clone();
        TokenizedExample { input_ids, attention_mask, labels }
    }

    pub fn pad_id(&self) -> u32 {
        self.tokenizer.pad_id()
    }

    pub fn tokenizer(&self) -> &BpeTokenizer {
        &self.tokenizer
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn ascii_tokenizer() -> BpeTokenizer {
        BpeTokenizer::from_json(&fixtures::ascii_tokenizer_json()).unwrap()
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(BpeTokenizer::from_json("not json").is_err());
    }

    #[test]
    fn test_encode_ascii_bytes() {
        let tok = ascii_tokenizer();
        let ids = tok.encode("Hi");
        assert_eq!(ids, vec![b'H' as u32, b'i' as u32]);
    }

    #[test]
    fn test_specials_encode_as_single_tokens() {
        let tok = ascii_tokenizer();
        let ids = tok.encode("<|user|>Hi");
        assert_eq!(ids[0], 211);
        assert_eq!(&ids[1..], &[b'H' as u32, b'i' as u32]);
    }

    #[test]
    fn test_eos_detected_and_pad_falls_back_to_eos() {
        let tok = ascii_tokenizer();
        assert_eq!(tok.eos_id(), Some(210));
        assert_eq!(tok.pad_id(), 210);
    }

    #[test]
    fn test_dedicated_pad_token_wins() {
        let json = serde_json::json!({
            "model": { "vocab": { "<pad>": 0, "</s>": 1, "a": 2 }, "merges": [] },
            "added_tokens": []
        })
        .to_string();
        let tok = BpeTokenizer::from_json(&json).unwrap();
        assert_eq!(tok.pad_id(), 0);
        assert_eq!(tok.eos_id(), Some(1));
    }

    #[test]
    fn test_merges_apply_by_rank() {
        let json = serde_json::json!({
            "model": {
                "vocab": { "a": 0, "b": 1, "c": 2, "ab": 3, "abc": 4 },
                "merges": ["a b", "ab c"]
            },
            "added_tokens": []
        })
        .to_string();
        let tok = BpeTokenizer::from_json(&json).unwrap();
        assert_eq!(tok.encode("abc"), vec![4]);
        assert_eq!(tok.encode("ba"), vec![1, 0]);
    }

    #[test]
    fn test_merges_pair_format() {
        let json = serde_json::json!({
            "model": {
                "vocab": { "a": 0, "b": 1, "ab": 2 },
                "merges": [["a", "b"]]
            },
            "added_tokens": []
        })
        .to_string();
        let tok = BpeTokenizer::from_json(&json).unwrap();
        assert_eq!(tok.encode("ab"), vec![2]);
    }

    #[test]
    fn test_decode_round_trip() {
        let tok = ascii_tokenizer();
        let text = "Hello world";
        assert_eq!(tok.decode(&tok.encode(text)), text);
    }

    #[test]
    fn test_decode_preserves_specials() {
        let tok = ascii_tokenizer();
        let text = "<|user|>Hi";
        assert_eq!(tok.decode(&tok.encode(text)), text);
    }

    #[test]
    fn test_adapter_truncates_to_max_len() {
        let adapter = TokenizerAdapter::new(ascii_tokenizer(), 10);
        // 50 single-byte tokens naturally
        let text = "x".repeat(50);
        let example = adapter.encode(&text);
        assert_eq!(example.input_ids.len(), 10);
        assert_eq!(example.attention_mask, vec![1; 10]);
        assert_eq!(example.labels, example.input_ids);
    }

    #[test]
    fn test_adapter_short_input_unpadded() {
        let adapter = TokenizerAdapter::new(ascii_tokenizer(), 512);
        let example = adapter.encode("Hi");
        assert_eq!(example.input_ids.len(), 2);
        assert_eq!(example.attention_mask, vec![1, 1]);
    }

    #[test]
    fn test_save_pretrained_writes_original_json() {
        let json = fixtures::ascii_tokenizer_json();
        let tok = BpeTokenizer::from_json(&json).unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        tok.save_pretrained(tmp.path()).unwrap();
        let written = std::fs::read_to_string(tmp.path().join("tokenizer.json")).unwrap();
        assert_eq!(written, json);
    }

    mod adapter_props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            // Truncation bound and label copy hold for arbitrary input.
            #[test]
            fn prop_encode_invariants(text in ".{0,200}", max_len in 1..64usize) {
                let adapter = TokenizerAdapter::new(
                    BpeTokenizer::from_json(&fixtures::ascii_tokenizer_json()).unwrap(),
                    max_len,
                );
                let example = adapter.encode(&text);
                prop_assert!(example.input_ids.len() <= max_len);
                prop_assert_eq!(example.input_ids.len(), example.attention_mask.len());
                prop_assert_eq!(&example.labels, &example.input_ids);
            }
        }
    }
}
