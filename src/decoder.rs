// src/decoder.rs
//
// Byte-to-text decoding for serial streams.
// Strict UTF-8 first, Latin-1 as a fallback: decoding never fails, it only
// loses fidelity on payloads that are not text.

/// Longest incomplete UTF-8 prefix that can be waiting for more bytes
const MAX_UTF8_TAIL: usize = 3;

/// Decode a single chunk with no carried state.
pub fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => latin1(bytes),
    }
}

/// One byte per code point. Total: every byte maps to U+0000..=U+00FF.
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Stateful decoder for a byte stream that arrives in arbitrary chunks.
///
/// A multi-byte character split across two reads is held back until the
/// rest arrives instead of being decoded as Latin-1 garbage.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk. May return less text than bytes were fed when
    /// the chunk ends inside a UTF-8 sequence.
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        let owned;
        let input: &[u8] = if self.pending.is_empty() {
            bytes
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(bytes);
            owned = joined;
            &owned
        };

        match std::str::from_utf8(input) {
            Ok(text) => text.to_string(),
            Err(e) => {
                let valid = e.valid_up_to();
                let tail = input.len() - valid;
                // error_len() == None means the input ended mid-sequence
                if e.error_len().is_none() && tail <= MAX_UTF8_TAIL {
                    self.pending.extend_from_slice(&input[valid..]);
                    // valid_up_to guarantees the prefix is UTF-8
                    String::from_utf8_lossy(&input[..valid]).into_owned()
                } else {
                    latin1(input)
                }
            }
        }
    }

    /// Release any held-back bytes as Latin-1.
    pub fn flush(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        latin1(&rest)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
