// src/buffers.rs
//
// Bounded text accumulator for a channel's display and parsed output.
// Truncation uses hysteresis: nothing is dropped until the text exceeds
// `soft_max * truncate_factor`, then it is cut back to the last `soft_max`
// bytes so the next truncation is a while away.
//
// Not synchronized. Owned and mutated by the channel's consumer context only.

/// Default hysteresis factor
pub const DEFAULT_TRUNCATE_FACTOR: f64 = 1.2;

#[derive(Debug, Clone)]
pub struct ChannelBuffer {
    text: String,
    soft_max: usize,
    truncate_factor: f64,
    /// Bumped on every truncation or clear; renderers compare it to detect a reset
    generation: u64,
    total_appended: u64,
}

impl ChannelBuffer {
    /// `soft_max` is in UTF-8 bytes. Factors below 1.0 are treated as 1.0.
    pub fn new(soft_max: usize, truncate_factor: f64) -> Self {
        let truncate_factor = if truncate_factor.is_finite() && truncate_factor >= 1.0 {
            truncate_factor
        } else {
            1.0
        };
        Self {
            text: String::new(),
            soft_max,
            truncate_factor,
            generation: 0,
            total_appended: 0,
        }
    }

    /// Length above which the next append truncates
    pub fn hard_limit(&self) -> usize {
        ((self.soft_max as f64) * self.truncate_factor).floor().max(self.soft_max as f64) as usize
    }

    pub fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.text.push_str(text);
        self.total_appended += text.len() as u64;
        if self.text.len() > self.hard_limit() {
            self.truncate_to_suffix();
        }
    }

    /// Keep the last `soft_max` bytes, moving the cut forward to a char boundary.
    fn truncate_to_suffix(&mut self) {
        let mut cut = self.text.len().saturating_sub(self.soft_max);
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
        self.generation += 1;
    }

    /// Text appended after `prior_len`.
    ///
    /// When `prior_len` no longer points into the buffer (it was truncated or
    /// cleared since) the whole buffer is returned and the caller should
    /// re-render from scratch; `generation()` tells it so.
    pub fn snapshot_since(&self, prior_len: usize) -> &str {
        if prior_len <= self.text.len() && self.text.is_char_boundary(prior_len) {
            &self.text[prior_len..]
        } else {
            &self.text
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.generation += 1;
    }

    pub fn current_length(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn soft_max(&self) -> usize {
        self.soft_max
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes ever appended, including those since evicted
    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }
}

// ============================================================================
// Tests
// ============================================================================
