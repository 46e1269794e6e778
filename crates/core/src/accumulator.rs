//! Line accumulator for append-only JSONL stores.
//!
//! Bytes arrive in arbitrary chunks (a read can end mid-line, or mid UTF-8
//! sequence). The accumulator yields complete records only:
//!
//! - every newline-terminated line, trimmed, empty lines skipped
//! - a trailing fragment without a newline once it is a balanced JSON
//!   document (writers sometimes omit the final newline)
//! - a trailing fragment that grows past the flush threshold, forced out
//!   so a runaway writer cannot pin memory
//!
//! Whatever remains at end of input is returned by [`LineAccumulator::finish`].

const NEWLINE: u8 = b'\n';

#[derive(Debug)]
pub struct LineAccumulator {
    pending: Vec<u8>,
    max_pending: usize,
}

impl LineAccumulator {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Feed one chunk, returning every record it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if chunk.is_empty() {
            return out;
        }

        match memchr::memrchr(NEWLINE, chunk) {
            Some(last) => {
                self.pending.extend_from_slice(&chunk[..=last]);
                let complete = std::mem::take(&mut self.pending);
                for raw in complete.split(|&b| b == NEWLINE) {
                    if let Some(line) = to_record(raw) {
                        out.push(line);
                    }
                }
                self.pending.extend_from_slice(&chunk[last + 1..]);
            }
            None => self.pending.extend_from_slice(chunk),
        }

        if let Some(line) = self.take_fragment() {
            out.push(line);
        }
        out
    }

    /// Flush whatever is buffered. Called once at end of input.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        to_record(&rest)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discard buffered bytes (the backing file was replaced).
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    fn take_fragment(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        if is_balanced_json(&self.pending) {
            let fragment = std::mem::take(&mut self.pending);
            return to_record(&fragment);
        }
        if self.pending.len() > self.max_pending {
            tracing::warn!(
                pending_bytes = self.pending.len(),
                max_pending = self.max_pending,
                "Partial record exceeded flush threshold; forcing it out"
            );
            let fragment = std::mem::take(&mut self.pending);
            return to_record(&fragment);
        }
        None
    }
}

fn to_record(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// True when `bytes` holds exactly one complete JSON object or array.
///
/// A cheap structural scan (bracket depth outside strings) runs first so
/// the common "still growing" case never reaches the parser.
pub fn is_balanced_json(bytes: &[u8]) -> bool {
    let start = match bytes.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(i) => i,
        None => return false,
    };
    if !matches!(bytes[start], b'{' | b'[') {
        return false;
    }

    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut closed_at = None;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
                if depth == 0 {
                    closed_at = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let Some(end) = closed_at else {
        return false;
    };
    if bytes[end + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
        return false;
    }
    serde_json::from_slice::<serde::de::IgnoredAny>(&bytes[start..=end]).is_ok()
}
