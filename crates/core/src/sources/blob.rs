//! Decoder for the opaque blobs in a Cursor chat store.
//!
//! A blob is one of:
//!
//! - a JSON document (first non-whitespace byte is `{` or `[`)
//! - a protobuf-style envelope: `(field << 3 | wire_type)` varint keys
//!   followed by a varint, a fixed-width value, or a length-delimited
//!   payload. Field [`JSON_FIELD`] carries an embedded UTF-8 JSON message,
//!   field [`TEXT_FIELD`] plain UTF-8 text. Root blobs list their children
//!   as 32-byte hashes.
//! - bare UTF-8 text with no framing at all
//!
//! Every function here is total: truncated or random input decodes to
//! [`DecodedBlob::Empty`] (or an empty list), never a panic.

use serde_json::Value;

/// Field number of the embedded JSON payload.
pub const JSON_FIELD: u64 = 1;
/// Field number of the plain-text payload.
pub const TEXT_FIELD: u64 = 2;

/// Length of a child reference (SHA-256) inside a root blob.
const CHILD_REF_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBlob {
    Json(Value),
    Text(String),
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payload<'a> {
    Varint(u64),
    Fixed64,
    Fixed32,
    Bytes(&'a [u8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field<'a> {
    number: u64,
    payload: Payload<'a>,
}

/// Walks envelope fields until the input ends or stops making sense.
struct FieldWalker<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Set when the walk stopped on malformed framing.
    broken: bool,
}

impl<'a> FieldWalker<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            broken: false,
        }
    }

    fn varint(&mut self) -> Option<u64> {
        let mut value: u64 = 0;
        for shift in 0..10 {
            let byte = *self.buf.get(self.pos)?;
            self.pos += 1;
            let bits = u64::from(byte & 0x7f);
            if shift == 9 && bits > 1 {
                return None;
            }
            value |= bits << (shift * 7);
            if byte & 0x80 == 0 {
                return Some(value);
            }
        }
        None
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn next_field(&mut self) -> Option<Field<'a>> {
        let key = self.varint()?;
        let number = key >> 3;
        if number == 0 {
            return None;
        }
        let payload = match key & 0x7 {
            0 => Payload::Varint(self.varint()?),
            1 => {
                self.take(8)?;
                Payload::Fixed64
            }
            2 => {
                let len = usize::try_from(self.varint()?).ok()?;
                Payload::Bytes(self.take(len)?)
            }
            5 => {
                self.take(4)?;
                Payload::Fixed32
            }
            _ => return None,
        };
        Some(Field { number, payload })
    }
}

impl<'a> Iterator for FieldWalker<'a> {
    type Item = Field<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.broken || self.pos >= self.buf.len() {
            return None;
        }
        let field = self.next_field();
        if field.is_none() {
            self.broken = true;
        }
        field
    }
}

/// Decode one blob.
pub fn decode_blob(bytes: &[u8]) -> DecodedBlob {
    if starts_like_json(bytes) {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return DecodedBlob::Json(value);
        }
    }

    let mut walker = FieldWalker::new(bytes);
    let mut json = None;
    let mut text = None;
    let mut other_json = None;
    for field in walker.by_ref() {
        let Payload::Bytes(payload) = field.payload else {
            continue;
        };
        if field.number == JSON_FIELD && json.is_none() {
            json = parse_embedded_json(payload);
        } else if field.number == TEXT_FIELD && text.is_none() {
            text = printable_text(payload);
        } else if other_json.is_none() {
            other_json = parse_embedded_json(payload);
        }
    }

    if let Some(value) = json.or(other_json) {
        return DecodedBlob::Json(value);
    }
    if let Some(text) = text {
        return DecodedBlob::Text(text);
    }
    // No usable framing: the whole blob may be bare text.
    if walker.broken || walker.pos == 0 {
        if let Some(text) = bare_text(bytes) {
            return DecodedBlob::Text(text);
        }
    }
    DecodedBlob::Empty
}

/// Hex ids of the 32-byte child references in a root blob, in order.
pub fn child_refs(bytes: &[u8]) -> Vec<String> {
    if starts_like_json(bytes) {
        return Vec::new();
    }
    FieldWalker::new(bytes)
        .filter_map(|field| match field.payload {
            Payload::Bytes(payload) if payload.len() == CHILD_REF_LEN => Some(hex::encode(payload)),
            _ => None,
        })
        .collect()
}

fn starts_like_json(bytes: &[u8]) -> bool {
    matches!(
        bytes.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

fn parse_embedded_json(payload: &[u8]) -> Option<Value> {
    if !starts_like_json(payload) {
        return None;
    }
    serde_json::from_slice::<Value>(payload)
        .ok()
        .filter(|v| v.is_object())
}

/// Text-field payload with control characters dropped. Kept only when
/// a letter or digit survives; anything else is decoding noise.
fn printable_text(payload: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(payload).ok()?;
    let filtered: String = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect();
    has_alphanumeric(&filtered).then(|| filtered.trim().to_string())
}

/// Unframed blob read as text. Stricter than [`printable_text`]: a single
/// control character means the bytes were framing, not prose.
fn bare_text(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    let clean = text.chars().all(|c| !c.is_control() || c.is_whitespace());
    (clean && has_alphanumeric(text)).then(|| text.trim().to_string())
}

fn has_alphanumeric(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn varint(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    fn bytes_field(number: u64, payload: &[u8], out: &mut Vec<u8>) {
        varint(number << 3 | 2, out);
        varint(payload.len() as u64, out);
        out.extend_from_slice(payload);
    }

    #[test]
    fn json_fast_path() {
        let decoded = decode_blob(br#" {"role":"user","content":"hi"}"#);
        assert_eq!(
            decoded,
            DecodedBlob::Json(serde_json::json!({"role": "user", "content": "hi"}))
        );
    }

    #[test]
    fn embedded_json_field_wins_over_text() {
        let mut blob = Vec::new();
        varint(3 << 3, &mut blob);
        varint(150, &mut blob);
        bytes_field(TEXT_FIELD, b"fallback text", &mut blob);
        bytes_field(JSON_FIELD, br#"{"role":"assistant","content":"ok"}"#, &mut blob);

        match decode_blob(&blob) {
            DecodedBlob::Json(v) => assert_eq!(v["content"], "ok"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn text_field_fallback() {
        let mut blob = Vec::new();
        bytes_field(TEXT_FIELD, b"  hello world \n", &mut blob);
        assert_eq!(decode_blob(&blob), DecodedBlob::Text("hello world".into()));
    }

    #[test]
    fn text_field_drops_control_characters() {
        let mut blob = Vec::new();
        bytes_field(TEXT_FIELD, b"hello\x00world\x07 \tagain", &mut blob);
        assert_eq!(decode_blob(&blob), DecodedBlob::Text("helloworld \tagain".into()));
    }

    #[test]
    fn noise_is_rejected() {
        let mut blob = Vec::new();
        bytes_field(TEXT_FIELD, b"\x01\x02\x03", &mut blob);
        assert_eq!(decode_blob(&blob), DecodedBlob::Empty);

        let mut blob = Vec::new();
        bytes_field(TEXT_FIELD, b"... --- ...", &mut blob);
        assert_eq!(decode_blob(&blob), DecodedBlob::Empty);
    }

    #[test]
    fn bare_text_without_framing() {
        // '#' is 0x23: field 4, wire type 3, which is unsupported framing.
        assert_eq!(
            decode_blob(b"# Plan\nstep one"),
            DecodedBlob::Text("# Plan\nstep one".into())
        );
    }

    #[test]
    fn truncated_envelope_is_empty() {
        let mut blob = Vec::new();
        bytes_field(JSON_FIELD, br#"{"a":1}"#, &mut blob);
        blob.truncate(blob.len() - 3);
        assert_eq!(decode_blob(&blob), DecodedBlob::Empty);
        assert_eq!(decode_blob(&[]), DecodedBlob::Empty);
        assert_eq!(decode_blob(&[0xff; 12]), DecodedBlob::Empty);
    }

    #[test]
    fn child_refs_in_order() {
        let a = [0xaa; 32];
        let b = [0x0b; 32];
        let mut blob = Vec::new();
        bytes_field(1, &a, &mut blob);
        bytes_field(1, b"short", &mut blob);
        bytes_field(1, &b, &mut blob);
        assert_eq!(child_refs(&blob), vec![hex::encode(a), hex::encode(b)]);
        assert!(child_refs(br#"{"x":1}"#).is_empty());
    }

    proptest! {
        #[test]
        fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode_blob(&bytes);
            let _ = child_refs(&bytes);
        }

        #[test]
        fn truncation_never_panics(cut in 0usize..64) {
            let mut blob = Vec::new();
            bytes_field(TEXT_FIELD, b"some text here", &mut blob);
            bytes_field(JSON_FIELD, br#"{"role":"user","content":"x"}"#, &mut blob);
            let end = cut.min(blob.len());
            let _ = decode_blob(&blob[..end]);
        }
    }
}
