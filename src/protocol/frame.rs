//! Newline-delimited framing for the agent protocol.
//!
//! Every message is one JSON document terminated by `\n`. Reads arrive in
//! arbitrary chunks, so the decoder keeps the unterminated tail until the
//! next chunk completes it.

use serde::Serialize;

use crate::errors::ProtocolError;

/// Splits an inbound byte stream into complete lines.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes. Blank lines are
    /// skipped and a trailing `\r` is removed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let text = String::from_utf8_lossy(&line);
            if !text.trim().is_empty() {
                lines.push(text.into_owned());
            }
        }
        lines
    }

    /// Bytes buffered without a terminating newline yet.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

/// Serialize one message as a newline-terminated frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let mut json =
        serde_json::to_string(msg).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    json.push('\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut decoder = FrameDecoder::new();
        let lines = decoder.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn buffers_partial_line_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"{\"id\":1,").is_empty());
        assert_eq!(decoder.pending_bytes(), 8);
        let lines = decoder.push(b"\"result\":{}}\n{\"par");
        assert_eq!(lines, vec!["{\"id\":1,\"result\":{}}"]);
        let lines = decoder.push(b"tial\":true}\n");
        assert_eq!(lines, vec!["{\"partial\":true}"]);
    }

    #[test]
    fn strips_carriage_return_and_skips_blank_lines() {
        let mut decoder = FrameDecoder::new();
        let lines = decoder.push(b"{\"x\":1}\r\n\n   \n{\"y\":2}\n");
        assert_eq!(lines, vec!["{\"x\":1}", "{\"y\":2}"]);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        let bytes = "{\"t\":\"é\"}\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&bytes[..split]).is_empty());
        let lines = decoder.push(&bytes[split..]);
        assert_eq!(lines, vec!["{\"t\":\"é\"}"]);
    }

    #[test]
    fn encode_appends_newline() {
        let frame = encode_frame(&serde_json::json!({"method": "initialized"})).unwrap();
        assert!(frame.ends_with('\n'));
        assert_eq!(frame.matches('\n').count(), 1);
    }
}
