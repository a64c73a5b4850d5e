//! Incremental server-sent-events line decoder.
//!
//! Network chunks do not respect line boundaries, so bytes are buffered
//! until a full line is available. A line longer than the limit fails the
//! stream instead of growing the buffer.

use chatloom_core::StreamError;

const DONE_MARKER: &str = "[DONE]";
const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Payload of one `data:` line
    Data(String),
    /// The `data: [DONE]` end marker
    Done,
}

#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to contain no newline
    scanned: usize,
    max_line_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    /// Feed a network chunk and return every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, StreamError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0;
        let mut search = self.scanned;

        while let Some(offset) = self.buffer[search..].iter().position(|&b| b == b'\n') {
            let end = search + offset;
            self.check_line_len(end - start)?;
            if let Some(frame) = parse_line(&self.buffer[start..end])? {
                frames.push(frame);
            }
            start = end + 1;
            search = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        self.check_line_len(self.buffer.len())?;
        Ok(frames)
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Result<Option<SseFrame>, StreamError> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }

    fn check_line_len(&self, len: usize) -> Result<(), StreamError> {
        if len > self.max_line_bytes {
            return Err(StreamError::MalformedStream(format!(
                "line exceeds {} bytes",
                self.max_line_bytes
            )));
        }
        Ok(())
    }
}

fn parse_line(raw: &[u8]) -> Result<Option<SseFrame>, StreamError> {
    let line = std::str::from_utf8(raw)
        .map_err(|e| StreamError::MalformedStream(format!("invalid utf-8 in stream: {e}")))?;
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let Some(payload) = line.strip_prefix("data:") else {
        // event:, id:, retry: carry nothing we use
        return Ok(None);
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    if payload.trim() == DONE_MARKER {
        Ok(Some(SseFrame::Done))
    } else {
        Ok(Some(SseFrame::Data(payload.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_complete_lines() {
        let mut decoder = SseDecoder::new();
        let frames = decoder
            .feed(b"data: {\"a\":1}\n\ndata: [DONE]\n\n")
            .unwrap_or_default();
        assert_eq!(
            frames,
            vec![SseFrame::Data("{\"a\":1}".to_string()), SseFrame::Done]
        );
    }

    #[test]
    fn reassembles_split_lines() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed(b"da").unwrap_or_default(), vec![]);
        assert_eq!(decoder.feed(b"ta: hel").unwrap_or_default(), vec![]);
        assert_eq!(
            decoder.feed(b"lo\r\n").unwrap_or_default(),
            vec![SseFrame::Data("hello".to_string())]
        );
    }

    #[test]
    fn skips_comments_and_other_fields() {
        let mut decoder = SseDecoder::new();
        let frames = decoder
            .feed(b": keep-alive\nevent: message\nid: 7\ndata:x\n")
            .unwrap_or_default();
        assert_eq!(frames, vec![SseFrame::Data("x".to_string())]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed(b"data: [DONE]").unwrap_or_default(), vec![]);
        assert_eq!(decoder.finish(), Ok(Some(SseFrame::Done)));
        assert_eq!(decoder.finish(), Ok(None));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut decoder = SseDecoder::new();
        let result = decoder.feed(b"data: \xff\xfe\n");
        assert!(matches!(result, Err(StreamError::MalformedStream(_))));
    }

    #[test]
    fn oversized_line_fails_without_newline() {
        let mut decoder = SseDecoder::new().with_max_line_bytes(16);
        assert_eq!(decoder.feed(b"data: 0123456").unwrap_or_default(), vec![]);
        assert!(matches!(
            decoder.feed(b"789abcdef"),
            Err(StreamError::MalformedStream(_))
        ));
    }

    #[test]
    fn oversized_terminated_line_fails() {
        let mut decoder = SseDecoder::new().with_max_line_bytes(8);
        assert!(matches!(
            decoder.feed(b"data: far too long\n"),
            Err(StreamError::MalformedStream(_))
        ));
    }

    #[test]
    fn short_lines_pass_a_tight_limit() {
        let mut decoder = SseDecoder::new().with_max_line_bytes(8);
        assert_eq!(
            decoder.feed(b"data:a\ndata:b\n").unwrap_or_default(),
            vec![SseFrame::Data("a".to_string()), SseFrame::Data("b".to_string())]
        );
    }

    #[test]
    fn long_line_in_many_chunks_is_reassembled() {
        let mut decoder = SseDecoder::new();
        let payload = "x".repeat(64 * 1024);
        let line = format!("data: {payload}\n");
        let mut frames = Vec::new();
        for piece in line.as_bytes().chunks(100) {
            frames.extend(decoder.feed(piece).unwrap_or_default());
        }
        assert_eq!(frames, vec![SseFrame::Data(payload)]);
    }

    #[test]
    fn multibyte_characters_survive_chunk_splits() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: 你好\n".as_bytes();
        let (head, tail) = bytes.split_at(8);
        assert_eq!(decoder.feed(head).unwrap_or_default(), vec![]);
        assert_eq!(
            decoder.feed(tail).unwrap_or_default(),
            vec![SseFrame::Data("你好".to_string())]
        );
    }
}
