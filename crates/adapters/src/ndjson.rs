//! Chunk-safe NDJSON line assembly.
//!
//! Byte streams deliver arbitrary chunk boundaries; the buffer is drained
//! in-place and any trailing partial line remains for the next call.  A
//! WebSocket frame that is already a complete single JSON object (no
//! newline) should be fast-pathed by the caller and never enter the buffer.

/// Incremental line buffer for newline-delimited JSON streams.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line.  Blank lines are
    /// skipped; returned lines are trimmed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..pos).collect();
            self.buffer.drain(..1); // remove the newline itself
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Drain the remaining partial line, if any.  Called when the stream
    /// ends without a trailing newline.
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim();
        if rest.is_empty() {
            self.buffer.clear();
            return None;
        }
        let line = rest.to_string();
        self.buffer.clear();
        Some(line)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_line() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("{\"a\":1}\n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn partial_line_stays_buffered() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("{\"a\":1}\n{\"b\":");
        assert_eq!(lines, vec!["{\"a\":1}"]);
        assert!(!buf.is_empty());

        let lines = buf.push("2}\n");
        assert_eq!(lines, vec!["{\"b\":2}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_across_many_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push("{\"key\"").is_empty());
        assert!(buf.push(":\"val").is_empty());
        let lines = buf.push("ue\"}\n");
        assert_eq!(lines, vec!["{\"key\":\"value\"}"]);
    }

    #[test]
    fn blank_lines_skipped() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("\n\n{\"a\":1}\n   \n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn flush_returns_trailing_partial() {
        let mut buf = LineBuffer::new();
        buf.push("{\"unterminated\":true}");
        assert_eq!(buf.flush().as_deref(), Some("{\"unterminated\":true}"));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn crlf_tolerated() {
        let mut buf = LineBuffer::new();
        let lines = buf.push("{\"a\":1}\r\n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }
}
