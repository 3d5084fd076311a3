//! Byte-stream to text reassembly
//!
//! Engine output arrives in arbitrary chunks that may split a multi-byte
//! character. [`LineBuffer`] holds back incomplete sequences until the rest
//! arrives and tracks the trailing partial line plus the last completed line,
//! which the prompt detector inspects.

/// Length of the longest prefix of `bytes` that does not end inside an
/// incomplete UTF-8 sequence. Invalid bytes in the middle are left for the
/// lossy decoder.
pub fn find_utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => match e.error_len() {
            // Invalid byte: consume past it and keep scanning
            Some(len) => {
                let next = e.valid_up_to() + len;
                next + find_utf8_boundary(&bytes[next..])
            }
            // Incomplete sequence at the very end
            None => e.valid_up_to(),
        },
    }
}

/// Incremental UTF-8 decoder with line tracking
#[derive(Debug, Default)]
pub struct LineBuffer {
    carry: Vec<u8>,
    partial: String,
    last_line: Option<String>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the newly decodable text (possibly empty)
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let boundary = find_utf8_boundary(&self.carry);
        let ready: Vec<u8> = self.carry.drain(..boundary).collect();
        let text = String::from_utf8_lossy(&ready).into_owned();
        self.track(&text);
        text
    }

    /// Flush whatever is held back, replacing a dangling sequence
    pub fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            return String::new();
        }
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        self.track(&text);
        text
    }

    fn track(&mut self, text: &str) {
        let mut segments = text.split('\n').peekable();
        while let Some(segment) = segments.next() {
            self.partial.push_str(segment);
            if segments.peek().is_some() {
                let line = std::mem::take(&mut self.partial);
                self.last_line = Some(line.trim_end_matches('\r').to_string());
            }
        }
    }

    /// The line the prompt detector should look at: the trailing partial
    /// line when it has content, else the last completed line
    pub fn prompt_candidate(&self) -> Option<&str> {
        if !self.partial.trim().is_empty() {
            Some(&self.partial)
        } else {
            self.last_line.as_deref()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_holds_back_split_character() {
        let bytes = "héllo".as_bytes();
        // 'é' is two bytes at offsets 1..3
        assert_eq!(find_utf8_boundary(&bytes[..2]), 1);
        assert_eq!(find_utf8_boundary(bytes), bytes.len());
        assert_eq!(find_utf8_boundary(&[]), 0);
    }

    #[test]
    fn test_boundary_skips_invalid_bytes() {
        let bytes = [b'a', 0xff, b'b'];
        assert_eq!(find_utf8_boundary(&bytes), 3);
    }

    #[test]
    fn test_split_multibyte_is_reassembled() {
        let euro = "€".as_bytes();
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(&euro[..1]), "");
        assert_eq!(buf.push(&euro[1..2]), "");
        assert_eq!(buf.push(&euro[2..]), "€");
        assert_eq!(buf.prompt_candidate(), Some("€"));
    }

    #[test]
    fn test_candidate_prefers_partial_line() {
        let mut buf = LineBuffer::new();
        buf.push(b"first\r\nsecond\n");
        assert_eq!(buf.prompt_candidate(), Some("second"));

        buf.push(b"Password: ");
        assert_eq!(buf.prompt_candidate(), Some("Password: "));

        buf.push(b"\n   ");
        assert_eq!(buf.prompt_candidate(), Some("Password: "));
    }

    #[test]
    fn test_finish_flushes_dangling_bytes() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(&[b'x', 0xe2, 0x82]), "x");
        assert_eq!(buf.finish(), "\u{fffd}");
        assert_eq!(buf.finish(), "");
    }
}
