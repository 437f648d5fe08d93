//! Newline framing for the request/response protocol

/// Splits an inbound byte stream into `\n`-terminated lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and return every line they completed, without the
    /// terminator (a trailing `\r` is dropped as well)
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.partial);
                lines.push(line.trim_end_matches('\r').to_string());
                self.partial.clear();
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Bytes received since the last newline
    pub fn partial(&self) -> String {
        String::from_utf8_lossy(&self.partial).into_owned()
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_pushes() {
        let mut buffer = LineBuffer::default();

        assert!(buffer.push(b"Do").is_empty());
        assert_eq!(buffer.partial(), "Do");
        assert_eq!(buffer.push(b"ne\nTurn"), vec!["Done"]);
        assert_eq!(buffer.push(b" on\r\n\n"), vec!["Turn on", ""]);
        assert_eq!(buffer.partial(), "");
    }

    #[test]
    fn test_clear_drops_partial() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"noise");
        buffer.clear();
        assert_eq!(buffer.push(b"Done\n"), vec!["Done"]);
    }
}
