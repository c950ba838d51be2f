//! Incremental UTF-8 decoding of PTY output.

/// Decodes a byte stream into text, holding back an incomplete trailing
/// sequence until the next read completes it. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// Decode as much of `pending + bytes` as is complete.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_multibyte_sequence() {
        let bytes = "é→".as_bytes();
        let mut s = Utf8Stream::default();
        assert_eq!(s.decode(&bytes[..1]), "");
        assert_eq!(s.decode(&bytes[1..3]), "é");
        assert_eq!(s.decode(&bytes[3..]), "→");
        assert_eq!(s.finish(), "");
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut s = Utf8Stream::default();
        assert_eq!(s.decode(b"ok\xffok"), "ok\u{fffd}ok");
    }

    #[test]
    fn dangling_tail_flushed_lossy() {
        let mut s = Utf8Stream::default();
        assert_eq!(s.decode(b"a\xe2\x86"), "a");
        assert_eq!(s.finish(), "\u{fffd}");
    }
}
