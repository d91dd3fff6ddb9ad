//! Length-prefixed message framing
//!
//! Wire format: [5-byte big-endian length][body], messages back-to-back with
//! no other delimiters. The maximum representable body length is 2^40 - 1.
//!
//! `MessageStream` reassembles framed messages from arbitrarily segmented
//! socket reads. A length prefix that is itself split across reads is
//! buffered until the rest arrives, rather than treated as a protocol error.

/// Size in bytes of the length prefix.
pub(crate) const LEN_SIZE: usize = 5;

/// Encode a message body length as a 5-byte big-endian prefix.
pub(crate) fn encode_message_size(size: u64) -> [u8; LEN_SIZE] {
    let bytes = size.to_be_bytes();
    let mut encoded = [0u8; LEN_SIZE];
    encoded.copy_from_slice(&bytes[8 - LEN_SIZE..]);
    encoded
}

/// Decode a 5-byte big-endian length prefix.
pub(crate) fn decode_message_size(encoded: &[u8; LEN_SIZE]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[8 - LEN_SIZE..].copy_from_slice(encoded);
    u64::from_be_bytes(bytes)
}

/// Streaming reassembler for one connection.
///
/// Stateful and strictly per-connection: feeding it chunks from more than one
/// socket corrupts the frame boundaries.
#[derive(Debug, Default)]
pub(crate) struct MessageStream {
    /// Partially received length prefix.
    prefix: Vec<u8>,
    /// Body bytes of the message currently being reassembled.
    message: Vec<u8>,
    /// Expected body length, `None` while still reading a prefix.
    expected: Option<usize>,
}

impl MessageStream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed one received segment, returning every message it completes, in
    /// arrival order. A single segment may complete several messages, and a
    /// message may span many segments.
    pub(crate) fn received(&mut self, segment: &[u8]) -> Vec<Vec<u8>> {
        let mut complete = Vec::new();
        let mut rest = segment;

        while !rest.is_empty() {
            match self.expected {
                None => {
                    let take = (LEN_SIZE - self.prefix.len()).min(rest.len());
                    self.prefix.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];

                    if self.prefix.len() == LEN_SIZE {
                        let mut encoded = [0u8; LEN_SIZE];
                        encoded.copy_from_slice(&self.prefix);
                        self.prefix.clear();

                        let size = decode_message_size(&encoded) as usize;
                        if size == 0 {
                            complete.push(Vec::new());
                        } else {
                            self.expected = Some(size);
                        }
                    }
                }
                Some(expected) => {
                    let take = (expected - self.message.len()).min(rest.len());
                    self.message.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];

                    if self.message.len() == expected {
                        complete.push(std::mem::take(&mut self.message));
                        self.expected = None;
                    }
                }
            }
        }

        complete
    }

    /// Drain any already-complete messages without feeding new bytes.
    ///
    /// Every segment is consumed eagerly by `received`, so this never yields
    /// anything; it exists so callers can safely invoke the no-argument form.
    pub(crate) fn drain(&mut self) -> Vec<Vec<u8>> {
        self.received(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_message_size() {
        assert_eq!(encode_message_size(0), [0, 0, 0, 0, 0]);
        assert_eq!(encode_message_size(1), [0, 0, 0, 0, 1]);
        assert_eq!(encode_message_size(255), [0, 0, 0, 0, 255]);
        assert_eq!(encode_message_size(256), [0, 0, 0, 1, 0]);
        assert_eq!(encode_message_size(257), [0, 0, 0, 1, 1]);
        assert_eq!(encode_message_size(4311810305), [1, 1, 1, 1, 1]);
        assert_eq!(encode_message_size(4328719365), [1, 2, 3, 4, 5]);
        assert_eq!(encode_message_size(47362409218), [11, 7, 5, 3, 2]);
        assert_eq!(encode_message_size(1099511627775), [255, 255, 255, 255, 255]);
    }

    #[test]
    fn test_decode_message_size() {
        assert_eq!(decode_message_size(&[0, 0, 0, 0, 0]), 0);
        assert_eq!(decode_message_size(&[0, 0, 0, 0, 1]), 1);
        assert_eq!(decode_message_size(&[0, 0, 0, 0, 255]), 255);
        assert_eq!(decode_message_size(&[0, 0, 0, 1, 0]), 256);
        assert_eq!(decode_message_size(&[0, 0, 0, 1, 1]), 257);
        assert_eq!(decode_message_size(&[1, 1, 1, 1, 1]), 4311810305);
        assert_eq!(decode_message_size(&[1, 2, 3, 4, 5]), 4328719365);
        assert_eq!(decode_message_size(&[11, 7, 5, 3, 2]), 47362409218);
        assert_eq!(decode_message_size(&[255, 255, 255, 255, 255]), 1099511627775);
    }

    #[test]
    fn test_size_roundtrip() {
        for size in [0u64, 1, 42, 65536, (1 << 40) - 1] {
            assert_eq!(decode_message_size(&encode_message_size(size)), size);
        }
    }

    #[test]
    fn test_single_message() {
        let mut stream = MessageStream::new();
        let msgs = stream.received(&[0, 0, 0, 0, 1, 67]);
        assert_eq!(msgs, vec![b"C".to_vec()]);
    }

    #[test]
    fn test_coalesced_messages() {
        let mut stream = MessageStream::new();
        let msgs = stream.received(&[0, 0, 0, 0, 1, 65, 0, 0, 0, 0, 3, 65, 66, 67]);
        assert_eq!(msgs, vec![b"A".to_vec(), b"ABC".to_vec()]);
    }

    #[test]
    fn test_drain_is_noop() {
        let mut stream = MessageStream::new();
        assert!(stream.drain().is_empty());
        stream.received(&[0, 0, 0, 0, 2, 68]);
        assert!(stream.drain().is_empty());
    }

    #[test]
    fn test_body_split_across_segments() {
        let mut stream = MessageStream::new();
        assert!(stream.received(&[0, 0, 0, 0, 2, 68]).is_empty());
        assert_eq!(stream.received(&[69]), vec![b"DE".to_vec()]);
    }

    #[test]
    fn test_completion_with_trailing_message() {
        let mut stream = MessageStream::new();
        assert!(stream.received(&[0, 0, 0, 0, 2, 68]).is_empty());
        let msgs = stream.received(&[69, 0, 0, 0, 0, 1, 70]);
        assert_eq!(msgs, vec![b"DE".to_vec(), b"F".to_vec()]);
    }

    #[test]
    fn test_prefix_split_across_segments() {
        let mut stream = MessageStream::new();
        assert!(stream.received(&[0, 0, 0]).is_empty());
        assert_eq!(stream.received(&[0, 1, 67]), vec![b"C".to_vec()]);
    }

    #[test]
    fn test_trailing_partial_prefix_is_buffered() {
        let mut stream = MessageStream::new();
        let msgs = stream.received(&[0, 0, 0, 0, 1, 67, 0, 0]);
        assert_eq!(msgs, vec![b"C".to_vec()]);
        // The two leftover bytes were the start of the next prefix.
        assert_eq!(stream.received(&[0, 0, 1, 68]), vec![b"D".to_vec()]);
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let mut stream = MessageStream::new();
        let wire = [0u8, 0, 0, 0, 3, 88, 89, 90];
        let mut msgs = Vec::new();
        for byte in wire {
            msgs.extend(stream.received(&[byte]));
        }
        assert_eq!(msgs, vec![b"XYZ".to_vec()]);
    }
}
