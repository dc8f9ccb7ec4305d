//! Message framing for both NETCONF wire versions.
//!
//! NETCONF 1.0 terminates every message with the six-byte sentinel
//! `]]>]]>`. NETCONF 1.1 wraps a message in one or more length-prefixed
//! chunks followed by an end-of-chunks marker. Both decoders work
//! incrementally over a `BytesMut` fed by the transport.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::capability::Version;
use crate::error::WireError;

/// NETCONF 1.0 end-of-message sentinel.
pub const ENDTAG: &[u8] = b"]]>]]>";

/// Default maximum size of one buffered message (16 MiB).
pub const DEFAULT_MAX_MSG_SIZE: usize = 16 * 1024 * 1024;

/// Largest chunk size the 1.1 framing permits (RFC 6242: 1..2^31-1).
pub const MAX_CHUNK_SIZE: u64 = (1 << 31) - 1;

/// Encode one message in the framing of the given protocol version.
///
/// The 1.1 encoder always emits a single chunk; outbound messages are never
/// split.
pub fn encode_msg(version: Version, msg: &[u8], dst: &mut BytesMut) -> Result<(), WireError> {
    if msg.is_empty() {
        return Err(WireError::Framing("empty message"));
    }
    match version {
        Version::V10 => {
            dst.reserve(msg.len() + ENDTAG.len());
            dst.put_slice(msg);
            dst.put_slice(ENDTAG);
        }
        Version::V11 => {
            if msg.len() as u64 > MAX_CHUNK_SIZE {
                return Err(WireError::Size(msg.len()));
            }
            let header = format!("\n#{}\n", msg.len());
            dst.reserve(header.len() + msg.len() + 4);
            dst.put_slice(header.as_bytes());
            dst.put_slice(msg);
            dst.put_slice(b"\n##\n");
        }
    }
    Ok(())
}

/// Incremental decoder for the 1.0 end-of-message framing.
///
/// Scans the buffer for the sentinel; everything before it is the message.
/// Bytes between messages (stray whitespace from lenient peers) simply end
/// up at the front of the next message and are left to the XML parser.
#[derive(Debug)]
pub struct EndTagDecoder {
    /// Scan resume position, so repeated feeds stay linear.
    scan_pos: usize,
    max_msg_size: usize,
}

impl EndTagDecoder {
    /// Create a decoder with the default message size limit.
    pub fn new() -> Self {
        Self {
            scan_pos: 0,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
        }
    }

    /// Decode one message from the buffer.
    ///
    /// Returns `Ok(None)` until the sentinel has been seen.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        while self.scan_pos + ENDTAG.len() <= src.len() {
            if &src[self.scan_pos..self.scan_pos + ENDTAG.len()] == ENDTAG {
                let msg = src.split_to(self.scan_pos).freeze();
                src.advance(ENDTAG.len());
                self.scan_pos = 0;
                return Ok(Some(msg));
            }
            self.scan_pos += 1;
        }

        if src.len() > self.max_msg_size {
            return Err(WireError::Size(src.len()));
        }
        // A sentinel may straddle the next feed; keep its possible prefix.
        self.scan_pos = src.len().saturating_sub(ENDTAG.len() - 1);
        Ok(None)
    }
}

impl Default for EndTagDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// States of the 1.1 chunked-framing decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Expecting the LF that opens a chunk header or the end marker.
    Lf,
    /// Expecting `#`.
    Hash,
    /// Expecting the first size digit, or `#` introducing the end marker.
    SizeFirst,
    /// Expecting further size digits or the LF closing the header.
    SizeRest,
    /// Reading chunk data.
    Data,
    /// `##` seen; expecting the final LF.
    EndLf,
}

/// Incremental decoder for the 1.1 chunked framing.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    size: u64,
    remaining: usize,
    msg: BytesMut,
    max_msg_size: usize,
}

impl ChunkedDecoder {
    /// Create a decoder with the default message size limit.
    pub fn new() -> Self {
        Self {
            state: ChunkState::Lf,
            size: 0,
            remaining: 0,
            msg: BytesMut::new(),
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
        }
    }

    /// Decode one message from the buffer.
    ///
    /// Returns `Ok(None)` until the end-of-chunks marker has been consumed.
    /// Any deviation from the chunk grammar is fatal for the session, so
    /// errors leave the decoder unusable.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        while !src.is_empty() {
            match self.state {
                ChunkState::Lf => {
                    if src.get_u8() != b'\n' {
                        return Err(WireError::Framing("expected LF before chunk header"));
                    }
                    self.state = ChunkState::Hash;
                }
                ChunkState::Hash => {
                    if src.get_u8() != b'#' {
                        return Err(WireError::Framing("expected '#' in chunk header"));
                    }
                    self.state = ChunkState::SizeFirst;
                }
                ChunkState::SizeFirst => match src.get_u8() {
                    b'#' => self.state = ChunkState::EndLf,
                    // A leading zero is either a zero-size chunk or a
                    // padded size; both are invalid.
                    d @ b'1'..=b'9' => {
                        self.size = u64::from(d - b'0');
                        self.state = ChunkState::SizeRest;
                    }
                    _ => return Err(WireError::Framing("invalid chunk size")),
                },
                ChunkState::SizeRest => match src.get_u8() {
                    d @ b'0'..=b'9' => {
                        self.size = self.size * 10 + u64::from(d - b'0');
                        if self.size > MAX_CHUNK_SIZE {
                            return Err(WireError::Framing("chunk size overflow"));
                        }
                    }
                    b'\n' => {
                        self.remaining = self.size as usize;
                        if self.msg.len() + self.remaining > self.max_msg_size {
                            return Err(WireError::Size(self.msg.len() + self.remaining));
                        }
                        self.size = 0;
                        self.state = ChunkState::Data;
                    }
                    _ => return Err(WireError::Framing("unterminated chunk size")),
                },
                ChunkState::Data => {
                    let take = self.remaining.min(src.len());
                    self.msg.put_slice(&src[..take]);
                    src.advance(take);
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = ChunkState::Lf;
                    }
                }
                ChunkState::EndLf => {
                    if src.get_u8() != b'\n' {
                        return Err(WireError::Framing("malformed end-of-chunks marker"));
                    }
                    self.state = ChunkState::Lf;
                    if self.msg.is_empty() {
                        return Err(WireError::Framing("message without chunks"));
                    }
                    return Ok(Some(self.msg.split().freeze()));
                }
            }
        }
        Ok(None)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Version-selected frame decoder, fixed at session handshake.
#[derive(Debug)]
pub enum FrameDecoder {
    /// 1.0 end-of-message framing.
    EndTag(EndTagDecoder),
    /// 1.1 chunked framing.
    Chunked(ChunkedDecoder),
}

impl FrameDecoder {
    /// Create a decoder for the given protocol version.
    pub fn new(version: Version) -> Self {
        match version {
            Version::V10 => FrameDecoder::EndTag(EndTagDecoder::new()),
            Version::V11 => FrameDecoder::Chunked(ChunkedDecoder::new()),
        }
    }

    /// Decode one message from the buffer, `Ok(None)` while incomplete.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        match self {
            FrameDecoder::EndTag(d) => d.decode(src),
            FrameDecoder::Chunked(d) => d.decode(src),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(version: Version, input: &[u8]) -> Result<Option<Bytes>, WireError> {
        let mut dec = FrameDecoder::new(version);
        let mut buf = BytesMut::from(input);
        dec.decode(&mut buf)
    }

    #[test]
    fn test_end_tag_roundtrip() {
        let msg = b"<rpc message-id=\"1\"><get/></rpc>";
        let mut buf = BytesMut::new();
        encode_msg(Version::V10, msg, &mut buf).unwrap();
        assert!(buf.ends_with(ENDTAG));

        let decoded = decode_all(Version::V10, &buf).unwrap().unwrap();
        assert_eq!(&decoded[..], &msg[..]);
    }

    #[test]
    fn test_end_tag_incomplete_prefix() {
        let mut dec = EndTagDecoder::new();
        let mut buf = BytesMut::from(&b"<rpc>]]>]]"[..]);
        assert!(dec.decode(&mut buf).unwrap().is_none());

        // Appending the rest of the sentinel completes the message.
        buf.put_slice(b">");
        let decoded = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"<rpc>");
    }

    #[test]
    fn test_end_tag_tolerates_surrounding_whitespace() {
        let decoded = decode_all(Version::V10, b"\n  <rpc/> \n]]>]]>")
            .unwrap()
            .unwrap();
        assert_eq!(&decoded[..], b"\n  <rpc/> \n");
    }

    #[test]
    fn test_end_tag_two_messages() {
        let mut dec = EndTagDecoder::new();
        let mut buf = BytesMut::from(&b"<a/>]]>]]><b/>]]>]]>"[..]);
        assert_eq!(&dec.decode(&mut buf).unwrap().unwrap()[..], b"<a/>");
        assert_eq!(&dec.decode(&mut buf).unwrap().unwrap()[..], b"<b/>");
        assert!(dec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_chunked_roundtrip_exact_bytes() {
        let msg = b"<rpc message-id=\"1000\"><lock/></rpc>";
        let mut buf = BytesMut::new();
        encode_msg(Version::V11, msg, &mut buf).unwrap();

        let expected = format!(
            "\n#{}\n{}\n##\n",
            msg.len(),
            std::str::from_utf8(msg).unwrap()
        );
        assert_eq!(&buf[..], expected.as_bytes());

        let decoded = decode_all(Version::V11, &buf).unwrap().unwrap();
        assert_eq!(&decoded[..], &msg[..]);
    }

    #[test]
    fn test_chunked_identity_for_boundary_sizes() {
        for n in [1usize, 2, 4095, 4096, 4097, 65535] {
            let msg = vec![b'x'; n];
            let mut buf = BytesMut::new();
            encode_msg(Version::V11, &msg, &mut buf).unwrap();
            let decoded = decode_all(Version::V11, &buf).unwrap().unwrap();
            assert_eq!(decoded.len(), n, "size {n}");
            assert_eq!(&decoded[..], &msg[..]);
        }
    }

    #[test]
    fn test_chunked_multiple_chunks_one_message() {
        let mut buf = BytesMut::from(&b"\n#5\nhello\n#6\n world\n##\n"[..]);
        let mut dec = ChunkedDecoder::new();
        let decoded = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello world");
    }

    #[test]
    fn test_chunked_incremental_feed() {
        let mut dec = ChunkedDecoder::new();
        let wire = b"\n#11\nhello world\n##\n";
        let mut buf = BytesMut::new();
        for (i, b) in wire.iter().enumerate() {
            buf.put_u8(*b);
            let res = dec.decode(&mut buf).unwrap();
            if i == wire.len() - 1 {
                assert_eq!(&res.unwrap()[..], b"hello world");
            } else {
                assert!(res.is_none(), "complete message after {} bytes", i + 1);
            }
        }
    }

    #[test]
    fn test_chunked_rejects_zero_size() {
        assert!(decode_all(Version::V11, b"\n#0\nx\n##\n").is_err());
    }

    #[test]
    fn test_chunked_rejects_negative_size() {
        assert!(decode_all(Version::V11, b"\n#-1\nx\n##\n").is_err());
    }

    #[test]
    fn test_chunked_rejects_empty_size() {
        assert!(decode_all(Version::V11, b"\n#\nx\n##\n").is_err());
    }

    #[test]
    fn test_chunked_rejects_leading_zeros() {
        assert!(decode_all(Version::V11, b"\n#01\nx\n##\n").is_err());
    }

    #[test]
    fn test_chunked_rejects_size_overflow() {
        assert!(decode_all(Version::V11, b"\n#2147483648\nx").is_err());
        // The largest permitted size is still a valid header.
        let mut dec = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"\n#2147483647\n"[..]);
        // Header parses; the data obviously exceeds the buffered limit.
        assert!(matches!(dec.decode(&mut buf), Err(WireError::Size(_))));
    }

    #[test]
    fn test_chunked_rejects_missing_size_lf() {
        assert!(decode_all(Version::V11, b"\n#5x\nhello\n##\n").is_err());
    }

    #[test]
    fn test_chunked_rejects_bare_end_marker() {
        assert!(decode_all(Version::V11, b"\n##\n").is_err());
    }

    #[test]
    fn test_encode_rejects_empty_message() {
        let mut buf = BytesMut::new();
        assert!(encode_msg(Version::V10, b"", &mut buf).is_err());
        assert!(encode_msg(Version::V11, b"", &mut buf).is_err());
    }
}
