//! Wire protocol codec for the broker-peer socket.
//!
//! ASCII header, binary-safe body. One frame:
//!
//! ```text
//! tlength:<N>;type:<T1>;<T2>;...;<Tk>;length:<L1>;<L2>;...;<Lk>;data:<B1><B2>...<Bk>
//! ```
//!
//! `<N>` is the decimal byte count from the first character of `type:` to the
//! last body byte. Each `<Ti>` is exactly 3 uppercase letters. Each `<Li>` is
//! decimal. `<Bi>` is an arbitrary byte run of length `<Li>`.
//!
//! Segment bodies are positionally ordered and reassembled by walking a
//! cursor forward by each segment's declared length, never by splitting the
//! body on a delimiter — body bytes are binary-safe and may contain `;`.

use thiserror::Error;

/// Maximum single-read size. Frames must not exceed this many bytes.
pub const MAX_FRAME_SIZE: usize = crate::constants::FRAME_BUFFER;

/// The wire-level segment type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentType {
    /// A command to execute on the peer's host.
    Cmd,
    /// Console output relayed to a peer.
    Out,
    /// An error reply.
    Err,
    /// Current-working-directory update.
    Cwd,
    /// Flag-handshake segment (setup and win-condition traffic).
    Flg,
    /// Key-exchange segment for the optional transport-encryption collaborator.
    ///
    /// The broker forwards this verbatim without interpreting the payload.
    Key,
}

impl SegmentType {
    /// The exact 3-letter uppercase wire tag for this segment type.
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Cmd => "CMD",
            Self::Out => "OUT",
            Self::Err => "ERR",
            Self::Cwd => "CWD",
            Self::Flg => "FLG",
            Self::Key => "KEY",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "CMD" => Some(Self::Cmd),
            "OUT" => Some(Self::Out),
            "ERR" => Some(Self::Err),
            "CWD" => Some(Self::Cwd),
            "FLG" => Some(Self::Flg),
            "KEY" => Some(Self::Key),
            _ => None,
        }
    }
}

/// One (TYPE, BODY) pair inside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// The segment's wire type tag.
    pub ty: SegmentType,
    /// The segment's raw body bytes.
    pub data: Vec<u8>,
}

impl Segment {
    /// Build a segment from a type and a UTF-8 body. Convenience used
    /// throughout the broker for `OUT`/`ERR`/`FLG` replies, which are always
    /// textual in practice.
    pub fn text(ty: SegmentType, body: impl Into<String>) -> Self {
        Self { ty, data: body.into().into_bytes() }
    }
}

/// A decoded frame: one or more ordered segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    /// The frame's segments, in wire order.
    pub segments: Vec<Segment>,
}

impl Frame {
    /// Build a frame from a single segment. The common case for broker replies.
    pub fn single(ty: SegmentType, body: impl Into<String>) -> Self {
        Self { segments: vec![Segment::text(ty, body)] }
    }

    /// Encode this frame into wire bytes.
    ///
    /// Computes `<Li>` from `|B_i|` and `<N>` from the complete post-`type:`
    /// payload. `emit` is injective modulo segment order: `parse(emit(F)) = F`
    /// for any frame with well-formed segments.
    pub fn encode(&self) -> Vec<u8> {
        let types = self
            .segments
            .iter()
            .map(|s| s.ty.as_tag())
            .collect::<Vec<_>>()
            .join(";");
        let lengths = self
            .segments
            .iter()
            .map(|s| s.data.len().to_string())
            .collect::<Vec<_>>()
            .join(";");

        let mut payload = format!("type:{types};length:{lengths};data:").into_bytes();
        for segment in &self.segments {
            payload.extend_from_slice(&segment.data);
        }

        let mut out = format!("tlength:{};", payload.len()).into_bytes();
        out.extend_from_slice(&payload);
        out
    }
}

/// Errors the Framer can detect while decoding a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A required literal (`tlength:`, `type:`, `length:`, `data:`) was
    /// absent or out of order.
    #[error("malformed frame header")]
    MalformedHeader,
    /// `Σ<Li>` did not match the declared length, or the type/length
    /// segment counts differed.
    #[error("frame length mismatch")]
    LengthMismatch,
    /// The buffer was shorter than the frame's declared length and no more
    /// data will arrive (the connection closed mid-frame).
    #[error("frame truncated")]
    TruncatedBody,
}

/// Incremental frame decoder. Feeds bytes from a TCP stream, handling
/// multi-frame-per-read concatenation and frames split across reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Returns true if the decoder holds an incomplete frame.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete trailing data is buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some((frame, consumed)) = try_parse(&self.buf)? {
            frames.push(frame);
            self.buf.drain(..consumed);
        }

        Ok(frames)
    }

    /// Call when the peer socket has closed. Returns `TruncatedBody` if a
    /// partial frame remains buffered.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.has_partial() {
            Err(FrameError::TruncatedBody)
        } else {
            Ok(())
        }
    }

    /// Recover from a malformed frame by dropping the buffer up to the next
    /// recognisable `tlength:` prefix, per §7's malformed-frame policy:
    /// never acknowledge it to the peer, just resynchronize and continue.
    pub fn recover(&mut self) {
        const TLENGTH_PREFIX: &[u8] = b"tlength:";
        let resync_at = self.buf.windows(TLENGTH_PREFIX.len()).skip(1).position(|w| w == TLENGTH_PREFIX);
        match resync_at {
            Some(offset) => self.buf.drain(..=offset),
            None => self.buf.drain(..),
        };
    }
}

/// Attempt to parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` holds an incomplete frame (wait for more
/// bytes), `Ok(Some((frame, consumed)))` on success, or `Err` on a malformed
/// header / length mismatch in what has already arrived.
fn try_parse(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    const TLENGTH_PREFIX: &[u8] = b"tlength:";

    if buf.len() < TLENGTH_PREFIX.len() {
        return Ok(None);
    }
    if !buf.starts_with(TLENGTH_PREFIX) {
        return Err(FrameError::MalformedHeader);
    }

    let after_prefix = &buf[TLENGTH_PREFIX.len()..];
    let Some(semi) = after_prefix.iter().position(|&b| b == b';') else {
        // No terminator yet; could still be an in-flight digit run, unless
        // it's already too long to be a sane decimal length.
        return if after_prefix.len() > 20 { Err(FrameError::MalformedHeader) } else { Ok(None) };
    };

    let n_str = std::str::from_utf8(&after_prefix[..semi]).map_err(|_| FrameError::MalformedHeader)?;
    let n: usize = n_str.parse().map_err(|_| FrameError::MalformedHeader)?;
    if n > MAX_FRAME_SIZE {
        return Err(FrameError::LengthMismatch);
    }

    let header_len = TLENGTH_PREFIX.len() + semi + 1;
    let total = header_len + n;
    if buf.len() < total {
        return Ok(None);
    }

    let rest = &buf[header_len..total];
    let frame = parse_payload(rest)?;
    Ok(Some((frame, total)))
}

/// Parse the `type:...;length:...;data:...` payload whose total byte count
/// already matches the declared `tlength`.
fn parse_payload(rest: &[u8]) -> Result<Frame, FrameError> {
    const TYPE_PREFIX: &[u8] = b"type:";
    const LENGTH_MARKER: &[u8] = b";length:";
    const DATA_MARKER: &[u8] = b";data:";

    if !rest.starts_with(TYPE_PREFIX) {
        return Err(FrameError::MalformedHeader);
    }
    let after_type = &rest[TYPE_PREFIX.len()..];

    let length_at = find_subslice(after_type, LENGTH_MARKER).ok_or(FrameError::MalformedHeader)?;
    let types_str =
        std::str::from_utf8(&after_type[..length_at]).map_err(|_| FrameError::MalformedHeader)?;

    let after_length = &after_type[length_at + LENGTH_MARKER.len()..];
    let data_at = find_subslice(after_length, DATA_MARKER).ok_or(FrameError::MalformedHeader)?;
    let lengths_str =
        std::str::from_utf8(&after_length[..data_at]).map_err(|_| FrameError::MalformedHeader)?;

    let body = &after_length[data_at + DATA_MARKER.len()..];

    let types: Vec<&str> = types_str.split(';').collect();
    let lengths: Vec<&str> = lengths_str.split(';').collect();
    if types.len() != lengths.len() || types.is_empty() {
        return Err(FrameError::LengthMismatch);
    }

    let mut segments = Vec::with_capacity(types.len());
    let mut cursor = 0usize;
    let mut total_len = 0usize;
    for (tag, len_str) in types.iter().zip(lengths.iter()) {
        let ty = SegmentType::from_tag(tag).ok_or(FrameError::MalformedHeader)?;
        let len: usize = len_str.parse().map_err(|_| FrameError::LengthMismatch)?;
        total_len += len;
        if cursor + len > body.len() {
            return Err(FrameError::LengthMismatch);
        }
        segments.push(Segment { ty, data: body[cursor..cursor + len].to_vec() });
        cursor += len;
    }

    if total_len != body.len() {
        return Err(FrameError::LengthMismatch);
    }

    Ok(Frame { segments })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
