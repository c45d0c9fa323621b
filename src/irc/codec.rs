/// IRC line codec: frames a TCP byte stream into IRC messages.
///
/// Splits on `\n` (tolerating a preceding `\r`), parses each line into a
/// [`Message`], and serializes outgoing messages with `\r\n` termination.
///
/// Client and peer links share this codec. Oversized lines are discarded
/// with a warning instead of tearing the link down, so one bad relay line
/// from a peer never drops the whole mesh connection.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::message::{Message, ParseError};

/// IRCv3 allows 8191 bytes of tag data on top of the 512-byte RFC 2812 body.
const MAX_TAGS_LENGTH: usize = 8191;
const MAX_BODY_LENGTH: usize = 512;

/// Maximum accepted line length, excluding the terminator.
pub const MAX_LINE_LENGTH: usize = MAX_TAGS_LENGTH + MAX_BODY_LENGTH;

/// Codec error: either a protocol parse failure or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames IRC messages on line boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec {
    /// True while discarding the tail of an oversized line.
    skipping: bool,
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(lf) = src.iter().position(|b| *b == b'\n') else {
                if self.skipping {
                    src.clear();
                } else if src.len() > MAX_LINE_LENGTH {
                    warn!(bytes = src.len(), "codec: discarding oversized line");
                    src.clear();
                    self.skipping = true;
                }
                return Ok(None);
            };

            let line = src.split_to(lf);
            src.advance(1);

            if std::mem::take(&mut self.skipping) {
                // Tail of a line we already gave up on.
                continue;
            }

            let end = if line.last() == Some(&b'\r') {
                line.len() - 1
            } else {
                line.len()
            };
            if end > MAX_LINE_LENGTH {
                warn!(bytes = end, "codec: skipped oversized line");
                continue;
            }
            if end == 0 {
                // Blank keepalive lines are legal and carry nothing.
                continue;
            }

            let line = std::str::from_utf8(&line[..end])
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            return Ok(Some(Message::parse(line)?));
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
