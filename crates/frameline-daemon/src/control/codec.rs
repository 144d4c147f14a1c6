//! Control-channel codecs.
//!
//! Both directions are implemented as [`tokio_util::codec`] pairs so
//! the service and test clients share one wire definition:
//!
//! - [`CommandCodec`]: decodes client command lines, encodes framed
//!   replies. Used by the service.
//! - [`ReplyCodec`]: decodes framed replies, encodes command lines.
//!   Used by clients (and the integration tests).
//!
//! Reads are bounded: a command line longer than [`MAX_COMMAND_LINE`]
//! or a reply larger than [`MAX_REPLY_SIZE`] is rejected before any
//! unbounded buffering can occur.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Start marker of a service reply.
pub const REPLY_PREAMBLE: &[u8] = b"%%{";

/// End marker of a service reply.
pub const REPLY_POSTAMBLE: &[u8] = b"}%%\r\n";

/// Longest accepted client command line, bytes.
pub const MAX_COMMAND_LINE: usize = 8 * 1024;

/// Largest accepted reply payload, bytes.
pub const MAX_REPLY_SIZE: usize = 1024 * 1024;

/// Control-channel wire errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// A command line exceeded [`MAX_COMMAND_LINE`].
    #[error("command line of {len} bytes exceeds limit {max}")]
    LineTooLong {
        /// Observed length so far.
        len: usize,
        /// Limit.
        max: usize,
    },

    /// A reply exceeded [`MAX_REPLY_SIZE`].
    #[error("reply of {len} bytes exceeds limit {max}")]
    ReplyTooLarge {
        /// Observed length so far.
        len: usize,
        /// Limit.
        max: usize,
    },

    /// Bytes on the channel were not valid UTF-8.
    #[error("control channel carried non-utf8 data")]
    NonUtf8,

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Service-side codec: command lines in, framed replies out.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandCodec;

impl Decoder for CommandCodec {
    type Item = String;
    type Error = ControlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ControlError> {
        loop {
            let Some(newline) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_COMMAND_LINE {
                    return Err(ControlError::LineTooLong {
                        len: src.len(),
                        max: MAX_COMMAND_LINE,
                    });
                }
                return Ok(None);
            };
            if newline > MAX_COMMAND_LINE {
                return Err(ControlError::LineTooLong {
                    len: newline,
                    max: MAX_COMMAND_LINE,
                });
            }

            let line = src.split_to(newline + 1);
            let text =
                std::str::from_utf8(&line[..newline]).map_err(|_| ControlError::NonUtf8)?;
            // Strip the optional '%' command sigil and surrounding
            // whitespace; blank lines are not commands.
            let text = text.trim().trim_start_matches('%').trim_start();
            if !text.is_empty() {
                return Ok(Some(text.to_owned()));
            }
        }
    }
}

impl Encoder<String> for CommandCodec {
    type Error = ControlError;

    fn encode(&mut self, payload: String, dst: &mut BytesMut) -> Result<(), ControlError> {
        if payload.len() > MAX_REPLY_SIZE {
            return Err(ControlError::ReplyTooLarge {
                len: payload.len(),
                max: MAX_REPLY_SIZE,
            });
        }
        dst.reserve(REPLY_PREAMBLE.len() + payload.len() + REPLY_POSTAMBLE.len());
        dst.put_slice(REPLY_PREAMBLE);
        dst.put_slice(payload.as_bytes());
        dst.put_slice(REPLY_POSTAMBLE);
        Ok(())
    }
}

/// Client-side codec: framed replies in, command lines out.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = String;
    type Error = ControlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ControlError> {
        // Drop any junk before the start marker, keeping a partial
        // marker suffix in the buffer.
        let Some(start) = find(src, REPLY_PREAMBLE) else {
            let keep = partial_suffix(src, REPLY_PREAMBLE);
            let drop = src.len() - keep;
            src.advance(drop);
            return Ok(None);
        };
        src.advance(start + REPLY_PREAMBLE.len());

        let Some(end) = find(src, REPLY_POSTAMBLE) else {
            if src.len() > MAX_REPLY_SIZE {
                return Err(ControlError::ReplyTooLarge {
                    len: src.len(),
                    max: MAX_REPLY_SIZE,
                });
            }
            // Put the marker back conceptually: decode restarts from a
            // clean buffer next time, so re-insert the preamble.
            let mut rebuilt = BytesMut::with_capacity(REPLY_PREAMBLE.len() + src.len());
            rebuilt.put_slice(REPLY_PREAMBLE);
            rebuilt.put_slice(src);
            *src = rebuilt;
            return Ok(None);
        };

        let payload = src.split_to(end);
        src.advance(REPLY_POSTAMBLE.len());
        let text = std::str::from_utf8(&payload).map_err(|_| ControlError::NonUtf8)?;
        Ok(Some(text.to_owned()))
    }
}

impl Encoder<String> for ReplyCodec {
    type Error = ControlError;

    fn encode(&mut self, command: String, dst: &mut BytesMut) -> Result<(), ControlError> {
        if command.len() > MAX_COMMAND_LINE {
            return Err(ControlError::LineTooLong {
                len: command.len(),
                max: MAX_COMMAND_LINE,
            });
        }
        dst.reserve(command.len() + 2);
        dst.put_u8(b'%');
        dst.put_slice(command.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest suffix of `buf` that is a proper prefix of
/// `marker` (bytes that may yet complete into the marker).
fn partial_suffix(buf: &[u8], marker: &[u8]) -> usize {
    let max = marker.len().saturating_sub(1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&n| buf[buf.len() - n..] == marker[..n])
        .unwrap_or(0)
}
