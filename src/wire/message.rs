use std::io::{Read, Write};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::header::{Header, OpCode};
use crate::{
    bson::Document,
    error::{ErrorKind, Result},
};

/// The fixed per-message overhead: 16 header bytes, 4 flag bytes, and the
/// payload type byte. `messageLength` is always this plus the BSON body.
pub(crate) const MESSAGE_OVERHEAD: usize = Header::LENGTH + 4 + 1;

/// The largest response the client accepts.
pub(crate) const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

bitflags! {
    /// The bitwise flags for an `OP_MSG` as defined in the wire spec. The
    /// client always sends an empty set.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents an `OP_MSG` wire protocol operation with a single payload of
/// type 0.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) document: Document,
}

impl Message {
    /// Creates a request message wrapping the given command document.
    pub(crate) fn new(document: Document, request_id: i32) -> Self {
        Self {
            request_id,
            response_to: 0,
            flags: MessageFlags::empty(),
            document,
        }
    }

    /// Serializes the message and writes the bytes to `writer`. The encoded
    /// `messageLength` is exactly `MESSAGE_OVERHEAD + len(bson_body)`.
    pub(crate) fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut body = Vec::new();
        self.document.to_writer(&mut body)?;

        let length = MESSAGE_OVERHEAD + body.len();
        if length > MAX_MESSAGE_SIZE {
            return Err(ErrorKind::Framing {
                message: format!(
                    "message of {} bytes exceeds the {} byte maximum",
                    length, MAX_MESSAGE_SIZE
                ),
            }
            .into());
        }

        let header = Header {
            length: length as i32,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer)?;
        writer.write_u32::<LittleEndian>(self.flags.bits())?;
        writer.write_u8(0)?;
        writer.write_all(&body)?;

        Ok(())
    }

    /// Reads bytes from `reader` and deserializes them into a message. A
    /// message whose length is exactly `MESSAGE_OVERHEAD` decodes as an empty
    /// document.
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader)?;
        validate_length(header.length)?;

        let flags = MessageFlags::from_bits_truncate(reader.read_u32::<LittleEndian>()?);

        let payload_type = reader.read_u8()?;
        if payload_type != 0 {
            return Err(ErrorKind::Framing {
                message: format!("expected a payload of type 0, got type {}", payload_type),
            }
            .into());
        }

        let body_length = header.length as usize - MESSAGE_OVERHEAD;
        let document = if body_length == 0 {
            Document::new()
        } else {
            Document::from_reader(reader.take(body_length as u64)).map_err(|e| {
                ErrorKind::Framing {
                    message: format!("malformed message body: {}", e),
                }
            })?
        };

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            document,
        })
    }
}

/// Decodes the length prefix of a partially received frame, validating it
/// against the frame bounds. Returns `None` until the four prefix bytes have
/// arrived.
pub(crate) fn expected_message_length(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    validate_length(length)?;
    Ok(Some(length as usize))
}

fn validate_length(length: i32) -> Result<()> {
    if (length as isize) < MESSAGE_OVERHEAD as isize {
        return Err(ErrorKind::Framing {
            message: format!(
                "message length {} is below the {} byte minimum",
                length, MESSAGE_OVERHEAD
            ),
        }
        .into());
    }
    if length as usize > MAX_MESSAGE_SIZE {
        return Err(ErrorKind::Framing {
            message: format!(
                "message length {} exceeds the {} byte maximum",
                length, MAX_MESSAGE_SIZE
            ),
        }
        .into());
    }
    Ok(())
}
