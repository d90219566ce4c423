use std::{
    io::{Read, Write},
    sync::atomic::{AtomicI32, Ordering},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{ErrorKind, Result};

/// The wire protocol op codes understood by this client.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    fn from_i32(i: i32) -> Result<Self> {
        match i {
            2013 => Ok(OpCode::Message),
            other => Err(ErrorKind::Framing {
                message: format!("invalid wire protocol opcode: {}", other),
            }
            .into()),
        }
    }
}

/// The header prefixing any wire protocol message.
#[derive(Debug)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    /// Serializes the header and writes the bytes to `writer`.
    pub(crate) fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<LittleEndian>(self.length)?;
        writer.write_i32::<LittleEndian>(self.request_id)?;
        writer.write_i32::<LittleEndian>(self.response_to)?;
        writer.write_i32::<LittleEndian>(self.op_code as i32)?;

        Ok(())
    }

    /// Reads bytes from `reader` and deserializes them into a header.
    pub(crate) fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            length: reader.read_i32::<LittleEndian>()?,
            request_id: reader.read_i32::<LittleEndian>()?,
            response_to: reader.read_i32::<LittleEndian>()?,
            op_code: OpCode::from_i32(reader.read_i32::<LittleEndian>()?)?,
        })
    }
}

/// Allocates the next request id. Each connection takes one id at connect
/// time and reuses it for the lifetime of the connection.
pub(crate) fn new_request_id() -> i32 {
    static CURRENT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

    CURRENT_REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}
