//! Client message decoding: turns a raw [`Frame`](crate::codec::Frame) into
//! a typed [`ClientMessage`] covering every client→server message type.

use bytes::Bytes;

use crate::codec::Frame;
use crate::error::EdgeError;
use crate::types::TypeId;

#[derive(Debug)]
pub enum ClientMessage {
    Auth {
        user: String,
        password: String,
        database: String,
    },
    Parse {
        statement_name: String,
        source: String,
    },
    Describe {
        mode: u8,
        statement_name: String,
    },
    Execute {
        statement_name: String,
        bind_args: Bytes,
    },
    OpportunisticExecute {
        source: String,
        input_type_id: TypeId,
        output_type_id: TypeId,
        bind_args: Bytes,
    },
    SimpleQuery {
        source: String,
    },
    LegacyScript {
        lang: u8,
        source: String,
    },
    Sync,
    Flush,
    Unsupported(u8),
}

fn read_type_id(frame: &mut crate::codec::FrameReader<'_>) -> Result<TypeId, EdgeError> {
    let bytes = frame.read_bytes(16)?;
    let mut id = [0u8; 16];
    id.copy_from_slice(bytes);
    Ok(id)
}

pub fn decode(frame: &Frame) -> Result<ClientMessage, EdgeError> {
    let tag = frame.tag;
    let mut r = frame.reader();
    Ok(match tag {
        b'0' => {
            let user = r.read_len_string()?;
            let password = r.read_len_string()?;
            let database = r.read_len_string()?;
            ClientMessage::Auth {
                user,
                password,
                database,
            }
        }
        b'P' => {
            let statement_name = r.read_cstr()?;
            let source = r.read_cstr()?;
            ClientMessage::Parse {
                statement_name,
                source,
            }
        }
        b'D' => {
            let mode = r.read_u8()?;
            let statement_name = r.read_cstr()?;
            ClientMessage::Describe {
                mode,
                statement_name,
            }
        }
        b'E' => {
            let statement_name = r.read_cstr()?;
            let bind_args = Bytes::copy_from_slice(r.read_remaining());
            ClientMessage::Execute {
                statement_name,
                bind_args,
            }
        }
        b'O' => {
            let source = r.read_cstr()?;
            let input_type_id = read_type_id(&mut r)?;
            let output_type_id = read_type_id(&mut r)?;
            let bind_args = Bytes::copy_from_slice(r.read_remaining());
            ClientMessage::OpportunisticExecute {
                source,
                input_type_id,
                output_type_id,
                bind_args,
            }
        }
        b'Q' => {
            let source = r.read_cstr()?;
            ClientMessage::SimpleQuery { source }
        }
        b'L' => {
            let lang = r.read_u8()?;
            let source = r.read_cstr()?;
            ClientMessage::LegacyScript { lang, source }
        }
        b'S' => ClientMessage::Sync,
        b'H' => ClientMessage::Flush,
        other => ClientMessage::Unsupported(other),
    })
}
