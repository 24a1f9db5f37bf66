//! OP_MSG / legacy OP_QUERY / OP_REPLY framing (spec.md §4.1).

pub(crate) mod header;
pub(crate) mod message;
pub(crate) mod request_id;

pub(crate) use header::{Header, OpCode};
pub(crate) use message::{
    DocumentSequence, LegacyReply, Message, MsgFlags, DEFAULT_MAX_MESSAGE_SIZE_BYTES,
};
pub(crate) use request_id::RequestIdGenerator;
