use bson::{RawDocument, RawDocumentBuf};
use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::header::{Header, OpCode};
use crate::error::{Error, Result};

/// The server's message-size ceiling; the codec refuses to read or write a frame whose
/// `length` exceeds this, per spec.md §4.1. Configurable by the connection that owns the
/// codec (e.g. lowered to a server-advertised `maxMessageSizeBytes`).
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

bitflags! {
    /// OP_MSG `flagBits`. Only the bits spec.md §4.1 calls out are modeled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct MsgFlags: u32 {
        const CHECKSUM_PRESENT = 1 << 0;
        const MORE_TO_COME = 1 << 1;
        const EXHAUST_ALLOWED = 1 << 16;
    }
}

/// Reads one length-prefixed BSON document from the front of `buf`, per the teacher's
/// length-then-slice idiom (rather than handing `RawDocument::from_bytes` a slice that runs
/// past the document's end, which it rejects since the declared length and slice length must
/// match exactly). Returns the document and how many bytes it occupied.
fn read_one_document(buf: &[u8], context: &str) -> Result<(RawDocumentBuf, usize)> {
    if buf.len() < 4 {
        return Err(Error::protocol(format!("{context}: truncated document length")));
    }
    let len = i32::from_le_bytes(buf[0..4].try_into().unwrap());
    if len < 4 || len as usize > buf.len() {
        return Err(Error::protocol(format!("{context}: invalid document length {len}")));
    }
    let len = len as usize;
    let doc = RawDocument::from_bytes(&buf[..len])
        .map_err(|e| Error::protocol(format!("{context}: {e}")))?;
    Ok((doc.to_raw_document_buf(), len))
}

/// A named document sequence (OP_MSG section kind 1), used for batching `insert.documents`,
/// `update.updates`, `delete.deletes` when the batch has more than one element.
#[derive(Debug, Clone)]
pub(crate) struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<RawDocumentBuf>,
}

/// A parsed or to-be-written OP_MSG frame.
#[derive(Debug)]
pub(crate) struct Message {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: MsgFlags,
    /// The kind-0 section: exactly one body document.
    pub document_payload: RawDocumentBuf,
    /// Any kind-1 sections attached to the outgoing request.
    pub document_sequences: Vec<DocumentSequence>,
}

impl Message {
    pub(crate) fn new_request(
        request_id: i32,
        body: RawDocumentBuf,
        document_sequences: Vec<DocumentSequence>,
    ) -> Self {
        Self {
            request_id,
            response_to: 0,
            flags: MsgFlags::empty(),
            document_payload: body,
            document_sequences,
        }
    }

    /// Serializes this message as an OP_MSG frame and writes it to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        max_message_size_bytes: i32,
    ) -> Result<()> {
        let mut body_buf = Vec::new();
        // section kind 0: a single 1-byte kind tag followed by the body document.
        body_buf.push(0u8);
        body_buf.extend_from_slice(self.document_payload.as_bytes());

        for seq in &self.document_sequences {
            body_buf.push(1u8);
            let ident_bytes = seq.identifier.as_bytes();
            let docs_bytes: usize = seq.documents.iter().map(|d| d.as_bytes().len()).sum();
            // size field + cstring identifier + documents
            let size = 4 + ident_bytes.len() + 1 + docs_bytes;
            body_buf.extend_from_slice(&(size as i32).to_le_bytes());
            body_buf.extend_from_slice(ident_bytes);
            body_buf.push(0u8);
            for doc in &seq.documents {
                body_buf.extend_from_slice(doc.as_bytes());
            }
        }

        let total_len = Header::LENGTH + 4 /* flagBits */ + body_buf.len();
        if total_len as i64 > max_message_size_bytes as i64 {
            return Err(Error::protocol(format!(
                "outgoing message of {total_len} bytes exceeds max message size of \
                 {max_message_size_bytes} bytes"
            )));
        }

        let header = Header {
            length: total_len as i32,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };
        header.write_to(writer).await?;
        writer.write_all(&self.flags.bits().to_le_bytes()).await?;
        writer.write_all(&body_buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one full OP_MSG frame from `reader`, given its already-parsed header.
    /// Buffers the remainder of the frame until all `length` bytes are available, per
    /// spec.md §4.1 ("Partial reads buffer until full length available").
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        header: Header,
        max_message_size_bytes: i32,
    ) -> Result<Self> {
        if header.length > max_message_size_bytes || header.length < Header::LENGTH as i32 {
            return Err(Error::protocol(format!(
                "frame length {} outside permitted range (max {})",
                header.length, max_message_size_bytes
            )));
        }

        let remaining = header.length as usize - Header::LENGTH;
        let mut buf = vec![0u8; remaining];
        reader.read_exact(&mut buf).await?;

        let flags = MsgFlags::from_bits_truncate(u32::from_le_bytes(
            buf[0..4].try_into().map_err(|_| Error::protocol("short flagBits"))?,
        ));

        let mut offset = 4;
        let mut document_payload: Option<RawDocumentBuf> = None;
        let mut document_sequences = Vec::new();

        while offset < buf.len() {
            let kind = buf[offset];
            offset += 1;
            match kind {
                0 => {
                    let (doc, len) = read_one_document(&buf[offset..], "bad section 0")?;
                    if document_payload.is_none() {
                        document_payload = Some(doc);
                    }
                    offset += len;
                }
                1 => {
                    if offset + 4 > buf.len() {
                        return Err(Error::protocol("truncated section 1 size"));
                    }
                    let size = i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
                    let section_end = offset + size as usize;
                    if size < 4 || section_end > buf.len() {
                        return Err(Error::protocol("invalid section 1 size"));
                    }
                    let mut cursor = offset + 4;
                    let ident_start = cursor;
                    while cursor < section_end && buf[cursor] != 0 {
                        cursor += 1;
                    }
                    let identifier = String::from_utf8_lossy(&buf[ident_start..cursor]).into_owned();
                    cursor += 1; // skip NUL
                    let mut documents = Vec::new();
                    while cursor < section_end {
                        let (doc, len) =
                            read_one_document(&buf[cursor..section_end], "bad sequence doc")?;
                        documents.push(doc);
                        cursor += len;
                    }
                    document_sequences.push(DocumentSequence {
                        identifier,
                        documents,
                    });
                    offset = section_end;
                }
                other => {
                    return Err(Error::protocol(format!("unknown OP_MSG section kind {other}")));
                }
            }
        }

        let document_payload = document_payload
            .ok_or_else(|| Error::protocol("OP_MSG frame contained no section kind 0"))?;

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            document_payload,
            document_sequences,
        })
    }
}

/// A legacy OP_REPLY frame, parsed when the handshake indicates `maxWireVersion < 6`
/// (spec.md §4.1).
#[derive(Debug)]
pub(crate) struct LegacyReply {
    pub response_flags: u32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<RawDocumentBuf>,
}

impl LegacyReply {
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        header: Header,
        max_message_size_bytes: i32,
    ) -> Result<Self> {
        if header.length > max_message_size_bytes {
            return Err(Error::protocol("legacy reply exceeds max message size"));
        }
        let response_flags = reader.read_u32_le().await?;
        let cursor_id = reader.read_i64_le().await?;
        let starting_from = reader.read_i32_le().await?;
        let number_returned = reader.read_i32_le().await?;

        let remaining =
            header.length as usize - Header::LENGTH - 4 - 8 - 4 - 4;
        let mut buf = vec![0u8; remaining];
        reader.read_exact(&mut buf).await?;

        let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
        let mut offset = 0;
        while offset < buf.len() {
            let (doc, len) = read_one_document(&buf[offset..], "bad legacy reply doc")?;
            documents.push(doc);
            offset += len;
        }

        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            documents,
        })
    }
}

/// Builds a legacy OP_QUERY frame, used only for the `isMaster` handshake fallback when a
/// server has not yet indicated wire version >= 6 support for OP_MSG.
pub(crate) async fn write_legacy_query<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: i32,
    full_collection_name: &str,
    query: &RawDocumentBuf,
) -> Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes()); // flags
    body.extend_from_slice(full_collection_name.as_bytes());
    body.push(0);
    body.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
    body.extend_from_slice(&(-1i32).to_le_bytes()); // numberToReturn
    body.extend_from_slice(query.as_bytes());

    let total_len = Header::LENGTH + body.len();
    let header = Header {
        length: total_len as i32,
        request_id,
        response_to: 0,
        op_code: OpCode::Query,
    };
    header.write_to(writer).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::rawdoc;

    #[tokio::test]
    async fn op_msg_round_trip_single_section() {
        let body = rawdoc! { "ping": 1 };
        let msg = Message::new_request(7, body.clone(), vec![]);

        let mut buf = Vec::new();
        msg.write_to(&mut buf, DEFAULT_MAX_MESSAGE_SIZE_BYTES)
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let header = Header::read_from(&mut cursor).await.unwrap();
        assert_eq!(header.request_id, 7);
        assert_eq!(header.op_code, OpCode::Message);

        let parsed = Message::read_from(&mut cursor, header, DEFAULT_MAX_MESSAGE_SIZE_BYTES)
            .await
            .unwrap();
        assert_eq!(parsed.document_payload.as_bytes(), body.as_bytes());
        assert!(parsed.document_sequences.is_empty());
    }

    #[tokio::test]
    async fn op_msg_round_trip_with_document_sequence() {
        let body = rawdoc! { "insert": "coll" };
        let docs = vec![rawdoc! { "n": 0 }, rawdoc! { "n": 1 }];
        let msg = Message::new_request(
            1,
            body,
            vec![DocumentSequence {
                identifier: "documents".to_string(),
                documents: docs.clone(),
            }],
        );

        let mut buf = Vec::new();
        msg.write_to(&mut buf, DEFAULT_MAX_MESSAGE_SIZE_BYTES)
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let header = Header::read_from(&mut cursor).await.unwrap();
        let parsed = Message::read_from(&mut cursor, header, DEFAULT_MAX_MESSAGE_SIZE_BYTES)
            .await
            .unwrap();

        assert_eq!(parsed.document_sequences.len(), 1);
        assert_eq!(parsed.document_sequences[0].identifier, "documents");
        assert_eq!(parsed.document_sequences[0].documents.len(), 2);
        assert_eq!(parsed.document_sequences[0].documents[0].as_bytes(), docs[0].as_bytes());
        assert_eq!(parsed.document_sequences[0].documents[1].as_bytes(), docs[1].as_bytes());
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let body = rawdoc! { "ping": 1 };
        let msg = Message::new_request(1, body, vec![]);
        let result = msg.write_to(&mut Vec::new(), 10).await;
        assert!(result.is_err());
    }

    /// A legacy `OP_REPLY` carrying more than one document must decode each one using its own
    /// declared length, not the whole remaining buffer — the bug this test guards against
    /// handed `RawDocument::from_bytes` a slice spanning every remaining document and failed.
    #[tokio::test]
    async fn legacy_reply_decodes_every_document_by_its_own_length() {
        let docs = vec![
            rawdoc! { "n": 0 },
            rawdoc! { "n": 1 },
            rawdoc! { "n": 2, "extra": "padding so lengths differ" },
        ];

        let mut buf = Vec::new();
        buf.extend_from_slice(&0i32.to_le_bytes()); // responseFlags
        buf.extend_from_slice(&0i64.to_le_bytes()); // cursorID
        buf.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
        buf.extend_from_slice(&(docs.len() as i32).to_le_bytes()); // numberReturned
        for doc in &docs {
            buf.extend_from_slice(doc.as_bytes());
        }

        let header = Header {
            length: (Header::LENGTH + buf.len()) as i32,
            request_id: 0,
            response_to: 9,
            op_code: OpCode::Reply,
        };

        let mut cursor = std::io::Cursor::new(buf);
        let reply = LegacyReply::read_from(&mut cursor, header, DEFAULT_MAX_MESSAGE_SIZE_BYTES)
            .await
            .unwrap();

        assert_eq!(reply.documents.len(), docs.len());
        for (parsed, original) in reply.documents.iter().zip(docs.iter()) {
            assert_eq!(parsed.as_bytes(), original.as_bytes());
        }
    }
}
