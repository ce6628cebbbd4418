//! Version 8 wire framing: each message type maps to one protobuf
//! message. Encode writes protobuf bytes; decode parses and fills the
//! domain object, yielding `None` on malformed input.

use bytes::{Buf, Bytes, BytesMut};
use prost::Message;

use crate::core::types::DocumentId;
use crate::protocol::messages::*;
use crate::protocol::registry::RoutableFactory;

#[derive(Clone, PartialEq, Message)]
pub struct GetDocumentRequest {
    #[prost(string, tag = "1")]
    pub document_id: String,
    #[prost(string, tag = "2")]
    pub field_set: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetDocumentResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub document: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub last_modified: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PutDocumentRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub document: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub force_assign_timestamp: u64,
    #[prost(string, tag = "3")]
    pub condition: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PutDocumentResponse {
    #[prost(uint64, tag = "1")]
    pub modification_timestamp: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveDocumentRequest {
    #[prost(string, tag = "1")]
    pub document_id: String,
    #[prost(string, tag = "2")]
    pub condition: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveDocumentResponse {
    #[prost(bool, tag = "1")]
    pub was_found: bool,
    #[prost(uint64, tag = "2")]
    pub modification_timestamp: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpdateDocumentRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub update: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub expected_old_timestamp: u64,
    #[prost(uint64, tag = "3")]
    pub force_assign_timestamp: u64,
    #[prost(string, tag = "4")]
    pub condition: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpdateDocumentResponse {
    #[prost(bool, tag = "1")]
    pub was_found: bool,
    #[prost(uint64, tag = "2")]
    pub modification_timestamp: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveLocationRequest {
    #[prost(string, tag = "1")]
    pub selection: String,
    #[prost(string, tag = "2")]
    pub bucket_space: String,
}

fn decode_proto<M: Message + Default>(data: &mut Bytes) -> Option<M> {
    let raw = data.copy_to_bytes(data.remaining());
    match M::decode(raw) {
        Ok(message) => Some(message),
        Err(e) => {
            log::error!("Failed to parse protobuf body: {}", e);
            None
        }
    }
}

pub struct GetDocumentMessageFactory;

impl RoutableFactory for GetDocumentMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::Get(msg), .. }) = routable.as_message()
        else {
            return false;
        };
        let proto = GetDocumentRequest {
            document_id: msg.document_id.as_str().to_string(),
            field_set: msg.field_set.clone(),
        };
        proto.encode(out).is_ok()
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let proto: GetDocumentRequest = decode_proto(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::Get(GetDocumentMessage {
            document_id: DocumentId::new(proto.document_id),
            field_set: proto.field_set,
        }))))
    }
}

pub struct GetDocumentReplyFactory;

impl RoutableFactory for GetDocumentReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::Get(reply), .. }) = routable.as_reply() else {
            return false;
        };
        let proto = GetDocumentResponse {
            document: reply.document.clone(),
            last_modified: reply.last_modified,
        };
        proto.encode(out).is_ok()
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let proto: GetDocumentResponse = decode_proto(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::Get(GetDocumentReply {
            document: proto.document,
            last_modified: proto.last_modified,
        }))))
    }
}

pub struct PutDocumentMessageFactory;

impl RoutableFactory for PutDocumentMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::Put(msg), .. }) = routable.as_message()
        else {
            return false;
        };
        let proto = PutDocumentRequest {
            document: msg.document.clone(),
            force_assign_timestamp: msg.timestamp,
            condition: msg.condition.clone(),
        };
        proto.encode(out).is_ok()
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let proto: PutDocumentRequest = decode_proto(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::Put(PutDocumentMessage {
            document: proto.document,
            timestamp: proto.force_assign_timestamp,
            condition: proto.condition,
        }))))
    }
}

pub struct PutDocumentReplyFactory;

impl RoutableFactory for PutDocumentReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::Put(reply), .. }) = routable.as_reply() else {
            return false;
        };
        let proto = PutDocumentResponse {
            modification_timestamp: reply.highest_modification_timestamp,
        };
        proto.encode(out).is_ok()
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let proto: PutDocumentResponse = decode_proto(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::Put(WriteDocumentReply {
            highest_modification_timestamp: proto.modification_timestamp,
        }))))
    }
}

pub struct RemoveDocumentMessageFactory;

impl RoutableFactory for RemoveDocumentMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::Remove(msg), .. }) = routable.as_message()
        else {
            return false;
        };
        let proto = RemoveDocumentRequest {
            document_id: msg.document_id.as_str().to_string(),
            condition: msg.condition.clone(),
        };
        proto.encode(out).is_ok()
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let proto: RemoveDocumentRequest = decode_proto(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::Remove(
            RemoveDocumentMessage {
                document_id: DocumentId::new(proto.document_id),
                condition: proto.condition,
            },
        ))))
    }
}

pub struct RemoveDocumentReplyFactory;

impl RoutableFactory for RemoveDocumentReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::Remove(reply), .. }) = routable.as_reply()
        else {
            return false;
        };
        let proto = RemoveDocumentResponse {
            was_found: reply.was_found,
            modification_timestamp: reply.highest_modification_timestamp,
        };
        proto.encode(out).is_ok()
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let proto: RemoveDocumentResponse = decode_proto(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::Remove(RemoveDocumentReply {
            was_found: proto.was_found,
            highest_modification_timestamp: proto.modification_timestamp,
        }))))
    }
}

pub struct UpdateDocumentMessageFactory;

impl RoutableFactory for UpdateDocumentMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::Update(msg), .. }) = routable.as_message()
        else {
            return false;
        };
        let proto = UpdateDocumentRequest {
            update: msg.update.clone(),
            expected_old_timestamp: msg.old_timestamp,
            force_assign_timestamp: msg.new_timestamp,
            condition: msg.condition.clone(),
        };
        proto.encode(out).is_ok()
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let proto: UpdateDocumentRequest = decode_proto(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::Update(
            UpdateDocumentMessage {
                update: proto.update,
                old_timestamp: proto.expected_old_timestamp,
                new_timestamp: proto.force_assign_timestamp,
                condition: proto.condition,
            },
        ))))
    }
}

pub struct UpdateDocumentReplyFactory;

impl RoutableFactory for UpdateDocumentReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::Update(reply), .. }) = routable.as_reply()
        else {
            return false;
        };
        let proto = UpdateDocumentResponse {
            was_found: reply.was_found,
            modification_timestamp: reply.highest_modification_timestamp,
        };
        proto.encode(out).is_ok()
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let proto: UpdateDocumentResponse = decode_proto(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::Update(UpdateDocumentReply {
            was_found: proto.was_found,
            highest_modification_timestamp: proto.modification_timestamp,
        }))))
    }
}

/// Unlike the legacy framing, v8 carries the bucket space explicitly.
pub struct RemoveLocationMessageFactory;

impl RoutableFactory for RemoveLocationMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::RemoveLocation(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        let proto = RemoveLocationRequest {
            selection: msg.selection.clone(),
            bucket_space: msg.bucket_space.clone(),
        };
        proto.encode(out).is_ok()
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let proto: RemoveLocationRequest = decode_proto(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::RemoveLocation(
            RemoveLocationMessage {
                selection: proto.selection,
                bucket_space: proto.bucket_space,
            },
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(factory: &dyn RoutableFactory, routable: Routable) {
        let mut out = BytesMut::new();
        assert!(factory.encode_body(&routable, &mut out));
        let decoded = factory.decode_body(&mut out.freeze()).expect("decode");
        assert_eq!(decoded, routable);
    }

    #[test]
    fn test_proto_round_trips() {
        round_trip(
            &GetDocumentMessageFactory,
            Routable::Message(DocumentMessage::new(MessageBody::Get(GetDocumentMessage {
                document_id: DocumentId::new("id:ns:music::1"),
                field_set: "title,artist".to_string(),
            }))),
        );
        round_trip(
            &PutDocumentMessageFactory,
            Routable::Message(DocumentMessage::new(MessageBody::Put(PutDocumentMessage {
                document: vec![1, 2, 3],
                timestamp: 42,
                condition: "music.year = 1999".to_string(),
            }))),
        );
        round_trip(
            &RemoveDocumentReplyFactory,
            Routable::Reply(DocumentReply::new(ReplyBody::Remove(RemoveDocumentReply {
                was_found: true,
                highest_modification_timestamp: 7,
            }))),
        );
        round_trip(
            &RemoveLocationMessageFactory,
            Routable::Message(DocumentMessage::new(MessageBody::RemoveLocation(
                RemoveLocationMessage {
                    selection: "music.year < 1990".to_string(),
                    bucket_space: "global".to_string(),
                },
            ))),
        );
    }

    #[test]
    fn test_malformed_protobuf_yields_none() {
        // A lone field header promising more bytes than present.
        let mut bad = Bytes::from_static(&[0x0a, 0x7f]);
        assert!(GetDocumentMessageFactory.decode_body(&mut bad).is_none());
    }

    #[test]
    fn test_proto_defaults_decode_to_empty_fields() {
        let mut empty = Bytes::new();
        let decoded = GetDocumentMessageFactory.decode_body(&mut empty).unwrap();
        match decoded.as_message().map(|m| &m.body) {
            Some(MessageBody::Get(msg)) => {
                assert_eq!(msg.document_id.as_str(), "");
                assert_eq!(msg.field_set, "");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }
}
