pub mod legacy;
pub mod merger;
pub mod messages;
pub mod proto;
pub mod registry;
pub mod version;

use std::sync::Arc;

use crate::protocol::messages::*;
use crate::protocol::registry::{RoutableRepository, RoutableFactory};
use crate::protocol::version::{Version, VersionSpec};

/// The document protocol: a routable repository pre-loaded with the
/// legacy v6 factories and, where they exist, the protobuf v8 factories
/// that supersede them from version 8 on.
pub struct DocumentProtocol {
    repository: RoutableRepository,
}

impl Default for DocumentProtocol {
    fn default() -> Self {
        DocumentProtocol::new()
    }
}

impl DocumentProtocol {
    pub const NAME: &'static str = "document";

    pub fn new() -> Self {
        let repository = RoutableRepository::new();
        let from6 = VersionSpec::from_major(6);
        let from8 = VersionSpec::from_major(8);
        let mut put = |spec: VersionSpec, type_id: u32, factory: Arc<dyn RoutableFactory>| {
            repository.put_factory(spec, type_id, factory);
        };

        put(from6, MESSAGE_GETDOCUMENT, Arc::new(legacy::GetDocumentMessageFactory));
        put(from6, MESSAGE_PUTDOCUMENT, Arc::new(legacy::PutDocumentMessageFactory));
        put(from6, MESSAGE_REMOVEDOCUMENT, Arc::new(legacy::RemoveDocumentMessageFactory));
        put(from6, MESSAGE_UPDATEDOCUMENT, Arc::new(legacy::UpdateDocumentMessageFactory));
        put(from6, MESSAGE_REMOVELOCATION, Arc::new(legacy::RemoveLocationMessageFactory));
        put(from6, MESSAGE_CREATEVISITOR, Arc::new(legacy::CreateVisitorMessageFactory));
        put(from6, MESSAGE_DESTROYVISITOR, Arc::new(legacy::DestroyVisitorMessageFactory));
        put(from6, MESSAGE_VISITORINFO, Arc::new(legacy::VisitorInfoMessageFactory));
        put(from6, MESSAGE_STATDOCUMENT, Arc::new(legacy::StatDocumentMessageFactory));
        put(from6, MESSAGE_QUERYRESULT, Arc::new(legacy::QueryResultMessageFactory));
        put(from6, MESSAGE_GETBUCKETSTATE, Arc::new(legacy::GetBucketStateMessageFactory));
        put(from6, MESSAGE_STATBUCKET, Arc::new(legacy::StatBucketMessageFactory));
        put(from6, MESSAGE_GETBUCKETLIST, Arc::new(legacy::GetBucketListMessageFactory));
        put(from6, MESSAGE_EMPTYBUCKETS, Arc::new(legacy::EmptyBucketsMessageFactory));

        put(from6, REPLY_GETDOCUMENT, Arc::new(legacy::GetDocumentReplyFactory));
        put(from6, REPLY_PUTDOCUMENT, Arc::new(legacy::PutDocumentReplyFactory));
        put(from6, REPLY_REMOVEDOCUMENT, Arc::new(legacy::RemoveDocumentReplyFactory));
        put(from6, REPLY_UPDATEDOCUMENT, Arc::new(legacy::UpdateDocumentReplyFactory));
        put(from6, REPLY_REMOVELOCATION, Arc::new(legacy::EmptyBodyReplyFactory::remove_location()));
        put(from6, REPLY_CREATEVISITOR, Arc::new(legacy::CreateVisitorReplyFactory));
        put(from6, REPLY_DESTROYVISITOR, Arc::new(legacy::EmptyBodyReplyFactory::destroy_visitor()));
        put(from6, REPLY_VISITORINFO, Arc::new(legacy::EmptyBodyReplyFactory::visitor_info()));
        put(from6, REPLY_STATDOCUMENT, Arc::new(legacy::StatDocumentReplyFactory));
        put(from6, REPLY_QUERYRESULT, Arc::new(legacy::EmptyBodyReplyFactory::query_result()));
        put(from6, REPLY_GETBUCKETSTATE, Arc::new(legacy::GetBucketStateReplyFactory));
        put(from6, REPLY_STATBUCKET, Arc::new(legacy::StatBucketReplyFactory));
        put(from6, REPLY_GETBUCKETLIST, Arc::new(legacy::GetBucketListReplyFactory));
        put(from6, REPLY_EMPTYBUCKETS, Arc::new(legacy::EmptyBodyReplyFactory::empty_buckets()));
        put(from6, REPLY_WRONGDISTRIBUTION, Arc::new(legacy::WrongDistributionReplyFactory));
        put(from6, REPLY_DOCUMENTIGNORED, Arc::new(legacy::EmptyBodyReplyFactory::document_ignored()));

        put(from8, MESSAGE_GETDOCUMENT, Arc::new(proto::GetDocumentMessageFactory));
        put(from8, MESSAGE_PUTDOCUMENT, Arc::new(proto::PutDocumentMessageFactory));
        put(from8, MESSAGE_REMOVEDOCUMENT, Arc::new(proto::RemoveDocumentMessageFactory));
        put(from8, MESSAGE_UPDATEDOCUMENT, Arc::new(proto::UpdateDocumentMessageFactory));
        put(from8, MESSAGE_REMOVELOCATION, Arc::new(proto::RemoveLocationMessageFactory));
        put(from8, REPLY_GETDOCUMENT, Arc::new(proto::GetDocumentReplyFactory));
        put(from8, REPLY_PUTDOCUMENT, Arc::new(proto::PutDocumentReplyFactory));
        put(from8, REPLY_REMOVEDOCUMENT, Arc::new(proto::RemoveDocumentReplyFactory));
        put(from8, REPLY_UPDATEDOCUMENT, Arc::new(proto::UpdateDocumentReplyFactory));

        DocumentProtocol { repository }
    }

    pub fn repository(&self) -> &RoutableRepository {
        &self.repository
    }

    pub fn encode(&self, version: &Version, routable: &Routable) -> Option<Vec<u8>> {
        self.repository.encode(version, routable)
    }

    pub fn decode_message(&self, version: &Version, data: &[u8]) -> Option<Routable> {
        self.repository.decode_message(version, data)
    }

    pub fn decode_reply(&self, version: &Version, reply_type: u32, data: &[u8]) -> Option<Routable> {
        self.repository.decode_reply(version, reply_type, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DocumentId;

    fn get_message() -> Routable {
        Routable::Message(DocumentMessage::new(MessageBody::Get(GetDocumentMessage {
            document_id: DocumentId::new("id:ns:music::42"),
            field_set: "[all]".to_string(),
        })))
    }

    #[test]
    fn test_message_frame_round_trip_v6() {
        let protocol = DocumentProtocol::new();
        let version = Version::new(6, 3, 0);
        let mut message = get_message();
        message.set_priority(3);
        let wire = protocol.encode(&version, &message).unwrap();
        assert_eq!(wire[0], 3);
        assert_eq!(
            u32::from_be_bytes([wire[1], wire[2], wire[3], wire[4]]),
            MESSAGE_GETDOCUMENT
        );
        let decoded = protocol.decode_message(&version, &wire).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_v6_and_v8_framings_coexist() {
        let protocol = DocumentProtocol::new();
        let message = get_message();
        let v6 = protocol.encode(&Version::new(6, 0, 0), &message).unwrap();
        let v8 = protocol.encode(&Version::new(8, 0, 0), &message).unwrap();
        assert_ne!(v6, v8);
        // Each version decodes its own bytes back to the same object.
        assert_eq!(protocol.decode_message(&Version::new(6, 0, 0), &v6).unwrap(), message);
        assert_eq!(protocol.decode_message(&Version::new(8, 0, 0), &v8).unwrap(), message);
    }

    #[test]
    fn test_reply_frame_has_no_type() {
        let protocol = DocumentProtocol::new();
        let version = Version::new(6, 0, 0);
        let reply = Routable::Reply(DocumentReply::new(ReplyBody::Get(GetDocumentReply {
            document: b"doc".to_vec(),
            last_modified: 11,
        })));
        let wire = protocol.encode(&version, &reply).unwrap();
        let decoded = protocol.decode_reply(&version, REPLY_GETDOCUMENT, &wire).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_stat_document_is_rejected_by_codec() {
        let protocol = DocumentProtocol::new();
        let version = Version::new(6, 0, 0);
        let message = Routable::Message(DocumentMessage::new(MessageBody::StatDocument(
            StatDocumentMessage { document_id: DocumentId::new("id:a:b::c") },
        )));
        assert!(protocol.encode(&version, &message).is_none());
        // A framed stat-document body never decodes either.
        let fake = [8u8, 0, 1, 0x86, 0xb1, 0, 0, 0, 0];
        assert!(protocol.decode_message(&version, &fake).is_none());
    }

    #[test]
    fn test_visitor_messages_only_exist_in_v6_framing() {
        let protocol = DocumentProtocol::new();
        let message = Routable::Message(DocumentMessage::new(MessageBody::DestroyVisitor(
            DestroyVisitorMessage { instance_id: "v1".to_string() },
        )));
        // Version 8 falls back to the highest spec at or below it.
        let v8 = protocol.encode(&Version::new(8, 1, 0), &message).unwrap();
        let decoded = protocol.decode_message(&Version::new(8, 1, 0), &v8).unwrap();
        assert_eq!(decoded, message);
    }
}
