use crate::core::types::{BucketId, DocumentId};
use crate::search::result::{DocumentSummary, SearchResult};

pub const DOCUMENT_MESSAGE: u32 = 100_000;
pub const DOCUMENT_REPLY: u32 = 200_000;
/// A reply's routable type is its message type plus this offset.
pub const REPLY_OFFSET: u32 = 100_000;

pub const MESSAGE_GETDOCUMENT: u32 = DOCUMENT_MESSAGE + 3;
pub const MESSAGE_PUTDOCUMENT: u32 = DOCUMENT_MESSAGE + 4;
pub const MESSAGE_REMOVEDOCUMENT: u32 = DOCUMENT_MESSAGE + 5;
pub const MESSAGE_UPDATEDOCUMENT: u32 = DOCUMENT_MESSAGE + 6;
pub const MESSAGE_CREATEVISITOR: u32 = DOCUMENT_MESSAGE + 7;
pub const MESSAGE_DESTROYVISITOR: u32 = DOCUMENT_MESSAGE + 8;
pub const MESSAGE_VISITORINFO: u32 = DOCUMENT_MESSAGE + 9;
pub const MESSAGE_STATDOCUMENT: u32 = DOCUMENT_MESSAGE + 17;
pub const MESSAGE_GETBUCKETSTATE: u32 = DOCUMENT_MESSAGE + 18;
pub const MESSAGE_STATBUCKET: u32 = DOCUMENT_MESSAGE + 19;
pub const MESSAGE_GETBUCKETLIST: u32 = DOCUMENT_MESSAGE + 20;
pub const MESSAGE_EMPTYBUCKETS: u32 = DOCUMENT_MESSAGE + 23;
pub const MESSAGE_REMOVELOCATION: u32 = DOCUMENT_MESSAGE + 24;
pub const MESSAGE_QUERYRESULT: u32 = DOCUMENT_MESSAGE + 25;

pub const REPLY_GETDOCUMENT: u32 = DOCUMENT_REPLY + 3;
pub const REPLY_PUTDOCUMENT: u32 = DOCUMENT_REPLY + 4;
pub const REPLY_REMOVEDOCUMENT: u32 = DOCUMENT_REPLY + 5;
pub const REPLY_UPDATEDOCUMENT: u32 = DOCUMENT_REPLY + 6;
pub const REPLY_CREATEVISITOR: u32 = DOCUMENT_REPLY + 7;
pub const REPLY_DESTROYVISITOR: u32 = DOCUMENT_REPLY + 8;
pub const REPLY_VISITORINFO: u32 = DOCUMENT_REPLY + 9;
pub const REPLY_STATDOCUMENT: u32 = DOCUMENT_REPLY + 17;
pub const REPLY_GETBUCKETSTATE: u32 = DOCUMENT_REPLY + 18;
pub const REPLY_STATBUCKET: u32 = DOCUMENT_REPLY + 19;
pub const REPLY_GETBUCKETLIST: u32 = DOCUMENT_REPLY + 20;
pub const REPLY_EMPTYBUCKETS: u32 = DOCUMENT_REPLY + 23;
pub const REPLY_REMOVELOCATION: u32 = DOCUMENT_REPLY + 24;
pub const REPLY_QUERYRESULT: u32 = DOCUMENT_REPLY + 25;
/// Replies without a message counterpart: routing-level outcomes.
pub const REPLY_WRONGDISTRIBUTION: u32 = DOCUMENT_REPLY + 1000;
pub const REPLY_DOCUMENTIGNORED: u32 = DOCUMENT_REPLY + 1001;

// Error code spaces: fatal codes live in the thousands above
// APP_FATAL_ERROR, transient ones above APP_TRANSIENT_ERROR.
pub const TRANSIENT_ERROR: u32 = 100_000;
pub const APP_TRANSIENT_ERROR: u32 = 150_000;
pub const FATAL_ERROR: u32 = 200_000;
pub const APP_FATAL_ERROR: u32 = 250_000;

/// Soft-ignore: surfaced only when no sibling reply succeeded.
pub const ERROR_MESSAGE_IGNORED: u32 = APP_FATAL_ERROR + 1;
pub const ERROR_POLICY_FAILURE: u32 = APP_FATAL_ERROR + 2;
pub const ERROR_DOCUMENT_NOT_FOUND: u32 = APP_FATAL_ERROR + 3;
pub const ERROR_DOCUMENT_EXISTS: u32 = APP_FATAL_ERROR + 4;
pub const ERROR_REJECTED: u32 = APP_FATAL_ERROR + 5;
pub const ERROR_NOT_CONNECTED: u32 = APP_TRANSIENT_ERROR + 1;
pub const ERROR_BUCKET_NOT_FOUND: u32 = APP_TRANSIENT_ERROR + 2;
pub const ERROR_STALE_TIMESTAMP: u32 = APP_TRANSIENT_ERROR + 3;

pub fn is_fatal_error(code: u32) -> bool {
    code >= FATAL_ERROR
}

pub fn is_transient_error(code: u32) -> bool {
    (TRANSIENT_ERROR..FATAL_ERROR).contains(&code)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: u32,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        ProtocolError { code, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetDocumentMessage {
    pub document_id: DocumentId,
    pub field_set: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutDocumentMessage {
    /// Serialised `Document` blob, passed through; the type repo decodes
    /// it at the receiving end.
    pub document: Vec<u8>,
    pub timestamp: u64,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveDocumentMessage {
    pub document_id: DocumentId,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateDocumentMessage {
    /// Serialised `DocumentUpdate` blob, passed through.
    pub update: Vec<u8>,
    pub old_timestamp: u64,
    pub new_timestamp: u64,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveLocationMessage {
    pub selection: String,
    pub bucket_space: String,
}

/// Visitor-side parameters are an opaque key/value list; the search
/// pipeline consumes keys like `summarycount` and `rankprofile`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CreateVisitorMessage {
    pub library_name: String,
    pub instance_id: String,
    pub control_destination: String,
    pub data_destination: String,
    pub selection: String,
    pub bucket_space: String,
    pub max_pending_reply_count: u32,
    pub buckets: Vec<BucketId>,
    pub from_timestamp: u64,
    pub to_timestamp: u64,
    pub visit_removes: bool,
    pub field_set: String,
    pub parameters: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DestroyVisitorMessage {
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisitorInfoMessage {
    pub finished_buckets: Vec<BucketId>,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatDocumentMessage {
    pub document_id: DocumentId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResultMessage {
    pub result: SearchResult,
    pub summary: DocumentSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetBucketStateMessage {
    pub bucket: BucketId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatBucketMessage {
    pub bucket: BucketId,
    pub selection: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetBucketListMessage {
    pub bucket: BucketId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmptyBucketsMessage {
    pub buckets: Vec<BucketId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Get(GetDocumentMessage),
    Put(PutDocumentMessage),
    Remove(RemoveDocumentMessage),
    Update(UpdateDocumentMessage),
    RemoveLocation(RemoveLocationMessage),
    CreateVisitor(CreateVisitorMessage),
    DestroyVisitor(DestroyVisitorMessage),
    VisitorInfo(VisitorInfoMessage),
    StatDocument(StatDocumentMessage),
    QueryResult(Box<QueryResultMessage>),
    GetBucketState(GetBucketStateMessage),
    StatBucket(StatBucketMessage),
    GetBucketList(GetBucketListMessage),
    EmptyBuckets(EmptyBucketsMessage),
}

impl MessageBody {
    pub fn type_id(&self) -> u32 {
        match self {
            MessageBody::Get(_) => MESSAGE_GETDOCUMENT,
            MessageBody::Put(_) => MESSAGE_PUTDOCUMENT,
            MessageBody::Remove(_) => MESSAGE_REMOVEDOCUMENT,
            MessageBody::Update(_) => MESSAGE_UPDATEDOCUMENT,
            MessageBody::RemoveLocation(_) => MESSAGE_REMOVELOCATION,
            MessageBody::CreateVisitor(_) => MESSAGE_CREATEVISITOR,
            MessageBody::DestroyVisitor(_) => MESSAGE_DESTROYVISITOR,
            MessageBody::VisitorInfo(_) => MESSAGE_VISITORINFO,
            MessageBody::StatDocument(_) => MESSAGE_STATDOCUMENT,
            MessageBody::QueryResult(_) => MESSAGE_QUERYRESULT,
            MessageBody::GetBucketState(_) => MESSAGE_GETBUCKETSTATE,
            MessageBody::StatBucket(_) => MESSAGE_STATBUCKET,
            MessageBody::GetBucketList(_) => MESSAGE_GETBUCKETLIST,
            MessageBody::EmptyBuckets(_) => MESSAGE_EMPTYBUCKETS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetDocumentReply {
    /// Serialised `Document` blob; empty when nothing was found.
    pub document: Vec<u8>,
    pub last_modified: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteDocumentReply {
    pub highest_modification_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveDocumentReply {
    pub was_found: bool,
    pub highest_modification_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateDocumentReply {
    pub was_found: bool,
    pub highest_modification_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateVisitorReply {
    pub last_bucket: BucketId,
}

/// One document version in a bucket, as reported by get-bucket-state.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentState {
    pub document_id: String,
    pub timestamp: u64,
    pub remove_entry: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetBucketStateReply {
    pub states: Vec<DocumentState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatBucketReply {
    pub results: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetBucketListReply {
    pub buckets: Vec<(BucketId, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WrongDistributionReply {
    pub system_state: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    Get(GetDocumentReply),
    Put(WriteDocumentReply),
    Remove(RemoveDocumentReply),
    Update(UpdateDocumentReply),
    RemoveLocation,
    CreateVisitor(CreateVisitorReply),
    DestroyVisitor,
    VisitorInfo,
    StatDocument,
    QueryResult,
    GetBucketState(GetBucketStateReply),
    StatBucket(StatBucketReply),
    GetBucketList(GetBucketListReply),
    EmptyBuckets,
    WrongDistribution(WrongDistributionReply),
    DocumentIgnored,
    /// Generated locally (e.g. by the reply merger); never on the wire.
    Empty,
}

impl ReplyBody {
    pub fn type_id(&self) -> u32 {
        match self {
            ReplyBody::Get(_) => REPLY_GETDOCUMENT,
            ReplyBody::Put(_) => REPLY_PUTDOCUMENT,
            ReplyBody::Remove(_) => REPLY_REMOVEDOCUMENT,
            ReplyBody::Update(_) => REPLY_UPDATEDOCUMENT,
            ReplyBody::RemoveLocation => REPLY_REMOVELOCATION,
            ReplyBody::CreateVisitor(_) => REPLY_CREATEVISITOR,
            ReplyBody::DestroyVisitor => REPLY_DESTROYVISITOR,
            ReplyBody::VisitorInfo => REPLY_VISITORINFO,
            ReplyBody::StatDocument => REPLY_STATDOCUMENT,
            ReplyBody::QueryResult => REPLY_QUERYRESULT,
            ReplyBody::GetBucketState(_) => REPLY_GETBUCKETSTATE,
            ReplyBody::StatBucket(_) => REPLY_STATBUCKET,
            ReplyBody::GetBucketList(_) => REPLY_GETBUCKETLIST,
            ReplyBody::EmptyBuckets => REPLY_EMPTYBUCKETS,
            ReplyBody::WrongDistribution(_) => REPLY_WRONGDISTRIBUTION,
            ReplyBody::DocumentIgnored => REPLY_DOCUMENTIGNORED,
            ReplyBody::Empty => DOCUMENT_REPLY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMessage {
    pub priority: u8,
    pub body: MessageBody,
}

impl DocumentMessage {
    pub fn new(body: MessageBody) -> Self {
        DocumentMessage { priority: 8, body }
    }

    pub fn type_id(&self) -> u32 {
        self.body.type_id()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentReply {
    pub priority: u8,
    pub errors: Vec<ProtocolError>,
    pub body: ReplyBody,
}

impl DocumentReply {
    pub fn new(body: ReplyBody) -> Self {
        DocumentReply { priority: 8, errors: Vec::new(), body }
    }

    pub fn empty() -> Self {
        DocumentReply::new(ReplyBody::Empty)
    }

    pub fn type_id(&self) -> u32 {
        self.body.type_id()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ProtocolError) {
        self.errors.push(error);
    }

    pub fn has_only_errors_of_type(&self, code: u32) -> bool {
        self.has_errors() && self.errors.iter().all(|e| e.code == code)
    }
}

/// Anything the codec can move: a message or a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Routable {
    Message(DocumentMessage),
    Reply(DocumentReply),
}

impl Routable {
    pub fn type_id(&self) -> u32 {
        match self {
            Routable::Message(m) => m.type_id(),
            Routable::Reply(r) => r.type_id(),
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Routable::Message(m) => m.priority,
            Routable::Reply(r) => r.priority,
        }
    }

    pub fn set_priority(&mut self, priority: u8) {
        match self {
            Routable::Message(m) => m.priority = priority,
            Routable::Reply(r) => r.priority = priority,
        }
    }

    pub fn as_message(&self) -> Option<&DocumentMessage> {
        match self {
            Routable::Message(m) => Some(m),
            Routable::Reply(_) => None,
        }
    }

    pub fn as_reply(&self) -> Option<&DocumentReply> {
        match self {
            Routable::Reply(r) => Some(r),
            Routable::Message(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_ids_offset_from_messages() {
        assert_eq!(MESSAGE_GETDOCUMENT + REPLY_OFFSET, REPLY_GETDOCUMENT);
        assert_eq!(MESSAGE_QUERYRESULT + REPLY_OFFSET, REPLY_QUERYRESULT);
    }

    #[test]
    fn test_error_spaces_partition() {
        assert!(is_fatal_error(ERROR_MESSAGE_IGNORED));
        assert!(is_transient_error(ERROR_BUCKET_NOT_FOUND));
        assert!(!is_transient_error(ERROR_DOCUMENT_NOT_FOUND));
        assert!(!is_fatal_error(ERROR_STALE_TIMESTAMP));
    }

    #[test]
    fn test_only_errors_of_type() {
        let mut reply = DocumentReply::empty();
        assert!(!reply.has_only_errors_of_type(ERROR_MESSAGE_IGNORED));
        reply.add_error(ProtocolError::new(ERROR_MESSAGE_IGNORED, "skipped"));
        assert!(reply.has_only_errors_of_type(ERROR_MESSAGE_IGNORED));
        reply.add_error(ProtocolError::new(ERROR_REJECTED, "no"));
        assert!(!reply.has_only_errors_of_type(ERROR_MESSAGE_IGNORED));
    }
}
