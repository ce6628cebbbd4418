//! Hand-written version 6 wire framing: fixed widths, length-prefixed
//! strings, network byte order. One factory per message type.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::types::{BucketId, DocumentId};
use crate::protocol::messages::*;
use crate::protocol::registry::RoutableFactory;

fn put_string(out: &mut BytesMut, value: &str) {
    out.put_u32(value.len() as u32);
    out.put_slice(value.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Option<String> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).ok()
}

fn put_blob(out: &mut BytesMut, value: &[u8]) {
    out.put_u32(value.len() as u32);
    out.put_slice(value);
}

fn get_blob(buf: &mut Bytes) -> Option<Vec<u8>> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.copy_to_bytes(len).to_vec())
}

fn put_document_id(out: &mut BytesMut, id: &DocumentId) {
    put_string(out, id.as_str());
}

fn get_document_id(buf: &mut Bytes) -> Option<DocumentId> {
    get_string(buf).map(DocumentId::new)
}

fn get_u64(buf: &mut Bytes) -> Option<u64> {
    if buf.remaining() < 8 {
        return None;
    }
    Some(buf.get_u64())
}

fn get_u32_checked(buf: &mut Bytes) -> Option<u32> {
    if buf.remaining() < 4 {
        return None;
    }
    Some(buf.get_u32())
}

fn get_bool(buf: &mut Bytes) -> Option<bool> {
    if buf.remaining() < 1 {
        return None;
    }
    Some(buf.get_u8() != 0)
}

pub struct GetDocumentMessageFactory;

impl RoutableFactory for GetDocumentMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::Get(msg), .. }) = routable.as_message()
        else {
            return false;
        };
        put_document_id(out, &msg.document_id);
        put_string(out, &msg.field_set);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let document_id = get_document_id(data)?;
        let field_set = get_string(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::Get(
            GetDocumentMessage { document_id, field_set },
        ))))
    }
}

pub struct PutDocumentMessageFactory;

impl RoutableFactory for PutDocumentMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::Put(msg), .. }) = routable.as_message()
        else {
            return false;
        };
        put_blob(out, &msg.document);
        out.put_u64(msg.timestamp);
        put_string(out, &msg.condition);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let document = get_blob(data)?;
        let timestamp = get_u64(data)?;
        let condition = get_string(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::Put(
            PutDocumentMessage { document, timestamp, condition },
        ))))
    }
}

pub struct RemoveDocumentMessageFactory;

impl RoutableFactory for RemoveDocumentMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::Remove(msg), .. }) = routable.as_message()
        else {
            return false;
        };
        put_document_id(out, &msg.document_id);
        put_string(out, &msg.condition);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let document_id = get_document_id(data)?;
        let condition = get_string(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::Remove(
            RemoveDocumentMessage { document_id, condition },
        ))))
    }
}

pub struct UpdateDocumentMessageFactory;

impl RoutableFactory for UpdateDocumentMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::Update(msg), .. }) = routable.as_message()
        else {
            return false;
        };
        put_blob(out, &msg.update);
        out.put_u64(msg.old_timestamp);
        out.put_u64(msg.new_timestamp);
        put_string(out, &msg.condition);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let update = get_blob(data)?;
        let old_timestamp = get_u64(data)?;
        let new_timestamp = get_u64(data)?;
        let condition = get_string(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::Update(
            UpdateDocumentMessage { update, old_timestamp, new_timestamp, condition },
        ))))
    }
}

/// The legacy framing never carried a bucket space: encode drops it and
/// decode pins the default space.
pub struct RemoveLocationMessageFactory;

pub const DEFAULT_BUCKET_SPACE: &str = "default";

impl RoutableFactory for RemoveLocationMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::RemoveLocation(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        put_string(out, &msg.selection);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let selection = get_string(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::RemoveLocation(
            RemoveLocationMessage {
                selection,
                bucket_space: DEFAULT_BUCKET_SPACE.to_string(),
            },
        ))))
    }
}

pub struct CreateVisitorMessageFactory;

impl RoutableFactory for CreateVisitorMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::CreateVisitor(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        put_string(out, &msg.library_name);
        put_string(out, &msg.instance_id);
        put_string(out, &msg.control_destination);
        put_string(out, &msg.data_destination);
        put_string(out, &msg.selection);
        put_string(out, &msg.bucket_space);
        out.put_u32(msg.max_pending_reply_count);
        out.put_u32(msg.buckets.len() as u32);
        for bucket in &msg.buckets {
            out.put_u64(bucket.0);
        }
        out.put_u64(msg.from_timestamp);
        out.put_u64(msg.to_timestamp);
        out.put_u8(msg.visit_removes as u8);
        put_string(out, &msg.field_set);
        out.put_u32(msg.parameters.len() as u32);
        for (key, value) in &msg.parameters {
            put_string(out, key);
            put_blob(out, value);
        }
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let mut msg = CreateVisitorMessage {
            library_name: get_string(data)?,
            instance_id: get_string(data)?,
            control_destination: get_string(data)?,
            data_destination: get_string(data)?,
            selection: get_string(data)?,
            bucket_space: get_string(data)?,
            max_pending_reply_count: get_u32_checked(data)?,
            ..CreateVisitorMessage::default()
        };
        let num_buckets = get_u32_checked(data)?;
        for _ in 0..num_buckets {
            msg.buckets.push(BucketId(get_u64(data)?));
        }
        msg.from_timestamp = get_u64(data)?;
        msg.to_timestamp = get_u64(data)?;
        msg.visit_removes = get_bool(data)?;
        msg.field_set = get_string(data)?;
        let num_parameters = get_u32_checked(data)?;
        for _ in 0..num_parameters {
            let key = get_string(data)?;
            let value = get_blob(data)?;
            msg.parameters.push((key, value));
        }
        Some(Routable::Message(DocumentMessage::new(MessageBody::CreateVisitor(msg))))
    }
}

pub struct DestroyVisitorMessageFactory;

impl RoutableFactory for DestroyVisitorMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::DestroyVisitor(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        put_string(out, &msg.instance_id);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let instance_id = get_string(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::DestroyVisitor(
            DestroyVisitorMessage { instance_id },
        ))))
    }
}

pub struct VisitorInfoMessageFactory;

impl RoutableFactory for VisitorInfoMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::VisitorInfo(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        out.put_u32(msg.finished_buckets.len() as u32);
        for bucket in &msg.finished_buckets {
            out.put_u64(bucket.0);
        }
        put_string(out, &msg.error_message);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let count = get_u32_checked(data)?;
        let mut finished_buckets = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            finished_buckets.push(BucketId(get_u64(data)?));
        }
        let error_message = get_string(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::VisitorInfo(
            VisitorInfoMessage { finished_buckets, error_message },
        ))))
    }
}

/// Deprecated: both directions reject.
pub struct StatDocumentMessageFactory;

impl RoutableFactory for StatDocumentMessageFactory {
    fn encode_body(&self, _routable: &Routable, _out: &mut BytesMut) -> bool {
        false
    }

    fn decode_body(&self, _data: &mut Bytes) -> Option<Routable> {
        None
    }
}

pub struct StatDocumentReplyFactory;

impl RoutableFactory for StatDocumentReplyFactory {
    fn encode_body(&self, _routable: &Routable, _out: &mut BytesMut) -> bool {
        false
    }

    fn decode_body(&self, _data: &mut Bytes) -> Option<Routable> {
        None
    }
}

pub struct QueryResultMessageFactory;

impl RoutableFactory for QueryResultMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::QueryResult(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        let Ok(result) = bincode::serialize(&msg.result) else {
            return false;
        };
        let Ok(summary) = bincode::serialize(&msg.summary) else {
            return false;
        };
        put_blob(out, &result);
        put_blob(out, &summary);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let result = bincode::deserialize(&get_blob(data)?).ok()?;
        let summary = bincode::deserialize(&get_blob(data)?).ok()?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::QueryResult(Box::new(
            QueryResultMessage { result, summary },
        )))))
    }
}

pub struct GetBucketStateMessageFactory;

impl RoutableFactory for GetBucketStateMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::GetBucketState(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        out.put_u64(msg.bucket.0);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let bucket = BucketId(get_u64(data)?);
        Some(Routable::Message(DocumentMessage::new(MessageBody::GetBucketState(
            GetBucketStateMessage { bucket },
        ))))
    }
}

pub struct GetBucketStateReplyFactory;

impl RoutableFactory for GetBucketStateReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::GetBucketState(reply), .. }) =
            routable.as_reply()
        else {
            return false;
        };
        out.put_u32(reply.states.len() as u32);
        for state in &reply.states {
            put_string(out, &state.document_id);
            out.put_u64(state.timestamp);
            out.put_u8(state.remove_entry as u8);
        }
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let count = get_u32_checked(data)?;
        let mut states = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            states.push(DocumentState {
                document_id: get_string(data)?,
                timestamp: get_u64(data)?,
                remove_entry: get_bool(data)?,
            });
        }
        Some(Routable::Reply(DocumentReply::new(ReplyBody::GetBucketState(
            GetBucketStateReply { states },
        ))))
    }
}

pub struct StatBucketMessageFactory;

impl RoutableFactory for StatBucketMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::StatBucket(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        out.put_u64(msg.bucket.0);
        put_string(out, &msg.selection);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let bucket = BucketId(get_u64(data)?);
        let selection = get_string(data)?;
        Some(Routable::Message(DocumentMessage::new(MessageBody::StatBucket(
            StatBucketMessage { bucket, selection },
        ))))
    }
}

pub struct StatBucketReplyFactory;

impl RoutableFactory for StatBucketReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::StatBucket(reply), .. }) = routable.as_reply()
        else {
            return false;
        };
        put_string(out, &reply.results);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let results = get_string(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::StatBucket(StatBucketReply {
            results,
        }))))
    }
}

pub struct GetBucketListMessageFactory;

impl RoutableFactory for GetBucketListMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::GetBucketList(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        out.put_u64(msg.bucket.0);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let bucket = BucketId(get_u64(data)?);
        Some(Routable::Message(DocumentMessage::new(MessageBody::GetBucketList(
            GetBucketListMessage { bucket },
        ))))
    }
}

pub struct GetBucketListReplyFactory;

impl RoutableFactory for GetBucketListReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::GetBucketList(reply), .. }) =
            routable.as_reply()
        else {
            return false;
        };
        out.put_u32(reply.buckets.len() as u32);
        for (bucket, info) in &reply.buckets {
            out.put_u64(bucket.0);
            put_string(out, info);
        }
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let count = get_u32_checked(data)?;
        let mut buckets = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let bucket = BucketId(get_u64(data)?);
            let info = get_string(data)?;
            buckets.push((bucket, info));
        }
        Some(Routable::Reply(DocumentReply::new(ReplyBody::GetBucketList(
            GetBucketListReply { buckets },
        ))))
    }
}

pub struct EmptyBucketsMessageFactory;

impl RoutableFactory for EmptyBucketsMessageFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentMessage { body: MessageBody::EmptyBuckets(msg), .. }) =
            routable.as_message()
        else {
            return false;
        };
        out.put_u32(msg.buckets.len() as u32);
        for bucket in &msg.buckets {
            out.put_u64(bucket.0);
        }
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let count = get_u32_checked(data)?;
        let mut buckets = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            buckets.push(BucketId(get_u64(data)?));
        }
        Some(Routable::Message(DocumentMessage::new(MessageBody::EmptyBuckets(
            EmptyBucketsMessage { buckets },
        ))))
    }
}

pub struct WrongDistributionReplyFactory;

impl RoutableFactory for WrongDistributionReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::WrongDistribution(reply), .. }) =
            routable.as_reply()
        else {
            return false;
        };
        put_string(out, &reply.system_state);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let system_state = get_string(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::WrongDistribution(
            WrongDistributionReply { system_state },
        ))))
    }
}

pub struct GetDocumentReplyFactory;

impl RoutableFactory for GetDocumentReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::Get(reply), .. }) = routable.as_reply() else {
            return false;
        };
        put_blob(out, &reply.document);
        out.put_u64(reply.last_modified);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let document = get_blob(data)?;
        let last_modified = get_u64(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::Get(GetDocumentReply {
            document,
            last_modified,
        }))))
    }
}

pub struct PutDocumentReplyFactory;

impl RoutableFactory for PutDocumentReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::Put(reply), .. }) = routable.as_reply() else {
            return false;
        };
        out.put_u64(reply.highest_modification_timestamp);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let highest_modification_timestamp = get_u64(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::Put(WriteDocumentReply {
            highest_modification_timestamp,
        }))))
    }
}

pub struct RemoveDocumentReplyFactory;

impl RoutableFactory for RemoveDocumentReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::Remove(reply), .. }) = routable.as_reply()
        else {
            return false;
        };
        out.put_u8(reply.was_found as u8);
        out.put_u64(reply.highest_modification_timestamp);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let was_found = get_bool(data)?;
        let highest_modification_timestamp = get_u64(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::Remove(RemoveDocumentReply {
            was_found,
            highest_modification_timestamp,
        }))))
    }
}

pub struct UpdateDocumentReplyFactory;

impl RoutableFactory for UpdateDocumentReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::Update(reply), .. }) = routable.as_reply()
        else {
            return false;
        };
        out.put_u8(reply.was_found as u8);
        out.put_u64(reply.highest_modification_timestamp);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let was_found = get_bool(data)?;
        let highest_modification_timestamp = get_u64(data)?;
        Some(Routable::Reply(DocumentReply::new(ReplyBody::Update(UpdateDocumentReply {
            was_found,
            highest_modification_timestamp,
        }))))
    }
}

pub struct CreateVisitorReplyFactory;

impl RoutableFactory for CreateVisitorReplyFactory {
    fn encode_body(&self, routable: &Routable, out: &mut BytesMut) -> bool {
        let Some(DocumentReply { body: ReplyBody::CreateVisitor(reply), .. }) =
            routable.as_reply()
        else {
            return false;
        };
        out.put_u64(reply.last_bucket.0);
        true
    }

    fn decode_body(&self, data: &mut Bytes) -> Option<Routable> {
        let last_bucket = BucketId(get_u64(data)?);
        Some(Routable::Reply(DocumentReply::new(ReplyBody::CreateVisitor(
            CreateVisitorReply { last_bucket },
        ))))
    }
}

/// Bodyless reply factory shared by the types whose replies carry no
/// payload of their own.
pub struct EmptyBodyReplyFactory {
    make: fn() -> ReplyBody,
    matches: fn(&ReplyBody) -> bool,
}

impl EmptyBodyReplyFactory {
    pub fn remove_location() -> Self {
        EmptyBodyReplyFactory {
            make: || ReplyBody::RemoveLocation,
            matches: |body| matches!(body, ReplyBody::RemoveLocation),
        }
    }

    pub fn destroy_visitor() -> Self {
        EmptyBodyReplyFactory {
            make: || ReplyBody::DestroyVisitor,
            matches: |body| matches!(body, ReplyBody::DestroyVisitor),
        }
    }

    pub fn visitor_info() -> Self {
        EmptyBodyReplyFactory {
            make: || ReplyBody::VisitorInfo,
            matches: |body| matches!(body, ReplyBody::VisitorInfo),
        }
    }

    pub fn query_result() -> Self {
        EmptyBodyReplyFactory {
            make: || ReplyBody::QueryResult,
            matches: |body| matches!(body, ReplyBody::QueryResult),
        }
    }

    pub fn empty_buckets() -> Self {
        EmptyBodyReplyFactory {
            make: || ReplyBody::EmptyBuckets,
            matches: |body| matches!(body, ReplyBody::EmptyBuckets),
        }
    }

    pub fn document_ignored() -> Self {
        EmptyBodyReplyFactory {
            make: || ReplyBody::DocumentIgnored,
            matches: |body| matches!(body, ReplyBody::DocumentIgnored),
        }
    }
}

impl RoutableFactory for EmptyBodyReplyFactory {
    fn encode_body(&self, routable: &Routable, _out: &mut BytesMut) -> bool {
        matches!(routable.as_reply(), Some(reply) if (self.matches)(&reply.body))
    }

    fn decode_body(&self, _data: &mut Bytes) -> Option<Routable> {
        Some(Routable::Reply(DocumentReply::new((self.make)())))
    }
}
