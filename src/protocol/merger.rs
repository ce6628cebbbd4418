use crate::protocol::messages::{
    DocumentReply, ERROR_MESSAGE_IGNORED, ProtocolError, ReplyBody,
};

/// Outcome of merging fan-out replies: either one child reply is the
/// winner, or a reply was generated locally (errors, or all-ignored).
#[derive(Debug)]
pub enum MergeResult {
    /// Index of the best successful child reply.
    Successful(usize),
    Generated(DocumentReply),
}

/// Folds the replies of a fan-out message into one answer. Any child
/// error is propagated on a generated empty reply, except replies
/// carrying only `MESSAGE_IGNORED`, which are soft-ignores surfaced only
/// when nothing succeeded.
#[derive(Default)]
pub struct ReplyMerger {
    error: Option<DocumentReply>,
    ignored: Option<DocumentReply>,
    success: Option<(usize, bool)>,
}

/// Per-type "was the resource found" predicate used to pick the best
/// successful reply.
fn resource_was_found(reply: &DocumentReply) -> bool {
    match &reply.body {
        ReplyBody::Remove(r) => r.was_found,
        ReplyBody::Update(r) => r.was_found,
        ReplyBody::Get(r) => r.last_modified != 0,
        _ => false,
    }
}

impl ReplyMerger {
    pub fn new() -> Self {
        ReplyMerger::default()
    }

    pub fn merge(&mut self, idx: usize, reply: &DocumentReply) {
        if reply.has_errors() {
            self.merge_all_reply_errors(reply);
        } else {
            self.update_state_with_successful_reply(idx, reply);
        }
    }

    fn update_state_with_successful_reply(&mut self, idx: usize, reply: &DocumentReply) {
        let found = resource_was_found(reply);
        match self.success {
            Some((_, best_found)) if best_found || !found => {}
            _ => self.success = Some((idx, found)),
        }
    }

    fn merge_all_reply_errors(&mut self, reply: &DocumentReply) {
        if reply.has_only_errors_of_type(ERROR_MESSAGE_IGNORED) {
            if self.ignored.is_none() {
                self.ignored = Some(DocumentReply::empty());
            }
            let ignored = self.ignored.as_mut().expect("just set");
            for error in &reply.errors {
                ignored.add_error(error.clone());
            }
            return;
        }
        if self.error.is_none() {
            self.error = Some(DocumentReply::empty());
        }
        let merged = self.error.as_mut().expect("just set");
        for error in &reply.errors {
            merged.add_error(error.clone());
        }
    }

    pub fn merged_reply(self) -> MergeResult {
        if let Some(error) = self.error {
            return MergeResult::Generated(error);
        }
        if let Some((idx, _)) = self.success {
            return MergeResult::Successful(idx);
        }
        if let Some(ignored) = self.ignored {
            return MergeResult::Generated(ignored);
        }
        MergeResult::Generated(DocumentReply::empty())
    }
}

/// Convenience wrapper used by fan-out call sites.
pub fn merge_replies(replies: &[DocumentReply]) -> MergeResult {
    let mut merger = ReplyMerger::new();
    for (idx, reply) in replies.iter().enumerate() {
        merger.merge(idx, reply);
    }
    merger.merged_reply()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ERROR_REJECTED, GetDocumentReply, RemoveDocumentReply};

    fn get_reply(last_modified: u64) -> DocumentReply {
        DocumentReply::new(ReplyBody::Get(GetDocumentReply {
            document: if last_modified != 0 { b"doc".to_vec() } else { Vec::new() },
            last_modified,
        }))
    }

    fn error_reply(code: u32) -> DocumentReply {
        let mut reply = DocumentReply::empty();
        reply.add_error(ProtocolError::new(code, "boom"));
        reply
    }

    #[test]
    fn test_get_picks_reply_with_last_modified() {
        let replies = vec![get_reply(0), get_reply(1234), get_reply(0)];
        match merge_replies(&replies) {
            MergeResult::Successful(idx) => assert_eq!(idx, 1),
            other => panic!("unexpected merge: {:?}", other),
        }
    }

    #[test]
    fn test_first_success_wins_when_none_found() {
        let replies = vec![get_reply(0), get_reply(0)];
        match merge_replies(&replies) {
            MergeResult::Successful(idx) => assert_eq!(idx, 0),
            other => panic!("unexpected merge: {:?}", other),
        }
    }

    #[test]
    fn test_was_found_predicate_for_remove() {
        let not_found = DocumentReply::new(ReplyBody::Remove(RemoveDocumentReply {
            was_found: false,
            highest_modification_timestamp: 0,
        }));
        let found = DocumentReply::new(ReplyBody::Remove(RemoveDocumentReply {
            was_found: true,
            highest_modification_timestamp: 0,
        }));
        match merge_replies(&[not_found, found]) {
            MergeResult::Successful(idx) => assert_eq!(idx, 1),
            other => panic!("unexpected merge: {:?}", other),
        }
    }

    #[test]
    fn test_errors_propagate_on_generated_reply() {
        let replies = vec![get_reply(1), error_reply(ERROR_REJECTED)];
        match merge_replies(&replies) {
            MergeResult::Generated(reply) => {
                assert_eq!(reply.errors.len(), 1);
                assert_eq!(reply.errors[0].code, ERROR_REJECTED);
            }
            other => panic!("unexpected merge: {:?}", other),
        }
    }

    #[test]
    fn test_ignored_only_surfaces_without_success() {
        // A success alongside ignores: the success wins.
        let replies = vec![error_reply(ERROR_MESSAGE_IGNORED), get_reply(5)];
        match merge_replies(&replies) {
            MergeResult::Successful(idx) => assert_eq!(idx, 1),
            other => panic!("unexpected merge: {:?}", other),
        }
        // Only ignores: the generated reply carries them.
        let replies = vec![error_reply(ERROR_MESSAGE_IGNORED)];
        match merge_replies(&replies) {
            MergeResult::Generated(reply) => {
                assert!(reply.has_only_errors_of_type(ERROR_MESSAGE_IGNORED));
            }
            other => panic!("unexpected merge: {:?}", other),
        }
    }
}
