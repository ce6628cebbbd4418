use std::sync::Arc;

use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::SearchStats;
use crate::core::types::{BucketId, DocId, Document};
use crate::mapper::searchers::DocumentMapper;
use crate::mapper::spec::FieldSearchSpecMap;
use crate::query::builder::build_query;
use crate::query::node::QueryNode;
use crate::rank::processor::RankProcessor;
use crate::search::result::{DocumentSummary, SearchResult};
use crate::search::sortspec::SortSpec;
use crate::storage::slotfile::SlotFile;

/// `queryflags` bit requesting a rank-feature dump instead of ranking.
pub const QUERY_FLAG_DUMP_FEATURES: u32 = 0x0004_0000;

fn param_string(parameters: &[(String, Vec<u8>)], key: &str) -> String {
    parameters
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default()
}

fn param_blob(parameters: &[(String, Vec<u8>)], key: &str) -> Vec<u8> {
    parameters
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

/// The visitor-side parameters the search pipeline consumes.
#[derive(Debug, Clone, Default)]
pub struct VisitorParams {
    pub search_cluster: String,
    pub summary_class: String,
    pub summary_fields: Vec<String>,
    pub summary_count: usize,
    pub rank_profile: String,
    pub query_flags: u32,
    pub rank_properties: Vec<u8>,
    pub location: String,
    pub sort: SortSpec,
    pub query_stack: Vec<u8>,
    pub query_stack_count: u32,
    pub aggregation: Vec<u8>,
}

impl VisitorParams {
    pub fn from_parameters(
        parameters: &[(String, Vec<u8>)],
        default_summary_count: usize,
    ) -> Result<VisitorParams> {
        let sort_raw = param_string(parameters, "sort");
        let sort = SortSpec::parse(&sort_raw)?;
        let summary_count = {
            let raw = param_string(parameters, "summarycount");
            if raw.is_empty() {
                default_summary_count
            } else {
                raw.parse().map_err(|_| {
                    Error::new(ErrorKind::InvalidArgument, format!("bad summarycount '{}'", raw))
                })?
            }
        };
        let query_flags = {
            let raw = param_string(parameters, "queryflags");
            if raw.is_empty() {
                0
            } else {
                raw.parse().map_err(|_| {
                    Error::new(ErrorKind::InvalidArgument, format!("bad queryflags '{}'", raw))
                })?
            }
        };
        let query_stack_count = param_string(parameters, "querystackcount")
            .parse()
            .unwrap_or(0);
        Ok(VisitorParams {
            search_cluster: param_string(parameters, "searchcluster"),
            summary_class: {
                let raw = param_string(parameters, "summaryclass");
                if raw.is_empty() { "default".to_string() } else { raw }
            },
            summary_fields: param_string(parameters, "summary-fields")
                .split_whitespace()
                .map(|s| s.to_string())
                .collect(),
            summary_count,
            rank_profile: param_string(parameters, "rankprofile"),
            query_flags,
            rank_properties: param_blob(parameters, "rankproperties"),
            location: param_string(parameters, "location"),
            sort,
            query_stack: param_blob(parameters, "query"),
            query_stack_count,
            aggregation: param_blob(parameters, "aggregation"),
        })
    }

    pub fn dump_features(&self) -> bool {
        self.query_flags & QUERY_FLAG_DUMP_FEATURES != 0
    }
}

/// One worker per storage bucket: drains the bucket's document stream,
/// evaluates the query per document, feeds the rank processor and emits a
/// single result message when the stream ends.
pub struct SearchVisitor<'a> {
    specs: &'a FieldSearchSpecMap,
    session_id: Uuid,
    bucket: BucketId,
    summary_class: String,
    summary_fields: Vec<String>,
    dump_features: bool,
    sort: SortSpec,
    query: QueryNode,
    mapper: DocumentMapper,
    processor: RankProcessor,
    next_lid: u32,
    stats: SearchStats,
}

impl<'a> std::fmt::Debug for SearchVisitor<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchVisitor")
            .field("session_id", &self.session_id)
            .field("bucket", &self.bucket)
            .field("summary_class", &self.summary_class)
            .field("summary_fields", &self.summary_fields)
            .field("dump_features", &self.dump_features)
            .field("next_lid", &self.next_lid)
            .finish_non_exhaustive()
    }
}

impl<'a> SearchVisitor<'a> {
    pub fn new(
        bucket: BucketId,
        params: VisitorParams,
        specs: &'a FieldSearchSpecMap,
    ) -> Result<SearchVisitor<'a>> {
        let mut query = build_query(&params.query_stack, specs).ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "query stack built no query tree")
        })?;
        let mapper = DocumentMapper::bind(&mut query, specs)?;
        let processor = if params.dump_features() {
            RankProcessor::new_for_dumping(&query, specs, params.summary_count)
        } else {
            RankProcessor::new_for_ranking(&query, specs, params.summary_count)
        };
        let dump_features = params.dump_features();
        Ok(SearchVisitor {
            specs,
            session_id: Uuid::new_v4(),
            bucket,
            summary_class: params.summary_class,
            summary_fields: params.summary_fields,
            dump_features,
            sort: params.sort,
            query,
            mapper,
            processor,
            next_lid: 0,
            stats: SearchStats::start(),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn bucket(&self) -> BucketId {
        self.bucket
    }

    pub fn matched(&self) -> u64 {
        self.stats.documents_matched
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    /// Process one streamed document; returns whether it entered the
    /// top-K result set.
    pub fn handle_document(&mut self, doc: Document) -> bool {
        let lid = DocId(self.next_lid);
        self.next_lid += 1;
        self.stats.documents_seen += 1;
        self.mapper.search_document(&mut self.query, self.specs, &doc);
        if !self.query.evaluate() {
            return false;
        }
        self.stats.documents_matched += 1;
        let doc = Arc::new(doc);
        self.processor.unpack_match_data(lid, &mut self.query);
        self.processor.run_rank_program(lid);
        let sort_key = if self.sort.is_empty() {
            None
        } else {
            Some(self.sort.encode_key(&doc))
        };
        self.processor.add_hit(doc, lid, sort_key.as_deref())
    }

    /// Drain every live slot of a bucket's slot file, in timestamp order.
    /// Remove markers are not searched.
    pub fn visit_slot_file(&mut self, file: &mut SlotFile) -> Result<()> {
        for slot_idx in 0..file.slots().len() {
            if file.slots()[slot_idx].is_remove_entry() {
                continue;
            }
            let doc = file.get_document(slot_idx)?;
            self.handle_document(doc);
        }
        Ok(())
    }

    fn render_summary(&self, doc: &Document, features: Option<(&[String], &[f64])>) -> Vec<u8> {
        let mut rendered = serde_json::Map::new();
        for (name, value) in &doc.fields {
            if !self.summary_fields.is_empty() && !self.summary_fields.iter().any(|f| f == name) {
                continue;
            }
            rendered.insert(
                name.clone(),
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            );
        }
        if let Some((names, values)) = features {
            let map: serde_json::Map<String, serde_json::Value> = names
                .iter()
                .zip(values)
                .map(|(n, v)| (n.clone(), serde_json::json!(v)))
                .collect();
            rendered.insert("summaryfeatures".to_string(), serde_json::Value::Object(map));
        }
        serde_json::to_vec(&serde_json::Value::Object(rendered)).unwrap_or_default()
    }

    /// End of stream: sort the retained hits, extract features and build
    /// the result and summary messages.
    pub fn complete(mut self) -> (SearchResult, DocumentSummary) {
        let feature_set = if self.dump_features {
            Some(self.processor.calculate_feature_set())
        } else {
            None
        };
        let mut result = SearchResult::new();
        result.total_hit_count = self.stats.documents_matched;
        self.processor.fill_search_result(&mut result);
        self.stats.finish();
        log::debug!(
            "visitor {} bucket {}: {} of {} documents matched in {} ms",
            self.session_id,
            self.bucket,
            self.stats.documents_matched,
            self.stats.documents_seen,
            self.stats.took_ms
        );

        let mut summary = DocumentSummary::new(self.summary_class.clone());
        for hit in &result.hits {
            let Some(doc) = self.processor.hit_collector().get_doc_sum(hit.lid) else {
                continue;
            };
            let features = feature_set
                .as_ref()
                .and_then(|fs| fs.values_for(hit.lid.0).map(|v| (fs.names.as_slice(), v)));
            let blob = self.render_summary(doc, features);
            summary.add(&hit.doc_id, blob);
        }
        (result, summary)
    }

    /// Emit the finished result to the host's sink.
    pub fn complete_into(
        self,
        sender: &Sender<(BucketId, SearchResult, DocumentSummary)>,
    ) -> Result<()> {
        let bucket = self.bucket;
        let (result, summary) = self.complete();
        sender
            .send((bucket, result, summary))
            .map_err(|_| Error::new(ErrorKind::InvalidState, "result sink closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DocumentId, FieldValue};
    use crate::mapper::spec::MatchType;
    use crate::query::stack::{StackItem, StackItemType, encode_stack};

    fn specs() -> FieldSearchSpecMap {
        let mut map = FieldSearchSpecMap::new();
        map.add_field("title", MatchType::Text);
        map.add_field("artist", MatchType::Text);
        map.add_field("year", MatchType::Numeric);
        map.add_index("default", &["title", "artist"]);
        map
    }

    fn doc(n: u32, title: &str, year: i64) -> Document {
        let mut doc = Document::new(DocumentId::new(format!("id:test:music::{}", n)));
        doc.add_field("title", FieldValue::Text(title.into()));
        doc.add_field("year", FieldValue::Integer(year));
        doc
    }

    fn query_blob(index: &str, word: &str) -> Vec<u8> {
        encode_stack(&[StackItem::term(StackItemType::Term, index, word)])
    }

    fn params_with(query: Vec<u8>, extra: &[(&str, &str)]) -> VisitorParams {
        let mut parameters: Vec<(String, Vec<u8>)> =
            vec![("query".to_string(), query)];
        for (k, v) in extra {
            parameters.push((k.to_string(), v.as_bytes().to_vec()));
        }
        VisitorParams::from_parameters(&parameters, 10).unwrap()
    }

    #[test]
    fn test_parameter_parsing() {
        let params = params_with(query_blob("title", "x"), &[
            ("searchcluster", "music"),
            ("summaryclass", "short"),
            ("summary-fields", "title year"),
            ("summarycount", "2"),
            ("rankprofile", "unranked"),
            ("queryflags", "262144"),
            ("sort", "+year"),
        ]);
        assert_eq!(params.search_cluster, "music");
        assert_eq!(params.summary_class, "short");
        assert_eq!(params.summary_fields, vec!["title", "year"]);
        assert_eq!(params.summary_count, 2);
        assert!(params.dump_features());
        assert!(!params.sort.is_empty());
        assert!(VisitorParams::from_parameters(
            &[("summarycount".to_string(), b"many".to_vec())],
            10
        )
        .is_err());
    }

    #[test]
    fn test_stream_match_rank_collect() {
        let specs = specs();
        let params = params_with(query_blob("title", "jazz"), &[("summarycount", "2")]);
        let mut visitor = SearchVisitor::new(BucketId(1), params, &specs).unwrap();
        // Four docs; three match; the best two survive K=2.
        visitor.handle_document(doc(0, "jazz standards", 1950));
        visitor.handle_document(doc(1, "rock anthems", 1980));
        visitor.handle_document(doc(2, "jazz", 1960));
        visitor.handle_document(doc(3, "jazz jazz jazz collection", 1970));
        assert_eq!(visitor.matched(), 3);
        let (result, summary) = visitor.complete();
        assert_eq!(result.total_hit_count, 3);
        assert_eq!(result.hits.len(), 2);
        // Emission is lid-ordered.
        assert!(result.hits[0].lid < result.hits[1].lid);
        assert_eq!(summary.entries.len(), 2);
    }

    #[test]
    fn test_sort_key_path() {
        let specs = specs();
        let params = params_with(
            query_blob("title", "jazz"),
            &[("summarycount", "2"), ("sort", "+year")],
        );
        let mut visitor = SearchVisitor::new(BucketId(1), params, &specs).unwrap();
        visitor.handle_document(doc(0, "jazz", 1990));
        visitor.handle_document(doc(1, "jazz", 1950));
        visitor.handle_document(doc(2, "jazz", 1970));
        let (result, _) = visitor.complete();
        // The two oldest years win under the ascending sort key.
        let lids: Vec<u32> = result.hits.iter().map(|h| h.lid.0).collect();
        assert_eq!(lids, vec![1, 2]);
        assert!(result.hits.iter().all(|h| h.sort_key.is_some()));
    }

    #[test]
    fn test_feature_dump_summary() {
        let specs = specs();
        let params = params_with(
            query_blob("title", "jazz"),
            &[("summarycount", "5"), ("queryflags", "262144")],
        );
        let mut visitor = SearchVisitor::new(BucketId(1), params, &specs).unwrap();
        visitor.handle_document(doc(0, "jazz forever", 2000));
        let (_, summary) = visitor.complete();
        assert_eq!(summary.entries.len(), 1);
        let rendered: serde_json::Value =
            serde_json::from_slice(&summary.entries[0].blob).unwrap();
        assert!(rendered.get("summaryfeatures").is_some());
        assert!(rendered["summaryfeatures"].get("nativeRank").is_some());
    }

    #[test]
    fn test_summary_fields_subset() {
        let specs = specs();
        let params = params_with(
            query_blob("title", "jazz"),
            &[("summary-fields", "title")],
        );
        let mut visitor = SearchVisitor::new(BucketId(1), params, &specs).unwrap();
        visitor.handle_document(doc(0, "jazz", 1999));
        let (_, summary) = visitor.complete();
        let rendered: serde_json::Value =
            serde_json::from_slice(&summary.entries[0].blob).unwrap();
        assert!(rendered.get("title").is_some());
        assert!(rendered.get("year").is_none());
    }

    #[test]
    fn test_result_sink_emission() {
        let specs = specs();
        let params = params_with(query_blob("title", "jazz"), &[]);
        let mut visitor = SearchVisitor::new(BucketId(7), params, &specs).unwrap();
        visitor.handle_document(doc(0, "jazz", 2001));
        let (sender, receiver) = crossbeam_channel::unbounded();
        visitor.complete_into(&sender).unwrap();
        let (bucket, result, _summary) = receiver.recv().unwrap();
        assert_eq!(bucket, BucketId(7));
        assert_eq!(result.hits.len(), 1);
    }

    #[test]
    fn test_visit_slot_file_skips_remove_markers() {
        use crate::core::config::SlotFileConfig;
        use crate::core::types::Timestamp;
        use crate::storage::slotfile::{Compression, SlotFile};

        let dir = tempfile::tempdir().unwrap();
        let config = SlotFileConfig {
            minimum_file_meta_slots: 8,
            minimum_file_header_block_size: 2048,
            minimum_file_size: 8192,
            initial_index_read: 4096,
            ..SlotFileConfig::default()
        };
        let mut file = SlotFile::create(dir.path().join("bucket.dat"), config).unwrap();
        file.put(Timestamp(10), &doc(0, "jazz album", 1971), b"", Compression::None).unwrap();
        file.put(Timestamp(20), &doc(1, "jazz classics", 1972), b"", Compression::None).unwrap();
        file.remove(Timestamp(30), &DocumentId::new("id:test:music::0")).unwrap();
        file.flush().unwrap();

        let specs = specs();
        let params = params_with(query_blob("title", "jazz"), &[]);
        let mut visitor = SearchVisitor::new(BucketId(3), params, &specs).unwrap();
        visitor.visit_slot_file(&mut file).unwrap();
        assert_eq!(visitor.stats().documents_seen, 2);
        let (result, _) = visitor.complete();
        assert_eq!(result.total_hit_count, 2);
    }

    #[test]
    fn test_empty_query_stack_is_invalid() {
        let specs = specs();
        let params = params_with(Vec::new(), &[]);
        let err = SearchVisitor::new(BucketId(1), params, &specs).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
