use crate::rank::match_data::{TermData, TermFieldMatchData, UNKNOWN_FIELD_LENGTH};

/// Compiled dataflow of feature computations. The real feature-function
/// library lives outside this crate; programs here only need to produce a
/// scalar score plus named feature values from unpacked match data.
pub trait RankProgram {
    /// Evaluate against match data unpacked for `doc_id`.
    fn run(&mut self, doc_id: u32, term_fields: &[TermFieldMatchData]);

    /// Scalar score of the last `run`.
    fn score(&self) -> f64;

    fn feature_names(&self) -> &[String];

    /// Feature values of the last `run`, aligned with `feature_names`.
    fn feature_values(&self) -> Vec<f64>;
}

/// Text-rank driver: per-term occurrence counts damped by field length,
/// scaled by query weight, with raw scores (nearest-neighbor, dot-product)
/// added straight in.
pub struct NativeRankProgram {
    terms: Vec<TermData>,
    feature_names: Vec<String>,
    values: Vec<f64>,
    score: f64,
}

impl NativeRankProgram {
    const K1: f64 = 1.2;

    pub fn new(terms: Vec<TermData>) -> Self {
        let mut feature_names = vec!["nativeRank".to_string(), "queryTermCount".to_string()];
        for (idx, _) in terms.iter().enumerate() {
            feature_names.push(format!("term({}).occurrences", idx));
            feature_names.push(format!("term({}).weight", idx));
        }
        let values = vec![0.0; feature_names.len()];
        NativeRankProgram { terms, feature_names, values, score: 0.0 }
    }

    fn term_score(term: &TermData, term_fields: &[TermFieldMatchData], doc_id: u32) -> (f64, f64) {
        let mut score = 0.0;
        let mut occs = 0.0;
        for field in &term.fields {
            let tmd = &term_fields[field.handle];
            if tmd.doc_id() != doc_id {
                continue;
            }
            if tmd.raw_score() != 0.0 {
                score += tmd.raw_score();
                continue;
            }
            let tf = tmd.num_occs() as f64;
            if tf == 0.0 {
                continue;
            }
            occs += tf;
            let length_norm = match tmd.field_length() {
                0 | UNKNOWN_FIELD_LENGTH => 1.0,
                len => 1.0 / (1.0 + (len as f64).ln()),
            };
            score += (term.weight as f64 / 100.0) * (tf / (tf + Self::K1)) * length_norm;
        }
        (score, occs)
    }
}

impl RankProgram for NativeRankProgram {
    fn run(&mut self, doc_id: u32, term_fields: &[TermFieldMatchData]) {
        let mut total = 0.0;
        for (idx, term) in self.terms.iter().enumerate() {
            let (score, occs) = Self::term_score(term, term_fields, doc_id);
            total += score;
            self.values[2 + idx * 2] = occs;
            self.values[2 + idx * 2 + 1] = term.weight as f64;
        }
        self.values[0] = total;
        self.values[1] = self.terms.len() as f64;
        self.score = total;
    }

    fn score(&self) -> f64 {
        self.score
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn feature_values(&self) -> Vec<f64> {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank::match_data::{MatchDataLayout, TermFieldData, TermFieldMatchDataPosition};

    fn one_term_setup() -> (Vec<TermData>, MatchDataLayout) {
        let mut layout = MatchDataLayout::new();
        let handle = layout.alloc_term_field();
        let term = TermData {
            weight: 100,
            unique_id: 1,
            phrase_length: 1,
            query_tensor_name: None,
            fields: vec![TermFieldData { field_id: 0, handle }],
        };
        (vec![term], layout)
    }

    #[test]
    fn test_score_grows_with_occurrences() {
        let (terms, layout) = one_term_setup();
        let mut md = layout.create_match_data();
        let mut program = NativeRankProgram::new(terms);

        let tmd = md.resolve_term_field(0);
        tmd.reset(1);
        tmd.append_position(TermFieldMatchDataPosition {
            element_id: 0, position: 0, element_weight: 1, element_length: 10,
        });
        tmd.set_field_length(10);
        program.run(1, md.term_fields());
        let one_occ = program.score();
        assert!(one_occ > 0.0);

        let tmd = md.resolve_term_field(0);
        tmd.append_position(TermFieldMatchDataPosition {
            element_id: 0, position: 4, element_weight: 1, element_length: 10,
        });
        program.run(1, md.term_fields());
        assert!(program.score() > one_occ);
    }

    #[test]
    fn test_stale_doc_id_scores_zero() {
        let (terms, layout) = one_term_setup();
        let mut md = layout.create_match_data();
        let mut program = NativeRankProgram::new(terms);
        md.resolve_term_field(0).reset(1);
        program.run(2, md.term_fields());
        assert_eq!(program.score(), 0.0);
    }

    #[test]
    fn test_raw_score_passes_through() {
        let (terms, layout) = one_term_setup();
        let mut md = layout.create_match_data();
        let mut program = NativeRankProgram::new(terms);
        md.resolve_term_field(0).set_raw_score(5, 0.75);
        program.run(5, md.term_fields());
        assert_eq!(program.score(), 0.75);
    }

    #[test]
    fn test_feature_names_align_with_values() {
        let (terms, layout) = one_term_setup();
        let md = layout.create_match_data();
        let mut program = NativeRankProgram::new(terms);
        program.run(1, md.term_fields());
        assert_eq!(program.feature_names().len(), program.feature_values().len());
        assert_eq!(program.feature_names()[0], "nativeRank");
    }
}
