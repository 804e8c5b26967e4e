//! Gap extraction: turning model output into a [`GapRecord`].
//!
//! Two strategies are available. [`HeuristicExtractor`] reads free text
//! sentence by sentence; [`StructuredExtractor`] parses a JSON object.
//! [`AutoExtractor`] tries JSON first and falls back to the heuristic.
//! Every strategy ends in [`finalize`], which enforces that a record carries
//! follow-up questions exactly when it reports a gap.

mod heuristic;
mod structured;
mod vocabulary;

pub use heuristic::HeuristicExtractor;
pub use structured::{AutoExtractor, StructuredExtractor};

use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::ExtractionStrategy;
use crate::error::{TurnError, TurnResult};
use crate::session::GapRecord;

/// Parses a raw model response into a gap record.
///
/// Implementations are pure: the same input always yields the same record.
pub trait GapExtractor: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Extract a gap record. `raw_response` is left empty; the caller
    /// attaches the text it passed in.
    fn extract(&self, raw_text: &str) -> TurnResult<GapRecord>;
}

/// Build the extractor for a configured strategy.
pub fn extractor_for(strategy: ExtractionStrategy, max_questions: usize) -> Arc<dyn GapExtractor> {
    match strategy {
        ExtractionStrategy::Heuristic => Arc::new(HeuristicExtractor::new(max_questions)),
        ExtractionStrategy::Structured => Arc::new(StructuredExtractor::new(max_questions)),
        ExtractionStrategy::Auto => Arc::new(AutoExtractor::new(max_questions)),
    }
}

/// Compile a pattern literal. Patterns are fixed at compile time, so a bad
/// one is a programming error.
pub(crate) fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}

/// Reject output that cannot be read as text.
pub(crate) fn validate_text(raw_text: &str) -> TurnResult<()> {
    if raw_text.trim().is_empty() {
        return Err(TurnError::MalformedResponse {
            message: "Model returned an empty response".to_string(),
        });
    }

    let binary = raw_text
        .chars()
        .find(|c| *c == '\u{FFFD}' || (c.is_control() && !matches!(c, '\n' | '\r' | '\t')));
    if let Some(c) = binary {
        return Err(TurnError::MalformedResponse {
            message: format!("Model returned a non-text payload (found U+{:04X})", c as u32),
        });
    }

    Ok(())
}

/// Whether the model explicitly said nothing is missing.
pub(crate) fn is_no_follow_up_sentinel(raw_text: &str) -> bool {
    let head = normalize(raw_text);
    ["no follow-up needed", "no follow up needed", "no followup needed"]
        .iter()
        .any(|sentinel| head.starts_with(sentinel))
}

/// Case-fold and collapse whitespace. Used as the dedup key.
pub(crate) fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Rephrase a clarification item as a question.
pub(crate) fn as_question(item: &str) -> String {
    let stem = item.trim().trim_end_matches(['.', '!', ':', ';', ',']).trim_end();
    if stem.ends_with('?') {
        stem.to_string()
    } else {
        format!("{}?", stem)
    }
}

/// Reconcile questions with detected gaps and apply the question cap.
///
/// Questions that arrived without any gap are classified and kept as gaps.
/// Gaps that arrived without questions get synthesized ones: clarification
/// items are rephrased, categories use their canned prompt.
pub(crate) fn finalize(mut record: GapRecord, max_questions: usize) -> GapRecord {
    if !record.has_gap() {
        let orphans = std::mem::take(&mut record.follow_up_questions);
        for question in &orphans {
            let categories = vocabulary::categories_in(question);
            if categories.is_empty() {
                record.clarification_needed.push(question.clone());
            } else {
                record.missing_information.extend(categories);
            }
        }
        record.follow_up_questions = orphans;
    }

    if record.has_gap() && record.follow_up_questions.is_empty() {
        record.follow_up_questions = synthesized_questions(&record);
    }

    record.follow_up_questions.truncate(max_questions.max(1));
    record
}

/// Questions built from the record's gaps, deduplicated.
fn synthesized_questions(record: &GapRecord) -> Vec<String> {
    let mut seen = HashSet::new();
    record
        .clarification_needed
        .iter()
        .map(|item| as_question(item))
        .chain(
            record
                .missing_information
                .iter()
                .map(|category| category.prompt().to_string()),
        )
        .filter(|question| seen.insert(normalize(question)))
        .collect()
}

/// Drop questions the user was already asked. `asked` holds normalized
/// question text.
///
/// A record with a gap keeps at least one question: synthesized prompts
/// replace repeats, and if those were asked too the first question stays.
/// The question count never grows.
pub(crate) fn drop_repeated_questions(mut record: GapRecord, asked: &HashSet<String>) -> GapRecord {
    let limit = record.follow_up_questions.len();
    let is_new = |question: &String| !asked.contains(&normalize(question));
    if record.follow_up_questions.iter().all(is_new) {
        return record;
    }

    let mut fresh: Vec<String> = record
        .follow_up_questions
        .iter()
        .filter(|question| is_new(*question))
        .cloned()
        .collect();
    if fresh.is_empty() {
        fresh = synthesized_questions(&record)
            .into_iter()
            .filter(|question| is_new(question))
            .collect();
    }
    if fresh.is_empty() {
        record.follow_up_questions.truncate(1);
        return record;
    }

    fresh.truncate(limit);
    record.follow_up_questions = fresh;
    record
}
