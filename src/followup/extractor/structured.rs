use serde::Deserialize;
use std::collections::HashSet;

use super::{
    finalize, is_no_follow_up_sentinel, normalize, validate_text, GapExtractor, HeuristicExtractor,
};
use crate::error::{TurnError, TurnResult};
use crate::session::{GapCategory, GapRecord};

/// Gap fields as emitted by the structured follow-up prompt.
#[derive(Debug, Default, Deserialize)]
struct StructuredGaps {
    #[serde(default, alias = "missingInformation", alias = "missing_info")]
    missing_information: Vec<String>,
    #[serde(default, alias = "clarificationNeeded", alias = "clarifications")]
    clarification_needed: Vec<String>,
    #[serde(default, alias = "followUpQuestions", alias = "questions")]
    follow_up_questions: Vec<String>,
}

/// A bare JSON array is read as a list of questions.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StructuredPayload {
    Record(StructuredGaps),
    Questions(Vec<String>),
}

/// Extract a JSON document from a model completion.
///
/// Accepts raw JSON, a ```json fenced block, or a bare ``` fenced block.
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

/// Parses the JSON shape requested by the structured prompt.
///
/// Category labels outside the vocabulary are kept as clarification items
/// rather than dropped.
#[derive(Debug, Clone)]
pub struct StructuredExtractor {
    max_questions: usize,
}

impl StructuredExtractor {
    /// Create an extractor that keeps at most `max_questions` questions.
    pub fn new(max_questions: usize) -> Self {
        Self {
            max_questions: max_questions.max(1),
        }
    }

    fn parse(&self, raw_text: &str) -> TurnResult<StructuredGaps> {
        let json = extract_json_from_completion(raw_text)
            .map_err(|message| TurnError::MalformedResponse { message })?;

        let payload: StructuredPayload =
            serde_json::from_str(json).map_err(|e| TurnError::MalformedResponse {
                message: format!("Failed to parse gap JSON: {}", e),
            })?;

        Ok(match payload {
            StructuredPayload::Record(gaps) => gaps,
            StructuredPayload::Questions(questions) => StructuredGaps {
                follow_up_questions: questions,
                ..Default::default()
            },
        })
    }
}

impl GapExtractor for StructuredExtractor {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn extract(&self, raw_text: &str) -> TurnResult<GapRecord> {
        validate_text(raw_text)?;
        if is_no_follow_up_sentinel(raw_text) {
            return Ok(GapRecord::empty());
        }

        let gaps = self.parse(raw_text)?;
        let mut record = GapRecord::empty();
        let mut seen_clarifications = HashSet::new();

        let mut push_clarification = |record: &mut GapRecord, item: &str| {
            let item = item.trim();
            if !item.is_empty() && seen_clarifications.insert(normalize(item)) {
                record.clarification_needed.push(item.to_string());
            }
        };

        for label in &gaps.missing_information {
            match label.parse::<GapCategory>() {
                Ok(category) => {
                    record.missing_information.insert(category);
                }
                Err(_) => push_clarification(&mut record, label),
            }
        }
        for item in &gaps.clarification_needed {
            push_clarification(&mut record, item);
        }

        let mut seen_questions = HashSet::new();
        for question in gaps.follow_up_questions {
            let question = question.trim();
            if !question.is_empty() && seen_questions.insert(normalize(question)) {
                record.follow_up_questions.push(question.to_string());
            }
        }

        Ok(finalize(record, self.max_questions))
    }
}

/// Structured extraction when the output holds JSON, heuristic otherwise.
#[derive(Debug, Clone)]
pub struct AutoExtractor {
    structured: StructuredExtractor,
    heuristic: HeuristicExtractor,
}

impl AutoExtractor {
    /// Create an extractor that keeps at most `max_questions` questions.
    pub fn new(max_questions: usize) -> Self {
        Self {
            structured: StructuredExtractor::new(max_questions),
            heuristic: HeuristicExtractor::new(max_questions),
        }
    }
}

impl GapExtractor for AutoExtractor {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn extract(&self, raw_text: &str) -> TurnResult<GapRecord> {
        validate_text(raw_text)?;
        match self.structured.extract(raw_text) {
            Ok(record) => Ok(record),
            Err(TurnError::MalformedResponse { message }) => {
                tracing::debug!(reason = %message, "No usable JSON, falling back to heuristic extraction");
                self.heuristic.extract(raw_text)
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn extract(text: &str) -> TurnResult<GapRecord> {
        StructuredExtractor::new(5).extract(text)
    }

    #[test]
    fn test_extract_json_raw_and_fenced() {
        assert_eq!(extract_json_from_completion(" {\"a\":1} ").unwrap(), "{\"a\":1}");
        assert_eq!(
            extract_json_from_completion("Here:\n```json\n{\"a\":1}\n```").unwrap(),
            "{\"a\":1}"
        );
        assert_eq!(extract_json_from_completion("```\n[1]\n```").unwrap(), "[1]");
        assert!(extract_json_from_completion("```json\n```").is_err());
        assert!(extract_json_from_completion("Which fund?").is_err());
    }

    #[test]
    fn test_structured_record() {
        let record = extract(
            r#"{
                "missing_information": ["fund_name", "Time Frame"],
                "clarification_needed": [],
                "follow_up_questions": ["Which fund?", "Over what period?"]
            }"#,
        )
        .unwrap();

        assert_eq!(record.category_labels(), vec!["fund_name", "timeframe"]);
        assert_eq!(record.follow_up_questions, vec!["Which fund?", "Over what period?"]);
    }

    #[test]
    fn test_unknown_label_becomes_clarification() {
        let record = extract(r#"{"missing_information": ["tax_bracket"], "questions": []}"#).unwrap();
        assert!(record.missing_information.is_empty());
        assert_eq!(record.clarification_needed, vec!["tax_bracket"]);
        assert_eq!(record.follow_up_questions, vec!["tax_bracket?"]);
    }

    #[test]
    fn test_bare_question_array() {
        let record = extract(r#"["Which benchmark should I use?"]"#).unwrap();
        assert_eq!(record.category_labels(), vec!["benchmark"]);
        assert_eq!(record.follow_up_questions.len(), 1);
    }

    #[test]
    fn test_empty_arrays_mean_no_gap() {
        let record = extract(
            "```json\n{\"missing_information\": [], \"clarification_needed\": [], \"follow_up_questions\": []}\n```",
        )
        .unwrap();
        assert_eq!(record, GapRecord::empty());
    }

    #[test]
    fn test_prose_is_malformed_for_structured() {
        let err = extract("Which fund are you referring to?").unwrap_err();
        assert!(matches!(err, TurnError::MalformedResponse { .. }));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = extract("{\"missing_information\": [\"fund_name\"").unwrap_err();
        assert!(matches!(err, TurnError::MalformedResponse { .. }));
    }

    #[test]
    fn test_auto_prefers_json_and_falls_back() {
        let auto = AutoExtractor::new(5);

        let from_json = auto
            .extract(r#"{"missing_information": ["benchmark"], "follow_up_questions": ["Which index?"]}"#)
            .unwrap();
        assert_eq!(from_json.category_labels(), vec!["benchmark"]);
        assert_eq!(from_json.follow_up_questions, vec!["Which index?"]);

        let from_text = auto.extract("Which fund are you referring to?").unwrap();
        assert_eq!(from_text.category_labels(), vec!["fund_name"]);
    }

    #[test]
    fn test_auto_still_rejects_empty_output() {
        assert!(AutoExtractor::new(5).extract("").is_err());
    }
}
