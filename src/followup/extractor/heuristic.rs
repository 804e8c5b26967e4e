use std::collections::HashSet;
use std::iter::Peekable;
use std::str::Chars;

use super::{finalize, is_no_follow_up_sentinel, normalize, validate_text, vocabulary, GapExtractor};
use crate::error::TurnResult;
use crate::session::GapRecord;

/// Sentence-level extraction over free-text model output.
///
/// Only two kinds of sentence count:
///
/// - a question (ends in `?`): its categories are recorded, it is kept as a
///   follow-up question verbatim, and it becomes a clarification item when no
///   category matches;
/// - a statement with a gap cue ("missing", "please specify"): it may add
///   categories, nothing else.
///
/// Everything else, including courtesy lines such as "Let me know if you have
/// any other questions.", is ignored.
#[derive(Debug, Clone)]
pub struct HeuristicExtractor {
    max_questions: usize,
}

impl HeuristicExtractor {
    /// Create an extractor that keeps at most `max_questions` questions.
    pub fn new(max_questions: usize) -> Self {
        Self {
            max_questions: max_questions.max(1),
        }
    }
}

impl GapExtractor for HeuristicExtractor {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn extract(&self, raw_text: &str) -> TurnResult<GapRecord> {
        validate_text(raw_text)?;
        if is_no_follow_up_sentinel(raw_text) {
            return Ok(GapRecord::empty());
        }

        let mut record = GapRecord::empty();
        let mut seen_clarifications = HashSet::new();
        let mut seen_questions = HashSet::new();

        for sentence in split_sentences(raw_text) {
            let asks = sentence.ends_with('?');
            if !asks && !vocabulary::has_gap_cue(&sentence) {
                continue;
            }

            let categories = vocabulary::categories_in(&sentence);
            let attributed = !categories.is_empty();
            record.missing_information.extend(categories);

            if !asks {
                continue;
            }
            if !attributed && seen_clarifications.insert(normalize(&sentence)) {
                record.clarification_needed.push(sentence.clone());
            }
            if seen_questions.insert(normalize(&sentence)) {
                record.follow_up_questions.push(sentence);
            }
        }

        Ok(finalize(record, self.max_questions))
    }
}

/// Split text into trimmed sentences.
///
/// Lines are split first, list markers ("-", "*", "1.", "2)") are dropped, and
/// a sentence ends at `.`, `?` or `!` followed by whitespace or end of line.
/// A `.` closing an abbreviation ("e.g.", "vs.") or an initial does not end
/// the sentence.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();

    for line in text.lines() {
        let line = strip_list_marker(line.trim());
        let mut current = String::new();
        let mut chars = line.chars().peekable();

        while let Some(c) = chars.next() {
            current.push(c);
            if matches!(c, '.' | '?' | '!') {
                while let Some(&closing) = chars.peek() {
                    if matches!(closing, '"' | '\'' | ')' | ']' | '*' | '`' | '\u{201D}' | '\u{2019}') {
                        current.push(closing);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let boundary = chars.peek().map_or(true, |next| next.is_whitespace());
                if boundary && !(c == '.' && ends_with_abbreviation(&current, &chars)) {
                    push_sentence(&mut sentences, &mut current);
                }
            }
        }
        push_sentence(&mut sentences, &mut current);
    }

    sentences
}

/// Abbreviations that never end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "e.g", "i.e", "vs", "viz", "cf", "approx", "incl", "esp", "mr", "mrs", "ms", "dr", "st",
];

/// Whether the `.` ending `buffer` belongs to an abbreviation.
///
/// "etc." only continues the sentence when the next word is lowercase, since
/// it often closes a list at the end of a sentence.
fn ends_with_abbreviation(buffer: &str, rest: &Peekable<Chars<'_>>) -> bool {
    let Some(stem) = buffer.strip_suffix('.') else {
        return false;
    };
    let word = stem
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or(stem)
        .trim_start_matches(['(', '[', '"', '\'', '\u{201C}']);

    let mut letters = word.chars();
    if let (Some(first), None) = (letters.next(), letters.next()) {
        return first.is_alphabetic();
    }

    let word = word.to_lowercase();
    if word == "etc" {
        return rest
            .clone()
            .find(|c| !c.is_whitespace())
            .is_some_and(char::is_lowercase);
    }
    ABBREVIATIONS.contains(&word.as_str())
}

fn push_sentence(sentences: &mut Vec<String>, buffer: &mut String) {
    let sentence = buffer.trim_matches(|c: char| c.is_whitespace() || c == '*' || c == '`');
    let sentence = sentence
        .strip_suffix(['"', '\'', ')', ']', '\u{201D}', '\u{2019}'])
        .filter(|s| s.ends_with(['.', '?', '!']))
        .unwrap_or(sentence)
        .trim();
    if !sentence.is_empty() {
        sentences.push(sentence.to_string());
    }
    buffer.clear();
}

fn strip_list_marker(line: &str) -> &str {
    let line = line
        .trim_start_matches(['-', '*', '>', '\u{2022}'])
        .trim_start();

    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if (1..=3).contains(&digits) {
        let rest = &line[digits..];
        if let Some(after) = rest.strip_prefix(['.', ')']) {
            if after.starts_with(char::is_whitespace) {
                return after.trim_start();
            }
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnError;
    use crate::session::GapCategory;
    use pretty_assertions::assert_eq;

    fn extract(text: &str) -> GapRecord {
        HeuristicExtractor::new(5).extract(text).unwrap()
    }

    #[test]
    fn test_split_sentences_on_terminators() {
        assert_eq!(
            split_sentences("Which fund are you referring to? Also, over what timeframe?"),
            vec!["Which fund are you referring to?", "Also, over what timeframe?"]
        );
    }

    #[test]
    fn test_split_sentences_keeps_decimals_together() {
        assert_eq!(
            split_sentences("The expense ratio is 1.5% today. Which benchmark?"),
            vec!["The expense ratio is 1.5% today.", "Which benchmark?"]
        );
    }

    #[test]
    fn test_split_sentences_strips_list_markers_and_emphasis() {
        let text = "I need a few details:\n1. Which fund?\n2) What is your risk appetite?\n- **Over what period?**";
        assert_eq!(
            split_sentences(text),
            vec![
                "I need a few details:",
                "Which fund?",
                "What is your risk appetite?",
                "Over what period?",
            ]
        );
    }

    #[test]
    fn test_quoted_question_mark_stays_a_question() {
        assert_eq!(
            split_sentences("Could you tell me \"which fund?\" Thanks."),
            vec!["Could you tell me \"which fund?", "Thanks."]
        );
    }

    #[test]
    fn test_two_categories_two_questions() {
        let record = extract("Which fund are you referring to? Also, over what timeframe?");
        assert_eq!(
            record.category_labels(),
            vec!["fund_name", "timeframe"]
        );
        assert!(record.clarification_needed.is_empty());
        assert_eq!(
            record.follow_up_questions,
            vec!["Which fund are you referring to?", "Also, over what timeframe?"]
        );
    }

    #[test]
    fn test_informational_sentence_does_not_raise_category() {
        let record = extract("Over the last year the fund beat its benchmark. Which fund did you mean?");
        assert_eq!(record.category_labels(), vec!["fund_name"]);
        assert_eq!(record.follow_up_questions, vec!["Which fund did you mean?"]);
    }

    #[test]
    fn test_unattributed_question_becomes_clarification() {
        let record = extract("Do you mean the direct plan or the regular plan?");
        assert!(record.missing_information.is_empty());
        assert_eq!(
            record.clarification_needed,
            vec!["Do you mean the direct plan or the regular plan?"]
        );
        assert_eq!(record.follow_up_questions.len(), 1);
    }

    #[test]
    fn test_split_sentences_skips_abbreviations() {
        assert_eq!(
            split_sentences("Which fund do you mean, e.g. HDFC Top 100 or SBI Bluechip? Thanks."),
            vec!["Which fund do you mean, e.g. HDFC Top 100 or SBI Bluechip?", "Thanks."]
        );
        assert_eq!(
            split_sentences("Is it direct vs. regular, i.e. the plan type? J. P. Morgan funds too."),
            vec!["Is it direct vs. regular, i.e. the plan type?", "J. P. Morgan funds too."]
        );
        assert_eq!(
            split_sentences("Returns, NAV, etc. are covered. Which metric? Bonds etc. too."),
            vec!["Returns, NAV, etc. are covered.", "Which metric?", "Bonds etc. too."]
        );
    }

    #[test]
    fn test_abbreviation_keeps_question_whole() {
        let record = extract("Which fund do you mean, e.g. HDFC Top 100 or SBI Bluechip?");
        assert_eq!(record.category_labels(), vec!["fund_name"]);
        assert!(record.clarification_needed.is_empty());
        assert_eq!(
            record.follow_up_questions,
            vec!["Which fund do you mean, e.g. HDFC Top 100 or SBI Bluechip?"]
        );
    }

    #[test]
    fn test_courtesy_lines_raise_no_gap() {
        for text in [
            "Here are the 3-year returns for the HDFC Top 100 Fund. Let me know if you have any other questions.",
            "What a great question. The fund returned 12% last year.",
            "Could you wait a moment while I fetch the data.",
            "Please let me know if you'd like a comparison with the benchmark.",
        ] {
            assert_eq!(extract(text), GapRecord::empty(), "text: {}", text);
        }
    }

    #[test]
    fn test_request_without_question_mark_gets_synthesized_question() {
        let record = extract("Please let me know the investment amount.");
        assert_eq!(
            record.missing_information.iter().copied().collect::<Vec<_>>(),
            vec![GapCategory::InvestmentAmount]
        );
        assert_eq!(
            record.follow_up_questions,
            vec![GapCategory::InvestmentAmount.prompt()]
        );
    }

    #[test]
    fn test_cue_sentence_without_question() {
        let record = extract("The benchmark is missing.");
        assert_eq!(record.category_labels(), vec!["benchmark"]);
        assert_eq!(record.follow_up_questions, vec![GapCategory::Benchmark.prompt()]);
    }

    #[test]
    fn test_duplicate_questions_collapse() {
        let record = extract("Which fund?\nwhich   FUND?");
        assert_eq!(record.follow_up_questions, vec!["Which fund?"]);
    }

    #[test]
    fn test_plain_statement_has_no_gap() {
        let record = extract("Here is a summary of the fund's performance.");
        assert!(!record.has_gap());
        assert!(record.follow_up_questions.is_empty());
    }

    #[test]
    fn test_sentinel_reports_no_gap() {
        let record = extract("No follow-up needed. The query is complete.");
        assert_eq!(record, GapRecord::empty());
    }

    #[test]
    fn test_question_cap() {
        let text = "Which fund? What period? Which benchmark? Which metric? How much do you invest? What is your goal?";
        let record = HeuristicExtractor::new(3).extract(text).unwrap();
        assert_eq!(record.follow_up_questions.len(), 3);
        assert_eq!(record.missing_information.len(), 6);
    }

    #[test]
    fn test_empty_text_is_malformed() {
        let err = HeuristicExtractor::new(5).extract("   \n").unwrap_err();
        assert!(matches!(err, TurnError::MalformedResponse { .. }));
    }
}
