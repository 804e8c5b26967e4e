use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::extractor::compile_regex;
use crate::config::DEFAULT_MAX_HISTORY_TURNS;
use crate::error::{TurnError, TurnResult};
use crate::session::{ConversationTurn, Role, SessionState};

/// Context key for a fund mentioned by the user.
pub const FUND_NAME_KEY: &str = "fund_name";
/// Context key for a timeframe mentioned by the user.
pub const TIMEFRAME_KEY: &str = "timeframe";
/// Context key holding the questions asked on the previous turn.
pub const PREVIOUS_QUESTIONS_KEY: &str = "follow_up.previous_questions";
/// Context key for the lexical intent of the query being clarified.
pub const INTENT_KEY: &str = "follow_up.intent";

/// Intent used when no other pattern matches.
const DEFAULT_INTENT: &str = "information_seeking";

/// Intent labels in precedence order.
const INTENT_PATTERNS: &[(&str, &str)] = &[
    (
        "comparison",
        r"(?i)\b(?:compar(?:e|ed|ing|ison)|vs|versus|better\s+than|difference\s+between)\b",
    ),
    (
        "recommendation",
        r"(?i)\b(?:should\s+i|recommend\w*|suggest\w*|advi[cs]e|best|worth\s+(?:buying|investing))\b",
    ),
    (
        "problem_solving",
        r"(?i)\b(?:why|problem|issue|wrong|fix|dropp(?:ed|ing)|fell|loss(?:es)?)\b",
    ),
    (
        "clarification",
        r"(?i)\b(?:what\s+do\s+you\s+mean|meaning\s+of|clarify|explain\s+what)\b",
    ),
];

static INTENTS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    INTENT_PATTERNS
        .iter()
        .map(|(intent, pattern)| (*intent, compile_regex(pattern)))
        .collect()
});

static FUND_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r"\b((?:[A-Z0-9][\w&'.-]*\s+){1,8}(?:Fund|ETF|FoF))\b")
});

static TIMEFRAME_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(
        r"(?i)\b(\d+(?:\.\d+)?\s*-?\s*(?:years?|yrs?|months?|weeks?|days?)|ytd|year[\s-]to[\s-]date|since\s+inception|(?:this|last|past)\s+(?:year|quarter|month|week))\b",
    )
});

/// Capitalised words that open a sentence rather than a fund name.
const LEADING_STOPWORDS: &[&str] = &[
    "How", "What", "Which", "Is", "Are", "Was", "Tell", "Show", "Compare", "The", "My", "About",
    "Does", "Did", "Do", "Should", "Can", "Could", "Please", "Give", "Me", "Why", "When", "And",
    "Also", "Vs", "Of", "In", "I",
];

/// Everything the model needs for one follow-up turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    /// Most recent history, oldest first.
    pub history: Vec<ConversationTurn>,
    /// Session values plus entities recovered from the conversation.
    pub context_map: BTreeMap<String, String>,
    /// The query anchoring this turn.
    pub current_query: String,
}

/// Builds the model input from session state. Never mutates the session.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    max_history_turns: usize,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY_TURNS)
    }
}

impl ContextAssembler {
    /// Keep at most `max_history_turns` prior turns in the model input.
    pub fn new(max_history_turns: usize) -> Self {
        Self { max_history_turns }
    }

    /// Assemble the context for the session's anchor query.
    ///
    /// Values already present in the session win over anything recovered
    /// from the text, so explicit context set by upstream agents is never
    /// overridden.
    pub fn assemble(&self, session: &SessionState) -> TurnResult<AssembledContext> {
        let query = session.anchor_query().ok_or_else(|| TurnError::InvalidState {
            message: format!("Session {} has no user query to anchor the turn", session.id),
        })?;

        let history = session.context.recent_turns(self.max_history_turns).to_vec();
        let mut context_map = session.context.values().clone();

        // Newest mention first: the query, then user turns in reverse.
        let user_texts: Vec<&str> = std::iter::once(query)
            .chain(
                session
                    .context
                    .turns()
                    .iter()
                    .rev()
                    .filter(|turn| turn.role == Role::User)
                    .map(|turn| turn.text.as_str()),
            )
            .collect();

        if !context_map.contains_key(FUND_NAME_KEY) {
            if let Some(fund) = user_texts.iter().find_map(|text| find_fund_name(text)) {
                context_map.insert(FUND_NAME_KEY.to_string(), fund);
            }
        }
        if !context_map.contains_key(TIMEFRAME_KEY) {
            if let Some(timeframe) = user_texts.iter().find_map(|text| find_timeframe(text)) {
                context_map.insert(TIMEFRAME_KEY.to_string(), timeframe);
            }
        }

        let reentry = session.gap_record.as_ref().filter(|r| r.has_gap());
        if let Some(record) = reentry {
            context_map
                .entry(PREVIOUS_QUESTIONS_KEY.to_string())
                .or_insert_with(|| record.follow_up_questions.join(" "));
        }

        // An answer to our questions carries no intent of its own; classify
        // the query it clarifies instead.
        let intent_source = match reentry {
            Some(_) => user_texts.get(1).copied().unwrap_or(query),
            None => query,
        };
        context_map
            .entry(INTENT_KEY.to_string())
            .or_insert_with(|| classify_intent(intent_source).to_string());

        Ok(AssembledContext {
            history,
            context_map,
            current_query: query.to_string(),
        })
    }
}

/// Coarse intent label for a user query.
pub(crate) fn classify_intent(text: &str) -> &'static str {
    INTENTS
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map_or(DEFAULT_INTENT, |(intent, _)| *intent)
}

/// First fund name mentioned in `text`, with sentence openers removed.
pub(crate) fn find_fund_name(text: &str) -> Option<String> {
    FUND_MENTION.captures_iter(text).find_map(|caps| {
        let words: Vec<&str> = caps[1]
            .split_whitespace()
            .skip_while(|word| LEADING_STOPWORDS.contains(word))
            .collect();
        // A lone "Fund" is not a name.
        (words.len() > 1).then(|| words.join(" "))
    })
}

/// First timeframe mentioned in `text`, lowercased.
pub(crate) fn find_timeframe(text: &str) -> Option<String> {
    TIMEFRAME_MENTION.captures(text).map(|caps| {
        caps[1]
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    })
}
