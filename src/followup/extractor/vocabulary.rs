use regex::{Regex, RegexSet};
use std::collections::BTreeSet;
use std::sync::LazyLock;

use super::compile_regex;
use crate::session::GapCategory;

/// Surface forms that attribute a sentence to a gap category.
///
/// All patterns are case-insensitive and word-bounded. "performance" is
/// deliberately absent from `MetricType`: models say it in nearly every
/// sentence about a fund.
const CATEGORY_SURFACE_FORMS: &[(GapCategory, &[&str])] = &[
    (
        GapCategory::FundName,
        &[
            r"\b(?:which|what)\s+(?:(?:specific|particular|mutual)\s+)*(?:funds?|schemes?)\b",
            r"\bfunds?\s*-?\s*names?\b",
            r"\bname\s+of\s+(?:the|your)\s+(?:mutual\s+)?(?:funds?|schemes?)\b",
            r"\bspecify\s+(?:the\s+|which\s+|a\s+)?(?:mutual\s+)?(?:funds?|schemes?)\b",
            r"\bspecific\s+funds?\b",
            r"\bscheme\s+(?:name|code)\b",
        ],
    ),
    (
        GapCategory::Timeframe,
        &[
            r"\btime\s*-?\s*frames?\b",
            r"\btime\s*-?\s*(?:period|horizon|range)s?\b",
            r"\b(?:which|what)\s+(?:period|duration|dates?|years?)\b",
            r"\bhow\s+long\b",
            r"\bsince\s+when\b",
            r"\bover\s+what\b",
            r"\bhorizon\b",
            r"\bstart(?:ing)?\s+date\b",
        ],
    ),
    (
        GapCategory::Benchmark,
        &[
            r"\bbenchmarks?\b",
            r"\b(?:which|what)\s+(?:market\s+)?ind(?:ex|ices)\b",
            r"\brelative\s+to\s+(?:which|what)\b",
        ],
    ),
    (
        GapCategory::PortfolioDetails,
        &[
            r"\bportfolios?\b",
            r"\byour\s+(?:current\s+)?(?:holdings|investments|allocation)\b",
            r"\bcurrently\s+(?:hold|own|invested)\b",
        ],
    ),
    (
        GapCategory::ComparisonTarget,
        &[
            r"\bcompar(?:e|ed|ing|ison)\b",
            r"\b(?:versus|vs\.?)\s",
            r"\bwhich\s+other\s+(?:funds?|schemes?|options?)\b",
            r"\bagainst\s+(?:which|what)\b",
        ],
    ),
    (
        GapCategory::MetricType,
        &[
            r"\bmetrics?\b",
            r"\b(?:which|what)\s+(?:measures?|kpis?|figures?)\b",
            r"\b(?:absolute|annuali[sz]ed|trailing|rolling)\s+returns?\b",
            r"\b(?:cagr|xirr|nav|expense\s+ratio|sharpe(?:\s+ratio)?|volatility|standard\s+deviation|alpha|beta)\b",
        ],
    ),
    (
        GapCategory::InvestmentAmount,
        &[
            r"\b(?:investment|invested|sip|lump\s*-?\s*sum)\s+amount\b",
            r"\bhow\s+much\s+(?:money\s+)?(?:do|would|are|have|did|will|can)\b",
            r"\bamount\s+(?:you|to)\s+(?:(?:want|plan|wish)\s+to\s+)?invest\b",
        ],
    ),
    (
        GapCategory::RiskProfile,
        &[
            r"\brisk\s+(?:profile|appetite|tolerance|level|capacity)\b",
            r"\bcomfortable\s+with\s+(?:risk|volatility)\b",
            r"\b(?:conservative|moderate|aggressive)\s+investor\b",
        ],
    ),
    (
        GapCategory::InvestmentGoals,
        &[
            r"\bgoals?\b",
            r"\bobjectives?\b",
            r"\bsaving\s+for\b",
            r"\bpurpose\s+of\b",
        ],
    ),
];

static CATEGORY_PATTERNS: LazyLock<Vec<(GapCategory, RegexSet)>> = LazyLock::new(|| {
    CATEGORY_SURFACE_FORMS
        .iter()
        .map(|(category, forms)| {
            let patterns = forms.iter().map(|form| format!("(?i){form}"));
            (*category, compile_set(patterns))
        })
        .collect()
});

/// Words that mark a sentence as describing something missing or unclear.
static GAP_CUE: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(
        r"(?i)\b(?:missing|need|needs|needed|require[sd]?|specify|specified|unspecified|clarify|clarification|provide|confirm|let me know|not sure|unclear|ambiguous|please)\b",
    )
});

/// Closing offers ("let me know if you'd like ...") that mention a topic
/// without saying anything is missing.
static COURTESY_OFFER: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(
        r"(?i)\b(?:if you(?:'d| would)? (?:like|want|wish|prefer|need)|if you have (?:any|other|more)|anything else|happy to help|feel free)\b",
    )
});

fn compile_set(patterns: impl IntoIterator<Item = String>) -> RegexSet {
    let patterns: Vec<String> = patterns.into_iter().collect();
    match RegexSet::new(&patterns) {
        Ok(set) => set,
        Err(err) => panic!("invalid regex set {patterns:?}: {err}"),
    }
}

/// Every category whose surface forms occur in `sentence`.
pub(crate) fn categories_in(sentence: &str) -> BTreeSet<GapCategory> {
    CATEGORY_PATTERNS
        .iter()
        .filter(|(_, set)| set.is_match(sentence))
        .map(|(category, _)| *category)
        .collect()
}

/// Whether the sentence states that information is missing or unclear.
///
/// Courtesy offers never count, even when they contain a cue word.
pub(crate) fn has_gap_cue(sentence: &str) -> bool {
    GAP_CUE.is_match(sentence) && !COURTESY_OFFER.is_match(sentence)
}
