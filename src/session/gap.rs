use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Closed vocabulary of information a financial query can be missing.
///
/// Ordering is declaration order, which keeps serialized sets deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapCategory {
    /// Which fund or scheme the user means.
    FundName,
    /// The period the answer should cover.
    Timeframe,
    /// Index or benchmark to measure against.
    Benchmark,
    /// Holdings or portfolio context.
    PortfolioDetails,
    /// What to compare against.
    ComparisonTarget,
    /// Which performance measure to report.
    MetricType,
    /// How much money is involved.
    InvestmentAmount,
    /// The user's risk tolerance.
    RiskProfile,
    /// What the investment is for.
    InvestmentGoals,
}

impl GapCategory {
    /// Every category, in declaration order.
    pub const ALL: [GapCategory; 9] = [
        GapCategory::FundName,
        GapCategory::Timeframe,
        GapCategory::Benchmark,
        GapCategory::PortfolioDetails,
        GapCategory::ComparisonTarget,
        GapCategory::MetricType,
        GapCategory::InvestmentAmount,
        GapCategory::RiskProfile,
        GapCategory::InvestmentGoals,
    ];

    /// Stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            GapCategory::FundName => "fund_name",
            GapCategory::Timeframe => "timeframe",
            GapCategory::Benchmark => "benchmark",
            GapCategory::PortfolioDetails => "portfolio_details",
            GapCategory::ComparisonTarget => "comparison_target",
            GapCategory::MetricType => "metric_type",
            GapCategory::InvestmentAmount => "investment_amount",
            GapCategory::RiskProfile => "risk_profile",
            GapCategory::InvestmentGoals => "investment_goals",
        }
    }

    /// Question shown to the user when the model flagged this gap without
    /// phrasing a question for it.
    pub fn prompt(&self) -> &'static str {
        match self {
            GapCategory::FundName => "Which fund are you asking about?",
            GapCategory::Timeframe => "Over what timeframe should I look?",
            GapCategory::Benchmark => "Which benchmark should I compare against?",
            GapCategory::PortfolioDetails => {
                "Could you share the relevant details of your portfolio?"
            }
            GapCategory::ComparisonTarget => "What would you like to compare it with?",
            GapCategory::MetricType => {
                "Which metric matters most to you, such as returns, NAV or expense ratio?"
            }
            GapCategory::InvestmentAmount => "How much are you planning to invest?",
            GapCategory::RiskProfile => "How would you describe your risk tolerance?",
            GapCategory::InvestmentGoals => "What is the goal of this investment?",
        }
    }
}

impl std::fmt::Display for GapCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GapCategory {
    type Err = String;

    /// Accepts the canonical label and the loose spellings models tend to emit
    /// ("fund name", "Time-Frame", "risk tolerance").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();

        match key.as_str() {
            "fund_name" | "fund" | "fund_identity" | "specific_funds" | "scheme" => {
                Ok(GapCategory::FundName)
            }
            "timeframe" | "time_frame" | "time_period" | "period" | "duration" => {
                Ok(GapCategory::Timeframe)
            }
            "benchmark" | "index" => Ok(GapCategory::Benchmark),
            "portfolio_details" | "portfolio" | "portfolio_context" => {
                Ok(GapCategory::PortfolioDetails)
            }
            "comparison_target" | "comparison" | "comparison_criteria" => {
                Ok(GapCategory::ComparisonTarget)
            }
            "metric_type" | "metric" | "metrics" | "performance_metrics" => {
                Ok(GapCategory::MetricType)
            }
            "investment_amount" | "amount" => Ok(GapCategory::InvestmentAmount),
            "risk_profile" | "risk_tolerance" | "risk" => Ok(GapCategory::RiskProfile),
            "investment_goals" | "investment_goal" | "goals" | "goal" => {
                Ok(GapCategory::InvestmentGoals)
            }
            _ => Err(format!("Unknown gap category: {}", s)),
        }
    }
}

/// Structured record of what the agent still needs from the user.
///
/// `follow_up_questions` is empty exactly when both `missing_information` and
/// `clarification_needed` are empty. Downstream agents gate on this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRecord {
    /// Detected missing-information categories.
    pub missing_information: BTreeSet<GapCategory>,
    /// Free-text clarification items, order of appearance.
    pub clarification_needed: Vec<String>,
    /// Questions for direct display to the user.
    pub follow_up_questions: Vec<String>,
    /// Unparsed model output, kept for audit.
    pub raw_response: String,
}

impl GapRecord {
    /// A record that reports no gap.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether any gap was detected.
    pub fn has_gap(&self) -> bool {
        !self.missing_information.is_empty() || !self.clarification_needed.is_empty()
    }

    /// Whether the question list agrees with the detected gaps.
    pub fn is_consistent(&self) -> bool {
        self.has_gap() == !self.follow_up_questions.is_empty()
    }

    /// Attach the model output this record was extracted from.
    pub fn with_raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = raw.into();
        self
    }

    /// Category labels in deterministic order.
    pub fn category_labels(&self) -> Vec<&'static str> {
        self.missing_information.iter().map(GapCategory::as_str).collect()
    }

    /// Questions rendered as a single agent message.
    pub fn questions_text(&self) -> String {
        self.follow_up_questions.join("\n")
    }
}
