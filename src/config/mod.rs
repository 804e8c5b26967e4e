use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Default number of conversation turns included in a prompt.
pub const DEFAULT_MAX_HISTORY_TURNS: usize = 20;

/// Default cap on rendered follow-up questions.
pub const DEFAULT_MAX_FOLLOW_UP_QUESTIONS: usize = 5;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
    pub follow_up: FollowUpConfig,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Upstream request configuration.
///
/// `timeout_ms` is the per-attempt deadline; `max_retries` counts retries after
/// the first attempt, so a turn makes at most `max_retries + 1` requests.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Langbase pipe name configuration
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub follow_up: String,
}

/// Follow-up pipeline tuning
#[derive(Debug, Clone)]
pub struct FollowUpConfig {
    /// Most recent turns sent to the model.
    pub max_history_turns: usize,
    /// Cap on rendered follow-up questions. Values below one are treated as one.
    pub max_questions: usize,
    /// How model text is turned into a gap record.
    pub extraction: ExtractionStrategy,
}

/// Gap extraction strategy selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// Lexical pattern matching over free prose.
    #[default]
    Heuristic,
    /// JSON emitted by the model.
    Structured,
    /// JSON when present, prose otherwise.
    Auto,
}

impl std::fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionStrategy::Heuristic => write!(f, "heuristic"),
            ExtractionStrategy::Structured => write!(f, "structured"),
            ExtractionStrategy::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for ExtractionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "heuristic" => Ok(ExtractionStrategy::Heuristic),
            "structured" | "json" => Ok(ExtractionStrategy::Structured),
            "auto" => Ok(ExtractionStrategy::Auto),
            _ => Err(format!("Unknown extraction strategy: {}", s)),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").map_err(|_| AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/followup.db".to_string()),
            ),
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let defaults = RequestConfig::default();
        let request = RequestConfig {
            timeout_ms: parse_env("REQUEST_TIMEOUT_MS").unwrap_or(defaults.timeout_ms),
            max_retries: parse_env("MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_delay_ms: parse_env("RETRY_DELAY_MS").unwrap_or(defaults.retry_delay_ms),
        };

        let pipes = PipeConfig {
            follow_up: env::var("PIPE_FOLLOWUP")
                .unwrap_or_else(|_| PipeConfig::default().follow_up),
        };

        let extraction = match env::var("EXTRACTION_STRATEGY") {
            Ok(raw) => raw
                .parse::<ExtractionStrategy>()
                .map_err(|message| AppError::Config { message })?,
            Err(_) => ExtractionStrategy::default(),
        };

        let follow_up = FollowUpConfig {
            max_history_turns: parse_env("MAX_HISTORY_TURNS")
                .unwrap_or(DEFAULT_MAX_HISTORY_TURNS),
            max_questions: parse_env::<usize>("MAX_FOLLOW_UP_QUESTIONS")
                .unwrap_or(DEFAULT_MAX_FOLLOW_UP_QUESTIONS)
                .max(1),
            extraction,
        };

        Ok(Config {
            langbase,
            database,
            logging,
            request,
            pipes,
            follow_up,
        })
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl RequestConfig {
    /// Per-attempt deadline as a [`Duration`].
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            follow_up: "follow-up-agent-v1".to_string(),
        }
    }
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            max_history_turns: DEFAULT_MAX_HISTORY_TURNS,
            max_questions: DEFAULT_MAX_FOLLOW_UP_QUESTIONS,
            extraction: ExtractionStrategy::default(),
        }
    }
}
