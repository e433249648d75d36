//! Content filters evaluated before any stage runs.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::message::Message;

/// Words that mark a message as crypto-related.
pub const CRYPTO_KEYWORDS: &[&str] = &[
    "btc",
    "bitcoin",
    "eth",
    "ethereum",
    "crypto",
    "cryptocurrency",
    "blockchain",
    "wallet",
    "binance",
    "coinbase",
    "trading",
    "signal",
    "pump",
    "dump",
    "moon",
    "token",
    "nft",
    "defi",
    "airdrop",
];

/// Allow: the message must match. Block: the message must not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Allow,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum ContentFilter {
    /// Case-insensitive substring match against any of `keywords`.
    Keyword {
        keywords: Vec<String>,
        mode: FilterMode,
    },
    Regex {
        pattern: String,
        mode: FilterMode,
    },
    /// Match on the sender id. A message without a sender never matches.
    User {
        users: Vec<String>,
        mode: FilterMode,
    },
    /// Match on [`CRYPTO_KEYWORDS`]. Allow keeps only crypto posts, block drops them.
    Crypto {
        mode: FilterMode,
    },
}

fn contains_any<'a>(text: &str, words: impl IntoIterator<Item = &'a str>) -> bool {
    let lower = text.to_lowercase();
    words
        .into_iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .any(|w| lower.contains(&w))
}

impl ContentFilter {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ContentFilter::Keyword { keywords, .. } => {
                if keywords.iter().all(|k| k.trim().is_empty()) {
                    return Err("keyword filter without keywords".to_string());
                }
                Ok(())
            }
            ContentFilter::Regex { pattern, .. } => Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("invalid filter pattern '{pattern}': {e}")),
            ContentFilter::User { users, .. } => {
                if users.iter().all(|u| u.trim().is_empty()) {
                    return Err("user filter without users".to_string());
                }
                Ok(())
            }
            ContentFilter::Crypto { .. } => Ok(()),
        }
    }

    /// Does `message` pass this filter?
    ///
    /// Empty text passes every text filter (media-only messages have nothing to match).
    pub fn passes(&self, message: &Message) -> bool {
        let text = message.payload.text.as_str();
        let (matched, mode) = match self {
            ContentFilter::User { users, mode } => {
                let matched = message
                    .sender
                    .as_deref()
                    .is_some_and(|sender| users.iter().any(|u| u.trim() == sender));
                (matched, *mode)
            }
            _ if text.is_empty() => return true,
            ContentFilter::Keyword { keywords, mode } => {
                (contains_any(text, keywords.iter().map(String::as_str)), *mode)
            }
            ContentFilter::Crypto { mode } => (contains_any(text, CRYPTO_KEYWORDS.iter().copied()), *mode),
            ContentFilter::Regex { pattern, mode } => match Regex::new(pattern) {
                Ok(re) => (re.is_match(text), *mode),
                // validated at create time; a bad pattern that slipped through never blocks
                Err(_) => return true,
            },
        };
        match mode {
            FilterMode::Allow => matched,
            FilterMode::Block => !matched,
        }
    }
}

/// Does `message` pass every filter in order?
pub fn passes_all(filters: &[ContentFilter], message: &Message) -> bool {
    filters.iter().all(|f| f.passes(message))
}
