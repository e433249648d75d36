//! Built-in stage capabilities.
//!
//! The local text stages (header/footer, clean, replace, line removal,
//! buttons to text, text watermark) are complete. Translate and rewrite are
//! external services; `LabelTranslator` and `StyleRewriter` are offline
//! stand-ins with the same contract.

use async_trait::async_trait;
use regex::{NoExpand, Regex, RegexBuilder};
use std::sync::LazyLock;

use crate::domain::{Payload, ReplaceRule, StageConfig, StageError, StageKind};
use crate::ports::Stage;

fn mismatch(kind: StageKind, config: &StageConfig) -> StageError {
    StageError::new(kind, format!("got {} config", config.kind()))
}

/// Adds a header above and/or a footer below the text, separated by a blank line.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderFooterStage;

#[async_trait]
impl Stage for HeaderFooterStage {
    async fn apply(&self, mut payload: Payload, config: &StageConfig) -> Result<Payload, StageError> {
        let StageConfig::HeaderFooter { header, footer } = config else {
            return Err(mismatch(StageKind::HeaderFooter, config));
        };
        if let Some(header) = header.as_deref().filter(|h| !h.is_empty()) {
            payload.text = format!("{header}\n\n{}", payload.text);
        }
        if let Some(footer) = footer.as_deref().filter(|f| !f.is_empty()) {
            payload.text = format!("{}\n\n{footer}", payload.text);
        }
        Ok(payload)
    }
}

static USERNAMES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\w+").expect("valid username pattern"));
static URLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("valid url pattern"));
static TG_LINKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"t\.me/\S+").expect("valid t.me pattern"));
static HASHTAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\w+").expect("valid hashtag pattern"));
static MD_LINKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[.*?\]\(.*?\)").expect("valid markdown link pattern"));
static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("valid blank line pattern"));

/// Strips usernames, urls, hashtags and markdown links, then tidies whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanStage;

impl CleanStage {
    fn clean(
        text: &str,
        remove_usernames: bool,
        remove_urls: bool,
        remove_hashtags: bool,
        remove_links: bool,
    ) -> String {
        if text.is_empty() {
            return String::new();
        }
        let mut out = text.to_string();
        if remove_usernames {
            out = USERNAMES.replace_all(&out, "").into_owned();
        }
        if remove_urls {
            out = URLS.replace_all(&out, "").into_owned();
            out = TG_LINKS.replace_all(&out, "").into_owned();
        }
        if remove_hashtags {
            out = HASHTAGS.replace_all(&out, "").into_owned();
        }
        if remove_links {
            out = MD_LINKS.replace_all(&out, "").into_owned();
        }
        out = BLANK_RUNS.replace_all(&out, "\n\n").into_owned();
        out.trim().to_string()
    }
}

#[async_trait]
impl Stage for CleanStage {
    async fn apply(&self, mut payload: Payload, config: &StageConfig) -> Result<Payload, StageError> {
        let StageConfig::Clean {
            remove_usernames,
            remove_urls,
            remove_hashtags,
            remove_links,
        } = config
        else {
            return Err(mismatch(StageKind::Clean, config));
        };
        payload.text = Self::clean(
            &payload.text,
            *remove_usernames,
            *remove_urls,
            *remove_hashtags,
            *remove_links,
        );
        Ok(payload)
    }
}

/// Literal find/replace, rules applied in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceStage;

impl ReplaceStage {
    fn replace_one(text: &str, rule: &ReplaceRule) -> Result<String, StageError> {
        if rule.from.is_empty() {
            return Ok(text.to_string());
        }
        if rule.case_sensitive {
            return Ok(text.replace(&rule.from, &rule.to));
        }
        let re = RegexBuilder::new(&regex::escape(&rule.from))
            .case_insensitive(true)
            .build()
            .map_err(|e| StageError::new(StageKind::Replace, e.to_string()))?;
        Ok(re.replace_all(text, NoExpand(&rule.to)).into_owned())
    }
}

#[async_trait]
impl Stage for ReplaceStage {
    async fn apply(&self, mut payload: Payload, config: &StageConfig) -> Result<Payload, StageError> {
        let StageConfig::Replace { rules } = config else {
            return Err(mismatch(StageKind::Replace, config));
        };
        for rule in rules {
            payload.text = Self::replace_one(&payload.text, rule)?;
        }
        Ok(payload)
    }
}

/// Drops lines that contain any of the keywords, ignoring case.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveLinesStage;

#[async_trait]
impl Stage for RemoveLinesStage {
    async fn apply(&self, mut payload: Payload, config: &StageConfig) -> Result<Payload, StageError> {
        let StageConfig::RemoveLines { keywords } = config else {
            return Err(mismatch(StageKind::RemoveLines, config));
        };
        let keywords: Vec<String> = keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .map(|k| k.to_lowercase())
            .collect();
        if keywords.is_empty() || payload.text.is_empty() {
            return Ok(payload);
        }
        payload.text = payload
            .text
            .split('\n')
            .filter(|line| {
                let line = line.to_lowercase();
                !keywords.iter().any(|k| line.contains(k.as_str()))
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(payload)
    }
}

/// Drops lines by 1-based position. Out-of-range numbers are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveLineNumbersStage;

#[async_trait]
impl Stage for RemoveLineNumbersStage {
    async fn apply(&self, mut payload: Payload, config: &StageConfig) -> Result<Payload, StageError> {
        let StageConfig::RemoveLineNumbers { lines } = config else {
            return Err(mismatch(StageKind::RemoveLineNumbers, config));
        };
        if lines.is_empty() || payload.text.is_empty() {
            return Ok(payload);
        }
        payload.text = payload
            .text
            .split('\n')
            .enumerate()
            .filter(|(index, _)| !lines.contains(&(index + 1)))
            .map(|(_, line)| line)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(payload)
    }
}

/// Turns inline buttons into a bullet list under the text.
#[derive(Debug, Clone, Copy, Default)]
pub struct ButtonsToTextStage;

#[async_trait]
impl Stage for ButtonsToTextStage {
    async fn apply(&self, mut payload: Payload, config: &StageConfig) -> Result<Payload, StageError> {
        let StageConfig::ButtonsToText = config else {
            return Err(mismatch(StageKind::ButtonsToText, config));
        };
        let bullets: Vec<String> = std::mem::take(&mut payload.buttons)
            .into_iter()
            .filter(|label| !label.trim().is_empty())
            .map(|label| format!("\u{2022} {label}"))
            .collect();
        if bullets.is_empty() {
            return Ok(payload);
        }
        let list = bullets.join("\n");
        payload.text = if payload.text.is_empty() {
            list
        } else {
            format!("{}\n\n{list}", payload.text)
        };
        Ok(payload)
    }
}

/// Marks media with the watermark text; text-only messages get it appended.
///
/// Rendering onto the image is the platform adapter's job.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextWatermarkStage;

#[async_trait]
impl Stage for TextWatermarkStage {
    async fn apply(&self, mut payload: Payload, config: &StageConfig) -> Result<Payload, StageError> {
        let StageConfig::Watermark { text, .. } = config else {
            return Err(mismatch(StageKind::Watermark, config));
        };
        match payload.media_ref.as_mut() {
            Some(media) => media.watermark = Some(text.clone()),
            None if payload.text.is_empty() => payload.text = text.clone(),
            None => payload.text = format!("{}\n\n{text}", payload.text),
        }
        Ok(payload)
    }
}

/// Offline translator: prefixes the text with the target language tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelTranslator;

#[async_trait]
impl Stage for LabelTranslator {
    async fn apply(&self, mut payload: Payload, config: &StageConfig) -> Result<Payload, StageError> {
        let StageConfig::Translate { target_lang } = config else {
            return Err(mismatch(StageKind::Translate, config));
        };
        if !payload.text.is_empty() {
            payload.text = format!("[{target_lang}] {}", payload.text);
        }
        Ok(payload)
    }
}

/// Offline rewriter. Knows `upper`, `lower` and `plain`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StyleRewriter;

#[async_trait]
impl Stage for StyleRewriter {
    async fn apply(&self, mut payload: Payload, config: &StageConfig) -> Result<Payload, StageError> {
        let StageConfig::Rewrite { style } = config else {
            return Err(mismatch(StageKind::Rewrite, config));
        };
        payload.text = match style.as_str() {
            "upper" => payload.text.to_uppercase(),
            "lower" => payload.text.to_lowercase(),
            "plain" => payload.text,
            other => {
                return Err(StageError::new(
                    StageKind::Rewrite,
                    format!("unknown style '{other}'"),
                ));
            }
        };
        Ok(payload)
    }
}
