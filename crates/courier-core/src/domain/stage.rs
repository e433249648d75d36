//! Pipeline configuration: ordered stages, failure policy and content filters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::filter::ContentFilter;

/// Where a watermark goes on media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
}

/// One text replacement rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceRule {
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_case_sensitive() -> bool {
    true
}

fn default_true() -> bool {
    true
}

/// A single configured transformation.
///
/// Order inside `PipelineConfig::stages` is the application order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageConfig {
    Watermark {
        text: String,
        #[serde(default)]
        position: WatermarkPosition,
    },
    Translate {
        target_lang: String,
    },
    Rewrite {
        style: String,
    },
    HeaderFooter {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        footer: Option<String>,
    },
    Clean {
        #[serde(default = "default_true")]
        remove_usernames: bool,
        #[serde(default = "default_true")]
        remove_urls: bool,
        #[serde(default = "default_true")]
        remove_hashtags: bool,
        #[serde(default = "default_true")]
        remove_links: bool,
    },
    Replace {
        rules: Vec<ReplaceRule>,
    },
    /// Drop every line containing one of `keywords` (case-insensitive).
    RemoveLines {
        keywords: Vec<String>,
    },
    /// Drop lines by 1-based position.
    RemoveLineNumbers {
        lines: Vec<usize>,
    },
    /// Append inline button labels to the text as a bullet list.
    ButtonsToText,
}

impl StageConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            StageConfig::Watermark { .. } => StageKind::Watermark,
            StageConfig::Translate { .. } => StageKind::Translate,
            StageConfig::Rewrite { .. } => StageKind::Rewrite,
            StageConfig::HeaderFooter { .. } => StageKind::HeaderFooter,
            StageConfig::Clean { .. } => StageKind::Clean,
            StageConfig::Replace { .. } => StageKind::Replace,
            StageConfig::RemoveLines { .. } => StageKind::RemoveLines,
            StageConfig::RemoveLineNumbers { .. } => StageKind::RemoveLineNumbers,
            StageConfig::ButtonsToText => StageKind::ButtonsToText,
        }
    }

    /// Cheap shape checks done when a task is created or updated.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StageConfig::Watermark { text, .. } if text.trim().is_empty() => {
                Err("watermark text must not be empty".to_string())
            }
            StageConfig::Translate { target_lang } if target_lang.trim().is_empty() => {
                Err("translate target_lang must not be empty".to_string())
            }
            StageConfig::Rewrite { style } if style.trim().is_empty() => {
                Err("rewrite style must not be empty".to_string())
            }
            StageConfig::HeaderFooter {
                header: None,
                footer: None,
            } => Err("header_footer needs a header or a footer".to_string()),
            StageConfig::Replace { rules } if rules.iter().any(|r| r.from.is_empty()) => {
                Err("replace rule with empty 'from'".to_string())
            }
            StageConfig::RemoveLines { keywords } if keywords.iter().all(|k| k.trim().is_empty()) => {
                Err("remove_lines needs at least one keyword".to_string())
            }
            StageConfig::RemoveLineNumbers { lines } if lines.is_empty() || lines.contains(&0) => {
                Err("remove_line_numbers needs 1-based line numbers".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Stage kind, the key under which a capability is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Watermark,
    Translate,
    Rewrite,
    HeaderFooter,
    Clean,
    Replace,
    RemoveLines,
    RemoveLineNumbers,
    ButtonsToText,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageKind::Watermark => "watermark",
            StageKind::Translate => "translate",
            StageKind::Rewrite => "rewrite",
            StageKind::HeaderFooter => "header_footer",
            StageKind::Clean => "clean",
            StageKind::Replace => "replace",
            StageKind::RemoveLines => "remove_lines",
            StageKind::RemoveLineNumbers => "remove_line_numbers",
            StageKind::ButtonsToText => "buttons_to_text",
        };
        f.write_str(s)
    }
}

/// What happens when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Drop the failing stage's effect and continue with the pre-stage payload.
    #[default]
    SkipOnError,
    /// Do not forward the message.
    AbortOnError,
}

/// Per-task pipeline: filters, then stages in order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub on_error: FailurePolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<ContentFilter>,
    /// Hold each transformed message this long before sending it.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub forward_delay_ms: u64,
}

fn is_zero(ms: &u64) -> bool {
    *ms == 0
}

impl PipelineConfig {
    pub fn new(stages: Vec<StageConfig>) -> Self {
        Self {
            stages,
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, on_error: FailurePolicy) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_filter(mut self, filter: ContentFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_forward_delay(mut self, delay: Duration) -> Self {
        self.forward_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn forward_delay(&self) -> Duration {
        Duration::from_millis(self.forward_delay_ms)
    }

    /// Distinct stage kinds in first-use order.
    pub fn kinds(&self) -> Vec<StageKind> {
        let mut kinds = Vec::new();
        for stage in &self.stages {
            let kind = stage.kind();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    pub fn validate(&self) -> Result<(), String> {
        for (index, stage) in self.stages.iter().enumerate() {
            stage
                .validate()
                .map_err(|e| format!("stage #{index} ({}): {e}", stage.kind()))?;
        }
        for filter in &self.filters {
            filter.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::filter::FilterMode;

    #[test]
    fn stage_config_is_tagged() {
        let s = StageConfig::Translate {
            target_lang: "es".into(),
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["stage"], "translate");
        assert_eq!(v["target_lang"], "es");
    }

    #[test]
    fn pipeline_json_uses_defaults() {
        let p: PipelineConfig = serde_json::from_str(
            r#"{"stages":[{"stage":"watermark","text":"@me"},{"stage":"clean"}]}"#,
        )
        .unwrap();
        assert_eq!(p.on_error, FailurePolicy::SkipOnError);
        assert_eq!(
            p.stages[0],
            StageConfig::Watermark {
                text: "@me".into(),
                position: WatermarkPosition::BottomRight
            }
        );
        assert!(matches!(
            p.stages[1],
            StageConfig::Clean {
                remove_usernames: true,
                remove_urls: true,
                ..
            }
        ));
    }

    #[test]
    fn kinds_keep_first_use_order() {
        let p = PipelineConfig::new(vec![
            StageConfig::Translate {
                target_lang: "de".into(),
            },
            StageConfig::Watermark {
                text: "x".into(),
                position: WatermarkPosition::Center,
            },
            StageConfig::Translate {
                target_lang: "fr".into(),
            },
        ]);
        assert_eq!(p.kinds(), vec![StageKind::Translate, StageKind::Watermark]);
    }

    #[test]
    fn validate_names_the_bad_stage() {
        let p = PipelineConfig::new(vec![
            StageConfig::Rewrite {
                style: "formal".into(),
            },
            StageConfig::Translate {
                target_lang: " ".into(),
            },
        ]);
        let err = p.validate().unwrap_err();
        assert!(err.contains("stage #1 (translate)"), "{err}");
    }

    #[test]
    fn line_removal_stages_are_validated() {
        assert!(StageConfig::RemoveLines { keywords: vec![" ".into()] }.validate().is_err());
        assert!(StageConfig::RemoveLineNumbers { lines: vec![0, 2] }.validate().is_err());
        assert!(StageConfig::RemoveLineNumbers { lines: vec![1, 3] }.validate().is_ok());
    }

    #[test]
    fn forward_delay_defaults_to_zero_and_is_omitted() {
        let p: PipelineConfig =
            serde_json::from_str(r#"{"stages":[{"stage":"buttons_to_text"}]}"#).unwrap();
        assert_eq!(p.forward_delay(), Duration::ZERO);
        assert_eq!(p.stages, vec![StageConfig::ButtonsToText]);
        assert!(!serde_json::to_string(&p).unwrap().contains("forward_delay_ms"));

        let delayed = p.with_forward_delay(Duration::from_secs(2));
        let v = serde_json::to_value(&delayed).unwrap();
        assert_eq!(v["forward_delay_ms"], 2000);
    }

    #[test]
    fn validate_checks_filters() {
        let p = PipelineConfig::default().with_filter(ContentFilter::Regex {
            pattern: "(".into(),
            mode: FilterMode::Block,
        });
        assert!(p.validate().is_err());
    }
}
