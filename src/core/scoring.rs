//! Post-hoc quality scoring of pass outputs.
//!
//! A low-cost judge model scores four dimensions. Any judge failure (no key,
//! call error, unparseable reply) falls back to a word-count heuristic, so
//! scoring never fails.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::adapters::{GenerationRequest, ProviderAdapter};
use crate::domain::{clamp01, ScoreDimensions, ScoreMethod, ScoreResult};

use super::executor::DEFAULT_PROVIDER_TIMEOUT;

const JUDGE_INSTRUCTIONS: &str = "You are a scoring system that outputs JSON only.";
const HEURISTIC_NOTE: &str = "Scored via heuristic (judge unavailable)";

/// Word count at which heuristic completeness saturates
const COMPLETENESS_WORDS: f64 = 150.0;

struct Judge {
    adapter: Arc<dyn ProviderAdapter>,
    api_key: String,
    model: String,
}

pub struct QualityScorer {
    judge: Option<Judge>,
    timeout: Duration,
}

impl QualityScorer {
    /// Scorer that always uses the heuristic
    pub fn heuristic_only() -> Self {
        Self {
            judge: None,
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_judge(
        adapter: Arc<dyn ProviderAdapter>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            judge: Some(Judge {
                adapter,
                api_key: api_key.into(),
                model: model.into(),
            }),
            timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_judge(&self) -> bool {
        self.judge.is_some()
    }

    pub async fn score(&self, instructions: &str, output: &str) -> ScoreResult {
        let text = output.trim();
        if text.is_empty() {
            return ScoreResult::empty();
        }

        let Some(judge) = &self.judge else {
            return heuristic_score(instructions, text);
        };

        match self.ask_judge(judge, instructions, text).await {
            Ok(reply) => match parse_judge_output(&reply, word_count(text)) {
                Some(result) => {
                    debug!(total = result.total, "Judge score parsed");
                    result
                }
                None => {
                    warn!("Judge reply unparseable, using heuristic");
                    heuristic_score(instructions, text)
                }
            },
            Err(e) => {
                warn!(error = %e, "Judge call failed, using heuristic");
                heuristic_score(instructions, text)
            }
        }
    }

    async fn ask_judge(&self, judge: &Judge, instructions: &str, text: &str) -> anyhow::Result<String> {
        let request = GenerationRequest::new(
            judge.model.clone(),
            JUDGE_INSTRUCTIONS,
            judge_prompt(instructions, text),
        )
        .with_api_key(judge.api_key.clone());

        let generation = tokio::time::timeout(self.timeout, judge.adapter.generate(request))
            .await
            .map_err(|_| anyhow::anyhow!("judge timed out after {}s", self.timeout.as_secs()))??;
        Ok(generation.text)
    }
}

fn judge_prompt(instructions: &str, text: &str) -> String {
    format!(
        "You are an impartial expert evaluator.

Analyze the following AI response against the given instructions.

INSTRUCTIONS:
{instructions}

AI RESPONSE:
{text}

Score it on these 4 dimensions (0.0 to 1.0):
1. alignment (Did it follow instructions?)
2. completeness (Is it thorough enough?)
3. quality (Is the writing clear and professional?)
4. accuracy (Does it seem logically sound/factual?)

Return STRICT JSON only:
{{
  \"alignment\": 0.8,
  \"completeness\": 0.7,
  \"quality\": 0.9,
  \"accuracy\": 0.8,
  \"critique\": \"Short explanation of the score.\"
}}
"
    )
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Word-count based fallback. Accuracy is left undefined; the total is fixed.
pub fn heuristic_score(instructions: &str, text: &str) -> ScoreResult {
    let words = word_count(text);
    let mut alignment = 0.5;
    if instructions.to_lowercase().contains("brief") && words < 100 {
        alignment += 0.3;
    }

    ScoreResult {
        method: ScoreMethod::Heuristic,
        dimensions: Some(ScoreDimensions {
            alignment,
            completeness: clamp01(words as f64 / COMPLETENESS_WORDS),
            quality: 0.5,
            accuracy: None,
        }),
        notes: vec![HEURISTIC_NOTE.to_string()],
        words,
        total: 0.5,
    }
}

/// Parse a judge reply. Missing dimensions count as zero and every value is
/// clamped into [0, 1]; a non-numeric value rejects the whole reply.
pub fn parse_judge_output(reply: &str, words: usize) -> Option<ScoreResult> {
    let fragment = first_balanced_object(reply)?;
    let parsed: Value = serde_json::from_str(fragment).ok()?;
    let object = parsed.as_object()?;

    let dimension = |key: &str| -> Option<f64> {
        let value = match object.get(key) {
            None | Some(Value::Null) => 0.0,
            Some(Value::Number(n)) => n.as_f64()?,
            Some(Value::String(s)) => s.trim().parse::<f64>().ok()?,
            Some(_) => return None,
        };
        value.is_finite().then(|| clamp01(value))
    };

    let dimensions = ScoreDimensions {
        alignment: dimension("alignment")?,
        completeness: dimension("completeness")?,
        quality: dimension("quality")?,
        accuracy: Some(dimension("accuracy")?),
    };

    let notes = object
        .get("critique")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| vec![c.to_string()])
        .unwrap_or_default();

    Some(ScoreResult {
        method: ScoreMethod::Judge,
        total: dimensions.weighted_total(),
        dimensions: Some(dimensions),
        notes,
        words,
    })
}

/// First `{...}` with balanced braces, ignoring braces inside JSON strings
pub fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_balanced_object() {
        assert_eq!(
            first_balanced_object("Sure! {\"a\": {\"b\": 1}} trailing {\"c\": 2}"),
            Some("{\"a\": {\"b\": 1}}")
        );
        assert_eq!(
            first_balanced_object(r#"{"critique": "uses } and \" inside"} x"#),
            Some(r#"{"critique": "uses } and \" inside"}"#)
        );
        assert_eq!(first_balanced_object("{ never closed"), None);
        assert_eq!(first_balanced_object("no json"), None);
    }

    #[test]
    fn test_parse_clamps_and_defaults() {
        let result = parse_judge_output(
            "```json\n{\"alignment\": 1.7, \"quality\": \"0.5\", \"accuracy\": -2, \"critique\": \"ok\"}\n```",
            42,
        )
        .unwrap();
        let dims = result.dimensions.unwrap();
        assert_eq!(dims.alignment, 1.0);
        assert_eq!(dims.completeness, 0.0);
        assert_eq!(dims.quality, 0.5);
        assert_eq!(dims.accuracy, Some(0.0));
        assert!((result.total - 0.45).abs() < 1e-9);
        assert_eq!(result.notes, vec!["ok"]);
        assert_eq!(result.words, 42);
        assert_eq!(result.method, ScoreMethod::Judge);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_judge_output("I refuse", 1).is_none());
        assert!(parse_judge_output("{\"alignment\": [1]}", 1).is_none());
        assert!(parse_judge_output("{\"alignment\": \"high\"}", 1).is_none());
        assert!(parse_judge_output("{alignment: 1}", 1).is_none());
    }

    #[test]
    fn test_heuristic() {
        let brief = heuristic_score("Keep it brief.", "one two three");
        let dims = brief.dimensions.unwrap();
        assert!((dims.alignment - 0.8).abs() < 1e-9);
        assert!((dims.completeness - 3.0 / 150.0).abs() < 1e-9);
        assert_eq!(dims.accuracy, None);
        assert_eq!(brief.total, 0.5);
        assert_eq!(brief.notes, vec![HEURISTIC_NOTE]);

        let long = "word ".repeat(200);
        let dims = heuristic_score("Be thorough", &long).dimensions.unwrap();
        assert_eq!(dims.alignment, 0.5);
        assert_eq!(dims.completeness, 1.0);
    }

    #[tokio::test]
    async fn test_empty_output_scores_zero() {
        let result = QualityScorer::heuristic_only().score("x", "   \n").await;
        assert_eq!(result.method, ScoreMethod::Empty);
        assert_eq!(result.total, 0.0);
    }
}
