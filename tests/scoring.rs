//! Scoring Integration Tests
//!
//! Tests that every judge reply, well-formed or not, yields a bounded score.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use chriseon::adapters::{Generation, GenerationRequest, ProviderAdapter};
use chriseon::core::QualityScorer;
use chriseon::domain::ScoreMethod;

enum JudgeReply {
    Text(&'static str),
    Fail,
    Hang,
}

struct FakeJudge(JudgeReply);

#[async_trait]
impl ProviderAdapter for FakeJudge {
    fn name(&self) -> &str {
        "xai"
    }

    async fn generate(&self, _request: GenerationRequest) -> Result<Generation> {
        match &self.0 {
            JudgeReply::Text(text) => Ok(Generation::text(*text)),
            JudgeReply::Fail => anyhow::bail!("judge unavailable"),
            JudgeReply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Generation::text("{}"))
            }
        }
    }
}

fn scorer(reply: JudgeReply) -> QualityScorer {
    QualityScorer::with_judge(Arc::new(FakeJudge(reply)), "sk-judge", "grok-3-mini")
        .with_timeout(Duration::from_millis(100))
}

const OUTPUT: &str = "Ownership means each value has a single owner that frees it.";

#[tokio::test]
async fn test_totals_stay_in_unit_interval() {
    let replies = [
        r#"{"alignment": 0.8, "completeness": 0.7, "quality": 0.9, "accuracy": 0.8}"#,
        r#"{"alignment": 7, "completeness": 3, "quality": 12, "accuracy": 99}"#,
        r#"{"alignment": -4, "completeness": -1, "quality": -0.5, "accuracy": -2}"#,
        r#"{"alignment": "0.6", "quality": null}"#,
        "Sure! ```json\n{\"alignment\": 1, \"completeness\": 1, \"quality\": 1, \"accuracy\": 1, \"critique\": \"uses {braces}\"}\n```",
        r#"{"alignment": [1], "completeness": 1, "quality": 1, "accuracy": 1}"#,
        "no json at all",
        "{ unbalanced",
        "",
    ];

    for reply in replies {
        let result = scorer(JudgeReply::Text(reply)).score("Be precise.", OUTPUT).await;
        assert!(
            (0.0..=1.0).contains(&result.total),
            "total {} out of range for reply {:?}",
            result.total,
            reply
        );
    }
}

#[tokio::test]
async fn test_judge_scores_are_weighted() {
    let result = scorer(JudgeReply::Text(
        r#"{"alignment": 1.0, "completeness": 0.0, "quality": 0.5, "accuracy": 0.0, "critique": "ok"}"#,
    ))
    .score("Be precise.", OUTPUT)
    .await;

    assert_eq!(result.method, ScoreMethod::Judge);
    assert!((result.total - 0.45).abs() < 1e-9);
    assert_eq!(result.notes, vec!["ok".to_string()]);
}

#[tokio::test]
async fn test_out_of_range_dimensions_are_clamped() {
    let result = scorer(JudgeReply::Text(
        r#"{"alignment": 7, "completeness": 3, "quality": 12, "accuracy": 99}"#,
    ))
    .score("Be precise.", OUTPUT)
    .await;

    assert_eq!(result.method, ScoreMethod::Judge);
    assert!((result.total - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_unusable_judge_falls_back_to_heuristic() {
    for reply in [
        JudgeReply::Text("I refuse to answer in JSON."),
        JudgeReply::Fail,
        JudgeReply::Hang,
    ] {
        let result = scorer(reply).score("Be precise.", OUTPUT).await;
        assert_eq!(result.method, ScoreMethod::Heuristic);
        assert!((0.0..=1.0).contains(&result.total));
        assert!(result
            .notes
            .iter()
            .any(|n| n.contains("heuristic")));
    }
}

#[tokio::test]
async fn test_empty_output_scores_zero() {
    let result = scorer(JudgeReply::Text("{}")).score("Be precise.", "   \n").await;
    assert_eq!(result.method, ScoreMethod::Empty);
    assert_eq!(result.total, 0.0);
}

#[tokio::test]
async fn test_heuristic_only_scorer() {
    let scorer = QualityScorer::heuristic_only();
    assert!(!scorer.has_judge());

    let result = scorer.score("Be precise.", OUTPUT).await;
    assert_eq!(result.method, ScoreMethod::Heuristic);
    assert_eq!(result.words, OUTPUT.split_whitespace().count());
}
