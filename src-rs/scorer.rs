//! Keyword relevance scoring of text regions via an external vision model.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::RgbaImage;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScoreError {
    /// Network or HTTP-level failure: timeout, connection refused, non-2xx
    /// status. The candidate is skipped; the run continues.
    #[error("scoring service unavailable: {0}")]
    Unavailable(String),
    /// The service answered but the body carried no interpretable verdict.
    #[error("malformed scoring response: {0}")]
    MalformedResponse(String),
}

/// What to look for in a text region. Construction rejects an empty keyword
/// list so a misconfigured query can never gate a click on nothing.
#[derive(Debug, Clone, Serialize)]
pub struct KeywordQuery {
    pub keywords: Vec<String>,
    pub min_confidence: f64,
}

impl KeywordQuery {
    pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.8;

    pub fn new(keywords: Vec<String>, min_confidence: f64) -> Result<Self> {
        if keywords.iter().all(|k| k.trim().is_empty()) {
            bail!("keyword query must contain at least one non-empty keyword");
        }
        Ok(Self {
            keywords,
            min_confidence,
        })
    }
}

/// The model's judgement of one text region against one query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreVerdict {
    pub matched: bool,
    pub confidence: f64,
    pub keywords_found: Vec<String>,
}

impl ScoreVerdict {
    /// A verdict only accepts when the model both matched and cleared the
    /// query's confidence floor with at least one keyword reported present.
    pub fn accepts(&self, query: &KeywordQuery) -> bool {
        self.matched && self.confidence >= query.min_confidence && !self.keywords_found.is_empty()
    }
}

/// Judges whether a text-region image is relevant to a keyword query. The
/// production implementation calls a vision model over HTTP; tests script
/// verdicts directly.
pub trait KeywordScorer {
    fn score(&self, region: &RgbaImage, query: &KeywordQuery) -> Result<ScoreVerdict, ScoreError>;
}

/// OpenAI-style chat-completions vision scorer. One blocking request per
/// region with an explicit client timeout; the orchestrator treats every
/// failure as a non-match for that candidate.
pub struct HttpVisionScorer {
    endpoint: String,
    model: String,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl HttpVisionScorer {
    pub fn new(endpoint: String, model: String, api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            endpoint,
            model,
            api_key,
            client,
        })
    }

    /// Reads the API key from `key_var` (`OPENAI_API_KEY` by convention).
    pub fn from_env(
        endpoint: String,
        model: String,
        key_var: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = std::env::var(key_var)
            .with_context(|| format!("environment variable {key_var} is not set"))?;
        Self::new(endpoint, model, api_key, timeout)
    }

    fn request_body(&self, png_b64: &str, query: &KeywordQuery) -> serde_json::Value {
        let keywords = query.keywords.join(", ");
        let instruction = format!(
            "You are reading a cropped chat-message area from a game screen. \
             Judge whether the visible text mentions any of these keywords or \
             close synonyms: {keywords}. Respond ONLY with JSON: \
             {{\"matched\": true|false, \"confidence\": <0.0-1.0>, \
             \"keywords_found\": [\"...\"]}}"
        );
        json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": instruction },
                        {
                            "type": "image_url",
                            "image_url": {
                                "url": format!("data:image/png;base64,{png_b64}")
                            }
                        }
                    ]
                }
            ],
            "temperature": 0.1,
            "max_tokens": 200
        })
    }
}

impl KeywordScorer for HttpVisionScorer {
    fn score(&self, region: &RgbaImage, query: &KeywordQuery) -> Result<ScoreVerdict, ScoreError> {
        let mut png = Vec::new();
        region
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|err| ScoreError::MalformedResponse(format!("png encode failed: {err}")))?;
        let png_b64 = BASE64.encode(&png);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(&png_b64, query))
            .send()
            .map_err(|err| ScoreError::Unavailable(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ScoreError::Unavailable(format!("HTTP {status}: {body}")));
        }

        let body: serde_json::Value = response
            .json()
            .map_err(|err| ScoreError::MalformedResponse(err.to_string()))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ScoreError::MalformedResponse("response carries no message content".to_string())
            })?;
        parse_verdict(content)
    }
}

/// Pulls a verdict out of the model's reply. Models wrap JSON in prose or
/// code fences often enough that the first `{`..last `}` span is taken as the
/// payload.
pub fn parse_verdict(content: &str) -> Result<ScoreVerdict, ScoreError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(ScoreError::MalformedResponse(format!(
            "no JSON object in reply: {content:.80}"
        )));
    };
    if end < start {
        return Err(ScoreError::MalformedResponse(
            "unbalanced JSON object in reply".to_string(),
        ));
    }
    let parsed: serde_json::Value = serde_json::from_str(&content[start..=end])
        .map_err(|err| ScoreError::MalformedResponse(err.to_string()))?;

    let Some(matched) = parsed["matched"].as_bool() else {
        return Err(ScoreError::MalformedResponse(
            "verdict lacks a boolean `matched`".to_string(),
        ));
    };
    let confidence = parsed["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
    let keywords_found = parsed["keywords_found"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(ScoreVerdict {
        matched,
        confidence,
        keywords_found,
    })
}
