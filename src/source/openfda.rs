//! OpenFDA drug label adapter.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::config::OpenFdaConfig;
use crate::error::{PipelineError, Result};
use crate::models::{normalize_drug_name, DrugFact};

use super::KnowledgeSource;

/// Label fields read from each record, in output order, with their section label.
const SECTIONS: &[(&str, &str)] = &[
    ("boxed_warning", "boxed_warning"),
    ("indications_and_usage", "indications"),
    ("contraindications", "contraindications"),
    ("warnings", "warnings"),
    ("warnings_and_cautions", "warnings"),
    ("adverse_reactions", "adverse_reactions"),
    ("drug_interactions", "drug_interactions"),
    ("dosage_and_administration", "dosage"),
    ("overdosage", "overdosage"),
];

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

pub struct OpenFdaClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_results: u32,
    max_section_chars: usize,
    timeout: Duration,
}

impl OpenFdaClient {
    pub fn new(config: &OpenFdaConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build OpenFDA HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            max_results: config.max_results,
            max_section_chars: config.max_section_chars,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl KnowledgeSource for OpenFdaClient {
    async fn fetch(&self, drug_name: &str) -> Result<Vec<DrugFact>> {
        let drug_name = normalize_drug_name(drug_name);
        if drug_name.is_empty() {
            return Err(PipelineError::InvalidInput("drug name must not be empty".to_string()));
        }
        tracing::info!("Fetching OpenFDA labels for: {}", drug_name);

        let limit = self.max_results.to_string();
        let mut params = vec![("search", drug_name.as_str()), ("limit", limit.as_str())];
        if let Some(ref key) = self.api_key {
            params.push(("api_key", key.as_str()));
        }

        let response = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::UpstreamTimeout(self.timeout)
                } else {
                    PipelineError::UpstreamUnavailable(format!("OpenFDA request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::warn!("No OpenFDA record for: {}", drug_name);
            return Ok(Vec::new());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(PipelineError::UpstreamRateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "OpenFDA returned status {}",
                status
            )));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::UpstreamTimeout(self.timeout)
            } else {
                PipelineError::UpstreamUnavailable(format!("failed to read OpenFDA body: {}", e))
            }
        })?;
        let json: Value = serde_json::from_str(&body)
            .map_err(|e| PipelineError::MalformedUpstreamData(format!("invalid JSON: {}", e)))?;

        let facts = normalize_labels(&drug_name, &json, self.max_section_chars)?;
        tracing::info!("OpenFDA returned {} facts for: {}", facts.len(), drug_name);
        Ok(facts)
    }
}

/// Turns an OpenFDA label response body into ordered facts.
///
/// `max_section_chars == 0` leaves sections uncapped.
pub fn normalize_labels(drug_name: &str, body: &Value, max_section_chars: usize) -> Result<Vec<DrugFact>> {
    let results = match body.get("results") {
        Some(Value::Array(results)) => results,
        Some(_) => {
            return Err(PipelineError::MalformedUpstreamData(
                "`results` is not an array".to_string(),
            ))
        }
        None => {
            return Err(PipelineError::MalformedUpstreamData(
                "missing `results`".to_string(),
            ))
        }
    };

    let mut facts = Vec::new();
    for (i, record) in results.iter().enumerate() {
        let record = record.as_object().ok_or_else(|| {
            PipelineError::MalformedUpstreamData(format!("result {} is not an object", i))
        })?;

        for (field, label) in SECTIONS {
            let Some(value) = record.get(*field) else {
                continue;
            };
            let text = section_text(field, value)?;
            let text = cap_chars(&text, max_section_chars);
            if !text.is_empty() {
                facts.push(DrugFact::new(drug_name, *label, text));
            }
        }
    }
    Ok(facts)
}

fn section_text(field: &str, value: &Value) -> Result<String> {
    let paragraphs: Vec<String> = match value {
        Value::Null => Vec::new(),
        Value::String(s) => vec![collapse_whitespace(s)],
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(collapse_whitespace(s)),
                _ => Err(PipelineError::MalformedUpstreamData(format!(
                    "`{}` contains a non-string entry",
                    field
                ))),
            })
            .collect::<Result<_>>()?,
        _ => {
            return Err(PipelineError::MalformedUpstreamData(format!(
                "`{}` has unexpected type",
                field
            )))
        }
    };

    Ok(paragraphs
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n"))
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn cap_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect::<String>().trim_end().to_string()
}
