use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;

use crate::error::{PipelineError, Result};
use crate::models::{Answer, ChatRequest, ChatResponse, Message, ScoredChunk, SourceRef};

use super::retry::RetryPolicy;

/// Fixed reply used when the context cannot support an answer.
pub const INSUFFICIENT_INFORMATION: &str =
    "I don't have enough information to answer that question.";

const PREVIEW_CHARS: usize = 150;

/// Text-in, text-out language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

fn generation_error(message: impl Into<String>, transient: bool) -> PipelineError {
    PipelineError::Generation {
        message: message.into(),
        transient,
    }
}

/// OpenAI-compatible `/chat/completions` client (Groq, OpenAI, LiteLLM).
pub struct ChatCompletionModel {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    timeout: Duration,
}

impl ChatCompletionModel {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        temperature: f32,
        max_tokens: Option<u32>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build LLM HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model,
            temperature,
            max_tokens,
            timeout,
        })
    }

    pub async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self.client.post(&url).json(request);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::UpstreamTimeout(self.timeout)
            } else {
                generation_error(format!("LLM request failed: {}", e), true)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            let transient = status.as_u16() == 429 || status.is_server_error();
            return Err(generation_error(
                format!("LLM request failed: {} - {}", status, error_text),
                transient,
            ));
        }

        response
            .json()
            .await
            .map_err(|e| generation_error(format!("invalid LLM response: {}", e), false))
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: Some(self.temperature),
            max_tokens: self.max_tokens,
        };
        let response = self.chat_completion(&request).await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| generation_error("LLM returned no choices", false))
    }
}

/// Prompt text plus the chunks that made it into the context block.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub prompt: String,
    pub included: Vec<ScoredChunk>,
}

/// Builds the prompt with a context block of at most `max_context_chars`.
///
/// Chunks are taken in rank order while they fit. The first chunk is always
/// included, cut down to the budget if needed.
pub fn assemble_prompt(question: &str, results: &[ScoredChunk], max_context_chars: usize) -> AssembledPrompt {
    let mut context = String::new();
    let mut used = 0;
    let mut included = Vec::new();

    for (i, chunk) in results.iter().enumerate() {
        let len = chunk.text.chars().count();
        let text = if used + len <= max_context_chars {
            chunk.text.clone()
        } else if i == 0 {
            chunk.text.chars().take(max_context_chars).collect()
        } else {
            break;
        };
        used += text.chars().count();

        context.push_str(&format!(
            "[{}] {} / {} #{}\n{}\n\n",
            i + 1,
            chunk.metadata.drug_name,
            chunk.metadata.section,
            chunk.metadata.index,
            text
        ));
        included.push(chunk.clone());
    }

    let prompt = format!(
        "You are a drug-safety information assistant. Answer the question using ONLY \
         the context below, which comes from official drug labels. If the context does \
         not contain the answer, reply exactly: \"{}\"\n\n\
         Context:\n{}Question: {}\nAnswer:",
        INSUFFICIENT_INFORMATION,
        context,
        question.trim()
    );

    AssembledPrompt { prompt, included }
}

/// Short excerpt cut at a word boundary.
pub fn content_preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        return content.to_string();
    }
    let head: String = content.chars().take(PREVIEW_CHARS).collect();
    let cut = match head.rfind(' ') {
        Some(pos) if pos > 0 => &head[..pos],
        _ => head.as_str(),
    };
    format!("{}...", cut.trim_end())
}

/// Turns retrieved chunks into an answer through the language model.
pub struct AnswerGenerator {
    llm: Arc<dyn LanguageModel>,
    max_context_chars: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl AnswerGenerator {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        max_context_chars: usize,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            max_context_chars,
            retry,
            timeout,
        }
    }

    /// With no retrieved chunks the fixed insufficient-information answer is
    /// returned and the model is not called.
    pub async fn generate(&self, question: &str, results: &[ScoredChunk]) -> Result<Answer> {
        if results.is_empty() {
            tracing::info!("No context retrieved, returning insufficient-information answer");
            return Ok(Answer {
                text: INSUFFICIENT_INFORMATION.to_string(),
                sources: Vec::new(),
                grounded: false,
            });
        }

        let assembled = assemble_prompt(question, results, self.max_context_chars);
        let llm = &self.llm;
        let prompt = assembled.prompt.as_str();
        let text = self
            .retry
            .run("answer generation", self.timeout, || async move {
                llm.generate(prompt).await
            })
            .await?;

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(generation_error("language model returned an empty answer", false));
        }

        let sources = assembled
            .included
            .iter()
            .map(|chunk| SourceRef {
                drug_name: chunk.metadata.drug_name.clone(),
                section: chunk.metadata.section.clone(),
                index: chunk.metadata.index,
                score: chunk.score,
                content_preview: content_preview(&chunk.text),
            })
            .collect();

        Ok(Answer {
            text,
            sources,
            grounded: true,
        })
    }
}
