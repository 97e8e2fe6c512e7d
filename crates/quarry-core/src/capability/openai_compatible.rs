//! OpenAI-compatible capability backend
//!
//! Speaks `/chat/completions` to any compatible endpoint. Each stage has
//! its own system prompt and expects a JSON object back; anything that
//! does not parse into the stage's reply type is reported as
//! [`CapabilityError::Malformed`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{
    CapabilityGateway, CapabilityReply, CapabilityRequest, PlanDraft, QueryEvaluation, StageName,
    TopicVerdict,
};
use crate::config::CapabilitySettings;
use crate::error::CapabilityError;
use crate::types::DataSourceDescriptor;

const TOPIC_PROMPT: &str = "You are a topic classifier for a data analysis assistant. \
    Decide whether the text stays within the allowed topics listed by the user. \
    Reply with JSON only: {\"allowed\": bool, \"reasoning\": string}.";

const PLAN_PROMPT: &str = "You are a query planner for SQLite tables. \
    Using only the tables and columns in the provided schema, describe which data answers the \
    question. Never write SQL. Reply with JSON only: {\"objective\": string, \"tables\": [string], \
    \"columns\": [string], \"operations\": [op]} where op is one of \
    {\"op\":\"project\",\"columns\":[..]}, {\"op\":\"aggregate\",\"kind\":\"avg|sum|count|min|max|median\",\"column\":string|null}, \
    {\"op\":\"group_by\",\"columns\":[..]}, {\"op\":\"filter\",\"column\":..,\"comparator\":\"eq|not_eq|gt|gte|lt|lte|like\",\"value\":..}, \
    {\"op\":\"order_by\",\"column\":..,\"descending\":bool}, {\"op\":\"limit\",\"count\":n}.";

const GENERATE_PROMPT: &str = "You write a single read-only SQLite SELECT statement for the given plan. \
    Quote identifiers with double quotes. Never modify data. \
    Reply with JSON only: {\"query\": string}.";

const EVALUATE_PROMPT: &str = "You check whether an executed query answers the user's question. \
    Reply with JSON only: {\"answers_question\": bool, \"confidence\": \"high|medium|low\", \
    \"summary\": string, \"next_action\": \"accept|retry_query|need_clarification\"}.";

const SOURCE_PROMPT: &str = "Extract the file or directory the user wants loaded and an optional \
    table name. Reply with JSON only: {\"location\": string, \"table_name\": string|null}.";

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleCapability {
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    headers: HashMap<String, String>,
    http_client: reqwest::Client,
}

impl OpenAiCompatibleCapability {
    pub fn new(api_key: Option<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: 1024,
            headers: HashMap::new(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Build from settings, reading the key from the configured variable
    pub fn from_settings(settings: &CapabilitySettings) -> Self {
        let api_key = std::env::var(&settings.api_key_env).ok().filter(|k| !k.is_empty());
        Self::new(api_key, settings.base_url.clone(), settings.model.clone())
            .with_temperature(settings.temperature)
            .with_max_tokens(settings.max_tokens)
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn complete(&self, system_prompt: &str, user_prompt: String) -> Result<String, CapabilityError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt,
                },
            ],
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            response_format: Some(ResponseFormat {
                kind: "json_object".to_string(),
            }),
        };

        let mut builder = self
            .http_client
            .post(self.endpoint())
            .header("Content-Type", "application/json");

        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|e| CapabilityError::Unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Unavailable(format!(
                "API error ({}): {}",
                status, error_text
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::Unavailable(format!("unreadable response: {}", e)))?;

        if let Some(tokens) = completion.usage.as_ref().and_then(|u| u.total_tokens) {
            tracing::debug!(model = %self.model, tokens, "Completion received");
        }

        Ok(completion
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

/// Parse a stage reply, tolerating a fenced code block around the JSON
fn parse_reply<T: DeserializeOwned>(stage: StageName, content: &str) -> Result<T, CapabilityError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body).map_err(|e| CapabilityError::Malformed {
        stage: stage.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct GeneratedQuery {
    query: String,
}

fn user_prompt(request: &CapabilityRequest) -> Result<String, CapabilityError> {
    let prompt = match request {
        CapabilityRequest::TopicCheck {
            direction,
            text,
            allowed_topics,
        } => format!(
            "Allowed topics:\n- {}\n\nDirection: {}\nText:\n{}",
            allowed_topics.join("\n- "),
            direction,
            text
        ),
        CapabilityRequest::Plan {
            question,
            schema,
            history,
            feedback,
        } => {
            let mut prompt = format!("Schema:\n{}\n\n", to_json(schema)?);
            if !history.is_empty() {
                prompt.push_str("Earlier in this conversation:\n");
                for turn in history {
                    prompt.push_str(&format!("User: {}\nAssistant: {}\n", turn.request, turn.response));
                }
                prompt.push('\n');
            }
            if let Some(feedback) = feedback {
                prompt.push_str(&format!("The previous plan was rejected: {}\n\n", feedback));
            }
            prompt.push_str(&format!("Question: {}", question));
            prompt
        }
        CapabilityRequest::Generate { plan, attempt, hint } => {
            let mut prompt = format!("Plan:\n{}\n\nAttempt: {}", to_json(plan)?, attempt);
            if let Some(hint) = hint {
                prompt.push_str(&format!("\nThe previous query failed: {}", hint));
            }
            prompt
        }
        CapabilityRequest::Evaluate {
            question,
            query,
            preview,
            total_rows,
        } => format!(
            "Question: {}\nQuery: {}\nRows returned: {}\nFirst rows:\n{}",
            question,
            query,
            total_rows,
            to_json(preview)?
        ),
        CapabilityRequest::ExtractSource { question } => format!("Request: {}", question),
    };
    Ok(prompt)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CapabilityError> {
    serde_json::to_string_pretty(value).map_err(|e| CapabilityError::Malformed {
        stage: "prompt".to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl CapabilityGateway for OpenAiCompatibleCapability {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, request: CapabilityRequest) -> Result<CapabilityReply, CapabilityError> {
        let stage = request.stage();
        let system_prompt = match stage {
            StageName::Guardrail => TOPIC_PROMPT,
            StageName::Planner => PLAN_PROMPT,
            StageName::Generator => GENERATE_PROMPT,
            StageName::Evaluator => EVALUATE_PROMPT,
            StageName::Loader => SOURCE_PROMPT,
        };

        let content = self.complete(system_prompt, user_prompt(&request)?).await?;

        let reply = match stage {
            StageName::Guardrail => CapabilityReply::Topic(parse_reply::<TopicVerdict>(stage, &content)?),
            StageName::Planner => CapabilityReply::Plan(parse_reply::<PlanDraft>(stage, &content)?),
            StageName::Generator => {
                CapabilityReply::Query(parse_reply::<GeneratedQuery>(stage, &content)?.query)
            }
            StageName::Evaluator => {
                CapabilityReply::Evaluation(parse_reply::<QueryEvaluation>(stage, &content)?)
            }
            StageName::Loader => {
                CapabilityReply::Source(parse_reply::<DataSourceDescriptor>(stage, &content)?)
            }
        };
        Ok(reply)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    total_tokens: Option<u32>,
}
