use anyhow::{anyhow, Context};
use serde_json::json;

use crate::error::AppResult;
use crate::run_config::cfg;
use crate::HttpClient;

use super::{ChatApiResponseOrError, ClassifyClient};

/// Thin client for the chat-completions endpoint. One POST per batch;
/// rate-limit admission happens before this is called.
#[derive(Clone)]
pub struct MistralClient {
    http_client: HttpClient,
}

impl MistralClient {
    pub fn new(http_client: HttpClient) -> Self {
        Self { http_client }
    }
}

impl ClassifyClient for MistralClient {
    async fn complete(&self, system_prompt: String, user_content: String) -> AppResult<String> {
        let resp = self
            .http_client
            .post(&cfg.api.endpoint)
            .bearer_auth(&cfg.api.key)
            .json(&json!(
              {
                "model": &cfg.model.id,
                "temperature": cfg.model.temperature,
                "messages": [
                  {
                    "role": "system",
                    "content": system_prompt
                  },
                  {
                    "role": "user",
                    "content": user_content
                  }
                ],
                "response_format": {
                    "type": "json_object",
                }
              }
            ))
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        let parsed = serde_json::from_value::<ChatApiResponseOrError>(resp.clone())
            .context(format!("Could not parse chat response: {}", resp))?;

        let parsed = match parsed {
            ChatApiResponseOrError::Error(error) => {
                return Err(anyhow!("Chat API error: {}", error.message).into());
            }
            ChatApiResponseOrError::Response(parsed) => parsed,
        };

        let choice = parsed.choices.first().context("No choices in response")?;
        Ok(choice.message.content.clone())
    }
}
