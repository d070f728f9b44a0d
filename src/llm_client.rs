use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

/// One turn of chat history in the wire format the completion API expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn companion(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Produces the companion's reply as a stream of text chunks. The channel
/// closing marks the end of the stream; an `Err` item means the transport
/// dropped mid-reply and whatever arrived before it is all there is.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn stream_reply(
        &self,
        system_prompt: &str,
        history: Vec<ChatTurn>,
    ) -> Result<flume::Receiver<Result<String>>>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatTurn>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

enum SseLine {
    Chunk(String),
    Done,
    Skip,
}

/// Reassembles server-sent-event lines from raw network chunks. Chunk
/// boundaries do not respect line boundaries, so partial lines wait in the
/// buffer for the next read.
struct SseLineFeed {
    buffer: String,
}

impl SseLineFeed {
    fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim().to_string();
            self.buffer.drain(..=pos);
            events.push(parse_sse_line(&line));
        }
        events
    }
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamResponse>(data) {
        Ok(parsed) => {
            let content = parsed
                .choices
                .first()
                .and_then(|c| c.delta.content.clone())
                .unwrap_or_default();
            if content.is_empty() {
                SseLine::Skip
            } else {
                SseLine::Chunk(content)
            }
        }
        Err(err) => {
            // One bad chunk is not worth killing the whole reply over
            tracing::debug!("Skipping malformed stream chunk: {}", err);
            SseLine::Skip
        }
    }
}

/// Streaming client for an OpenAI-compatible chat completion endpoint.
#[derive(Clone)]
pub struct GenerationClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl GenerationClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl GenerationBackend for GenerationClient {
    async fn stream_reply(
        &self,
        system_prompt: &str,
        history: Vec<ChatTurn>,
    ) -> Result<flume::Receiver<Result<String>>> {
        let url = format!("{}/chat/completions", self.api_url);

        let mut messages = vec![ChatTurn::system(system_prompt)];
        messages.extend(history);

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            temperature: Some(0.9),
            max_tokens: Some(500),
        };

        let mut req = self.client.post(&url).json(&request);

        // API key header only for hosted endpoints, local models skip auth
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let (tx, rx) = flume::unbounded();
        tokio::spawn(async move {
            let mut feed = SseLineFeed::new();
            let mut bytes = response.bytes_stream();
            'read: while let Some(item) = bytes.next().await {
                match item {
                    Ok(chunk) => {
                        for event in feed.push(&chunk) {
                            match event {
                                SseLine::Chunk(text) => {
                                    if tx.send_async(Ok(text)).await.is_err() {
                                        return;
                                    }
                                }
                                SseLine::Done => break 'read,
                                SseLine::Skip => {}
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send_async(Err(
                                anyhow::Error::new(err).context("LLM stream dropped mid-reply")
                            ))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Plays back pre-scripted replies, one script per call. An `Err` entry
    /// simulates the transport dropping at that point in the stream.
    pub struct ScriptedBackend {
        scripts: Mutex<VecDeque<Vec<Result<String, String>>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        pub fn new() -> Self {
            Self {
                scripts: Mutex::new(VecDeque::new()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn reply_with(self, chunks: &[&str]) -> Self {
            self.scripts
                .lock()
                .expect("scripts lock")
                .push_back(chunks.iter().map(|c| Ok(c.to_string())).collect());
            self
        }

        pub fn reply_then_drop(self, chunks: &[&str], error: &str) -> Self {
            let mut script: Vec<Result<String, String>> =
                chunks.iter().map(|c| Ok(c.to_string())).collect();
            script.push(Err(error.to_string()));
            self.scripts
                .lock()
                .expect("scripts lock")
                .push_back(script);
            self
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn stream_reply(
            &self,
            system_prompt: &str,
            _history: Vec<ChatTurn>,
        ) -> Result<flume::Receiver<Result<String>>> {
            self.prompts
                .lock()
                .expect("prompts lock")
                .push(system_prompt.to_string());

            let script = self
                .scripts
                .lock()
                .expect("scripts lock")
                .pop_front()
                .unwrap_or_default();

            let (tx, rx) = flume::unbounded();
            for item in script {
                let item = item.map_err(|e| anyhow::anyhow!(e));
                let _ = tx.send(item);
            }
            Ok(rx)
        }
    }
}
