use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One remembered fact about the user, ready to drop into a prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryFragment {
    pub text: String,
}

/// Long-term recall over past conversations. Always best-effort: callers
/// treat an empty result and a failure the same way.
#[async_trait]
pub trait MemoryRecall: Send + Sync {
    async fn query(&self, room_id: &str, text: &str, top_k: usize) -> Result<Vec<MemoryFragment>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    room_id: &'a str,
    text: &'a str,
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<MemoryHit>,
}

#[derive(Debug, Deserialize)]
struct MemoryHit {
    memory: String,
}

/// Client for the external memory service.
#[derive(Clone)]
pub struct MemoryServiceClient {
    api_url: String,
    client: reqwest::Client,
}

impl MemoryServiceClient {
    pub fn new(api_url: String) -> Self {
        Self {
            api_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MemoryRecall for MemoryServiceClient {
    async fn query(&self, room_id: &str, text: &str, top_k: usize) -> Result<Vec<MemoryFragment>> {
        let url = format!("{}/query", self.api_url);
        let request = QueryRequest {
            room_id,
            text,
            top_k,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send memory query")?;

        if !response.status().is_success() {
            anyhow::bail!("Memory service returned error {}", response.status());
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .context("Failed to parse memory response")?;

        Ok(parsed
            .results
            .into_iter()
            .map(|hit| MemoryFragment { text: hit.memory })
            .collect())
    }
}

/// Query memory under a wall-clock budget. Timeouts and failures degrade to
/// no memories; the reply must not wait on recall.
pub async fn recall_best_effort(
    backend: &dyn MemoryRecall,
    room_id: &str,
    text: &str,
    top_k: usize,
    budget: Duration,
) -> Vec<MemoryFragment> {
    match tokio::time::timeout(budget, backend.query(room_id, text, top_k)).await {
        Ok(Ok(fragments)) => fragments,
        Ok(Err(err)) => {
            tracing::debug!("Memory recall failed, continuing without it: {}", err);
            Vec::new()
        }
        Err(_) => {
            tracing::debug!(
                "Memory recall exceeded its {}ms budget, continuing without it",
                budget.as_millis()
            );
            Vec::new()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recall_returns_at_most_top_k_fragments() {
        let backend = testing::StaticRecall {
            fragments: vec![
                "hates monday standups".to_string(),
                "sister studies in pune".to_string(),
                "training for a 10k".to_string(),
            ],
        };
        let fragments =
            recall_best_effort(&backend, "room-1", "hows training", 2, Duration::from_secs(2))
                .await;
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].text, "hates monday standups");
    }

    #[tokio::test]
    async fn recall_failures_degrade_to_no_memories() {
        let fragments = recall_best_effort(
            &testing::BrokenRecall,
            "room-1",
            "anything",
            5,
            Duration::from_secs(2),
        )
        .await;
        assert!(fragments.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_recall_is_cut_off_at_the_budget() {
        let fragments = recall_best_effort(
            &testing::NeverRecall,
            "room-1",
            "anything",
            5,
            Duration::from_secs(2),
        )
        .await;
        assert!(fragments.is_empty());
    }
}
