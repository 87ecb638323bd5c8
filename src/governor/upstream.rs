//! The upstream generation service, consumed through a narrow trait.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::mode::QualityLevel;
use crate::batch::BatchId;
use crate::query::{NormalizedQuery, QueryId};

/// One upstream call covering a whole batch.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub batch_id: BatchId,
    /// Shared by every item; typically selects the system instruction.
    pub context_key: String,
    pub items: Vec<NormalizedQuery>,
    pub model: String,
    pub quality: QualityLevel,
    pub max_output_tokens: u64,
}

impl DispatchRequest {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Per-item result reported by the executor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub query_id: QueryId,
    pub content: Option<String>,
    /// Billed cost. Failed items may still carry a cost.
    pub cost: Decimal,
    pub model: String,
    pub error: Option<String>,
}

impl ItemOutcome {
    pub fn success(
        query_id: QueryId,
        content: impl Into<String>,
        model: impl Into<String>,
        cost: Decimal,
    ) -> Self {
        Self {
            query_id,
            content: Some(content.into()),
            cost,
            model: model.into(),
            error: None,
        }
    }

    pub fn failure(
        query_id: QueryId,
        model: impl Into<String>,
        error: impl Into<String>,
        cost: Decimal,
    ) -> Self {
        Self {
            query_id,
            content: None,
            cost,
            model: model.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.content.is_some()
    }
}

/// Whole-call failure. Every item of the batch fails with it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UpstreamError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("upstream rate limited{}", .retry_after.map(|d| format!(", retry after {}s", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

/// Executes a batch against the upstream service. No retries happen on this
/// side; a returned error fails every item in the batch.
#[async_trait]
pub trait UpstreamExecutor: Send + Sync {
    async fn invoke(&self, request: &DispatchRequest) -> Result<Vec<ItemOutcome>, UpstreamError>;
}
