//! Cursor-paginated transaction feed

use crate::{
    config::EngineConfig,
    store::{LedgerStore, LogQuery},
    types::{AccountId, Transaction, TransactionId},
    Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Feed request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedRequest {
    /// Owning accounts; empty for every account
    pub accounts: Vec<AccountId>,
    /// Return rows strictly after this identifier
    pub cursor: Option<TransactionId>,
    /// Page size; zero or negative selects the default
    pub limit: i64,
}

/// One page of the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Rows in ascending identifier order
    pub transactions: Vec<Transaction>,
    /// Pass back as `cursor` for the next page; absent on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<TransactionId>,
}

/// Pages through the transaction log
#[derive(Debug, Clone)]
pub struct TransactionFeed {
    store: Arc<dyn LedgerStore>,
    default_limit: u32,
    max_limit: u32,
}

impl TransactionFeed {
    /// Create a feed with the engine's paging limits
    pub fn new(store: Arc<dyn LedgerStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            default_limit: config.default_page_limit,
            max_limit: config.max_page_limit,
        }
    }

    /// Effective page size for a requested limit
    pub fn effective_limit(&self, requested: i64) -> u32 {
        if requested <= 0 {
            self.default_limit
        } else {
            u32::try_from(requested)
                .unwrap_or(u32::MAX)
                .min(self.max_limit)
        }
    }

    /// Fetch one page
    pub async fn list(&self, request: &FeedRequest) -> Result<Page> {
        let limit = self.effective_limit(request.limit);

        // One extra row tells us whether another page exists
        let mut transactions = self
            .store
            .list_transactions(&LogQuery {
                accounts: request.accounts.clone(),
                after: request.cursor,
                fetch: limit.saturating_add(1),
            })
            .await?;

        let next_cursor = if transactions.len() > limit as usize {
            transactions.truncate(limit as usize);
            transactions.last().map(|row| row.id)
        } else {
            None
        };

        Ok(Page {
            transactions,
            next_cursor,
        })
    }
}
