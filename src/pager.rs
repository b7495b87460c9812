//! Cursor over `messages.list` results.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::credentials::manager::AccessTokenProvider;
use crate::credentials::AuthError;
use crate::gmail::{ApiError, MailboxApi, MessageRef};

#[derive(Debug, Error)]
pub enum PagingError {
    #[error("no more pages")]
    NoMorePages,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Listing parameters, passed through to the remote unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub q: Option<String>,
    pub label_ids: Vec<String>,
    pub max_results: Option<u32>,
    pub include_spam_trash: bool,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gmail search expression, e.g. `from:alice is:unread`.
    pub fn query(mut self, q: impl Into<String>) -> Self {
        let q = q.into();
        self.q = (!q.trim().is_empty()).then_some(q);
        self
    }

    pub fn label(mut self, label_id: impl Into<String>) -> Self {
        self.label_ids.push(label_id.into());
        self
    }

    /// Page size hint.
    pub fn take(mut self, max_results: u32) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn include_spam_trash(mut self, include: bool) -> Self {
        self.include_spam_trash = include;
        self
    }

    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(q) = &self.q {
            params.push(("q", q.clone()));
        }
        for label in &self.label_ids {
            params.push(("labelIds", label.clone()));
        }
        if let Some(max) = self.max_results {
            params.push(("maxResults", max.to_string()));
        }
        if self.include_spam_trash {
            params.push(("includeSpamTrash", "true".to_string()));
        }
        params
    }
}

/// One page of message ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub items: Vec<MessageRef>,
    pub continuation_token: Option<String>,
    pub estimated_total: Option<u64>,
}

impl ListingPage {
    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|item| item.id.clone()).collect()
    }

    pub fn has_continuation(&self) -> bool {
        self.continuation_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }
}

/// Walks the listing for one identity. Each call takes `&mut self`, so a
/// single pager is never driven concurrently.
pub struct Pager {
    api: Arc<dyn MailboxApi>,
    tokens: Arc<dyn AccessTokenProvider>,
    query: Option<ListQuery>,
    continuation: Option<String>,
    estimated_total: Option<u64>,
}

impl Pager {
    pub fn new(api: Arc<dyn MailboxApi>, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            api,
            tokens,
            query: None,
            continuation: None,
            estimated_total: None,
        }
    }

    /// Starts a new listing, discarding any previous cursor.
    pub async fn first(&mut self, query: ListQuery) -> Result<ListingPage, PagingError> {
        self.query = Some(query);
        self.continuation = None;
        self.estimated_total = None;
        self.fetch(None).await
    }

    pub async fn next(&mut self) -> Result<ListingPage, PagingError> {
        let Some(token) = self.continuation.clone() else {
            return Err(PagingError::NoMorePages);
        };
        self.fetch(Some(token)).await
    }

    pub fn has_next(&self) -> bool {
        self.continuation.is_some()
    }

    /// `resultSizeEstimate` of the last page; approximate by nature.
    pub fn estimated_total(&self) -> Option<u64> {
        self.estimated_total
    }

    /// Starts a listing for `query` and drains every page into one id list.
    pub async fn collect_all_ids(&mut self, query: ListQuery) -> Result<Vec<String>, PagingError> {
        let mut ids = self.first(query).await?.ids();
        while self.has_next() {
            ids.extend(self.next().await?.ids());
        }
        Ok(ids)
    }

    async fn fetch(&mut self, page_token: Option<String>) -> Result<ListingPage, PagingError> {
        let query = self.query.clone().unwrap_or_default();
        let token = self.tokens.access_token().await?;
        let page = self
            .api
            .list_messages(&token, &query, page_token.as_deref())
            .await?;

        debug!(
            items = page.items.len(),
            has_next = page.has_continuation(),
            "fetched message listing page"
        );

        self.continuation = page
            .has_continuation()
            .then(|| page.continuation_token.clone())
            .flatten();
        if page.estimated_total.is_some() {
            self.estimated_total = page.estimated_total;
        }
        Ok(page)
    }
}
