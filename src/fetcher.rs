//! Resolves message ids into full messages, twenty per round trip.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::credentials::manager::AccessTokenProvider;
use crate::gmail::{BatchItem, MailboxApi, Message};
use crate::pager::ListingPage;

/// Upper bound on ids per batch request.
pub const BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("message {id}: {detail}")]
    ItemFailed { id: String, detail: String },

    #[error("message {id}: deadline reached before its group completed")]
    Cancelled { id: String },
}

impl FetchError {
    pub fn id(&self) -> &str {
        match self {
            Self::ItemFailed { id, .. } | Self::Cancelled { id } => id,
        }
    }
}

/// Turns batch mode on for its lifetime while holding the client's batch
/// lock. Mode is switched off before the lock is released.
struct BatchModeGuard<'a> {
    api: &'a dyn MailboxApi,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> BatchModeGuard<'a> {
    async fn enable(api: &'a dyn MailboxApi) -> Self {
        let lock = api.batch_lock().lock().await;
        api.set_batch_mode(true);
        Self { api, _lock: lock }
    }
}

impl Drop for BatchModeGuard<'_> {
    fn drop(&mut self) {
        self.api.set_batch_mode(false);
    }
}

pub struct BatchFetcher {
    api: Arc<dyn MailboxApi>,
    tokens: Arc<dyn AccessTokenProvider>,
    batch_size: usize,
}

impl BatchFetcher {
    pub fn new(api: Arc<dyn MailboxApi>, tokens: Arc<dyn AccessTokenProvider>) -> Self {
        Self {
            api,
            tokens,
            batch_size: BATCH_SIZE,
        }
    }

    /// Smaller groups; values above [`BATCH_SIZE`] are capped.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, BATCH_SIZE);
        self
    }

    /// One outcome per input id, in input order.
    pub async fn resolve(&self, ids: &[String]) -> Vec<Result<Message, FetchError>> {
        self.resolve_until(ids, None).await
    }

    /// Like [`resolve`](Self::resolve), but groups still pending at `deadline`
    /// come back as [`FetchError::Cancelled`]. Finished groups are kept.
    pub async fn resolve_until(
        &self,
        ids: &[String],
        deadline: Option<Instant>,
    ) -> Vec<Result<Message, FetchError>> {
        if ids.is_empty() {
            return Vec::new();
        }

        let _batch_mode = BatchModeGuard::enable(self.api.as_ref()).await;
        let mut outcomes = Vec::with_capacity(ids.len());

        for (index, group) in ids.chunks(self.batch_size).enumerate() {
            debug!(group = index, size = group.len(), "resolving batch group");

            let group_outcomes = match deadline {
                Some(deadline) if Instant::now() >= deadline => cancelled(group),
                Some(deadline) => tokio::time::timeout_at(deadline, self.resolve_group(group))
                    .await
                    .unwrap_or_else(|_| {
                        warn!(group = index, "deadline reached while resolving batch group");
                        cancelled(group)
                    }),
                None => self.resolve_group(group).await,
            };
            outcomes.extend(group_outcomes);
        }

        let failed = outcomes.iter().filter(|outcome| outcome.is_err()).count();
        info!(
            requested = ids.len(),
            resolved = ids.len() - failed,
            failed,
            "batch resolve finished"
        );
        outcomes
    }

    /// Single direct fetch, no batch round trip.
    pub async fn resolve_one(&self, id: &str) -> Result<Message, FetchError> {
        let token = self.tokens.access_token().await.map_err(|error| {
            warn!(message_id = id, %error, "no access token for message fetch");
            FetchError::ItemFailed {
                id: id.to_string(),
                detail: format!("access token unavailable: {error}"),
            }
        })?;

        self.api
            .get_message(&token, id)
            .await
            .map_err(|error| {
                warn!(message_id = id, %error, "message fetch failed");
                FetchError::ItemFailed {
                    id: id.to_string(),
                    detail: error.to_string(),
                }
            })
    }

    pub async fn resolve_page(&self, page: &ListingPage) -> Vec<Result<Message, FetchError>> {
        self.resolve(&page.ids()).await
    }

    async fn resolve_group(&self, group: &[String]) -> Vec<Result<Message, FetchError>> {
        let token = match self.tokens.access_token().await {
            Ok(token) => token,
            Err(error) => {
                warn!(size = group.len(), %error, "no access token for batch group");
                return failed(group, &format!("access token unavailable: {error}"));
            }
        };

        let items = match self.api.execute_batch(&token, group).await {
            Ok(items) => items,
            Err(error) => {
                warn!(size = group.len(), %error, "batch request failed");
                return failed(group, &error.to_string());
            }
        };

        let returned = items.len();
        let mut by_id: HashMap<String, VecDeque<BatchItem>> = HashMap::new();
        for item in items {
            by_id.entry(item.id.clone()).or_default().push_back(item);
        }

        let outcomes: Vec<_> = group
            .iter()
            .map(|id| match by_id.get_mut(id).and_then(VecDeque::pop_front) {
                Some(item) => classify(item),
                None => {
                    warn!(message_id = %id, "batch response is missing this id");
                    Err(FetchError::ItemFailed {
                        id: id.clone(),
                        detail: "missing from batch response".to_string(),
                    })
                }
            })
            .collect();

        let unmatched: usize = by_id.values().map(VecDeque::len).sum();
        if unmatched > 0 {
            debug!(returned, unmatched, "ignoring batch items for ids that were not sent");
        }
        outcomes
    }
}

fn classify(item: BatchItem) -> Result<Message, FetchError> {
    item.outcome.map_err(|failure| {
        warn!(message_id = %item.id, %failure, "batch item failed");
        FetchError::ItemFailed {
            id: item.id,
            detail: failure.to_string(),
        }
    })
}

fn failed(group: &[String], detail: &str) -> Vec<Result<Message, FetchError>> {
    group
        .iter()
        .map(|id| {
            Err(FetchError::ItemFailed {
                id: id.clone(),
                detail: detail.to_string(),
            })
        })
        .collect()
}

fn cancelled(group: &[String]) -> Vec<Result<Message, FetchError>> {
    group
        .iter()
        .map(|id| Err(FetchError::Cancelled { id: id.clone() }))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::{BatchFetcher, FetchError, BATCH_SIZE};
    use crate::credentials::manager::AccessTokenProvider;
    use crate::credentials::{AccessToken, AuthError};
    use crate::gmail::{ApiError, BatchItem, ItemFailure, MailboxApi, Message, MessageRef};
    use crate::pager::{ListQuery, ListingPage};

    #[derive(Default)]
    struct FakeMailbox {
        failing_ids: Vec<String>,
        failing_groups: Vec<usize>,
        slow_groups: Vec<usize>,
        reverse_items: bool,
        omitted_ids: Vec<String>,
        batch_mode: AtomicBool,
        lock: tokio::sync::Mutex<()>,
        groups: Mutex<Vec<Vec<String>>>,
        mode_during_calls: Mutex<Vec<bool>>,
    }

    fn message(id: &str) -> Message {
        serde_json::from_value(serde_json::json!({ "id": id })).expect("message json")
    }

    #[async_trait]
    impl MailboxApi for FakeMailbox {
        async fn list_messages(
            &self,
            _token: &AccessToken,
            _query: &ListQuery,
            _page_token: Option<&str>,
        ) -> Result<ListingPage, ApiError> {
            unreachable!("fetcher never lists")
        }

        async fn get_message(&self, _token: &AccessToken, id: &str) -> Result<Message, ApiError> {
            if self.failing_ids.iter().any(|failing| failing == id) {
                return Err(ApiError::Status {
                    context: "gmail messages.get".to_string(),
                    status: 404,
                    body: "Requested entity was not found.".to_string(),
                });
            }
            Ok(message(id))
        }

        async fn execute_batch(
            &self,
            _token: &AccessToken,
            ids: &[String],
        ) -> Result<Vec<BatchItem>, ApiError> {
            let index = {
                let mut groups = self.groups.lock().unwrap();
                groups.push(ids.to_vec());
                groups.len() - 1
            };
            self.mode_during_calls
                .lock()
                .unwrap()
                .push(self.batch_mode.load(Ordering::SeqCst));

            if self.slow_groups.contains(&index) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.failing_groups.contains(&index) {
                return Err(ApiError::Status {
                    context: "gmail batch".to_string(),
                    status: 503,
                    body: "backend unavailable".to_string(),
                });
            }

            let mut items: Vec<BatchItem> = ids
                .iter()
                .filter(|id| !self.omitted_ids.contains(*id))
                .map(|id| BatchItem {
                    id: id.clone(),
                    outcome: if self.failing_ids.contains(id) {
                        Err(ItemFailure {
                            status: Some(404),
                            detail: "NOT_FOUND: Requested entity was not found.".to_string(),
                        })
                    } else {
                        Ok(message(id))
                    },
                })
                .collect();
            if self.reverse_items {
                items.reverse();
            }
            Ok(items)
        }

        fn set_batch_mode(&self, enabled: bool) {
            self.batch_mode.store(enabled, Ordering::SeqCst);
        }

        fn batch_mode(&self) -> bool {
            self.batch_mode.load(Ordering::SeqCst)
        }

        fn batch_lock(&self) -> &tokio::sync::Mutex<()> {
            &self.lock
        }
    }

    struct StaticToken;

    #[async_trait]
    impl AccessTokenProvider for StaticToken {
        async fn access_token(&self) -> Result<AccessToken, AuthError> {
            Ok(AccessToken::new("T1"))
        }
    }

    struct NoToken;

    #[async_trait]
    impl AccessTokenProvider for NoToken {
        async fn access_token(&self) -> Result<AccessToken, AuthError> {
            Err(AuthError::ReauthorizationRequired {
                identity_key: "user-1".to_string(),
            })
        }
    }

    fn ids(count: usize) -> Vec<String> {
        (1..=count).map(|n| format!("m{n}")).collect()
    }

    fn assert_in_order(ids: &[String], outcomes: &[Result<Message, FetchError>]) {
        assert_eq!(ids.len(), outcomes.len());
        for (id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                Ok(message) => assert_eq!(&message.id, id),
                Err(error) => assert_eq!(error.id(), id),
            }
        }
    }

    #[tokio::test]
    async fn ids_are_sent_in_groups_of_twenty() {
        let mailbox = Arc::new(FakeMailbox::default());
        let fetcher = BatchFetcher::new(mailbox.clone(), Arc::new(StaticToken));
        let ids = ids(45);

        let outcomes = fetcher.resolve(&ids).await;

        let sizes: Vec<usize> = mailbox.groups.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![BATCH_SIZE, BATCH_SIZE, 5]);
        assert!(outcomes.iter().all(Result::is_ok));
        assert_in_order(&ids, &outcomes);
        assert!(mailbox.mode_during_calls.lock().unwrap().iter().all(|on| *on));
        assert!(!mailbox.batch_mode());
    }

    #[tokio::test]
    async fn one_bad_item_does_not_spoil_its_group() {
        let mailbox = Arc::new(FakeMailbox {
            failing_ids: vec!["m7".to_string()],
            ..FakeMailbox::default()
        });
        let fetcher = BatchFetcher::new(mailbox, Arc::new(StaticToken));
        let ids = ids(20);

        let outcomes = fetcher.resolve(&ids).await;

        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 19);
        match &outcomes[6] {
            Err(FetchError::ItemFailed { id, detail }) => {
                assert_eq!(id, "m7");
                assert!(detail.contains("404"));
            }
            other => panic!("expected m7 to fail, got {other:?}"),
        }
        assert_in_order(&ids, &outcomes);
    }

    #[tokio::test]
    async fn items_are_matched_by_id_not_position() {
        let mailbox = Arc::new(FakeMailbox {
            reverse_items: true,
            failing_ids: vec!["m2".to_string()],
            ..FakeMailbox::default()
        });
        let fetcher = BatchFetcher::new(mailbox, Arc::new(StaticToken));
        let ids = ids(5);

        let outcomes = fetcher.resolve(&ids).await;

        assert_in_order(&ids, &outcomes);
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 4);
        assert!(matches!(
            &outcomes[1],
            Err(FetchError::ItemFailed { detail, .. }) if detail.contains("NOT_FOUND")
        ));
    }

    #[tokio::test]
    async fn repeated_ids_each_get_an_item_and_absent_ids_fail() {
        let mailbox = Arc::new(FakeMailbox {
            reverse_items: true,
            omitted_ids: vec!["m3".to_string()],
            ..FakeMailbox::default()
        });
        let fetcher = BatchFetcher::new(mailbox, Arc::new(StaticToken));
        let ids: Vec<String> = ["m1", "m2", "m1", "m3"].iter().map(|id| id.to_string()).collect();

        let outcomes = fetcher.resolve(&ids).await;

        assert_in_order(&ids, &outcomes);
        assert!(outcomes[..3].iter().all(Result::is_ok));
        assert!(matches!(
            &outcomes[3],
            Err(FetchError::ItemFailed { id, detail })
                if id == "m3" && detail == "missing from batch response"
        ));
    }

    #[tokio::test]
    async fn failed_group_is_recorded_and_later_groups_still_run() {
        let mailbox = Arc::new(FakeMailbox {
            failing_groups: vec![0],
            ..FakeMailbox::default()
        });
        let fetcher = BatchFetcher::new(mailbox.clone(), Arc::new(StaticToken));
        let ids = ids(25);

        let outcomes = fetcher.resolve(&ids).await;

        assert!(outcomes[..20].iter().all(|outcome| matches!(
            outcome,
            Err(FetchError::ItemFailed { detail, .. }) if detail.contains("503")
        )));
        assert!(outcomes[20..].iter().all(Result::is_ok));
        assert_in_order(&ids, &outcomes);
        assert_eq!(mailbox.groups.lock().unwrap().len(), 2);
        assert!(!mailbox.batch_mode(), "batch mode is restored after failures");
    }

    #[tokio::test]
    async fn missing_token_fails_every_group_without_calling_out() {
        let mailbox = Arc::new(FakeMailbox::default());
        let fetcher = BatchFetcher::new(mailbox.clone(), Arc::new(NoToken));

        let outcomes = fetcher.resolve(&ids(3)).await;

        assert!(outcomes.iter().all(|outcome| matches!(
            outcome,
            Err(FetchError::ItemFailed { detail, .. }) if detail.contains("access token unavailable")
        )));
        assert!(mailbox.groups.lock().unwrap().is_empty());
        assert!(!mailbox.batch_mode());
    }

    #[tokio::test]
    async fn groups_pending_at_the_deadline_are_cancelled() {
        let mailbox = Arc::new(FakeMailbox {
            slow_groups: vec![1],
            ..FakeMailbox::default()
        });
        let fetcher = BatchFetcher::new(mailbox.clone(), Arc::new(StaticToken)).with_batch_size(2);
        let ids = ids(5);

        let deadline = Instant::now() + Duration::from_millis(200);
        let outcomes = fetcher.resolve_until(&ids, Some(deadline)).await;

        assert!(outcomes[..2].iter().all(Result::is_ok));
        assert!(outcomes[2..]
            .iter()
            .all(|outcome| matches!(outcome, Err(FetchError::Cancelled { .. }))));
        assert_in_order(&ids, &outcomes);
        assert_eq!(mailbox.groups.lock().unwrap().len(), 2, "third group never sent");
        assert!(!mailbox.batch_mode());
    }

    #[tokio::test]
    async fn resolve_one_fetches_directly() {
        let mailbox = Arc::new(FakeMailbox {
            failing_ids: vec!["gone".to_string()],
            ..FakeMailbox::default()
        });
        let fetcher = BatchFetcher::new(mailbox.clone(), Arc::new(StaticToken));

        assert_eq!(fetcher.resolve_one("m1").await.expect("fetch m1").id, "m1");
        let error = fetcher.resolve_one("gone").await.expect_err("gone fails");
        assert_eq!(error.id(), "gone");
        assert!(mailbox.groups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn page_and_empty_inputs() {
        let mailbox = Arc::new(FakeMailbox::default());
        let fetcher = BatchFetcher::new(mailbox.clone(), Arc::new(StaticToken));

        assert!(fetcher.resolve(&[]).await.is_empty());
        assert!(mailbox.groups.lock().unwrap().is_empty());

        let page = ListingPage {
            items: vec![MessageRef::new("a"), MessageRef::new("b")],
            continuation_token: None,
            estimated_total: Some(2),
        };
        let outcomes = fetcher.resolve_page(&page).await;
        assert_in_order(&page.ids(), &outcomes);
    }
}
