//! In-memory [`OperationRepository`] backed by [`DashMap`].
//!
//! Status compare-and-swap relies on the shard lock held by
//! [`DashMap::get_mut`]: the status check and the replacement happen under the
//! same guard, so two writers cannot both leave the same state. Suitable for
//! single-node deployments and tests; records do not survive a restart.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forrst_core::{Operation, OperationId, OperationStatus};

use super::repository::{ListQuery, OperationPage, OperationRepository, RepositoryError};

/// Operation store held in process memory.
pub struct InMemoryOperationRepository {
    operations: DashMap<OperationId, Operation>,
}

impl InMemoryOperationRepository {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            operations: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Default for InMemoryOperationRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort key of one record: creation time, then id.
type CursorKey = (DateTime<Utc>, OperationId);

/// Encodes the position after `operation` as an opaque cursor.
fn encode_cursor(operation: &Operation) -> String {
    let raw = format!("{}|{}", operation.created_at.to_rfc3339(), operation.id);
    URL_SAFE_NO_PAD.encode(raw)
}

fn decode_cursor(cursor: &str) -> Result<CursorKey, RepositoryError> {
    let invalid = || RepositoryError::InvalidCursor(cursor.to_string());
    let bytes = URL_SAFE_NO_PAD.decode(cursor).map_err(|_| invalid())?;
    let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
    let (created_at, id) = raw.split_once('|').ok_or_else(invalid)?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|_| invalid())?
        .with_timezone(&Utc);
    let id = OperationId::parse(id).map_err(|_| invalid())?;
    Ok((created_at, id))
}

#[async_trait]
impl OperationRepository for InMemoryOperationRepository {
    async fn create(&self, operation: &Operation) -> Result<(), RepositoryError> {
        match self.operations.entry(operation.id.clone()) {
            Entry::Occupied(_) => Err(RepositoryError::AlreadyExists(operation.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(operation.clone());
                Ok(())
            }
        }
    }

    async fn find(&self, id: &OperationId) -> Result<Operation, RepositoryError> {
        self.operations
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    async fn list(&self, query: &ListQuery) -> Result<OperationPage, RepositoryError> {
        let after = query.cursor.as_deref().map(decode_cursor).transpose()?;
        let limit = query.effective_limit();

        let mut matching: Vec<Operation> = self
            .operations
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .filter(|entry| {
                after.as_ref().is_none_or(|(created_at, id)| {
                    (entry.created_at, &entry.id) > (*created_at, id)
                })
            })
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let has_more = matching.len() > limit;
        matching.truncate(limit);
        let next_cursor = if has_more {
            matching.last().map(encode_cursor)
        } else {
            None
        };
        Ok(OperationPage {
            items: matching,
            next_cursor,
        })
    }

    async fn persist(
        &self,
        operation: &Operation,
        expected: OperationStatus,
    ) -> Result<(), RepositoryError> {
        let mut stored = self
            .operations
            .get_mut(&operation.id)
            .ok_or_else(|| RepositoryError::NotFound(operation.id.clone()))?;
        if stored.status != expected {
            return Err(RepositoryError::Conflict {
                id: operation.id.clone(),
                expected,
                actual: stored.status,
            });
        }
        *stored = operation.clone();
        Ok(())
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Operation>, RepositoryError> {
        let mut due: Vec<Operation> = self
            .operations
            .iter()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.value().clone())
            .collect();
        due.sort_by_key(|op| op.expires_at);
        due.truncate(limit);
        Ok(due)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use forrst_core::OwnerScope;

    use super::*;

    fn make_op(function: &str, caller: Option<&str>, created_at: DateTime<Utc>) -> Operation {
        Operation::new(function, "1.0.0", caller.map(str::to_owned), created_at)
    }

    async fn seed(repo: &InMemoryOperationRepository, count: usize, caller: Option<&str>) {
        let base = Utc::now();
        for i in 0..count {
            let at = base + Duration::milliseconds(i64::try_from(i).unwrap());
            repo.create(&make_op("app.export", caller, at)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let repo = InMemoryOperationRepository::new();
        let op = make_op("app.export", None, Utc::now());
        repo.create(&op).await.unwrap();
        let err = repo.create(&op).await.unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn find_unknown_is_not_found() {
        let repo = InMemoryOperationRepository::new();
        let err = repo.find(&OperationId::generate()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn persist_is_compare_and_swap_on_status() {
        let repo = InMemoryOperationRepository::new();
        let op = make_op("app.export", None, Utc::now());
        repo.create(&op).await.unwrap();

        let mut first = op.clone();
        first
            .transition_to(OperationStatus::Processing, Utc::now())
            .unwrap();
        let mut second = op.clone();
        second
            .transition_to(OperationStatus::Cancelled, Utc::now())
            .unwrap();

        repo.persist(&first, OperationStatus::Queued).await.unwrap();
        let err = repo
            .persist(&second, OperationStatus::Queued)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::Conflict {
                actual: OperationStatus::Processing,
                ..
            }
        ));
        assert_eq!(
            repo.find(&op.id).await.unwrap().status,
            OperationStatus::Processing
        );
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let repo = Arc::new(InMemoryOperationRepository::new());
        let op = make_op("app.export", None, Utc::now());
        repo.create(&op).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = Arc::clone(&repo);
            let mut claim = op.clone();
            handles.push(tokio::spawn(async move {
                claim
                    .transition_to(OperationStatus::Processing, Utc::now())
                    .unwrap();
                repo.persist(&claim, OperationStatus::Queued).await.is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn list_caps_page_at_fifty() {
        let repo = InMemoryOperationRepository::new();
        seed(&repo, 60, None).await;

        let mut query = ListQuery::new(OwnerScope::Unscoped);
        query.limit = 500;
        let page = repo.list(&query).await.unwrap();
        assert_eq!(page.items.len(), 50);
        assert!(page.next_cursor.is_some());

        let page = repo
            .list(&ListQuery::new(OwnerScope::Unscoped))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 50);
    }

    #[tokio::test]
    async fn cursor_walks_pages_in_creation_order() {
        let repo = InMemoryOperationRepository::new();
        seed(&repo, 7, None).await;

        let mut query = ListQuery::new(OwnerScope::Unscoped);
        query.limit = 3;
        let mut seen = Vec::new();
        loop {
            let page = repo.list(&query).await.unwrap();
            seen.extend(page.items.iter().map(|op| op.created_at));
            match page.next_cursor {
                Some(cursor) => query.cursor = Some(cursor),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn list_is_owner_scoped_and_filtered() {
        let repo = InMemoryOperationRepository::new();
        seed(&repo, 3, Some("alice")).await;
        seed(&repo, 2, Some("bob")).await;
        repo.create(&make_op("app.import", Some("alice"), Utc::now()))
            .await
            .unwrap();

        let alice = ListQuery::new(OwnerScope::Owner("alice".into()));
        assert_eq!(repo.list(&alice).await.unwrap().items.len(), 4);

        let mut exports = alice.clone();
        exports.function = Some("app.export".into());
        assert_eq!(repo.list(&exports).await.unwrap().items.len(), 3);

        let mut processing = alice;
        processing.status = Some(OperationStatus::Processing);
        assert!(repo.list(&processing).await.unwrap().items.is_empty());

        let everyone = ListQuery::new(OwnerScope::Unscoped);
        assert_eq!(repo.list(&everyone).await.unwrap().items.len(), 6);
    }

    #[tokio::test]
    async fn garbage_cursor_is_rejected() {
        let repo = InMemoryOperationRepository::new();
        let mut query = ListQuery::new(OwnerScope::Unscoped);
        query.cursor = Some("%%%".into());
        assert!(matches!(
            repo.list(&query).await,
            Err(RepositoryError::InvalidCursor(_))
        ));
    }

    #[tokio::test]
    async fn expired_returns_only_overdue_live_operations() {
        let repo = InMemoryOperationRepository::new();
        let now = Utc::now();
        let overdue = make_op("app.export", None, now).with_expiry(now - Duration::seconds(1));
        let fresh = make_op("app.export", None, now).with_expiry(now + Duration::hours(1));
        let mut finished = make_op("app.export", None, now).with_expiry(now - Duration::seconds(1));
        finished
            .transition_to(OperationStatus::Cancelled, now)
            .unwrap();
        for op in [&overdue, &fresh, &finished] {
            repo.create(op).await.unwrap();
        }

        let due = repo.expired(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, overdue.id);
    }
}
