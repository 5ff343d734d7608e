use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forrst_core::{Operation, OperationError, OperationId, OperationStatus, OwnerScope};

/// Page size used when a listing does not ask for one.
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Hard cap on a listing page, whatever the caller asked for.
pub const MAX_LIST_LIMIT: usize = 50;

/// Failures reported by an [`OperationRepository`].
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("operation {0} not found")]
    NotFound(OperationId),
    #[error("operation {0} already exists")]
    AlreadyExists(OperationId),
    #[error("operation {id} is {actual}, expected {expected}")]
    Conflict {
        id: OperationId,
        expected: OperationStatus,
        actual: OperationStatus,
    },
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("operation store failure: {0}")]
    Backend(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// ListQuery / OperationPage
// ---------------------------------------------------------------------------

/// Filter and paging for [`OperationRepository::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub status: Option<OperationStatus>,
    pub function: Option<String>,
    pub limit: usize,
    /// Opaque cursor from a previous page's `next_cursor`.
    pub cursor: Option<String>,
    pub scope: OwnerScope,
}

impl ListQuery {
    #[must_use]
    pub fn new(scope: OwnerScope) -> Self {
        Self {
            status: None,
            function: None,
            limit: DEFAULT_LIST_LIMIT,
            cursor: None,
            scope,
        }
    }

    /// Requested limit clamped to `1..=MAX_LIST_LIMIT`.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }

    /// Whether `operation` passes the status, function and owner filters.
    #[must_use]
    pub fn matches(&self, operation: &Operation) -> bool {
        self.scope.permits(operation.caller_id.as_deref())
            && self.status.is_none_or(|status| operation.status == status)
            && self
                .function
                .as_deref()
                .is_none_or(|function| operation.function == function)
    }
}

/// One page of operations, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationPage {
    pub items: Vec<Operation>,
    pub next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// OperationRepository
// ---------------------------------------------------------------------------

/// Durable store for operation records.
///
/// The repository is the source of truth for an operation once it has been
/// created. Writers go through [`persist`](Self::persist), which only applies
/// when the stored status still equals the status the writer read.
#[async_trait]
pub trait OperationRepository: Send + Sync {
    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::AlreadyExists`] if the id is taken.
    async fn create(&self, operation: &Operation) -> Result<(), RepositoryError>;

    /// Loads one record.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::NotFound`] for an unknown id.
    async fn find(&self, id: &OperationId) -> Result<Operation, RepositoryError>;

    /// Lists records matching `query`, ordered by creation time then id.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::InvalidCursor`] for a cursor this store did not
    /// issue.
    async fn list(&self, query: &ListQuery) -> Result<OperationPage, RepositoryError>;

    /// Replaces the stored record if its status is still `expected`.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::Conflict`] when another writer changed the status
    /// first, [`RepositoryError::NotFound`] for an unknown id.
    async fn persist(
        &self,
        operation: &Operation,
        expected: OperationStatus,
    ) -> Result<(), RepositoryError>;

    /// Non-terminal records whose `expires_at` is at or before `now`.
    ///
    /// # Errors
    ///
    /// Backend failures only.
    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Operation>, RepositoryError>;
}

/// Failure of [`update_operation`].
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// Read-modify-write of one record guarded by the status compare-and-swap.
///
/// # Errors
///
/// Returns the mutation's [`OperationError`] untouched, or the repository's
/// error (including [`RepositoryError::Conflict`] when the record moved
/// between the read and the write).
pub async fn update_operation<F>(
    repository: &dyn OperationRepository,
    id: &OperationId,
    mutate: F,
) -> Result<Operation, UpdateError>
where
    F: FnOnce(&mut Operation) -> Result<(), OperationError> + Send,
{
    let mut operation = repository.find(id).await?;
    let expected = operation.status;
    mutate(&mut operation)?;
    repository.persist(&operation, expected).await?;
    Ok(operation)
}
