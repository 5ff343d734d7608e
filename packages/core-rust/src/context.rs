use chrono::{DateTime, Utc};

use crate::types::Principal;

/// Who is making a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// No identity was presented.
    Anonymous,
    /// An in-process or trusted system caller.
    System,
    /// An identified caller. Operation visibility is scoped to its id.
    Principal(Principal),
}

/// Visibility scope applied to operation queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerScope {
    /// Only operations whose `caller_id` equals this id.
    Owner(String),
    /// All operations, for system and anonymous callers.
    Unscoped,
}

impl Caller {
    /// Identifier recorded as an operation's `caller_id`.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Principal(p) => Some(p.id.as_str()),
            Self::Anonymous | Self::System => None,
        }
    }

    #[must_use]
    pub fn owner_scope(&self) -> OwnerScope {
        match self {
            Self::Principal(p) => OwnerScope::Owner(p.id.clone()),
            Self::Anonymous | Self::System => OwnerScope::Unscoped,
        }
    }
}

impl OwnerScope {
    /// Whether a record owned by `caller_id` is visible in this scope.
    #[must_use]
    pub fn permits(&self, caller_id: Option<&str>) -> bool {
        match self {
            Self::Owner(owner) => caller_id == Some(owner.as_str()),
            Self::Unscoped => true,
        }
    }
}

/// Per-call context carrying identity and tracing information.
/// Passed by reference through every dispatch stage; never mutated by hooks.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Identifier of the node handling this call.
    pub node_id: String,
    /// Who is calling.
    pub caller: Caller,
    /// Distributed trace identifier for observability.
    pub trace_id: String,
    /// When the transport handed the call to the dispatcher.
    pub received_at: DateTime<Utc>,
}

impl CallContext {
    #[must_use]
    pub fn new(node_id: impl Into<String>, caller: Caller, trace_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            caller,
            trace_id: trace_id.into(),
            received_at: Utc::now(),
        }
    }

    /// Context for trusted in-process calls.
    #[must_use]
    pub fn system(node_id: impl Into<String>) -> Self {
        Self::new(node_id, Caller::System, String::new())
    }

    #[must_use]
    pub fn caller_id(&self) -> Option<&str> {
        self.caller.id()
    }
}
