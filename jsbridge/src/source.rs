//! Source context identifiers for script executions

/// Opaque identifier for one script execution within a session.
///
/// Ids are only meaningful inside the session that issued them; they tag
/// log records and diagnostics so concurrent-looking output can be traced
/// back to a specific execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceContextId(u64);

impl SourceContextId {
    /// The raw counter value
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SourceContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues strictly increasing source context ids, starting at zero.
#[derive(Debug, Default)]
pub struct SourceContextAllocator {
    next: u64,
}

impl SourceContextAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id. Never reuses a value within a session.
    pub fn next(&mut self) -> SourceContextId {
        let id = SourceContextId(self.next);
        self.next += 1;
        id
    }

    /// How many ids have been issued so far
    pub fn issued(&self) -> u64 {
        self.next
    }
}
