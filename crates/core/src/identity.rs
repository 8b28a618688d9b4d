use anyhow::Result;
use chrono::NaiveDateTime;
#[cfg(test)]
use mockall::automock;

use crate::embedding::Embedding;

pub type IdentityId = i64;

/// A registered visitor. Created once by a confirmed registration, never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationLogEntry {
    pub identity_id: IdentityId,
    pub text: String,
    pub timestamp: NaiveDateTime,
}

/// Persistent home of identities and their conversation logs.
///
/// Implementations are synchronous; the coordinator moves the writing calls
/// onto blocking threads. `find_match` is expected to be served from memory
/// and must observe every identity returned by an earlier `register`.
#[cfg_attr(test, automock)]
pub trait IdentityStore: Send + Sync {
    fn find_match(&self, embedding: &Embedding) -> Result<Option<Identity>>;

    fn register(&self, name: &str, embedding: &Embedding) -> Result<Identity>;

    fn append_log(&self, identity_id: IdentityId, text: &str) -> Result<()>;

    /// Writes the user line and the bot line of one exchange, both or neither.
    fn append_exchange(&self, identity_id: IdentityId, user_text: &str, bot_text: &str)
    -> Result<()>;

    /// Most recent `limit` entries, oldest first.
    fn history(&self, identity_id: IdentityId, limit: usize) -> Result<Vec<ConversationLogEntry>>;
}
