use std::fmt;

use async_trait::async_trait;
use notebook_protocol::{DocumentId, NotebookRuntimeResult, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Run,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Run => "run",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The host's per-request access check.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn has_access(
        &self,
        user: &UserId,
        document_id: &DocumentId,
        capability: Capability,
    ) -> NotebookRuntimeResult<bool>;
}

/// The host's object records, as far as notebooks touch them.
#[async_trait]
pub trait ObjectDirectory: Send + Sync {
    /// `YYYY-MM-DD`, or `None` when the object has never been stamped.
    async fn modified_date(&self, document_id: &DocumentId) -> NotebookRuntimeResult<Option<String>>;
    async fn set_modified_date(
        &self,
        document_id: &DocumentId,
        date: &str,
    ) -> NotebookRuntimeResult<()>;
}
