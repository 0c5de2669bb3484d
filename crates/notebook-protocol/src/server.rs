use async_trait::async_trait;

use crate::error::NotebookRuntimeResult;
use crate::ids::{DocumentId, KernelId};

#[async_trait]
pub trait KernelChannelSink: Send {
    async fn send_text(&mut self, text: String) -> NotebookRuntimeResult<()>;
    async fn close(&mut self) -> NotebookRuntimeResult<()>;
}

#[async_trait]
pub trait KernelChannelSource: Send {
    /// Returns `Ok(None)` once the remote end has closed the channel.
    async fn next_text(&mut self) -> NotebookRuntimeResult<Option<String>>;
}

/// The two halves of one persistent streaming channel to a kernel.
pub struct KernelChannel {
    pub sink: Box<dyn KernelChannelSink>,
    pub source: Box<dyn KernelChannelSource>,
}

/// Request/response surface of one execution server process.
#[async_trait]
pub trait ExecutionServer: Send + Sync {
    async fn create_kernel(&self, kernel_name: &str) -> NotebookRuntimeResult<KernelId>;
    async fn delete_kernel(&self, kernel_id: &KernelId) -> NotebookRuntimeResult<()>;
    async fn interrupt_kernel(&self, kernel_id: &KernelId) -> NotebookRuntimeResult<()>;
    async fn open_channel(
        &self,
        kernel_id: &KernelId,
        session: &DocumentId,
    ) -> NotebookRuntimeResult<KernelChannel>;
}
