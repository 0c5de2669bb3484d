use notebook_protocol::NotebookEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct NotebookEventEnvelope {
    pub sequence: u64,
    pub event: NotebookEvent,
}
