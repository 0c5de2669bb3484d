use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use notebook_protocol::{
    CellId, DocumentId, ExecutionServer, KernelChannelSink, KernelChannelSource, KernelId,
    KernelObserver, KernelState, NotebookRuntimeError, NotebookRuntimeResult,
};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::wire::{
    KernelMessage, correlation_id, decode_message, encode_execute_request, silent_request_id,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelStatus {
    Connecting,
    Open,
    Failed(String),
}

struct SessionShared {
    document_id: DocumentId,
    kernel_id: KernelId,
    observer: Arc<dyn KernelObserver>,
    state: watch::Sender<KernelState>,
    channel: watch::Sender<ChannelStatus>,
    sink: AsyncMutex<Option<Box<dyn KernelChannelSink>>>,
    closed: AtomicBool,
    protocol_errors: AtomicU64,
}

/// One document's kernel and its persistent channel.
///
/// Runs are not serialized against each other; the sink lock is held only
/// for the duration of one frame write.
pub struct KernelSession {
    shared: Arc<SessionShared>,
    server: Arc<dyn ExecutionServer>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("document_id", &self.shared.document_id)
            .field("kernel_id", &self.shared.kernel_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl KernelSession {
    /// Connects the channel in the background. The optional `init_code` is
    /// sent as a silent execution before any `run` is released.
    pub fn start(
        server: Arc<dyn ExecutionServer>,
        kernel_id: KernelId,
        document_id: DocumentId,
        observer: Arc<dyn KernelObserver>,
        init_code: Option<Arc<str>>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(KernelState::Starting);
        let (channel, _) = watch::channel(ChannelStatus::Connecting);
        let shared = Arc::new(SessionShared {
            document_id,
            kernel_id,
            observer,
            state,
            channel,
            sink: AsyncMutex::new(None),
            closed: AtomicBool::new(false),
            protocol_errors: AtomicU64::new(0),
        });

        let reader = tokio::spawn(run_channel(
            Arc::clone(&shared),
            Arc::clone(&server),
            init_code,
        ));

        Arc::new(Self {
            shared,
            server,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.shared.document_id
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.shared.kernel_id
    }

    pub fn state(&self) -> KernelState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<KernelState> {
        self.shared.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Inbound frames that could not be decoded or were not recognized.
    pub fn protocol_error_count(&self) -> u64 {
        self.shared.protocol_errors.load(Ordering::Relaxed)
    }

    /// Submits `code` for execution on behalf of `cell_id`.
    ///
    /// Waits for the channel if it is still connecting.
    pub async fn run(&self, cell_id: &CellId, code: &str) -> NotebookRuntimeResult<()> {
        self.ensure_open()?;
        self.wait_for_channel().await?;

        let msg_id = correlation_id(cell_id);
        let frame = encode_execute_request(&self.shared.document_id, msg_id, code, false)?;
        self.shared.send_frame(frame).await?;
        debug!(
            document = %self.shared.document_id,
            kernel = %self.shared.kernel_id,
            cell = %cell_id,
            "submitted cell execution"
        );
        Ok(())
    }

    /// Best-effort out-of-band interrupt.
    pub async fn interrupt(&self) -> NotebookRuntimeResult<()> {
        self.ensure_open()?;
        self.server.interrupt_kernel(&self.shared.kernel_id).await
    }

    /// Announces `off`, silences further notifications, and deletes the
    /// backend kernel. Repeated calls return immediately.
    pub async fn close(&self) -> NotebookRuntimeResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared
            .observer
            .on_state_change(&self.shared.document_id, KernelState::Off)
            .await;
        self.shared.state.send_replace(KernelState::Closed);

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.shared
            .channel
            .send_replace(ChannelStatus::Failed("kernel session closed".to_owned()));

        if let Some(mut sink) = self.shared.sink.lock().await.take() {
            if let Err(error) = sink.close().await {
                debug!(
                    document = %self.shared.document_id,
                    error = %error,
                    "kernel channel close failed"
                );
            }
        }

        debug!(
            document = %self.shared.document_id,
            kernel = %self.shared.kernel_id,
            "closing kernel"
        );
        self.server.delete_kernel(&self.shared.kernel_id).await
    }

    fn ensure_open(&self) -> NotebookRuntimeResult<()> {
        if self.is_closed() {
            return Err(NotebookRuntimeError::Closed(format!(
                "kernel for document {} is closed",
                self.shared.document_id
            )));
        }
        Ok(())
    }

    async fn wait_for_channel(&self) -> NotebookRuntimeResult<()> {
        let mut channel = self.shared.channel.subscribe();
        let status = channel
            .wait_for(|status| *status != ChannelStatus::Connecting)
            .await
            .map_err(|_| {
                NotebookRuntimeError::Closed("kernel channel was dropped".to_owned())
            })?
            .clone();
        match status {
            ChannelStatus::Failed(reason) => Err(NotebookRuntimeError::Closed(reason)),
            _ => Ok(()),
        }
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}

impl SessionShared {
    async fn send_frame(&self, frame: String) -> NotebookRuntimeResult<()> {
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(NotebookRuntimeError::Closed(format!(
                "kernel channel for document {} is not open",
                self.document_id
            )));
        };
        sink.send_text(frame).await
    }

    async fn set_state(&self, state: KernelState) {
        self.state.send_replace(state);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.observer.on_state_change(&self.document_id, state).await;
    }

    async fn handle_frame(&self, text: &str) {
        match decode_message(text) {
            Ok(KernelMessage::Status(state)) => {
                debug!(document = %self.document_id, state = state.as_str(), "kernel state");
                self.set_state(state).await;
            }
            Ok(KernelMessage::Output { cell_id, output }) => {
                if !self.closed.load(Ordering::SeqCst) {
                    self.observer
                        .on_output(&self.document_id, &cell_id, output)
                        .await;
                }
            }
            Ok(KernelMessage::Ignored(_)) => {}
            Err(error) => {
                self.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    document = %self.document_id,
                    kernel = %self.kernel_id,
                    error = %error,
                    "dropping kernel message"
                );
            }
        }
    }
}

async fn run_channel(
    shared: Arc<SessionShared>,
    server: Arc<dyn ExecutionServer>,
    init_code: Option<Arc<str>>,
) {
    let source = match open_channel(&shared, server.as_ref(), init_code).await {
        Ok(source) => source,
        Err(error) => {
            warn!(
                document = %shared.document_id,
                kernel = %shared.kernel_id,
                error = %error,
                "kernel channel failed to open"
            );
            shared
                .channel
                .send_replace(ChannelStatus::Failed(error.to_string()));
            shared.set_state(KernelState::Closed).await;
            return;
        }
    };

    read_frames(&shared, source).await;
    shared.sink.lock().await.take();
    shared
        .channel
        .send_replace(ChannelStatus::Failed("kernel channel ended".to_owned()));
    shared.set_state(KernelState::Closed).await;
}

async fn open_channel(
    shared: &SessionShared,
    server: &dyn ExecutionServer,
    init_code: Option<Arc<str>>,
) -> NotebookRuntimeResult<Box<dyn KernelChannelSource>> {
    let mut channel = server
        .open_channel(&shared.kernel_id, &shared.document_id)
        .await?;

    if let Some(init_code) = init_code {
        let frame =
            encode_execute_request(&shared.document_id, silent_request_id(), &init_code, true)?;
        channel.sink.send_text(frame).await?;
    }

    *shared.sink.lock().await = Some(channel.sink);
    shared.channel.send_replace(ChannelStatus::Open);
    debug!(
        document = %shared.document_id,
        kernel = %shared.kernel_id,
        "kernel channel open"
    );
    Ok(channel.source)
}

async fn read_frames(shared: &SessionShared, mut source: Box<dyn KernelChannelSource>) {
    loop {
        match source.next_text().await {
            Ok(Some(text)) => shared.handle_frame(&text).await,
            Ok(None) => {
                debug!(document = %shared.document_id, "kernel channel closed by server");
                return;
            }
            Err(error) => {
                shared.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    document = %shared.document_id,
                    error = %error,
                    "kernel channel read failed"
                );
                return;
            }
        }
    }
}
