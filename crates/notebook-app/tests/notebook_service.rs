use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notebook_app::{
    AppError, Authorizer, Capability, NotebookService, ObjectDirectory, SharedStore,
    StoreObserver, shared_store,
};
use notebook_eventbus::{NotebookEventBus, NotebookEventEnvelope};
use notebook_manager::{
    CredentialIssuer, LaunchSpec, LaunchedWorker, ManagerSettings, SessionManager,
    WorkerLauncher, WorkerProcess,
};
use notebook_protocol::{
    CELL_OUTPUTS_EVENT, CellId, DocumentId, ExecutionServer, KernelChannel, KernelChannelSink,
    KernelChannelSource, KernelId, KernelState, NotebookRuntimeError, NotebookRuntimeResult,
    OutputRecord, UserId,
};
use notebook_store::{CellPatch, CellType, SqliteCellStore};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(3);

/// A kernel that answers every non-silent execution with `ran <code>`.
#[derive(Default)]
struct EchoExecution {
    next_kernel: AtomicUsize,
    deleted: Mutex<Vec<KernelId>>,
    interrupted: Mutex<Vec<KernelId>>,
}

impl EchoExecution {
    fn deleted(&self) -> usize {
        self.deleted.lock().expect("deleted lock").len()
    }
}

#[async_trait]
impl ExecutionServer for EchoExecution {
    async fn create_kernel(&self, _kernel_name: &str) -> NotebookRuntimeResult<KernelId> {
        let number = self.next_kernel.fetch_add(1, Ordering::SeqCst);
        Ok(KernelId::new(format!("kernel-{number}")))
    }

    async fn delete_kernel(&self, kernel_id: &KernelId) -> NotebookRuntimeResult<()> {
        self.deleted
            .lock()
            .expect("deleted lock")
            .push(kernel_id.clone());
        Ok(())
    }

    async fn interrupt_kernel(&self, kernel_id: &KernelId) -> NotebookRuntimeResult<()> {
        self.interrupted
            .lock()
            .expect("interrupted lock")
            .push(kernel_id.clone());
        Ok(())
    }

    async fn open_channel(
        &self,
        _kernel_id: &KernelId,
        _session: &DocumentId,
    ) -> NotebookRuntimeResult<KernelChannel> {
        let (replies, inbound) = mpsc::unbounded_channel();
        Ok(KernelChannel {
            sink: Box::new(EchoSink { replies }),
            source: Box::new(EchoSource { inbound }),
        })
    }
}

struct EchoSink {
    replies: mpsc::UnboundedSender<String>,
}

impl EchoSink {
    fn reply(&self, message: Value) -> NotebookRuntimeResult<()> {
        self.replies
            .send(message.to_string())
            .map_err(|_| NotebookRuntimeError::Process("echo kernel stopped".to_owned()))
    }
}

#[async_trait]
impl KernelChannelSink for EchoSink {
    async fn send_text(&mut self, text: String) -> NotebookRuntimeResult<()> {
        let request: Value = serde_json::from_str(&text)
            .map_err(|error| NotebookRuntimeError::Protocol(error.to_string()))?;
        if request["content"]["silent"] == true {
            return Ok(());
        }
        let msg_id = request["header"]["msg_id"].clone();
        let code = request["content"]["code"].as_str().unwrap_or_default();

        self.reply(json!({"msg_type": "status", "content": {"execution_state": "busy"}}))?;
        self.reply(json!({
            "msg_type": "stream",
            "parent_header": {"msg_id": msg_id},
            "content": {"name": "stdout", "text": format!("ran {code}\n")},
        }))?;
        self.reply(json!({"msg_type": "status", "content": {"execution_state": "idle"}}))
    }

    async fn close(&mut self) -> NotebookRuntimeResult<()> {
        Ok(())
    }
}

struct EchoSource {
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl KernelChannelSource for EchoSource {
    async fn next_text(&mut self) -> NotebookRuntimeResult<Option<String>> {
        Ok(self.inbound.recv().await)
    }
}

#[derive(Default)]
struct ProcessRecord {
    terminated: AtomicBool,
    waited: AtomicBool,
}

struct FakeProcess {
    listener: Option<TcpListener>,
    record: Arc<ProcessRecord>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> NotebookRuntimeResult<bool> {
        Ok(false)
    }

    fn terminate(&mut self) -> NotebookRuntimeResult<()> {
        self.listener.take();
        self.record.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&mut self) -> NotebookRuntimeResult<()> {
        self.record.waited.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeLauncher {
    execution: Arc<EchoExecution>,
    processes: Mutex<Vec<Arc<ProcessRecord>>>,
}

impl FakeLauncher {
    fn launches(&self) -> usize {
        self.processes.lock().expect("processes lock").len()
    }

    fn all_stopped(&self) -> bool {
        self.processes
            .lock()
            .expect("processes lock")
            .iter()
            .all(|record| {
                record.terminated.load(Ordering::SeqCst) && record.waited.load(Ordering::SeqCst)
            })
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: LaunchSpec) -> NotebookRuntimeResult<LaunchedWorker> {
        let listener = TcpListener::bind(("127.0.0.1", spec.port))
            .await
            .map_err(|error| NotebookRuntimeError::Process(error.to_string()))?;
        let record = Arc::new(ProcessRecord::default());
        self.processes
            .lock()
            .expect("processes lock")
            .push(Arc::clone(&record));
        Ok(LaunchedWorker {
            process: Box::new(FakeProcess {
                listener: Some(listener),
                record,
            }),
            execution: self.execution.clone(),
        })
    }
}

struct StaticCredentials;

#[async_trait]
impl CredentialIssuer for StaticCredentials {
    async fn issue(&self, user: &UserId, _scope: &str) -> NotebookRuntimeResult<String> {
        Ok(format!("credential-{user}"))
    }
}

#[derive(Default)]
struct FakeAuthorizer {
    denied: Mutex<Vec<Capability>>,
}

impl FakeAuthorizer {
    fn deny(&self, capability: Capability) {
        self.denied.lock().expect("denied lock").push(capability);
    }
}

#[async_trait]
impl Authorizer for FakeAuthorizer {
    async fn has_access(
        &self,
        _user: &UserId,
        _document_id: &DocumentId,
        capability: Capability,
    ) -> NotebookRuntimeResult<bool> {
        Ok(!self
            .denied
            .lock()
            .expect("denied lock")
            .contains(&capability))
    }
}

#[derive(Default)]
struct MemoryDirectory {
    dates: Mutex<HashMap<DocumentId, String>>,
    writes: AtomicUsize,
}

#[async_trait]
impl ObjectDirectory for MemoryDirectory {
    async fn modified_date(&self, document_id: &DocumentId) -> NotebookRuntimeResult<Option<String>> {
        Ok(self
            .dates
            .lock()
            .expect("dates lock")
            .get(document_id)
            .cloned())
    }

    async fn set_modified_date(
        &self,
        document_id: &DocumentId,
        date: &str,
    ) -> NotebookRuntimeResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.dates
            .lock()
            .expect("dates lock")
            .insert(document_id.clone(), date.to_owned());
        Ok(())
    }
}

struct Harness {
    service: NotebookService,
    store: SharedStore,
    bus: Arc<NotebookEventBus>,
    launcher: Arc<FakeLauncher>,
    execution: Arc<EchoExecution>,
    authorizer: Arc<FakeAuthorizer>,
    directory: Arc<MemoryDirectory>,
    user: UserId,
    document_id: DocumentId,
}

fn harness() -> Harness {
    let document_id = DocumentId::new("doc-1");
    let mut store = SqliteCellStore::in_memory().expect("open store");
    store
        .register_document(&document_id)
        .expect("register document");
    let store = shared_store(store);

    let bus = Arc::new(NotebookEventBus::default());
    let execution = Arc::new(EchoExecution::default());
    let launcher = Arc::new(FakeLauncher {
        execution: Arc::clone(&execution),
        processes: Mutex::new(Vec::new()),
    });
    let observer = Arc::new(StoreObserver::new(Arc::clone(&store), bus.clone()));
    let manager = Arc::new(SessionManager::new(
        launcher.clone(),
        Arc::new(StaticCredentials),
        observer,
        ManagerSettings {
            startup_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            ..ManagerSettings::default()
        },
    ));
    let authorizer = Arc::new(FakeAuthorizer::default());
    let directory = Arc::new(MemoryDirectory::default());
    let service = NotebookService::new(
        Arc::clone(&store),
        manager,
        bus.clone(),
        authorizer.clone(),
        directory.clone(),
    );

    Harness {
        service,
        store,
        bus,
        launcher,
        execution,
        authorizer,
        directory,
        user: UserId::new("alice"),
        document_id,
    }
}

impl Harness {
    async fn add_cell(&self, cell_id: &str, cell_type: CellType, source: &str) {
        self.service
            .save(
                &self.user,
                &self.document_id,
                vec![
                    CellPatch::for_cell(cell_id)
                        .with_type(cell_type)
                        .with_source(source),
                ],
            )
            .await
            .expect("save cell");
    }
}

async fn next_event(events: &mut broadcast::Receiver<NotebookEventEnvelope>) -> NotebookEventEnvelope {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("event timed out")
        .expect("event channel closed")
}

#[tokio::test]
async fn save_publishes_each_change_and_stamps_the_date_once_per_day() {
    let h = harness();
    let mut events = h.bus.subscribe_document(h.document_id.clone());

    let changes = h
        .service
        .save(
            &h.user,
            &h.document_id,
            vec![
                CellPatch::for_cell("a").with_source("x = 1"),
                CellPatch::for_cell("b").with_source("print(x)"),
            ],
        )
        .await
        .expect("save batch");

    for change in changes {
        assert_eq!(next_event(&mut events).await.event, change.into_event());
    }
    assert_eq!(h.directory.writes.load(Ordering::SeqCst), 1);

    h.service
        .save(
            &h.user,
            &h.document_id,
            vec![CellPatch::for_cell("a").with_source("x = 2")],
        )
        .await
        .expect("second save");
    assert_eq!(h.directory.writes.load(Ordering::SeqCst), 1);

    let today = h
        .store
        .lock()
        .expect("store lock")
        .current_utc_date()
        .expect("today");
    assert_eq!(
        h.directory
            .modified_date(&h.document_id)
            .await
            .expect("modified date"),
        Some(today)
    );
}

#[tokio::test]
async fn clients_cannot_write_outputs() {
    let h = harness();

    let error = h
        .service
        .save(
            &h.user,
            &h.document_id,
            vec![
                CellPatch::for_cell("a")
                    .with_source("1")
                    .with_outputs(vec![OutputRecord::stream("stdout", "forged")]),
            ],
        )
        .await
        .expect_err("outputs are rejected");

    assert!(matches!(error, AppError::OutputsNotPermitted));
    let count = h
        .store
        .lock()
        .expect("store lock")
        .cell_count(&h.document_id)
        .expect("count");
    assert_eq!(count, 0);
    assert_eq!(h.directory.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_capabilities_are_refused_before_any_work() {
    let h = harness();
    h.authorizer.deny(Capability::Write);
    h.authorizer.deny(Capability::Run);

    let error = h
        .service
        .save(
            &h.user,
            &h.document_id,
            vec![CellPatch::for_cell("a").with_source("1")],
        )
        .await
        .expect_err("write is denied");
    assert!(error.is_permission_denied());

    let error = h
        .service
        .kernel_state(&h.user, &h.document_id, true)
        .await
        .expect_err("run is denied");
    assert!(error.is_permission_denied());

    assert!(
        h.service
            .read(&h.user, &h.document_id)
            .await
            .expect("read is allowed")
            .is_empty()
    );
    assert_eq!(h.launcher.launches(), 0);
}

#[tokio::test]
async fn stale_source_is_rejected_without_starting_a_worker() {
    let h = harness();
    h.add_cell("a", CellType::Code, "print(2)").await;

    let error = h
        .service
        .run_cell(&h.user, &h.document_id, &CellId::new("a"), "print(1)")
        .await
        .expect_err("source mismatch");

    assert!(matches!(error, AppError::SourceMismatch { .. }));
    assert_eq!(h.launcher.launches(), 0);
}

#[tokio::test]
async fn running_a_markdown_cell_does_nothing() {
    let h = harness();
    h.add_cell("notes", CellType::Markdown, "# Title").await;

    h.service
        .run_cell(&h.user, &h.document_id, &CellId::new("notes"), "# Title")
        .await
        .expect("markdown run");

    assert_eq!(h.launcher.launches(), 0);
}

#[tokio::test]
async fn running_a_cell_streams_outputs_into_the_store() {
    let h = harness();
    let cell_id = CellId::new("a");
    h.add_cell("a", CellType::Code, "print(1)").await;
    let mut events = h.bus.subscribe_document(h.document_id.clone());

    h.service
        .run_cell(&h.user, &h.document_id, &cell_id, "print(1)")
        .await
        .expect("run cell");

    let cleared = next_event(&mut events).await.event;
    assert_eq!(cleared.event, CELL_OUTPUTS_EVENT);
    assert_eq!(cleared.data, json!({"cell_id": "a", "outputs": []}));

    let expected = json!({
        "cell_id": "a",
        "outputs": [{"output_type": "stream", "name": "stdout", "text": "ran print(1)\n"}],
    });
    timeout(TEST_TIMEOUT, async {
        loop {
            let event = next_event(&mut events).await.event;
            if event.event == CELL_OUTPUTS_EVENT && event.data == expected {
                break;
            }
        }
    })
    .await
    .expect("outputs event");

    let cell = h
        .service
        .read_cell(&h.user, &h.document_id, &cell_id)
        .await
        .expect("read cell");
    assert_eq!(cell.outputs.len(), 1);
    assert_eq!(cell.outputs[0].text(), Some("ran print(1)\n"));
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test]
async fn kernel_state_starts_and_stops_on_request() {
    let h = harness();

    assert_eq!(
        h.service
            .kernel_state(&h.user, &h.document_id, false)
            .await
            .expect("state"),
        KernelState::Off
    );
    assert_eq!(h.launcher.launches(), 0);

    let started = h
        .service
        .kernel_state(&h.user, &h.document_id, true)
        .await
        .expect("start");
    assert_ne!(started, KernelState::Off);
    assert_eq!(h.launcher.launches(), 1);

    h.service
        .interrupt_kernel(&h.user, &h.document_id)
        .await
        .expect("interrupt");
    assert_eq!(h.execution.interrupted.lock().expect("interrupted lock").len(), 1);

    h.service
        .stop_kernel(&h.user, &h.document_id)
        .await
        .expect("stop");
    assert_eq!(h.execution.deleted(), 1);
    assert_eq!(
        h.service
            .kernel_state(&h.user, &h.document_id, false)
            .await
            .expect("state"),
        KernelState::Off
    );
}

#[tokio::test]
async fn interrupting_without_a_worker_is_a_no_op() {
    let h = harness();

    h.service
        .interrupt_kernel(&h.user, &h.document_id)
        .await
        .expect("interrupt");

    assert_eq!(h.launcher.launches(), 0);
    assert!(h.execution.interrupted.lock().expect("interrupted lock").is_empty());
}

#[tokio::test]
async fn deleting_a_notebook_closes_its_kernel() {
    let h = harness();
    h.service
        .start_kernel(&h.user, &h.document_id)
        .await
        .expect("start");

    timeout(
        TEST_TIMEOUT,
        h.service
            .on_object_deleted(h.user.clone(), h.document_id.clone()),
    )
    .await
    .expect("hook timed out")
    .expect("hook task");

    assert_eq!(h.execution.deleted(), 1);
    assert_eq!(h.service.manager().server_count().await, 1);
}

#[tokio::test]
async fn deleting_a_user_stops_their_worker() {
    let h = harness();
    h.service
        .start_kernel(&h.user, &h.document_id)
        .await
        .expect("start");

    timeout(TEST_TIMEOUT, h.service.on_user_deleted(h.user.clone()))
        .await
        .expect("hook timed out")
        .expect("hook task");

    assert!(h.launcher.all_stopped());
    assert_eq!(h.service.manager().server_count().await, 0);
    assert_eq!(
        h.service
            .kernel_state(&h.user, &h.document_id, false)
            .await
            .expect("state"),
        KernelState::Off
    );
}

#[tokio::test]
async fn shutdown_refuses_later_runs() {
    let h = harness();
    h.add_cell("a", CellType::Code, "1").await;
    h.service
        .start_kernel(&h.user, &h.document_id)
        .await
        .expect("start");

    h.service.shutdown().await.expect("shutdown");

    assert!(h.launcher.all_stopped());
    let error = h
        .service
        .run_cell(&h.user, &h.document_id, &CellId::new("a"), "1")
        .await
        .expect_err("runs after shutdown fail");
    assert!(matches!(
        error,
        AppError::Runtime(NotebookRuntimeError::ShuttingDown)
    ));
}
