//! Kernel channel message codec.

use notebook_protocol::{
    CellId, DocumentId, KernelState, NotebookRuntimeError, NotebookRuntimeResult, OutputRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

const CORRELATION_SEPARATOR: char = '_';

/// Message types that carry nothing the session acts on.
const IGNORED_MESSAGE_TYPES: &[&str] = &[
    "execute_input",
    "execute_reply",
    "clear_output",
    "update_display_data",
    "comm_open",
    "comm_msg",
    "comm_close",
    "kernel_info_reply",
    "shutdown_reply",
    "iopub_welcome",
    "debug_event",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_id: String,
    pub session: String,
    pub msg_type: String,
}

#[derive(Debug, Clone, Serialize)]
struct ExecuteContent<'a> {
    code: &'a str,
    silent: bool,
    allow_stdin: bool,
    stop_on_error: bool,
    store_history: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ExecuteRequest<'a> {
    header: &'a MessageHeader,
    parent_header: &'a MessageHeader,
    metadata: Map<String, Value>,
    channel: &'static str,
    buffers: Vec<Value>,
    content: ExecuteContent<'a>,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    msg_type: Option<String>,
    #[serde(default)]
    header: Option<InboundHeader>,
    #[serde(default)]
    parent_header: Option<InboundParentHeader>,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Default, Deserialize)]
struct InboundHeader {
    #[serde(default)]
    msg_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InboundParentHeader {
    #[serde(default)]
    msg_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelMessage {
    Status(KernelState),
    Output { cell_id: CellId, output: OutputRecord },
    Ignored(String),
}

/// Tags an execution with the cell it belongs to.
pub fn correlation_id(cell_id: &CellId) -> String {
    format!(
        "{cell_id}{CORRELATION_SEPARATOR}{}",
        Uuid::new_v4().simple()
    )
}

/// Recovers the cell id from a correlation id built by [`correlation_id`].
pub fn cell_from_correlation(msg_id: &str) -> Option<CellId> {
    let (cell_id, _) = msg_id.rsplit_once(CORRELATION_SEPARATOR)?;
    (!cell_id.is_empty()).then(|| CellId::new(cell_id))
}

/// Encodes one shell-channel execute request.
///
/// Silent requests use a bare id so any output they produce is not
/// attributed to a cell.
pub fn encode_execute_request(
    session: &DocumentId,
    msg_id: String,
    code: &str,
    silent: bool,
) -> NotebookRuntimeResult<String> {
    let header = MessageHeader {
        msg_id,
        session: session.as_str().to_owned(),
        msg_type: "execute_request".to_owned(),
    };
    let mut metadata = Map::new();
    metadata.insert("recordTiming".to_owned(), Value::Bool(false));
    metadata.insert("deletedCells".to_owned(), Value::Array(Vec::new()));

    let request = ExecuteRequest {
        header: &header,
        parent_header: &header,
        metadata,
        channel: "shell",
        buffers: Vec::new(),
        content: ExecuteContent {
            code,
            silent,
            allow_stdin: false,
            stop_on_error: true,
            store_history: !silent,
        },
    };
    serde_json::to_string(&request).map_err(|error| {
        NotebookRuntimeError::Internal(format!("failed to encode execute request: {error}"))
    })
}

pub fn silent_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Decodes one text frame from the kernel channel.
pub fn decode_message(text: &str) -> NotebookRuntimeResult<KernelMessage> {
    let message: InboundMessage = serde_json::from_str(text).map_err(|error| {
        NotebookRuntimeError::Protocol(format!("kernel message is not valid JSON: {error}"))
    })?;
    let msg_type = message
        .msg_type
        .or_else(|| message.header.and_then(|header| header.msg_type))
        .ok_or_else(|| {
            NotebookRuntimeError::Protocol("kernel message has no msg_type".to_owned())
        })?;

    if msg_type == "status" {
        let execution_state = message
            .content
            .get("execution_state")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                NotebookRuntimeError::Protocol(
                    "status message has no execution_state".to_owned(),
                )
            })?;
        return KernelState::from_execution_state(execution_state)
            .map(KernelMessage::Status)
            .ok_or_else(|| {
                NotebookRuntimeError::Protocol(format!(
                    "unknown execution_state '{execution_state}'"
                ))
            });
    }

    if matches!(
        msg_type.as_str(),
        "stream" | "execute_result" | "display_data" | "error"
    ) {
        let Value::Object(content) = message.content else {
            return Err(NotebookRuntimeError::Protocol(format!(
                "{msg_type} message content is not an object"
            )));
        };
        let parent_id = message
            .parent_header
            .and_then(|parent| parent.msg_id)
            .unwrap_or_default();
        let cell_id = cell_from_correlation(&parent_id).ok_or_else(|| {
            NotebookRuntimeError::Protocol(format!(
                "{msg_type} message parent '{parent_id}' does not name a cell"
            ))
        })?;
        return Ok(KernelMessage::Output {
            cell_id,
            output: OutputRecord::from_content(&msg_type, content),
        });
    }

    if IGNORED_MESSAGE_TYPES.contains(&msg_type.as_str()) {
        return Ok(KernelMessage::Ignored(msg_type));
    }

    Err(NotebookRuntimeError::Protocol(format!(
        "unrecognized kernel message type '{msg_type}'"
    )))
}

#[cfg(test)]
mod tests {
    use notebook_protocol::{CellId, DocumentId, KernelState, NotebookRuntimeError};
    use serde_json::{Value, json};

    use super::{
        KernelMessage, cell_from_correlation, correlation_id, decode_message,
        encode_execute_request,
    };

    #[test]
    fn correlation_ids_round_trip_cell_ids_with_separators() {
        let cell_id = CellId::new("cell_with_underscores");
        let msg_id = correlation_id(&cell_id);

        assert!(msg_id.starts_with("cell_with_underscores_"));
        assert_eq!(cell_from_correlation(&msg_id), Some(cell_id));
        assert_eq!(cell_from_correlation("0f1e2d3c"), None);
        assert_eq!(cell_from_correlation("_abc"), None);
    }

    #[test]
    fn execute_request_matches_channel_shape() {
        let encoded = encode_execute_request(
            &DocumentId::new("doc-1"),
            "a_123".to_owned(),
            "print(1)",
            false,
        )
        .expect("encode request");
        let value: Value = serde_json::from_str(&encoded).expect("valid json");

        assert_eq!(value["channel"], "shell");
        assert_eq!(value["header"]["msg_id"], "a_123");
        assert_eq!(value["header"]["session"], "doc-1");
        assert_eq!(value["header"]["msg_type"], "execute_request");
        assert_eq!(value["parent_header"], value["header"]);
        assert_eq!(
            value["content"],
            json!({
                "code": "print(1)",
                "silent": false,
                "allow_stdin": false,
                "stop_on_error": true,
                "store_history": true,
            })
        );
    }

    #[test]
    fn status_messages_decode_to_states() {
        let decoded = decode_message(
            &json!({"msg_type": "status", "content": {"execution_state": "busy"}}).to_string(),
        )
        .expect("decode status");
        assert_eq!(decoded, KernelMessage::Status(KernelState::Busy));
    }

    #[test]
    fn output_messages_are_attributed_to_cells() {
        let decoded = decode_message(
            &json!({
                "header": {"msg_id": "x", "session": "s", "msg_type": "stream"},
                "msg_type": "stream",
                "parent_header": {"msg_id": "cell-9_0011"},
                "content": {"name": "stdout", "text": "hi\n"},
            })
            .to_string(),
        )
        .expect("decode stream");

        match decoded {
            KernelMessage::Output { cell_id, output } => {
                assert_eq!(cell_id.as_str(), "cell-9");
                assert_eq!(output.output_type(), Some("stream"));
                assert_eq!(output.text(), Some("hi\n"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn msg_type_falls_back_to_header() {
        let decoded = decode_message(
            &json!({
                "header": {"msg_id": "x", "session": "s", "msg_type": "execute_reply"},
                "content": {},
            })
            .to_string(),
        )
        .expect("decode reply");
        assert_eq!(decoded, KernelMessage::Ignored("execute_reply".to_owned()));
    }

    #[test]
    fn malformed_and_unknown_messages_are_protocol_errors() {
        for text in [
            "not json".to_owned(),
            json!({"content": {}}).to_string(),
            json!({"msg_type": "status", "content": {}}).to_string(),
            json!({"msg_type": "status", "content": {"execution_state": "asleep"}}).to_string(),
            json!({"msg_type": "teleport", "content": {}}).to_string(),
            json!({"msg_type": "stream", "parent_header": {}, "content": {"name": "stdout"}})
                .to_string(),
            json!({"msg_type": "error", "parent_header": {"msg_id": "a_1"}, "content": "boom"})
                .to_string(),
        ] {
            assert!(
                matches!(decode_message(&text), Err(NotebookRuntimeError::Protocol(_))),
                "{text}"
            );
        }
    }
}
