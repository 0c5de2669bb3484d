use notebook_protocol::{
    CELL_DELETE_EVENT, CELL_OUTPUTS_EVENT, CELL_UPDATE_EVENT, CellId, DocumentId, NotebookEvent,
    OutputRecord,
};
use serde_json::json;

use crate::cell::Cell;

/// Net effect of one mutation on one cell, in the order it was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum CellChange {
    Updated(Cell),
    Deleted {
        document_id: DocumentId,
        cell_id: CellId,
        cell_index: i64,
    },
    Outputs {
        document_id: DocumentId,
        cell_id: CellId,
        outputs: Vec<OutputRecord>,
    },
}

impl CellChange {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Updated(_) => CELL_UPDATE_EVENT,
            Self::Deleted { .. } => CELL_DELETE_EVENT,
            Self::Outputs { .. } => CELL_OUTPUTS_EVENT,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        match self {
            Self::Updated(cell) => &cell.document_id,
            Self::Deleted { document_id, .. } | Self::Outputs { document_id, .. } => document_id,
        }
    }

    pub fn cell_id(&self) -> &CellId {
        match self {
            Self::Updated(cell) => &cell.cell_id,
            Self::Deleted { cell_id, .. } | Self::Outputs { cell_id, .. } => cell_id,
        }
    }

    pub fn into_event(self) -> NotebookEvent {
        let event = self.event_name();
        match self {
            Self::Updated(cell) => NotebookEvent::new(
                event,
                cell.document_id,
                json!({
                    "cell_id": cell.cell_id,
                    "cell_index": cell.cell_index,
                    "cell_type": cell.cell_type,
                    "source": cell.source,
                    "metadata": cell.metadata,
                }),
            ),
            Self::Deleted {
                document_id,
                cell_id,
                cell_index,
            } => NotebookEvent::new(
                event,
                document_id,
                json!({"cell_id": cell_id, "cell_index": cell_index}),
            ),
            Self::Outputs {
                document_id,
                cell_id,
                outputs,
            } => NotebookEvent::new(
                event,
                document_id,
                json!({"cell_id": cell_id, "outputs": outputs}),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use notebook_protocol::{CellId, DocumentId, OutputRecord};
    use serde_json::{Map, json};

    use super::CellChange;
    use crate::cell::{Cell, CellType};

    #[test]
    fn update_event_omits_outputs() {
        let change = CellChange::Updated(Cell {
            document_id: DocumentId::new("doc"),
            cell_id: CellId::new("a"),
            cell_index: 2,
            cell_type: CellType::Markdown,
            source: "# title".to_owned(),
            metadata: Map::new(),
            outputs: vec![OutputRecord::stream("stdout", "hidden")],
        });

        let event = change.into_event();
        assert_eq!(event.event, "notebook_cell_update");
        assert_eq!(
            event.data,
            json!({
                "cell_id": "a",
                "cell_index": 2,
                "cell_type": "markdown",
                "source": "# title",
                "metadata": {},
            })
        );
    }

    #[test]
    fn outputs_event_carries_full_output_log() {
        let change = CellChange::Outputs {
            document_id: DocumentId::new("doc"),
            cell_id: CellId::new("a"),
            outputs: vec![OutputRecord::stream("stdout", "1\n")],
        };
        assert_eq!(change.cell_id().as_str(), "a");

        let event = change.into_event();
        assert_eq!(event.event, "notebook_cell_outputs");
        assert_eq!(
            event.data["outputs"],
            json!([{"output_type": "stream", "name": "stdout", "text": "1\n"}])
        );
    }
}
