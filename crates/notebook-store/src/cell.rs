use std::fmt;
use std::str::FromStr;

use notebook_protocol::{CellId, DocumentId, OutputRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// `cell_index` value that means "after the last cell".
pub const APPEND_INDEX: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    #[default]
    Code,
    Markdown,
    Raw,
}

impl CellType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Markdown => "markdown",
            Self::Raw => "raw",
        }
    }

    pub fn is_code(self) -> bool {
        self == Self::Code
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellType {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "code" => Ok(Self::Code),
            "markdown" => Ok(Self::Markdown),
            "raw" => Ok(Self::Raw),
            other => Err(StoreError::Validation(format!(
                "unknown cell type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub document_id: DocumentId,
    pub cell_id: CellId,
    pub cell_index: i64,
    pub cell_type: CellType,
    pub source: String,
    pub metadata: Map<String, Value>,
    pub outputs: Vec<OutputRecord>,
}

/// One entry of a save batch. Absent fields are left untouched on update
/// and defaulted on create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CellPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<CellId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_type: Option<CellType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<OutputRecord>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
}

impl CellPatch {
    pub fn for_cell(cell_id: impl Into<CellId>) -> Self {
        Self {
            cell_id: Some(cell_id.into()),
            ..Self::default()
        }
    }

    pub fn delete(cell_id: impl Into<CellId>) -> Self {
        Self {
            cell_id: Some(cell_id.into()),
            delete: true,
            ..Self::default()
        }
    }

    pub fn with_index(mut self, cell_index: i64) -> Self {
        self.cell_index = Some(cell_index);
        self
    }

    pub fn with_type(mut self, cell_type: CellType) -> Self {
        self.cell_type = Some(cell_type);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputRecord>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn has_outputs(&self) -> bool {
        self.outputs.as_ref().is_some_and(|outputs| !outputs.is_empty())
    }

    /// Copies every present field except `cell_index` onto `cell`.
    pub(crate) fn apply_fields(&mut self, cell: &mut Cell) {
        if let Some(cell_type) = self.cell_type {
            cell.cell_type = cell_type;
        }
        if let Some(source) = self.source.take() {
            cell.source = source;
        }
        if let Some(metadata) = self.metadata.take() {
            cell.metadata = metadata;
        }
        if let Some(outputs) = self.outputs.take() {
            cell.outputs = outputs;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CellPatch, CellType};

    #[test]
    fn patch_deserializes_with_absent_fields() {
        let patch: CellPatch =
            serde_json::from_value(json!({"cell_id": "a", "cell_index": 0})).expect("patch");

        assert_eq!(patch, CellPatch::for_cell("a").with_index(0));
        assert!(patch.source.is_none());
        assert!(!patch.delete);
    }

    #[test]
    fn patch_rejects_unknown_fields_and_cell_types() {
        assert!(serde_json::from_value::<CellPatch>(json!({"sauce": "x"})).is_err());
        assert!(serde_json::from_value::<CellPatch>(json!({"cell_type": "sql"})).is_err());
        assert!(serde_json::from_value::<CellPatch>(json!({"metadata": [1, 2]})).is_err());
    }

    #[test]
    fn cell_type_parses_stored_values() {
        assert_eq!("markdown".parse::<CellType>(), Ok(CellType::Markdown));
        assert!("sql".parse::<CellType>().is_err());
        assert_eq!(CellType::default().as_str(), "code");
    }
}
