use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const OUTPUT_TYPE_KEY: &str = "output_type";
const NAME_KEY: &str = "name";
const TEXT_KEY: &str = "text";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Stream,
    Result,
    Display,
    Error,
}

impl OutputType {
    /// Accepts both the kernel message type and the stored `output_type` tag.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stream" => Some(Self::Stream),
            "execute_result" | "result" => Some(Self::Result),
            "display_data" | "display" => Some(Self::Display),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One entry of a cell's output log. The payload is kept opaque apart from
/// the `output_type` tag and, for streams, `name` and `text`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputRecord(Map<String, Value>);

impl OutputRecord {
    pub fn from_content(output_type: &str, mut content: Map<String, Value>) -> Self {
        content.insert(
            OUTPUT_TYPE_KEY.to_owned(),
            Value::String(output_type.to_owned()),
        );
        Self(content)
    }

    pub fn stream(name: &str, text: &str) -> Self {
        let mut content = Map::new();
        content.insert(NAME_KEY.to_owned(), Value::String(name.to_owned()));
        content.insert(TEXT_KEY.to_owned(), Value::String(text.to_owned()));
        Self::from_content("stream", content)
    }

    pub fn output_type(&self) -> Option<&str> {
        self.0.get(OUTPUT_TYPE_KEY).and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<OutputType> {
        self.output_type().and_then(OutputType::parse)
    }

    pub fn is_stream(&self) -> bool {
        self.kind() == Some(OutputType::Stream)
    }

    pub fn stream_name(&self) -> Option<&str> {
        self.0.get(NAME_KEY).and_then(Value::as_str)
    }

    pub fn text(&self) -> Option<&str> {
        self.0.get(TEXT_KEY).and_then(Value::as_str)
    }

    pub fn set_text(&mut self, text: String) {
        self.0.insert(TEXT_KEY.to_owned(), Value::String(text));
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for OutputRecord {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{OutputRecord, OutputType};

    #[test]
    fn from_content_tags_record_with_message_type() {
        let content = json!({"data": {"text/plain": "2"}, "execution_count": 1});
        let record = OutputRecord::from_content(
            "execute_result",
            content.as_object().cloned().expect("object content"),
        );

        assert_eq!(record.output_type(), Some("execute_result"));
        assert_eq!(record.kind(), Some(OutputType::Result));
        assert!(!record.is_stream());
    }

    #[test]
    fn stream_records_expose_name_and_text() {
        let mut record = OutputRecord::stream("stdout", "hello");
        assert!(record.is_stream());
        assert_eq!(record.stream_name(), Some("stdout"));

        record.set_text("hello world".to_owned());
        assert_eq!(record.text(), Some("hello world"));
        assert_eq!(
            serde_json::to_value(&record).expect("serialize record"),
            json!({"output_type": "stream", "name": "stdout", "text": "hello world"})
        );
    }
}
