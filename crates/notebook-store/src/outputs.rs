use notebook_protocol::OutputRecord;

use crate::normalize::fixlines;

/// Folds one streamed record into a cell's output log.
///
/// Stream text is concatenated onto the first earlier stream record with the
/// same name and renormalized there; anything else is appended.
pub fn merge_output(outputs: &mut Vec<OutputRecord>, mut record: OutputRecord) {
    if record.is_stream() {
        let incoming = record.text().unwrap_or_default().to_owned();
        let existing = record.stream_name().and_then(|name| {
            outputs
                .iter_mut()
                .find(|output| output.is_stream() && output.stream_name() == Some(name))
        });
        if let Some(existing) = existing {
            let mut combined = existing.text().unwrap_or_default().to_owned();
            combined.push_str(&incoming);
            existing.set_text(fixlines(&combined));
            return;
        }
        record.set_text(fixlines(&incoming));
    }
    outputs.push(record);
}

#[cfg(test)]
mod tests {
    use notebook_protocol::OutputRecord;
    use serde_json::json;

    use super::merge_output;

    #[test]
    fn same_named_streams_coalesce_into_one_record() {
        let mut outputs = Vec::new();
        merge_output(&mut outputs, OutputRecord::stream("stdout", "10%\r"));
        merge_output(&mut outputs, OutputRecord::stream("stdout", "100%\r\nok\x08K\n"));

        assert_eq!(outputs, vec![OutputRecord::stream("stdout", "100%\r\noK\n")]);
    }

    #[test]
    fn different_stream_names_and_rich_outputs_append() {
        let mut outputs = Vec::new();
        merge_output(&mut outputs, OutputRecord::stream("stdout", "a"));
        merge_output(&mut outputs, OutputRecord::stream("stderr", "b"));
        let result: OutputRecord = serde_json::from_value(json!({
            "output_type": "execute_result",
            "data": {"text/plain": "3"},
        }))
        .expect("result record");
        merge_output(&mut outputs, result.clone());
        merge_output(&mut outputs, OutputRecord::stream("stdout", "c"));

        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].text(), Some("ac"));
        assert_eq!(outputs[1].stream_name(), Some("stderr"));
        assert_eq!(outputs[2], result);
    }

    #[test]
    fn first_stream_record_is_normalized_on_insert() {
        let mut outputs = Vec::new();
        merge_output(&mut outputs, OutputRecord::stream("stdout", "ab\x08c"));
        assert_eq!(outputs[0].text(), Some("ac"));
    }
}
