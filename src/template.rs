//! Fixed chat template for instruction tuning.

use crate::corpus::Record;

/// Render a record as the training text.
///
/// The template is fixed: `<|user|>\n{instruction}\n<|assistant|>\n{response}`.
/// Fields are trimmed; empty fields produce the markers with empty bodies.
/// No escaping is applied.
pub fn format_example(record: &Record) -> String {
    format!(
        "<|user|>\n{}\n<|assistant|>\n{}",
        record.instruction.trim(),
        record.response.trim()
    )
}
