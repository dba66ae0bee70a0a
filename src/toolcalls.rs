use serde::Deserialize;

use crate::models::{ToolCallFunction, ToolCallRecord};

/// One streamed fragment of a tool call. Every field may be missing; the
/// server fragments a single call across many deltas and may send its
/// `id` only once.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub function: Option<ToolCallFunctionDelta>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ToolCallFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Accumulates streamed tool-call fragments into a dense ordered list of
/// complete records, keyed by the positional `index` the server supplies.
///
/// `id`, `type` and `function.name` take the latest non-empty value seen;
/// `function.arguments` is concatenated in arrival order. Fragments whose
/// index skips ahead leave placeholder records in the gap.
#[derive(Debug, Default)]
pub struct ToolCallBuffer {
    slots: Vec<ToolCallRecord>,
    touched: bool,
}

impl ToolCallBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one fragment. A missing index means "append a new call".
    pub fn apply_delta(&mut self, delta: &ToolCallDelta) {
        self.touched = true;
        let index = delta.index.unwrap_or(self.slots.len());
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, ToolCallRecord::default);
        }
        let slot = &mut self.slots[index];
        if let Some(id) = delta.id.as_deref().filter(|s| !s.is_empty()) {
            slot.id = id.to_string();
        }
        if let Some(kind) = delta.call_type.as_deref().filter(|s| !s.is_empty()) {
            slot.call_type = kind.to_string();
        }
        if let Some(function) = &delta.function {
            if let Some(name) = function.name.as_deref().filter(|s| !s.is_empty()) {
                slot.function.name = name.to_string();
            }
            if let Some(arguments) = &function.arguments {
                slot.function.arguments.push_str(arguments);
            }
        }
    }

    /// Replaces the buffer with calls delivered complete in one shot.
    pub fn replace(&mut self, calls: Vec<ToolCallRecord>) {
        self.touched = true;
        self.slots = calls;
    }

    /// The assembled calls, or `None` when no tool-call data ever arrived.
    pub fn into_calls(self) -> Option<Vec<ToolCallRecord>> {
        self.touched.then_some(self.slots)
    }
}
