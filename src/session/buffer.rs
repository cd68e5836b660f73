use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Cursor or selection range in the host editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

/// The host editor's rich-text buffer. Content is opaque to the core.
pub trait EditorBuffer: Send + Sync {
    fn content(&self) -> serde_json::Value;

    /// Replace the whole content. Must not fire the host's own change
    /// detection.
    fn replace_content(&self, content: serde_json::Value);

    fn selection(&self) -> Option<Selection>;

    fn set_selection(&self, selection: Option<Selection>);
}

#[derive(Debug)]
struct MemoryBufferState {
    content: serde_json::Value,
    selection: Option<Selection>,
    replacements: usize,
}

/// Headless buffer for tests and non-UI consumers.
#[derive(Debug)]
pub struct MemoryBuffer {
    state: Mutex<MemoryBufferState>,
}

impl MemoryBuffer {
    pub fn new(content: serde_json::Value) -> Self {
        Self {
            state: Mutex::new(MemoryBufferState {
                content,
                selection: None,
                replacements: 0,
            }),
        }
    }

    /// How many times the content was replaced wholesale.
    pub fn replacements(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).replacements
    }
}

impl EditorBuffer for MemoryBuffer {
    fn content(&self) -> serde_json::Value {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).content.clone()
    }

    fn replace_content(&self, content: serde_json::Value) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.content = content;
        state.replacements += 1;
    }

    fn selection(&self) -> Option<Selection> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).selection
    }

    fn set_selection(&self, selection: Option<Selection>) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).selection = selection;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replacing_content_keeps_the_selection() {
        let buffer = MemoryBuffer::new(json!({"text": "a"}));
        buffer.set_selection(Some(Selection { anchor: 1, head: 1 }));

        buffer.replace_content(json!({"text": "ab"}));

        assert_eq!(buffer.content(), json!({"text": "ab"}));
        assert_eq!(buffer.selection(), Some(Selection { anchor: 1, head: 1 }));
        assert_eq!(buffer.replacements(), 1);
    }
}
