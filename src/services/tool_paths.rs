use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;

/// Logical tool name to resolved remote path. Entries are written once per
/// resolution and only ever removed through `invalidate`.
#[derive(Debug, Default)]
pub struct ToolPathCache {
    entries: DashMap<String, String>,
}

impl ToolPathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tool: &str) -> Option<String> {
        self.entries.get(tool).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, tool: &str, path: &str) {
        self.entries.insert(tool.to_string(), path.to_string());
    }

    pub fn invalidate(&self, tool: &str) -> bool {
        self.entries.remove(tool).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Value {
        let ordered: BTreeMap<String, String> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        serde_json::json!(ordered)
    }
}
