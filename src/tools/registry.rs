//! Immutable name->tool registry with allowlist filtering.
//!
//! Built once at startup and frozen. Per-fiche allowlists are applied at
//! bind time; tests inject their own tool set by constructing a fresh
//! registry, never by mutating this one.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::llm::ToolDefinition;
use crate::tools::Tool;

pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder {
            tools: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Resolve an allowlist into concrete tools. A bare `"*"` entry expands
    /// to the full registry; unknown names are skipped (a fiche whose
    /// allowlist references a tool this installation lacks still runs).
    pub fn bind(&self, allowed: &[String]) -> Vec<Arc<dyn Tool>> {
        if allowed.iter().any(|name| name == "*") {
            return self.tools.values().cloned().collect();
        }
        allowed
            .iter()
            .filter_map(|name| self.tools.get(name).cloned())
            .collect()
    }

    /// Tool definitions for the LLM binding, filtered by allowlist.
    pub fn definitions(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        self.bind(allowed).iter().map(|t| t.definition()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::EchoTool;

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .register(Arc::new(EchoTool))
            .build()
    }

    #[test]
    fn wildcard_expands_to_everything() {
        let registry = registry();
        let bound = registry.bind(&["*".to_string()]);
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].name(), "echo");
    }

    #[test]
    fn allowlist_filters_and_skips_unknown() {
        let registry = registry();
        let bound = registry.bind(&["echo".to_string(), "nonexistent".to_string()]);
        assert_eq!(bound.len(), 1);

        let none = registry.bind(&[]);
        assert!(none.is_empty());
    }

    #[test]
    fn definitions_match_bound_tools() {
        let registry = registry();
        let defs = registry.definitions(&["*".to_string()]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert!(defs[0].parameters.is_object());
    }
}
