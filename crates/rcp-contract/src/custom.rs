// SPDX-License-Identifier: MIT OR Apache-2.0
//! Registry of named custom constraint validators.

use crate::ToolCallContext;
use std::collections::HashMap;
use std::sync::Arc;

/// A named, opaque constraint rule consulted for `custom` constraints.
pub trait CustomRule: Send + Sync {
    /// Check the call context. Return `Err(reason)` to block the call.
    ///
    /// # Errors
    ///
    /// The reason string ends up in the violation message verbatim.
    fn check(&self, ctx: &ToolCallContext<'_>, params: &serde_json::Value)
        -> Result<(), String>;
}

/// Named validators available to `custom` constraint rules.
///
/// A contract may reference validators that are not registered; those rules
/// are skipped with a warning rather than failing the run.
#[derive(Default, Clone)]
pub struct CustomRuleRegistry {
    rules: HashMap<String, Arc<dyn CustomRule>>,
}

impl CustomRuleRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator under `name`, replacing any previous one.
    pub fn register<R: CustomRule + 'static>(&mut self, name: impl Into<String>, rule: R) {
        self.rules.insert(name.into(), Arc::new(rule));
    }

    /// Look up a validator by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn CustomRule>> {
        self.rules.get(name).cloned()
    }

    /// Names of all registered validators, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CustomRuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomRuleRegistry")
            .field("rules", &self.names())
            .finish()
    }
}
