//! Tool-call sub-protocol tracking.
//!
//! A turn may announce several tool invocations, possibly overlapping, in
//! between its text deltas. [`ToolCallTracker`] keeps one record per
//! invocation id and moves it from `Started` to `Completed` or `Failed`.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ToolCallState {
    Started,
    Completed { result: Option<serde_json::Value> },
    Failed { error: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub state: ToolCallState,
}

impl ToolInvocation {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, ToolCallState::Started)
    }
}

/// Lifecycle records for the tool invocations of one turn.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    invocations: Vec<ToolInvocation>,
    /// id -> position in `invocations`
    index: HashMap<String, usize>,
}

impl ToolCallTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a record. Returns `None` when the id is already known.
    pub fn on_start(
        &mut self,
        id: &str,
        name: &str,
        args: serde_json::Value,
    ) -> Option<&ToolInvocation> {
        if self.index.contains_key(id) {
            debug!("Ignoring duplicate tool_start id={id} name={name}");
            return None;
        }
        self.index.insert(id.to_string(), self.invocations.len());
        self.invocations.push(ToolInvocation {
            id: id.to_string(),
            name: name.to_string(),
            args,
            state: ToolCallState::Started,
        });
        self.invocations.last()
    }

    /// Close the matching record.
    ///
    /// An end for an unknown id (for example one that arrives after the turn
    /// was cancelled) or for an already closed record is ignored and yields
    /// `None`.
    pub fn on_end(
        &mut self,
        id: &str,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Option<&ToolInvocation> {
        let Some(&position) = self.index.get(id) else {
            debug!("Ignoring tool_end for unknown id={id}");
            return None;
        };
        let invocation = &mut self.invocations[position];
        if !invocation.is_open() {
            debug!("Ignoring repeated tool_end id={id}");
            return None;
        }
        invocation.state = match error {
            Some(error) => ToolCallState::Failed { error },
            None => ToolCallState::Completed { result },
        };
        Some(&self.invocations[position])
    }

    /// Whether any tool ran in this turn. Informational only.
    #[must_use]
    pub fn has_any_tool_run(&self) -> bool {
        !self.invocations.is_empty()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.invocations.iter().filter(|i| i.is_open()).count()
    }

    /// Ids of invocations that never received an end event.
    #[must_use]
    pub fn unfinished(&self) -> Vec<String> {
        self.invocations
            .iter()
            .filter(|i| i.is_open())
            .map(|i| i.id.clone())
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ToolInvocation> {
        self.index.get(id).map(|&position| &self.invocations[position])
    }

    /// All records in announcement order.
    #[must_use]
    pub fn invocations(&self) -> &[ToolInvocation] {
        &self.invocations
    }

    #[must_use]
    pub fn into_invocations(self) -> Vec<ToolInvocation> {
        self.invocations
    }
}
