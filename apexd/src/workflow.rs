//! Workflow registry
//!
//! Workflows are ordered stage lists identified by name, defined
//! externally (config file); the registry only resolves them. A built-in
//! "default" workflow exists so a bare project can run tasks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Name of the built-in workflow
pub const DEFAULT_WORKFLOW: &str = "default";

/// An ordered list of named stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub stages: Vec<String>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, stages: Vec<String>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    /// Stage name at an index, if in range
    pub fn stage_at(&self, index: usize) -> Option<&str> {
        self.stages.get(index).map(String::as_str)
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Loaded map from workflow name to stage list
#[derive(Debug, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Workflow>,
}

impl WorkflowRegistry {
    /// Build from the config's `workflows:` map. Empty stage lists are
    /// dropped with a warning; the default workflow is added when absent.
    pub fn from_config(config: &HashMap<String, Vec<String>>) -> Self {
        let mut workflows = HashMap::new();
        for (name, stages) in config {
            if stages.is_empty() {
                warn!(workflow = %name, "ignoring workflow with no stages");
                continue;
            }
            workflows.insert(name.clone(), Workflow::new(name.clone(), stages.clone()));
        }

        workflows
            .entry(DEFAULT_WORKFLOW.to_string())
            .or_insert_with(|| {
                Workflow::new(
                    DEFAULT_WORKFLOW,
                    vec![
                        "planning".to_string(),
                        "implementation".to_string(),
                        "testing".to_string(),
                    ],
                )
            });

        Self { workflows }
    }

    /// Look up a workflow by name
    pub fn get(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    /// Look up a workflow, falling back to the default
    pub fn get_or_default(&self, name: &str) -> &Workflow {
        self.workflows
            .get(name)
            .unwrap_or_else(|| &self.workflows[DEFAULT_WORKFLOW])
    }

    /// All registered workflow names
    pub fn names(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::from_config(&HashMap::new())
    }
}
