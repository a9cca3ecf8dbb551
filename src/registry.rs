//! Process-wide project lookup.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::project::{Project, SessionSettings};
use crate::protocol::is_valid_project_id;
use crate::storage::CloudStore;

/// Creates and owns one `Project` per validated id. Projects are created
/// lazily on first handshake and stay resident for the life of the
/// process.
pub struct ProjectRegistry {
    projects: DashMap<String, Arc<Project>>,
    settings: SessionSettings,
    store: Arc<dyn CloudStore>,
}

impl ProjectRegistry {
    pub fn new(settings: SessionSettings, store: Arc<dyn CloudStore>) -> Self {
        Self {
            projects: DashMap::new(),
            settings,
            store,
        }
    }

    /// Resolve `id`, creating the project on first valid reference.
    /// Invalid ids are rejected without creating anything and without an
    /// error reply; racing first-handshakes converge on a single instance.
    pub fn get_or_create(&self, id: &str) -> Option<Arc<Project>> {
        if let Some(project) = self.projects.get(id) {
            return Some(project.value().clone());
        }
        if !is_valid_project_id(id) {
            debug!(project = %id, "rejected handshake for invalid project id");
            return None;
        }
        let project = self
            .projects
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Project::new(
                    id.to_string(),
                    self.settings.clone(),
                    self.store.clone(),
                ))
            })
            .value()
            .clone();
        Some(project)
    }
}
