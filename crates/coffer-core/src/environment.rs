//! Per-project environment tree.
//!
//! Environments form a forest keyed by id. Parents are stored by id and the
//! ancestor chain is walked on every parent reassignment, so a cycle can never
//! be created. Value resolution walks from an environment up to its root.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{EnvironmentId, ProjectId};

static SLUG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap_or_else(|_| unreachable!()));

/// Maximum slug length.
pub const MAX_SLUG_LENGTH: usize = 64;

/// Validates an environment slug such as `staging` or `eu-west-1`.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the slug is empty, too long, or not
/// lowercase dash-separated alphanumerics.
pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() {
        return Err(Error::validation("environment slug cannot be empty"));
    }
    if slug.len() > MAX_SLUG_LENGTH {
        return Err(Error::validation(format!(
            "environment slug exceeds maximum length of {MAX_SLUG_LENGTH} characters"
        )));
    }
    if !SLUG_REGEX.is_match(slug) {
        return Err(Error::validation(format!(
            "environment slug '{slug}' must be lowercase alphanumerics separated by single dashes"
        )));
    }
    Ok(())
}

/// A node in a project's environment tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    /// Environment identifier.
    pub id: EnvironmentId,
    /// Owning project.
    pub project: ProjectId,
    /// Display name.
    pub name: String,
    /// URL-safe identifier, unique per project.
    pub slug: String,
    /// Environment values fall back to.
    pub parent: Option<EnvironmentId>,
    /// Locked environments refuse writes.
    pub locked: bool,
    /// Protected environments refuse deletion.
    pub protected: bool,
    /// Ordering within the project.
    pub position: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Arena of environments for every project.
#[derive(Debug, Default)]
pub struct EnvironmentGraph {
    nodes: RwLock<HashMap<EnvironmentId, Environment>>,
}

impl EnvironmentGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new environment.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for a bad slug or empty name
    /// - [`Error::Conflict`] if the slug is taken in the project
    /// - [`Error::NotFound`] if `parent` is not an environment of the project
    pub fn create(
        &self,
        project: ProjectId,
        name: &str,
        slug: &str,
        parent: Option<EnvironmentId>,
    ) -> Result<Environment> {
        validate_slug(slug)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("environment name cannot be empty"));
        }

        let mut nodes = self.nodes.write();
        if nodes.values().any(|e| e.project == project && e.slug == slug) {
            return Err(Error::conflict(format!(
                "environment slug '{slug}' already exists in project"
            )));
        }
        if let Some(parent) = parent {
            if !nodes.get(&parent).is_some_and(|p| p.project == project) {
                return Err(Error::not_found("environment", parent));
            }
        }
        let position = nodes
            .values()
            .filter(|e| e.project == project)
            .map(|e| e.position.saturating_add(1))
            .max()
            .unwrap_or(0);

        let env = Environment {
            id: EnvironmentId::new(),
            project,
            name: name.to_string(),
            slug: slug.to_string(),
            parent,
            locked: false,
            protected: false,
            position,
            created_at: Utc::now(),
        };
        nodes.insert(env.id, env.clone());
        drop(nodes);

        info!(project = %project, environment = %env.slug, "created environment");
        Ok(env)
    }

    /// Looks up an environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if it does not exist in the project.
    pub fn get(&self, project: ProjectId, id: EnvironmentId) -> Result<Environment> {
        self.nodes
            .read()
            .get(&id)
            .filter(|e| e.project == project)
            .cloned()
            .ok_or_else(|| Error::not_found("environment", id))
    }

    /// Looks up an environment by slug.
    #[must_use]
    pub fn find_by_slug(&self, project: ProjectId, slug: &str) -> Option<Environment> {
        self.nodes
            .read()
            .values()
            .find(|e| e.project == project && e.slug == slug)
            .cloned()
    }

    /// Returns `true` if the environment exists in the project.
    #[must_use]
    pub fn contains(&self, project: ProjectId, id: EnvironmentId) -> bool {
        self.nodes
            .read()
            .get(&id)
            .is_some_and(|e| e.project == project)
    }

    /// Lists the project's environments by position.
    #[must_use]
    pub fn list(&self, project: ProjectId) -> Vec<Environment> {
        let mut envs: Vec<Environment> = self
            .nodes
            .read()
            .values()
            .filter(|e| e.project == project)
            .cloned()
            .collect();
        envs.sort_by_key(|e| (e.position, e.created_at));
        envs
    }

    /// Direct children of an environment.
    #[must_use]
    pub fn children(&self, project: ProjectId, id: EnvironmentId) -> Vec<Environment> {
        let mut envs: Vec<Environment> = self
            .nodes
            .read()
            .values()
            .filter(|e| e.project == project && e.parent == Some(id))
            .cloned()
            .collect();
        envs.sort_by_key(|e| e.position);
        envs
    }

    /// Returns `[env, parent, grandparent, ..., root]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is unknown and [`Error::Conflict`]
    /// if the stored chain is corrupt.
    pub fn walk(&self, project: ProjectId, id: EnvironmentId) -> Result<Vec<Environment>> {
        let nodes = self.nodes.read();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !seen.insert(current) {
                return Err(Error::conflict(format!(
                    "environment chain of {id} contains a cycle"
                )));
            }
            let env = nodes
                .get(&current)
                .filter(|e| e.project == project)
                .ok_or_else(|| Error::not_found("environment", current))?;
            chain.push(env.clone());
            cursor = env.parent;
        }
        Ok(chain)
    }

    /// Moves an environment under a new parent, or to the root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if `parent` is the environment itself or
    /// one of its descendants.
    pub fn set_parent(
        &self,
        project: ProjectId,
        id: EnvironmentId,
        parent: Option<EnvironmentId>,
    ) -> Result<Environment> {
        let mut nodes = self.nodes.write();
        if !nodes.get(&id).is_some_and(|e| e.project == project) {
            return Err(Error::not_found("environment", id));
        }
        if let Some(parent) = parent {
            // Walk the proposed parent's ancestors; finding `id` means a cycle.
            let mut cursor = Some(parent);
            let mut steps = 0usize;
            while let Some(current) = cursor {
                if current == id {
                    return Err(Error::conflict(format!(
                        "setting parent {parent} on {id} would create a cycle"
                    )));
                }
                let node = nodes
                    .get(&current)
                    .filter(|e| e.project == project)
                    .ok_or_else(|| Error::not_found("environment", current))?;
                cursor = node.parent;
                steps += 1;
                if steps > nodes.len() {
                    return Err(Error::conflict("environment chain contains a cycle"));
                }
            }
        }

        let env = nodes
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("environment", id))?;
        env.parent = parent;
        Ok(env.clone())
    }

    /// Renames an environment. The slug is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty name.
    pub fn rename(&self, project: ProjectId, id: EnvironmentId, name: &str) -> Result<Environment> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("environment name cannot be empty"));
        }
        self.update(project, id, |e| e.name = name.to_string())
    }

    /// Locks or unlocks an environment for writes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the environment does not exist.
    pub fn set_locked(&self, project: ProjectId, id: EnvironmentId, locked: bool) -> Result<Environment> {
        self.update(project, id, |e| e.locked = locked)
    }

    /// Protects or unprotects an environment against deletion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the environment does not exist.
    pub fn set_protected(
        &self,
        project: ProjectId,
        id: EnvironmentId,
        protected: bool,
    ) -> Result<Environment> {
        self.update(project, id, |e| e.protected = protected)
    }

    /// Removes an environment that has no children.
    ///
    /// Callers must have checked that no version references it.
    pub(crate) fn remove(&self, project: ProjectId, id: EnvironmentId) -> Result<Environment> {
        let mut nodes = self.nodes.write();
        let env = nodes
            .get(&id)
            .filter(|e| e.project == project)
            .ok_or_else(|| Error::not_found("environment", id))?;
        if env.protected {
            return Err(Error::Forbidden {
                reason: format!("environment '{}' is protected", env.slug),
            });
        }
        if nodes.values().any(|e| e.parent == Some(id)) {
            return Err(Error::conflict(format!(
                "environment '{}' has child environments",
                env.slug
            )));
        }
        let removed = nodes
            .remove(&id)
            .ok_or_else(|| Error::not_found("environment", id))?;
        drop(nodes);

        info!(project = %project, environment = %removed.slug, "deleted environment");
        Ok(removed)
    }

    fn update(
        &self,
        project: ProjectId,
        id: EnvironmentId,
        apply: impl FnOnce(&mut Environment),
    ) -> Result<Environment> {
        let mut nodes = self.nodes.write();
        let env = nodes
            .get_mut(&id)
            .filter(|e| e.project == project)
            .ok_or_else(|| Error::not_found("environment", id))?;
        apply(env);
        Ok(env.clone())
    }
}
