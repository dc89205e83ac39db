//! Script discovery and identity resolution.
//!
//! Scripts live in a scripts directory. `<scripts>/<name>.sh` is a direct
//! script (group [`ROOT_GROUP`]) that runs in the workspace root;
//! `<scripts>/<group>/<name>.sh` runs in `<workspace>/<group>`, and is only
//! offered when that workspace directory exists.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{RunboardError, RunboardResult};

/// Group name used for scripts placed directly in the scripts directory.
pub const ROOT_GROUP: &str = "_root";

const SCRIPT_EXT: &str = "sh";

/// Logical identity of a script, independent of any particular run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptIdentity {
    pub group: String,
    pub name: String,
}

impl ScriptIdentity {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.group == ROOT_GROUP
    }
}

impl fmt::Display for ScriptIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// One discoverable script.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScriptEntry {
    pub repo_name: String,
    pub script_name: String,
    pub path: PathBuf,
    pub is_direct_script: bool,
}

/// Filesystem locations a script run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScript {
    pub script_path: PathBuf,
    pub working_dir: PathBuf,
}

/// Finds scripts on disk and resolves identities to launchable paths.
#[derive(Debug, Clone)]
pub struct ScriptCatalog {
    scripts_dir: PathBuf,
    workspace: PathBuf,
}

impl ScriptCatalog {
    pub fn new(scripts_dir: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            workspace: workspace.into(),
        }
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// List direct scripts first, then grouped scripts whose workspace exists.
    pub fn list(&self) -> RunboardResult<Vec<ScriptEntry>> {
        let mut direct = Vec::new();
        let mut groups = Vec::new();

        for entry in std::fs::read_dir(&self.scripts_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() {
                groups.push(file_name);
            } else if !file_name.starts_with('.') {
                if let Some(stem) = script_stem(&file_name) {
                    direct.push(ScriptEntry {
                        repo_name: ROOT_GROUP.to_string(),
                        script_name: stem.to_string(),
                        path: entry.path(),
                        is_direct_script: true,
                    });
                }
            }
        }
        direct.sort_by(|a, b| a.script_name.cmp(&b.script_name));
        groups.sort();

        let mut scripts = direct;
        for group in groups {
            let workspace_dir = self.workspace.join(&group);
            if !workspace_dir.is_dir() {
                warn!(group = %group, workspace = %workspace_dir.display(), "group has no workspace directory, skipping");
                continue;
            }
            let mut grouped = Vec::new();
            for entry in std::fs::read_dir(self.scripts_dir.join(&group))? {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if let Some(stem) = script_stem(&file_name) {
                    grouped.push(ScriptEntry {
                        repo_name: group.clone(),
                        script_name: stem.to_string(),
                        path: entry.path(),
                        is_direct_script: false,
                    });
                }
            }
            grouped.sort_by(|a, b| a.script_name.cmp(&b.script_name));
            scripts.extend(grouped);
        }

        Ok(scripts)
    }

    /// Resolve an identity to its script file and working directory.
    ///
    /// Fails with `WorkspaceNotFound` when a grouped script has no workspace
    /// directory, and with `ScriptNotFound` when the script file is absent.
    pub fn resolve(&self, identity: &ScriptIdentity) -> RunboardResult<ResolvedScript> {
        let file_name = format!("{}.{SCRIPT_EXT}", identity.name);
        let resolved = if identity.is_direct() {
            ResolvedScript {
                script_path: self.scripts_dir.join(file_name),
                working_dir: self.workspace.clone(),
            }
        } else {
            let working_dir = self.workspace.join(&identity.group);
            if !working_dir.is_dir() {
                return Err(RunboardError::WorkspaceNotFound(
                    working_dir.display().to_string(),
                ));
            }
            ResolvedScript {
                script_path: self.scripts_dir.join(&identity.group).join(file_name),
                working_dir,
            }
        };

        if !resolved.script_path.is_file() {
            return Err(RunboardError::ScriptNotFound(identity.to_string()));
        }
        Ok(resolved)
    }
}

fn script_stem(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(SCRIPT_EXT)
        .and_then(|s| s.strip_suffix('.'))
        .filter(|s| !s.is_empty())
}
