//! Scoped tool roots: project first, then user.

use std::path::{Path, PathBuf};

/// Which scope a path was found under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Project,
    User,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::User => "user",
        }
    }
}

/// The ordered set of directories tools and lockfiles live under.
#[derive(Debug, Clone)]
pub struct ToolRoots {
    project: Option<PathBuf>,
    user: PathBuf,
}

impl ToolRoots {
    #[must_use]
    pub fn new(project: Option<PathBuf>, user: PathBuf) -> Self {
        Self { project, user }
    }

    /// Default layout: `./.kiwi` when present, `~/.kiwi` always.
    #[must_use]
    pub fn discover(working_dir: &Path) -> Self {
        let project = working_dir.join(".kiwi");
        let project = project.is_dir().then_some(project);
        let user = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kiwi");
        Self { project, user }
    }

    #[must_use]
    pub fn project_dir(&self) -> Option<&Path> {
        self.project.as_deref()
    }

    #[must_use]
    pub fn user_dir(&self) -> &Path {
        &self.user
    }

    /// Tool directories in search order.
    #[must_use]
    pub fn tool_dirs(&self) -> Vec<(Scope, PathBuf)> {
        let mut dirs = Vec::with_capacity(2);
        if let Some(project) = &self.project {
            dirs.push((Scope::Project, project.join("tools")));
        }
        dirs.push((Scope::User, self.user.join("tools")));
        dirs
    }

    /// Lockfile directory for a scope.
    #[must_use]
    pub fn lockfile_dir(&self, scope: Scope) -> Option<PathBuf> {
        match scope {
            Scope::Project => self.project.as_ref().map(|p| p.join("lockfiles")),
            Scope::User => Some(self.user.join("lockfiles")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{Scope, ToolRoots};

    #[test]
    fn project_scope_precedes_user_scope() {
        let roots = ToolRoots::new(Some(PathBuf::from("/proj/.kiwi")), PathBuf::from("/home/u/.kiwi"));
        let dirs = roots.tool_dirs();
        assert_eq!(dirs[0].0, Scope::Project);
        assert_eq!(dirs[0].1, PathBuf::from("/proj/.kiwi/tools"));
        assert_eq!(dirs[1].0, Scope::User);
    }

    #[test]
    fn missing_project_scope_leaves_user_only() {
        let roots = ToolRoots::new(None, PathBuf::from("/home/u/.kiwi"));
        assert_eq!(roots.tool_dirs().len(), 1);
        assert!(roots.lockfile_dir(Scope::Project).is_none());
        assert!(roots.lockfile_dir(Scope::User).is_some());
    }
}
