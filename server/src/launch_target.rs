//! Discovering what the server can be pointed at inside a workspace.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::Serialize;

/// Directories never searched for projects.
const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git", "bower_components"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchTargetKind {
    Solution,
    ProjectJson,
    Folder,
    Csx,
}

/// A solution, project or folder the server can be launched with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchTarget {
    pub label: String,
    pub description: String,
    pub directory: PathBuf,
    /// Passed to the server as `-s <target>`.
    pub target: PathBuf,
    pub kind: LaunchTargetKind,
}

impl LaunchTarget {
    #[must_use]
    pub fn new(
        kind: LaunchTargetKind,
        target: PathBuf,
        directory: PathBuf,
        label: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            description: String::new(),
            directory,
            target,
            kind,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Solution,
    CsProj,
    ProjectJson,
    Csx,
}

const FILE_PATTERNS: &[(&str, FileKind)] = &[
    ("*.sln", FileKind::Solution),
    ("*.csproj", FileKind::CsProj),
    ("project.json", FileKind::ProjectJson),
    ("*.csx", FileKind::Csx),
];

fn build_matcher() -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for (pattern, _) in FILE_PATTERNS {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    builder.build()
}

/// Find launch targets under `root`, looking at no more than `max_results`
/// candidate files.
///
/// A missing or unreadable root yields no targets.
#[must_use]
pub fn find_launch_targets(root: &Path, max_results: usize) -> Vec<LaunchTarget> {
    if !root.is_dir() {
        return Vec::new();
    }
    let matcher = match build_matcher() {
        Ok(matcher) => matcher,
        Err(e) => {
            tracing::warn!("invalid project pattern: {e}");
            return Vec::new();
        }
    };

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| {
            let excluded = entry.file_type().is_some_and(|ft| ft.is_dir())
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| EXCLUDED_DIRS.contains(&name));
            !excluded
        })
        .build();

    let mut found = Vec::new();
    for entry in walker {
        if found.len() >= max_results {
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let Some(name) = entry.path().file_name() else {
            continue;
        };
        if let Some(&index) = matcher.matches(name).first() {
            found.push((entry.into_path(), FILE_PATTERNS[index].1));
        }
    }

    select(&found, root)
}

fn relative_description(dir: &Path, root: &Path) -> String {
    dir.strip_prefix(root)
        .map_or_else(|_| dir.display().to_string(), |rel| rel.display().to_string())
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Turn discovered files into targets.
///
/// Solutions count only when the workspace has C# projects. Every
/// `project.json` is a target. The root folder is added when there are C#
/// projects but no solution, or `project.json` files that are not at the
/// root. Any script file adds a single script target for the root.
fn select(files: &[(PathBuf, FileKind)], root: &Path) -> Vec<LaunchTarget> {
    let has_csproj = files.iter().any(|(_, kind)| *kind == FileKind::CsProj);
    let mut targets = Vec::new();
    let mut has_sln = false;
    let mut has_project_json = false;
    let mut has_project_json_at_root = false;
    let mut has_csx = false;

    for (path, kind) in files {
        let dir = path.parent().unwrap_or(root).to_path_buf();
        match kind {
            FileKind::Solution if has_csproj => {
                has_sln = true;
                targets.push(
                    LaunchTarget::new(
                        LaunchTargetKind::Solution,
                        path.clone(),
                        dir.clone(),
                        basename(path),
                    )
                    .with_description(relative_description(&dir, root)),
                );
            }
            FileKind::ProjectJson => {
                has_project_json = true;
                has_project_json_at_root |= dir == root;
                targets.push(
                    LaunchTarget::new(
                        LaunchTargetKind::ProjectJson,
                        dir.clone(),
                        dir.clone(),
                        basename(path),
                    )
                    .with_description(relative_description(&dir, root)),
                );
            }
            FileKind::Csx => has_csx = true,
            FileKind::Solution | FileKind::CsProj => {}
        }
    }

    if (has_csproj && !has_sln) || (has_project_json && !has_project_json_at_root) {
        targets.push(LaunchTarget::new(
            LaunchTargetKind::Folder,
            root.to_path_buf(),
            root.to_path_buf(),
            basename(root),
        ));
    }

    if has_csx {
        targets.push(
            LaunchTarget::new(
                LaunchTargetKind::Csx,
                root.to_path_buf(),
                root.to_path_buf(),
                "CSX",
            )
            .with_description(basename(root)),
        );
    }

    targets.sort_by(|a, b| match a.directory.cmp(&b.directory) {
        Ordering::Equal => a.label.cmp(&b.label),
        other => other,
    });
    targets
}
