//! Build a document tree from a local documentation directory.

use super::{DocumentTreeNode, IndexDoc};
use anyhow::Context;
use std::path::Path;
use walkdir::WalkDir;

/// File names treated as a folder's index document, in priority order.
pub const DEFAULT_INDEX_NAMES: &[&str] = &["README.md", "index.md"];

const DOCUMENT_EXTENSIONS: &[&str] = &["md", "markdown"];

/// Walk `dir` and describe it as a [`DocumentTreeNode`].
///
/// Markdown files become leaves, directories become folders, and the first
/// file matching `index_names` (case-insensitive) becomes the folder's index.
/// Within a folder, files come before subfolders, each sorted
/// case-insensitively. Hidden entries and folders without any document are
/// skipped. Paths are relative to `dir` and use `/` separators.
pub fn scan_directory(dir: &Path, index_names: &[&str]) -> anyhow::Result<DocumentTreeNode> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    let title = dir
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "Docs".to_string());

    let mut root = scan_folder(dir, dir, index_names)?.unwrap_or_else(|| {
        DocumentTreeNode::folder(None, String::new(), None, Vec::new())
    });
    root.path = None;
    root.title = title;
    Ok(root)
}

fn scan_folder(
    root: &Path,
    folder: &Path,
    index_names: &[&str],
) -> anyhow::Result<Option<DocumentTreeNode>> {
    let mut files = Vec::new();
    let mut folders = Vec::new();

    let walker = WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .sort_by(|a, b| {
            a.file_name()
                .to_string_lossy()
                .to_lowercase()
                .cmp(&b.file_name().to_string_lossy().to_lowercase())
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to read {}", folder.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().is_dir() {
            folders.push(entry.into_path());
        } else if entry.file_type().is_file() && is_document(&name) {
            files.push((name, entry.into_path()));
        }
    }

    let index_position = index_names.iter().find_map(|wanted| {
        files
            .iter()
            .position(|(name, _)| name.eq_ignore_ascii_case(wanted))
    });
    let index = index_position.map(|position| {
        let (_, path) = files.remove(position);
        IndexDoc {
            path: relative(root, &path),
            title: folder_title(root, folder),
        }
    });

    let mut children: Vec<DocumentTreeNode> = files
        .iter()
        .map(|(name, path)| DocumentTreeNode::file(relative(root, path), file_title(name)))
        .collect();
    for sub in folders {
        if let Some(node) = scan_folder(root, &sub, index_names)? {
            children.push(node);
        }
    }

    if children.is_empty() && index.is_none() {
        return Ok(None);
    }

    let path = relative(root, folder);
    Ok(Some(DocumentTreeNode::folder(
        (!path.is_empty()).then_some(path),
        folder_title(root, folder),
        index,
        children,
    )))
}

fn is_document(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            DOCUMENT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn file_title(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string())
}

fn folder_title(root: &Path, folder: &Path) -> String {
    if folder == root {
        return String::new();
    }
    folder
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
