//! Turning selected file diffs back into tree edits.
//!
//! Text files are rendered as one unified patch (hunk headers renumbered for
//! the subset being applied) and applied with libgit2. Pointer files are
//! replaced blob-for-blob through a tree update.

use git2::build::TreeUpdateBuilder;
use git2::{Diff, ErrorClass, ErrorCode, Oid, Repository};

use super::hunk::{applicable_header, header_is_change, parse_hunk_header};
use super::{FileDiff, Selection};
use crate::error::{Error, Result};

/// Files and hunks NOT in `selection`; the inverse of selecting.
pub fn exclude(files: &[FileDiff], selection: &Selection) -> Vec<FileDiff> {
    files
        .iter()
        .filter(|file| !file.is_hidden)
        .filter_map(|file| {
            let file_selected = selection.contains(&file.id);
            let any_hunk = file.hunks.iter().any(|h| selection.contains(&h.id));

            if file.opaque.is_some() {
                return (!file_selected && !any_hunk).then(|| file.clone());
            }

            let mut kept = file.clone();
            let (hunks, texts): (Vec<_>, Vec<_>) = file
                .hunks
                .iter()
                .cloned()
                .zip(file.hunk_texts.iter().cloned())
                .filter(|(hunk, _)| !selection.contains(&hunk.id))
                .unzip();
            kept.hunks = hunks;
            kept.hunk_texts = texts;

            let header_only = !file_selected && !any_hunk && header_is_change(&file.header);
            (!kept.hunks.is_empty() || header_only).then_some(kept)
        })
        .collect()
}

/// Unified patch text for the text files in `files`.
pub fn render_patch(files: &[FileDiff]) -> String {
    let mut out = String::new();
    for file in files {
        if file.is_hidden || file.opaque.is_some() {
            continue;
        }
        if file.hunk_texts.is_empty() && !header_is_change(&file.header) {
            continue;
        }

        out.push_str(&applicable_header(&file.header));
        let mut offset: i64 = 0;
        for body in &file.hunk_texts {
            out.push_str(&renumber(body, &mut offset));
        }
    }
    out
}

/// Rewrite a hunk's new-side start so it only accounts for hunks applied before it.
fn renumber(body: &str, offset: &mut i64) -> String {
    let (first, rest) = match body.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (body, ""),
    };
    let Some((range, section)) = parse_hunk_header(first) else {
        return body.to_string();
    };

    let old_start = i64::from(range.old_start);
    let new_start = if range.old_lines == 0 {
        old_start + *offset + 1
    } else if range.new_lines == 0 {
        old_start + *offset - 1
    } else {
        old_start + *offset
    }
    .max(0);
    *offset += i64::from(range.new_lines) - i64::from(range.old_lines);

    format!(
        "@@ -{},{} +{},{} @@{}\n{}",
        range.old_start, range.old_lines, new_start, range.new_lines, section, rest
    )
}

/// Apply `files` on top of `base_tree` and return the resulting tree.
///
/// Fails with `Conflict` when a hunk's context is not found or a pointer
/// file changed underneath.
pub fn apply_to_tree(repo: &Repository, base_tree: Oid, files: &[FileDiff]) -> Result<Oid> {
    let mut tree_id = base_tree;

    let text = render_patch(files);
    if !text.is_empty() {
        let diff = Diff::from_buffer(text.as_bytes())?;
        let base = repo.find_tree(base_tree)?;
        let mut index = repo
            .apply_to_tree(&base, &diff, None)
            .map_err(conflict_or_git)?;
        tree_id = index.write_tree_to(repo)?;
    }

    let opaque: Vec<_> = files
        .iter()
        .filter(|file| !file.is_hidden)
        .filter_map(|file| file.opaque.as_ref())
        .collect();
    if opaque.is_empty() {
        return Ok(tree_id);
    }

    let tree = repo.find_tree(tree_id)?;
    let mut builder = TreeUpdateBuilder::new();
    for change in opaque {
        if let Some(old_path) = &change.old_path {
            let current = tree
                .get_path(std::path::Path::new(old_path))
                .ok()
                .map(|entry| entry.id());
            if current != change.old_blob {
                return Err(Error::Conflict(format!("{old_path} changed on target")));
            }
            builder.remove(old_path.as_str());
        }
        if let (Some(new_path), Some((blob, mode))) = (&change.new_path, change.new_blob) {
            builder.upsert(new_path.as_str(), blob, mode);
        }
    }
    Ok(builder.create_updated(repo, &tree)?)
}

fn conflict_or_git(err: git2::Error) -> Error {
    if err.code() == ErrorCode::ApplyFail || err.class() == ErrorClass::Patch {
        Error::Conflict(format!("selection does not apply: {}", err.message()))
    } else {
        Error::Git(err)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{diff_trees, Decorator};
    use super::*;
    use crate::git;
    use git2::FileMode;
    use tempfile::TempDir;

    fn tree(repo: &Repository, files: &[(&str, &str)]) -> Oid {
        let mut builder = TreeUpdateBuilder::new();
        for (path, content) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            builder.upsert(*path, blob, FileMode::Blob);
        }
        let empty = repo.find_tree(git::empty_tree(repo).unwrap()).unwrap();
        builder.create_updated(repo, &empty).unwrap()
    }

    fn read(repo: &Repository, tree: Oid, path: &str) -> Option<String> {
        let tree = repo.find_tree(tree).unwrap();
        let entry = tree.get_path(std::path::Path::new(path)).ok()?;
        let blob = repo.find_blob(entry.id()).unwrap();
        Some(String::from_utf8(blob.content().to_vec()).unwrap())
    }

    const BASE: &str = "1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n11\n12\n13\n14\n15\n";

    #[test]
    fn applies_a_subset_of_hunks() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let base = tree(&repo, &[("n.txt", BASE)]);
        let edited = tree(
            &repo,
            &[("n.txt", &BASE.replace("2\n", "two\n").replace("14\n", "fourteen\n"))],
        );

        let files = diff_trees(&repo, Some(base), Some(edited), 1, &Decorator::new()).unwrap();
        assert_eq!(files[0].hunks.len(), 2);

        let second: Selection = [files[0].hunks[1].id.clone()].into_iter().collect();
        let picked = diff_trees(
            &repo,
            Some(base),
            Some(edited),
            1,
            &Decorator::new().with_selection(&second),
        )
        .unwrap();

        let result = apply_to_tree(&repo, base, &picked).unwrap();
        let content = read(&repo, result, "n.txt").unwrap();
        assert!(content.contains("fourteen\n"));
        assert!(content.contains("\n2\n"));

        let rest = exclude(&files, &second);
        assert_eq!(rest[0].hunks.len(), 1);
        let full = apply_to_tree(&repo, result, &rest).unwrap();
        assert_eq!(full, edited);
    }

    #[test]
    fn pure_rename_applies_from_header() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let base = tree(&repo, &[("test.txt", "keep me\n")]);
        let renamed = tree(&repo, &[("test-2.txt", "keep me\n")]);

        let files = diff_trees(&repo, Some(base), Some(renamed), 3, &Decorator::new()).unwrap();
        let result = apply_to_tree(&repo, base, &files).unwrap();
        assert_eq!(read(&repo, result, "test.txt"), None);
        assert_eq!(read(&repo, result, "test-2.txt").as_deref(), Some("keep me\n"));
    }

    #[test]
    fn overlapping_edit_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let base = tree(&repo, &[("a.txt", "line\n")]);
        let ours = tree(&repo, &[("a.txt", "ours\n")]);
        let theirs = tree(&repo, &[("a.txt", "theirs\n")]);

        let files = diff_trees(&repo, Some(base), Some(ours), 3, &Decorator::new()).unwrap();
        let err = apply_to_tree(&repo, theirs, &files).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn renumbering_skips_unselected_growth() {
        let mut offset = 0;
        let out = renumber("@@ -10,2 +12,3 @@ ctx\n a\n+b\n c\n", &mut offset);
        assert!(out.starts_with("@@ -10,2 +10,3 @@ ctx\n"));
        assert_eq!(offset, 1);

        let mut offset = 0;
        let out = renumber("@@ -0,0 +1,2 @@\n+a\n+b\n", &mut offset);
        assert!(out.starts_with("@@ -0,0 +1,2 @@\n"));
    }
}
