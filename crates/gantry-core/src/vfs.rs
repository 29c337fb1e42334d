//! In-memory virtual filesystem.
//!
//! The emulated machine exposes a POSIX-ish namespace (`/sd`, `/ud`) that
//! console commands browse and the transfer engine reads and writes. The
//! whole namespace lives in one map from canonical absolute path to entry,
//! shared by every connection and guarded by a single mutex — per-op work
//! is trivial next to the network round-trips around it.
//!
//! # Invariants
//!
//! - Every stored path is canonical: absolute, no `.`/`..` components, no
//!   repeated separators. Directory paths end with `/`, file paths do not.
//! - Every non-root entry has its parent directory present in the map.
//! - Directory entries carry `size == -1`, empty contents, empty digest.
//! - For files, `size == contents.len()` and `md5 == md5(contents)` at all
//!   times.
//!
//! The seed document is JSON; a missing or malformed document degrades to
//! an empty namespace holding only `/`, so a broken seed never prevents
//! the server from starting.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Timestamp layout used on the wire and in seed documents.
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Errors surfaced by filesystem commands. `Display` renders the body of
/// the wire reply (the dispatcher prefixes `error:`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VfsError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} is a directory")]
    IsDirectory(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),
}

/// One namespace entry: a file or a directory.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Canonical absolute path; directories end with `/`.
    pub path: String,
    /// Byte length for files, `-1` for directories.
    pub size: i64,
    /// Raw contents; empty for directories.
    pub contents: Vec<u8>,
    /// Lowercase hex MD5 of `contents`; empty for directories.
    pub md5: String,
    /// 14-digit `YYYYMMDDHHMMSS` stamp.
    pub timestamp: String,
    /// Structured form of `timestamp`.
    pub parsed_timestamp: NaiveDateTime,
}

impl FileEntry {
    fn file(path: String, contents: Vec<u8>, stamp: NaiveDateTime) -> Self {
        let digest = format!("{:x}", md5::compute(&contents));
        Self {
            path,
            size: contents.len() as i64,
            md5: digest,
            contents,
            timestamp: stamp.format(TIMESTAMP_FORMAT).to_string(),
            parsed_timestamp: stamp,
        }
    }

    fn directory(path: String, stamp: NaiveDateTime) -> Self {
        Self {
            path,
            size: -1,
            contents: Vec::new(),
            md5: String::new(),
            timestamp: stamp.format(TIMESTAMP_FORMAT).to_string(),
            parsed_timestamp: stamp,
        }
    }

    /// Whether this entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }
}

/// One record of the JSON seed document.
#[derive(Debug, Deserialize)]
struct SeedEntry {
    path: String,
    #[serde(default)]
    contents: String,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Shared in-memory namespace.
#[derive(Debug)]
pub struct VirtualFs {
    entries: Mutex<HashMap<String, FileEntry>>,
}

impl Default for VirtualFs {
    fn default() -> Self {
        Self::empty()
    }
}

impl VirtualFs {
    /// An empty namespace holding only the root directory.
    #[must_use]
    pub fn empty() -> Self {
        let mut entries = HashMap::new();
        entries.insert("/".to_string(), FileEntry::directory("/".into(), now()));
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Builds a namespace from the JSON seed document.
    ///
    /// Directory records end with `/` and omit contents; missing parent
    /// directories are synthesized. A document that fails to parse yields
    /// the empty namespace — seeding is best-effort.
    #[must_use]
    pub fn from_json(document: &str) -> Self {
        let fs = Self::empty();
        let seeds: Vec<SeedEntry> = match serde_json::from_str(document) {
            Ok(seeds) => seeds,
            Err(err) => {
                tracing::warn!("could not load virtual filesystem seed: {err}");
                return fs;
            }
        };

        {
            let mut entries = fs.entries.lock().expect("lock poisoned");
            for seed in seeds {
                let Some(path) = canonicalize("/", &seed.path) else {
                    tracing::warn!(path = %seed.path, "skipping unresolvable seed path");
                    continue;
                };
                let stamp = seed
                    .timestamp
                    .as_deref()
                    .and_then(|t| NaiveDateTime::parse_from_str(t, TIMESTAMP_FORMAT).ok())
                    .unwrap_or_else(now);
                ensure_parents(&mut entries, &path, stamp);
                if seed.path.ends_with('/') {
                    let dir = ensure_dir_form(&path);
                    entries.insert(dir.clone(), FileEntry::directory(dir, stamp));
                } else {
                    entries.insert(
                        path.clone(),
                        FileEntry::file(path, seed.contents.into_bytes(), stamp),
                    );
                }
            }
        }
        fs
    }

    /// Lists the direct children of a directory, one per line, sorted.
    ///
    /// Directories render `name/`; with `with_sizes`, files render
    /// `name <size>` and directories `name/ -1`.
    ///
    /// # Errors
    ///
    /// [`VfsError::NotFound`] if the path does not name a directory.
    pub fn list(&self, cwd: &str, path: &str, with_sizes: bool) -> Result<String, VfsError> {
        let dir = self.resolve(cwd, path)?;
        let entries = self.entries.lock().expect("lock poisoned");
        let dir_key = ensure_dir_form(&dir);
        if !entries.contains_key(&dir_key) {
            return Err(VfsError::NotFound(dir));
        }

        let mut lines = Vec::new();
        for entry in entries.values() {
            let Some(name) = direct_child_name(&dir_key, &entry.path) else {
                continue;
            };
            if with_sizes {
                lines.push(format!("{name} {}", entry.size));
            } else {
                lines.push(name);
            }
        }
        lines.sort();
        Ok(lines.join("\n"))
    }

    /// Changes directory: returns the new CWD on success.
    ///
    /// # Errors
    ///
    /// [`VfsError::NotFound`] if the target is absent,
    /// [`VfsError::NotADirectory`] if it names a file.
    pub fn cd(&self, cwd: &str, path: &str) -> Result<String, VfsError> {
        let target = self.resolve(cwd, path)?;
        let entries = self.entries.lock().expect("lock poisoned");
        if entries.contains_key(&ensure_dir_form(&target)) {
            Ok(target)
        } else if entries.contains_key(&target) {
            Err(VfsError::NotADirectory(target))
        } else {
            Err(VfsError::NotFound(target))
        }
    }

    /// Reads a file as text, optionally truncated to the first `limit`
    /// lines.
    ///
    /// # Errors
    ///
    /// [`VfsError::NotFound`] / [`VfsError::IsDirectory`] as appropriate.
    pub fn cat(&self, cwd: &str, path: &str, limit: Option<usize>) -> Result<String, VfsError> {
        let target = self.resolve(cwd, path)?;
        let entries = self.entries.lock().expect("lock poisoned");
        let entry = lookup_file(&entries, &target)?;
        let text = String::from_utf8_lossy(&entry.contents).into_owned();
        match limit {
            Some(limit) if limit > 0 && limit < text.lines().count() => {
                Ok(text.lines().take(limit).collect::<Vec<_>>().join("\n"))
            }
            _ => Ok(text),
        }
    }

    /// Moves or renames a file. A destination naming an existing directory
    /// moves the file *into* it; otherwise the destination is the new
    /// path. Timestamps travel with the entry.
    ///
    /// # Errors
    ///
    /// [`VfsError::NotFound`] for a missing source or destination parent,
    /// [`VfsError::IsDirectory`] when the source is a directory,
    /// [`VfsError::AlreadyExists`] when the destination file exists.
    pub fn mv(&self, cwd: &str, src: &str, dst: &str) -> Result<(), VfsError> {
        let src = self.resolve(cwd, src)?;
        let dst = self.resolve(cwd, dst)?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        lookup_file(&entries, &src)?;

        let target = if entries.contains_key(&ensure_dir_form(&dst)) {
            let name = basename(&src);
            if dst == "/" {
                format!("/{name}")
            } else {
                format!("{dst}/{name}")
            }
        } else {
            dst
        };
        if entries.contains_key(&target) || entries.contains_key(&ensure_dir_form(&target)) {
            return Err(VfsError::AlreadyExists(target));
        }
        if !entries.contains_key(&ensure_dir_form(&parent_of(&target))) {
            return Err(VfsError::NotFound(parent_of(&target)));
        }

        let mut entry = entries.remove(&src).expect("source checked above");
        entry.path.clone_from(&target);
        entries.insert(target, entry);
        Ok(())
    }

    /// Removes a file. Directories are never removed by `rm`.
    ///
    /// # Errors
    ///
    /// [`VfsError::NotFound`] / [`VfsError::IsDirectory`] as appropriate.
    pub fn rm(&self, cwd: &str, path: &str) -> Result<(), VfsError> {
        let target = self.resolve(cwd, path)?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        lookup_file(&entries, &target)?;
        entries.remove(&target);
        Ok(())
    }

    /// Creates a directory with a fresh timestamp. The new directory is
    /// visible to every later `ls` on any connection.
    ///
    /// # Errors
    ///
    /// [`VfsError::AlreadyExists`] when the name is taken (file or
    /// directory), [`VfsError::NotFound`] when the parent is absent.
    pub fn mkdir(&self, cwd: &str, path: &str) -> Result<(), VfsError> {
        let target = self.resolve(cwd, path)?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        let dir_key = ensure_dir_form(&target);
        if entries.contains_key(&dir_key) || entries.contains_key(&target) {
            return Err(VfsError::AlreadyExists(target));
        }
        let parent = parent_of(&target);
        if !entries.contains_key(&ensure_dir_form(&parent)) {
            return Err(VfsError::NotFound(parent));
        }
        entries.insert(dir_key.clone(), FileEntry::directory(dir_key, now()));
        Ok(())
    }

    /// Atomically installs an uploaded file: length, digest, and a fresh
    /// timestamp are recorded in one step. Missing parent directories are
    /// created so the parent invariant holds for any upload path.
    pub fn upload_accept(&self, cwd: &str, path: &str, data: Vec<u8>) -> Result<String, VfsError> {
        let target = self.resolve(cwd, path)?;
        let mut entries = self.entries.lock().expect("lock poisoned");
        if entries.contains_key(&ensure_dir_form(&target)) {
            return Err(VfsError::IsDirectory(target));
        }
        let stamp = now();
        ensure_parents(&mut entries, &target, stamp);
        entries.insert(target.clone(), FileEntry::file(target.clone(), data, stamp));
        Ok(target)
    }

    /// Fetches a file's contents and digest for download.
    ///
    /// # Errors
    ///
    /// [`VfsError::NotFound`] / [`VfsError::IsDirectory`] as appropriate.
    pub fn download_fetch(&self, cwd: &str, path: &str) -> Result<(Vec<u8>, String), VfsError> {
        let target = self.resolve(cwd, path)?;
        let entries = self.entries.lock().expect("lock poisoned");
        let entry = lookup_file(&entries, &target)?;
        Ok((entry.contents.clone(), entry.md5.clone()))
    }

    /// Digest of an existing file, if any. Used for the transfer engine's
    /// identical-upload short circuit.
    #[must_use]
    pub fn file_md5(&self, cwd: &str, path: &str) -> Option<String> {
        let target = self.resolve(cwd, path).ok()?;
        let entries = self.entries.lock().expect("lock poisoned");
        entries
            .get(&target)
            .filter(|e| !e.is_dir())
            .map(|e| e.md5.clone())
    }

    /// Resolves `path` against `cwd` into a canonical absolute path
    /// (without a trailing slash, except for the root itself).
    fn resolve(&self, cwd: &str, path: &str) -> Result<String, VfsError> {
        canonicalize(cwd, path).ok_or_else(|| VfsError::NotFound(path.to_string()))
    }
}

/// Joins and normalizes: relative paths resolve against `cwd`; `.` drops,
/// `..` pops (never past the root), repeated separators collapse.
///
/// Returns `None` only for paths that cannot be represented at all
/// (embedded NUL).
fn canonicalize(cwd: &str, path: &str) -> Option<String> {
    if path.contains('\0') {
        return None;
    }
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for component in joined.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        return Some("/".to_string());
    }
    Some(format!("/{}", parts.join("/")))
}

/// Directory-map key for a canonical path (`/sd` -> `/sd/`, `/` -> `/`).
fn ensure_dir_form(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path.trim_end_matches('/'))
    }
}

fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

fn parent_of(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Inserts directory entries for every missing ancestor of `path`.
fn ensure_parents(entries: &mut HashMap<String, FileEntry>, path: &str, stamp: NaiveDateTime) {
    let mut ancestor = parent_of(path);
    let mut missing = Vec::new();
    while ancestor != "/" {
        let key = ensure_dir_form(&ancestor);
        if entries.contains_key(&key) {
            break;
        }
        missing.push(key);
        ancestor = parent_of(&ancestor);
    }
    for key in missing.into_iter().rev() {
        entries.insert(key.clone(), FileEntry::directory(key, stamp));
    }
}

fn lookup_file<'a>(
    entries: &'a HashMap<String, FileEntry>,
    path: &str,
) -> Result<&'a FileEntry, VfsError> {
    if path == "/" || entries.contains_key(&ensure_dir_form(path)) {
        return Err(VfsError::IsDirectory(path.to_string()));
    }
    entries
        .get(path)
        .ok_or_else(|| VfsError::NotFound(path.to_string()))
}

/// The name of `entry_path` if it is a direct child of `dir_key`
/// (directories keep their trailing `/`).
fn direct_child_name(dir_key: &str, entry_path: &str) -> Option<String> {
    if entry_path == dir_key {
        return None;
    }
    let rest = entry_path.strip_prefix(dir_key)?;
    let trimmed = rest.trim_end_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') {
        return None;
    }
    Some(if rest.ends_with('/') {
        format!("{trimmed}/")
    } else {
        trimmed.to_string()
    })
}
