//! Layer packing and extraction.
//!
//! Layers are gzip-compressed tar archives. Packing is deterministic: the
//! same directory tree always yields byte-identical archives, so a layer's
//! digest depends only on its content:
//!
//! - entries are emitted in sorted path order, parents before children
//! - mtime, uid and gid are zeroed; user/group names are empty
//! - the gzip header carries no timestamp or file name
//!
//! Extraction applies layers bottom-to-top onto a rootfs, honoring OCI
//! whiteouts and rejecting entries that would escape the rootfs.

use crate::constants::{MAX_LAYER_SIZE, MAX_ROOTFS_SIZE, OCI_LAYER_MEDIA_TYPE_GZIP};
use crate::error::{Error, Result};
use crate::storage::{BlobStore, sha256_digest};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType, Header};
use tracing::{debug, warn};

/// Whiteout file prefix marking a deletion in a lower layer.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Whiteout file name marking a directory as opaque.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// A stored layer, as recorded in image manifests and the stage cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    /// Digest of the compressed blob.
    pub digest: String,
    /// Digest of the uncompressed tar.
    pub diff_id: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// Media type of the blob.
    pub media_type: String,
}

/// A freshly packed layer, not yet stored.
#[derive(Debug, Clone)]
pub struct PackedLayer {
    /// Compressed archive bytes.
    pub data: Vec<u8>,
    /// Digest of `data`.
    pub digest: String,
    /// Digest of the uncompressed tar.
    pub diff_id: String,
}

impl PackedLayer {
    /// Wraps an uncompressed tar, compressing it deterministically.
    pub fn from_tar(tar: &[u8]) -> Result<Self> {
        let diff_id = sha256_digest(tar);
        let mut encoder = GzBuilder::new()
            .mtime(0)
            .write(Vec::new(), Compression::default());
        encoder.write_all(tar)?;
        let data = encoder.finish()?;

        if data.len() as u64 > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size: data.len() as u64,
                limit: MAX_LAYER_SIZE,
            });
        }

        Ok(Self {
            digest: sha256_digest(&data),
            diff_id,
            data,
        })
    }

    /// Stores the layer and returns its descriptor.
    pub fn store(self, storage: &BlobStore) -> Result<LayerDescriptor> {
        storage.put_blob(&self.digest, &self.data)?;
        Ok(LayerDescriptor {
            size: self.data.len() as u64,
            digest: self.digest,
            diff_id: self.diff_id,
            media_type: OCI_LAYER_MEDIA_TYPE_GZIP.to_string(),
        })
    }
}

// =============================================================================
// Exclusion Rules
// =============================================================================

/// Path exclusion rules for directory walks.
///
/// A rule containing `/` matches a relative path equal to it or nested
/// under it. A bare name matches that path component at any depth. Rules
/// of the form `*.ext` match any file name ending in `.ext`. Rules added
/// with [`Excludes::add_anchored`] only match from the walk root.
#[derive(Debug, Clone, Default)]
pub struct Excludes {
    prefixes: Vec<String>,
    suffixes: Vec<String>,
    roots: Vec<String>,
}

impl Excludes {
    /// Builds rules from patterns. Leading `./` and `/` and trailing `/` are
    /// ignored; blank patterns and `#` comments are skipped.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut excludes = Self::default();
        for pattern in patterns {
            excludes.add(pattern.as_ref());
        }
        excludes
    }

    /// Adds one pattern.
    pub fn add(&mut self, pattern: &str) {
        let p = pattern.trim();
        if p.is_empty() || p.starts_with('#') {
            return;
        }
        if let Some(ext) = p.strip_prefix('*') {
            self.suffixes.push(ext.to_string());
            return;
        }
        let p = p.trim_start_matches("./").trim_matches('/');
        if !p.is_empty() {
            self.prefixes.push(p.to_string());
        }
    }

    /// Adds a path matched only from the walk root (`tmp` excludes `tmp`
    /// and `tmp/x`, never `var/tmp`).
    pub fn add_anchored(&mut self, path: &str) {
        let p = path.trim().trim_matches('/');
        if !p.is_empty() {
            self.roots.push(p.to_string());
        }
    }

    /// Returns true if the relative path is excluded.
    pub fn matches(&self, rel: &str) -> bool {
        let anchored = |p: &str| rel == p || (rel.starts_with(p) && rel[p.len()..].starts_with('/'));
        if self.roots.iter().any(|p| anchored(p)) {
            return true;
        }
        if self.prefixes.iter().any(|p| {
            if p.contains('/') {
                anchored(p)
            } else {
                rel.split('/').any(|part| part == p)
            }
        }) {
            return true;
        }
        let name = rel.rsplit('/').next().unwrap_or(rel);
        self.suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }
}

// =============================================================================
// Directory Walk
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
    Symlink,
}

/// Metadata compared to detect a changed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    ino: u64,
    mtime: (i64, i64),
    ctime: (i64, i64),
}

impl Stamp {
    #[cfg(unix)]
    fn of(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
            ino: meta.ino(),
            mtime: (meta.mtime(), meta.mtime_nsec()),
            ctime: (meta.ctime(), meta.ctime_nsec()),
        }
    }

    #[cfg(not(unix))]
    fn of(meta: &fs::Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| (d.as_secs() as i64, d.subsec_nanos() as i64))
            .unwrap_or_default();
        Self {
            mode: 0,
            uid: 0,
            gid: 0,
            size: meta.len(),
            ino: 0,
            mtime,
            ctime: mtime,
        }
    }

    /// Directories count as changed only when their mode or owner does;
    /// adding or removing children is captured by the children themselves.
    fn same_dir_attrs(&self, other: &Stamp) -> bool {
        self.mode == other.mode && self.uid == other.uid && self.gid == other.gid
    }
}

#[derive(Debug)]
struct WalkEntry {
    rel: String,
    abs: std::path::PathBuf,
    kind: Kind,
    mode: u32,
    size: u64,
    stamp: Stamp,
}

fn walk(root: &Path, excludes: &Excludes) -> Result<Vec<WalkEntry>> {
    let mut out = Vec::new();
    walk_into(root, "", excludes, &mut out)?;
    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(out)
}

fn walk_into(dir: &Path, prefix: &str, excludes: &Excludes, out: &mut Vec<WalkEntry>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!("Skipping non-UTF-8 path under {}", dir.display());
            continue;
        };
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };
        if excludes.matches(&rel) {
            debug!("Excluded: {}", rel);
            continue;
        }

        let abs = entry.path();
        let meta = fs::symlink_metadata(&abs)?;
        let ft = meta.file_type();
        let kind = if ft.is_dir() {
            Kind::Dir
        } else if ft.is_file() {
            Kind::File
        } else if ft.is_symlink() {
            Kind::Symlink
        } else {
            debug!("Skipping special file: {}", rel);
            continue;
        };

        out.push(WalkEntry {
            rel: rel.clone(),
            abs: abs.clone(),
            kind,
            mode: file_mode(&meta, kind),
            size: meta.len(),
            stamp: Stamp::of(&meta),
        });

        if kind == Kind::Dir {
            walk_into(&abs, &rel, excludes, out)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata, _kind: Kind) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata, kind: Kind) -> u32 {
    match kind {
        Kind::Dir => 0o755,
        _ => 0o644,
    }
}

// =============================================================================
// Packing
// =============================================================================

/// Packs a directory into a layer placed under `dest` in the image.
///
/// `dest` is an absolute image path (`/app/.streamlit`); parent directories
/// are emitted as entries with mode 0755. The source directory itself maps
/// to `dest`.
pub fn pack_directory(stage: &str, src: &Path, dest: &str, excludes: &Excludes) -> Result<PackedLayer> {
    let pack_err = |e: std::io::Error| Error::LayerPackFailed {
        stage: stage.to_string(),
        reason: e.to_string(),
    };

    let entries = walk(src, excludes).map_err(|e| match e {
        Error::Io(io) => pack_err(io),
        other => other,
    })?;

    let prefix = dest.trim_matches('/');
    let mut builder = tar::Builder::new(Vec::new());

    if !prefix.is_empty() {
        let mut parent = String::new();
        for part in prefix.split('/') {
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(part);
            let mut header = base_header(EntryType::Directory, 0o755, 0);
            builder
                .append_data(&mut header, &parent, std::io::empty())
                .map_err(pack_err)?;
        }
    }

    for entry in &entries {
        let path = if prefix.is_empty() {
            entry.rel.clone()
        } else {
            format!("{}/{}", prefix, entry.rel)
        };
        append_entry(&mut builder, &path, entry).map_err(pack_err)?;
    }

    let tar = builder.into_inner().map_err(pack_err)?;
    debug!(
        "Packed {} entries from {} into {} ({} bytes uncompressed)",
        entries.len(),
        src.display(),
        if prefix.is_empty() { "/" } else { dest },
        tar.len()
    );
    PackedLayer::from_tar(&tar)
}

fn append_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, entry: &WalkEntry) -> std::io::Result<()> {
    match entry.kind {
        Kind::Dir => {
            let mut header = base_header(EntryType::Directory, entry.mode, 0);
            builder.append_data(&mut header, path, std::io::empty())
        }
        Kind::File => {
            let file = fs::File::open(&entry.abs)?;
            let mut header = base_header(EntryType::Regular, entry.mode, entry.size);
            builder.append_data(&mut header, path, file)
        }
        Kind::Symlink => {
            let target = fs::read_link(&entry.abs)?;
            let mut header = base_header(EntryType::Symlink, 0o777, 0);
            builder.append_link(&mut header, path, &target)
        }
    }
}

fn base_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Computes a content digest of a directory tree.
///
/// Covers relative paths, entry kinds, modes, file contents and symlink
/// targets; ignores timestamps and ownership. Used to derive stage cache
/// keys without packing.
pub fn tree_digest(root: &Path, excludes: &Excludes) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(b"hubpack-tree-v1\n");

    for entry in walk(root, excludes)? {
        hasher.update(entry.rel.as_bytes());
        hasher.update([0u8]);
        match entry.kind {
            Kind::Dir => {
                hasher.update(format!("d {:o}\n", entry.mode));
            }
            Kind::File => {
                hasher.update(format!("f {:o} {}\n", entry.mode, entry.size));
                let mut file = fs::File::open(&entry.abs)?;
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
            }
            Kind::Symlink => {
                let target = fs::read_link(&entry.abs)?;
                hasher.update(format!("l {}\n", target.to_string_lossy()));
            }
        }
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

// =============================================================================
// Change Capture
// =============================================================================

/// Entry metadata of a rootfs taken before a command runs.
///
/// [`pack_changes`] compares the tree against it afterwards and packs only
/// what the command added, modified or removed.
#[derive(Debug, Clone, Default)]
pub struct RootfsSnapshot {
    entries: BTreeMap<String, (Kind, Stamp)>,
}

impl RootfsSnapshot {
    /// Records every entry under `root` not matched by `excludes`.
    pub fn capture(root: &Path, excludes: &Excludes) -> Result<Self> {
        let entries = walk(root, excludes)?
            .into_iter()
            .map(|e| (e.rel, (e.kind, e.stamp)))
            .collect();
        Ok(Self { entries })
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Packs the difference between `root` and an earlier snapshot of it.
///
/// New and modified entries are emitted with their parent directories.
/// Removed entries, and entries whose kind changed, become whiteouts; a
/// removed directory yields a single whiteout for the directory itself.
/// Whiteouts precede regular entries so extraction deletes before it
/// writes.
pub fn pack_changes(stage: &str, root: &Path, before: &RootfsSnapshot, excludes: &Excludes) -> Result<PackedLayer> {
    let pack_err = |e: std::io::Error| Error::LayerPackFailed {
        stage: stage.to_string(),
        reason: e.to_string(),
    };

    let after = walk(root, excludes).map_err(|e| match e {
        Error::Io(io) => pack_err(io),
        other => other,
    })?;
    let index: HashMap<&str, &WalkEntry> = after.iter().map(|e| (e.rel.as_str(), e)).collect();

    let mut removed: BTreeSet<&str> = BTreeSet::new();
    for (rel, (kind, _)) in &before.entries {
        let rel = rel.as_str();
        if has_removed_ancestor(rel, &removed) {
            continue;
        }
        let gone = match index.get(rel) {
            None => true,
            Some(now) => now.kind != *kind,
        };
        if gone {
            removed.insert(rel);
        }
    }

    let mut changed: BTreeSet<&str> = BTreeSet::new();
    for entry in &after {
        let modified = match before.entries.get(&entry.rel) {
            None => true,
            Some((kind, _)) if *kind != entry.kind => true,
            Some((Kind::Dir, stamp)) => !stamp.same_dir_attrs(&entry.stamp),
            Some((_, stamp)) => *stamp != entry.stamp,
        };
        if modified {
            let mut end = 0;
            while let Some(pos) = entry.rel[end..].find('/') {
                end += pos;
                changed.insert(&entry.rel[..end]);
                end += 1;
            }
            changed.insert(&entry.rel);
        }
    }

    let mut builder = tar::Builder::new(Vec::new());
    for rel in &removed {
        let (parent, name) = match rel.rsplit_once('/') {
            Some((parent, name)) => (format!("{}/", parent), name),
            None => (String::new(), *rel),
        };
        let path = format!("{}{}{}", parent, WHITEOUT_PREFIX, name);
        let mut header = base_header(EntryType::Regular, 0o644, 0);
        builder
            .append_data(&mut header, &path, std::io::empty())
            .map_err(pack_err)?;
    }
    for rel in &changed {
        if let Some(entry) = index.get(rel) {
            append_entry(&mut builder, rel, entry).map_err(pack_err)?;
        }
    }

    let tar = builder.into_inner().map_err(pack_err)?;
    debug!(
        "Captured {} changed and {} removed entries under {} ({} bytes uncompressed)",
        changed.len(),
        removed.len(),
        root.display(),
        tar.len()
    );
    PackedLayer::from_tar(&tar)
}

fn has_removed_ancestor(rel: &str, removed: &BTreeSet<&str>) -> bool {
    rel.match_indices('/').any(|(i, _)| removed.contains(&rel[..i]))
}

// =============================================================================
// Extraction
// =============================================================================

/// Extracts layers to a rootfs directory, bottom layer first.
///
/// # Security
///
/// - Entries with `..` components or absolute paths are rejected
/// - Whiteouts are only applied when their directory resolves inside the
///   rootfs, so a symlink planted by a lower layer cannot redirect a
///   deletion to the host
/// - Compressed layer size is bounded by [`MAX_LAYER_SIZE`]
/// - Cumulative extracted size is bounded by [`MAX_ROOTFS_SIZE`]
pub fn extract_layers_to_rootfs(
    layers: &[LayerDescriptor],
    rootfs: &Path,
    storage: &BlobStore,
) -> Result<()> {
    fs::create_dir_all(rootfs)?;
    let root = rootfs.canonicalize()?;
    let mut total_size = 0u64;

    for layer in layers {
        debug!("Extracting layer: {}", layer.digest);

        let data = storage.get_blob(&layer.digest)?;
        if data.len() as u64 > MAX_LAYER_SIZE {
            return Err(Error::ImageTooLarge {
                size: data.len() as u64,
                limit: MAX_LAYER_SIZE,
            });
        }

        let extract_err = |e: std::io::Error| Error::LayerExtractionFailed {
            digest: layer.digest.clone(),
            reason: e.to_string(),
        };

        let mut archive = Archive::new(GzDecoder::new(&data[..]));
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);

        for entry in archive.entries().map_err(extract_err)? {
            let mut entry = entry.map_err(extract_err)?;
            let path = entry.path().map_err(extract_err)?.into_owned();

            if path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
            {
                return Err(Error::PathTraversal {
                    path: path.to_string_lossy().to_string(),
                });
            }

            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let parent_rel = path.parent().unwrap_or(Path::new(""));

            if filename == OPAQUE_WHITEOUT {
                if let Some(dir) = contained_dir(&root, parent_rel, &path)? {
                    clear_directory(&dir);
                }
                continue;
            }
            if let Some(target) = filename.strip_prefix(WHITEOUT_PREFIX) {
                if target.is_empty() || target == "." || target == ".." {
                    return Err(Error::PathTraversal {
                        path: path.to_string_lossy().to_string(),
                    });
                }
                if let Some(dir) = contained_dir(&root, parent_rel, &path)? {
                    remove_path(&dir.join(target));
                }
                continue;
            }

            total_size += entry.size();
            if total_size > MAX_ROOTFS_SIZE {
                return Err(Error::ImageTooLarge {
                    size: total_size,
                    limit: MAX_ROOTFS_SIZE,
                });
            }

            entry.unpack_in(rootfs).map_err(extract_err)?;
        }
    }

    Ok(())
}

/// Resolves a layer directory under the rootfs.
///
/// Returns `None` when the directory does not exist (nothing to delete) and
/// [`Error::PathTraversal`] when it resolves outside the rootfs.
fn contained_dir(root: &Path, rel: &Path, entry: &Path) -> Result<Option<PathBuf>> {
    let resolved = match root.join(rel).canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !resolved.starts_with(root) {
        warn!(
            "Whiteout {} resolves to {}, outside the rootfs",
            entry.display(),
            resolved.display()
        );
        return Err(Error::PathTraversal {
            path: entry.to_string_lossy().to_string(),
        });
    }
    if !resolved.is_dir() {
        return Ok(None);
    }
    Ok(Some(resolved))
}

fn remove_path(path: &Path) {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            let _ = fs::remove_dir_all(path);
        }
        Ok(_) => {
            let _ = fs::remove_file(path);
        }
        Err(_) => {}
    }
}

fn clear_directory(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            remove_path(&entry.path());
        }
    }
}
