//! Image graph builder: footer, header, BAT and the parent chain.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use super::bat::BlockAllocationTable;
use super::footer::{DiskType, Footer, FOOTER_SIZE};
use super::header::{Header, ParentLocator, HEADER_SIZE, SECTOR_SIZE};
use crate::config::{ChecksumPolicy, OpenOptions};
use crate::error::{ErrorCode, SyncError, SyncResult};

// Locator data longer than this is treated as corrupt.
const MAX_LOCATOR_BYTES: u64 = 64 * 1024;

/// Header and BAT of a dynamic or differencing disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseMetadata {
    pub header: Header,
    pub bat: BlockAllocationTable,
}

/// A decoded image. Differencing images own their parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    path: PathBuf,
    file_size: u64,
    footer: Footer,
    sparse: Option<SparseMetadata>,
    parent: Option<Box<Image>>,
}

impl Image {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the image file on disk.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    /// Declared virtual size in bytes.
    pub fn virtual_size(&self) -> u64 {
        self.footer.current_size
    }

    pub fn header(&self) -> Option<&Header> {
        self.sparse.as_ref().map(|s| &s.header)
    }

    pub fn bat(&self) -> Option<&BlockAllocationTable> {
        self.sparse.as_ref().map(|s| &s.bat)
    }

    pub fn sparse(&self) -> Option<&SparseMetadata> {
        self.sparse.as_ref()
    }

    pub fn parent(&self) -> Option<&Image> {
        self.parent.as_deref()
    }

    /// Parent, grandparent, and so on up to the base image.
    pub fn ancestors(&self) -> impl Iterator<Item = &Image> {
        std::iter::successors(self.parent(), |image| image.parent())
    }

    /// Number of parent links below this image.
    pub fn chain_depth(&self) -> usize {
        self.ancestors().count()
    }
}

/// Canonical paths of every image already open in the current chain.
#[derive(Debug, Default)]
pub(crate) struct AncestorSet {
    visited: HashSet<PathBuf>,
}

impl AncestorSet {
    /// Registers `path` as the next link, rejecting cycles and overlong chains.
    pub(crate) fn enter(&mut self, path: &Path, depth: usize, max_depth: usize) -> SyncResult<PathBuf> {
        if depth > max_depth {
            return Err(SyncError::malformed(format!(
                "parent chain deeper than {max_depth} links at {}",
                path.display()
            )));
        }
        let canonical = path.canonicalize().map_err(|e| {
            SyncError::with_message(
                ErrorCode::Io,
                format!("failed to resolve {}: {e}", path.display()),
            )
        })?;
        if !self.visited.insert(canonical.clone()) {
            return Err(SyncError::malformed(format!(
                "parent chain cycles back to {}",
                canonical.display()
            )));
        }
        Ok(canonical)
    }
}

/// Offset of the trailing footer for a file of `file_len` bytes.
pub(crate) fn footer_location(file_len: u64) -> SyncResult<u64> {
    file_len
        .checked_sub(FOOTER_SIZE as u64)
        .ok_or_else(|| SyncError::malformed(format!("file of {file_len} bytes has no footer")))
}

/// Offset of the dynamic header declared by `footer`.
pub(crate) fn header_location(footer: &Footer, file_len: u64) -> SyncResult<u64> {
    let end = footer
        .data_offset
        .checked_add(HEADER_SIZE as u64)
        .ok_or_else(|| SyncError::malformed("header offset overflows"))?;
    if footer.data_offset % SECTOR_SIZE != 0 || end > footer_location(file_len)? {
        return Err(SyncError::malformed(format!(
            "header offset {:#x} lies outside the image",
            footer.data_offset
        )));
    }
    Ok(footer.data_offset)
}

/// Offset and byte length of the BAT declared by `header`.
pub(crate) fn table_location(header: &Header, file_len: u64) -> SyncResult<(u64, usize)> {
    let len = header.max_table_entries as u64 * 4;
    let end = header
        .table_offset
        .checked_add(len)
        .ok_or_else(|| SyncError::malformed("table offset overflows"))?;
    if end > footer_location(file_len)? {
        return Err(SyncError::malformed(format!(
            "block allocation table at {:#x} runs past the footer",
            header.table_offset
        )));
    }
    Ok((header.table_offset, len as usize))
}

/// Offset and byte length of a parent locator's data.
pub(crate) fn locator_location(locator: &ParentLocator, file_len: u64) -> SyncResult<(u64, usize)> {
    let len = locator.data_length as u64;
    let end = locator.data_offset.checked_add(len);
    if len > MAX_LOCATOR_BYTES || end.map_or(true, |end| end > file_len) {
        return Err(SyncError::malformed(format!(
            "parent locator data at {:#x} ({len} bytes) lies outside the image",
            locator.data_offset
        )));
    }
    Ok((locator.data_offset, len as usize))
}

/// Applies the checksum policy to a decoded structure.
pub(crate) fn enforce_checksum(
    policy: ChecksumPolicy,
    what: &str,
    path: &Path,
    stored: u32,
    computed: u32,
) -> SyncResult<()> {
    if stored == computed || policy == ChecksumPolicy::Ignore {
        return Ok(());
    }
    let message = format!(
        "{what} checksum of {} is {stored:#010x}, expected {computed:#010x}",
        path.display()
    );
    if policy == ChecksumPolicy::Strict {
        return Err(SyncError::with_message(ErrorCode::ChecksumMismatch, message));
    }
    warn!("{}", message);
    Ok(())
}

/// Locator whose data decides the parent path under `options`.
pub(crate) fn select_locator<'h>(header: &'h Header, options: &OpenOptions) -> Option<&'h ParentLocator> {
    if options.parent_dir.is_some() {
        header.relative_locator()
    } else {
        header.absolute_locator()
    }
}

/// Resolves the parent path from the selected locator's decoded text.
pub(crate) fn resolve_parent_path(
    child: &Path,
    header: &Header,
    options: &OpenOptions,
    locator_path: Option<String>,
) -> SyncResult<PathBuf> {
    let child_dir = child.parent().unwrap_or(Path::new("."));
    let stored = || -> SyncResult<PathBuf> {
        if header.parent_path.is_empty() {
            return Err(SyncError::malformed(format!(
                "differencing image {} names no parent",
                child.display()
            )));
        }
        Ok(normalize_locator_path(&header.parent_path))
    };

    let mut candidates = Vec::with_capacity(2);
    match (&options.parent_dir, locator_path) {
        (Some(dir), Some(relative)) => candidates.push(dir.join(normalize_locator_path(&relative))),
        (Some(dir), None) => {
            let stored = stored()?;
            candidates.push(dir.join(stored.file_name().unwrap_or(stored.as_os_str())));
        }
        (None, Some(absolute)) => {
            let absolute = normalize_locator_path(&absolute);
            // Fall back to the same file name beside the child.
            if let Some(name) = absolute.file_name() {
                candidates.push(child_dir.join(name));
            }
            candidates.insert(0, absolute);
        }
        (None, None) => {
            let stored = stored()?;
            if stored.is_absolute() {
                candidates.push(stored);
            } else {
                candidates.push(child_dir.join(stored));
            }
        }
    }

    match candidates.iter().find(|c| c.exists()) {
        Some(found) => Ok(found.clone()),
        None => Err(SyncError::with_message(
            ErrorCode::ParentNotFound,
            format!(
                "parent {} of {} does not exist",
                candidates[0].display(),
                child.display()
            ),
        )),
    }
}

/// Turns a Windows- or POSIX-style locator path into a native path.
fn normalize_locator_path(raw: &str) -> PathBuf {
    let mut path = PathBuf::new();
    if raw.starts_with('/') {
        path.push(Component::RootDir.as_os_str());
    }
    for part in raw.split(['\\', '/']) {
        if part.is_empty() || part == "." {
            continue;
        }
        path.push(part);
    }
    path
}

/// Final validation shared by the blocking and continuation builders.
pub(crate) fn assemble(
    path: PathBuf,
    file_size: u64,
    footer: Footer,
    sparse: Option<SparseMetadata>,
    parent: Option<Image>,
    options: &OpenOptions,
) -> SyncResult<Image> {
    if let (Some(parent), Some(sparse)) = (&parent, &sparse) {
        let expected = sparse.header.parent_unique_id;
        if parent.footer.unique_id != expected {
            let message = format!(
                "parent {} has id {}, child {} expects {}",
                parent.path.display(),
                parent.footer.unique_id,
                path.display(),
                expected
            );
            if options.checksum_policy == ChecksumPolicy::Strict {
                return Err(SyncError::malformed(message));
            }
            warn!("{}", message);
        }
    }

    debug!(
        "opened {} image {} ({} bytes virtual)",
        footer.disk_type,
        path.display(),
        footer.current_size
    );

    Ok(Image {
        path,
        file_size,
        footer,
        sparse,
        parent: parent.map(Box::new),
    })
}

/// Opens an image and, for differencing disks, its whole parent chain.
pub fn open_image(path: impl AsRef<Path>, options: &OpenOptions) -> SyncResult<Image> {
    let mut ancestors = AncestorSet::default();
    open_link(path.as_ref(), options, &mut ancestors, 0)
}

fn open_link(
    path: &Path,
    options: &OpenOptions,
    ancestors: &mut AncestorSet,
    depth: usize,
) -> SyncResult<Image> {
    let canonical = ancestors.enter(path, depth, options.max_parent_depth)?;
    let mut file = File::open(&canonical)?;
    let file_len = file.metadata()?.len();

    let footer = Footer::decode(read_at(&mut file, footer_location(file_len)?, FOOTER_SIZE)?.as_slice())?;
    enforce_checksum(
        options.checksum_policy,
        "footer",
        path,
        footer.checksum,
        footer.computed_checksum,
    )?;

    if !footer.disk_type.is_sparse() {
        return assemble(path.to_path_buf(), file_len, footer, None, None, options);
    }

    let header_offset = header_location(&footer, file_len)?;
    let header = Header::decode(read_at(&mut file, header_offset, HEADER_SIZE)?.as_slice())?;
    enforce_checksum(
        options.checksum_policy,
        "header",
        path,
        header.checksum,
        header.computed_checksum,
    )?;

    BlockAllocationTable::check_sizing(
        header.max_table_entries,
        header.block_size,
        footer.current_size,
    )?;
    let (table_offset, table_len) = table_location(&header, file_len)?;
    let bat = BlockAllocationTable::decode(
        read_at(&mut file, table_offset, table_len)?.as_slice(),
        header.max_table_entries,
        header.block_size,
        footer.current_size,
    )?;

    let parent = if footer.disk_type == DiskType::Differencing {
        let locator_path = match select_locator(&header, options) {
            Some(locator) => {
                let (offset, len) = locator_location(locator, file_len)?;
                Some(locator.decode_path(&read_at(&mut file, offset, len)?)?)
            }
            None => None,
        };
        let parent_path = resolve_parent_path(path, &header, options, locator_path)?;
        debug!("{} -> parent {}", path.display(), parent_path.display());
        Some(open_link(&parent_path, options, ancestors, depth + 1)?)
    } else {
        None
    };

    assemble(
        path.to_path_buf(),
        file_len,
        footer,
        Some(SparseMetadata { header, bat }),
        parent,
        options,
    )
}

fn read_at(file: &mut File, offset: u64, len: usize) -> SyncResult<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buf)?;
    // A short buffer is left for the decoder to report as truncation.
    Ok(buf)
}
