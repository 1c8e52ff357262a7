//! Non-blocking image construction.
//!
//! [`ImageBuild`] runs the same decode sequence as [`open_image`](super::open_image)
//! as an explicit step machine over `tokio::fs`. Each call to
//! [`ImageBuild::advance`] performs one step and yields to the runtime, so a
//! caller can interleave many opens on a few threads. Results and error codes
//! match the blocking path because both share the same decoders and layout
//! checks.

use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use super::bat::BlockAllocationTable;
use super::footer::{DiskType, Footer, FOOTER_SIZE};
use super::header::{Header, HEADER_SIZE};
use super::image::{
    assemble, enforce_checksum, footer_location, header_location, locator_location,
    resolve_parent_path, select_locator, table_location, AncestorSet, Image, SparseMetadata,
};
use crate::config::OpenOptions;
use crate::error::{SyncError, SyncResult};

/// The next decode step an [`ImageBuild`] will perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    Footer,
    Header,
    Table,
    Parent,
    Done,
}

/// Resumable construction of one link in an image chain.
pub struct ImageBuild<'a> {
    path: PathBuf,
    options: &'a OpenOptions,
    ancestors: &'a mut AncestorSet,
    depth: usize,
    file: File,
    file_len: u64,
    step: BuildStep,
    footer: Option<Footer>,
    header: Option<Header>,
    bat: Option<BlockAllocationTable>,
    parent: Option<Image>,
}

impl<'a> ImageBuild<'a> {
    async fn start(
        path: &Path,
        options: &'a OpenOptions,
        ancestors: &'a mut AncestorSet,
        depth: usize,
    ) -> SyncResult<ImageBuild<'a>> {
        let canonical = ancestors.enter(path, depth, options.max_parent_depth)?;
        let file = File::open(&canonical).await?;
        let file_len = file.metadata().await?.len();
        Ok(Self {
            path: path.to_path_buf(),
            options,
            ancestors,
            depth,
            file,
            file_len,
            step: BuildStep::Footer,
            footer: None,
            header: None,
            bat: None,
            parent: None,
        })
    }

    /// Step that the next call to [`advance`](Self::advance) will run.
    pub fn next_step(&self) -> BuildStep {
        self.step
    }

    /// Runs one decode step and yields. Returns the step now pending.
    pub async fn advance(&mut self) -> SyncResult<BuildStep> {
        self.step = match self.step {
            BuildStep::Footer => self.read_footer().await?,
            BuildStep::Header => self.read_header().await?,
            BuildStep::Table => self.read_table().await?,
            BuildStep::Parent => self.open_parent().await?,
            BuildStep::Done => BuildStep::Done,
        };
        tokio::task::yield_now().await;
        Ok(self.step)
    }

    /// Drives the remaining steps and assembles the image.
    pub async fn finish(mut self) -> SyncResult<Image> {
        while self.step != BuildStep::Done {
            self.advance().await?;
        }
        let footer = self
            .footer
            .ok_or_else(|| SyncError::malformed("build finished without a footer"))?;
        let sparse = match (self.header, self.bat) {
            (Some(header), Some(bat)) => Some(SparseMetadata { header, bat }),
            _ => None,
        };
        assemble(self.path, self.file_len, footer, sparse, self.parent, self.options)
    }

    async fn read_footer(&mut self) -> SyncResult<BuildStep> {
        let offset = footer_location(self.file_len)?;
        let raw = self.read_at(offset, FOOTER_SIZE).await?;
        let footer = Footer::decode(raw.as_slice())?;
        enforce_checksum(
            self.options.checksum_policy,
            "footer",
            &self.path,
            footer.checksum,
            footer.computed_checksum,
        )?;
        let next = if footer.disk_type.is_sparse() {
            BuildStep::Header
        } else {
            BuildStep::Done
        };
        self.footer = Some(footer);
        Ok(next)
    }

    async fn read_header(&mut self) -> SyncResult<BuildStep> {
        let offset = header_location(self.footer()?, self.file_len)?;
        let raw = self.read_at(offset, HEADER_SIZE).await?;
        let header = Header::decode(raw.as_slice())?;
        enforce_checksum(
            self.options.checksum_policy,
            "header",
            &self.path,
            header.checksum,
            header.computed_checksum,
        )?;
        self.header = Some(header);
        Ok(BuildStep::Table)
    }

    async fn read_table(&mut self) -> SyncResult<BuildStep> {
        let virtual_size = self.footer()?.current_size;
        let disk_type = self.footer()?.disk_type;
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| SyncError::malformed("table step before header"))?;
        let (max_entries, block_size) = (header.max_table_entries, header.block_size);

        BlockAllocationTable::check_sizing(max_entries, block_size, virtual_size)?;
        let (offset, len) = table_location(header, self.file_len)?;
        let raw = self.read_at(offset, len).await?;
        self.bat = Some(BlockAllocationTable::decode(
            raw.as_slice(),
            max_entries,
            block_size,
            virtual_size,
        )?);

        Ok(if disk_type == DiskType::Differencing {
            BuildStep::Parent
        } else {
            BuildStep::Done
        })
    }

    async fn open_parent(&mut self) -> SyncResult<BuildStep> {
        let header = self
            .header
            .clone()
            .ok_or_else(|| SyncError::malformed("parent step before header"))?;

        let locator_path = match select_locator(&header, self.options) {
            Some(locator) => {
                let (offset, len) = locator_location(locator, self.file_len)?;
                let data = self.read_at(offset, len).await?;
                Some(locator.decode_path(&data)?)
            }
            None => None,
        };
        let parent_path = resolve_parent_path(&self.path, &header, self.options, locator_path)?;
        debug!("{} -> parent {}", self.path.display(), parent_path.display());

        let parent = open_link(&parent_path, self.options, self.ancestors, self.depth + 1).await?;
        self.parent = Some(parent);
        Ok(BuildStep::Done)
    }

    fn footer(&self) -> SyncResult<&Footer> {
        self.footer
            .as_ref()
            .ok_or_else(|| SyncError::malformed("footer not decoded yet"))
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> SyncResult<Vec<u8>> {
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len);
        (&mut self.file).take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Opens an image and its parent chain without blocking the calling thread.
pub async fn open_image_async(path: impl AsRef<Path>, options: &OpenOptions) -> SyncResult<Image> {
    let mut ancestors = AncestorSet::default();
    open_link(path.as_ref(), options, &mut ancestors, 0).await
}

fn open_link<'a>(
    path: &'a Path,
    options: &'a OpenOptions,
    ancestors: &'a mut AncestorSet,
    depth: usize,
) -> BoxFuture<'a, SyncResult<Image>> {
    Box::pin(async move {
        ImageBuild::start(path, options, ancestors, depth)
            .await?
            .finish()
            .await
    })
}
