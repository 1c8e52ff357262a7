//! Logical reads through the BAT, sector bitmaps and the parent chain.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use super::footer::DiskType;
use super::header::SECTOR_SIZE;
use super::image::Image;
use crate::error::{ErrorCode, SyncError, SyncResult};

struct Link<'a> {
    image: &'a Image,
    file: File,
    /// Most recently loaded sector bitmap, keyed by block index.
    bitmap: Option<(usize, Vec<u8>)>,
}

/// Reads virtual-disk bytes from an image and its ancestors.
pub struct ImageReader<'a> {
    links: Vec<Link<'a>>,
}

impl<'a> ImageReader<'a> {
    /// Opens a file handle for every image in the chain.
    pub fn open(image: &'a Image) -> SyncResult<Self> {
        let links = std::iter::once(image)
            .chain(image.ancestors())
            .map(|image| {
                Ok(Link {
                    image,
                    file: File::open(image.path())?,
                    bitmap: None,
                })
            })
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(Self { links })
    }

    /// Fills `buf` with the virtual-disk bytes starting at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> SyncResult<()> {
        let size = self.links[0].image.virtual_size();
        let end = offset.checked_add(buf.len() as u64);
        if end.map_or(true, |end| end > size) {
            return Err(SyncError::with_message(
                ErrorCode::InvalidInput,
                format!("read of {} bytes at {offset} exceeds disk size {size}", buf.len()),
            ));
        }
        self.read_link(0, offset, buf)
    }

    fn read_link(&mut self, index: usize, offset: u64, buf: &mut [u8]) -> SyncResult<()> {
        let Some(link) = self.links.get(index) else {
            buf.fill(0);
            return Ok(());
        };
        let image = link.image;

        // Bytes past a smaller ancestor's end read as zero.
        let size = image.virtual_size();
        if offset >= size {
            buf.fill(0);
            return Ok(());
        }
        let available = ((size - offset) as usize).min(buf.len());
        let (buf, tail) = buf.split_at_mut(available);
        tail.fill(0);

        let Some(sparse) = image.sparse() else {
            return read_file(&mut self.links[index].file, offset, buf);
        };

        let block_size = sparse.header.block_size as u64;
        let bitmap_size = sparse.header.bitmap_size();
        let differencing = image.disk_type() == DiskType::Differencing;

        let mut done = 0usize;
        while done < buf.len() {
            let position = offset + done as u64;
            let block = (position / block_size) as usize;
            let within = position % block_size;
            let chunk = ((block_size - within) as usize).min(buf.len() - done);
            let out = &mut buf[done..done + chunk];

            match sparse.bat.block_sector(block) {
                None if differencing => self.read_link(index + 1, position, out)?,
                None => out.fill(0),
                Some(sector) => {
                    let data_start = sector as u64 * SECTOR_SIZE + bitmap_size;
                    if differencing {
                        self.read_differencing_block(index, block, sector, within, position, out)?;
                    } else {
                        read_file(&mut self.links[index].file, data_start + within, out)?;
                    }
                }
            }
            done += chunk;
        }
        Ok(())
    }

    /// Reads within one allocated differencing block, taking sectors whose
    /// bitmap bit is clear from the parent.
    fn read_differencing_block(
        &mut self,
        index: usize,
        block: usize,
        sector: u32,
        within: u64,
        position: u64,
        out: &mut [u8],
    ) -> SyncResult<()> {
        let block_start = sector as u64 * SECTOR_SIZE;
        let bitmap_size = self.links[index]
            .image
            .header()
            .map(|h| h.bitmap_size())
            .unwrap_or(SECTOR_SIZE);
        let bitmap = self.load_bitmap(index, block, block_start, bitmap_size)?;

        let mut done = 0usize;
        while done < out.len() {
            let sector_in_block = (within + done as u64) / SECTOR_SIZE;
            let present = bitmap_bit(&bitmap, sector_in_block)?;

            // Extend the run while the bitmap bit stays the same.
            let mut run_end = ((sector_in_block + 1) * SECTOR_SIZE - within) as usize;
            while run_end < out.len()
                && bitmap_bit(&bitmap, (within + run_end as u64) / SECTOR_SIZE)? == present
            {
                run_end += SECTOR_SIZE as usize;
            }
            let run_end = run_end.min(out.len());
            let run = &mut out[done..run_end];

            if present {
                let file_offset = block_start + bitmap_size + within + done as u64;
                read_file(&mut self.links[index].file, file_offset, run)?;
            } else {
                self.read_link(index + 1, position + done as u64, run)?;
            }
            done = run_end;
        }
        Ok(())
    }

    fn load_bitmap(
        &mut self,
        index: usize,
        block: usize,
        block_start: u64,
        bitmap_size: u64,
    ) -> SyncResult<Vec<u8>> {
        let link = &mut self.links[index];
        if let Some((cached, bitmap)) = &link.bitmap {
            if *cached == block {
                return Ok(bitmap.clone());
            }
        }
        let mut bitmap = vec![0u8; bitmap_size as usize];
        read_file(&mut link.file, block_start, &mut bitmap)?;
        link.bitmap = Some((block, bitmap.clone()));
        Ok(bitmap)
    }
}

fn bitmap_bit(bitmap: &[u8], sector_in_block: u64) -> SyncResult<bool> {
    let byte = bitmap
        .get((sector_in_block / 8) as usize)
        .ok_or_else(|| SyncError::malformed("sector bitmap too small for block"))?;
    Ok(byte & (0x80 >> (sector_in_block % 8)) != 0)
}

fn read_file(file: &mut File, offset: u64, buf: &mut [u8]) -> SyncResult<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SyncError::malformed(format!(
                "image data at {offset} ({} bytes) is truncated",
                buf.len()
            ))
        } else {
            e.into()
        }
    })
}
