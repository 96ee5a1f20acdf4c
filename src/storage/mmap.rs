//! # Data File Access
//!
//! The data file is read through one shared, read-only memory map and
//! written through plain positioned writes on a separate descriptor. The
//! kernel's unified page cache keeps the two views coherent, so a write
//! transaction can flush its pages with `pwritev` while readers keep
//! dereferencing the map — the pages a writer touches are never reachable
//! from any committed snapshot until the meta page is rewritten.
//!
//! Three descriptors are held per environment:
//!
//! - `file`: the main read/write descriptor used for page flushes and for
//!   reading the meta pages before the map exists.
//! - `sync_file`: the same file opened with `O_DSYNC`, used only for the
//!   meta write so that meta durability needs no separate fsync.
//! - the map itself, sized to the configured map size (usually larger
//!   than the file — the file stays sparse and pages past the end are
//!   simply never read before they are written).
//!
//! ## Safety
//!
//! The map can only be replaced (grown) through `remap`, which takes
//! `&mut self`. The environment wraps `DataFile` in a `RwLock` and every
//! live transaction holds a read guard, so the borrow rules of the lock
//! guarantee no page reference can survive a remap.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};

use crate::config::Pgno;

#[derive(Debug)]
pub struct DataFile {
    file: File,
    sync_file: Option<File>,
    map: Mmap,
    map_size: usize,
    page_size: usize,
    read_only: bool,
}

/// Open the data descriptors; the map comes later, once the page size is
/// known from the meta pages.
pub fn open_files(path: &Path, read_only: bool, mode: u32) -> Result<(File, Option<File>)> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    if !read_only {
        opts.write(true).create(true).mode(mode);
    }
    let file = opts
        .open(path)
        .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

    let sync_file = if read_only {
        None
    } else {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DSYNC)
            .open(path)
            .wrap_err_with(|| {
                format!("failed to open synchronous fd for '{}'", path.display())
            })?;
        Some(f)
    };
    Ok((file, sync_file))
}

impl DataFile {
    pub fn new(
        file: File,
        sync_file: Option<File>,
        map_size: usize,
        page_size: usize,
        read_only: bool,
    ) -> Result<Self> {
        // SAFETY: mapping a file is unsafe because other processes could
        // truncate it under us. This is safe by protocol: the file only
        // ever grows, pages beyond the committed last_pgno are never
        // dereferenced, and writers coordinate through the writer mutex.
        let map = unsafe {
            MmapOptions::new()
                .len(map_size)
                .map(&file)
                .wrap_err("failed to memory-map data file")?
        };
        Ok(Self {
            file,
            sync_file,
            map,
            map_size,
            page_size,
            read_only,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn map_size(&self) -> usize {
        self.map_size
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Pages addressable through the current map.
    pub fn max_pgs(&self) -> u64 {
        (self.map_size / self.page_size) as u64
    }

    /// A run of `count` pages starting at `pgno`, straight from the map.
    pub fn page(&self, pgno: Pgno, count: usize) -> Result<&[u8]> {
        let end = pgno
            .checked_add(count as u64)
            .ok_or_else(|| eyre::eyre!("page run {}+{} overflows", pgno, count))?;
        ensure!(
            end <= self.max_pgs(),
            "page {} (run of {}) beyond mapped space ({} pages)",
            pgno,
            count,
            self.max_pgs()
        );
        let off = pgno as usize * self.page_size;
        Ok(&self.map[off..off + count * self.page_size])
    }

    /// Positioned read through the descriptor, for the meta bootstrap
    /// that runs before the map exists.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.file.read_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).wrap_err("positioned read failed"),
            }
        }
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        ensure!(!self.read_only, "environment is read-only");
        self.file
            .write_all_at(buf, offset)
            .wrap_err("positioned write failed")
    }

    /// Write a run of page buffers contiguously starting at `pgno` with
    /// one vectored call, retrying interrupts and short writes.
    pub fn write_run(&self, pgno: Pgno, bufs: &[&[u8]]) -> Result<()> {
        ensure!(!self.read_only, "environment is read-only");
        let mut offset = pgno * self.page_size as u64;
        let mut iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();
        let mut start = 0usize;
        while start < iov.len() {
            let n = unsafe {
                libc::pwritev(
                    self.file.as_raw_fd(),
                    iov[start..].as_ptr(),
                    (iov.len() - start) as libc::c_int,
                    offset as libc::off_t,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).wrap_err_with(|| {
                    format!("vectored write of {} pages at {} failed", bufs.len(), pgno)
                });
            }
            let mut written = n as usize;
            offset += written as u64;
            while start < iov.len() && written >= iov[start].iov_len {
                written -= iov[start].iov_len;
                start += 1;
            }
            if start < iov.len() && written > 0 {
                // Short write inside a buffer: advance its base.
                iov[start].iov_base = unsafe { (iov[start].iov_base as *mut u8).add(written) }
                    as *mut libc::c_void;
                iov[start].iov_len -= written;
            }
        }
        Ok(())
    }

    /// Write a meta body at its slot. Through the `O_DSYNC` descriptor the
    /// write is durable when it returns; through the plain descriptor it
    /// is only ordered by a later fsync.
    pub fn write_meta(&self, slot: usize, offset_in_page: usize, body: &[u8], durable: bool) -> Result<()> {
        ensure!(!self.read_only, "environment is read-only");
        let offset = (slot * self.page_size + offset_in_page) as u64;
        let fd = if durable {
            self.sync_file.as_ref().unwrap_or(&self.file)
        } else {
            &self.file
        };
        fd.write_all_at(body, offset)
            .wrap_err_with(|| format!("meta write to slot {} failed", slot))
    }

    /// Flush the data descriptor. `data_only` skips metadata (fdatasync).
    pub fn sync(&self, data_only: bool) -> Result<()> {
        if data_only {
            self.file.sync_data().wrap_err("fdatasync failed")
        } else {
            self.file.sync_all().wrap_err("fsync failed")
        }
    }

    /// Replace the map with a larger one. Requires `&mut self`: the
    /// environment's lock guarantees no transaction holds page slices.
    pub fn remap(&mut self, new_size: usize) -> Result<()> {
        ensure!(
            new_size >= self.map_size,
            "map can only grow: {} < {}",
            new_size,
            self.map_size
        );
        if new_size == self.map_size {
            return Ok(());
        }
        // SAFETY: same protocol as `new`; the old map is dropped after
        // the replacement is installed and no references can exist.
        self.map = unsafe {
            MmapOptions::new()
                .len(new_size)
                .map(&self.file)
                .wrap_err("failed to remap data file")?
        };
        self.map_size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_HEADER_SIZE;

    fn create(psize: usize, map_size: usize) -> (tempfile::TempDir, DataFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.cdb");
        let (file, sync_file) = open_files(&path, false, 0o644).unwrap();
        let df = DataFile::new(file, sync_file, map_size, psize, false).unwrap();
        (dir, df)
    }

    #[test]
    fn written_pages_are_visible_through_the_map() {
        let (_dir, df) = create(4096, 1 << 20);

        let buf = vec![0xA5u8; 4096];
        df.write_run(3, &[&buf]).unwrap();

        let page = df.page(3, 1).unwrap();
        assert_eq!(page, &buf[..]);
    }

    #[test]
    fn vectored_write_lays_pages_contiguously() {
        let (_dir, df) = create(4096, 1 << 20);

        let a = vec![0x11u8; 4096];
        let b = vec![0x22u8; 4096];
        df.write_run(5, &[&a, &b]).unwrap();

        assert_eq!(df.page(5, 1).unwrap()[0], 0x11);
        assert_eq!(df.page(6, 1).unwrap()[0], 0x22);
        assert_eq!(df.page(5, 2).unwrap().len(), 8192);
    }

    #[test]
    fn page_beyond_map_is_rejected() {
        let (_dir, df) = create(4096, 16 * 4096);

        let err = df.page(16, 1).unwrap_err();
        assert!(err.to_string().contains("beyond mapped space"));
    }

    #[test]
    fn meta_write_lands_at_slot_offset() {
        let (_dir, df) = create(4096, 1 << 20);

        df.write_meta(1, PAGE_HEADER_SIZE, b"metabytes", true).unwrap();

        let mut back = [0u8; 9];
        df.read_at((4096 + PAGE_HEADER_SIZE) as u64, &mut back).unwrap();
        assert_eq!(&back, b"metabytes");
    }

    #[test]
    fn remap_grows_addressable_pages() {
        let (_dir, mut df) = create(4096, 16 * 4096);
        assert_eq!(df.max_pgs(), 16);

        df.remap(32 * 4096).unwrap();
        assert_eq!(df.max_pgs(), 32);
        assert!(df.page(20, 1).is_ok());
    }
}
