use std::collections::{BTreeMap, BTreeSet};
use std::string::{String, ToString};
use std::vec::Vec;

use crate::{FsError, VolumeFs, VolumeId};

#[derive(Debug, Default, Clone)]
struct MockFile {
    data: Vec<u8>,
    locked: bool,
}

/// In-RAM twin-volume filesystem with failure injection.
pub struct MockFs {
    files: BTreeMap<(VolumeId, String), MockFile>,
    dirs: BTreeSet<(VolumeId, String)>,
    /// Fail the next N `read_at` calls.
    pub fail_reads: usize,
    /// Fail the next N `append` calls.
    pub fail_appends: usize,
    /// Deliver one short read (half the requested bytes).
    pub short_read_once: bool,
    /// `read_at` calls observed, successful or not.
    pub reads: usize,
}

impl MockFs {
    pub fn new() -> Self {
        let mut fs = Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            fail_reads: 0,
            fail_appends: 0,
            short_read_once: false,
            reads: 0,
        };
        // The standard directory tree exists on both cards.
        for volume in [VolumeId::Sd0, VolumeId::Sd1] {
            for dir in ["app", "bl", "ham"] {
                fs.add_dir(volume, dir);
            }
        }
        fs
    }

    pub fn add_dir(&mut self, volume: VolumeId, dir: &str) {
        self.dirs.insert((volume, dir.to_string()));
    }

    pub fn add_file(&mut self, volume: VolumeId, path: &str, data: &[u8]) {
        self.files
            .insert((volume, path.to_string()), MockFile { data: data.to_vec(), locked: false });
    }

    pub fn exists(&self, volume: VolumeId, path: &str) -> bool {
        self.files.contains_key(&(volume, path.to_string()))
    }

    pub fn file(&self, volume: VolumeId, path: &str) -> &[u8] {
        &self.files[&(volume, path.to_string())].data
    }

    pub fn is_locked(&self, volume: VolumeId, path: &str) -> bool {
        self.files[&(volume, path.to_string())].locked
    }

    pub fn set_locked(&mut self, volume: VolumeId, path: &str, locked: bool) {
        self.files
            .get_mut(&(volume, path.to_string()))
            .expect("no such file")
            .locked = locked;
    }

    fn dir_of(path: &str) -> Option<&str> {
        path.rsplit_once('/').map(|(dir, _)| dir)
    }

    fn gate(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

impl VolumeFs for MockFs {
    async fn file_size(&mut self, volume: VolumeId, path: &str) -> Result<u32, FsError> {
        let file = self
            .files
            .get(&(volume, path.to_string()))
            .ok_or(FsError::NotFound)?;
        if file.locked {
            return Err(FsError::Locked);
        }
        Ok(file.data.len() as u32)
    }

    async fn read_at(
        &mut self,
        volume: VolumeId,
        path: &str,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        self.reads += 1;
        if Self::gate(&mut self.fail_reads) {
            return Err(FsError::Io);
        }
        let short = core::mem::take(&mut self.short_read_once);
        let file = self
            .files
            .get(&(volume, path.to_string()))
            .ok_or(FsError::NotFound)?;
        let offset = offset as usize;
        if offset > file.data.len() {
            return Err(FsError::Io);
        }
        let mut n = buf.len().min(file.data.len() - offset);
        if short {
            n /= 2;
        }
        buf[..n].copy_from_slice(&file.data[offset..offset + n]);
        Ok(n)
    }

    async fn create(&mut self, volume: VolumeId, path: &str) -> Result<(), FsError> {
        match Self::dir_of(path) {
            Some(dir) if self.dirs.contains(&(volume, dir.to_string())) => {}
            _ => return Err(FsError::DirectoryMissing),
        }
        self.files.insert((volume, path.to_string()), MockFile::default());
        Ok(())
    }

    async fn append(&mut self, volume: VolumeId, path: &str, bytes: &[u8]) -> Result<(), FsError> {
        if Self::gate(&mut self.fail_appends) {
            return Err(FsError::Io);
        }
        let file = self
            .files
            .get_mut(&(volume, path.to_string()))
            .ok_or(FsError::NotFound)?;
        file.data.extend_from_slice(bytes);
        Ok(())
    }

    async fn remove(&mut self, volume: VolumeId, path: &str) -> Result<(), FsError> {
        self.files
            .remove(&(volume, path.to_string()))
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    async fn lock(&mut self, volume: VolumeId, path: &str) -> Result<(), FsError> {
        let file = self
            .files
            .get_mut(&(volume, path.to_string()))
            .ok_or(FsError::NotFound)?;
        if file.locked {
            return Err(FsError::Locked);
        }
        file.locked = true;
        Ok(())
    }

    async fn unlock(&mut self, volume: VolumeId, path: &str) -> Result<(), FsError> {
        let file = self
            .files
            .get_mut(&(volume, path.to_string()))
            .ok_or(FsError::NotFound)?;
        file.locked = false;
        Ok(())
    }
}
