//! Ground-commanded file management: copy one file to another location on the
//! active SD volume.
//!
//! Second instantiation of the bounded-step pattern, independent of the image
//! engine: one chunk per work unit, resumable across ticks, at most one
//! request in flight. Unlike the image engine there is no retry budget — any
//! I/O error, including a short read or write, terminates the request with a
//! failure report. The source is locked for the duration so concurrent ground
//! activity cannot shear the copy.

use crate::{
    ClientId, CopyError, FilePath, FsError, TimeBudget, VolumeAccess, VolumeFs, VolumeId,
};

/// Bytes moved per work unit.
pub const CHUNK: usize = 512;

/// Terminal reply to the requester of one file copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileCopyReport {
    pub client: ClientId,
    pub result: Result<(), CopyError>,
}

struct FileCopyOp {
    from: FilePath,
    to: FilePath,
    client: ClientId,
    volume: VolumeId,
    byte_index: u32,
    /// None until the first step resolved the source and created the
    /// destination.
    file_size: Option<u32>,
    locked: bool,
}

/// File-to-file copy state machine.
pub struct FileCopier {
    op: Option<FileCopyOp>,
    buf: [u8; CHUNK],
}

impl FileCopier {
    pub fn new() -> Self {
        Self { op: None, buf: [0; CHUNK] }
    }

    pub fn is_idle(&self) -> bool {
        self.op.is_none()
    }

    /// Accept one copy request; `Busy` while another is active. Acquires the
    /// volume and pins it for the whole operation.
    pub fn accept<V: VolumeAccess>(
        &mut self,
        client: ClientId,
        from: FilePath,
        to: FilePath,
        volumes: &mut V,
    ) -> Result<(), CopyError> {
        if self.op.is_some() {
            return Err(CopyError::Busy);
        }
        if volumes.switch_pending() {
            return Err(CopyError::VolumeChangePending);
        }
        volumes.acquire();
        self.op = Some(FileCopyOp {
            from,
            to,
            client,
            volume: volumes.current_volume(),
            byte_index: 0,
            file_size: None,
            locked: false,
        });
        Ok(())
    }

    /// Make bounded progress; returns the terminal reply when the request
    /// completes or fails.
    pub async fn tick<S, V, B>(
        &mut self,
        fs: &mut S,
        volumes: &mut V,
        budget: &mut B,
    ) -> Option<FileCopyReport>
    where
        S: VolumeFs,
        V: VolumeAccess,
        B: TimeBudget,
    {
        let result = self.tick_inner(fs, budget).await?;
        let op = self.op.take()?;
        if op.locked {
            let _ = fs.unlock(op.volume, &op.from).await;
        }
        volumes.release();
        Some(FileCopyReport { client: op.client, result })
    }

    /// Cancel between steps; unlocks the source and frees the volume.
    pub async fn cancel<S, V>(&mut self, fs: &mut S, volumes: &mut V) -> Option<FileCopyReport>
    where
        S: VolumeFs,
        V: VolumeAccess,
    {
        let op = self.op.take()?;
        if op.locked {
            let _ = fs.unlock(op.volume, &op.from).await;
        }
        volumes.release();
        Some(FileCopyReport { client: op.client, result: Err(CopyError::Cancelled) })
    }

    async fn tick_inner<S, B>(&mut self, fs: &mut S, budget: &mut B) -> Option<Result<(), CopyError>>
    where
        S: VolumeFs,
        B: TimeBudget,
    {
        loop {
            let op = self.op.as_mut()?;
            if budget.exhausted() {
                return None;
            }
            match op.file_size {
                None => {
                    let size = match fs.file_size(op.volume, &op.from).await {
                        Ok(size) => size,
                        Err(e) => return Some(Err(source_error(e))),
                    };
                    if let Err(e) = fs.lock(op.volume, &op.from).await {
                        return Some(Err(source_error(e)));
                    }
                    op.locked = true;
                    if let Err(e) = fs.create(op.volume, &op.to).await {
                        return Some(Err(dest_error(e)));
                    }
                    op.file_size = Some(size);
                    budget.record_unit();
                }
                Some(size) if op.byte_index >= size => return Some(Ok(())),
                Some(size) => {
                    let want = (CHUNK as u32).min(size - op.byte_index) as usize;
                    let chunk = &mut self.buf[..want];
                    match fs.read_at(op.volume, &op.from, op.byte_index, chunk).await {
                        Ok(n) if n == want => {}
                        // A short read silently accepted would truncate the
                        // destination; it is an error here.
                        Ok(_) => return Some(Err(CopyError::ReadError)),
                        Err(e) => return Some(Err(source_error(e))),
                    }
                    if let Err(e) = fs.append(op.volume, &op.to, chunk).await {
                        return Some(Err(dest_error(e)));
                    }
                    op.byte_index += want as u32;
                    budget.record_unit();
                }
            }
        }
    }
}

impl Default for FileCopier {
    fn default() -> Self {
        Self::new()
    }
}

fn source_error(e: FsError) -> CopyError {
    match e {
        FsError::NotFound | FsError::DirectoryMissing => CopyError::SourceNotFound,
        FsError::Locked => CopyError::SourceLocked,
        FsError::Io => CopyError::ReadError,
    }
}

fn dest_error(e: FsError) -> CopyError {
    match e {
        FsError::NotFound | FsError::DirectoryMissing => CopyError::DestinationDirectoryMissing,
        FsError::Locked | FsError::Io => CopyError::WriteError,
    }
}
