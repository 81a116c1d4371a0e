use embedded_storage_async::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};

const PAGE: usize = 4096;
const PAGES: usize = 2;

/// RAM-backed NOR flash for exercising the sequential-storage metadata store.
pub struct MockNvm {
    mem: [u8; PAGES * PAGE],
}

#[derive(Debug)]
pub struct NvmError(NorFlashErrorKind);

impl NorFlashError for NvmError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

impl MockNvm {
    pub fn new() -> Self {
        Self { mem: [0xFF; PAGES * PAGE] }
    }
}

impl ErrorType for MockNvm {
    type Error = NvmError;
}

impl ReadNorFlash for MockNvm {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        if offset + bytes.len() > self.mem.len() {
            return Err(NvmError(NorFlashErrorKind::OutOfBounds));
        }
        bytes.copy_from_slice(&self.mem[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl NorFlash for MockNvm {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = PAGE;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from, to) = (from as usize, to as usize);
        if from % PAGE != 0 || to % PAGE != 0 || from > to {
            return Err(NvmError(NorFlashErrorKind::NotAligned));
        }
        if to > self.mem.len() {
            return Err(NvmError(NorFlashErrorKind::OutOfBounds));
        }
        self.mem[from..to].fill(0xFF);
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        if offset % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NvmError(NorFlashErrorKind::NotAligned));
        }
        if offset + bytes.len() > self.mem.len() {
            return Err(NvmError(NorFlashErrorKind::OutOfBounds));
        }
        for (dst, src) in self.mem[offset..offset + bytes.len()].iter_mut().zip(bytes) {
            *dst &= *src;
        }
        Ok(())
    }
}
