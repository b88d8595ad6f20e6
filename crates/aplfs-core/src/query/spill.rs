//! Buffered writer that promotes itself to a temp file on overflow.

use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;

/// Sink that buffers in memory up to `limit` bytes, then switches to a temp
/// file, flushing the buffered prefix first. `finish` reports which mode the
/// writer ended in.
pub struct SpillWriter {
    limit: usize,
    buffer: Vec<u8>,
    file: Option<NamedTempFile>,
    written: u64,
    temp_dir: Option<PathBuf>,
}

pub enum SpillOutcome {
    Memory(Vec<u8>),
    Spilled { file: NamedTempFile, size: u64 },
}

impl SpillWriter {
    pub fn new(limit: usize, temp_dir: Option<PathBuf>) -> Self {
        Self {
            limit,
            buffer: Vec::new(),
            file: None,
            written: 0,
            temp_dir,
        }
    }

    fn open_spill_file(&self) -> std::io::Result<NamedTempFile> {
        match &self.temp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                NamedTempFile::with_prefix_in("aplfs-", dir)
            }
            None => NamedTempFile::with_prefix("aplfs-"),
        }
    }

    pub fn finish(mut self) -> std::io::Result<SpillOutcome> {
        match self.file.take() {
            Some(mut file) => {
                file.flush()?;
                Ok(SpillOutcome::Spilled {
                    file,
                    size: self.written,
                })
            }
            None => Ok(SpillOutcome::Memory(self.buffer)),
        }
    }
}

impl Write for SpillWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.file.is_none() && self.limit > 0 && self.buffer.len() + buf.len() > self.limit {
            let mut file = self.open_spill_file()?;
            file.write_all(&self.buffer)?;
            self.written = self.buffer.len() as u64;
            self.buffer = Vec::new();
            self.file = Some(file);
        }
        match &mut self.file {
            Some(file) => {
                let n = file.write(buf)?;
                self.written += n as u64;
                Ok(n)
            }
            None => self.buffer.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_writes_stay_in_memory() {
        let mut writer = SpillWriter::new(1024, None);
        writer.write_all(b"hello").unwrap();
        match writer.finish().unwrap() {
            SpillOutcome::Memory(bytes) => assert_eq!(bytes, b"hello"),
            SpillOutcome::Spilled { .. } => panic!("unexpected spill"),
        }
    }

    #[test]
    fn overflow_spills_with_buffered_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpillWriter::new(8, Some(dir.path().to_path_buf()));
        writer.write_all(b"aaaa").unwrap();
        writer.write_all(b"bbbbbb").unwrap();
        match writer.finish().unwrap() {
            SpillOutcome::Spilled { file, size } => {
                assert_eq!(size, 10);
                let data = std::fs::read(file.path()).unwrap();
                assert_eq!(data, b"aaaabbbbbb");
            }
            SpillOutcome::Memory(_) => panic!("expected spill"),
        }
    }

    #[test]
    fn zero_limit_never_spills() {
        let mut writer = SpillWriter::new(0, None);
        writer.write_all(&vec![0u8; 1 << 16]).unwrap();
        assert!(matches!(
            writer.finish().unwrap(),
            SpillOutcome::Memory(bytes) if bytes.len() == 1 << 16
        ));
    }

    #[test]
    fn spill_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SpillWriter::new(1, Some(dir.path().to_path_buf()));
        writer.write_all(b"abcdef").unwrap();
        let path = match writer.finish().unwrap() {
            SpillOutcome::Spilled { file, .. } => {
                let path = file.path().to_path_buf();
                assert!(path.exists());
                drop(file);
                path
            }
            SpillOutcome::Memory(_) => panic!("expected spill"),
        };
        assert!(!path.exists());
    }
}
