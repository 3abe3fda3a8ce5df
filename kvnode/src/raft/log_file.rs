use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

const HEADER_SIZE: u64 = 16; // 8 bytes for first_index + 8 bytes for last_index
const FRAME_HEADER_SIZE: u64 = 8; // 8 bytes for frame size

/// Append-only log of serialized Raft entries (`logs.dat`).
///
/// Layout: a fixed header followed by `[u64 length][bytes]` frames, one
/// per entry, contiguous from `first_index`. The log is never compacted;
/// the only removal is suffix truncation when a leader overwrites a
/// conflicting tail.
#[derive(Debug)]
pub struct LogFile {
    file: File,
    first_index: u64,
    last_index: u64,
    frame_positions: BTreeMap<u64, u64>, // index -> file position
}

#[derive(Debug, Serialize, Deserialize)]
struct LogHeader {
    first_index: u64,
    last_index: u64,
}

impl LogFile {
    pub fn open<P: AsRef<Path>>(path: P, first_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut log = LogFile {
            file,
            first_index,
            last_index: first_index - 1,
            frame_positions: BTreeMap::new(),
        };

        if log.file.metadata()?.len() == 0 {
            log.write_header()?;
        } else {
            log.read_header()?;
            log.rebuild_frame_positions()?;
        }

        Ok(log)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = LogHeader {
            first_index: self.first_index,
            last_index: self.last_index,
        };
        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;
        let header: LogHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.first_index = header.first_index;
        self.last_index = header.last_index;
        Ok(())
    }

    /// Walks the frames to rebuild the position index. The walk, not the
    /// header, decides the real extent: a torn tail from a crash mid-append
    /// is cut off here.
    fn rebuild_frame_positions(&mut self) -> io::Result<()> {
        self.frame_positions.clear();
        let file_len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos + FRAME_HEADER_SIZE <= file_len {
            self.file.seek(SeekFrom::Start(pos))?;
            let frame_size = self.read_frame_header()?;
            if pos + FRAME_HEADER_SIZE + frame_size > file_len {
                break;
            }
            let index = self.first_index + self.frame_positions.len() as u64;
            self.frame_positions.insert(index, pos);
            pos += FRAME_HEADER_SIZE + frame_size;
        }

        if pos < file_len {
            log::warn!("dropping torn log tail at offset {}", pos);
            self.file.set_len(pos)?;
        }

        self.last_index = self.first_index + self.frame_positions.len() as u64 - 1;
        self.write_header()?;
        Ok(())
    }

    fn write_frame_header(&mut self, size: u64) -> io::Result<()> {
        self.file.write_all(&size.to_le_bytes())?;
        Ok(())
    }

    fn read_frame_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; 8];
        self.file.read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    /// Appends frames starting at `start`. A start inside the current
    /// extent truncates the conflicting suffix first; a start beyond
    /// `last_index + 1` is a gap and is rejected.
    pub fn append(&mut self, start: u64, frames: &[Vec<u8>]) -> io::Result<()> {
        if start > self.last_index + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("log gap: appending {} after {}", start, self.last_index),
            ));
        }
        if start <= self.last_index {
            self.truncate_from(start)?;
        }

        let mut pos = self.file.seek(SeekFrom::End(0))?;
        for frame in frames {
            self.write_frame_header(frame.len() as u64)?;
            self.file.write_all(frame)?;
            self.last_index += 1;
            self.frame_positions.insert(self.last_index, pos);
            pos += FRAME_HEADER_SIZE + frame.len() as u64;
        }

        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read(&mut self, index: u64) -> io::Result<Vec<u8>> {
        if index < self.first_index || index > self.last_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "index out of range",
            ));
        }
        let pos = *self.frame_positions.get(&index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame position not found")
        })?;

        self.file.seek(SeekFrom::Start(pos))?;
        let frame_size = self.read_frame_header()?;
        let mut frame = vec![0u8; frame_size as usize];
        self.file.read_exact(&mut frame)?;
        Ok(frame)
    }

    /// Removes `from_index` and everything after it.
    pub fn truncate_from(&mut self, from_index: u64) -> io::Result<()> {
        if from_index < self.first_index || from_index > self.last_index {
            return Ok(());
        }
        let pos = *self.frame_positions.get(&from_index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame position not found")
        })?;
        self.file.set_len(pos)?;
        self.last_index = from_index - 1;
        self.frame_positions.split_off(&from_index);
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn is_empty(&self) -> bool {
        self.last_index < self.first_index
    }
}
