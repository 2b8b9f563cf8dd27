// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// ============================================================================
// Storage Traits
// ============================================================================

/// An open source or destination file, owned by one transfer.
pub trait FileHandle: Send {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;

    fn seek_to(&mut self, offset: u64) -> io::Result<()>;

    fn current_length(&self) -> io::Result<u64>;

    fn close(self: Box<Self>) -> io::Result<()>;
}

/// File store the engines read from and write into.
pub trait Storage: Send {
    fn open_read(&mut self, name: &str) -> io::Result<Box<dyn FileHandle>>;

    /// Open for writing, creating the file if absent. With `append` the
    /// existing contents are kept and writes go to the end; otherwise the
    /// file is truncated.
    fn open_write(&mut self, name: &str, append: bool) -> io::Result<Box<dyn FileHandle>>;
}

/// Strip directory components from a name announced by the remote.
pub fn sanitize_name(name: &str) -> Option<&str> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    match base {
        "" | "." | ".." => None,
        _ => Some(base),
    }
}

// ============================================================================
// Disk Storage
// ============================================================================

/// Files under a directory on the local filesystem
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskStorage { root: root.into() }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(Path::new(name))
    }
}

struct DiskFile {
    file: File,
}

impl FileHandle for DiskFile {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn current_length(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl Storage for DiskStorage {
    fn open_read(&mut self, name: &str) -> io::Result<Box<dyn FileHandle>> {
        let file = File::open(self.resolve(name))?;
        Ok(Box::new(DiskFile { file }))
    }

    fn open_write(&mut self, name: &str, append: bool) -> io::Result<Box<dyn FileHandle>> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!append)
            .open(self.resolve(name))?;
        file.seek(SeekFrom::End(0))?;
        Ok(Box::new(DiskFile { file }))
    }
}

// ============================================================================
// Memory Storage for Testing
// ============================================================================

#[cfg(test)]
pub use memory::MemoryStorage;

#[cfg(test)]
mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Shared {
        files: HashMap<String, Vec<u8>>,
        write_budget: Option<usize>,
    }

    /// In-memory store; clones share the same files.
    #[derive(Clone, Default)]
    pub struct MemoryStorage {
        shared: Arc<Mutex<Shared>>,
    }

    impl MemoryStorage {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, name: &str, data: &[u8]) {
            self.shared.lock().unwrap().files.insert(name.to_string(), data.to_vec());
        }

        pub fn get(&self, name: &str) -> Option<Vec<u8>> {
            self.shared.lock().unwrap().files.get(name).cloned()
        }

        pub fn names(&self) -> Vec<String> {
            let mut names: Vec<String> = self.shared.lock().unwrap().files.keys().cloned().collect();
            names.sort();
            names
        }

        /// Fail every write once `bytes` more bytes have been stored.
        pub fn fail_writes_after(&self, bytes: usize) {
            self.shared.lock().unwrap().write_budget = Some(bytes);
        }
    }

    struct MemoryFile {
        shared: Arc<Mutex<Shared>>,
        name: String,
        pos: usize,
    }

    impl FileHandle for MemoryFile {
        fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let shared = self.shared.lock().unwrap();
            let data = shared.files.get(&self.name).ok_or(io::ErrorKind::NotFound)?;
            let start = self.pos.min(data.len());
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            self.pos = start + n;
            Ok(n)
        }

        fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
            let mut shared = self.shared.lock().unwrap();
            if let Some(budget) = shared.write_budget.as_mut() {
                if *budget < bytes.len() {
                    return Err(io::Error::other("storage full"));
                }
                *budget -= bytes.len();
            }
            let data = shared.files.entry(self.name.clone()).or_default();
            let end = self.pos + bytes.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[self.pos..end].copy_from_slice(bytes);
            self.pos = end;
            Ok(())
        }

        fn seek_to(&mut self, offset: u64) -> io::Result<()> {
            self.pos = offset as usize;
            Ok(())
        }

        fn current_length(&self) -> io::Result<u64> {
            let shared = self.shared.lock().unwrap();
            Ok(shared.files.get(&self.name).map_or(0, |d| d.len() as u64))
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            Ok(())
        }
    }

    impl Storage for MemoryStorage {
        fn open_read(&mut self, name: &str) -> io::Result<Box<dyn FileHandle>> {
            if !self.shared.lock().unwrap().files.contains_key(name) {
                return Err(io::Error::new(io::ErrorKind::NotFound, format!("no file {}", name)));
            }
            Ok(Box::new(MemoryFile { shared: self.shared.clone(), name: name.to_string(), pos: 0 }))
        }

        fn open_write(&mut self, name: &str, append: bool) -> io::Result<Box<dyn FileHandle>> {
            let mut shared = self.shared.lock().unwrap();
            let data = shared.files.entry(name.to_string()).or_default();
            if !append {
                data.clear();
            }
            let pos = data.len();
            Ok(Box::new(MemoryFile { shared: self.shared.clone(), name: name.to_string(), pos }))
        }
    }
}
