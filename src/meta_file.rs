//! Fixed-size, named metadata files. The segment and rebuild contexts
//! only see the `MetaFile` trait; `FileStore` puts them on disk inside a
//! locked `MetaDirectory` and `MemFile` keeps them in memory.

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fault_injection::{annotate, fallible, maybe};
use fs2::FileExt as _;
use parking_lot::{Mutex, RwLock};

use crate::{AddressInfo, Config, Error, Result};

const WARN: &str = "DO_NOT_PUT_YOUR_FILES_HERE";
const GEOMETRY_FILE: &str = "geometry";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaIoOpcode {
    Read,
    Write,
}

/// An asynchronous metadata request. The buffer travels with the request
/// and is handed back to the completion exactly once.
#[derive(Debug)]
pub struct AsyncMetaIo {
    pub opcode: MetaIoOpcode,
    pub offset: u64,
    pub buffer: Vec<u8>,
}

pub type AsyncMetaIoCallback = Box<dyn FnOnce(AsyncMetaIo, Result<()>) + Send>;

pub trait MetaFile: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn exists(&self) -> bool;

    /// Creates the file with a fixed size. Creating an existing file
    /// only adjusts its length.
    fn create(&self, size: u64) -> Result<()>;

    fn open(&self) -> Result<()>;

    fn close(&self);

    fn is_opened(&self) -> bool;

    fn size(&self) -> u64;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    fn submit_async(&self, io: AsyncMetaIo, done: AsyncMetaIoCallback);
}

fn check_bounds(name: &str, size: u64, offset: u64, len: usize) -> io::Result<()> {
    if offset.checked_add(len as u64).is_none_or(|end| end > size) {
        return Err(annotate!(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "metadata io on {} at offset {} length {} exceeds file size {}",
                name, offset, len, size
            )
        )));
    }
    Ok(())
}

fn not_open(name: &str) -> Error {
    Error::Io(annotate!(io::Error::new(
        io::ErrorKind::NotConnected,
        format!("metadata file {} is not open", name)
    )))
}

mod sys_io {
    use std::io;
    use std::os::unix::fs::FileExt;

    use super::*;

    pub fn read_exact_at<F: FileExt>(
        file: &F,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.read_exact_at(buf, offset))
    }

    pub fn write_all_at(
        file: &fs::File,
        buf: &[u8],
        offset: u64,
    ) -> io::Result<()> {
        maybe!(file.write_all_at(buf, offset))?;
        maybe!(file.sync_data())
    }
}

fn lock_directory(path: &Path) -> io::Result<fs::File> {
    if let Err(e) = fs::read_dir(path) {
        if e.kind() == io::ErrorKind::NotFound {
            fallible!(fs::create_dir_all(path));
        }
    }

    let _ = fs::File::create(path.join(WARN));

    let directory_lock = fallible!(fs::File::open(path));
    fallible!(directory_lock.try_lock_exclusive());
    Ok(directory_lock)
}

fn write_file_atomically(
    directory: &Path,
    name: &str,
    bytes: &[u8],
) -> io::Result<()> {
    let tmp_path = directory.join(format!("{}.tmp", name));
    let mut tmp = fallible!(
        fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
    );
    fallible!(io::Write::write_all(&mut tmp, bytes));
    fallible!(tmp.sync_all());
    drop(tmp);

    fallible!(fs::rename(&tmp_path, directory.join(name)));
    fallible!(fs::File::open(directory).and_then(|d| d.sync_all()));
    Ok(())
}

fn read_file_if_exists(path: &Path) -> io::Result<Option<Vec<u8>>> {
    let mut f = match fs::File::open(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(annotate!(e)),
        Ok(f) => f,
    };
    let mut buf = vec![];
    fallible!(f.read_to_end(&mut buf));
    Ok(Some(buf))
}

fn create_sized(path: &Path, size: u64) -> io::Result<()> {
    let file = fallible!(
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
    );
    fallible!(file.set_len(size));
    fallible!(file.sync_all());
    Ok(())
}

fn open_existing(path: &Path) -> io::Result<(fs::File, u64)> {
    let file =
        fallible!(fs::OpenOptions::new().read(true).write(true).open(path));
    let len = fallible!(file.metadata()).len();
    Ok((file, len))
}

/// A directory of metadata files, exclusively locked for the lifetime of
/// this value and tagged with the array geometry it was created for.
#[derive(Debug)]
pub struct MetaDirectory {
    path: PathBuf,
    _directory_lock: fs::File,
}

impl MetaDirectory {
    pub fn open(config: &Config) -> Result<MetaDirectory> {
        log::trace!("opening metadata directory at {:?}", config.path);

        let directory_lock = lock_directory(&config.path)?;

        let dir = MetaDirectory {
            path: config.path.clone(),
            _directory_lock: directory_lock,
        };

        dir.verify_geometry(config.address_info())?;

        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> FileStore {
        FileStore::new(name, self.path.join(name))
    }

    fn verify_geometry(&self, expected: AddressInfo) -> Result<()> {
        match self.read_geometry()? {
            Some(stored) if stored != expected => {
                Err(Error::Unsupported(format!(
                    "cannot change the array geometry across restarts. \
                     stored geometry: {:?}, requested geometry: {:?}",
                    stored, expected
                )))
            }
            Some(_) => Ok(()),
            None => self.write_geometry(expected),
        }
    }

    fn write_geometry(&self, geometry: AddressInfo) -> Result<()> {
        let mut bytes = bincode::serialize(&geometry).map_err(|e| {
            Error::ReportableBug(format!(
                "failed to serialize geometry {:?}: {}",
                geometry, e
            ))
        })?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());

        write_file_atomically(&self.path, GEOMETRY_FILE, &bytes)?;
        Ok(())
    }

    fn read_geometry(&self) -> Result<Option<AddressInfo>> {
        let path = self.path.join(GEOMETRY_FILE);
        let Some(buf) = read_file_if_exists(&path)? else {
            return Ok(None);
        };

        let corrupt = |reason: String| Error::Corruption {
            file: path.to_string_lossy().into_owned(),
            reason,
        };

        if buf.len() <= 4 {
            return Err(corrupt(format!("geometry file is {} bytes", buf.len())));
        }

        let crc_at = buf.len() - 4;
        let mut crc_arr = [0_u8; 4];
        crc_arr.copy_from_slice(&buf[crc_at..]);
        let crc_expected = u32::from_le_bytes(crc_arr);
        let crc_actual = crc32fast::hash(&buf[..crc_at]);
        if crc_expected != crc_actual {
            return Err(corrupt("crc mismatch".into()));
        }

        bincode::deserialize::<AddressInfo>(&buf[..crc_at])
            .map(Some)
            .map_err(|e| corrupt(e.to_string()))
    }
}

#[derive(Debug)]
struct FileStoreInner {
    name: String,
    path: PathBuf,
    size: AtomicU64,
    file: RwLock<Option<Arc<fs::File>>>,
}

/// A metadata file backed by a regular file.
#[derive(Debug, Clone)]
pub struct FileStore {
    inner: Arc<FileStoreInner>,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(name: &str, path: P) -> FileStore {
        FileStore {
            inner: Arc::new(FileStoreInner {
                name: name.to_owned(),
                path: path.as_ref().to_path_buf(),
                size: AtomicU64::new(0),
                file: RwLock::new(None),
            }),
        }
    }

    fn handle(&self) -> Result<Arc<fs::File>> {
        self.inner.file.read().clone().ok_or_else(|| not_open(&self.inner.name))
    }
}

impl MetaFile for FileStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn exists(&self) -> bool {
        self.inner.path.exists()
    }

    fn create(&self, size: u64) -> Result<()> {
        create_sized(&self.inner.path, size)?;
        self.inner.size.store(size, Ordering::Release);
        log::debug!(
            "created metadata file {:?} of {} bytes",
            self.inner.path,
            size
        );
        Ok(())
    }

    fn open(&self) -> Result<()> {
        let mut slot = self.inner.file.write();
        if slot.is_some() {
            return Ok(());
        }
        let (file, len) = open_existing(&self.inner.path)?;
        self.inner.size.store(len, Ordering::Release);
        *slot = Some(Arc::new(file));
        Ok(())
    }

    fn close(&self) {
        self.inner.file.write().take();
    }

    fn is_opened(&self) -> bool {
        self.inner.file.read().is_some()
    }

    fn size(&self) -> u64 {
        self.inner.size.load(Ordering::Acquire)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(&self.inner.name, self.size(), offset, buf.len())?;
        let file = self.handle()?;
        sys_io::read_exact_at(&*file, buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_bounds(&self.inner.name, self.size(), offset, buf.len())?;
        let file = self.handle()?;
        sys_io::write_all_at(&*file, buf, offset)?;
        Ok(())
    }

    fn submit_async(&self, mut io: AsyncMetaIo, done: AsyncMetaIoCallback) {
        let this = self.clone();
        rayon::spawn(move || {
            let res = match io.opcode {
                MetaIoOpcode::Read => {
                    let offset = io.offset;
                    this.read_at(offset, &mut io.buffer)
                }
                MetaIoOpcode::Write => this.write_at(io.offset, &io.buffer),
            };
            if let Err(e) = &res {
                log::error!(
                    "async {:?} on metadata file {} failed: {}",
                    io.opcode,
                    this.inner.name,
                    e
                );
            }
            done(io, res);
        });
    }
}

#[derive(Debug)]
struct MemFileInner {
    name: String,
    data: Mutex<Option<Vec<u8>>>,
    opened: AtomicBool,
    fail_io: AtomicBool,
}

/// An in-memory metadata file. Clones share the same contents, which is
/// how a restart is modelled: drop the owner, keep a clone, reopen.
#[derive(Debug, Clone)]
pub struct MemFile {
    inner: Arc<MemFileInner>,
}

impl MemFile {
    pub fn new(name: &str) -> MemFile {
        MemFile {
            inner: Arc::new(MemFileInner {
                name: name.to_owned(),
                data: Mutex::new(None),
                opened: AtomicBool::new(false),
                fail_io: AtomicBool::new(false),
            }),
        }
    }

    /// Makes every subsequent read or write fail until cleared.
    pub fn set_fail_io(&self, fail: bool) {
        self.inner.fail_io.store(fail, Ordering::SeqCst);
    }

    /// Raw contents, `None` if the file was never created.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.inner.data.lock().clone()
    }

    fn injected_failure(&self) -> Result<()> {
        if self.inner.fail_io.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::other(format!(
                "injected io failure on {}",
                self.inner.name
            ))));
        }
        Ok(())
    }
}

impl MetaFile for MemFile {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn exists(&self) -> bool {
        self.inner.data.lock().is_some()
    }

    fn create(&self, size: u64) -> Result<()> {
        let mut data = self.inner.data.lock();
        data.get_or_insert_with(Vec::new).resize(size as usize, 0);
        Ok(())
    }

    fn open(&self) -> Result<()> {
        if !self.exists() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("metadata file {} does not exist", self.inner.name),
            )));
        }
        self.inner.opened.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) {
        self.inner.opened.store(false, Ordering::Release);
    }

    fn is_opened(&self) -> bool {
        self.inner.opened.load(Ordering::Acquire)
    }

    fn size(&self) -> u64 {
        self.inner.data.lock().as_ref().map_or(0, |d| d.len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if !self.is_opened() {
            return Err(not_open(&self.inner.name));
        }
        self.injected_failure()?;
        let data = self.inner.data.lock();
        let data = data.as_ref().ok_or_else(|| not_open(&self.inner.name))?;
        check_bounds(&self.inner.name, data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.is_opened() {
            return Err(not_open(&self.inner.name));
        }
        self.injected_failure()?;
        let mut data = self.inner.data.lock();
        let data = data.as_mut().ok_or_else(|| not_open(&self.inner.name))?;
        check_bounds(&self.inner.name, data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn submit_async(&self, mut io: AsyncMetaIo, done: AsyncMetaIoCallback) {
        // completes on the submitting thread
        let res = match io.opcode {
            MetaIoOpcode::Read => {
                let offset = io.offset;
                self.read_at(offset, &mut io.buffer)
            }
            MetaIoOpcode::Write => self.write_at(io.offset, &io.buffer),
        };
        done(io, res);
    }
}
