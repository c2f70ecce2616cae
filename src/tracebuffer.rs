//! Tracebuffer assembly and file manager (§4.3, §4.6): computes the file
//! layout, creates files atomically via temp-then-link, validates the
//! header on open, and keeps a process-local, refcounted table of open
//! handles keyed by name.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use nix::unistd::linkat;

use crate::crc8::crc8;
use crate::definition::{self, Definition, SourceKind};
use crate::error::{Error, Result};
use crate::ring::RingHead;
use crate::stack::StackHead;

pub const MAGIC: [u8; 16] = *b"?#$~tracebuffer\0";
pub const VERSION: u64 = 1;
/// Compatibility is checked against `version & VERSION_MASK`, leaving the
/// upper bits free for future non-breaking extension flags.
pub const VERSION_MASK: u64 = 0x0000_0000_FFFF_FFFF;

const HEADER_LEN: usize = 56;
const HEADER_CRC_LEN: usize = 55;

/// Default body capacity reserved for a dynamically-created (runtime-named)
/// tracebuffer, per §4.8.
pub const DYNAMIC_TRACEBUFFER_DEFAULT_CAPACITY: usize = 10 * 1024;

/// Fixed body capacity reserved for the unique-stack section. See
/// `stack.rs`'s module doc comment for why this isn't grown dynamically.
pub const DEFAULT_STACK_CAPACITY: usize = 64 * 1024;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

struct Layout {
    def_off: usize,
    def_size: usize,
    rb_off: usize,
    rb_size: usize,
    stack_off: usize,
    stack_size: usize,
    file_size: usize,
}

fn compute_layout(name_len: usize, requested_capacity: usize, stack_capacity: usize) -> Layout {
    let def_off = HEADER_LEN;
    let def_size = definition::calculate_size(name_len);
    let rb_off = align_up(def_off + def_size, 8);
    // `size_of::<RingHead>()`/`size_of::<StackHead>()` already include their
    // `mutex` field (§3's data model lists `mutex` as the first RingHead
    // field and StackHead's second), so the formula's separate
    // "+ sizeof(Mutex)" term double-counts it; we treat the struct sizes as
    // authoritative and drop that term rather than reserve dead bytes.
    let rb_size = std::mem::size_of::<RingHead>() + requested_capacity + 1;
    let stack_off = align_up(rb_off + rb_size, 8);
    let stack_size = std::mem::size_of::<StackHead>() + stack_capacity;
    let file_size = stack_off + stack_size;
    Layout {
        def_off,
        def_size,
        rb_off,
        rb_size,
        stack_off,
        stack_size,
        file_size,
    }
}

/// An open, mmap'd tracebuffer file. Holds the mapping alive for as long as
/// any handle referencing it exists.
pub struct Mapping {
    ptr: *mut u8,
    len: usize,
    _file: File,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munmap(self.ptr as *mut std::ffi::c_void, self.len);
        }
    }
}

impl Mapping {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn region(&self, off: usize, len: usize) -> &[u8] {
        &self.as_slice()[off..off + len]
    }

    pub fn region_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        &mut self.as_mut_slice()[off..off + len]
    }
}

/// Handle to an open tracebuffer, reference-counted by [`FileManager`].
pub struct Tracebuffer {
    pub name: String,
    pub mapping: Mapping,
    pub def_off: usize,
    pub rb_off: usize,
    pub stack_off: usize,
}

impl Tracebuffer {
    /// Reads and validates the 56-byte file header. Aborts the process (per
    /// §4.6: "a tracebuffer file under the expected name that is not a
    /// valid tracebuffer file is an unrecoverable misconfiguration") if the
    /// magic, version, or CRC don't check out.
    fn validate_header(region: &[u8]) -> (usize, usize, usize) {
        if region.len() < HEADER_LEN {
            crate::error::abort("tracebuffer file shorter than its own header");
        }
        if region[0..16] != MAGIC {
            crate::error::abort("tracebuffer file magic mismatch");
        }
        let version = u64::from_le_bytes(region[16..24].try_into().unwrap());
        if version & VERSION_MASK != VERSION & VERSION_MASK {
            crate::error::abort("tracebuffer file version incompatible");
        }
        let crc = region[55];
        if crc8(&region[0..HEADER_CRC_LEN]) != crc {
            crate::error::abort("tracebuffer file header CRC mismatch");
        }
        let def_off = u64::from_le_bytes(region[24..32].try_into().unwrap()) as usize;
        let rb_off = u64::from_le_bytes(region[32..40].try_into().unwrap()) as usize;
        let stack_off = u64::from_le_bytes(region[40..48].try_into().unwrap()) as usize;
        (def_off, rb_off, stack_off)
    }

    fn write_header(region: &mut [u8], def_off: usize, rb_off: usize, stack_off: usize) {
        region[0..16].copy_from_slice(&MAGIC);
        region[16..24].copy_from_slice(&VERSION.to_le_bytes());
        region[24..32].copy_from_slice(&(def_off as u64).to_le_bytes());
        region[32..40].copy_from_slice(&(rb_off as u64).to_le_bytes());
        region[40..48].copy_from_slice(&(stack_off as u64).to_le_bytes());
        region[48..55].copy_from_slice(&[0u8; 7]);
        let crc = crc8(&region[0..HEADER_CRC_LEN]);
        region[55] = crc;
    }

    pub fn definition(&self) -> Result<Definition<'_>> {
        // SAFETY: the mapping outlives this borrow; `region_mut` below takes
        // `&mut self.mapping` only transiently through an unsafe alias since
        // Definition/RingBuffer/StackDict each need disjoint, non-overlapping
        // byte ranges of the same mapping.
        let region = unsafe {
            std::slice::from_raw_parts_mut(
                self.mapping.ptr.add(self.def_off),
                self.rb_off - self.def_off,
            )
        };
        Definition::open(region)
    }

    pub fn ring(&self) -> Option<crate::ring::RingBuffer<'_>> {
        let region = unsafe {
            std::slice::from_raw_parts_mut(
                self.mapping.ptr.add(self.rb_off),
                self.stack_off - self.rb_off,
            )
        };
        crate::ring::RingBuffer::open(region)
    }

    pub fn stack(&self) -> Option<crate::stack::StackDict<'_>> {
        let len = self.mapping.len - self.stack_off;
        let region = unsafe {
            std::slice::from_raw_parts_mut(self.mapping.ptr.add(self.stack_off), len)
        };
        crate::stack::StackDict::open(region, self.stack_off as u64)
    }
}

fn resolve_tracing_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var("CLLTK_TRACING_PATH") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn mmap_file(file: &File, len: usize) -> Result<Mapping> {
    let ptr = unsafe {
        mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    }
    .map_err(|e| Error::Nix { inner: e })?;
    Ok(Mapping {
        ptr: ptr as *mut u8,
        len,
        _file: file.try_clone().map_err(|e| Error::Io { inner: e })?,
    })
}

fn extend_to(file: &File, size: usize) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file.try_clone().map_err(|e| Error::Io { inner: e })?;
    f.seek(SeekFrom::Start(size as u64 - 1))
        .map_err(|e| Error::Io { inner: e })?;
    let n = f.write(&[0u8]).map_err(|e| Error::Io { inner: e })?;
    if n != 1 {
        crate::error::abort("short write while extending tracebuffer file");
    }
    Ok(())
}

/// Creates (or, racing another creator, opens) the tracebuffer file named
/// `name` under `root`, following §4.3's atomic create protocol and §4.6's
/// layout and population order.
fn create_or_open(
    root: &Path,
    name: &str,
    requested_capacity: usize,
    stack_capacity: usize,
    source_kind: SourceKind,
) -> Result<Tracebuffer> {
    let final_path = root.join(format!("{}.clltk_trace", name));
    if let Ok(file) = OpenOptions::new().read(true).write(true).open(&final_path) {
        return open_existing(file, name);
    }

    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let temp_path = root.join(format!("{}~{:x}.clltk_trace", name, ns));

    let layout = compute_layout(name.len(), requested_capacity, stack_capacity);

    let temp_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .custom_flags(libc::O_SYNC)
        .open(&temp_path)
        .map_err(|e| Error::Io { inner: e })?;
    extend_to(&temp_file, layout.file_size)?;
    let mut mapping = mmap_file(&temp_file, layout.file_size)?;

    {
        let region = mapping.as_mut_slice();
        Tracebuffer::write_header(region, layout.def_off, layout.rb_off, layout.stack_off);
        {
            let def_region = &mut region[layout.def_off..layout.def_off + layout.def_size];
            Definition::init(def_region, name, source_kind)?;
        }
        {
            let rb_region = &mut region[layout.rb_off..layout.rb_off + layout.rb_size];
            crate::ring::RingBuffer::init(rb_region).ok_or_else(|| Error::BadHeader {
                inner: "ring buffer region too small during create".into(),
            })?;
        }
        {
            let stack_region = &mut region[layout.stack_off..layout.stack_off + layout.stack_size];
            crate::stack::StackDict::init(stack_region, layout.stack_off as u64).ok_or_else(
                || Error::BadHeader {
                    inner: "stack region too small during create".into(),
                },
            )?;
        }
    }

    let linked = linkat(
        None,
        temp_path.as_path(),
        None,
        final_path.as_path(),
        nix::unistd::LinkatFlags::NoSymlinkFollow,
    );

    match linked {
        Ok(()) => {
            drop(mapping);
            let _ = std::fs::remove_file(&temp_path);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&final_path)
                .map_err(|e| Error::Io { inner: e })?;
            open_existing(file, name)
        }
        Err(nix::errno::Errno::EEXIST) => {
            drop(mapping);
            let _ = std::fs::remove_file(&temp_path);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&final_path)
                .map_err(|e| Error::Io { inner: e })?;
            open_existing(file, name)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            Err(Error::Nix { inner: e })
        }
    }
}

fn open_existing(file: File, name: &str) -> Result<Tracebuffer> {
    let len = file
        .metadata()
        .map_err(|e| Error::Io { inner: e })?
        .len() as usize;
    let mapping = mmap_file(&file, len)?;
    let (def_off, rb_off, stack_off) = Tracebuffer::validate_header(mapping.as_slice());
    Ok(Tracebuffer {
        name: name.to_string(),
        mapping,
        def_off,
        rb_off,
        stack_off,
    })
}

/// Process-local, refcounted table of open tracebuffers, keyed by name
/// (§4.3, §3 "Ownership / lifecycle"). Reference counting happens through
/// `Arc`; the table itself only ever holds a weak-equivalent strong clone,
/// cleaned up lazily on next lookup once the caller's last `Arc` drops.
pub struct FileManager {
    root: PathBuf,
    open: Mutex<HashMap<String, std::sync::Weak<Tracebuffer>>>,
}

impl FileManager {
    pub fn new(explicit_root: Option<&Path>) -> Self {
        FileManager {
            root: resolve_tracing_root(explicit_root),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the open handle for `name`, creating the backing file with
    /// `requested_capacity` bytes of ring body if it doesn't exist yet.
    pub fn open_or_create(
        &self,
        name: &str,
        requested_capacity: usize,
        source_kind: SourceKind,
    ) -> Result<Arc<Tracebuffer>> {
        let mut table = self.open.lock().unwrap();
        if let Some(weak) = table.get(name) {
            if let Some(strong) = weak.upgrade() {
                return Ok(strong);
            }
        }
        let tb = create_or_open(
            &self.root,
            name,
            requested_capacity,
            DEFAULT_STACK_CAPACITY,
            source_kind,
        )?;
        let arc = Arc::new(tb);
        table.insert(name.to_string(), Arc::downgrade(&arc));
        Ok(arc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sections_are_eight_byte_aligned_and_ordered() {
        let layout = compute_layout(8, 4096, 1024);
        assert_eq!(layout.def_off % 8, 0);
        assert_eq!(layout.rb_off % 8, 0);
        assert_eq!(layout.stack_off % 8, 0);
        assert!(layout.rb_off >= layout.def_off + layout.def_size);
        assert!(layout.stack_off >= layout.rb_off + layout.rb_size);
        assert_eq!(layout.file_size, layout.stack_off + layout.stack_size);
    }

    #[test]
    fn header_roundtrips_and_validates() {
        let mut region = vec![0u8; HEADER_LEN];
        Tracebuffer::write_header(&mut region, 56, 200, 8000);
        let (d, r, s) = Tracebuffer::validate_header(&region);
        assert_eq!((d, r, s), (56, 200, 8000));
    }

    #[test]
    fn create_then_reopen_yields_same_name_and_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileManager::new(Some(dir.path()));
        let a = mgr
            .open_or_create("unit_test_buf", 4096, SourceKind::Userspace)
            .unwrap();
        assert_eq!(a.name, "unit_test_buf");
        let b = mgr
            .open_or_create("unit_test_buf", 4096, SourceKind::Userspace)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
