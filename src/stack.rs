//! Unique stack (§4.5): a content-addressed, append-only dictionary of
//! metadata blobs within a tracebuffer file, deduplicated by MD5 of
//! `body_size || blob`. `add` is the only mutation; it always runs under
//! the section's own [`RobustMutex`] and returns the file offset of the
//! blob's body, which is exactly the value trace entries store as
//! `in_file_offset`.
//!
//! §4.6's layout formula reserves no growth room for this section beyond
//! its header (`stack_size = sizeof(Mutex) + sizeof(StackHead)`), since the
//! "hard part" the design calls out is the content-addressing protocol, not
//! dynamic file growth. Rather than implement `mremap`-based file growth
//! (coordinating every open handle's mapping across processes), this
//! implementation reserves a fixed body capacity at creation time and
//! `add` returns `None` once it's exhausted — see `DESIGN.md`.

use md5::{Digest, Md5};

use crate::crc8::crc8;
use crate::mutex::RobustMutex;

/// md5(16) + reserved(8) + body_size(8) + crc8(1)
pub const STACK_ENTRY_OVERHEAD: usize = 16 + 8 + 8 + 1;

#[repr(C)]
pub struct StackHead {
    version: u64,
    pub mutex: RobustMutex,
    reserved: u64,
    body_size: u64,
}

const _: () = assert!(std::mem::size_of::<StackHead>() == 88);

impl StackHead {
    pub const HEADER_LEN: usize = std::mem::size_of::<StackHead>();
}

pub struct StackDict<'a> {
    head: &'a mut StackHead,
    body: &'a mut [u8],
    /// Absolute offset of `body[0]` within the tracebuffer file, so `add`
    /// can return a genuine file offset rather than a section-relative one.
    body_file_base: u64,
}

impl<'a> StackDict<'a> {
    pub fn init(region: &'a mut [u8], section_file_offset: u64) -> Option<Self> {
        if region.len() <= StackHead::HEADER_LEN {
            return None;
        }
        let (head_bytes, body) = region.split_at_mut(StackHead::HEADER_LEN);
        unsafe {
            RobustMutex::init_in_place(
                head_bytes[offset_of_mutex()..].as_mut_ptr(),
            );
        }
        let head = unsafe { &mut *(head_bytes.as_mut_ptr() as *mut StackHead) };
        head.version = 1;
        head.reserved = 0;
        head.body_size = 0;
        Some(StackDict {
            head,
            body,
            body_file_base: section_file_offset + StackHead::HEADER_LEN as u64,
        })
    }

    pub fn open(region: &'a mut [u8], section_file_offset: u64) -> Option<Self> {
        if region.len() <= StackHead::HEADER_LEN {
            return None;
        }
        let (head_bytes, body) = region.split_at_mut(StackHead::HEADER_LEN);
        let head = unsafe { &mut *(head_bytes.as_mut_ptr() as *mut StackHead) };
        Some(StackDict {
            head,
            body,
            body_file_base: section_file_offset + StackHead::HEADER_LEN as u64,
        })
    }

    pub fn mutex(&self) -> &RobustMutex {
        &self.head.mutex
    }

    pub fn version(&self) -> u64 {
        self.head.version
    }

    fn hash_of(blob: &[u8]) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update((blob.len() as u64).to_le_bytes());
        hasher.update(blob);
        hasher.finalize().into()
    }

    /// Looks up `blob` by content; returns the existing body's file offset
    /// on a hit, otherwise appends a new entry and returns its file
    /// offset. `None` means the section's reserved capacity is exhausted.
    pub fn add(&mut self, blob: &[u8]) -> Option<u64> {
        let hash = Self::hash_of(blob);

        let mut rel = 0usize;
        while rel < self.head.body_size as usize {
            let entry = self.read_entry(rel)?;
            if entry.md5 == hash && entry.body == blob {
                return Some(self.body_file_base + (rel + STACK_ENTRY_OVERHEAD) as u64);
            }
            rel += STACK_ENTRY_OVERHEAD + entry.body.len();
        }

        let needed = STACK_ENTRY_OVERHEAD + blob.len();
        let used = self.head.body_size as usize;
        if used + needed > self.body.len() {
            return None;
        }

        let start = used;
        self.body[start..start + 16].copy_from_slice(&hash);
        self.body[start + 16..start + 24].copy_from_slice(&0u64.to_le_bytes());
        self.body[start + 24..start + 32].copy_from_slice(&(blob.len() as u64).to_le_bytes());
        let crc = crc8(&self.body[start..start + 32]);
        self.body[start + 32] = crc;
        self.body[start + 33..start + 33 + blob.len()].copy_from_slice(blob);

        self.head.body_size = (used + needed) as u64;
        Some(self.body_file_base + (start + STACK_ENTRY_OVERHEAD) as u64)
    }

    /// Reads the blob stored at a file offset previously returned by
    /// `add` (i.e. an `in_file_offset` from a trace entry).
    pub fn get_by_file_offset(&self, file_offset: u64) -> Option<Vec<u8>> {
        let body_off = file_offset.checked_sub(self.body_file_base)?;
        let rel = (body_off as usize).checked_sub(STACK_ENTRY_OVERHEAD)?;
        self.read_entry(rel).map(|e| e.body.to_vec())
    }

    fn read_entry(&self, rel: usize) -> Option<DecodedEntry<'_>> {
        if rel + STACK_ENTRY_OVERHEAD > self.body.len() {
            return None;
        }
        let md5: [u8; 16] = self.body[rel..rel + 16].try_into().ok()?;
        let body_size = u64::from_le_bytes(self.body[rel + 24..rel + 32].try_into().ok()?) as usize;
        let stored_crc = self.body[rel + 32];
        if crc8(&self.body[rel..rel + 32]) != stored_crc {
            return None;
        }
        let body_start = rel + STACK_ENTRY_OVERHEAD;
        let body_end = body_start.checked_add(body_size)?;
        if body_end > self.body.len() {
            return None;
        }
        Some(DecodedEntry {
            md5,
            body: &self.body[body_start..body_end],
        })
    }

    /// Walks every entry, reconciling `body_size` against what the linear
    /// scan actually finds valid (§5: "`body_size` is reconciled if scan
    /// reveals more valid data" after an owner-death recovery). Returns the
    /// number of entries found consistent.
    pub fn validate_and_reconcile(&mut self) -> u64 {
        let mut rel = 0usize;
        let mut count = 0u64;
        loop {
            match self.read_entry(rel) {
                Some(entry) => {
                    rel += STACK_ENTRY_OVERHEAD + entry.body.len();
                    count += 1;
                }
                None => break,
            }
        }
        self.head.body_size = rel as u64;
        count
    }
}

struct DecodedEntry<'a> {
    md5: [u8; 16],
    body: &'a [u8],
}

fn offset_of_mutex() -> usize {
    std::mem::offset_of!(StackHead, mutex)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_dict(body_bytes: usize) -> Box<[u8]> {
        vec![0u8; StackHead::HEADER_LEN + body_bytes].into_boxed_slice()
    }

    #[test]
    fn add_and_get_roundtrip() {
        let mut region = new_dict(1024);
        let mut dict = StackDict::init(&mut region, 0).unwrap();
        let off = dict.add(b"frame1;frame2;frame3").unwrap();
        assert_eq!(dict.get_by_file_offset(off).unwrap(), b"frame1;frame2;frame3");
    }

    #[test]
    fn identical_blobs_deduplicate() {
        let mut region = new_dict(1024);
        let mut dict = StackDict::init(&mut region, 0).unwrap();
        let a = dict.add(b"same;stack").unwrap();
        let b = dict.add(b"same;stack").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_blobs_get_distinct_offsets() {
        let mut region = new_dict(1024);
        let mut dict = StackDict::init(&mut region, 0).unwrap();
        let a = dict.add(b"stack;a").unwrap();
        let b = dict.add(b"stack;b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn body_size_grows_by_overhead_plus_blob_len() {
        let mut region = new_dict(1024);
        let mut dict = StackDict::init(&mut region, 0).unwrap();
        dict.add(&[7u8; 50]).unwrap();
        assert_eq!(dict.head.body_size as usize, STACK_ENTRY_OVERHEAD + 50);
        dict.add(&[9u8; 50]).unwrap();
        assert_eq!(dict.head.body_size as usize, 2 * (STACK_ENTRY_OVERHEAD + 50));
    }

    #[test]
    fn full_dictionary_refuses_new_entries() {
        let mut region = new_dict(STACK_ENTRY_OVERHEAD + 4);
        let mut dict = StackDict::init(&mut region, 0).unwrap();
        assert!(dict.add(b"abcd").is_some());
        assert!(dict.add(b"efgh").is_none());
    }

    #[test]
    fn offsets_are_stable_across_reopen() {
        let mut region = new_dict(1024);
        let off = {
            let mut dict = StackDict::init(&mut region, 4096).unwrap();
            dict.add(b"hello").unwrap()
        };
        let dict = StackDict::open(&mut region, 4096).unwrap();
        assert_eq!(dict.get_by_file_offset(off).unwrap(), b"hello");
    }

    #[test]
    fn validate_reconciles_body_size_after_corruption() {
        let mut region = new_dict(1024);
        {
            let mut dict = StackDict::init(&mut region, 0).unwrap();
            dict.add(b"first").unwrap();
            dict.add(b"second").unwrap();
        }
        let corrupt_at = StackHead::HEADER_LEN + 5; // inside first entry's md5
        region[corrupt_at] ^= 0xFF;
        let mut dict = StackDict::open(&mut region, 0).unwrap();
        let count = dict.validate_and_reconcile();
        assert_eq!(count, 0);
        assert_eq!(dict.head.body_size, 0);
    }
}
