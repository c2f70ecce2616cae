//! Tracepoint fast path (§4.8): the hot path invoked at every trace
//! callsite. Fills a `TraceEntryHead`, sizes and stages the argument
//! payload, then appends it to the ring buffer under the section mutex.
//!
//! The macro layer that builds a `Value` slice from real varargs is out of
//! scope (§1); resolving the callsite's `MetaEntry` through the unique
//! stack and CAS-caching the resulting file offset is not — §2/§5 name the
//! unique stack and the tracepoint fast path as core, in-scope components,
//! and [`resolve_or_cache`] is the runtime side of that: "first tracepoint
//! per compilation unit" resolution, modeled as a per-site atomic `u64`
//! initialized to `0` and CAS'd once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{self, ArgType, Value};
use crate::mutex::LockOutcome;
use crate::platform::{cached_pid_tid, timestamp_ns, Stage};
use crate::recoverable;
use crate::stack::StackDict;
use crate::tracebuffer::Tracebuffer;

/// `in_file_offset` reserved values (§3).
pub const OFFSET_UNSET: u64 = 0x00;
pub const OFFSET_DYNAMIC: u64 = 0x01;
pub const OFFSET_INVALID: u64 = 0xFF;

const HEAD_LEN: usize = 6 + 4 + 4 + 8; // in_file_offset(u48) + pid + tid + timestamp_ns

/// Bound enforced because a `RingEntry`'s `body_size` field is a `u16`.
const MAX_ENTRY_SIZE: usize = u16::MAX as usize;

const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(200);

fn write_trace_head(out: &mut [u8], in_file_offset: u64, pid: u32, tid: u32, timestamp_ns: u64) {
    let offset_bytes = in_file_offset.to_le_bytes();
    out[0..6].copy_from_slice(&offset_bytes[0..6]);
    out[6..10].copy_from_slice(&pid.to_le_bytes());
    out[10..14].copy_from_slice(&tid.to_le_bytes());
    out[14..22].copy_from_slice(&timestamp_ns.to_le_bytes());
}

/// Appends one pre-staged, fully-formed ring entry body, acquiring and
/// releasing the tracebuffer's ring mutex around the append (§4.8 step 6).
fn append(tb: &Tracebuffer, body: &[u8]) {
    let outcome = match tb.ring().unwrap().mutex().try_lock(ACQUIRE_TIMEOUT) {
        Ok(outcome) => outcome,
        Err(_) => {
            recoverable!("tracepoint: timed out acquiring ring mutex, dropping entry");
            return;
        }
    };
    // Recovery from a dead holder doesn't need extra repair here: the ring's
    // own CRC framing already tolerates a torn write left behind by the
    // previous owner, so `Recovered` is handled the same as `Locked`.
    if matches!(outcome, LockOutcome::Recovered) {
        tb.ring().unwrap().mutex().mark_consistent();
    }
    let mut ring = tb.ring().unwrap();
    ring.push(body);
    drop(ring);
    tb.ring().unwrap().mutex().unlock();
}

/// Resolves `meta_blob` (a callsite's encoded `MetaEntry`) to its
/// unique-stack file offset, CAS-caching the result into `site_offset` so
/// every tracepoint after the first at this callsite skips the stack mutex
/// entirely (§4.8 steps 1-6; spec: "first tracepoint per compilation unit
/// ... cache resulting file offset in per-site static"). `site_offset` must
/// start at `0`; racing callers that all observe `0` each resolve the blob
/// independently (content-addressing makes that safe) and only the winner
/// of the CAS is kept, so later callers see one consistent offset.
pub fn resolve_or_cache(tb: &Tracebuffer, site_offset: &AtomicU64, meta_blob: &[u8]) -> Option<u64> {
    let cached = site_offset.load(Ordering::Acquire);
    if cached != 0 {
        return Some(cached);
    }

    let mut stack: StackDict<'_> = tb.stack()?;
    let outcome = match stack.mutex().try_lock(ACQUIRE_TIMEOUT) {
        Ok(outcome) => outcome,
        Err(_) => {
            recoverable!("tracepoint: timed out acquiring stack mutex, dropping site resolution");
            return None;
        }
    };
    // Owner-death recovery on the stack mutex (§5): body_size is the only
    // torn field, so reconcile it by re-scanning before trusting the
    // section, then restore consistency for the next acquirer.
    if matches!(outcome, LockOutcome::Recovered) {
        stack.validate_and_reconcile();
        stack.mutex().mark_consistent();
    }
    let resolved = stack.add(meta_blob);
    stack.mutex().unlock();

    let offset = resolved?;
    match site_offset.compare_exchange(0, offset, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Some(offset),
        Err(existing) => Some(existing),
    }
}

/// Fast path for a statically-resolved printf-style tracepoint. `in_file_offset`
/// must already be the unique-stack file offset of the callsite's
/// `MetaEntry` (steps 1-6 of §4.8).
pub fn emit_static(
    tb: &Tracebuffer,
    in_file_offset: u64,
    arg_types: &[ArgType],
    values: &[Value],
) {
    if in_file_offset <= OFFSET_INVALID {
        recoverable!("tracepoint: in_file_offset not resolved to a static site, dropping");
        return;
    }

    let args_len = codec::size_of_args(arg_types, values);
    let total = HEAD_LEN + args_len;
    if total >= MAX_ENTRY_SIZE {
        recoverable!("tracepoint: entry too large for a u16 ring body_size, dropping");
        return;
    }

    let (pid, tid) = cached_pid_tid();
    let mut stage = Stage::for_size(total);
    let buf = stage.as_mut_slice();
    write_trace_head(buf, in_file_offset, pid, tid, timestamp_ns());
    if let Err(e) = codec::encode_args(arg_types, values, &mut buf[HEAD_LEN..]) {
        recoverable!("tracepoint: argument serialization failed: {}, dropping", e);
        return;
    }

    append(tb, stage.as_slice());
}

/// Dump tracepoint fast path: identical framing, but the payload is a raw
/// `{ u32 size; bytes }` blob with no sizing pass over typed arguments.
pub fn emit_dump(tb: &Tracebuffer, in_file_offset: u64, data: &[u8]) {
    if in_file_offset <= OFFSET_INVALID {
        recoverable!("tracepoint: in_file_offset not resolved to a static site, dropping");
        return;
    }

    let total = HEAD_LEN + 4 + data.len();
    if total >= MAX_ENTRY_SIZE {
        recoverable!("tracepoint: dump entry too large for a u16 ring body_size, dropping");
        return;
    }

    let (pid, tid) = cached_pid_tid();
    let mut stage = Stage::for_size(total);
    let buf = stage.as_mut_slice();
    write_trace_head(buf, in_file_offset, pid, tid, timestamp_ns());
    buf[HEAD_LEN..HEAD_LEN + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
    buf[HEAD_LEN + 4..].copy_from_slice(data);

    append(tb, stage.as_slice());
}

/// Dynamic (runtime-named) tracepoint: uses the `OFFSET_DYNAMIC` sentinel;
/// payload is `file\0 line:u32 message\0`. Opens (or creates, with the
/// default capacity) the tracebuffer named `buffer_name` on demand.
pub fn emit_dynamic(
    manager: &crate::tracebuffer::FileManager,
    buffer_name: &str,
    file: &str,
    line: u32,
    message: &str,
) -> crate::error::Result<()> {
    let tb: Arc<Tracebuffer> = manager.open_or_create(
        buffer_name,
        crate::tracebuffer::DYNAMIC_TRACEBUFFER_DEFAULT_CAPACITY,
        crate::definition::SourceKind::Userspace,
    )?;

    let total = HEAD_LEN + file.len() + 1 + 4 + message.len() + 1;
    if total >= MAX_ENTRY_SIZE {
        recoverable!("dynamic tracepoint: entry too large for a u16 ring body_size, dropping");
        return Ok(());
    }

    let (pid, tid) = cached_pid_tid();
    let mut stage = Stage::for_size(total);
    let buf = stage.as_mut_slice();
    write_trace_head(buf, OFFSET_DYNAMIC, pid, tid, timestamp_ns());
    let mut off = HEAD_LEN;
    buf[off..off + file.len()].copy_from_slice(file.as_bytes());
    off += file.len();
    buf[off] = 0;
    off += 1;
    buf[off..off + 4].copy_from_slice(&line.to_le_bytes());
    off += 4;
    buf[off..off + message.len()].copy_from_slice(message.as_bytes());
    off += message.len();
    buf[off] = 0;

    append(&tb, stage.as_slice());
    Ok(())
}

/// Decoded view of a dynamic tracepoint's payload, for the live decoder.
pub struct DynamicPayload {
    pub file: String,
    pub line: u32,
    pub message: String,
}

pub fn decode_dynamic(body: &[u8]) -> Option<DynamicPayload> {
    let file_nul = body.iter().position(|&b| b == 0)?;
    let file = std::str::from_utf8(&body[..file_nul]).ok()?.to_owned();
    let line_start = file_nul + 1;
    let line = u32::from_le_bytes(body.get(line_start..line_start + 4)?.try_into().ok()?);
    let msg_start = line_start + 4;
    let msg_nul = body[msg_start..].iter().position(|&b| b == 0)?;
    let message = std::str::from_utf8(&body[msg_start..msg_start + msg_nul])
        .ok()?
        .to_owned();
    Some(DynamicPayload { file, line, message })
}

/// Reads a trace entry's fixed head (everything before the argument
/// payload) out of a decoded `RingEntry` body.
pub struct TraceEntryHead {
    pub in_file_offset: u64,
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
}

pub fn decode_head(body: &[u8]) -> Option<(TraceEntryHead, &[u8])> {
    if body.len() < HEAD_LEN {
        return None;
    }
    let mut offset_bytes = [0u8; 8];
    offset_bytes[0..6].copy_from_slice(&body[0..6]);
    let in_file_offset = u64::from_le_bytes(offset_bytes);
    let pid = u32::from_le_bytes(body[6..10].try_into().ok()?);
    let tid = u32::from_le_bytes(body[10..14].try_into().ok()?);
    let timestamp_ns = u64::from_le_bytes(body[14..22].try_into().ok()?);
    Some((
        TraceEntryHead {
            in_file_offset,
            pid,
            tid,
            timestamp_ns,
        },
        &body[HEAD_LEN..],
    ))
}

/// Builds the callsite's `MetaEntry`, resolves it through
/// [`resolve_or_cache`] into a per-call-site static `AtomicU64` (so only
/// the first expansion of a given call site ever touches the unique
/// stack), and calls [`emit_static`] with the resolved offset. Building the
/// `Value` slice from real varargs is the out-of-scope part of the macro
/// layer; the resolve-and-cache step is the in-scope runtime behavior it
/// drives.
#[macro_export]
macro_rules! tracepoint {
    ($tb:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        static SITE_OFFSET: ::std::sync::atomic::AtomicU64 = ::std::sync::atomic::AtomicU64::new(0);
        let arg_types: ::std::vec::Vec<$crate::codec::ArgType> =
            ::std::vec![$($crate::codec::ArgType::from($arg.arg_type())),*];
        let meta = $crate::codec::MetaEntry {
            kind: $crate::codec::MetaKind::Printf,
            line: line!(),
            arg_types: arg_types.clone(),
            file: file!().to_string(),
            text: $fmt.to_string(),
        };
        if let Some(offset) = $crate::tracepoint::resolve_or_cache($tb, &SITE_OFFSET, &meta.encode()) {
            $crate::tracepoint::emit_static(
                $tb,
                offset,
                &arg_types,
                &[$($arg.into_value()),*],
            );
        }
    }};
}

/// Dump-variant of [`tracepoint!`]: emits a raw byte slice instead of typed
/// arguments, labeled by `$label` in its `MetaEntry`.
#[macro_export]
macro_rules! dtracepoint {
    ($tb:expr, $label:literal, $data:expr) => {{
        static SITE_OFFSET: ::std::sync::atomic::AtomicU64 = ::std::sync::atomic::AtomicU64::new(0);
        let meta = $crate::codec::MetaEntry {
            kind: $crate::codec::MetaKind::Dump,
            line: line!(),
            arg_types: ::std::vec::Vec::new(),
            file: file!().to_string(),
            text: $label.to_string(),
        };
        if let Some(offset) = $crate::tracepoint::resolve_or_cache($tb, &SITE_OFFSET, &meta.encode()) {
            $crate::tracepoint::emit_dump($tb, offset, $data);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_or_cache_reuses_the_same_offset_on_repeated_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = crate::tracebuffer::FileManager::new(Some(dir.path()));
        let tb = mgr
            .open_or_create("resolve_test", 4096, crate::definition::SourceKind::Userspace)
            .unwrap();
        let meta = codec::MetaEntry {
            kind: codec::MetaKind::Printf,
            line: 1,
            arg_types: vec![ArgType::U32],
            file: "src/tracepoint.rs".into(),
            text: "value is %u".into(),
        };
        let blob = meta.encode();
        let site_offset = AtomicU64::new(0);

        let first = resolve_or_cache(&tb, &site_offset, &blob).unwrap();
        assert_eq!(site_offset.load(Ordering::Acquire), first);

        // A second call with the cache already populated must not touch
        // the unique stack again; it just returns the cached offset.
        let second = resolve_or_cache(&tb, &site_offset, &blob).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn tracepoint_macro_emits_through_the_unique_stack() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = crate::tracebuffer::FileManager::new(Some(dir.path()));
        let tb = mgr
            .open_or_create("macro_test", 4096, crate::definition::SourceKind::Userspace)
            .unwrap();

        struct U32Arg(u32);
        impl U32Arg {
            fn arg_type(&self) -> ArgType {
                ArgType::U32
            }
            fn into_value(self) -> Value {
                Value::Unsigned(self.0 as u64)
            }
        }

        crate::tracepoint!(&tb, "value is %u", U32Arg(42));

        let mut ring = tb.ring().unwrap();
        let mut out = [0u8; 128];
        let n = ring.pop(&mut out);
        assert!(n > 0);
        let (head, payload) = decode_head(&out[..n]).unwrap();
        assert!(head.in_file_offset > OFFSET_INVALID);
        let stack = tb.stack().unwrap();
        let blob = stack.get_by_file_offset(head.in_file_offset).unwrap();
        let (meta, _) = codec::MetaEntry::decode(&blob).unwrap();
        assert_eq!(meta.text, "value is %u");
        let (decoded, _) = codec::decode_one(ArgType::U32, payload).unwrap();
        assert_eq!(decoded, codec::Decoded::Unsigned(42));
    }

    #[test]
    fn static_entry_below_invalid_sentinel_is_dropped_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = crate::tracebuffer::FileManager::new(Some(dir.path()));
        let tb = mgr
            .open_or_create("tp_test", 4096, crate::definition::SourceKind::Userspace)
            .unwrap();
        emit_static(&tb, OFFSET_UNSET, &[], &[]);
        assert_eq!(tb.ring().unwrap().occupied(), 0);
    }

    #[test]
    fn static_entry_roundtrips_through_ring() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = crate::tracebuffer::FileManager::new(Some(dir.path()));
        let tb = mgr
            .open_or_create("tp_test2", 4096, crate::definition::SourceKind::Userspace)
            .unwrap();
        let arg_types = [ArgType::U32];
        let values = [Value::Unsigned(7)];
        emit_static(&tb, 0x1000, &arg_types, &values);

        let mut ring = tb.ring().unwrap();
        let mut out = [0u8; 128];
        let n = ring.pop(&mut out);
        assert!(n > 0);
        let (head, payload) = decode_head(&out[..n]).unwrap();
        assert_eq!(head.in_file_offset, 0x1000);
        let (decoded, _) = codec::decode_one(ArgType::U32, payload).unwrap();
        assert_eq!(decoded, codec::Decoded::Unsigned(7));
    }

    #[test]
    fn dynamic_entry_roundtrips_file_line_message() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = crate::tracebuffer::FileManager::new(Some(dir.path()));
        emit_dynamic(&mgr, "dyn_test", "src/main.rs", 42, "hello world").unwrap();
        let tb = mgr
            .open_or_create("dyn_test", 4096, crate::definition::SourceKind::Userspace)
            .unwrap();
        let mut ring = tb.ring().unwrap();
        let mut out = [0u8; 256];
        let n = ring.pop(&mut out);
        let (head, payload) = decode_head(&out[..n]).unwrap();
        assert_eq!(head.in_file_offset, OFFSET_DYNAMIC);
        let decoded = decode_dynamic(payload).unwrap();
        assert_eq!(decoded.file, "src/main.rs");
        assert_eq!(decoded.line, 42);
        assert_eq!(decoded.message, "hello world");
    }
}
