//! Live decoder (§6's `live` CLI surface, §4.10's ordered buffer fed by
//! tracebuffer files): discovers tracebuffer files under a root, decodes
//! whatever's newly available in each, and applies the individual-entry
//! filters a caller configures.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::codec::{self, ArgType, Decoded};
use crate::definition::Definition;
use crate::stack::StackDict;
use crate::tracebuffer::Tracebuffer;
use crate::tracepoint::{self, OFFSET_DYNAMIC};

/// One fully decoded trace entry, ready for formatting.
#[derive(Debug, Clone)]
pub struct DecodedEntry {
    pub buffer: String,
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub file: String,
    pub line: u32,
    pub message: String,
    pub args: Vec<Decoded>,
}

/// Finds every `*.clltk_trace` (and `*.clltk_ktrace`) file directly under
/// `root`, optionally restricted to names matching `filter`.
pub fn discover_tracebuffers(root: &Path, filter: Option<&Regex>) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let is_trace = path
            .extension()
            .map(|e| e == "clltk_trace" || e == "clltk_ktrace")
            .unwrap_or(false);
        if !is_trace {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if filter.map(|re| re.is_match(stem)).unwrap_or(true) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Decodes every entry currently available in `tb`'s ring (a single,
/// non-blocking pass — call repeatedly on a poll interval to keep draining).
/// `name` labels each decoded entry with the tracebuffer it came from.
pub fn decode_available(tb: &Tracebuffer, name: &str) -> Vec<DecodedEntry> {
    let mut out = Vec::new();
    let mut ring = match tb.ring() {
        Some(r) => r,
        None => return out,
    };
    let stack = tb.stack();
    let mut scratch = vec![0u8; u16::MAX as usize];
    loop {
        let n = ring.pop(&mut scratch);
        if n == 0 {
            break;
        }
        if let Some(decoded) = decode_one_entry(name, &scratch[..n], stack.as_ref()) {
            out.push(decoded);
        }
    }
    out
}

fn decode_one_entry(name: &str, body: &[u8], stack: Option<&StackDict<'_>>) -> Option<DecodedEntry> {
    let (head, payload) = tracepoint::decode_head(body)?;

    if head.in_file_offset == OFFSET_DYNAMIC {
        let dyn_payload = tracepoint::decode_dynamic(payload)?;
        return Some(DecodedEntry {
            buffer: name.to_string(),
            timestamp_ns: head.timestamp_ns,
            pid: head.pid,
            tid: head.tid,
            file: dyn_payload.file,
            line: dyn_payload.line,
            message: dyn_payload.message,
            args: Vec::new(),
        });
    }

    let stack = stack?;
    let blob = stack.get_by_file_offset(head.in_file_offset)?;
    let (meta, _) = codec::MetaEntry::decode(&blob).ok()?;

    let mut args = Vec::with_capacity(meta.arg_types.len());
    let mut off = 0usize;
    for ty in &meta.arg_types {
        let (value, consumed) = codec::decode_one(*ty, &payload[off..]).ok()?;
        args.push(value);
        off += consumed;
    }

    Some(DecodedEntry {
        buffer: name.to_string(),
        timestamp_ns: head.timestamp_ns,
        pid: head.pid,
        tid: head.tid,
        file: meta.file,
        line: meta.line,
        message: meta.text,
        args,
    })
}

/// Individual-entry filters from §6's CLI surface.
#[derive(Debug, Default, Clone)]
pub struct Filters {
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub msg: Option<String>,
    pub msg_regex: Option<Regex>,
    pub file: Option<String>,
    pub file_regex: Option<Regex>,
    pub since_ns: Option<i64>,
    pub until_ns: Option<i64>,
}

impl Filters {
    pub fn matches(&self, entry: &DecodedEntry) -> bool {
        if let Some(pid) = self.pid {
            if entry.pid != pid {
                return false;
            }
        }
        if let Some(tid) = self.tid {
            if entry.tid != tid {
                return false;
            }
        }
        if let Some(msg) = &self.msg {
            if !entry.message.contains(msg.as_str()) {
                return false;
            }
        }
        if let Some(re) = &self.msg_regex {
            if !re.is_match(&entry.message) {
                return false;
            }
        }
        if let Some(file) = &self.file {
            if !entry.file.contains(file.as_str()) {
                return false;
            }
        }
        if let Some(re) = &self.file_regex {
            if !re.is_match(&entry.file) {
                return false;
            }
        }
        let ts = entry.timestamp_ns as i64;
        if let Some(since) = self.since_ns {
            if ts < since {
                return false;
            }
        }
        if let Some(until) = self.until_ns {
            if ts > until {
                return false;
            }
        }
        true
    }
}

/// Renders a decoded argument the way a printf format specifier would, for
/// plain-text (non-JSON) output.
pub fn format_arg(arg: &Decoded) -> String {
    match arg {
        Decoded::Signed(n) => n.to_string(),
        Decoded::Unsigned(n) => n.to_string(),
        Decoded::Signed128(n) => n.to_string(),
        Decoded::Unsigned128(n) => n.to_string(),
        Decoded::Float(f) => f.to_string(),
        Decoded::Str(s) => s.clone(),
        Decoded::Ptr(p) => format!("0x{:x}", p),
        Decoded::Dump(d) => d.iter().map(|b| format!("{:02x}", b)).collect(),
        Decoded::Unknown => "?".to_string(),
    }
}

/// Checks `name`'s definition section and returns whether it's worth
/// decoding at all (e.g. skip files whose header validated but whose
/// definition section is corrupt beyond the legacy fallback).
pub fn definition_summary(tb: &Tracebuffer) -> Option<(String, crate::definition::SourceKind)> {
    let def: Definition<'_> = tb.definition().ok()?;
    Some((def.get_name().to_string(), def.get_source_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MetaEntry, MetaKind, Value};
    use crate::definition::SourceKind;

    fn make_tracebuffer(dir: &Path, name: &str) -> std::sync::Arc<Tracebuffer> {
        let mgr = crate::tracebuffer::FileManager::new(Some(dir));
        mgr.open_or_create(name, 4096, SourceKind::Userspace).unwrap()
    }

    #[test]
    fn decodes_a_static_entry_through_the_stack_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let tb = make_tracebuffer(dir.path(), "decoder_test");

        let meta = MetaEntry {
            kind: MetaKind::Printf,
            line: 10,
            arg_types: vec![ArgType::U32],
            file: "src/lib.rs".into(),
            text: "count is %u".into(),
        };
        let blob = meta.encode();
        let offset = {
            let mut stack = tb.stack().unwrap();
            stack.add(&blob).unwrap()
        };

        tracepoint::emit_static(&tb, offset, &[ArgType::U32], &[Value::Unsigned(99)]);

        let decoded = decode_available(&tb, "decoder_test");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].message, "count is %u");
        assert_eq!(decoded[0].file, "src/lib.rs");
        assert_eq!(decoded[0].args.len(), 1);
        assert_eq!(format_arg(&decoded[0].args[0]), "99");
    }

    #[test]
    fn filters_reject_entries_outside_time_bounds() {
        let entry = DecodedEntry {
            buffer: "b".into(),
            timestamp_ns: 1_000,
            pid: 1,
            tid: 1,
            file: "f".into(),
            line: 1,
            message: "hello".into(),
            args: vec![],
        };
        let filters = Filters {
            since_ns: Some(2_000),
            ..Default::default()
        };
        assert!(!filters.matches(&entry));
    }
}
