//! `clltk-live`: the live streaming decoder CLI (§6). Polls one or more
//! tracebuffer files, reorders their entries through the ordered buffer
//! (§4.10), applies the configured filters, and prints them as they become
//! safe to emit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use clltk_trace::definition::SourceKind;
use clltk_trace::live::{
    decode_available, discover_tracebuffers, parse_unsigned_duration_ns, DecodedEntry, Entry, Filters,
    OrderedBuffer, TimeSpec,
};
use clltk_trace::tracebuffer::FileManager;

#[derive(Parser, Debug)]
#[command(name = "clltk-live", about = "Stream decoded tracebuffer entries")]
struct Args {
    /// Directory to scan for tracebuffer files (defaults to the resolved
    /// tracing root: explicit path > CLLTK_TRACING_PATH > cwd).
    input_path: Option<PathBuf>,

    #[arg(short = 'F', long = "filter")]
    filter: Option<String>,

    #[arg(long = "buffer-size", default_value_t = 0)]
    buffer_size: usize,

    #[arg(long = "order-delay", default_value_t = 0)]
    order_delay_ms: u64,

    #[arg(long = "poll-interval", default_value_t = 100)]
    poll_interval_ms: u64,

    #[arg(short = 'n', long = "now")]
    now: bool,

    #[arg(long = "timeout")]
    timeout: Option<String>,

    #[arg(long = "pid")]
    pid: Option<u32>,

    #[arg(long = "tid")]
    tid: Option<u32>,

    #[arg(long = "msg")]
    msg: Option<String>,

    #[arg(long = "msg-regex")]
    msg_regex: Option<String>,

    #[arg(long = "file")]
    file: Option<String>,

    #[arg(long = "file-regex")]
    file_regex: Option<String>,

    #[arg(long = "since")]
    since: Option<String>,

    #[arg(long = "until")]
    until: Option<String>,

    #[arg(short = 'j', long = "json")]
    json: bool,

    #[arg(short = 'S', long = "summary")]
    summary: bool,
}

#[derive(serde::Serialize)]
struct JsonEntry<'a> {
    buffer: &'a str,
    timestamp_ns: u64,
    pid: u32,
    tid: u32,
    file: &'a str,
    line: u32,
    message: String,
}

fn render_json(e: &DecodedEntry) -> String {
    let message = render_message(e);
    serde_json::to_string(&JsonEntry {
        buffer: &e.buffer,
        timestamp_ns: e.timestamp_ns,
        pid: e.pid,
        tid: e.tid,
        file: &e.file,
        line: e.line,
        message,
    })
    .unwrap_or_default()
}

fn render_message(e: &DecodedEntry) -> String {
    if e.args.is_empty() {
        e.message.clone()
    } else {
        let rendered: Vec<String> = e.args.iter().map(clltk_trace::live::decoder::format_arg).collect();
        format!("{} [{}]", e.message, rendered.join(", "))
    }
}

fn render_text(e: &DecodedEntry) -> String {
    format!(
        "[{}] {}:{} pid={} tid={} ts={} {}",
        e.buffer,
        e.file,
        e.line,
        e.pid,
        e.tid,
        e.timestamp_ns,
        render_message(e)
    )
}

fn build_filters(args: &Args) -> Result<Filters> {
    let now_ns = clltk_trace::platform::timestamp_ns() as i64;
    Ok(Filters {
        pid: args.pid,
        tid: args.tid,
        msg: args.msg.clone(),
        msg_regex: args.msg_regex.as_deref().map(Regex::new).transpose().context("invalid --msg-regex")?,
        file: args.file.clone(),
        file_regex: args.file_regex.as_deref().map(Regex::new).transpose().context("invalid --file-regex")?,
        since_ns: args
            .since
            .as_deref()
            .map(TimeSpec::parse)
            .transpose()
            .context("invalid --since")?
            .map(|t| t.resolve(now_ns)),
        until_ns: args
            .until
            .as_deref()
            .map(TimeSpec::parse)
            .transpose()
            .context("invalid --until")?
            .map(|t| t.resolve(now_ns)),
    })
}

fn run(args: Args) -> Result<()> {
    let manager = FileManager::new(args.input_path.as_deref());
    let root = manager.root().to_path_buf();
    let filter_re = args.filter.as_deref().map(Regex::new).transpose().context("invalid --filter")?;
    let filters = build_filters(&args)?;

    let idle_timeout = args
        .timeout
        .as_deref()
        .map(parse_unsigned_duration_ns)
        .transpose()
        .context("invalid --timeout")?
        .map(Duration::from_nanos);

    let buffer: Arc<OrderedBuffer<DecodedEntry>> =
        Arc::new(OrderedBuffer::new(args.buffer_size, args.order_delay_ms * 1_000_000));

    let stop = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to install signal handler")?;
    {
        let stop = stop.clone();
        std::thread::spawn(move || {
            for sig in signals.forever() {
                // First SIGINT/SIGTERM requests a clean stop-and-drain; a
                // second one exits immediately with the 128+signal code
                // the caller expects from a double interrupt (§6).
                if stop.swap(true, Ordering::SeqCst) {
                    std::process::exit(128 + sig);
                }
            }
        });
    }

    let skip_existing = args.now;
    let poll_interval = Duration::from_millis(args.poll_interval_ms);
    let max_seen = Arc::new(AtomicU64::new(0));

    let reader = {
        let manager_root = root.clone();
        let buffer = buffer.clone();
        let stop = stop.clone();
        let max_seen = max_seen.clone();
        let filter_re = filter_re.clone();
        std::thread::spawn(move || {
            let mgr = FileManager::new(Some(&manager_root));
            let mut last_idle_had_activity = !skip_existing;
            let mut since_last_activity = std::time::Instant::now();
            loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let files = discover_tracebuffers(&manager_root, filter_re.as_ref()).unwrap_or_default();
                let mut pushed_any = false;
                for path in &files {
                    let name = match path.file_stem().and_then(|s| s.to_str()) {
                        Some(n) => n,
                        None => continue,
                    };
                    let tb = match mgr.open_or_create(name, 0, SourceKind::Userspace) {
                        Ok(tb) => tb,
                        Err(_) => continue,
                    };
                    for entry in decode_available(&tb, name) {
                        let ts = entry.timestamp_ns;
                        max_seen.fetch_max(ts, Ordering::SeqCst);
                        buffer.push(Entry { timestamp_ns: ts, payload: entry });
                        pushed_any = true;
                    }
                }

                if pushed_any {
                    last_idle_had_activity = true;
                    since_last_activity = std::time::Instant::now();
                    buffer.update_watermark(max_seen.load(Ordering::SeqCst));
                } else if last_idle_had_activity {
                    // Idle: advance the watermark past every entry seen so
                    // far so the heap can fully drain (§4.10).
                    buffer.update_watermark(max_seen.load(Ordering::SeqCst) + args.order_delay_ms * 1_000_000);
                    last_idle_had_activity = false;
                }

                if let Some(timeout) = idle_timeout {
                    if since_last_activity.elapsed() >= timeout {
                        break;
                    }
                }

                std::thread::sleep(poll_interval);
            }
            buffer.finish();
        })
    };

    let mut printed = 0u64;
    let mut filtered_out = 0u64;
    loop {
        match buffer.pop(Duration::from_millis(500)) {
            Some(entry) => {
                if filters.matches(&entry.payload) {
                    if args.json {
                        println!("{}", render_json(&entry.payload));
                    } else {
                        println!("{}", render_text(&entry.payload));
                    }
                    printed += 1;
                } else {
                    filtered_out += 1;
                }
            }
            None => {
                if buffer.is_finished() && buffer.is_empty() {
                    break;
                }
                if stop.load(Ordering::SeqCst) && buffer.is_empty() {
                    break;
                }
            }
        }
    }

    let _ = reader.join();

    if args.summary {
        let counters = buffer.counters();
        eprintln!(
            "printed={} filtered_out={} dropped={} pushed={} popped={}",
            printed, filtered_out, counters.dropped, counters.pushed, counters.popped
        );
    }

    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("clltk-live: {:#}", e);
            std::process::exit(1);
        }
    }
}
