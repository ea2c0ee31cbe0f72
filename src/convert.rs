use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use log::warn;

use crate::address_space::AddressSpace;
use crate::event::{Event, MmapEvent, ProcessEvent, SampleEvent};
use crate::profile::{ProfileData, ProfileSample};
use crate::symbols::{SymbolResolver, SymbolTable};

// Context markers embedded in callchains, from the perf ABI. Entries at or
// above PERF_CONTEXT_MAX are markers, not instruction pointers.
pub const PERF_CONTEXT_HV: u64 = -32i64 as u64;
pub const PERF_CONTEXT_KERNEL: u64 = -128i64 as u64;
pub const PERF_CONTEXT_USER: u64 = -512i64 as u64;
pub const PERF_CONTEXT_GUEST: u64 = -2048i64 as u64;
pub const PERF_CONTEXT_GUEST_KERNEL: u64 = -2176i64 as u64;
pub const PERF_CONTEXT_GUEST_USER: u64 = -2560i64 as u64;
pub const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;

/// The kernel's address space is keyed by this pseudo-pid.
const KERNEL_PID: i32 = -1;

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Collapse apparently-corrupt stacks into a sentinel frame and drop
    /// unmapped addresses instead of emitting raw hex.
    pub clean: bool,
    /// Apply the platform callchain workarounds: substitute the sample's
    /// top-level ip for a missing first user frame, and trim the unreliable
    /// caller above a thread-creation trampoline.
    pub stack_fixups: bool,
    /// Directory holding `jsallsyms-<pid>` pseudo-symbol files.
    pub jsallsyms_dir: Option<PathBuf>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions {
            clean: true,
            stack_fixups: true,
            jsallsyms_dir: None,
        }
    }
}

/// Deduplicates frame labels through an incrementing short-code allocator.
/// Codes count through the printable range, skipping the two characters
/// that would need escaping inside JSON strings.
#[derive(Default)]
pub struct Shortener {
    codes: HashMap<String, String>,
    counter: Vec<u8>,
}

impl Shortener {
    pub fn shorten(&mut self, long: &str) -> String {
        if let Some(code) = self.codes.get(long) {
            return code.clone();
        }
        self.advance();
        let code = String::from_utf8(self.counter.clone()).expect("codes are printable ASCII");
        self.codes.insert(long.to_string(), code.clone());
        code
    }

    fn advance(&mut self) {
        for digit in self.counter.iter_mut() {
            if *digit < 126 {
                *digit += 1;
                if *digit == b'"' || *digit == b'\\' {
                    *digit += 1;
                }
                return;
            }
            *digit = 33;
        }
        self.counter.push(33);
    }

    /// Invert to short → long, the direction consumers need.
    pub fn into_table(self) -> HashMap<String, String> {
        self.codes.into_iter().map(|(long, short)| (short, long)).collect()
    }
}

/// The conversion state machine. Consumes the event stream, maintains the
/// live set of address spaces and thread/process metadata, and accumulates
/// resolved samples per CPU. All state lives here; independent conversions
/// can run side by side.
pub struct Converter {
    options: ConvertOptions,
    resolver: SymbolResolver,
    kernel_symbols: Option<Arc<SymbolTable>>,
    /// pid → address space; the kernel space is at pid -1.
    spaces: HashMap<i32, AddressSpace>,
    /// tid → owning pid.
    pids: HashMap<i32, i32>,
    /// pid → lowest tid seen, which stands in for the process.
    main_tids: HashMap<i32, i32>,
    /// tid → last-known command name.
    names: HashMap<i32, String>,
    /// path → symbol table, resolved at most once.
    files: HashMap<String, Arc<SymbolTable>>,
    js_tables: HashMap<i32, Option<Arc<SymbolTable>>>,
    samples: Vec<Vec<ProfileSample>>,
    shortener: Shortener,
}

impl Converter {
    pub fn new(
        options: ConvertOptions,
        resolver: SymbolResolver,
        kernel_symbols: Option<Arc<SymbolTable>>,
    ) -> Self {
        let mut spaces = HashMap::new();
        spaces.insert(KERNEL_PID, AddressSpace::new());
        let mut names = HashMap::new();
        // tid 0 is the reserved idle thread.
        names.insert(0, "swapper".to_string());
        Converter {
            options,
            resolver,
            kernel_symbols,
            spaces,
            pids: HashMap::new(),
            main_tids: HashMap::new(),
            names,
            files: HashMap::new(),
            js_tables: HashMap::new(),
            samples: Vec::new(),
            shortener: Shortener::default(),
        }
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Mmap(e) => self.handle_mmap(e),
            // A re-exec and a plain thread rename are indistinguishable
            // here; both just update the registry entry.
            Event::Comm(e) => {
                self.names.insert(e.tid, e.name);
            }
            Event::Fork(e) => self.handle_fork(e),
            Event::Sample(e) => self.handle_sample(e),
            Event::Exit(_)
            | Event::Lost(_)
            | Event::Throttle(_)
            | Event::Unthrottle(_)
            | Event::Unknown(_) => {}
        }
    }

    /// Consume the whole profile: per-CPU samples plus the inverted
    /// shortening table.
    pub fn finish(self) -> ProfileData {
        ProfileData {
            cpus: self.samples,
            symbolication_table: self.shortener.into_table(),
        }
    }

    fn note_thread(&mut self, pid: i32, tid: i32) {
        self.pids.insert(tid, pid);
        let promote = match self.main_tids.get(&pid) {
            Some(&current) => current > tid,
            None => true,
        };
        // Samples can carry tid 0 with a real pid; the idle tid must not
        // become anyone's main thread.
        if promote && (tid != 0 || pid == 0) {
            self.main_tids.insert(pid, tid);
        }
    }

    fn handle_mmap(&mut self, e: MmapEvent) {
        if e.pid == KERNEL_PID {
            let Some(kernel_symbols) = self.kernel_symbols.clone() else {
                warn!("kernel mapping for {} ignored: no kernel symbols loaded", e.filename);
                return;
            };
            let (address, length) = if e.filename.starts_with("[kernel.") {
                // The kernel-only entry covers the entire kernel region;
                // restrict it to the span that actually has symbols. The
                // _etext-style sentinels sit at the end of the text, so the
                // last symbol's start is a safe upper bound. Modules are
                // mapped separately and recorded later, so they override
                // this entry where they overlap.
                match (kernel_symbols.first_address(), kernel_symbols.last_address()) {
                    (Some(first), Some(last)) => (first, last - first),
                    _ => return,
                }
            } else {
                (e.address, e.length)
            };
            if let Some(space) = self.spaces.get_mut(&KERNEL_PID) {
                // The kernel table holds absolute addresses, so the file
                // offset equals the mapped address.
                space.map(address, address + length, address, kernel_symbols);
            }
            return;
        }

        let symbols = match self.files.get(&e.filename) {
            Some(table) => table.clone(),
            None => {
                let table = if e.filename.starts_with('/') && !e.filename.starts_with("//") {
                    self.resolver.resolve(&e.filename)
                } else {
                    // Anonymous and pseudo mappings ("[vdso]", "//anon")
                    // have nothing to resolve against.
                    Arc::new(SymbolTable::empty(e.filename.as_str()))
                };
                self.files.insert(e.filename.clone(), table.clone());
                table
            }
        };
        self.ensure_space(e.pid);
        if let Some(space) = self.spaces.get_mut(&e.pid) {
            space.map(e.address, e.address + e.length, e.offset, symbols);
        }
    }

    fn handle_fork(&mut self, e: ProcessEvent) {
        self.note_thread(e.pid, e.tid);
        if let Some(parent) = self.spaces.get(&e.ppid) {
            let child = parent.clone();
            self.spaces.insert(e.pid, child);
        }
        if let Some(name) = self.names.get(&e.ptid).cloned() {
            self.names.insert(e.tid, name);
        }
    }

    fn handle_sample(&mut self, e: SampleEvent) {
        let (Some(cpu), Some(time), Some(pid), Some(tid)) = (e.cpu, e.time, e.pid, e.tid) else {
            warn!("skipping sample record without cpu/time/pid/tid");
            return;
        };
        let sample_ip = e.ip.unwrap_or(0);
        let msec = time as f64 / 1e6;
        self.note_thread(pid, tid);

        let mut frames: Vec<String> = Vec::new();
        let mut context: Option<u64> = None;
        for (i, &entry) in e.callchain.iter().enumerate() {
            let mut pc = entry;
            if pc >= PERF_CONTEXT_MAX {
                context = Some(pc);
                if i == 0 && pc == PERF_CONTEXT_USER && self.options.stack_fixups {
                    // Some kernels don't record the user-mode pc in the
                    // callchain; when the sample hit in user mode the
                    // top-level ip field carries it instead.
                    pc = sample_ip;
                } else {
                    continue;
                }
            }
            let space = match context {
                Some(PERF_CONTEXT_USER) => self.spaces.get(&pid),
                Some(PERF_CONTEXT_KERNEL) => self.spaces.get(&KERNEL_PID),
                Some(marker) => {
                    warn!("unknown frame context (__u64){}", marker as i64);
                    None
                }
                None => {
                    warn!("frame with no context");
                    None
                }
            };
            match space.and_then(|s| s.lookup(pc)) {
                Some((symbols, offset)) => match symbols.lookup(offset) {
                    Some(m) => frames.push(format!("{} (in {})", m.name, m.module)),
                    None => frames.push(format!("{:#x} (in {})", offset, symbols.name())),
                },
                None => {
                    // An unmapped address is probably junk.
                    if !self.options.clean {
                        frames.push(format!("{pc:#x}"));
                    }
                }
            }
        }

        if self.options.clean && frames.is_empty() {
            // Make empty stacks stand out rather than becoming self
            // samples on the root.
            frames.push("Corrupt Stack".to_string());
        }
        if self.options.stack_fixups
            && frames.len() >= 2
            && frames[frames.len() - 2].starts_with("pthread_create ")
        {
            // The thread-creation trampoline's caller is a platform-varying
            // garbage value in the child.
            frames.pop();
        }

        let thread_name = self.names.get(&tid).cloned().unwrap_or_else(|| "???".into());
        frames.push(format!("{thread_name} (in tid {tid})"));
        let process_name = self
            .main_tids
            .get(&pid)
            .and_then(|main_tid| self.names.get(main_tid))
            .cloned()
            .unwrap_or_else(|| "???".into());
        frames.push(format!("{process_name} (in pid {pid})"));
        frames.reverse();

        let frames = frames
            .iter()
            .map(|frame| self.shortener.shorten(frame))
            .collect();
        let cpu = cpu as usize;
        if self.samples.len() <= cpu {
            self.samples.resize_with(cpu + 1, Vec::new);
        }
        self.samples[cpu].push(ProfileSample { time: msec, frames });
    }

    fn ensure_space(&mut self, pid: i32) {
        if self.spaces.contains_key(&pid) {
            return;
        }
        let js_table = self.js_table(pid);
        let mut space = AddressSpace::new();
        if let Some(js) = &js_table {
            if let (Some(first), Some(last)) = (js.first_address(), js.last_address()) {
                space.map(first, last + 1, first, js.clone());
            }
        }
        self.spaces.insert(pid, space);
    }

    fn js_table(&mut self, pid: i32) -> Option<Arc<SymbolTable>> {
        if let Some(cached) = self.js_tables.get(&pid) {
            return cached.clone();
        }
        let table = self.load_js_table(pid);
        self.js_tables.insert(pid, table.clone());
        table
    }

    fn load_js_table(&self, pid: i32) -> Option<Arc<SymbolTable>> {
        let dir = self.options.jsallsyms_dir.as_ref()?;
        let path = dir.join(format!("jsallsyms-{pid}"));
        if !path.exists() {
            return None;
        }
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("could not open {}: {e}", path.display());
                return None;
            }
        };
        match SymbolTable::from_kallsyms(format!("JS in pid {pid}"), BufReader::new(file)) {
            Ok(table) if !table.is_empty() => Some(Arc::new(table)),
            Ok(_) => None,
            Err(e) => {
                warn!("could not read {}: {e}", path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::CommEvent;

    fn converter(options: ConvertOptions, kallsyms: Option<&str>) -> Converter {
        let resolver = SymbolResolver::new(None, None, "");
        let kernel_symbols = kallsyms.map(|text| {
            Arc::new(SymbolTable::from_kallsyms("[kernel]", text.as_bytes()).unwrap())
        });
        Converter::new(options, resolver, kernel_symbols)
    }

    fn sample(cpu: u32, time: u64, pid: i32, tid: i32, ip: u64, callchain: Vec<u64>) -> Event {
        Event::Sample(SampleEvent {
            cpu: Some(cpu),
            time: Some(time),
            pid: Some(pid),
            tid: Some(tid),
            ip: Some(ip),
            callchain,
        })
    }

    /// Expand a finished profile's shortened frames back to long labels.
    fn long_frames(data: &ProfileData, cpu: usize) -> Vec<Vec<String>> {
        data.cpus[cpu]
            .iter()
            .map(|s| {
                s.frames
                    .iter()
                    .map(|code| data.symbolication_table[code].clone())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn empty_callchain_becomes_corrupt_stack() {
        let mut conv = converter(ConvertOptions::default(), None);
        conv.handle_event(sample(0, 5_000_000, 7, 7, 0, vec![]));
        let data = conv.finish();
        assert_eq!(data.cpus.len(), 1);
        assert_eq!(data.cpus[0][0].time, 5.0);
        let frames = long_frames(&data, 0);
        assert_eq!(
            frames[0],
            vec!["??? (in pid 7)", "??? (in tid 7)", "Corrupt Stack"]
        );
    }

    #[test]
    fn comm_names_the_synthetic_frames() {
        let mut conv = converter(ConvertOptions::default(), None);
        conv.handle_event(Event::Comm(CommEvent {
            tid: 7,
            name: "app".into(),
        }));
        conv.handle_event(sample(0, 1_000_000, 7, 7, 0, vec![]));
        let frames = long_frames(&conv.finish(), 0);
        assert_eq!(
            frames[0],
            vec!["app (in pid 7)", "app (in tid 7)", "Corrupt Stack"]
        );
    }

    #[test]
    fn user_frames_resolve_through_the_process_space() {
        let mut conv = converter(ConvertOptions::default(), None);
        conv.handle_event(Event::Mmap(MmapEvent {
            pid: 7,
            tid: 7,
            address: 0x1000,
            length: 0x1000,
            offset: 0,
            filename: "[vdso]".into(),
        }));
        // The leading user-context marker stands in for the missing first
        // frame; the ip field supplies it.
        conv.handle_event(sample(0, 1_000_000, 7, 7, 0x1800, vec![PERF_CONTEXT_USER, 0x1234]));
        let frames = long_frames(&conv.finish(), 0);
        assert_eq!(
            frames[0],
            vec![
                "??? (in pid 7)",
                "??? (in tid 7)",
                "0x234 (in [vdso])",
                "0x800 (in [vdso])",
            ]
        );
    }

    #[test]
    fn ip_substitution_is_behind_the_fixups_flag() {
        let options = ConvertOptions {
            stack_fixups: false,
            ..ConvertOptions::default()
        };
        let mut conv = converter(options, None);
        conv.handle_event(Event::Mmap(MmapEvent {
            pid: 7,
            tid: 7,
            address: 0x1000,
            length: 0x1000,
            offset: 0,
            filename: "[vdso]".into(),
        }));
        conv.handle_event(sample(0, 1_000_000, 7, 7, 0x1800, vec![PERF_CONTEXT_USER, 0x1234]));
        let frames = long_frames(&conv.finish(), 0);
        assert_eq!(
            frames[0],
            vec!["??? (in pid 7)", "??? (in tid 7)", "0x234 (in [vdso])"]
        );
    }

    const KALLSYMS: &str = "\
c0008000 T _text
c0008100 T do_work
c0009000 T _etext
";

    #[test]
    fn kernel_region_is_narrowed_to_the_symbol_span() {
        let mut conv = converter(ConvertOptions::default(), Some(KALLSYMS));
        conv.handle_event(Event::Mmap(MmapEvent {
            pid: -1,
            tid: 0,
            address: 0,
            length: 0xffff_ffff,
            offset: 0,
            filename: "[kernel.kallsyms]_text".into(),
        }));
        conv.handle_event(sample(
            1,
            2_000_000,
            7,
            7,
            0,
            vec![PERF_CONTEXT_KERNEL, 0xc000_8123, 0xc000_9500],
        ));
        let data = conv.finish();
        assert_eq!(data.cpus.len(), 2);
        assert!(data.cpus[0].is_empty());
        let frames = long_frames(&data, 1);
        // 0xc0009500 is past the narrowed span and gets dropped.
        assert_eq!(
            frames[0],
            vec![
                "??? (in pid 7)",
                "??? (in tid 7)",
                "do_work (in [kernel])",
            ]
        );
    }

    #[test]
    fn kernel_mapping_without_symbols_is_ignored() {
        let mut conv = converter(ConvertOptions::default(), None);
        conv.handle_event(Event::Mmap(MmapEvent {
            pid: -1,
            tid: 0,
            address: 0,
            length: 0xffff_ffff,
            offset: 0,
            filename: "[kernel.kallsyms]_text".into(),
        }));
        conv.handle_event(sample(0, 1_000_000, 7, 7, 0, vec![PERF_CONTEXT_KERNEL, 0xc000_8123]));
        let frames = long_frames(&conv.finish(), 0);
        assert_eq!(frames[0][2], "Corrupt Stack");
    }

    #[test]
    fn fork_clones_the_parent_space_and_name() {
        let mut conv = converter(ConvertOptions::default(), None);
        conv.handle_event(Event::Comm(CommEvent {
            tid: 10,
            name: "parent".into(),
        }));
        conv.handle_event(Event::Mmap(MmapEvent {
            pid: 10,
            tid: 10,
            address: 0x1000,
            length: 0x1000,
            offset: 0,
            filename: "[vdso]".into(),
        }));
        conv.handle_event(Event::Fork(ProcessEvent {
            pid: 11,
            ppid: 10,
            tid: 11,
            ptid: 10,
            time: 0,
        }));
        conv.handle_event(sample(0, 1_000_000, 11, 11, 0, vec![PERF_CONTEXT_USER, 0x1200]));
        let frames = long_frames(&conv.finish(), 0);
        assert_eq!(
            frames[0],
            vec![
                "parent (in pid 11)",
                "parent (in tid 11)",
                "0x200 (in [vdso])",
            ]
        );
    }

    #[test]
    fn fork_from_unknown_parent_starts_bare() {
        let mut conv = converter(ConvertOptions::default(), None);
        conv.handle_event(Event::Fork(ProcessEvent {
            pid: 99,
            ppid: 42,
            tid: 99,
            ptid: 42,
            time: 0,
        }));
        conv.handle_event(sample(0, 1_000_000, 99, 99, 0, vec![PERF_CONTEXT_USER, 0x1200]));
        let frames = long_frames(&conv.finish(), 0);
        assert_eq!(frames[0][2], "Corrupt Stack");
    }

    #[test]
    fn trampoline_caller_is_trimmed() {
        let kallsyms = "\
c0000000 T worker
c0001000 T pthread_create
c0002000 T junk_caller
c0003000 T _etext
";
        let mut conv = converter(ConvertOptions::default(), Some(kallsyms));
        conv.handle_event(Event::Mmap(MmapEvent {
            pid: -1,
            tid: 0,
            address: 0,
            length: 0xffff_ffff,
            offset: 0,
            filename: "[kernel.kallsyms]_text".into(),
        }));
        conv.handle_event(sample(
            0,
            1_000_000,
            7,
            7,
            0,
            vec![PERF_CONTEXT_KERNEL, 0xc000_0010, 0xc000_1010, 0xc000_2010],
        ));
        let frames = long_frames(&conv.finish(), 0);
        assert_eq!(
            frames[0],
            vec![
                "??? (in pid 7)",
                "??? (in tid 7)",
                "pthread_create (in [kernel])",
                "worker (in [kernel])",
            ]
        );
    }

    #[test]
    fn idle_tid_is_never_promoted_to_main_thread() {
        let mut conv = converter(ConvertOptions::default(), None);
        conv.handle_event(sample(0, 1_000_000, 5, 0, 0, vec![]));
        conv.handle_event(Event::Comm(CommEvent {
            tid: 5,
            name: "app".into(),
        }));
        conv.handle_event(sample(0, 2_000_000, 5, 5, 0, vec![]));
        let frames = long_frames(&conv.finish(), 0);
        // The tid-0 sample has no main thread to name the process with.
        assert_eq!(frames[0][0], "??? (in pid 5)");
        assert_eq!(frames[0][1], "swapper (in tid 0)");
        // Once a real tid shows up, it becomes the main thread.
        assert_eq!(frames[1][0], "app (in pid 5)");
    }

    #[test]
    fn samples_missing_identification_are_skipped() {
        let mut conv = converter(ConvertOptions::default(), None);
        conv.handle_event(Event::Sample(SampleEvent {
            cpu: None,
            time: Some(1),
            pid: Some(1),
            tid: Some(1),
            ip: None,
            callchain: vec![],
        }));
        let data = conv.finish();
        assert!(data.cpus.is_empty());
    }

    #[test]
    fn noisy_mode_keeps_raw_addresses() {
        let options = ConvertOptions {
            clean: false,
            ..ConvertOptions::default()
        };
        let mut conv = converter(options, None);
        conv.handle_event(sample(0, 1_000_000, 7, 7, 0, vec![PERF_CONTEXT_USER, 0xdead]));
        let frames = long_frames(&conv.finish(), 0);
        // The substituted ip (0) and the unmapped 0xdead both stay as raw
        // hex instead of being dropped.
        assert_eq!(
            frames[0],
            vec!["??? (in pid 7)", "??? (in tid 7)", "0xdead", "0x0"]
        );
    }

    #[test]
    fn shortener_sequence_skips_json_delimiters() {
        let mut shortener = Shortener::default();
        let codes: Vec<String> = (0..95)
            .map(|i| shortener.shorten(&format!("label {i}")))
            .collect();
        assert_eq!(codes[0], "!");
        assert_eq!(codes[1], "#");
        assert!(codes
            .iter()
            .all(|code| !code.contains('"') && !code.contains('\\')));
        // 92 single-character codes exist; then the counter carries.
        assert_eq!(codes[91].len(), 1);
        assert_eq!(codes[92], "!!");
        assert_eq!(codes[93], "#!");
        // Repeated labels reuse their code.
        assert_eq!(shortener.shorten("label 0"), "!");
        let table = shortener.into_table();
        assert_eq!(table["!"], "label 0");
        assert_eq!(table["#!"], "label 93");
    }
}
