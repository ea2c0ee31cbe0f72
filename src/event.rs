use std::fmt;

/// One decoded trace record, normalized across the binary and textual
/// input forms.
#[derive(Debug)]
pub enum Event {
    Mmap(MmapEvent),
    Comm(CommEvent),
    Fork(ProcessEvent),
    Exit(ProcessEvent),
    Sample(SampleEvent),
    Lost(LostEvent),
    Throttle(ThrottleEvent),
    Unthrottle(ThrottleEvent),
    /// A record kind we recognize but don't decode, or don't know at all.
    Unknown(UnknownEvent),
}

/// A new file mapping in a process's address space. `pid == -1` targets
/// the kernel space.
pub struct MmapEvent {
    pub pid: i32,
    pub tid: i32,
    pub address: u64,
    pub length: u64,
    pub offset: u64,
    pub filename: String,
}

#[derive(Debug)]
pub struct CommEvent {
    pub tid: i32,
    pub name: String,
}

/// Shared payload of fork and exit records.
#[derive(Debug)]
pub struct ProcessEvent {
    pub pid: i32,
    pub ppid: i32,
    pub tid: i32,
    pub ptid: i32,
    pub time: u64,
}

/// One stack snapshot. The identification fields are optional because the
/// binary form only carries the fields selected by the trace's
/// sample-format bitmask.
pub struct SampleEvent {
    pub cpu: Option<u32>,
    pub time: Option<u64>,
    pub pid: Option<i32>,
    pub tid: Option<i32>,
    pub ip: Option<u64>,
    pub callchain: Vec<u64>,
}

#[derive(Debug)]
pub struct LostEvent {
    pub id: u64,
    pub count: u64,
}

#[derive(Debug)]
pub struct ThrottleEvent {
    pub time: u64,
    pub id: u64,
    pub stream_id: u64,
}

#[derive(Debug)]
pub struct UnknownEvent {
    pub kind: String,
}

struct Hex(u64);

impl fmt::Debug for Hex {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{:#x}", self.0)
    }
}

impl fmt::Debug for MmapEvent {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_map()
            .entry(&"pid", &self.pid)
            .entry(&"tid", &self.tid)
            .entry(&"address", &Hex(self.address))
            .entry(&"length", &Hex(self.length))
            .entry(&"offset", &Hex(self.offset))
            .entry(&"filename", &self.filename)
            .finish()
    }
}

impl fmt::Debug for SampleEvent {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        struct HexChain<'a>(&'a [u64]);
        impl fmt::Debug for HexChain<'_> {
            fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
                fmt.debug_list()
                    .entries(self.0.iter().map(|&pc| Hex(pc)))
                    .finish()
            }
        }

        fmt.debug_map()
            .entry(&"cpu", &self.cpu)
            .entry(&"time", &self.time)
            .entry(&"pid", &self.pid)
            .entry(&"tid", &self.tid)
            .entry(&"ip", &self.ip.map(Hex))
            .entry(&"callchain", &HexChain(&self.callchain))
            .finish()
    }
}
