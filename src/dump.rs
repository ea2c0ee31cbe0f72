use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use log::warn;
use regex::Regex;

use crate::event::{
    CommEvent, Event, MmapEvent, ProcessEvent, SampleEvent, UnknownEvent,
};
use crate::utils::parse_hex;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read trace dump: {0}")]
    Io(#[from] io::Error),

    /// A record line we matched but could not decode. Downgraded to a
    /// warning by the reader; a single bad line must not end the stream.
    #[error("{0}")]
    Malformed(String),

    #[error("could not run `{command}`: {source}")]
    Spawn {
        command: String,
        source: io::Error,
    },

    #[error("{command} exited with {status}")]
    TraceDumpFailed {
        command: String,
        status: ExitStatus,
    },
}

/// Decodes the trace-dump tool's textual record stream. Record lines look
/// like
///
/// ```text
/// <cpu> <nsec> <hexaddr> [<hexlen>]: PERF_RECORD_<KIND><details>: <rest>
/// ```
///
/// and sample records are followed by `..... N: <hexpc>` continuation lines
/// terminated by a blank line.
pub struct DumpReader<R> {
    input: R,
    record_re: Regex,
    mapinfo_re: Regex,
    frame_re: Regex,
}

impl<R: BufRead> DumpReader<R> {
    pub fn new(input: R) -> Self {
        DumpReader {
            input,
            record_re: Regex::new(
                r"^(?P<cpu>[0-9]+) (?P<nsec>[0-9]+) 0x[0-9a-f]+ \[0x[0-9a-f]+\]: PERF_RECORD_(?P<name>[A-Z0-9_]+)(?P<thing>\(.*?\)|[^:]*): ?(?P<rest>[^ ].*)",
            )
            .expect("static regex"),
            mapinfo_re: Regex::new(
                r"\[(?P<addr>0x[0-9a-f]+|0)\((?P<len>0x[0-9a-f]+)\) @ (?P<offset>[0-9]+|0x[0-9a-f]+)\]",
            )
            .expect("static regex"),
            frame_re: Regex::new(r"^\.\.\.\.\. *(?P<index>[0-9]+): (?P<pc>[0-9a-f]+)")
                .expect("static regex"),
        }
    }

    fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut bytes = Vec::new();
        if self.input.read_until(b'\n', &mut bytes)? == 0 {
            return Ok(None);
        }
        while matches!(bytes.last(), Some(b'\n') | Some(b'\r')) {
            bytes.pop();
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Scan forward to the next record line and decode it. Lines that
    /// don't look like records (hex dumps, summaries) are skipped silently;
    /// malformed record lines are skipped with a warning.
    pub fn next_event(&mut self) -> Result<Option<Event>, Error> {
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(None);
            };
            let Some(header) = self.match_record(&line) else {
                continue;
            };
            match self.parse_record(&header) {
                Ok(event) => return Ok(Some(event)),
                Err(Error::Malformed(msg)) => {
                    warn!("skipping malformed {} record: {msg}", header.name);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn match_record(&self, line: &str) -> Option<RecordLine> {
        let caps = self.record_re.captures(line)?;
        Some(RecordLine {
            cpu: caps["cpu"].parse().ok()?,
            nsec: caps["nsec"].parse().ok()?,
            name: caps["name"].to_string(),
            thing: caps["thing"].to_string(),
            rest: caps["rest"].to_string(),
        })
    }

    fn parse_record(&mut self, header: &RecordLine) -> Result<Event, Error> {
        match header.name.as_str() {
            "MMAP" => self.parse_mmap(header),
            "COMM" => parse_comm(header),
            "FORK" => parse_fork(header),
            "SAMPLE" => self.parse_sample(header),
            other => {
                warn!("Unhandled {other} record");
                Ok(Event::Unknown(UnknownEvent {
                    kind: other.to_string(),
                }))
            }
        }
    }

    fn parse_mmap(&self, header: &RecordLine) -> Result<Event, Error> {
        let (pid, tid) = split_id_pair(&header.thing, '/')?;
        let (mapinfo, filename) = header
            .rest
            .split_once(": ")
            .ok_or_else(|| Error::Malformed(format!("MMAP without map info: {}", header.rest)))?;
        let caps = self
            .mapinfo_re
            .captures(mapinfo)
            .ok_or_else(|| Error::Malformed(format!("MMAP without map info: {mapinfo}")))?;
        // The offset field is hex even when it is printed without a 0x
        // prefix.
        let (address, length, offset) = match (
            parse_hex(&caps["addr"]),
            parse_hex(&caps["len"]),
            parse_hex(&caps["offset"]),
        ) {
            (Some(a), Some(l), Some(o)) => (a, l, o),
            _ => return Err(Error::Malformed(format!("bad map info: {mapinfo}"))),
        };
        Ok(Event::Mmap(MmapEvent {
            pid,
            tid,
            address,
            length,
            offset,
            filename: filename.to_string(),
        }))
    }

    fn parse_sample(&mut self, header: &RecordLine) -> Result<Event, Error> {
        let (ptid, rest) = header
            .rest
            .split_once(": ")
            .ok_or_else(|| Error::Malformed(format!("bad sample header: {}", header.rest)))?;
        let (pid, tid) = split_id_pair(ptid, '/')?;
        let ip = rest
            .split_whitespace()
            .next()
            .and_then(parse_hex)
            .ok_or_else(|| Error::Malformed(format!("bad sample ip: {rest}")))?;

        let mut callchain = Vec::new();
        loop {
            match self.next_line()? {
                None => break,
                Some(line) if line.is_empty() => break,
                Some(line) => {
                    if let Some(caps) = self.frame_re.captures(&line) {
                        match parse_hex(&caps["pc"]) {
                            Some(pc) => callchain.push(pc),
                            None => warn!("skipping unparsable callchain entry: {line}"),
                        }
                    }
                }
            }
        }

        Ok(Event::Sample(SampleEvent {
            cpu: Some(header.cpu),
            time: Some(header.nsec),
            pid: Some(pid),
            tid: Some(tid),
            ip: Some(ip),
            callchain,
        }))
    }
}

struct RecordLine {
    cpu: u32,
    nsec: u64,
    name: String,
    thing: String,
    rest: String,
}

fn parse_comm(header: &RecordLine) -> Result<Event, Error> {
    let (name, tid) = header
        .rest
        .rsplit_once(':')
        .ok_or_else(|| Error::Malformed(format!("bad comm record: {}", header.rest)))?;
    let tid = tid
        .trim()
        .parse()
        .map_err(|_| Error::Malformed(format!("bad comm tid: {tid}")))?;
    Ok(Event::Comm(CommEvent {
        tid,
        name: name.to_string(),
    }))
}

fn parse_fork(header: &RecordLine) -> Result<Event, Error> {
    let (pid, tid) = split_id_pair(&header.thing, ':')?;
    let (ppid, ptid) = split_id_pair(&header.rest, ':')?;
    Ok(Event::Fork(ProcessEvent {
        pid,
        ppid,
        tid,
        ptid,
        time: header.nsec,
    }))
}

/// Split a `pid/tid` or `(pid:tid)` style pair into two ids.
fn split_id_pair(field: &str, separator: char) -> Result<(i32, i32), Error> {
    let trimmed = field.trim().trim_matches(|c| c == '(' || c == ')');
    let parsed = trimmed
        .split_once(separator)
        .and_then(|(a, b)| Some((a.trim().parse().ok()?, b.trim().parse().ok()?)));
    parsed.ok_or_else(|| Error::Malformed(format!("bad id pair: {field}")))
}

/// An event stream produced by running the trace-dump tool as a
/// subprocess. Its stderr is drained on a dedicated thread while the main
/// thread consumes stdout; both are bounded pipes, and a chatty tool would
/// otherwise deadlock against a sequential reader.
pub struct DumpSource {
    reader: DumpReader<BufReader<ChildStdout>>,
    child: Child,
    command: Vec<String>,
    stderr_thread: Option<JoinHandle<String>>,
}

impl DumpSource {
    pub fn spawn(perf: &str, input: &str) -> Result<Self, Error> {
        let command: Vec<String> = [perf, "report", "-D", "-i", input]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut child = Command::new(perf)
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: command.join(" "),
                source,
            })?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");
        let stderr_thread = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf);
            buf
        });
        Ok(DumpSource {
            reader: DumpReader::new(BufReader::new(stdout)),
            child,
            command,
            stderr_thread: Some(stderr_thread),
        })
    }

    pub fn next_event(&mut self) -> Result<Option<Event>, Error> {
        self.reader.next_event()
    }

    /// Wait for the subprocess, after the event stream has been fully
    /// consumed. A nonzero exit replays the buffered stderr and fails, but
    /// everything decoded before the failure has already been delivered.
    pub fn finish(mut self) -> Result<(), Error> {
        let errbuf = self
            .stderr_thread
            .take()
            .map(|handle| handle.join().unwrap_or_default())
            .unwrap_or_default();
        let status = self.child.wait()?;
        if status.success() {
            return Ok(());
        }
        eprintln!("+ {}", self.command.join(" "));
        if !errbuf.is_empty() {
            eprint!("{errbuf}");
            if !errbuf.ends_with('\n') {
                eprintln!();
            }
        }
        Err(Error::TraceDumpFailed {
            command: self.command[0].clone(),
            status,
        })
    }
}
