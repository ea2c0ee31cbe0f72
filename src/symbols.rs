use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use log::warn;
use regex::Regex;

use crate::utils::parse_hex;

/// Names that mark the end of a section rather than real code; a lookup
/// that lands on one of these is past the last function.
const SECTION_END_SENTINELS: &[&str] = &["_etext", "_einittext", "_edata"];

#[derive(Debug, Clone)]
struct Symbol {
    address: u64,
    kind: u8,
    name: String,
    /// Originating module, where the input distinguishes one (kallsyms-style
    /// tables). `None` means the table's own object name.
    module: Option<String>,
}

/// The result of a successful symbol lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolMatch<'a> {
    pub name: &'a str,
    pub module: &'a str,
    /// Distance from the symbol's own address.
    pub offset: u64,
}

/// An ELF LOAD program header, used to translate symbol virtual addresses
/// to file offsets.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub file_size: u64,
    pub file_offset: u64,
}

/// A name/address table for one binary object (or the kernel), sorted by
/// address. Built once per distinct object and never mutated afterwards.
pub struct SymbolTable {
    name: String,
    syms: Vec<Symbol>,
}

impl SymbolTable {
    pub fn empty(name: impl Into<String>) -> Self {
        SymbolTable {
            name: name.into(),
            syms: Vec::new(),
        }
    }

    /// Parse `nm`-style output: one `<hexaddr> <kindletter> <name>` line per
    /// symbol. `addr_map` translates virtual addresses to file offsets;
    /// symbols outside every segment are dropped.
    pub fn from_nm_output<R: BufRead>(
        name: impl Into<String>,
        input: R,
        addr_map: Option<&[LoadSegment]>,
    ) -> std::io::Result<Self> {
        Self::parse(name.into(), input, false, addr_map)
    }

    /// Parse a kallsyms-style table: same line grammar as `nm`, but a name
    /// may carry a tab-separated originating-module suffix.
    pub fn from_kallsyms<R: BufRead>(name: impl Into<String>, input: R) -> std::io::Result<Self> {
        Self::parse(name.into(), input, true, None)
    }

    fn parse<R: BufRead>(
        name: String,
        input: R,
        kallsyms: bool,
        addr_map: Option<&[LoadSegment]>,
    ) -> std::io::Result<Self> {
        let line_re = Regex::new(r"^(?P<addr>[0-9a-fA-F ]+) (?P<kind>[A-Za-z]) (?P<name>.*)")
            .expect("static regex");

        let mut syms = Vec::new();
        for line in input.lines() {
            let line = line?;
            let Some(caps) = line_re.captures(&line) else {
                continue;
            };
            let addr_field = &caps["addr"];
            // An address field with embedded whitespace is multi-column
            // output we don't understand.
            if addr_field.contains(' ') {
                continue;
            }
            let Some(mut address) = parse_hex(addr_field) else {
                continue;
            };
            if let Some(segments) = addr_map {
                match map_address(segments, address) {
                    Some(mapped) => address = mapped,
                    None => continue,
                }
            }
            let (sym_name, module) = if kallsyms {
                match caps["name"].split_once('\t') {
                    Some((n, m)) => (n.to_string(), Some(m.to_string())),
                    None => (caps["name"].to_string(), None),
                }
            } else {
                (caps["name"].to_string(), None)
            };
            // Compiler-internal aliases and mapping symbols carry a
            // dollar-prefixed suffix ("$x", "foo$a").
            let bytes = sym_name.as_bytes();
            if bytes.len() >= 2 && bytes[bytes.len() - 2] == b'$' {
                continue;
            }
            syms.push(Symbol {
                address,
                kind: caps["kind"].as_bytes()[0],
                name: sym_name,
                module,
            });
        }
        syms.sort_by(|a, b| {
            (a.address, a.kind, a.name.as_str()).cmp(&(b.address, b.kind, b.name.as_str()))
        });
        Ok(SymbolTable { name, syms })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    /// Address of the first known symbol.
    pub fn first_address(&self) -> Option<u64> {
        self.syms.first().map(|s| s.address)
    }

    /// Address of the last known symbol.
    pub fn last_address(&self) -> Option<u64> {
        self.syms.last().map(|s| s.address)
    }

    /// Find the symbol covering `offset`: the entry with the greatest
    /// address at or below it. Only code symbols (`t`, `T`, `W`) qualify,
    /// and end-of-section sentinels never match.
    pub fn lookup(&self, offset: u64) -> Option<SymbolMatch<'_>> {
        let i = self.syms.partition_point(|s| s.address <= offset);
        if i == 0 {
            return None;
        }
        let sym = &self.syms[i - 1];
        if !matches!(sym.kind, b't' | b'T' | b'W') {
            return None;
        }
        if SECTION_END_SENTINELS.contains(&sym.name.as_str()) {
            return None;
        }
        Some(SymbolMatch {
            name: &sym.name,
            module: sym.module.as_deref().unwrap_or(&self.name),
            offset: offset - sym.address,
        })
    }
}

fn map_address(segments: &[LoadSegment], addr: u64) -> Option<u64> {
    for seg in segments {
        if seg.vaddr <= addr && addr < seg.vaddr + seg.file_size {
            return Some(addr - seg.vaddr + seg.file_offset);
        }
    }
    None
}

/// Resolves trace filenames to on-target binaries and extracts their symbol
/// tables via external tooling. All environment-derived path hints are
/// captured at construction; nothing here is process-global.
pub struct SymbolResolver {
    objdir: Option<PathBuf>,
    product_out: Option<PathBuf>,
    nm: String,
    readelf: String,
}

impl SymbolResolver {
    pub fn new(objdir: Option<PathBuf>, product_out: Option<PathBuf>, tool_prefix: &str) -> Self {
        SymbolResolver {
            objdir,
            product_out,
            nm: format!("{tool_prefix}nm"),
            readelf: format!("{tool_prefix}readelf"),
        }
    }

    pub fn from_env() -> Self {
        let tool_prefix = std::env::var("TARGET_TOOLS_PREFIX").unwrap_or_default();
        Self::new(
            std::env::var_os("GECKO_OBJDIR").map(PathBuf::from),
            std::env::var_os("PRODUCT_OUT").map(PathBuf::from),
            &tool_prefix,
        )
    }

    /// Build a symbol table for an absolute on-target path. Falls back to an
    /// empty table (with a warning) when no resolution strategy works out —
    /// a missing symbol file must not stop the conversion.
    pub fn resolve(&self, target_path: &str) -> Arc<SymbolTable> {
        for candidate in self.candidate_paths(target_path) {
            if !candidate.exists() {
                continue;
            }
            let segments = match self.load_segments(&candidate) {
                Ok(segments) => segments,
                Err(e) => {
                    warn!("readelf failed for {}: {}", candidate.display(), e);
                    continue;
                }
            };
            // Try the regular symbol table first, then the dynamic one.
            for nm_args in [&["-C"][..], &["-C", "-D"][..]] {
                let output = match self.run_nm(nm_args, &candidate) {
                    Ok(output) => output,
                    Err(e) => {
                        warn!("{} failed for {}: {}", self.nm, candidate.display(), e);
                        break;
                    }
                };
                match SymbolTable::from_nm_output(target_path, &output[..], Some(&segments)) {
                    Ok(table) if !table.is_empty() => return Arc::new(table),
                    Ok(_) => {}
                    Err(e) => warn!("bad nm output for {}: {}", candidate.display(), e),
                }
            }
        }
        warn!("no file found for {target_path}");
        Arc::new(SymbolTable::empty(target_path))
    }

    fn candidate_paths(&self, target_path: &str) -> Vec<PathBuf> {
        let path = target_path.trim_start_matches('/');
        let mut attempts = Vec::new();
        if let (Some(objdir), Some(rest)) = (&self.objdir, path.strip_prefix("system/b2g/")) {
            attempts.push(objdir.join("dist/bin").join(rest));
        }
        if let Some(product_out) = &self.product_out {
            attempts.push(product_out.join("symbols").join(path));
            attempts.push(product_out.join("root").join(path));
            attempts.push(product_out.join(path));
        }
        attempts
    }

    /// Collect the LOAD program headers of `path` so symbol virtual
    /// addresses can be translated to file offsets.
    fn load_segments(&self, path: &Path) -> std::io::Result<Vec<LoadSegment>> {
        let output = Command::new(&self.readelf)
            .arg("-l")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?
            .wait_with_output()?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mut segments = Vec::new();
        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            if !line.starts_with("  LOAD ") {
                continue;
            }
            let mut fields: Vec<&str> = line.split_whitespace().skip(1).collect();
            let continuation;
            if fields.len() < 5 {
                // 64-bit layouts wrap the numbers onto a second line.
                continuation = lines.next().unwrap_or_default();
                fields.extend(continuation.split_whitespace());
            }
            if fields.len() < 5 {
                warn!("short LOAD line in readelf output for {}", path.display());
                continue;
            }
            match (
                parse_hex(fields[0]),
                parse_hex(fields[1]),
                parse_hex(fields[3]),
            ) {
                (Some(file_offset), Some(vaddr), Some(file_size)) => {
                    segments.push(LoadSegment {
                        vaddr,
                        file_size,
                        file_offset,
                    });
                }
                _ => warn!("bad LOAD line in readelf output for {}", path.display()),
            }
        }
        Ok(segments)
    }

    fn run_nm(&self, args: &[&str], path: &Path) -> std::io::Result<Vec<u8>> {
        let output = Command::new(&self.nm)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?
            .wait_with_output()?;
        Ok(output.stdout)
    }
}
