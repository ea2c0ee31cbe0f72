use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde_json::{json, Value};

pub const FORMAT_TAG: &str = "profileJSONWithSymbolicationTable,1";

/// One converted stack sample: a timestamp in milliseconds and a root-first
/// frame list of shortened labels.
#[derive(Debug, Clone)]
pub struct ProfileSample {
    pub time: f64,
    pub frames: Vec<String>,
}

/// The finished conversion result: per-CPU sample lists in arrival order,
/// plus the short-code → long-label expansion table.
#[derive(Debug, Clone, Default)]
pub struct ProfileData {
    pub cpus: Vec<Vec<ProfileSample>>,
    pub symbolication_table: HashMap<String, String>,
}

impl ProfileData {
    pub fn to_json(&self) -> Value {
        let threads: Vec<Value> = self
            .cpus
            .iter()
            .enumerate()
            .map(|(cpu, samples)| {
                let samples: Vec<Value> = samples
                    .iter()
                    .map(|s| json!({ "time": s.time, "frames": s.frames }))
                    .collect();
                json!({ "name": format!("CPU {cpu}"), "samples": samples })
            })
            .collect();
        json!({
            "format": FORMAT_TAG,
            "profileJSON": { "threads": threads },
            "symbolicationTable": self.symbolication_table,
        })
    }

    pub fn write_to<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer(writer, &self.to_json())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.flush()
    }
}

/// A timestamp-named file in the working directory, so consecutive runs
/// never collide.
pub fn default_output_path() -> PathBuf {
    PathBuf::from(Local::now().format("perf_%Y%m%d_%H%M%S.txt").to_string())
}
