use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("could not read profile: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse profile: {0}")]
    Json(#[from] serde_json::Error),
}

/// One loaded sample: expanded frame labels (root first), the timestamp,
/// and a derived duration. The duration is the symmetric time delta to the
/// neighboring samples on the same thread, an approximation of the
/// scheduling slice the sample stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub time: f64,
    pub duration: f64,
    pub frames: Vec<String>,
}

/// A loaded profile (or any filtered subset of one), exposing the offline
/// analysis operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet {
    pub samples: Vec<Sample>,
}

#[derive(Deserialize)]
struct ProfileDoc {
    #[serde(rename = "profileJSON")]
    profile_json: ProfileJson,
    #[serde(rename = "symbolicationTable", default)]
    symbolication_table: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct ProfileJson {
    threads: Vec<ThreadDoc>,
}

#[derive(Deserialize)]
struct ThreadDoc {
    #[serde(default)]
    samples: Vec<SampleDoc>,
}

#[derive(Deserialize)]
struct SampleDoc {
    time: f64,
    frames: Vec<String>,
}

impl SampleSet {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Deserialize a profile, expanding short-code frame labels through the
    /// symbolication table when one is present. Older profiles without a
    /// table carry literal labels and load unchanged.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, LoadError> {
        let doc: ProfileDoc = serde_json::from_reader(reader)?;
        let mut samples = Vec::new();
        for thread in doc.profile_json.threads {
            let mut thread_samples: Vec<Sample> = thread
                .samples
                .into_iter()
                .map(|s| Sample {
                    time: s.time,
                    duration: 0.0,
                    frames: match &doc.symbolication_table {
                        Some(table) => s
                            .frames
                            .into_iter()
                            .map(|frame| table.get(&frame).cloned().unwrap_or(frame))
                            .collect(),
                        None => s.frames,
                    },
                })
                .collect();
            compute_durations(&mut thread_samples);
            samples.append(&mut thread_samples);
        }
        Ok(SampleSet { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total duration covered by these samples, in milliseconds.
    pub fn total_time(&self) -> f64 {
        self.samples.iter().map(|s| s.duration).sum()
    }

    /// Keep the samples where every pattern matches at least one frame.
    pub fn grep<S: AsRef<str>>(&self, patterns: &[S]) -> Result<SampleSet, regex::Error> {
        let regexes = compile(patterns)?;
        Ok(SampleSet {
            samples: self
                .samples
                .iter()
                .filter(|s| matches_all(&regexes, s))
                .cloned()
                .collect(),
        })
    }

    /// Keep the samples `grep` would drop.
    pub fn grep_v<S: AsRef<str>>(&self, patterns: &[S]) -> Result<SampleSet, regex::Error> {
        let regexes = compile(patterns)?;
        Ok(SampleSet {
            samples: self
                .samples
                .iter()
                .filter(|s| !matches_all(&regexes, s))
                .cloned()
                .collect(),
        })
    }

    /// Partition into maximal contiguous runs of matching samples.
    /// Corrupt-stack samples are ignored entirely; empty runs are dropped.
    pub fn group<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Vec<SampleSet>, regex::Error> {
        let regexes = compile(patterns)?;
        let mut runs = Vec::new();
        let mut current = Vec::new();
        for sample in &self.samples {
            if sample.frames.get(2).map(String::as_str) == Some("Corrupt Stack") {
                continue;
            }
            if matches_all(&regexes, sample) {
                current.push(sample.clone());
            } else if !current.is_empty() {
                runs.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            runs.push(current);
        }
        Ok(runs.into_iter().map(|samples| SampleSet { samples }).collect())
    }

    /// Build a self-time histogram keyed by (frame label, recursion depth
    /// within the sample): a frame recurring at several call depths in one
    /// sample contributes its duration once per depth. `divisor` rescales
    /// the result for multi-run averaging; `pidwash` erases the numeric ids
    /// from the two synthetic outermost frames so runs can be aggregated.
    pub fn invert(&self, divisor: Option<f64>, pidwash: bool) -> HashMap<(String, u32), f64> {
        let id_re = Regex::new(r"^(.*) \(in ([pt]id) [0-9]+\)$").expect("static regex");
        let mut acc: HashMap<(String, u32), f64> = HashMap::new();
        for sample in &self.samples {
            let mut recursion: HashMap<&str, u32> = HashMap::new();
            for (i, frame) in sample.frames.iter().enumerate() {
                let depth_entry = recursion.entry(frame.as_str()).or_insert(0);
                let depth = *depth_entry;
                *depth_entry += 1;
                let label = if pidwash && i < 2 {
                    match id_re.captures(frame) {
                        Some(caps) => format!("{} ({})", &caps[1], &caps[2]),
                        None => frame.clone(),
                    }
                } else {
                    frame.clone()
                };
                *acc.entry((label, depth)).or_insert(0.0) += sample.duration;
            }
        }
        if let Some(divisor) = divisor {
            for value in acc.values_mut() {
                *value /= divisor;
            }
        }
        acc
    }

    /// Keep just the samples from `process_name`'s main thread: both
    /// synthetic outer frames name the process and the tid matches the pid.
    pub fn mainthread(&self, process_name: &str) -> SampleSet {
        let first_re = Regex::new(&format!(
            r"^{} \(in pid ([0-9]+)\)$",
            regex::escape(process_name)
        ))
        .expect("escaped literal");
        let samples = self
            .samples
            .iter()
            .filter(|s| {
                if s.frames.len() < 2 {
                    return false;
                }
                match first_re.captures(&s.frames[0]) {
                    Some(caps) => {
                        s.frames[1] == format!("{process_name} (in tid {})", &caps[1])
                    }
                    None => false,
                }
            })
            .cloned()
            .collect();
        SampleSet { samples }
    }
}

/// Keywise difference of two `invert` histograms, for comparing runs.
pub fn histogram_diff(
    left: &HashMap<(String, u32), f64>,
    right: &HashMap<(String, u32), f64>,
) -> HashMap<(String, u32), f64> {
    let mut diff = left.clone();
    for (key, value) in right {
        *diff.entry(key.clone()).or_insert(0.0) -= value;
    }
    diff
}

fn compile<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|p| Regex::new(p.as_ref())).collect()
}

fn matches_all(regexes: &[Regex], sample: &Sample) -> bool {
    regexes
        .iter()
        .all(|re| sample.frames.iter().any(|frame| re.is_match(frame)))
}

fn compute_durations(samples: &mut [Sample]) {
    let n = samples.len();
    if n == 0 {
        return;
    }
    if n == 1 {
        samples[0].duration = 0.0;
        return;
    }
    samples[0].duration = samples[1].time - samples[0].time;
    samples[n - 1].duration = samples[n - 1].time - samples[n - 2].time;
    for i in 1..n - 1 {
        samples[i].duration = (samples[i + 1].time - samples[i - 1].time) / 2.0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::profile::{ProfileData, ProfileSample};

    fn sample(time: f64, duration: f64, frames: &[&str]) -> Sample {
        Sample {
            time,
            duration,
            frames: frames.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn set(samples: Vec<Sample>) -> SampleSet {
        SampleSet { samples }
    }

    #[test]
    fn round_trip_through_the_writer() {
        let data = ProfileData {
            cpus: vec![vec![
                ProfileSample {
                    time: 1.0,
                    frames: vec!["!".into(), "#".into(), "$".into()],
                },
                ProfileSample {
                    time: 3.0,
                    frames: vec!["!".into(), "#".into()],
                },
            ]],
            symbolication_table: [
                ("!".to_string(), "app (in pid 3)".to_string()),
                ("#".to_string(), "app (in tid 3)".to_string()),
                ("$".to_string(), "work (in /lib/libm.so)".to_string()),
            ]
            .into_iter()
            .collect(),
        };
        let mut bytes = Vec::new();
        data.write_to(&mut bytes).unwrap();

        let loaded = SampleSet::from_reader(&bytes[..]).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.samples[0].frames,
            vec!["app (in pid 3)", "app (in tid 3)", "work (in /lib/libm.so)"]
        );
        assert_eq!(loaded.samples[1].frames, vec!["app (in pid 3)", "app (in tid 3)"]);
        assert_eq!(loaded.samples[0].duration, 2.0);
        assert_eq!(loaded.samples[1].duration, 2.0);
    }

    #[test]
    fn profiles_without_a_symbolication_table_load_verbatim() {
        let doc = serde_json::json!({
            "format": "profileJSON,1",
            "profileJSON": { "threads": [
                { "name": "CPU 0", "samples": [ { "time": 1.0, "frames": ["main"] } ] }
            ]}
        });
        let loaded = SampleSet::from_reader(doc.to_string().as_bytes()).unwrap();
        assert_eq!(loaded.samples[0].frames, vec!["main"]);
    }

    #[test]
    fn durations_average_neighbor_deltas() {
        let doc = serde_json::json!({
            "profileJSON": { "threads": [
                { "samples": [
                    { "time": 0.0, "frames": [] },
                    { "time": 10.0, "frames": [] },
                    { "time": 14.0, "frames": [] },
                    { "time": 20.0, "frames": [] }
                ]},
                { "samples": [ { "time": 5.0, "frames": [] } ] },
                { "samples": [] }
            ]}
        });
        let loaded = SampleSet::from_reader(doc.to_string().as_bytes()).unwrap();
        let durations: Vec<f64> = loaded.samples.iter().map(|s| s.duration).collect();
        assert_eq!(durations, vec![10.0, 7.0, 5.0, 6.0, 0.0]);
        assert_eq!(loaded.total_time(), 28.0);
    }

    #[test]
    fn grep_and_grep_v_partition_the_set() {
        let samples = set(vec![
            sample(0.0, 1.0, &["app (in pid 1)", "app (in tid 1)", "alpha"]),
            sample(1.0, 1.0, &["app (in pid 1)", "app (in tid 1)", "beta"]),
            sample(2.0, 1.0, &["app (in pid 1)", "app (in tid 1)", "alphabet"]),
        ]);
        let kept = samples.grep(&["alpha"]).unwrap();
        let dropped = samples.grep_v(&["alpha"]).unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(dropped.len(), 1);
        assert_eq!(kept.len() + dropped.len(), samples.len());
        for s in &samples.samples {
            let in_kept = kept.samples.contains(s);
            let in_dropped = dropped.samples.contains(s);
            assert!(in_kept != in_dropped);
        }
    }

    #[test]
    fn grep_requires_every_pattern_to_match() {
        let samples = set(vec![
            sample(0.0, 1.0, &["alpha", "beta"]),
            sample(1.0, 1.0, &["alpha"]),
        ]);
        let kept = samples.grep(&["alpha", "beta"]).unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn group_splits_contiguous_runs_and_skips_corrupt_stacks() {
        let samples = set(vec![
            sample(0.0, 1.0, &["p", "t", "paint"]),
            sample(1.0, 1.0, &["p", "t", "Corrupt Stack"]),
            sample(2.0, 1.0, &["p", "t", "paint"]),
            sample(3.0, 1.0, &["p", "t", "idle"]),
            sample(4.0, 1.0, &["p", "t", "paint"]),
        ]);
        let runs = samples.group(&["paint"]).unwrap();
        assert_eq!(runs.len(), 2);
        // The corrupt-stack sample is invisible, so the first run spans the
        // samples around it.
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1].len(), 1);

        let no_runs = samples.group(&["nomatch"]).unwrap();
        assert!(no_runs.is_empty());
    }

    #[test]
    fn invert_buckets_by_recursion_depth() {
        let samples = set(vec![sample(0.0, 2.0, &["a", "b", "a"])]);
        let histogram = samples.invert(None, false);
        assert_eq!(histogram[&("a".to_string(), 0)], 2.0);
        assert_eq!(histogram[&("a".to_string(), 1)], 2.0);
        assert_eq!(histogram[&("b".to_string(), 0)], 2.0);
        assert_eq!(histogram.len(), 3);
    }

    #[test]
    fn invert_is_pure() {
        let samples = set(vec![
            sample(0.0, 1.0, &["x (in pid 9)", "x (in tid 9)", "f"]),
            sample(1.0, 3.0, &["x (in pid 9)", "x (in tid 9)", "f", "g"]),
        ]);
        assert_eq!(samples.invert(None, false), samples.invert(None, false));
    }

    #[test]
    fn invert_washes_ids_and_divides() {
        let samples = set(vec![sample(0.0, 4.0, &["x (in pid 9)", "x (in tid 9)", "f"])]);
        let histogram = samples.invert(Some(2.0), true);
        assert_eq!(histogram[&("x (pid)".to_string(), 0)], 2.0);
        assert_eq!(histogram[&("x (tid)".to_string(), 0)], 2.0);
        assert_eq!(histogram[&("f".to_string(), 0)], 2.0);
    }

    #[test]
    fn mainthread_matches_pid_and_tid() {
        let samples = set(vec![
            sample(0.0, 1.0, &["app (in pid 3)", "app (in tid 3)", "f"]),
            sample(1.0, 1.0, &["app (in pid 3)", "worker (in tid 4)", "f"]),
            sample(2.0, 1.0, &["app (in pid 3)", "app (in tid 4)", "f"]),
            sample(3.0, 1.0, &["other (in pid 5)", "other (in tid 5)", "f"]),
        ]);
        let main = samples.mainthread("app");
        assert_eq!(main.len(), 1);
        assert_eq!(main.samples[0].time, 0.0);
    }

    #[test]
    fn histogram_difference() {
        let left: HashMap<(String, u32), f64> =
            [(("f".to_string(), 0), 5.0), (("g".to_string(), 0), 1.0)]
                .into_iter()
                .collect();
        let right: HashMap<(String, u32), f64> =
            [(("f".to_string(), 0), 3.0), (("h".to_string(), 0), 2.0)]
                .into_iter()
                .collect();
        let diff = histogram_diff(&left, &right);
        assert_eq!(diff[&("f".to_string(), 0)], 2.0);
        assert_eq!(diff[&("g".to_string(), 0)], 1.0);
        assert_eq!(diff[&("h".to_string(), 0)], -2.0);
    }
}
