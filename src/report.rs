//! Per-cycle measurement log.
//!
//! Appends one JSON line per completed exchange so offsets can be graphed or
//! post-processed without scraping the log output.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// One completed exchange, all times in whole nanoseconds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CycleRecord {
    /// Unix seconds when the record was written.
    pub ts: u64,
    pub sequence_id: u16,
    pub t1: i64,
    pub r1: i64,
    pub t2: i64,
    pub r2: i64,
    /// `t2 - t1`, the offset-from-master estimate.
    pub offset: i64,
}

pub struct Reporter {
    file: File,
}

impl Reporter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open report file: {}", path.display()))?;
        Ok(Self { file })
    }

    pub fn append(&mut self, mut record: CycleRecord) -> Result<()> {
        record.ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let line = serde_json::to_string(&record)?;
        writeln!(self.file, "{}", line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_json_lines() {
        let dir = std::env::temp_dir().join(format!("csptp-report-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cycles.jsonl");
        let _ = std::fs::remove_file(&path);

        let mut rep = Reporter::create(&path).unwrap();
        for seq in [1u16, 2] {
            rep.append(CycleRecord {
                ts: 0,
                sequence_id: seq,
                t1: 1,
                r1: 2,
                t2: 3,
                r2: 4,
                offset: 2,
            })
            .unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["sequence_id"], 2);
        assert_eq!(v["offset"], 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
