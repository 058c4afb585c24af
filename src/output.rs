use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;

use crate::organizer::Catalog;
use crate::pipeline::{Job, StatusSink};
use crate::store::ExtractionRecord;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub extractions: Vec<ExtractionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneResult {
    pub removed: Vec<String>,
    pub kept: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingResult {
    pub base_url: String,
    pub status: String,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_job(job: &Job) -> io::Result<()> {
        Self::print_json(job)
    }

    pub fn print_catalog(catalog: &Catalog) -> io::Result<()> {
        Self::print_json(catalog)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_prune(result: &PruneResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_ping(result: &PingResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Writes each new status line to stderr, keeping stdout for JSON.
#[derive(Default)]
pub struct StderrStatus {
    last: Mutex<String>,
}

impl StatusSink for StderrStatus {
    fn update(&self, job: &Job) {
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if *last == job.status || job.status.is_empty() {
            return;
        }
        last.clone_from(&job.status);
        let _ = writeln!(io::stderr().lock(), "[{}] {}", job.state, job.status);
    }
}
