//! Active-run registry: one record file per supervised run, so stale
//! supervisor artefacts can be detected and swept.
//!
//! A record outliving its process is the only failure mode here — the
//! supervisor deletes its record on normal shutdown, and `cleanup` probes
//! each recorded pid with signal 0 to find the ones whose owner died.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EvsError;
use crate::jsonl;
use crate::paths::EvsPaths;
use crate::session::Agent;
use crate::util;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRun {
    pub schema_version: u32,
    pub agent: Agent,
    pub run_id: String,
    pub pid: u32,
    pub control_dir: PathBuf,
    pub cwd: PathBuf,
    pub reload_mode: String,
    pub started_at: String,
}

impl ActiveRun {
    pub fn new(
        agent: Agent,
        run_id: &str,
        control_dir: PathBuf,
        cwd: PathBuf,
        reload_mode: &str,
    ) -> ActiveRun {
        ActiveRun {
            schema_version: 1,
            agent,
            run_id: run_id.to_string(),
            pid: std::process::id(),
            control_dir,
            cwd,
            reload_mode: reload_mode.to_string(),
            started_at: util::now_iso(),
        }
    }
}

pub fn write_record(paths: &EvsPaths, run: &ActiveRun) -> Result<(), EvsError> {
    let path = paths.active_record(run.agent, &run.run_id);
    jsonl::write_json_atomic(&path, &serde_json::to_value(run)?)
}

pub fn remove_record(paths: &EvsPaths, agent: Agent, run_id: &str) -> Result<(), EvsError> {
    let path = paths.active_record(agent, run_id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EvsError::io_at(&path, e)),
    }
}

/// Every parseable record in the registry, with its file path.
pub fn list_records(paths: &EvsPaths) -> Result<Vec<(PathBuf, ActiveRun)>, EvsError> {
    let dir = paths.active_dir();
    let mut records = Vec::new();
    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(EvsError::io_at(&dir, e)),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "json") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else { continue };
        if let Ok(record) = serde_json::from_str::<ActiveRun>(&content) {
            records.push((path, record));
        }
    }
    records.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(records)
}

/// Signal-0 probe: is the recorded pid still alive?
///
/// EDGE: a recycled pid reads as alive and keeps a genuinely stale record
/// around until the impostor exits — acceptable, since cleanup must never
/// delete the record of a running supervisor.
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Sweep records whose owning process is gone, along with their control
/// directories. Returns the removed run ids.
pub fn cleanup(paths: &EvsPaths) -> Result<Vec<String>, EvsError> {
    let mut removed = Vec::new();
    for (path, record) in list_records(paths)? {
        if pid_alive(record.pid) {
            continue;
        }
        std::fs::remove_file(&path).map_err(|e| EvsError::io_at(&path, e))?;
        if record.control_dir.exists() {
            let _ = std::fs::remove_dir_all(&record.control_dir);
        }
        removed.push(record.run_id);
    }
    Ok(removed)
}
