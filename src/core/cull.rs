use crate::core::cluster::Cluster;
use crate::database::{IncrementalStore, StoreError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CullError {
    #[error("At least one image in the group must be kept")]
    NothingKept,

    #[error("{0} is not a member of this group")]
    UnknownMember(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("History error: {0}")]
    History(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One line of the cull history file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CullHistoryRecord {
    pub timestamp: String,
    pub retained: Vec<String>,
    pub culled: Vec<String>,
    pub action: String,
}

#[derive(Debug, Default, Clone)]
pub struct CullReport {
    pub deleted: Vec<String>,
    /// Files that could not be removed, with the reason. Their records stay.
    pub failed: Vec<(String, String)>,
}

/// Delete every member of `cluster` not listed in `keep`, from disk and from
/// the store, and append what happened to `history` when given.
pub fn delete_unselected(
    cluster: &Cluster,
    keep: &HashSet<String>,
    store: &IncrementalStore,
    history: Option<&Path>,
) -> Result<CullReport, CullError> {
    if let Some(unknown) = keep
        .iter()
        .find(|id| !cluster.members.iter().any(|m| &m.identity == *id))
    {
        return Err(CullError::UnknownMember(unknown.clone()));
    }
    if keep.is_empty() {
        return Err(CullError::NothingKept);
    }

    let mut report = CullReport::default();
    for member in cluster.members.iter().filter(|m| !keep.contains(&m.identity)) {
        match fs::remove_file(&member.identity) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("{} was already gone", member.identity);
            }
            Err(e) => {
                log::error!("Couldn't delete {}: {}", member.identity, e);
                report.failed.push((member.identity.clone(), e.to_string()));
                continue;
            }
        }
        store.remove(&member.identity)?;
        log::info!("Deleted {}", member.identity);
        report.deleted.push(member.identity.clone());
    }

    if let Some(history) = history {
        if !report.deleted.is_empty() {
            let mut retained: Vec<String> = keep.iter().cloned().collect();
            retained.sort();
            append_history(
                history,
                &CullHistoryRecord {
                    timestamp: Utc::now().to_rfc3339(),
                    retained,
                    culled: report.deleted.clone(),
                    action: "deleted".to_string(),
                },
            )?;
        }
    }

    Ok(report)
}

pub fn append_history(path: &Path, record: &CullHistoryRecord) -> Result<(), CullError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(out, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

/// Read every well-formed history record; a missing file is an empty history.
pub fn read_history(path: &Path) -> Result<Vec<CullHistoryRecord>, CullError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CullHistoryRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => log::warn!("Skipping malformed history entry {}: {}", i, err),
        }
    }
    Ok(records)
}
