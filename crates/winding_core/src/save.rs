//! Crash-safe checkpointing of results.
//!
//! Results are serialized as a tagged record distinguishing the line,
//! surface, and volume kinds. Writes are atomic (temporary file in the
//! same directory, then rename) so a partially written checkpoint never
//! becomes the target path. Saves can be dispatched to a single
//! background worker through a one-slot, latest-value-wins mailbox; on
//! shutdown the final pending save is flushed before the worker joins.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::error::{Error, Result};
use crate::line::LineResult;
use crate::surface::SurfaceResult;
use crate::volume::VolumeResult;

/// A persisted result, tagged by kind so restarts can verify they are
/// loading what they expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SavedResult {
    Line(LineResult),
    Surface(SurfaceResult),
    Volume(VolumeResult),
}

impl SavedResult {
    /// The checkpoint kind tag, as it appears on disk.
    pub fn kind(&self) -> &'static str {
        match self {
            SavedResult::Line(_) => "line",
            SavedResult::Surface(_) => "surface",
            SavedResult::Volume(_) => "volume",
        }
    }
}

/// Checkpoint target and resume behavior for one run.
#[derive(Debug, Clone, Default)]
pub struct SaveSettings {
    /// Checkpoint file; `None` disables persistence entirely.
    pub save_file: Option<PathBuf>,
    /// Resume from `save_file` before running.
    pub load: bool,
    /// Treat a missing or undecodable checkpoint as a fresh run instead
    /// of an error.
    pub load_quiet: bool,
}

impl SaveSettings {
    /// Checkpoints to `path`, without loading.
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            save_file: Some(path.into()),
            ..Self::default()
        }
    }

    /// Checkpoints to `path` and resumes from it when present.
    pub fn resume_from(path: impl Into<PathBuf>) -> Self {
        Self {
            save_file: Some(path.into()),
            load: true,
            load_quiet: true,
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(path) = &self.save_file {
            if let Some(dir) = path.parent() {
                if !dir.as_os_str().is_empty() && !dir.is_dir() {
                    return Err(Error::Config(format!(
                        "save file directory {} does not exist",
                        dir.display()
                    )));
                }
            }
        } else if self.load {
            return Err(Error::Config(
                "load requested without a save_file to load from".into(),
            ));
        }
        Ok(())
    }

    /// Spawns the background save worker when a target is configured.
    pub(crate) fn spawn_worker(&self) -> Result<Option<SaveWorker>> {
        self.validate()?;
        Ok(self.save_file.clone().map(SaveWorker::spawn))
    }
}

/// Serializes a result and atomically replaces `path` with it.
pub fn save_result(path: &Path, result: &SavedResult) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("{} is not a file path", path.display())))?;
    let bytes = serde_json::to_vec_pretty(result)?;

    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a previously saved result of any kind.
pub fn load_result(path: &Path) -> Result<SavedResult> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) fn expect_line(saved: SavedResult) -> Result<LineResult> {
    match saved {
        SavedResult::Line(result) => Ok(result),
        other => Err(kind_mismatch("line", &other)),
    }
}

pub(crate) fn expect_surface(saved: SavedResult) -> Result<SurfaceResult> {
    match saved {
        SavedResult::Surface(result) => Ok(result),
        other => Err(kind_mismatch("surface", &other)),
    }
}

pub(crate) fn expect_volume(saved: SavedResult) -> Result<VolumeResult> {
    match saved {
        SavedResult::Volume(result) => Ok(result),
        other => Err(kind_mismatch("volume", &other)),
    }
}

fn kind_mismatch(expected: &str, got: &SavedResult) -> Error {
    Error::Config(format!(
        "loaded checkpoint holds a {} result, expected {expected}",
        got.kind()
    ))
}

/// Resolves the result to resume from: an explicit `init_result`, the
/// checkpoint file when `load` is set, or nothing. The two sources are
/// mutually exclusive.
pub(crate) fn resolve_init<R>(
    save: &SaveSettings,
    init_result: Option<&R>,
    expect: fn(SavedResult) -> Result<R>,
) -> Result<Option<R>> {
    if save.load && init_result.is_some() {
        return Err(Error::Config(
            "init_result and load=true are mutually exclusive".into(),
        ));
    }
    if !save.load {
        return Ok(None);
    }
    let path = save
        .save_file
        .as_ref()
        .ok_or_else(|| Error::Config("load requested without a save_file to load from".into()))?;

    match load_result(path) {
        Ok(saved) => expect(saved).map(Some),
        Err(Error::Persist(err)) if save.load_quiet && err.kind() == io::ErrorKind::NotFound => {
            log::warn!(
                "checkpoint {} not found, starting a fresh run",
                path.display()
            );
            Ok(None)
        }
        Err(Error::Decode(err)) if save.load_quiet => {
            log::warn!(
                "checkpoint {} could not be decoded ({err}), starting a fresh run",
                path.display()
            );
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[derive(Debug)]
struct Mailbox {
    state: Mutex<MailboxState>,
    signal: Condvar,
}

#[derive(Debug)]
struct MailboxState {
    pending: Option<SavedResult>,
    shutdown: bool,
    last_error: Option<String>,
}

/// Single background writer with a one-slot mailbox. A slow write never
/// blocks the computation; a newer result simply replaces the one still
/// waiting in the slot.
#[derive(Debug)]
pub struct SaveWorker {
    mailbox: Arc<Mailbox>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SaveWorker {
    pub fn spawn(path: PathBuf) -> Self {
        let mailbox = Arc::new(Mailbox {
            state: Mutex::new(MailboxState {
                pending: None,
                shutdown: false,
                last_error: None,
            }),
            signal: Condvar::new(),
        });

        let shared = Arc::clone(&mailbox);
        let handle = thread::spawn(move || loop {
            let job = {
                let mut guard = match shared.state.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                loop {
                    if let Some(job) = guard.pending.take() {
                        break Some(job);
                    }
                    if guard.shutdown {
                        break None;
                    }
                    guard = match shared.signal.wait(guard) {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                }
            };

            match job {
                Some(result) => {
                    if let Err(err) = save_result(&path, &result) {
                        log::error!("background save to {} failed: {err}", path.display());
                        if let Ok(mut guard) = shared.state.lock() {
                            guard.last_error = Some(err.to_string());
                        }
                    }
                }
                None => return,
            }
        });

        Self {
            mailbox,
            handle: Some(handle),
        }
    }

    /// Queues `result` for writing, replacing any not-yet-written
    /// predecessor.
    pub fn dispatch(&self, result: SavedResult) {
        if let Ok(mut guard) = self.mailbox.state.lock() {
            guard.pending = Some(result);
            self.mailbox.signal.notify_one();
        }
    }

    /// Flushes the final pending save and joins the worker, so the
    /// on-disk result matches the last dispatched one.
    pub fn close(mut self) -> Result<()> {
        self.shutdown_and_join();
        let last_error = self
            .mailbox
            .state
            .lock()
            .map(|guard| guard.last_error.clone())
            .unwrap_or(None);
        match last_error {
            Some(message) => Err(Error::Persist(io::Error::other(message))),
            None => Ok(()),
        }
    }

    fn shutdown_and_join(&mut self) {
        if let Ok(mut guard) = self.mailbox.state.lock() {
            guard.shutdown = true;
            self.mailbox.signal.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SaveWorker {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
