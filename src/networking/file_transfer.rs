use anyhow::{anyhow, Context as _, Result};
use log::{debug, error, info, trace, warn};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tonic::Status;

use super::communication::warp::{FileChunk, FileTime, OpInfo, TransferOpRequest};
use crate::engine::Context;
use crate::events::EngineEvent;

/// Payload size of every streamed chunk
pub const CHUNK_SIZE: usize = 512 * 1024;
const DIRECTORY_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    WaitingPermission,
    Declined,
    Transferring,
    /// Reserved for flow control, nothing enters it yet
    Paused,
    Stopped,
    Failed,
    Finished,
    FinishedWithErrors,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Declined
                | TransferStatus::Stopped
                | TransferStatus::Failed
                | TransferStatus::Finished
                | TransferStatus::FinishedWithErrors
        )
    }

    /// Edges of the transfer state graph. Terminal states have none.
    pub fn can_become(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (WaitingPermission, Transferring | Declined | Stopped | Failed)
                | (Transferring, Paused | Stopped | Failed | Finished | FinishedWithErrors)
                | (Paused, Transferring | Stopped | Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Kind of entry a chunk belongs to, as numbered on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File = 1,
    Directory = 2,
    Symlink = 3,
}

impl EntryType {
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            1 => Some(EntryType::File),
            2 => Some(EntryType::Directory),
            3 => Some(EntryType::Symlink),
            _ => None,
        }
    }
}

/// One item of an outgoing transfer, in send order
#[derive(Debug, Clone, PartialEq)]
pub struct SendEntry {
    pub path: PathBuf,
    /// `/`-separated path below the parent of the input it came from
    pub relative_path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// What is announced to the receiver before any data moves
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferSummary {
    pub total_size: u64,
    pub file_count: u64,
    pub single_name: String,
    pub single_mime: String,
    pub top_dir_basenames: Vec<String>,
}

#[derive(Debug)]
struct TransferState {
    status: TransferStatus,
    bytes_transferred: u64,
    bytes_per_second: u64,
    errors: Vec<String>,
    real_start: Option<Instant>,
    last_chunk: Option<Instant>,
    overwrite_warning: bool,
}

/// What the receive loop does after applying a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Continue,
    /// Stopped or failed from elsewhere; nothing left to do
    Ended,
    /// Writing failed here and the sender hasn't been told
    Failed,
}

/// File currently being written on the receiving side. Chunk boundaries
/// between files are only visible as a change of relative path.
#[derive(Debug, Default)]
struct ReceiveState {
    current_relative: Option<String>,
    current_path: Option<PathBuf>,
    current_mtime: Option<SystemTime>,
    file: Option<tokio::fs::File>,
}

/// One send or receive operation with a remote, identified on both peers by
/// (remote identifier, start time)
pub struct Transfer {
    ctx: Arc<Context>,
    remote_id: String,
    start_time: u64,
    direction: TransferDirection,
    summary: TransferSummary,
    entries: Vec<SendEntry>,
    state: Mutex<TransferState>,
    cancelled: AtomicBool,
    receiver: tokio::sync::Mutex<ReceiveState>,
}

impl Transfer {
    fn new(
        ctx: Arc<Context>,
        remote_id: &str,
        start_time: u64,
        direction: TransferDirection,
        summary: TransferSummary,
        entries: Vec<SendEntry>,
    ) -> Self {
        Self {
            ctx,
            remote_id: remote_id.to_string(),
            start_time,
            direction,
            summary,
            entries,
            state: Mutex::new(TransferState {
                status: TransferStatus::WaitingPermission,
                bytes_transferred: 0,
                bytes_per_second: 0,
                errors: Vec::new(),
                real_start: None,
                last_chunk: None,
                overwrite_warning: false,
            }),
            cancelled: AtomicBool::new(false),
            receiver: tokio::sync::Mutex::new(ReceiveState::default()),
        }
    }

    /// Expand `paths` into the ordered send list and compute what gets
    /// announced. Walks the filesystem, so call it off the async threads.
    pub fn prepare_send(ctx: Arc<Context>, remote_id: &str, paths: &[PathBuf], start_time: u64) -> Result<Self> {
        if paths.is_empty() {
            return Err(anyhow!("Nothing to send"));
        }
        let entries = resolve_files(paths)?;

        let total_size = entries.iter().filter(|e| !e.is_dir).map(|e| e.size).sum();
        let top_dir_basenames = paths
            .iter()
            .map(|p| base_name(p))
            .collect::<Result<Vec<_>>>()?;

        let (single_name, single_mime) = match paths {
            [only] => {
                let name = base_name(only)?;
                let mime = if only.is_dir() {
                    String::new()
                } else {
                    mime_guess::from_path(only).first_or_octet_stream().to_string()
                };
                (name, mime)
            }
            _ => (String::new(), String::new()),
        };

        let summary = TransferSummary {
            total_size,
            file_count: entries.len() as u64,
            single_name,
            single_mime,
            top_dir_basenames,
        };
        debug!(
            "Prepared transfer {} to {}: {} entries, {} bytes",
            start_time, remote_id, summary.file_count, summary.total_size
        );

        Ok(Self::new(ctx, remote_id, start_time, TransferDirection::Send, summary, entries))
    }

    /// Record an offer received from `request.info.ident`
    pub fn from_offer(ctx: Arc<Context>, request: &TransferOpRequest) -> Result<Self> {
        let info = request
            .info
            .as_ref()
            .ok_or_else(|| anyhow!("Transfer offer without operation info"))?;
        let summary = TransferSummary {
            total_size: request.size,
            file_count: request.count,
            single_name: request.name_if_single.clone(),
            single_mime: request.mime_if_single.clone(),
            top_dir_basenames: request.top_dir_basenames.clone(),
        };
        Ok(Self::new(
            ctx,
            &info.ident,
            info.timestamp,
            TransferDirection::Receive,
            summary,
            Vec::new(),
        ))
    }

    /// The same outgoing offer under another start time, before it was
    /// delivered
    pub fn restamp(&self, start_time: u64) -> Self {
        Self::new(
            self.ctx.clone(),
            &self.remote_id,
            start_time,
            self.direction,
            self.summary.clone(),
            self.entries.clone(),
        )
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn summary(&self) -> &TransferSummary {
        &self.summary
    }

    pub fn status(&self) -> TransferStatus {
        self.state().status
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.state().bytes_transferred
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.state().bytes_per_second
    }

    pub fn errors(&self) -> Vec<String> {
        self.state().errors.clone()
    }

    /// Receiving would replace something already in the download directory
    pub fn overwrite_warning(&self) -> bool {
        self.state().overwrite_warning
    }

    /// Fraction of the announced bytes moved so far
    pub fn progress(&self) -> f64 {
        let state = self.state();
        if self.summary.total_size == 0 {
            return if state.status == TransferStatus::Finished { 1.0 } else { 0.0 };
        }
        state.bytes_transferred as f64 / self.summary.total_size as f64
    }

    /// Estimate from the average speed since the transfer really started
    pub fn remaining_time(&self) -> Option<String> {
        let state = self.state();
        let elapsed = state.real_start?.elapsed().as_secs_f64();
        if elapsed <= 0.0 || state.bytes_transferred == 0 {
            return None;
        }
        let speed = state.bytes_transferred as f64 / elapsed;
        let remaining = self.summary.total_size.saturating_sub(state.bytes_transferred);
        Some(format_remaining(Duration::from_secs_f64(remaining as f64 / speed)))
    }

    /// Correlation info sent with every transfer call
    pub fn op_info(&self) -> OpInfo {
        OpInfo {
            ident: self.ctx.local.id.clone(),
            timestamp: self.start_time,
            readable_name: self.ctx.local.hostname.clone(),
        }
    }

    /// Offer announcing this outgoing transfer
    pub fn offer_request(&self) -> TransferOpRequest {
        TransferOpRequest {
            info: Some(self.op_info()),
            sender_name: self.ctx.local.display_name.clone(),
            receiver_name: String::new(),
            receiver: self.remote_id.clone(),
            size: self.summary.total_size,
            count: self.summary.file_count,
            name_if_single: self.summary.single_name.clone(),
            mime_if_single: self.summary.single_mime.clone(),
            top_dir_basenames: self.summary.top_dir_basenames.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move along the state graph. Returns false, changing nothing, when the
    /// edge doesn't exist.
    fn set_status(&self, next: TransferStatus) -> bool {
        {
            let mut state = self.state();
            if !state.status.can_become(next) {
                trace!(
                    "Transfer {} ignoring {:?} -> {:?}",
                    self.start_time,
                    state.status,
                    next
                );
                return false;
            }
            state.status = next;
            if next == TransferStatus::Transferring {
                let now = Instant::now();
                state.real_start = Some(now);
                state.last_chunk = Some(now);
            }
        }
        self.ctx.events.emit(EngineEvent::TransferStatusChanged {
            remote_id: self.remote_id.clone(),
            start_time: self.start_time,
            status: next,
        });
        true
    }

    fn push_error(&self, message: String) {
        self.state().errors.push(message);
    }

    fn record_progress(&self, bytes: u64) {
        let (transferred, rate) = {
            let mut state = self.state();
            let now = Instant::now();
            let elapsed = state
                .last_chunk
                .map(|last| now.duration_since(last).as_secs_f64())
                .unwrap_or_default();
            state.bytes_transferred += bytes;
            if elapsed > 0.0 {
                state.bytes_per_second = (bytes as f64 / elapsed) as u64;
            }
            state.last_chunk = Some(now);
            (state.bytes_transferred, state.bytes_per_second)
        };
        self.ctx.events.emit(EngineEvent::TransferProgressChanged {
            remote_id: self.remote_id.clone(),
            start_time: self.start_time,
            bytes_transferred: transferred,
            bytes_per_second: rate,
        });
    }

    /// The peer declined the offer, or it was withdrawn before starting
    pub fn make_declined(&self) -> bool {
        let declined = self.set_status(TransferStatus::Declined);
        if declined {
            info!("Transfer {} with {} declined", self.start_time, self.remote_id);
        }
        declined
    }

    /// A stop arrived from either side. `error` turns it into a failure.
    pub async fn on_stopped(&self, error: bool) {
        if self.status().is_terminal() {
            trace!("Transfer {} already ended, ignoring stop", self.start_time);
            return;
        }
        if error {
            self.push_error("Transfer was stopped because of an error".to_string());
            self.set_status(TransferStatus::Failed);
        } else {
            self.set_status(TransferStatus::Stopped);
        }
        match self.direction {
            TransferDirection::Send => self.cancelled.store(true, Ordering::SeqCst),
            TransferDirection::Receive => self.stop_receiving().await,
        }
    }

    /// Fail for a reason outside the data path, e.g. the remote went away
    pub async fn fail(&self, reason: &str) {
        if self.status().is_terminal() {
            return;
        }
        warn!("Transfer {} with {} failed: {}", self.start_time, self.remote_id, reason);
        self.push_error(reason.to_string());
        self.set_status(TransferStatus::Failed);
        self.cancelled.store(true, Ordering::SeqCst);
        if self.direction == TransferDirection::Receive {
            self.stop_receiving().await;
        }
    }

    /* ---------- send ---------- */

    /// Stream every entry into `tx` in order. Returns quietly when cancelled;
    /// read errors fail the transfer and are forwarded to the receiver.
    pub async fn start_sending(&self, tx: mpsc::Sender<Result<FileChunk, Status>>) {
        if !self.set_status(TransferStatus::Transferring) {
            warn!(
                "Transfer {} can't start sending from {:?}",
                self.start_time,
                self.status()
            );
            let _ = tx
                .send(Err(Status::failed_precondition("Transfer is not waiting to start")))
                .await;
            return;
        }
        info!("Sending transfer {} to {}", self.start_time, self.remote_id);

        match self.send_entries(&tx).await {
            Ok(()) if self.cancelled.load(Ordering::SeqCst) => {
                debug!("Transfer {} cancelled while sending", self.start_time);
            }
            Ok(()) => {
                self.set_status(TransferStatus::Finished);
                info!("Transfer {} to {} finished", self.start_time, self.remote_id);
            }
            Err(e) => {
                error!("Sending transfer {} failed: {:#}", self.start_time, e);
                self.push_error(format!("Sending failed: {:#}", e));
                self.set_status(TransferStatus::Failed);
                let _ = tx.send(Err(Status::internal(format!("{:#}", e)))).await;
            }
        }
    }

    async fn send_entries(&self, tx: &mpsc::Sender<Result<FileChunk, Status>>) -> Result<()> {
        let mut buf = vec![0u8; CHUNK_SIZE];

        for entry in &self.entries {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }

            if entry.is_dir {
                let chunk = FileChunk {
                    relative_path: entry.relative_path.clone(),
                    file_type: EntryType::Directory as i32,
                    file_mode: DIRECTORY_MODE,
                    ..Default::default()
                };
                if !self.emit_chunk(tx, chunk).await? {
                    return Ok(());
                }
                continue;
            }

            let mut file = tokio::fs::File::open(&entry.path)
                .await
                .with_context(|| format!("Failed to open {}", entry.path.display()))?;
            let modified = file.metadata().await?.modified().ok();
            let mut time = modified.map(file_time);

            // Even an empty file produces one chunk
            loop {
                let read = read_full(&mut file, &mut buf)
                    .await
                    .with_context(|| format!("Failed to read {}", entry.path.display()))?;
                let chunk = FileChunk {
                    relative_path: entry.relative_path.clone(),
                    file_type: EntryType::File as i32,
                    file_mode: FILE_MODE,
                    chunk: buf[..read].to_vec(),
                    time: time.take(),
                    ..Default::default()
                };
                if !self.emit_chunk(tx, chunk).await? {
                    return Ok(());
                }
                self.record_progress(read as u64);

                if read < CHUNK_SIZE || self.cancelled.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Ok(false) when the stream went away because we were cancelled
    async fn emit_chunk(&self, tx: &mpsc::Sender<Result<FileChunk, Status>>, chunk: FileChunk) -> Result<bool> {
        if tx.send(Ok(chunk)).await.is_ok() {
            return Ok(true);
        }
        if self.cancelled.load(Ordering::SeqCst) {
            Ok(false)
        } else {
            Err(anyhow!("Receiver closed the stream"))
        }
    }

    /* ---------- receive ---------- */

    /// Flag the offer if accepting it would replace existing items
    pub fn prepare_receive(&self) {
        if !self.ctx.settings.allow_overwrite {
            return;
        }
        let download_dir = &self.ctx.settings.download_dir;
        let clash = self
            .summary
            .top_dir_basenames
            .iter()
            .filter_map(|name| sanitize_relative_path(name).ok())
            .any(|rel| download_dir.join(rel).exists());
        self.state().overwrite_warning = clash;
    }

    /// The user (or auto-accept) agreed to receive
    pub fn start_receiving(&self) -> bool {
        let started = self.set_status(TransferStatus::Transferring);
        if started {
            info!("Receiving transfer {} from {}", self.start_time, self.remote_id);
        }
        started
    }

    /// Apply one chunk
    pub async fn receive_chunk(&self, chunk: FileChunk) -> ChunkOutcome {
        if self.status() != TransferStatus::Transferring {
            return ChunkOutcome::Ended;
        }

        let mut rx = self.receiver.lock().await;
        // A stop may have cleaned up while we waited for the lock
        if self.status() != TransferStatus::Transferring {
            return ChunkOutcome::Ended;
        }
        let len = chunk.chunk.len() as u64;
        let applied = if rx.current_relative.as_deref() != Some(chunk.relative_path.as_str()) {
            self.begin_entry(&mut rx, chunk).await
        } else {
            append(&mut rx, &chunk.chunk).await
        };

        match applied {
            Ok(()) => self.record_progress(len),
            Err(e) => {
                error!("Receiving transfer {} failed: {:#}", self.start_time, e);
                if self.fail_receive(&mut rx, format!("{:#}", e)).await {
                    return ChunkOutcome::Failed;
                }
            }
        }

        if self.status() == TransferStatus::Transferring {
            ChunkOutcome::Continue
        } else {
            ChunkOutcome::Ended
        }
    }

    async fn begin_entry(&self, rx: &mut ReceiveState, chunk: FileChunk) -> Result<()> {
        close_current(rx).await?;
        rx.current_relative = Some(chunk.relative_path.clone());
        rx.current_path = None;

        let relative = sanitize_relative_path(&chunk.relative_path)?;
        let target = self.ctx.settings.download_dir.join(relative);

        match EntryType::from_wire(chunk.file_type) {
            Some(EntryType::Directory) => {
                tokio::fs::create_dir_all(&target)
                    .await
                    .with_context(|| format!("Failed to create directory {}", target.display()))?;
                rx.current_path = Some(target);
            }
            Some(EntryType::Symlink) => {
                warn!("Symlinks are not supported, skipping {}", chunk.relative_path);
                self.push_error(format!("Symlinks are not supported: {}", chunk.relative_path));
            }
            None => {
                warn!("Unknown entry type {} for {}", chunk.file_type, chunk.relative_path);
                self.push_error(format!("Unknown entry type for {}", chunk.relative_path));
            }
            Some(EntryType::File) => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create directory {}", parent.display()))?;
                }
                let target = if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    self.resolve_existing(target).await?
                } else {
                    target
                };

                let file = tokio::fs::File::create(&target)
                    .await
                    .with_context(|| format!("Failed to open file for writing {}", target.display()))?;
                rx.current_mtime = chunk.time.as_ref().map(system_time);
                rx.current_path = Some(target);
                rx.file = Some(file);
                append(rx, &chunk.chunk).await?;
            }
        }
        Ok(())
    }

    /// Make room for `path`: delete it, or pick the first free `name (n).ext`
    async fn resolve_existing(&self, path: PathBuf) -> Result<PathBuf> {
        if self.ctx.settings.allow_overwrite {
            trace!("Overwriting {}", path.display());
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to remove existing {}", path.display()))?;
            return Ok(path);
        }

        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let mut n = 2;
        loop {
            let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
            if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                trace!("New path: {}", candidate.display());
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Close the last file once the stream ended
    pub async fn finish_receive(&self) {
        let mut rx = self.receiver.lock().await;
        if let Err(e) = close_current(&mut rx).await {
            self.fail_receive(&mut rx, format!("{:#}", e)).await;
            return;
        }
        drop(rx);

        let next = if self.state().errors.is_empty() {
            TransferStatus::Finished
        } else {
            TransferStatus::FinishedWithErrors
        };
        if self.set_status(next) {
            info!("Transfer {} from {} finished: {:?}", self.start_time, self.remote_id, next);
        }
    }

    /// Returns false when a stop had already ended the transfer
    async fn fail_receive(&self, rx: &mut ReceiveState, message: String) -> bool {
        discard_partial(rx).await;
        // A stop that already arrived keeps its own reason
        if self.status().is_terminal() {
            return false;
        }
        self.push_error(message);
        let failed = self.set_status(TransferStatus::Failed);
        if failed {
            debug!("Receiving transfer {} failed", self.start_time);
        }
        failed
    }

    async fn stop_receiving(&self) {
        trace!("Stopping receiving of {}", self.start_time);
        let mut rx = self.receiver.lock().await;
        discard_partial(&mut rx).await;
    }
}

async fn append(rx: &mut ReceiveState, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    match rx.file.as_mut() {
        Some(file) => file.write_all(data).await.context("Failed to write to file"),
        // Payload for a directory or skipped entry
        None => Ok(()),
    }
}

/// Flush the open file and apply its modification time
async fn close_current(rx: &mut ReceiveState) -> Result<()> {
    let mtime = rx.current_mtime.take();
    let Some(mut file) = rx.file.take() else {
        return Ok(());
    };
    file.flush().await.context("Failed to flush file")?;
    if let Some(mtime) = mtime {
        let file = file.into_std().await;
        if let Err(e) = file.set_modified(mtime) {
            warn!("Failed to set modification time: {}", e);
        }
    }
    Ok(())
}

/// Drop the open file and delete what was written of it
async fn discard_partial(rx: &mut ReceiveState) {
    rx.current_mtime = None;
    if let Some(file) = rx.file.take() {
        drop(file);
        if let Some(path) = rx.current_path.take() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed incomplete {}", path.display()),
                Err(e) => warn!("Could not delete incomplete file {}: {}", path.display(), e),
            }
        }
    }
}

async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Expand the inputs into send order. Directories come before their
/// contents: the directory, then its subdirectories recursively, then its
/// files.
pub fn resolve_files(paths: &[PathBuf]) -> Result<Vec<SendEntry>> {
    let mut entries = Vec::new();
    for path in paths {
        let metadata =
            fs::metadata(path).with_context(|| format!("Cannot send {}: not accessible", path.display()))?;
        let name = base_name(path)?;
        if metadata.is_dir() {
            resolve_directory(path, &name, &mut entries)?;
        } else {
            entries.push(SendEntry {
                path: path.clone(),
                relative_path: name,
                is_dir: false,
                size: metadata.len(),
            });
        }
    }
    Ok(entries)
}

fn resolve_directory(dir: &Path, relative: &str, entries: &mut Vec<SendEntry>) -> Result<()> {
    entries.push(SendEntry {
        path: dir.to_path_buf(),
        relative_path: relative.to_string(),
        is_dir: true,
        size: 0,
    });

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for item in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let item = item?;
        let path = item.path();
        let is_link = item.file_type()?.is_symlink();
        let metadata = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };
        if metadata.is_dir() {
            if is_link {
                warn!("Skipping linked directory {}", path.display());
                continue;
            }
            dirs.push(path);
        } else {
            files.push((path, metadata.len()));
        }
    }
    dirs.sort();
    files.sort();

    for sub in dirs {
        let name = base_name(&sub)?;
        resolve_directory(&sub, &format!("{}/{}", relative, name), entries)?;
    }
    for (path, size) in files {
        let name = base_name(&path)?;
        entries.push(SendEntry {
            relative_path: format!("{}/{}", relative, name),
            path,
            is_dir: false,
            size,
        });
    }
    Ok(())
}

fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))
}

/// Turn a received relative path into one that stays inside the download
/// directory. Characters invalid on common filesystems become `_`.
pub fn sanitize_relative_path(relative: &str) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for part in relative.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(anyhow!("Refusing path outside the download directory: {}", relative)),
            _ => {
                let part: String = part
                    .chars()
                    .map(|c| if c.is_control() || "<>:\"|?*".contains(c) { '_' } else { c })
                    .collect();
                clean.push(part);
            }
        }
    }
    if clean.as_os_str().is_empty() || clean.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(anyhow!("Invalid relative path: {:?}", relative));
    }
    Ok(clean)
}

fn file_time(modified: SystemTime) -> FileTime {
    let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
    FileTime {
        mtime: since_epoch.as_secs(),
        mtime_usec: since_epoch.subsec_micros(),
    }
}

fn system_time(time: &FileTime) -> SystemTime {
    UNIX_EPOCH + Duration::new(time.mtime, time.mtime_usec.min(999_999) * 1000)
}

fn format_remaining(remaining: Duration) -> String {
    let seconds = remaining.as_secs();
    if seconds > 3600 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds > 60 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds > 5 {
        format!("{}s", seconds)
    } else {
        "a few seconds".to_string()
    }
}

/// Milliseconds since the epoch, the start time of a new outgoing transfer
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
