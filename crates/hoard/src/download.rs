use crate::cache::DiskCache;
use crate::config::HoardConfig;
use crate::events::{lock, Listeners};
use crate::http::{get_following_redirects, HttpTransport};
use futures::channel::mpsc;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use packrat_core::{AssetIdentity, DownloadEvent, DownloadFailure};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const READ_BUFFER: usize = 64 * 1024;
const PROGRESS_STEP: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_redirects: u8,
    pub max_body_bytes: u64,
}

impl From<&HoardConfig> for DownloadSettings {
    fn from(config: &HoardConfig) -> Self {
        Self {
            concurrency: config.http_concurrency.max(1),
            timeout: config.http_timeout,
            max_redirects: config.max_redirects,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

/// One queued or running download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Dedup key: the identity key for cache writes, the destination path otherwise.
    pub key: String,
    pub identity: Option<AssetIdentity>,
    pub url: String,
    pub destination: PathBuf,
    /// Lower is more urgent.
    pub priority: i32,
    /// Cache writes are registered with the [`DiskCache`]; override destinations are not.
    pub into_cache: bool,
    seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
}

#[derive(Default)]
struct QueueState {
    queued: Vec<DownloadRequest>,
    active: HashMap<String, DownloadProgress>,
    /// Failures are sticky for the process lifetime until explicitly cleared.
    failed: HashMap<String, DownloadFailure>,
    /// Fast path before touching the disk.
    completed: HashMap<String, PathBuf>,
    next_seq: u64,
}

impl QueueState {
    fn sort(&mut self) {
        self.queued.sort_by_key(|r| (r.priority, r.seq));
    }
}

struct Inner {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<DiskCache>,
    settings: DownloadSettings,
    state: Mutex<QueueState>,
    listeners: Listeners<DownloadEvent>,
}

/// Priority queue of HTTP downloads with bounded concurrency.
///
/// Outcomes are published as [`DownloadEvent`]s, never returned from `request`,
/// so callers see the same flow for instant hits and real transfers.
#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<Inner>,
}

impl DownloadQueue {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cache: Arc<DiskCache>,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                cache,
                settings,
                state: Mutex::new(QueueState::default()),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        self.inner.listeners.subscribe()
    }

    /// Downloads `url` for `identity`. Without `destination` the file lands in the
    /// cache and is registered there; with one it is written to that path only.
    pub fn request(
        &self,
        identity: &AssetIdentity,
        url: &str,
        priority: i32,
        destination: Option<PathBuf>,
    ) {
        let request = match destination {
            Some(destination) => DownloadRequest {
                key: path_key(&destination),
                identity: Some(identity.clone()),
                url: url.to_string(),
                destination,
                priority,
                into_cache: false,
                seq: 0,
            },
            None => DownloadRequest {
                key: identity.key(),
                identity: Some(identity.clone()),
                url: url.to_string(),
                destination: self.inner.cache.path_for(identity),
                priority,
                into_cache: true,
                seq: 0,
            },
        };
        self.enqueue(request);
    }

    /// Downloads `url` to an arbitrary path with no asset identity (bundle installs).
    pub fn request_file(&self, url: &str, destination: PathBuf, priority: i32) {
        self.enqueue(DownloadRequest {
            key: path_key(&destination),
            identity: None,
            url: url.to_string(),
            destination,
            priority,
            into_cache: false,
            seq: 0,
        });
    }

    /// The dedup key a cache download of `identity` uses in events.
    pub fn key_for(identity: &AssetIdentity) -> String {
        identity.key()
    }

    /// Dedup key of a download to an explicit destination.
    pub fn key_for_path(destination: &Path) -> String {
        path_key(destination)
    }

    pub fn failure(&self, key: &str) -> Option<DownloadFailure> {
        lock(&self.inner.state).failed.get(key).cloned()
    }

    /// Forgets a recorded failure so the next request retries.
    pub fn clear_failure(&self, key: &str) -> bool {
        lock(&self.inner.state).failed.remove(key).is_some()
    }

    pub fn clear_failures(&self) {
        lock(&self.inner.state).failed.clear();
    }

    pub fn is_pending(&self, key: &str) -> bool {
        let state = lock(&self.inner.state);
        state.active.contains_key(key) || state.queued.iter().any(|r| r.key == key)
    }

    pub fn progress(&self, key: &str) -> Option<DownloadProgress> {
        lock(&self.inner.state).active.get(key).copied()
    }

    pub fn queued_len(&self) -> usize {
        lock(&self.inner.state).queued.len()
    }

    pub fn active_len(&self) -> usize {
        lock(&self.inner.state).active.len()
    }

    fn enqueue(&self, mut request: DownloadRequest) {
        let event = {
            let mut state = lock(&self.inner.state);

            if let Some(path) = self.already_present(&mut state, &request) {
                Some(DownloadEvent::Completed {
                    key: request.key.clone(),
                    identity: request.identity.clone(),
                    path,
                })
            } else if state.active.contains_key(&request.key) {
                None
            } else if let Some(queued) = state.queued.iter_mut().find(|r| r.key == request.key) {
                if request.priority < queued.priority {
                    queued.priority = request.priority;
                    state.sort();
                }
                None
            } else if let Some(failure) = state.failed.get(&request.key) {
                Some(DownloadEvent::Failed {
                    key: request.key.clone(),
                    identity: request.identity.clone(),
                    failure: failure.clone(),
                })
            } else {
                request.seq = state.next_seq;
                state.next_seq += 1;
                log::debug!("Queued {} (priority {})", request.url, request.priority);
                state.queued.push(request);
                state.sort();
                None
            }
        };

        if let Some(event) = event {
            self.inner.listeners.emit(event);
        }
        self.pump();
    }

    fn already_present(
        &self,
        state: &mut QueueState,
        request: &DownloadRequest,
    ) -> Option<PathBuf> {
        if let Some(path) = state.completed.get(&request.key) {
            if path.is_file() {
                return Some(path.clone());
            }
            state.completed.remove(&request.key);
        }
        if !request.destination.is_file() {
            return None;
        }
        if request.into_cache {
            let identity = request.identity.as_ref()?;
            if self.inner.cache.get(identity).is_none() {
                if let Err(e) = self
                    .inner
                    .cache
                    .register_existing(identity, &request.destination)
                {
                    log::warn!("Could not index existing {:?}: {}", request.destination, e);
                    return None;
                }
            }
        }
        state
            .completed
            .insert(request.key.clone(), request.destination.clone());
        Some(request.destination.clone())
    }

    fn pump(&self) {
        let started = {
            let mut state = lock(&self.inner.state);
            let mut started = Vec::new();
            while state.active.len() < self.inner.settings.concurrency && !state.queued.is_empty() {
                let request = state.queued.remove(0);
                state
                    .active
                    .insert(request.key.clone(), DownloadProgress::default());
                started.push(request);
            }
            started
        };

        for request in started {
            let queue = self.clone();
            async_std::task::spawn(async move { queue.run(request).await });
        }
    }

    async fn run(self, request: DownloadRequest) {
        log::info!("Downloading {} -> {:?}", request.url, request.destination);
        let result = self.fetch(&request).await;

        let event = {
            let mut state = lock(&self.inner.state);
            state.active.remove(&request.key);
            match result {
                Ok(path) => {
                    log::info!("Download complete: {:?}", path);
                    state.completed.insert(request.key.clone(), path.clone());
                    DownloadEvent::Completed {
                        key: request.key.clone(),
                        identity: request.identity.clone(),
                        path,
                    }
                }
                Err(failure) => {
                    log::warn!("Download of {} failed: {}", request.url, failure);
                    remove_quietly(&part_path(&request.destination));
                    state.failed.insert(request.key.clone(), failure.clone());
                    DownloadEvent::Failed {
                        key: request.key.clone(),
                        identity: request.identity.clone(),
                        failure,
                    }
                }
            }
        };

        self.inner.listeners.emit(event);
        self.pump();
    }

    async fn fetch(&self, request: &DownloadRequest) -> Result<PathBuf, DownloadFailure> {
        let settings = &self.inner.settings;
        let (final_url, response) = get_following_redirects(
            self.inner.transport.as_ref(),
            &request.url,
            settings.max_redirects,
            settings.timeout,
        )
        .await?;
        if final_url != request.url {
            log::debug!("{} resolved to {}", request.url, final_url);
        }

        if !response.is_success() {
            return Err(DownloadFailure::HttpStatus(response.status));
        }
        let total = response.content_length;
        if total.is_some_and(|len| len > settings.max_body_bytes) {
            return Err(DownloadFailure::BodyTooLarge);
        }

        if let Some(parent) = request.destination.parent() {
            async_std::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadFailure::FileWriteError(e.to_string()))?;
        }
        let part = part_path(&request.destination);
        let mut file = async_std::fs::File::create(&part)
            .await
            .map_err(|e| DownloadFailure::FileWriteError(e.to_string()))?;

        let mut body = response.body;
        let mut buffer = vec![0u8; READ_BUFFER];
        let mut downloaded = 0u64;
        let mut last_reported = None;
        loop {
            let n = async_std::future::timeout(settings.timeout, body.read(&mut buffer))
                .await
                .map_err(|_| DownloadFailure::Timeout)?
                .map_err(|e| DownloadFailure::classify(&e.to_string()))?;
            if n == 0 {
                break;
            }
            downloaded += n as u64;
            if downloaded > settings.max_body_bytes {
                return Err(DownloadFailure::BodyTooLarge);
            }
            file.write_all(&buffer[..n])
                .await
                .map_err(|e| DownloadFailure::FileWriteError(e.to_string()))?;
            self.report_progress(request, downloaded, total, &mut last_reported);
        }
        file.flush()
            .await
            .map_err(|e| DownloadFailure::FileWriteError(e.to_string()))?;
        drop(file);

        async_std::fs::rename(&part, &request.destination)
            .await
            .map_err(|e| DownloadFailure::FileWriteError(e.to_string()))?;
        if !request.destination.is_file() {
            return Err(DownloadFailure::FileWriteError(
                "transfer reported success but no file was written".to_string(),
            ));
        }

        if request.into_cache {
            if let Some(identity) = &request.identity {
                self.inner
                    .cache
                    .register_existing(identity, &request.destination)
                    .map_err(|e| DownloadFailure::FileWriteError(e.to_string()))?;
            }
        }
        Ok(request.destination.clone())
    }

    fn report_progress(
        &self,
        request: &DownloadRequest,
        downloaded: u64,
        total: Option<u64>,
        last_reported: &mut Option<f64>,
    ) {
        if let Some(progress) = lock(&self.inner.state).active.get_mut(&request.key) {
            progress.bytes_downloaded = downloaded;
            progress.total_bytes = total;
        }
        if !should_report(downloaded, total, last_reported) {
            return;
        }
        self.inner.listeners.emit(DownloadEvent::Progress {
            key: request.key.clone(),
            identity: request.identity.clone(),
            downloaded,
            total,
        });
    }
}

/// Progress is published on every >5% step, on completion, or always when the
/// total is unknown.
fn should_report(downloaded: u64, total: Option<u64>, last_reported: &mut Option<f64>) -> bool {
    let Some(total) = total.filter(|t| *t > 0) else {
        return true;
    };
    let fraction = (downloaded as f64 / total as f64).min(1.0);
    let due = match *last_reported {
        None => true,
        Some(last) => fraction - last > PROGRESS_STEP || (fraction >= 1.0 && last < 1.0),
    };
    if due {
        *last_reported = Some(fraction);
    }
    due
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn part_path(destination: &Path) -> PathBuf {
    let mut part = destination.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Could not remove partial download {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_throttled_to_five_percent_steps() {
        let mut last = None;
        let reported: Vec<u64> = (1..=100)
            .filter(|done| should_report(*done, Some(100), &mut last))
            .collect();
        assert_eq!(reported.first(), Some(&1));
        assert_eq!(reported.last(), Some(&100));
        assert!(reported.len() < 25, "too many reports: {:?}", reported);
        for pair in reported.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            assert!(b - a >= 5 || b == 100, "step {} -> {} too small", a, b);
        }
    }

    #[test]
    fn unknown_total_always_reports() {
        let mut last = None;
        assert!(should_report(10, None, &mut last));
        assert!(should_report(11, None, &mut last));
        assert!(should_report(12, Some(0), &mut last));
    }

    #[test]
    fn partial_files_sit_next_to_the_destination() {
        assert_eq!(
            part_path(Path::new("/cache/pokemon/models/025/default.glb")),
            PathBuf::from("/cache/pokemon/models/025/default.glb.part")
        );
    }
}
