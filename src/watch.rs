//! Directory watch bindings.
//!
//! One non-recursive binding per watched directory: the watch root, plus one
//! per work-item directory. Bindings only report *directory* creation
//! (including renames into the watched directory); files are picked up by the
//! worker's scan. Each notification is delayed by a short debounce so the
//! producer can finish populating the new directory.
//!
//! A binding whose backend reports an error turns inert: it stays registered
//! but drops every later notification until the path is bound again. A binding
//! whose directory is deleted or moved away is removed.

use crate::error::{MonitorError, Result};
use crate::metrics;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What a binding watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRole {
    /// The watch root; new children are work items
    Root,
    /// A work-item directory; new children are candidate stations
    WorkItem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// Subdirectory created under the watch root
    WorkItemCreated { path: PathBuf },
    /// Subdirectory created under a work-item directory
    StationDirCreated { work_item: PathBuf, path: PathBuf },
    /// The binding on `path` failed and is now inert
    BindingFailed { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchHandle {
    id: u64,
    path: PathBuf,
}

impl WatchHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchBackend {
    /// OS notification facility (inotify, FSEvents, ReadDirectoryChangesW)
    Native,
    /// Periodic directory scans, for network shares without native events
    Poll,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub debounce: Duration,
    pub backend: WatchBackend,
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            backend: WatchBackend::Native,
            poll_interval: Duration::from_millis(2000),
        }
    }
}

/// Source of directory-creation events.
///
/// Binding a path that is already bound replaces the old binding.
pub trait DirectoryChangeSource: Send + Sync {
    fn bind(&self, path: &Path, role: BindingRole) -> Result<WatchHandle>;

    /// Returns false if `handle` no longer refers to the live binding for its path.
    fn unbind(&self, handle: &WatchHandle) -> bool;

    fn unbind_all(&self);

    fn active_bindings(&self) -> usize;
}

struct Binding {
    id: u64,
    role: BindingRole,
    inert: Arc<AtomicBool>,
}

type SharedWatcher = Arc<Mutex<Option<Box<dyn Watcher + Send>>>>;

/// Binding registry backed by the `notify` crate.
///
/// Every binding shares one backend watcher (one inotify instance on Linux);
/// events are routed to their binding by the parent directory of the event
/// path. Lock order is watcher before registry, and the notify callback only
/// ever takes the registry.
pub struct NotifyChangeSource {
    options: WatchOptions,
    router: Arc<EventRouter>,
    watcher: SharedWatcher,
    next_id: AtomicU64,
}

impl NotifyChangeSource {
    /// Must be called from within a tokio runtime; debounced deliveries are
    /// scheduled on it.
    pub fn new(options: WatchOptions, events: mpsc::UnboundedSender<DirectoryEvent>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| MonitorError::Internal(format!("No tokio runtime for watch bindings: {}", e)))?;

        let watcher: SharedWatcher = Arc::new(Mutex::new(None));
        let router = Arc::new(EventRouter {
            debounce: options.debounce,
            events,
            runtime,
            bindings: Arc::new(Mutex::new(HashMap::new())),
            watcher: Arc::downgrade(&watcher),
        });

        let backend = build_watcher(&options, router.clone()).map_err(|e| MonitorError::Watch {
            path: PathBuf::new(),
            reason: format!("Failed to start {:?} watcher: {}", options.backend, e),
        })?;
        *lock(&watcher) = Some(backend);

        Ok(Self {
            options,
            router,
            watcher,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn options(&self) -> WatchOptions {
        self.options
    }

    /// Whether `path` has a live (registered and not failed) binding
    pub fn is_bound(&self, path: &Path) -> bool {
        self.router
            .registry()
            .get(path)
            .is_some_and(|b| !b.inert.load(Ordering::Acquire))
    }
}

fn build_watcher(
    options: &WatchOptions,
    router: Arc<EventRouter>,
) -> notify::Result<Box<dyn Watcher + Send>> {
    let handler = move |result: notify::Result<Event>| router.dispatch(result);

    Ok(match options.backend {
        WatchBackend::Native => Box::new(notify::recommended_watcher(handler)?),
        WatchBackend::Poll => Box::new(notify::PollWatcher::new(
            handler,
            notify::Config::default().with_poll_interval(options.poll_interval),
        )?),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DirectoryChangeSource for NotifyChangeSource {
    fn bind(&self, path: &Path, role: BindingRole) -> Result<WatchHandle> {
        // The polling backend accepts missing paths silently
        if !path.is_dir() {
            return Err(MonitorError::Watch {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let mut watcher = lock(&self.watcher);
        let Some(backend) = watcher.as_mut() else {
            return Err(MonitorError::Watch {
                path: path.to_path_buf(),
                reason: "watcher is shut down".to_string(),
            });
        };

        // Re-watching a watched path is a no-op for the backend; the old
        // binding is replaced below so only one binding routes for the path
        backend
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| MonitorError::Watch {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.router.registry();
        if let Some(old) = registry.remove(path) {
            old.inert.store(true, Ordering::Release);
            debug!(path = %path.display(), id = old.id, "Replacing existing watch binding");
        }
        registry.insert(
            path.to_path_buf(),
            Binding {
                id,
                role,
                inert: Arc::new(AtomicBool::new(false)),
            },
        );
        metrics::WATCH_BINDINGS.set(registry.len() as i64);
        info!(path = %path.display(), ?role, id, "Watch binding created");

        Ok(WatchHandle {
            id,
            path: path.to_path_buf(),
        })
    }

    fn unbind(&self, handle: &WatchHandle) -> bool {
        let mut watcher = lock(&self.watcher);
        let mut registry = self.router.registry();
        let live = registry
            .get(&handle.path)
            .is_some_and(|binding| binding.id == handle.id);
        if !live {
            return false;
        }

        if let Some(binding) = registry.remove(&handle.path) {
            binding.inert.store(true, Ordering::Release);
        }
        metrics::WATCH_BINDINGS.set(registry.len() as i64);
        drop(registry);

        if let Some(backend) = watcher.as_mut() {
            if let Err(e) = backend.unwatch(&handle.path) {
                debug!(path = %handle.path.display(), error = %e, "Backend unwatch failed");
            }
        }
        debug!(path = %handle.path.display(), id = handle.id, "Watch binding removed");
        true
    }

    fn unbind_all(&self) {
        let mut watcher = lock(&self.watcher);
        let paths: Vec<PathBuf> = {
            let mut registry = self.router.registry();
            registry
                .drain()
                .map(|(path, binding)| {
                    binding.inert.store(true, Ordering::Release);
                    path
                })
                .collect()
        };
        metrics::WATCH_BINDINGS.set(0);

        if let Some(backend) = watcher.as_mut() {
            for path in &paths {
                let _ = backend.unwatch(path);
            }
        }
    }

    fn active_bindings(&self) -> usize {
        self.router.registry().len()
    }
}

impl Drop for NotifyChangeSource {
    fn drop(&mut self) {
        self.unbind_all();
        lock(&self.watcher).take();
    }
}

/// Shared callback state; lives inside the notify handler.
struct EventRouter {
    debounce: Duration,
    events: mpsc::UnboundedSender<DirectoryEvent>,
    runtime: Handle,
    bindings: Arc<Mutex<HashMap<PathBuf, Binding>>>,
    // Weak: the watcher owns the handler that owns this router
    watcher: Weak<Mutex<Option<Box<dyn Watcher + Send>>>>,
}

impl EventRouter {
    fn registry(&self) -> MutexGuard<'_, HashMap<PathBuf, Binding>> {
        lock(&self.bindings)
    }

    fn dispatch(&self, result: notify::Result<Event>) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        for path in removed_paths(&event) {
            self.retire(&path);
        }
        for path in created_paths(event) {
            self.schedule(path);
        }
    }

    fn fail(&self, error: notify::Error) {
        metrics::WATCH_ERRORS.inc();
        if error.paths.is_empty() {
            warn!(error = %error, "Watch backend error");
            return;
        }

        let watch_gone = matches!(error.kind, notify::ErrorKind::WatchNotFound);
        let reason = error.to_string();
        for path in &error.paths {
            if watch_gone || !path.exists() {
                self.retire(path);
                continue;
            }

            let newly_failed = self
                .registry()
                .get(path)
                .is_some_and(|binding| !binding.inert.swap(true, Ordering::AcqRel));
            // Only the first error is reported; the binding is inert afterwards
            if newly_failed {
                warn!(path = %path.display(), error = %reason, "Watch binding failed, now inert");
                let _ = self.events.send(DirectoryEvent::BindingFailed {
                    path: path.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Drop the binding of a directory that was deleted or moved away.
    fn retire(&self, path: &Path) {
        let removed = {
            let mut registry = self.registry();
            let removed = registry.remove(path);
            if let Some(binding) = &removed {
                binding.inert.store(true, Ordering::Release);
                metrics::WATCH_BINDINGS.set(registry.len() as i64);
            }
            removed
        };
        let Some(binding) = removed else {
            return;
        };
        info!(path = %path.display(), id = binding.id, "Watched directory went away, binding removed");

        // Unwatching from inside the callback would wait on the backend's own
        // event thread
        let Some(watcher) = self.watcher.upgrade() else {
            return;
        };
        let path = path.to_path_buf();
        let bindings = self.bindings.clone();
        self.runtime.spawn_blocking(move || {
            let mut watcher = lock(&watcher);
            if lock(&bindings).contains_key(&path) {
                // Rebound meanwhile
                return;
            }
            if let Some(backend) = watcher.as_mut() {
                let _ = backend.unwatch(&path);
            }
        });
    }

    fn schedule(&self, path: PathBuf) {
        let Some(parent) = path.parent() else {
            return;
        };
        let (watched, role, inert) = {
            let registry = self.registry();
            match registry.get(parent) {
                Some(binding) if !binding.inert.load(Ordering::Acquire) => {
                    (parent.to_path_buf(), binding.role, binding.inert.clone())
                }
                _ => return,
            }
        };
        let debounce = self.debounce;
        let events = self.events.clone();

        self.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;

            if inert.load(Ordering::Acquire) {
                return;
            }
            let is_dir = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !is_dir {
                return;
            }

            let event = match role {
                BindingRole::Root => DirectoryEvent::WorkItemCreated { path },
                BindingRole::WorkItem => DirectoryEvent::StationDirCreated {
                    work_item: watched,
                    path,
                },
            };
            if events.send(event).is_err() {
                debug!("Directory event dropped because the session is gone");
            }
        });
    }
}

/// Paths that may be newly created entries of a watched directory.
fn created_paths(event: Event) -> Vec<PathBuf> {
    let Event { kind, mut paths, .. } = event;
    match kind {
        EventKind::Create(_) => paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // [from, to]
            if paths.len() >= 2 {
                vec![paths.swap_remove(1)]
            } else {
                Vec::new()
            }
        }
        // Backends that cannot tell rename direction; existence is checked later
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => paths,
        _ => Vec::new(),
    }
}

/// Paths that no longer exist where they were watched.
fn removed_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.clone()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.first().cloned().into_iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().filter(|p| !p.exists()).cloned().collect()
        }
        _ => Vec::new(),
    }
}
