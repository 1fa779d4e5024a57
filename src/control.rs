//! Transport-agnostic control surface.
//!
//! An HTTP/RPC layer (out of scope here) maps its requests onto these
//! calls: extension CRUD and start/stop, thread-state queries, and the
//! main router's lifecycle. The main router restarts through a callback
//! registered at setup, so this module never needs to know how the main
//! configuration was assembled.

use crate::config::Config;
use crate::error::{Result, RouterError};
use crate::extension::{join_with_deadline, ExtensionManager, ExtensionSnapshot, ExtensionState};
use crate::router::{run_router_blocking, RouterHandle};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Join deadline when stopping the main router.
const MAIN_STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Coarse worker state as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Running,
    Stopped,
    Failed,
    Paused,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Answer to a thread-state query.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadStateReport {
    /// "main" or the extension name.
    pub name: String,
    /// Current worker state.
    pub state: ThreadState,
    /// Manager-assigned worker id (0 before the first start).
    pub thread_id: u64,
    /// Attachment identifier of the worker.
    pub attachment: String,
}

/// A running main-router thread.
pub struct MainRouterThread {
    /// Handle of the main router instance.
    pub handle: RouterHandle,
    /// The OS thread driving it; yields the exit code.
    pub thread: std::thread::JoinHandle<i32>,
}

/// Spawn the main router on its own thread.
///
/// The handle exists before the thread runs, so signal handling can be
/// wired to it immediately.
pub fn spawn_main_router(config: Config) -> Result<MainRouterThread> {
    let handle = RouterHandle::new("main");
    let thread_handle = handle.clone();
    let thread = std::thread::Builder::new()
        .name("router-main".to_string())
        .spawn(move || run_router_blocking("main", &config, thread_handle))
        .map_err(|e| RouterError::internal(format!("failed to spawn main router: {}", e)))?;
    Ok(MainRouterThread { handle, thread })
}

type RestartCallback = Box<dyn Fn() -> Result<MainRouterThread> + Send>;

#[derive(Default)]
struct MainSlot {
    current: Option<MainRouterThread>,
    restart: Option<RestartCallback>,
    starts: u64,
}

/// The control surface: extensions plus the main router slot.
pub struct ControlSurface {
    extensions: Arc<ExtensionManager>,
    main: Mutex<MainSlot>,
}

impl ControlSurface {
    /// Build a surface over an extension manager.
    pub fn new(extensions: Arc<ExtensionManager>) -> Self {
        Self {
            extensions,
            main: Mutex::new(MainSlot::default()),
        }
    }

    /// The underlying extension manager.
    pub fn extensions(&self) -> &Arc<ExtensionManager> {
        &self.extensions
    }

    /// Create an extension from a JSON payload.
    pub fn create_extension(&self, payload: &[u8]) -> Result<ExtensionSnapshot> {
        self.extensions.create_from_json(payload)
    }

    /// Delete an extension: stop it, drop its persisted record.
    pub fn delete_extension(&self, name: &str) -> Result<()> {
        self.extensions.delete(name)
    }

    /// Start a stopped extension.
    pub fn start_extension(&self, name: &str) -> Result<()> {
        self.extensions.start(name)
    }

    /// Stop a running extension cooperatively.
    pub fn stop_extension(&self, name: &str) -> Result<()> {
        self.extensions.stop(name)
    }

    /// Snapshot one extension.
    pub fn get_extension(&self, name: &str) -> Result<ExtensionSnapshot> {
        self.extensions.get(name)
    }

    /// Snapshot every extension.
    pub fn list_extensions(&self) -> Vec<ExtensionSnapshot> {
        self.extensions.list()
    }

    /// Register how to (re)create the main router thread.
    pub fn register_main_restart<F>(&self, callback: F)
    where
        F: Fn() -> Result<MainRouterThread> + Send + 'static,
    {
        self.main.lock().restart = Some(Box::new(callback));
    }

    /// Start the main router via the registered restart callback.
    /// Idempotent while the current thread is alive.
    pub fn start_main_router(&self) -> Result<()> {
        let mut main = self.main.lock();
        if let Some(current) = &main.current {
            if !current.thread.is_finished() {
                info!("main router already running");
                return Ok(());
            }
        }

        let restart = main
            .restart
            .as_ref()
            .ok_or_else(|| RouterError::internal("no main-router restart callback registered"))?;
        let started = restart()?;
        main.current = Some(started);
        main.starts += 1;
        info!("main router started");
        Ok(())
    }

    /// Stop the main router cooperatively; returns its exit code.
    pub fn stop_main_router(&self) -> Result<i32> {
        let current = {
            let mut main = self.main.lock();
            main.current
                .take()
                .ok_or_else(|| RouterError::AlreadyStopped("main".to_string()))?
        };

        current.handle.request_exit(0);
        match join_with_deadline(current.thread, MAIN_STOP_DEADLINE) {
            Some(code) => {
                info!(code, "main router stopped");
                Ok(code)
            }
            None => {
                warn!("main router outlived its stop deadline");
                Err(RouterError::StopTimeout("main".to_string()))
            }
        }
    }

    /// Handle of the live main router, for signal wiring.
    pub fn main_handle(&self) -> Option<RouterHandle> {
        self.main
            .lock()
            .current
            .as_ref()
            .map(|current| current.handle.clone())
    }

    /// Worker state of "main" or an extension.
    pub fn get_thread_state(&self, name: &str) -> Result<ThreadStateReport> {
        if name == "main" {
            let main = self.main.lock();
            let state = match &main.current {
                Some(current) if !current.thread.is_finished() => ThreadState::Running,
                _ => ThreadState::Stopped,
            };
            return Ok(ThreadStateReport {
                name: "main".to_string(),
                state,
                thread_id: main.starts,
                attachment: "mainloop".to_string(),
            });
        }

        let snapshot = self.extensions.get(name)?;
        let state = match snapshot.state {
            ExtensionState::Starting | ExtensionState::Running | ExtensionState::Stopping => {
                ThreadState::Running
            }
            ExtensionState::Stopped => ThreadState::Stopped,
            ExtensionState::Failed => ThreadState::Failed,
        };
        Ok(ThreadStateReport {
            name: snapshot.name.clone(),
            state,
            thread_id: snapshot.thread_id,
            attachment: format!("extension_{}", snapshot.name),
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn surface() -> ControlSurface {
        let manager = ExtensionManager::new(Config::default(), "unused");
        ControlSurface::new(manager)
    }

    #[test]
    fn test_start_without_callback_fails() {
        let surface = surface();
        assert!(surface.start_main_router().is_err());
    }

    #[test]
    fn test_stop_without_start_is_already_stopped() {
        let surface = surface();
        match surface.stop_main_router() {
            Err(RouterError::AlreadyStopped(name)) => assert_eq!(name, "main"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_main_lifecycle_with_empty_config() {
        let surface = surface();
        surface.register_main_restart(|| spawn_main_router(Config::default()));

        surface.start_main_router().expect("start");
        // Idempotent while running.
        surface.start_main_router().expect("second start is a no-op");
        assert!(surface.main_handle().is_some());

        let report = surface.get_thread_state("main").expect("state");
        assert_eq!(report.state, ThreadState::Running);

        let code = surface.stop_main_router().expect("stop");
        assert_eq!(code, 0);

        // Second stop reports already stopped.
        assert!(matches!(
            surface.stop_main_router(),
            Err(RouterError::AlreadyStopped(_))
        ));

        // And a restart works.
        surface.start_main_router().expect("restart");
        surface.stop_main_router().expect("stop again");
    }

    #[test]
    fn test_unknown_thread_state_not_found() {
        let surface = surface();
        assert!(matches!(
            surface.get_thread_state("ghost"),
            Err(RouterError::NotFound(_))
        ));
    }
}
