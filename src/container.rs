//! Containers: routed, independently-threaded request handlers.
//!
//! A container wraps one handler — loaded from a plugin library or
//! supplied in-process — and owns a dedicated worker thread that drains a
//! [`SyncQueue`] of `(request, response)` pairs. One container therefore
//! never runs two `serve` calls concurrently; distinct containers run
//! concurrently with each other and with the reactor.
//!
//! # Plugin ABI
//!
//! A plugin cdylib exports a single `#[no_mangle] pub static PLUGIN_DECL:
//! PluginDecl`. The host refuses the library unless its `abi_version`
//! equals [`ABI_VERSION`] exactly — there is no cross-version
//! compatibility, because the declaration carries plain Rust function
//! pointers and trait objects. `register` runs first and declares the
//! plugin's configuration options; `create` builds the handler. The
//! remaining lifecycle lives on the [`Handler`] itself: `setup` once on
//! the worker before serving, `teardown` after the last serve, and drop
//! in place of an explicit destroy. The library handle is closed only
//! after the handler is gone.

pub mod queue;

pub use queue::SyncQueue;

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use libloading::Library;
use tracing::{debug, error};

use crate::config::Config;
use crate::errors::{ConfigError, ContainerError};
use crate::http::request::Request;
use crate::http::response::Response;

/// The plugin interface version this host was compiled against.
pub const ABI_VERSION: u32 = 1;

/// The handler capability interface every container runs.
///
/// All three methods execute on the container's worker thread. A `serve`
/// implementation must write a complete response — status line, headers,
/// end-of-headers, any body, end-of-body — before returning. Returning
/// an error from any method is fatal to the worker.
pub trait Handler: Send {
    fn setup(&mut self, _config: &Config) -> Result<(), ContainerError> {
        Ok(())
    }

    fn serve(&mut self, request: &Request, response: &Response) -> Result<(), ContainerError>;

    fn teardown(&mut self) -> Result<(), ContainerError> {
        Ok(())
    }
}

/// The declaration a plugin library exports as `PLUGIN_DECL`.
pub struct PluginDecl {
    /// Must equal the host's [`ABI_VERSION`] exactly.
    pub abi_version: u32,
    /// Declares the plugin's configuration options; runs before `create`.
    pub register: fn(&mut Config) -> Result<(), ConfigError>,
    /// Builds the plugin's handler from the loaded configuration.
    pub create: fn(&Config) -> Result<Box<dyn Handler>, ContainerError>,
}

/// Work item carried by a container's queue. `Shutdown` is the sentinel
/// that unblocks and stops the worker.
pub enum QueueItem {
    Serve(Arc<Request>, Arc<Response>),
    Shutdown,
}

/// One routed handler with its queue and worker thread.
///
/// Field order matters: the library handle is declared last so the
/// handler (which may reference plugin code) is destroyed first.
pub struct Container {
    name: String,
    queue: Arc<SyncQueue<QueueItem>>,
    worker: Mutex<Option<JoinHandle<i32>>>,
    parked: Mutex<Option<Box<dyn Handler>>>,
    exit_code: AtomicI32,
    _library: Option<Library>,
}

impl Container {
    /// Loads a plugin library and builds a container around its handler.
    ///
    /// Construction is transactional: any failure after the library is
    /// mapped unwinds everything built so far and closes the library.
    pub fn load(
        name: &str,
        path: &str,
        config: &mut Config,
    ) -> Result<Arc<Self>, ContainerError> {
        let library = unsafe { Library::new(path) }.map_err(|source| ContainerError::Load {
            path: path.to_string(),
            source,
        })?;
        let decl_ptr = unsafe {
            library
                .get::<*const PluginDecl>(b"PLUGIN_DECL\0")
                .map(|symbol| *symbol)
                .map_err(|source| ContainerError::MissingDecl {
                    path: path.to_string(),
                    source,
                })
        }?;
        // The declaration is static data inside the mapped library, which
        // the container keeps open for its whole life.
        let decl = unsafe { &*decl_ptr };
        Self::from_decl(name, decl, config, Some(library))
    }

    /// Builds a container from an already-resolved declaration. The ABI
    /// check runs before any plugin code: a mismatch means zero calls
    /// into `register` or `create`.
    pub fn from_decl(
        name: &str,
        decl: &PluginDecl,
        config: &mut Config,
        library: Option<Library>,
    ) -> Result<Arc<Self>, ContainerError> {
        if decl.abi_version != ABI_VERSION {
            return Err(ContainerError::AbiMismatch {
                expected: ABI_VERSION,
                found: decl.abi_version,
            });
        }
        (decl.register)(config).map_err(|e| ContainerError::Plugin(e.to_string()))?;
        let handler = (decl.create)(config)?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            queue: Arc::new(SyncQueue::new()),
            worker: Mutex::new(None),
            parked: Mutex::new(Some(handler)),
            exit_code: AtomicI32::new(0),
            _library: library,
        }))
    }

    /// In-process variant: caller-supplied handler, no library handle.
    /// Used for the router's null container, built-ins, and tests.
    pub fn custom(name: &str, handler: Box<dyn Handler>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            queue: Arc::new(SyncQueue::new()),
            worker: Mutex::new(None),
            parked: Mutex::new(Some(handler)),
            exit_code: AtomicI32::new(0),
            _library: None,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the dedicated worker thread. Process signals are blocked
    /// for the duration of the spawn so the new thread never receives
    /// process-directed signals meant for the reactor.
    pub fn run(&self, config: Arc<Config>) -> Result<(), ContainerError> {
        let handler = self
            .parked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ContainerError::AlreadyRunning)?;

        let queue = self.queue.clone();
        let name = self.name.clone();

        let mask = SignalMask::block_all()?;
        let join = thread::Builder::new()
            .name(format!("container-{}", self.name))
            .spawn(move || worker_main(name, handler, queue, config))?;
        drop(mask);

        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(join);
        Ok(())
    }

    /// Enqueues one request/response pair. Never blocks; called from the
    /// reactor thread.
    pub fn serve(&self, request: Arc<Request>, response: Arc<Response>) {
        self.queue.push(QueueItem::Serve(request, response));
    }

    /// Pushes the shutdown sentinel, joins the worker, and returns its
    /// exit status. In-flight work completes first; idempotent.
    pub fn shutdown(&self) -> i32 {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            self.queue.push(QueueItem::Shutdown);
            match handle.join() {
                Ok(code) => self.exit_code.store(code, Ordering::Relaxed),
                Err(_) => {
                    error!("container {}: worker panicked", self.name);
                    self.exit_code.store(-1, Ordering::Relaxed);
                }
            }
        }
        self.exit_code.load(Ordering::Relaxed)
    }

    /// Exit status of the worker's last run; zero before any run.
    pub fn last_exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Relaxed)
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(
    name: String,
    mut handler: Box<dyn Handler>,
    queue: Arc<SyncQueue<QueueItem>>,
    config: Arc<Config>,
) -> i32 {
    debug!("container {name}: worker starting");

    if let Err(e) = handler.setup(&config) {
        error!("container {name}: setup failed: {e}");
        return 1;
    }

    loop {
        match queue.pop() {
            Some(QueueItem::Serve(request, response)) => {
                if let Err(e) = handler.serve(&request, &response) {
                    error!("container {name}: serve failed: {e}");
                    return 2;
                }
            }
            Some(QueueItem::Shutdown) | None => break,
        }
    }

    if let Err(e) = handler.teardown() {
        error!("container {name}: teardown failed: {e}");
        return 3;
    }
    debug!("container {name}: worker exiting");
    0
}

/// Blocks every signal for the current thread, restoring the previous
/// mask on drop. Threads spawned while the guard lives inherit the full
/// block, keeping process-directed signals on the reactor thread.
struct SignalMask {
    old: libc::sigset_t,
}

impl SignalMask {
    fn block_all() -> io::Result<Self> {
        unsafe {
            let mut all: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut all);
            let mut old: libc::sigset_t = std::mem::zeroed();
            if libc::pthread_sigmask(libc::SIG_SETMASK, &all, &mut old) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { old })
        }
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parser::Parser;
    use crate::limits::ReqLimits;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn request_for(url: &str) -> Arc<Request> {
        let mut parser = Parser::new(ReqLimits::default());
        parser
            .append_data(format!("GET {url} HTTP/1.1\r\n\r\n").as_bytes())
            .unwrap();
        Arc::new(parser.take_request().unwrap())
    }

    struct Recorder {
        served: Arc<Mutex<Vec<String>>>,
        lifecycle: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Handler for Recorder {
        fn setup(&mut self, _config: &Config) -> Result<(), ContainerError> {
            self.lifecycle.lock().unwrap().push("setup");
            Ok(())
        }

        fn serve(&mut self, request: &Request, response: &Response) -> Result<(), ContainerError> {
            self.served
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(request.url_bytes()).into_owned());
            response.write_status_line(200)?;
            response.end_headers();
            response.end_body();
            Ok(())
        }

        fn teardown(&mut self) -> Result<(), ContainerError> {
            self.lifecycle.lock().unwrap().push("teardown");
            Ok(())
        }
    }

    #[test]
    fn worker_serves_in_enqueue_order_and_shuts_down_cleanly() {
        let served = Arc::new(Mutex::new(Vec::new()));
        let lifecycle = Arc::new(Mutex::new(Vec::new()));
        let container = Container::custom(
            "recorder",
            Box::new(Recorder {
                served: served.clone(),
                lifecycle: lifecycle.clone(),
            }),
        );
        container.run(Arc::new(Config::new())).unwrap();

        let responses: Vec<Arc<Response>> = (0..5)
            .map(|i| {
                let response = Arc::new(Response::new(false, None));
                container.serve(request_for(&format!("/r{i}")), response.clone());
                response
            })
            .collect();

        assert_eq!(container.shutdown(), 0);

        assert_eq!(
            *served.lock().unwrap(),
            vec!["/r0", "/r1", "/r2", "/r3", "/r4"]
        );
        assert_eq!(*lifecycle.lock().unwrap(), vec!["setup", "teardown"]);
        assert!(responses.iter().all(|r| r.is_complete()));
    }

    #[test]
    fn serve_error_is_fatal_to_the_worker() {
        struct Failing;
        impl Handler for Failing {
            fn serve(&mut self, _: &Request, _: &Response) -> Result<(), ContainerError> {
                Err(ContainerError::Plugin("boom".into()))
            }
        }

        let container = Container::custom("failing", Box::new(Failing));
        container.run(Arc::new(Config::new())).unwrap();
        container.serve(request_for("/x"), Arc::new(Response::new(false, None)));

        // The worker exits on its own; the sentinel is redundant but
        // harmless.
        assert_eq!(container.shutdown(), 2);
    }

    #[test]
    fn run_twice_is_refused() {
        struct Nop;
        impl Handler for Nop {
            fn serve(&mut self, _: &Request, _: &Response) -> Result<(), ContainerError> {
                Ok(())
            }
        }

        let container = Container::custom("nop", Box::new(Nop));
        let config = Arc::new(Config::new());
        container.run(config.clone()).unwrap();
        assert!(matches!(
            container.run(config),
            Err(ContainerError::AlreadyRunning)
        ));
        container.shutdown();
    }

    static MISMATCH_CREATE_CALLED: AtomicBool = AtomicBool::new(false);

    #[test]
    fn abi_mismatch_never_reaches_plugin_code() {
        struct Nop;
        impl Handler for Nop {
            fn serve(&mut self, _: &Request, _: &Response) -> Result<(), ContainerError> {
                Ok(())
            }
        }

        let decl = PluginDecl {
            abi_version: ABI_VERSION + 1,
            register: |_| {
                MISMATCH_CREATE_CALLED.store(true, Ordering::Relaxed);
                Ok(())
            },
            create: |_| {
                MISMATCH_CREATE_CALLED.store(true, Ordering::Relaxed);
                Ok(Box::new(Nop))
            },
        };

        let mut config = Config::new();
        let result = Container::from_decl("mismatch", &decl, &mut config, None);
        assert!(matches!(
            result,
            Err(ContainerError::AbiMismatch {
                expected: ABI_VERSION,
                found,
            }) if found == ABI_VERSION + 1
        ));
        assert!(!MISMATCH_CREATE_CALLED.load(Ordering::Relaxed));
    }

    #[test]
    fn matching_decl_builds_and_serves() {
        struct Echo;
        impl Handler for Echo {
            fn serve(&mut self, _: &Request, response: &Response) -> Result<(), ContainerError> {
                response.append_data(b"ok");
                response.end_body();
                Ok(())
            }
        }

        let decl = PluginDecl {
            abi_version: ABI_VERSION,
            register: |_| Ok(()),
            create: |_| Ok(Box::new(Echo)),
        };

        let mut config = Config::new();
        let container = Container::from_decl("echo", &decl, &mut config, None).unwrap();
        container.run(Arc::new(config)).unwrap();

        let response = Arc::new(Response::new(false, None));
        container.serve(request_for("/"), response.clone());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !response.is_complete() {
            assert!(std::time::Instant::now() < deadline, "worker never served");
            thread::yield_now();
        }
        assert_eq!(container.shutdown(), 0);
    }
}
