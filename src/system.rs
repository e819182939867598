//! Process-wide V8 initialization.
//!
//! V8 can only be initialized once per process. The first `V8System`
//! initializes the platform; every later one reuses it and only applies its
//! own flags. That makes it safe for test harnesses to build one system per
//! test.

use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{Error, Result};

static PLATFORM: OnceLock<v8::SharedRef<v8::Platform>> = OnceLock::new();
static FATAL_ERROR_CALLBACK: RwLock<Option<FatalErrorCallback>> = RwLock::new(None);

/// Flags every isolate in the process runs with.
///
/// Incremental marking is off: better for small heaps.
const BASELINE_FLAGS: &[&str] = &["--no-freeze-flags-after-init", "--noincremental-marking"];

/// Called with `(location, message)` before the process aborts on OOM.
///
/// Must not call back into V8.
pub type FatalErrorCallback = fn(&str, &str);

/// Replacement for the default platform message-loop pump.
pub type PumpMessageLoop = Arc<dyn Fn(&mut v8::Isolate) -> bool + Send + Sync>;

/// Replacement for the default platform isolate-shutdown notification.
pub type ShutdownIsolate = Arc<dyn Fn(&mut v8::Isolate) + Send + Sync>;

/// Handle to the initialized V8 engine.
#[derive(Clone)]
pub struct V8System {
    inner: Arc<SystemInner>,
}

struct SystemInner {
    platform: v8::SharedRef<v8::Platform>,
    flags: Vec<String>,
    pump_message_loop: Option<PumpMessageLoop>,
    shutdown_isolate: Option<ShutdownIsolate>,
}

impl V8System {
    /// Initialize with the default platform and no extra flags.
    pub fn new() -> Result<Self> {
        Self::init(None, Vec::new())
    }

    /// Initialize with extra `--flag` tokens.
    ///
    /// Fails with [`Error::UnrecognizedFlags`] if V8 does not know a token.
    pub fn with_flags<I, S>(flags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::init(None, flags.into_iter().map(Into::into).collect())
    }

    /// Initialize with an embedder-provided platform.
    pub fn with_platform<I, S>(platform: v8::SharedRef<v8::Platform>, flags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::init(Some(platform), flags.into_iter().map(Into::into).collect())
    }

    fn init(requested: Option<v8::SharedRef<v8::Platform>>, flags: Vec<String>) -> Result<Self> {
        if let (Some(active), Some(requested)) = (PLATFORM.get(), requested.as_ref())
            && !std::ptr::eq(&**active, &**requested)
        {
            return Err(Error::configuration(
                "V8 is already initialized with a different platform",
            ));
        }

        if PLATFORM.get().is_none() {
            for flag in BASELINE_FLAGS {
                v8::V8::set_flags_from_string(flag);
            }

            // On macOS, use single-threaded GC to avoid code collection issues
            #[cfg(target_os = "macos")]
            v8::V8::set_flags_from_string("--single-threaded-gc");
        }

        apply_flags(&flags)?;

        let platform = PLATFORM
            .get_or_init(|| {
                let platform =
                    requested.unwrap_or_else(|| v8::new_default_platform(0, false).make_shared());
                v8::V8::initialize_platform(platform.clone());
                v8::V8::initialize();
                tracing::debug!("V8 {} initialized", v8::V8::get_version());
                platform
            })
            .clone();

        Ok(Self {
            inner: Arc::new(SystemInner {
                platform,
                flags,
                pump_message_loop: None,
                shutdown_isolate: None,
            }),
        })
    }

    /// Replace how platform tasks are pumped for isolates of this system.
    pub fn with_pump_message_loop(
        self,
        pump: impl Fn(&mut v8::Isolate) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rebuild(|inner| inner.pump_message_loop = Some(Arc::new(pump)))
    }

    /// Replace how the platform is told an isolate is going away.
    pub fn with_shutdown_isolate(
        self,
        shutdown: impl Fn(&mut v8::Isolate) + Send + Sync + 'static,
    ) -> Self {
        self.rebuild(|inner| inner.shutdown_isolate = Some(Arc::new(shutdown)))
    }

    fn rebuild(self, f: impl FnOnce(&mut SystemInner)) -> Self {
        let mut inner = SystemInner {
            platform: self.inner.platform.clone(),
            flags: self.inner.flags.clone(),
            pump_message_loop: self.inner.pump_message_loop.clone(),
            shutdown_isolate: self.inner.shutdown_isolate.clone(),
        };
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn platform(&self) -> &v8::SharedRef<v8::Platform> {
        &self.inner.platform
    }

    /// Extra flags this system was created with (baseline flags excluded).
    pub fn flags(&self) -> &[String] {
        &self.inner.flags
    }

    /// Run queued platform tasks. Returns whether a task was run.
    pub fn pump_message_loop(&self, isolate: &mut v8::Isolate) -> bool {
        match &self.inner.pump_message_loop {
            Some(pump) => pump(isolate),
            None => v8::Platform::pump_message_loop(&self.inner.platform, isolate, false),
        }
    }

    /// Called on teardown, before the isolate is disposed.
    pub fn shutdown_isolate(&self, isolate: &mut v8::Isolate) {
        match &self.inner.shutdown_isolate {
            Some(shutdown) => shutdown(isolate),
            None => v8::Platform::notify_isolate_shutdown(&self.inner.platform, isolate),
        }
    }

    /// Install the process-wide fatal error callback.
    pub fn set_fatal_error_callback(callback: FatalErrorCallback) {
        let mut slot = FATAL_ERROR_CALLBACK
            .write()
            .expect("fatal error callback lock poisoned");
        *slot = Some(callback);
    }

    pub(crate) fn fatal_error_callback() -> Option<FatalErrorCallback> {
        FATAL_ERROR_CALLBACK.read().ok().and_then(|slot| *slot)
    }
}

impl std::fmt::Debug for V8System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V8System")
            .field("flags", &self.inner.flags)
            .field("custom_pump", &self.inner.pump_message_loop.is_some())
            .field("custom_shutdown", &self.inner.shutdown_isolate.is_some())
            .finish()
    }
}

/// Hand flags to V8, rejecting any token it leaves unconsumed.
fn apply_flags(flags: &[String]) -> Result<()> {
    if flags.is_empty() {
        return Ok(());
    }

    // V8 treats the first element as the program name.
    let mut args = Vec::with_capacity(flags.len() + 1);
    args.push(String::new());
    args.extend(flags.iter().cloned());

    let unrecognized: Vec<String> = v8::V8::set_flags_from_command_line(args)
        .into_iter()
        .skip(1)
        .collect();

    if !unrecognized.is_empty() {
        tracing::warn!("Rejecting unrecognized V8 flags: {:?}", unrecognized);
        return Err(Error::UnrecognizedFlags(unrecognized));
    }

    tracing::debug!("Applied V8 flags: {:?}", flags);
    Ok(())
}

/// Report a fatal condition and abort the process.
pub(crate) fn fatal_error(location: &str, message: &str) -> ! {
    tracing::error!("Fatal V8 error at {}: {}", location, message);

    if let Some(callback) = V8System::fatal_error_callback() {
        callback(location, message);
    }

    std::process::abort()
}
