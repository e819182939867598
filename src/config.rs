//! Isolate configuration: heap limits, capability flags and callbacks.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Capability and compatibility toggles.
///
/// These are plain state: each one is only read at its extension point
/// (context creation, template building, module resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IsolateFlags {
    /// `eval()` and `new Function()` in newly created contexts.
    pub eval_allowed: bool,
    pub jspi_enabled: bool,
    pub capture_throws_as_rejections: bool,
    pub node_js_compat: bool,
    pub node_js_process_v2: bool,
    /// Install `Symbol.toStringTag` on resource prototypes.
    pub set_to_string_tag: bool,
    pub allow_top_level_await: bool,
    pub using_new_module_registry: bool,
    pub throw_on_unrecognized_import_assertion: bool,
}

impl Default for IsolateFlags {
    fn default() -> Self {
        Self {
            eval_allowed: false,
            jspi_enabled: false,
            capture_throws_as_rejections: false,
            node_js_compat: false,
            node_js_process_v2: false,
            set_to_string_tag: false,
            allow_top_level_await: true,
            using_new_module_registry: false,
            throw_on_unrecognized_import_assertion: false,
        }
    }
}

/// Per-isolate settings, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IsolateConfig {
    pub heap_initial_mb: usize,
    pub heap_max_mb: usize,
    pub flags: IsolateFlags,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            heap_initial_mb: 1,
            heap_max_mb: 128,
            flags: IsolateFlags::default(),
        }
    }
}

const BYTES_PER_MB: usize = 1024 * 1024;

impl IsolateConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid isolate config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heap_max_mb == 0 {
            return Err(Error::configuration("heap_max_mb must be positive"));
        }

        if self.heap_max_mb.checked_mul(BYTES_PER_MB).is_none() {
            return Err(Error::configuration(format!(
                "heap_max_mb ({}) does not fit in the address space",
                self.heap_max_mb
            )));
        }

        if self.heap_initial_mb > self.heap_max_mb {
            return Err(Error::configuration(format!(
                "heap_initial_mb ({}) exceeds heap_max_mb ({})",
                self.heap_initial_mb, self.heap_max_mb
            )));
        }

        Ok(())
    }

    pub(crate) fn heap_initial_bytes(&self) -> usize {
        self.heap_initial_mb.saturating_mul(BYTES_PER_MB)
    }

    pub(crate) fn heap_max_bytes(&self) -> usize {
        self.heap_max_mb.saturating_mul(BYTES_PER_MB)
    }
}

/// Diagnostic sink for non-fatal conditions.
pub type Logger = Rc<dyn Fn(&mut v8::PinScope<'_, '_>, &str)>;

/// Sink for uncaught or reported errors: `(scope, description, error, formatted)`.
pub type ErrorReporter =
    Rc<dyn Fn(&mut v8::PinScope<'_, '_>, &str, v8::Local<'_, v8::Value>, &str)>;

/// How a module specifier is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMethod {
    Import,
    Require,
}

/// What the module fallback produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleFallbackResult {
    /// Module source text.
    Source(String),
    /// Resolve this specifier instead.
    Redirect(String),
}

/// Notified about module resolution events.
pub trait CompilationObserver {
    fn on_module_fallback(&self, _specifier: &str, _resolved: bool) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CompilationObserver for NoopObserver {}

/// Consulted when the primary module registry cannot resolve a specifier:
/// `(scope, specifier, referrer, observer, method, attribute)`.
pub type ModuleFallback = Rc<
    dyn Fn(
        &mut v8::PinScope<'_, '_>,
        &str,
        Option<&str>,
        &dyn CompilationObserver,
        ResolveMethod,
        Option<&str>,
    ) -> Option<ModuleFallbackResult>,
>;
