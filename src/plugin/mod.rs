//! Selection plug-in loader
//!
//! User code can reject or enrich events at runtime through a dynamic
//! library exposing three C symbols:
//!
//! - `select_init() -> void*` — build the plug-in's user data
//! - `select_event(samples_number, samples, baseline_end, timestamp,
//!   qshort, qlong, baseline, channel, pileup, event*, user_data*) -> bool`
//!   — may rewrite the event in place; only `true` events are published
//! - `select_close(user_data*) -> int` — tear down the user data
//!
//! All three symbols are resolved at load time; a missing symbol is fatal
//! at startup. The library handle is owned for the whole worker lifetime
//! and `select_close` runs exactly once during shutdown. Without a
//! library a trivial identity is used that selects every event.

use std::ffi::c_void;
use std::path::Path;
use std::ptr;

use libloading::{Library, Symbol};
use tracing::{info, warn};

use crate::common::{PipelineError, PipelineResult};
use crate::protocol::EventPsd;

type SelectInitFn = unsafe extern "C" fn() -> *mut c_void;

#[allow(clippy::type_complexity)]
type SelectEventFn = unsafe extern "C" fn(
    samples_number: u32,
    samples: *const u16,
    baseline_end: usize,
    timestamp: u64,
    qshort: f64,
    qlong: f64,
    baseline: f64,
    channel: u8,
    pileup: u8,
    event: *mut EventPsd,
    user_data: *mut c_void,
) -> bool;

type SelectCloseFn = unsafe extern "C" fn(user_data: *mut c_void) -> i32;

unsafe extern "C" fn identity_init() -> *mut c_void {
    ptr::null_mut()
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn identity_select(
    _samples_number: u32,
    _samples: *const u16,
    _baseline_end: usize,
    _timestamp: u64,
    _qshort: f64,
    _qlong: f64,
    _baseline: f64,
    _channel: u8,
    _pileup: u8,
    _event: *mut EventPsd,
    _user_data: *mut c_void,
) -> bool {
    true
}

unsafe extern "C" fn identity_close(_user_data: *mut c_void) -> i32 {
    0
}

/// An owned selection plug-in: library handle, resolved symbols and the
/// user data returned by `select_init`.
pub struct SelectionPlugin {
    // Kept alive for the lifetime of the resolved function pointers.
    _library: Option<Library>,
    select_event: SelectEventFn,
    select_close: SelectCloseFn,
    user_data: *mut c_void,
    closed: bool,
}

impl SelectionPlugin {
    /// Trivial identity: every event is selected, init returns null,
    /// close returns zero.
    pub fn identity() -> Self {
        Self::from_functions(identity_init, identity_select, identity_close)
    }

    /// Build a plug-in from in-process functions (used by tests and by
    /// embedded selections); `init` runs immediately.
    pub fn from_functions(
        init: SelectInitFn,
        select_event: SelectEventFn,
        select_close: SelectCloseFn,
    ) -> Self {
        let user_data = unsafe { init() };
        Self {
            _library: None,
            select_event,
            select_close,
            user_data,
            closed: false,
        }
    }

    /// Load a selection library and resolve the three symbols up front.
    ///
    /// # Safety contract
    ///
    /// The library must export the documented symbols with the documented
    /// signatures; the loader can verify names, not types.
    pub fn load<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let path = path.as_ref();
        info!(library = %path.display(), "loading selection library");

        let library = unsafe { Library::new(path) }.map_err(PipelineError::Plugin)?;

        let (init, select_event, select_close) = unsafe {
            let init: Symbol<SelectInitFn> = library.get(b"select_init\0")?;
            let event: Symbol<SelectEventFn> = library.get(b"select_event\0")?;
            let close: Symbol<SelectCloseFn> = library.get(b"select_close\0")?;
            (*init, *event, *close)
        };

        let user_data = unsafe { init() };

        Ok(Self {
            _library: Some(library),
            select_event,
            select_close,
            user_data,
            closed: false,
        })
    }

    /// Run the selection over one event. The plug-in may rewrite `event`
    /// in place; the return value decides publication.
    #[allow(clippy::too_many_arguments)]
    pub fn select_event(
        &mut self,
        samples: &[u16],
        baseline_end: usize,
        timestamp: u64,
        qshort: f64,
        qlong: f64,
        baseline: f64,
        channel: u8,
        pileup: bool,
        event: &mut EventPsd,
    ) -> bool {
        unsafe {
            (self.select_event)(
                samples.len() as u32,
                samples.as_ptr(),
                baseline_end,
                timestamp,
                qshort,
                qlong,
                baseline,
                channel,
                pileup as u8,
                event as *mut EventPsd,
                self.user_data,
            )
        }
    }

    /// Call `select_close` exactly once; later calls are no-ops.
    ///
    /// A nonzero return is logged and swallowed: by this point the worker
    /// is shutting down anyway.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let result = unsafe { (self.select_close)(self.user_data) };
        self.user_data = ptr::null_mut();
        if result != 0 {
            warn!(code = result, "selection close returned an error");
        }
    }
}

impl Drop for SelectionPlugin {
    fn drop(&mut self) {
        self.close();
    }
}
