//! FFI bindings for Pacekeeper
//!
//! C-compatible functions over a file-backed engine. All functions use C
//! strings (null-terminated); returned strings are allocated and must be
//! freed with `pace_free_string`. Status codes are `0` on success and `-1`
//! on failure, with the reason available from `pace_last_error`.
//!
//! The host owns threading: every call on one engine handle must come from
//! the same serial queue, and the host schedules `pace_engine_tick` after
//! the delay it returns.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::calendar::LocalDays;
use crate::config::EngineConfig;
use crate::engine::StepEngine;
use crate::power::PowerToggle;
use crate::store::open_state_dir;
use crate::types::CalendarDay;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn json_to_cstr<T: Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Opaque handle to an engine and its power toggle
pub struct PaceEngineHandle {
    engine: StepEngine,
    power: PowerToggle,
}

unsafe fn handle_mut<'a>(handle: *mut PaceEngineHandle) -> Option<&'a mut PaceEngineHandle> {
    if handle.is_null() {
        set_last_error("Null engine handle");
        return None;
    }
    Some(&mut *handle)
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Open an engine persisting under `state_dir`.
///
/// # Safety
/// - `config_json` may be NULL for defaults, otherwise a valid C string.
/// - `state_dir` must be a valid null-terminated C string.
/// - Returns a pointer that must be freed with `pace_engine_free`, or NULL
///   on error.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_new(
    config_json: *const c_char,
    state_dir: *const c_char,
) -> *mut PaceEngineHandle {
    clear_last_error();

    let config = if config_json.is_null() {
        EngineConfig::default()
    } else {
        let json = match cstr_to_string(config_json) {
            Some(s) => s,
            None => {
                set_last_error("Invalid config string");
                return ptr::null_mut();
            }
        };
        match EngineConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                set_last_error(&e.to_string());
                return ptr::null_mut();
            }
        }
    };

    let dir = match cstr_to_string(state_dir) {
        Some(s) => PathBuf::from(s),
        None => {
            set_last_error("Invalid state_dir string pointer");
            return ptr::null_mut();
        }
    };

    let (durable, fast) = match open_state_dir(&dir) {
        Ok(stores) => stores,
        Err(e) => {
            set_last_error(&e.to_string());
            return ptr::null_mut();
        }
    };

    let power = PowerToggle::default();
    let built = StepEngine::builder(config)
        .durable_store(Arc::new(durable))
        .fast_persistence(Arc::new(fast))
        .power_signal(Arc::new(power.clone()))
        .day_resolver(Arc::new(LocalDays))
        .build(Utc::now());

    match built {
        Ok(engine) => Box::into_raw(Box::new(PaceEngineHandle { engine, power })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Flush every tier and free the engine.
///
/// # Safety
/// - `engine` must be a pointer returned by `pace_engine_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_free(engine: *mut PaceEngineHandle) {
    if !engine.is_null() {
        let mut handle = Box::from_raw(engine);
        handle.engine.flush_all(Utc::now());
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Feed one raw counter value.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `pace_engine_new`.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_record_sample(engine: *mut PaceEngineHandle, raw: i64) -> i32 {
    clear_last_error();
    let Some(handle) = handle_mut(engine) else {
        return -1;
    };
    handle.engine.record_sample(raw, Utc::now());
    0
}

/// Run a timer pass and return the milliseconds until the next one is due,
/// or -1 on error.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `pace_engine_new`.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_tick(engine: *mut PaceEngineHandle) -> i64 {
    clear_last_error();
    let Some(handle) = handle_mut(engine) else {
        return -1;
    };
    handle.engine.tick(Utc::now());
    let now = Utc::now();
    (handle.engine.next_deadline(now) - now).num_milliseconds().max(0)
}

/// Pause (`paused = true`) or resume counting.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `pace_engine_new`.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_set_paused(engine: *mut PaceEngineHandle, paused: bool) -> i32 {
    clear_last_error();
    let Some(handle) = handle_mut(engine) else {
        return -1;
    };
    handle.engine.set_paused(paused, Utc::now());
    0
}

/// Report the platform power-saving state.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `pace_engine_new`.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_set_power_saving(engine: *mut PaceEngineHandle, active: bool) -> i32 {
    clear_last_error();
    let Some(handle) = handle_mut(engine) else {
        return -1;
    };
    handle.power.set(active);
    0
}

/// Replace the total for `day` (`YYYY-MM-DD`).
///
/// # Safety
/// - `engine` must be a valid pointer returned by `pace_engine_new`.
/// - `day` must be a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_force_update(
    engine: *mut PaceEngineHandle,
    steps: u32,
    day: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(handle) = handle_mut(engine) else {
        return -1;
    };
    let day = match cstr_to_string(day).map(|s| s.parse::<CalendarDay>()) {
        Some(Ok(day)) => day,
        Some(Err(e)) => {
            set_last_error(&e.to_string());
            return -1;
        }
        None => {
            set_last_error("Invalid day string pointer");
            return -1;
        }
    };
    handle.engine.force_update(steps, day, Utc::now());
    0
}

/// Write every tier now.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `pace_engine_new`.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_flush(engine: *mut PaceEngineHandle) -> i32 {
    clear_last_error();
    let Some(handle) = handle_mut(engine) else {
        return -1;
    };
    handle.engine.flush_all(Utc::now());
    0
}

/// Import CSV history and return the import report as JSON.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `pace_engine_new`.
/// - `csv` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `pace_free_string`.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_import_csv(engine: *mut PaceEngineHandle, csv: *const c_char) -> *mut c_char {
    clear_last_error();
    let Some(handle) = handle_mut(engine) else {
        return ptr::null_mut();
    };
    let Some(csv) = cstr_to_string(csv) else {
        set_last_error("Invalid CSV string pointer");
        return ptr::null_mut();
    };
    let report = handle.engine.import_csv(&csv, Utc::now());
    json_to_cstr(&report)
}

/// Current snapshot as JSON (`{"day":..,"steps":..,"paused":..,"goal_reached":..}`).
///
/// # Safety
/// - `engine` must be a valid pointer returned by `pace_engine_new`.
/// - Returns a newly allocated string that must be freed with `pace_free_string`.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_snapshot_json(engine: *mut PaceEngineHandle) -> *mut c_char {
    clear_last_error();
    let Some(handle) = handle_mut(engine) else {
        return ptr::null_mut();
    };
    handle.engine.ensure_current_day(Utc::now());
    json_to_cstr(&handle.engine.snapshot())
}

/// Engine counters as JSON.
///
/// # Safety
/// - `engine` must be a valid pointer returned by `pace_engine_new`.
/// - Returns a newly allocated string that must be freed with `pace_free_string`.
#[no_mangle]
pub unsafe extern "C" fn pace_engine_stats_json(engine: *mut PaceEngineHandle) -> *mut c_char {
    clear_last_error();
    let Some(handle) = handle_mut(engine) else {
        return ptr::null_mut();
    };
    json_to_cstr(&handle.engine.stats())
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by Pacekeeper functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a Pacekeeper function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn pace_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next Pacekeeper call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn pace_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn pace_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
