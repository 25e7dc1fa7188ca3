//! Flat C ABI
//!
//! One process-wide `Engine` is created lazily on first use. Every function
//! returns `0` on success or a negative `ErrorCode`; argument checks happen
//! before the engine is touched. See `include/castline.h`.

use std::ffi::{c_char, c_void, CStr};

use once_cell::sync::OnceCell;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::{EngineConfig, HostConfig, PRIMARY_DISPLAY};
use crate::error::{validate_port, EngineError, ErrorCode};
use crate::session::Engine;

static ENGINE: OnceCell<Engine> = OnceCell::new();

/// Host stream parameters; zero fields take the engine defaults
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CastlineHostConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub keyframe_interval_ms: u32,
    /// `UINT32_MAX` selects the primary display
    pub display_id: u32,
}

impl CastlineHostConfig {
    fn to_host_config(self, defaults: HostConfig) -> HostConfig {
        let or_default = |value: u32, default: u32| if value == 0 { default } else { value };
        HostConfig {
            width: or_default(self.width, defaults.width),
            height: or_default(self.height, defaults.height),
            fps: or_default(self.fps, defaults.fps),
            bitrate_kbps: or_default(self.bitrate_kbps, defaults.bitrate_kbps),
            keyframe_interval_ms: or_default(self.keyframe_interval_ms, defaults.keyframe_interval_ms),
            display_id: Some(self.display_id).filter(|id| *id != PRIMARY_DISPLAY),
        }
    }
}

/// Session counters
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CastlineStats {
    pub connected: bool,
    pub fps: u32,
    pub rtt_ms: u32,
    pub bitrate_kbps: u32,
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub packets_lost: u64,
}

fn engine() -> Result<&'static Engine, EngineError> {
    ENGINE.get_or_try_init(|| {
        let config = EngineConfig::load().unwrap_or_else(|e| {
            warn!("Using default configuration: {}", e);
            EngineConfig::default()
        });
        Engine::new(config)
    })
}

fn status(result: Result<(), EngineError>) -> i32 {
    match result {
        Ok(()) => ErrorCode::Ok.as_i32(),
        Err(e) => {
            warn!("{}", e);
            e.code().as_i32()
        }
    }
}

/// Borrow a non-empty UTF-8 C string
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives the call.
unsafe fn c_str<'a>(ptr: *const c_char) -> Result<&'a str, i32> {
    if ptr.is_null() {
        return Err(ErrorCode::NullPointer.as_i32());
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) if !s.is_empty() => Ok(s),
        _ => Err(ErrorCode::InvalidString.as_i32()),
    }
}

fn port_arg(port: i32) -> Result<u16, i32> {
    validate_port(port as i64).map_err(|e| e.code().as_i32())
}

macro_rules! try_arg {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(code) => return code,
        }
    };
}

/// Install logging and reset diagnostics. Safe to call more than once.
#[no_mangle]
pub extern "C" fn castline_init() -> i32 {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("castline=info")),
        )
        .try_init();

    status(engine().map(|engine| engine.init()))
}

/// Library version as a static NUL-terminated string
#[no_mangle]
pub extern "C" fn castline_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Stop any session and signaling; succeeds when nothing is running
#[no_mangle]
pub extern "C" fn castline_stop() -> i32 {
    if let Some(engine) = ENGINE.get() {
        engine.stop();
    }
    ErrorCode::Ok.as_i32()
}

/// # Safety
/// `storage_path` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn castline_init_identity(storage_path: *const c_char) -> i32 {
    let path = try_arg!(c_str(storage_path));
    status(engine().and_then(|engine| engine.init_identity(path).map(|_| ())))
}

/// Copy the 32-byte public key into `out`
///
/// # Safety
/// `out` must point to at least `out_len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn castline_get_public_key(out: *mut u8, out_len: usize) -> i32 {
    if out.is_null() {
        return ErrorCode::NullPointer.as_i32();
    }
    let buf = std::slice::from_raw_parts_mut(out, out_len);
    status(engine().and_then(|engine| engine.copy_public_key(buf)))
}

#[no_mangle]
pub extern "C" fn castline_start_host(port: i32) -> i32 {
    let port = try_arg!(port_arg(port));
    status(engine().and_then(|engine| engine.start_host(port)))
}

/// # Safety
/// `config` must be null or point to a valid `CastlineHostConfig`.
#[no_mangle]
pub unsafe extern "C" fn castline_start_host_with_config(
    port: i32,
    config: *const CastlineHostConfig,
) -> i32 {
    let port = try_arg!(port_arg(port));
    let engine = match engine() {
        Ok(engine) => engine,
        Err(e) => return status(Err(e)),
    };
    let defaults = engine.config().host;
    let host = match config.as_ref() {
        Some(config) => config.to_host_config(defaults),
        None => defaults,
    };
    status(engine.start_host_with_config(port, host))
}

/// # Safety
/// `host_ip` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn castline_start_client(host_ip: *const c_char, port: i32) -> i32 {
    let host = try_arg!(c_str(host_ip));
    let port = try_arg!(port_arg(port));
    status(engine().and_then(|engine| engine.start_client(host, port)))
}

/// # Safety
/// `token` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn castline_connect_signaling(token: *const c_char) -> i32 {
    let token = try_arg!(c_str(token));
    status(engine().and_then(|engine| engine.connect_signaling(token)))
}

/// # Safety
/// `url` and `token` must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn castline_connect_signaling_with_url(
    url: *const c_char,
    token: *const c_char,
) -> i32 {
    let url = try_arg!(c_str(url));
    let token = try_arg!(c_str(token));
    status(engine().and_then(|engine| engine.connect_signaling_with_url(url, token)))
}

/// # Safety
/// `target_username` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn castline_send_connect_request(target_username: *const c_char) -> i32 {
    let target = try_arg!(c_str(target_username));
    status(engine().and_then(|engine| engine.send_connect_request(target)))
}

/// # Safety
/// `out` must point to a writable `CastlineStats`.
#[no_mangle]
pub unsafe extern "C" fn castline_get_stats(out: *mut CastlineStats) -> i32 {
    let Some(out) = out.as_mut() else {
        return ErrorCode::NullPointer.as_i32();
    };
    let snapshot = ENGINE.get().map(Engine::stats).unwrap_or_default();
    *out = CastlineStats {
        connected: snapshot.connected,
        fps: snapshot.fps,
        rtt_ms: snapshot.rtt_ms,
        bitrate_kbps: snapshot.bitrate_kbps,
        frames_encoded: snapshot.frames_encoded,
        frames_decoded: snapshot.frames_decoded,
        frames_dropped: snapshot.frames_dropped,
        packets_lost: snapshot.packets_lost,
    };
    ErrorCode::Ok.as_i32()
}

/// Copy a diagnostic string; returns bytes copied excluding the NUL
unsafe fn copy_diagnostic(
    buf: *mut c_char,
    len: usize,
    copy: impl FnOnce(&Engine, &mut [u8]) -> usize,
) -> i32 {
    if buf.is_null() {
        return ErrorCode::NullPointer.as_i32();
    }
    if len == 0 {
        return 0;
    }
    let out = std::slice::from_raw_parts_mut(buf as *mut u8, len);
    let copied = match ENGINE.get() {
        Some(engine) => copy(engine, out),
        None => {
            out[0] = 0;
            0
        }
    };
    copied.min(i32::MAX as usize) as i32
}

/// # Safety
/// `buf` must point to at least `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn castline_copy_last_error(buf: *mut c_char, len: usize) -> i32 {
    copy_diagnostic(buf, len, Engine::copy_last_error)
}

/// # Safety
/// `buf` must point to at least `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn castline_copy_last_cloud_status(buf: *mut c_char, len: usize) -> i32 {
    copy_diagnostic(buf, len, Engine::copy_last_cloud_status)
}

/// Render decoded frames to an opaque platform surface
#[no_mangle]
pub extern "C" fn castline_init_renderer(surface: *mut c_void) -> i32 {
    if surface.is_null() {
        return ErrorCode::NullPointer.as_i32();
    }
    status(engine().and_then(|engine| engine.init_renderer(surface as usize)))
}

#[no_mangle]
pub extern "C" fn castline_init_injector(width: i32, height: i32) -> i32 {
    if width <= 0 || height <= 0 {
        return ErrorCode::InvalidArgument.as_i32();
    }
    status(engine().and_then(|engine| engine.init_injector(width as u32, height as u32)))
}

#[no_mangle]
pub extern "C" fn castline_test_input_injection() -> i32 {
    status(engine().and_then(|engine| engine.test_input_injection()))
}
