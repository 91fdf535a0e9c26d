//! C ABI for loading the backend as a native inference plugin.
//!
//! Every entry point returns a status code from [`ErrorCode`]; results come
//! back through out-parameters. Strings are passed as pointer + byte length and
//! must be UTF-8. Text outputs are copied NUL-terminated into caller buffers;
//! when a buffer is too small the call fails with `TooLarge` and the required
//! size (terminator included) is still written to `*out_size`.
//!
//! ```c
//! void *backend;
//! init_backend_with_config(&backend, cfg, strlen(cfg));
//! uint32_t graph, session, written;
//! load_by_name_with_config(backend, path, strlen(path), NULL, 0, &graph);
//! init_execution_context(backend, graph, &session);
//! run_inference(backend, session, prompt, strlen(prompt), buf, sizeof buf, &written, NULL, 0);
//!
//! uint64_t task; bool ready;
//! nn_submit_inference(backend, session, prompt, strlen(prompt), NULL, 0, &task);
//! nn_task_result(backend, task, -1, buf, sizeof buf, &written, &ready);
//! close_execution_context(backend, session);
//! deinit_backend(backend);
//! ```

use std::ffi::{c_char, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tracing::error;

use crate::backend::Backend;
use crate::config::runtime::RuntimeOverrides;
use crate::config::BackendConfig;
use crate::engine::candle::CandleEngine;
use crate::error::{BackendError, ErrorCode};
use crate::logging;

/// Opaque handle handed to C callers.
pub struct NnBackend {
    inner: Backend,
}

type FfiResult = std::result::Result<(), ErrorCode>;

fn code_of(err: BackendError) -> ErrorCode {
    err.code()
}

/// Runs `body`, turning panics into `RuntimeError`.
fn guarded(op: &'static str, body: impl FnOnce() -> FfiResult) -> ErrorCode {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => ErrorCode::Success,
        Ok(Err(code)) => code,
        Err(_) => {
            error!(op, "panic caught at the C boundary");
            ErrorCode::RuntimeError
        }
    }
}

/// Borrows a `(ptr, len)` string argument. Null or empty yields `None`.
unsafe fn str_arg<'a>(data: *const c_char, len: u32) -> std::result::Result<Option<&'a str>, ErrorCode> {
    if data.is_null() || len == 0 {
        return Ok(None);
    }
    let bytes = std::slice::from_raw_parts(data.cast::<u8>(), len as usize);
    std::str::from_utf8(bytes)
        .map(Some)
        .map_err(|_| ErrorCode::InvalidEncoding)
}

unsafe fn required_str<'a>(data: *const c_char, len: u32) -> std::result::Result<&'a str, ErrorCode> {
    str_arg(data, len)?.ok_or(ErrorCode::InvalidArgument)
}

unsafe fn backend<'a>(ctx: *mut NnBackend) -> std::result::Result<&'a Backend, ErrorCode> {
    ctx.as_ref().map(|b| &b.inner).ok_or(ErrorCode::InvalidArgument)
}

unsafe fn write_out<T>(out: *mut T, value: T) -> FfiResult {
    if out.is_null() {
        return Err(ErrorCode::InvalidArgument);
    }
    out.write(value);
    Ok(())
}

unsafe fn write_text(text: &str, out: *mut u8, capacity: u32, out_size: *mut u32) -> FfiResult {
    let needed = text.len() + 1;
    let needed_u32 = u32::try_from(needed).map_err(|_| ErrorCode::TooLarge)?;
    if !out_size.is_null() {
        out_size.write(needed_u32);
    }
    if out.is_null() {
        return Err(ErrorCode::InvalidArgument);
    }
    if (capacity as usize) < needed {
        return Err(ErrorCode::TooLarge);
    }
    ptr::copy_nonoverlapping(text.as_ptr(), out, text.len());
    out.add(text.len()).write(0);
    Ok(())
}

unsafe fn write_json(value: &impl Serialize, out: *mut u8, capacity: u32, out_size: *mut u32) -> FfiResult {
    let json = serde_json::to_string(value).map_err(|e| {
        error!(error = %e, "status serialisation failed");
        ErrorCode::RuntimeError
    })?;
    write_text(&json, out, capacity, out_size)
}

fn start_backend(config_json: Option<&str>) -> std::result::Result<Backend, BackendError> {
    let config = BackendConfig::from_json(config_json);
    logging::init_logging(&config.logging);
    let engine = Arc::new(CandleEngine::new(config.performance.clone()));
    Backend::new(config, engine)
}

/// Creates a backend with default configuration.
#[no_mangle]
pub unsafe extern "C" fn init_backend(ctx: *mut *mut NnBackend) -> u32 {
    init_backend_with_config(ctx, ptr::null(), 0)
}

/// Creates a backend from a JSON configuration. Invalid JSON falls back to
/// defaults.
#[no_mangle]
pub unsafe extern "C" fn init_backend_with_config(ctx: *mut *mut NnBackend, config: *const c_char, config_len: u32) -> u32 {
    guarded("init_backend_with_config", || {
        if ctx.is_null() {
            return Err(ErrorCode::InvalidArgument);
        }
        let config = str_arg(config, config_len)?;
        let inner = start_backend(config).map_err(code_of)?;
        ctx.write(Box::into_raw(Box::new(NnBackend { inner })));
        Ok(())
    }) as u32
}

/// Shuts the backend down and frees the handle. Null is accepted.
#[no_mangle]
pub unsafe extern "C" fn deinit_backend(ctx: *mut NnBackend) -> u32 {
    guarded("deinit_backend", || {
        if !ctx.is_null() {
            drop(Box::from_raw(ctx));
        }
        Ok(())
    }) as u32
}

#[no_mangle]
pub unsafe extern "C" fn load_by_name(ctx: *mut NnBackend, filename: *const c_char, filename_len: u32, graph: *mut u32) -> u32 {
    load_by_name_with_config(ctx, filename, filename_len, ptr::null(), 0, graph)
}

/// Loads a GGUF model, hot-swapping the current one when present.
#[no_mangle]
pub unsafe extern "C" fn load_by_name_with_config(
    ctx: *mut NnBackend,
    filename: *const c_char,
    filename_len: u32,
    config: *const c_char,
    config_len: u32,
    graph: *mut u32,
) -> u32 {
    guarded("load_by_name_with_config", || {
        let backend = backend(ctx)?;
        let path = required_str(filename, filename_len)?;
        let config = str_arg(config, config_len)?;
        let id = backend.load_model(path, config).map_err(code_of)?;
        write_out(graph, id)
    }) as u32
}

#[no_mangle]
pub unsafe extern "C" fn init_execution_context(ctx: *mut NnBackend, graph: u32, exec_ctx: *mut u32) -> u32 {
    guarded("init_execution_context", || {
        let backend = backend(ctx)?;
        if exec_ctx.is_null() {
            return Err(ErrorCode::InvalidArgument);
        }
        let session = backend.create_session(Some(graph)).map_err(code_of)?;
        write_out(exec_ctx, session)
    }) as u32
}

#[no_mangle]
pub unsafe extern "C" fn close_execution_context(ctx: *mut NnBackend, exec_ctx: u32) -> u32 {
    guarded("close_execution_context", || {
        backend(ctx)?.close_session(exec_ctx).map_err(code_of)
    }) as u32
}

/// One chat turn. `runtime_config` optionally overrides sampling for this
/// call only.
#[no_mangle]
pub unsafe extern "C" fn run_inference(
    ctx: *mut NnBackend,
    exec_ctx: u32,
    prompt: *const c_char,
    prompt_len: u32,
    output: *mut u8,
    output_capacity: u32,
    output_size: *mut u32,
    runtime_config: *const c_char,
    config_len: u32,
) -> u32 {
    guarded("run_inference", || {
        let backend = backend(ctx)?;
        let prompt = required_str(prompt, prompt_len)?;
        let runtime = str_arg(runtime_config, config_len)?;
        let reply = backend.run_inference(exec_ctx, prompt, runtime).map_err(code_of)?;
        write_text(&reply, output, output_capacity, output_size)
    }) as u32
}

/// Submits one chat turn without waiting for it. The id written to `task`
/// is collected with [`nn_task_result`] and, while queued, can be cancelled
/// with [`nn_cancel_task`].
#[no_mangle]
pub unsafe extern "C" fn nn_submit_inference(
    ctx: *mut NnBackend,
    exec_ctx: u32,
    prompt: *const c_char,
    prompt_len: u32,
    runtime_config: *const c_char,
    config_len: u32,
    task: *mut u64,
) -> u32 {
    guarded("nn_submit_inference", || {
        let backend = backend(ctx)?;
        let prompt = required_str(prompt, prompt_len)?;
        let runtime = str_arg(runtime_config, config_len)?;
        if task.is_null() {
            return Err(ErrorCode::InvalidArgument);
        }
        let id = backend
            .submit_task(exec_ctx, prompt, RuntimeOverrides::parse(runtime))
            .map_err(code_of)?;
        write_out(task, id)
    }) as u32
}

/// Collects the reply of a submitted task. `timeout_ms < 0` blocks, `0`
/// polls. `*ready` is false while the task is still pending; the task can
/// then be asked for again. A failed task reports its own status code.
#[no_mangle]
pub unsafe extern "C" fn nn_task_result(
    ctx: *mut NnBackend,
    task: u64,
    timeout_ms: i64,
    output: *mut u8,
    output_capacity: u32,
    output_size: *mut u32,
    ready: *mut bool,
) -> u32 {
    guarded("nn_task_result", || {
        let backend = backend(ctx)?;
        if ready.is_null() {
            return Err(ErrorCode::InvalidArgument);
        }
        ready.write(false);
        let wait = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
        match backend.task_result(task, wait).map_err(code_of)? {
            Some(reply) => {
                ready.write(true);
                write_text(&reply, output, output_capacity, output_size)
            }
            None => Ok(()),
        }
    }) as u32
}

/// Cancels a queued inference task.
#[no_mangle]
pub unsafe extern "C" fn nn_cancel_task(ctx: *mut NnBackend, task: u64) -> u32 {
    guarded("nn_cancel_task", || backend(ctx)?.cancel_task(task).map_err(code_of)) as u32
}

/// Backend status as JSON.
#[no_mangle]
pub unsafe extern "C" fn nn_backend_status(ctx: *mut NnBackend, output: *mut u8, output_capacity: u32, output_size: *mut u32) -> u32 {
    guarded("nn_backend_status", || {
        let status = backend(ctx)?.status();
        write_json(&status, output, output_capacity, output_size)
    }) as u32
}

/// Session details as JSON.
#[no_mangle]
pub unsafe extern "C" fn nn_session_info(
    ctx: *mut NnBackend,
    exec_ctx: u32,
    output: *mut u8,
    output_capacity: u32,
    output_size: *mut u32,
) -> u32 {
    guarded("nn_session_info", || {
        let info = backend(ctx)?.session_info(exec_ctx).map_err(code_of)?;
        write_json(&info, output, output_capacity, output_size)
    }) as u32
}

fn c_messages() -> &'static [(ErrorCode, CString)] {
    static MESSAGES: OnceLock<Vec<(ErrorCode, CString)>> = OnceLock::new();
    MESSAGES.get_or_init(|| {
        ErrorCode::ALL
            .iter()
            .map(|&code| (code, CString::new(code.message()).unwrap_or_default()))
            .collect()
    })
}

/// Static, NUL-terminated message for a status code. Never null.
#[no_mangle]
pub extern "C" fn nn_error_message(code: u32) -> *const c_char {
    static UNKNOWN: &CStr = c"unknown error code";
    c_messages()
        .iter()
        .find(|(c, _)| *c as u32 == code)
        .map_or(UNKNOWN.as_ptr(), |(_, msg)| msg.as_ptr())
}

/// Crate version, NUL-terminated.
#[no_mangle]
pub extern "C" fn nn_backend_version() -> *const c_char {
    static VERSION: OnceLock<CString> = OnceLock::new();
    VERSION
        .get_or_init(|| CString::new(crate::backend_version()).unwrap_or_default())
        .as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handles_are_rejected() {
        unsafe {
            let mut graph = 0u32;
            let path = "model.gguf";
            let code = load_by_name_with_config(
                ptr::null_mut(),
                path.as_ptr().cast(),
                path.len() as u32,
                ptr::null(),
                0,
                &mut graph,
            );
            assert_eq!(code, ErrorCode::InvalidArgument as u32);
            assert_eq!(init_backend(ptr::null_mut()), ErrorCode::InvalidArgument as u32);
            assert_eq!(deinit_backend(ptr::null_mut()), ErrorCode::Success as u32);
        }
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let bytes = [0x66u8, 0xff, 0x6f];
        let result = unsafe { str_arg(bytes.as_ptr().cast(), bytes.len() as u32) };
        assert_eq!(result, Err(ErrorCode::InvalidEncoding));
        let empty = unsafe { str_arg(ptr::null(), 5) };
        assert_eq!(empty, Ok(None));
    }

    #[test]
    fn short_buffer_reports_required_size() {
        let mut buf = [0u8; 4];
        let mut size = 0u32;
        let result = unsafe { write_text("hello", buf.as_mut_ptr(), buf.len() as u32, &mut size) };
        assert_eq!(result, Err(ErrorCode::TooLarge));
        assert_eq!(size, 6);

        let mut buf = [0xAAu8; 8];
        let result = unsafe { write_text("hello", buf.as_mut_ptr(), buf.len() as u32, &mut size) };
        assert_eq!(result, Ok(()));
        assert_eq!(&buf[..6], b"hello\0");
    }

    #[test]
    fn panics_become_runtime_errors() {
        let code = guarded("test", || panic!("boom"));
        assert_eq!(code, ErrorCode::RuntimeError);
    }

    #[test]
    fn messages_are_static_c_strings() {
        let msg = unsafe { CStr::from_ptr(nn_error_message(ErrorCode::Unstable as u32)) };
        assert_eq!(msg.to_str(), Ok(ErrorCode::Unstable.message()));
        let unknown = unsafe { CStr::from_ptr(nn_error_message(9999)) };
        assert_eq!(unknown.to_str(), Ok("unknown error code"));
        let version = unsafe { CStr::from_ptr(nn_backend_version()) };
        assert_eq!(version.to_str(), Ok(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn task_calls_validate_their_arguments() {
        unsafe {
            let mut task = 0u64;
            let mut ready = true;
            let mut size = 0u32;
            let prompt = "hi";
            assert_eq!(
                nn_submit_inference(ptr::null_mut(), 1, prompt.as_ptr().cast(), 2, ptr::null(), 0, &mut task),
                ErrorCode::InvalidArgument as u32
            );
            assert_eq!(
                nn_task_result(ptr::null_mut(), 1, 0, ptr::null_mut(), 0, &mut size, &mut ready),
                ErrorCode::InvalidArgument as u32
            );

            let mut handle: *mut NnBackend = ptr::null_mut();
            assert_eq!(init_backend(&mut handle), ErrorCode::Success as u32);
            assert_eq!(
                nn_submit_inference(handle, 1, ptr::null(), 0, ptr::null(), 0, &mut task),
                ErrorCode::InvalidArgument as u32
            );
            assert_eq!(
                nn_submit_inference(handle, 1, prompt.as_ptr().cast(), 2, ptr::null(), 0, &mut task),
                ErrorCode::NotFound as u32
            );
            assert_eq!(
                nn_task_result(handle, 7, 0, ptr::null_mut(), 0, &mut size, &mut ready),
                ErrorCode::NotFound as u32
            );
            assert!(!ready);
            assert_eq!(
                nn_task_result(handle, 7, 0, ptr::null_mut(), 0, &mut size, ptr::null_mut()),
                ErrorCode::InvalidArgument as u32
            );
            assert_eq!(nn_cancel_task(handle, 7), ErrorCode::NotFound as u32);
            assert_eq!(deinit_backend(handle), ErrorCode::Success as u32);
        }
    }

    #[test]
    fn backend_without_model_refuses_sessions() {
        unsafe {
            let mut handle: *mut NnBackend = ptr::null_mut();
            let cfg = r#"{"backend":{"max_concurrent":2}}"#;
            assert_eq!(
                init_backend_with_config(&mut handle, cfg.as_ptr().cast(), cfg.len() as u32),
                ErrorCode::Success as u32
            );
            assert!(!handle.is_null());

            let mut session = 0u32;
            assert_eq!(
                init_execution_context(handle, 1, &mut session),
                ErrorCode::RuntimeError as u32
            );

            let mut buf = vec![0u8; 8192];
            let mut size = 0u32;
            assert_eq!(
                nn_backend_status(handle, buf.as_mut_ptr(), buf.len() as u32, &mut size),
                ErrorCode::Success as u32
            );
            let json: serde_json::Value =
                serde_json::from_slice(&buf[..size as usize - 1]).expect("status is JSON");
            assert_eq!(json["model"]["status"], "empty");
            assert_eq!(json["gate"]["max_concurrent"], 2);

            assert_eq!(deinit_backend(handle), ErrorCode::Success as u32);
        }
    }
}
