//! Platform passthroughs: logging, randomness and the host globals object.
//!
//! These are thin. Guest `console_log` lines go to the `log` facade under
//! the `tether::guest` target; `random_fill` reads the OS CSPRNG. The globals
//! object reachable through `global_get` carries `console` and `crypto`, and
//! embedders can install more with `GuestInstance::install_global`.

use rand::rngs::OsRng;
use rand::RngCore;
use wasmtime::{Caller, Linker};

use tether_hostapi::codec;
use tether_hostapi::views::byte_range;
use tether_hostapi::{CallError, Callable, GuestHeap, HostValue, ObjectRef};

use crate::error::RuntimeError;
use crate::host_impl::HostState;
use crate::linker::{catching, strict};

/// Log target for guest console output.
pub const GUEST_LOG_TARGET: &str = "tether::guest";

/// Map a guest log level (0 = trace .. 4 = error) onto `log`.
pub fn log_level(level: u32) -> log::Level {
    match level {
        0 => log::Level::Trace,
        1 => log::Level::Debug,
        2 => log::Level::Info,
        3 => log::Level::Warn,
        _ => log::Level::Error,
    }
}

fn fill_random(buf: &mut [u8]) -> Result<(), CallError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CallError::thrown(format!("random source unavailable: {e}")))
}

pub(crate) fn register_platform(
    linker: &mut Linker<HostState>,
    module: &str,
) -> Result<(), RuntimeError> {
    linker.func_wrap(
        module,
        "console_log",
        |mut caller: Caller<'_, HostState>, level: u32, ptr: u32, len: u32| -> anyhow::Result<()> {
            let line = strict(&mut caller, |b| b.read_str(ptr, len))?;
            log::log!(target: GUEST_LOG_TARGET, log_level(level), "{line}");
            Ok(())
        },
    )?;

    linker.func_wrap(
        module,
        "random_fill",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<()> {
            catching(&mut caller, |b| {
                {
                    let (mem, _) = b.memory()?;
                    byte_range("random_fill", ptr, len, mem.len())?;
                }
                let mut buf = vec![0u8; len as usize];
                fill_random(&mut buf)?;
                Ok(codec::write_bytes(b, ptr, &buf)?)
            })
        },
    )?;

    Ok(())
}

/// The default globals object: `console` and `crypto`.
pub fn default_globals() -> ObjectRef {
    let globals = ObjectRef::default();

    let console = ObjectRef::default();
    for (name, level) in [
        ("debug", log::Level::Debug),
        ("log", log::Level::Info),
        ("info", log::Level::Info),
        ("warn", log::Level::Warn),
        ("error", log::Level::Error),
    ] {
        console.set(
            name,
            Callable::native(name, move |_, args| {
                let line: Vec<String> = args
                    .iter()
                    .map(|arg| match arg {
                        HostValue::String(s) => s.to_string(),
                        other => other.debug_string(),
                    })
                    .collect();
                log::log!(target: GUEST_LOG_TARGET, level, "{}", line.join(" "));
                Ok(HostValue::Undefined)
            })
            .into(),
        );
    }
    globals.set("console", HostValue::Object(console));

    let crypto = ObjectRef::default();
    crypto.set(
        "getRandomValues",
        Callable::native("getRandomValues", |_, args| match args.first() {
            Some(HostValue::Bytes(bytes)) => {
                let mut buf = vec![0u8; bytes.len()];
                fill_random(&mut buf)?;
                bytes.replace(&buf);
                Ok(HostValue::Bytes(bytes.clone()))
            }
            _ => Err(CallError::type_error("getRandomValues expects a byte array")),
        })
        .into(),
    );
    globals.set("crypto", HostValue::Object(crypto));

    globals
}
