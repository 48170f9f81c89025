//! Boundary-call adapter registration via Wasmtime linker.
//!
//! Registers every adapter the guest may import with the Wasmtime `Linker`,
//! under the configured import module (`tether` by default). Handles and
//! pointers are `i32` on the wire. Each adapter:
//! 1. Opens a `Boundary` over the caller's store
//! 2. Resolves handles via the handle table, memory via the view cache
//! 3. Performs the host operation
//! 4. Returns a handle, a flag, or writes into a guest return area
//!
//! Adapters come in two flavours. *Strict* adapters trap the guest on any
//! failure. *Catching* adapters (calls, property access, JSON, platform
//! operations) park a thrown host value in the exception register and
//! return 0; the guest collects it with `exn_take`. Faults always trap.

use std::rc::Rc;

use wasmtime::{Caller, Linker};

use tether_hostapi::closure::FLAG_CONSUMING;
use tether_hostapi::codec::{self, GuestSlice};
use tether_hostapi::{
    json, BridgeError, BytesRef, CallError, Callable, ClosureKind, GuestClosure, Handle,
    HostValue, PromiseRef,
};

use crate::error::RuntimeError;
use crate::host_impl::{Boundary, HostState};
use crate::platform::register_platform;

/// Every function the adapter module exports, for import validation.
pub const ADAPTERS: &[&str] = &[
    // lifecycle
    "object_drop_ref",
    "object_clone_ref",
    "closure_new",
    "closure_drop",
    // primitives
    "string_new",
    "string_get",
    "number_new",
    "number_get",
    "boolean_get",
    "bytes_new",
    "bytes_length",
    "bytes_get",
    "bytes_copy_to",
    // object protocol
    "object_new",
    "array_new",
    "array_push",
    "get",
    "set",
    "has",
    "call",
    "call_method",
    "construct",
    "is_object",
    "is_function",
    "is_string",
    "is_undefined",
    "is_null",
    "global_get",
    "json_parse",
    "json_serialize",
    "debug_string",
    // errors
    "error_new",
    "throw",
    "rethrow",
    "exn_take",
    // promises
    "promise_new",
    "promise_resolve",
    "promise_then",
    "promise_then2",
    // platform
    "console_log",
    "random_fill",
];

/// Register all adapters with the linker under `module`.
pub fn register_host_functions(
    linker: &mut Linker<HostState>,
    module: &str,
) -> Result<(), RuntimeError> {
    register_lifecycle(linker, module)?;
    register_primitives(linker, module)?;
    register_object_protocol(linker, module)?;
    register_errors(linker, module)?;
    register_promises(linker, module)?;
    register_platform(linker, module)?;
    Ok(())
}

// ── Adapter plumbing ──

/// Run a strict adapter body: every failure traps the guest.
pub(crate) fn strict<T>(
    caller: &mut Caller<'_, HostState>,
    body: impl FnOnce(&mut Boundary<'_>) -> Result<T, BridgeError>,
) -> anyhow::Result<T> {
    let mut boundary = Boundary::from(caller);
    body(&mut boundary).map_err(fault)
}

/// Run a catching adapter body: a thrown value lands in the exception
/// register and the adapter returns `T::default()`.
pub(crate) fn catching<T: Default>(
    caller: &mut Caller<'_, HostState>,
    body: impl FnOnce(&mut Boundary<'_>) -> Result<T, CallError>,
) -> anyhow::Result<T> {
    let mut boundary = Boundary::from(caller);
    match body(&mut boundary) {
        Ok(value) => Ok(value),
        Err(CallError::Thrown(value)) => {
            boundary.state().set_exception(value);
            Ok(T::default())
        }
        Err(CallError::Fault(err)) => Err(fault(err)),
    }
}

fn fault(err: BridgeError) -> anyhow::Error {
    if err.is_protocol_violation() {
        log::error!("boundary protocol violation: {err}");
    }
    anyhow::Error::new(err)
}

/// Start unwinding the guest with `value` as the thrown exception.
fn raise(caller: &mut Caller<'_, HostState>, value: HostValue) -> anyhow::Result<()> {
    caller.data_mut().pending_throw = Some(value);
    Err(anyhow::anyhow!("guest threw an exception"))
}

fn apply(b: &mut Boundary<'_>, f: &HostValue, args: &[HostValue]) -> Result<HostValue, CallError> {
    match f.as_callable() {
        Some(callable) => callable.call(b, args),
        None => Err(CallError::type_error(format!(
            "{} is not a function",
            f.debug_string()
        ))),
    }
}

fn bytes_of(op: &str, value: &HostValue) -> Result<BytesRef, BridgeError> {
    match value {
        HostValue::Bytes(bytes) => Ok(bytes.clone()),
        other => Err(BridgeError::Protocol(format!(
            "{op}: expected a byte array, got {}",
            other.type_name()
        ))),
    }
}

fn promise_of(op: &str, value: &HostValue) -> Result<PromiseRef, BridgeError> {
    value.as_promise().cloned().ok_or_else(|| {
        BridgeError::Protocol(format!("{op}: expected a promise, got {}", value.type_name()))
    })
}

// ── Lifecycle ──

fn register_lifecycle(linker: &mut Linker<HostState>, module: &str) -> Result<(), RuntimeError> {
    linker.func_wrap(
        module,
        "object_drop_ref",
        |mut caller: Caller<'_, HostState>, h: u32| -> anyhow::Result<()> {
            strict(&mut caller, |b| b.state().handles.drop(Handle(h)))
        },
    )?;

    linker.func_wrap(
        module,
        "object_clone_ref",
        |mut caller: Caller<'_, HostState>, h: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                b.state().handles.duplicate(Handle(h)).map(|dup| dup.0)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "closure_new",
        |mut caller: Caller<'_, HostState>,
         ctx_a: u32,
         ctx_b: u32,
         dtor: u32,
         entry: u32,
         flags: u32|
         -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                if flags & !(FLAG_CONSUMING | 0xFF00) != 0 {
                    return Err(BridgeError::Protocol(format!(
                        "closure_new: unknown flags {flags:#x}"
                    )));
                }
                let (kind, arity) = ClosureKind::from_flags(flags);
                let closure = GuestClosure::wrap(ctx_a, ctx_b, dtor, entry, kind, arity);
                b.alloc(HostValue::Function(Callable::guest(closure)))
            })
        },
    )?;

    linker.func_wrap(
        module,
        "closure_drop",
        |mut caller: Caller<'_, HostState>, h: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                let value = b.state().handles.take_for("closure_drop", Handle(h))?;
                let closure = value
                    .as_callable()
                    .and_then(Callable::as_guest)
                    .cloned()
                    .ok_or_else(|| {
                        BridgeError::Protocol(format!(
                            "closure_drop: handle {h} is not a guest closure"
                        ))
                    })?;
                Ok(closure.release(b)? as u32)
            })
        },
    )?;

    Ok(())
}

// ── Primitive marshaling ──

fn register_primitives(linker: &mut Linker<HostState>, module: &str) -> Result<(), RuntimeError> {
    linker.func_wrap(
        module,
        "string_new",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                let s = b.read_str(ptr, len)?;
                b.alloc(HostValue::string(s))
            })
        },
    )?;

    // A non-string writes (0, 0).
    linker.func_wrap(
        module,
        "string_get",
        |mut caller: Caller<'_, HostState>, ret: u32, h: u32| -> anyhow::Result<()> {
            strict(&mut caller, |b| match b.value("string_get", h)? {
                HostValue::String(s) => b.return_str(ret, &s),
                _ => codec::write_slice_ret(b, ret, GuestSlice::default()),
            })
        },
    )?;

    linker.func_wrap(
        module,
        "number_new",
        |mut caller: Caller<'_, HostState>, n: f64| -> anyhow::Result<u32> {
            strict(&mut caller, |b| b.alloc(HostValue::Number(n)))
        },
    )?;

    linker.func_wrap(
        module,
        "number_get",
        |mut caller: Caller<'_, HostState>, ret: u32, h: u32| -> anyhow::Result<()> {
            strict(&mut caller, |b| {
                let n = b.value("number_get", h)?.as_number();
                codec::write_number_ret(b, ret, n)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "boolean_get",
        |mut caller: Caller<'_, HostState>, h: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                Ok(match b.value("boolean_get", h)?.as_bool() {
                    Some(true) => 1,
                    Some(false) => 0,
                    None => 2,
                })
            })
        },
    )?;

    linker.func_wrap(
        module,
        "bytes_new",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                let bytes = codec::read_bytes(b, ptr, len)?;
                b.alloc(HostValue::bytes(bytes))
            })
        },
    )?;

    linker.func_wrap(
        module,
        "bytes_length",
        |mut caller: Caller<'_, HostState>, h: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                let bytes = bytes_of("bytes_length", &b.value("bytes_length", h)?)?;
                Ok(bytes.len() as u32)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "bytes_get",
        |mut caller: Caller<'_, HostState>, ret: u32, h: u32| -> anyhow::Result<()> {
            strict(&mut caller, |b| {
                let bytes = bytes_of("bytes_get", &b.value("bytes_get", h)?)?.to_vec();
                let slice = codec::pass_bytes(b, &bytes)?;
                codec::write_slice_ret(b, ret, slice)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "bytes_copy_to",
        |mut caller: Caller<'_, HostState>, h: u32, ptr: u32| -> anyhow::Result<()> {
            strict(&mut caller, |b| {
                let bytes = bytes_of("bytes_copy_to", &b.value("bytes_copy_to", h)?)?.to_vec();
                codec::write_bytes(b, ptr, &bytes)
            })
        },
    )?;

    Ok(())
}

// ── Object protocol ──

fn register_object_protocol(
    linker: &mut Linker<HostState>,
    module: &str,
) -> Result<(), RuntimeError> {
    linker.func_wrap(
        module,
        "object_new",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<u32> {
            strict(&mut caller, |b| b.alloc(HostValue::object()))
        },
    )?;

    linker.func_wrap(
        module,
        "array_new",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<u32> {
            strict(&mut caller, |b| b.alloc(HostValue::array(Vec::new())))
        },
    )?;

    linker.func_wrap(
        module,
        "array_push",
        |mut caller: Caller<'_, HostState>, arr: u32, v: u32| -> anyhow::Result<()> {
            strict(&mut caller, |b| {
                let value = b.value("array_push", v)?;
                match b.value("array_push", arr)? {
                    HostValue::Array(items) => {
                        items.push(value);
                        Ok(())
                    }
                    other => Err(BridgeError::Protocol(format!(
                        "array_push: expected an array, got {}",
                        other.type_name()
                    ))),
                }
            })
        },
    )?;

    linker.func_wrap(
        module,
        "get",
        |mut caller: Caller<'_, HostState>, obj: u32, kptr: u32, klen: u32| -> anyhow::Result<u32> {
            catching(&mut caller, |b| {
                let key = b.read_str(kptr, klen)?;
                let value = b.value("get", obj)?.get_property(&key)?;
                Ok(b.alloc(value)?)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "set",
        |mut caller: Caller<'_, HostState>,
         obj: u32,
         kptr: u32,
         klen: u32,
         v: u32|
         -> anyhow::Result<u32> {
            catching(&mut caller, |b| {
                let key = b.read_str(kptr, klen)?;
                let value = b.value("set", v)?;
                Ok(b.value("set", obj)?.set_property(&key, value)? as u32)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "has",
        |mut caller: Caller<'_, HostState>, obj: u32, kptr: u32, klen: u32| -> anyhow::Result<u32> {
            catching(&mut caller, |b| {
                let key = b.read_str(kptr, klen)?;
                Ok(b.value("has", obj)?.has_property(&key)? as u32)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "call",
        |mut caller: Caller<'_, HostState>, f: u32, args_ptr: u32, args_len: u32| -> anyhow::Result<u32> {
            catching(&mut caller, |b| {
                let f = b.value("call", f)?;
                let args = b.read_args(args_ptr, args_len)?;
                let result = apply(b, &f, &args)?;
                Ok(b.alloc(result)?)
            })
        },
    )?;

    // The receiver is not bound: host methods see only their arguments.
    linker.func_wrap(
        module,
        "call_method",
        |mut caller: Caller<'_, HostState>,
         obj: u32,
         nptr: u32,
         nlen: u32,
         args_ptr: u32,
         args_len: u32|
         -> anyhow::Result<u32> {
            catching(&mut caller, |b| {
                let name = b.read_str(nptr, nlen)?;
                let method = b.value("call_method", obj)?.get_property(&name)?;
                let args = b.read_args(args_ptr, args_len)?;
                let result = apply(b, &method, &args)?;
                Ok(b.alloc(result)?)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "construct",
        |mut caller: Caller<'_, HostState>,
         ctor: u32,
         args_ptr: u32,
         args_len: u32|
         -> anyhow::Result<u32> {
            catching(&mut caller, |b| {
                let ctor = b.value("construct", ctor)?;
                let args = b.read_args(args_ptr, args_len)?;
                let result = match ctor.as_callable() {
                    Some(callable) => callable.construct(b, &args)?,
                    None => {
                        return Err(CallError::type_error(format!(
                            "{} is not a constructor",
                            ctor.debug_string()
                        )))
                    }
                };
                Ok(b.alloc(result)?)
            })
        },
    )?;

    register_type_test(linker, module, "is_object", HostValue::is_object)?;
    register_type_test(linker, module, "is_function", HostValue::is_function)?;
    register_type_test(linker, module, "is_string", HostValue::is_string)?;
    register_type_test(linker, module, "is_undefined", HostValue::is_undefined)?;
    register_type_test(linker, module, "is_null", HostValue::is_null)?;

    linker.func_wrap(
        module,
        "global_get",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<u32> {
            catching(&mut caller, |b| {
                let name = b.read_str(ptr, len)?;
                let value = b.state().globals.get(&name).unwrap_or_default();
                Ok(b.alloc(value)?)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "json_parse",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<u32> {
            catching(&mut caller, |b| {
                let text = b.read_str(ptr, len)?;
                let value = json::parse(&text)?;
                Ok(b.alloc(value)?)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "json_serialize",
        |mut caller: Caller<'_, HostState>, ret: u32, h: u32| -> anyhow::Result<()> {
            catching(&mut caller, |b| {
                let text = json::stringify(&b.value("json_serialize", h)?)?;
                Ok(b.return_str(ret, &text)?)
            })
        },
    )?;

    linker.func_wrap(
        module,
        "debug_string",
        |mut caller: Caller<'_, HostState>, ret: u32, h: u32| -> anyhow::Result<()> {
            strict(&mut caller, |b| {
                let text = b.value("debug_string", h)?.debug_string();
                b.return_str(ret, &text)
            })
        },
    )?;

    Ok(())
}

fn register_type_test(
    linker: &mut Linker<HostState>,
    module: &str,
    name: &'static str,
    test: fn(&HostValue) -> bool,
) -> Result<(), RuntimeError> {
    linker.func_wrap(
        module,
        name,
        move |mut caller: Caller<'_, HostState>, h: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| Ok(test(&b.value(name, h)?) as u32))
        },
    )?;
    Ok(())
}

// ── Errors ──

fn register_errors(linker: &mut Linker<HostState>, module: &str) -> Result<(), RuntimeError> {
    linker.func_wrap(
        module,
        "error_new",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                let message = b.read_str(ptr, len)?;
                b.alloc(HostValue::error("Error", message))
            })
        },
    )?;

    linker.func_wrap(
        module,
        "throw",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> anyhow::Result<()> {
            let message = strict(&mut caller, |b| b.read_str(ptr, len))?;
            raise(&mut caller, HostValue::error("Error", message))
        },
    )?;

    linker.func_wrap(
        module,
        "rethrow",
        |mut caller: Caller<'_, HostState>, h: u32| -> anyhow::Result<()> {
            let value = strict(&mut caller, |b| {
                b.state().handles.take_for("rethrow", Handle(h))
            })?;
            raise(&mut caller, value)
        },
    )?;

    linker.func_wrap(
        module,
        "exn_take",
        |mut caller: Caller<'_, HostState>| -> anyhow::Result<u32> {
            strict(&mut caller, |b| match b.state().exception.take() {
                Some(value) => b.alloc(value),
                None => Ok(0),
            })
        },
    )?;

    Ok(())
}

// ── Promises ──

fn register_promises(linker: &mut Linker<HostState>, module: &str) -> Result<(), RuntimeError> {
    // The executor is lent for this call only and runs before it returns.
    linker.func_wrap(
        module,
        "promise_new",
        |mut caller: Caller<'_, HostState>,
         ctx_a: u32,
         ctx_b: u32,
         entry: u32|
         -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                let executor = Rc::new(GuestClosure::borrowed(ctx_a, ctx_b, entry, 2));
                let result = PromiseRef::with_executor(b, &Callable::Guest(executor.clone()));
                executor.invalidate();
                b.alloc(HostValue::Promise(result?))
            })
        },
    )?;

    linker.func_wrap(
        module,
        "promise_resolve",
        |mut caller: Caller<'_, HostState>, v: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                let value = b.value("promise_resolve", v)?;
                let promise = PromiseRef::resolved(&mut b.state().jobs, value);
                b.alloc(HostValue::Promise(promise))
            })
        },
    )?;

    linker.func_wrap(
        module,
        "promise_then",
        |mut caller: Caller<'_, HostState>, p: u32, f: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                let promise = promise_of("promise_then", &b.value("promise_then", p)?)?;
                let on_fulfilled = b.value("promise_then", f)?.as_callable().cloned();
                let derived = promise.then(&mut b.state().jobs, on_fulfilled, None);
                b.alloc(HostValue::Promise(derived))
            })
        },
    )?;

    linker.func_wrap(
        module,
        "promise_then2",
        |mut caller: Caller<'_, HostState>, p: u32, f: u32, r: u32| -> anyhow::Result<u32> {
            strict(&mut caller, |b| {
                let promise = promise_of("promise_then2", &b.value("promise_then2", p)?)?;
                let on_fulfilled = b.value("promise_then2", f)?.as_callable().cloned();
                let on_rejected = b.value("promise_then2", r)?.as_callable().cloned();
                let derived = promise.then(&mut b.state().jobs, on_fulfilled, on_rejected);
                b.alloc(HostValue::Promise(derived))
            })
        },
    )?;

    Ok(())
}
