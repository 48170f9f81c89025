//! Platform passthroughs: console, randomness, globals.

mod common;

use common::*;
use tether_hostapi::{BridgeError, Callable, HostValue};

fn platform_guest() -> String {
    let imports = [
        import("console_log", "(param i32 i32 i32)"),
        import("random_fill", "(param i32 i32)"),
        import("global_get", "(param i32 i32) (result i32)"),
        import("call_method", "(param i32 i32 i32 i32 i32) (result i32)"),
        import("bytes_new", "(param i32 i32) (result i32)"),
        import("exn_take", "(result i32)"),
    ]
    .concat();
    let body = r#"
  (data (i32.const 16) "hello from the guest")
  (data (i32.const 48) "console")
  (data (i32.const 56) "log")
  (data (i32.const 64) "crypto")
  (data (i32.const 72) "getRandomValues")
  (data (i32.const 96) "missing")
  (global $args i32 (i32.const 128))

  (func (export "log") (param $level i32)
    (call $console_log (local.get $level) (i32.const 16) (i32.const 20)))
  (func (export "random") (param $ptr i32) (param $len i32)
    (call $random_fill (local.get $ptr) (local.get $len)))
  (func (export "read_word") (param $ptr i32) (result i32)
    (i32.load (local.get $ptr)))

  (func (export "console_log_via_global") (param $msg i32) (result i32)
    (i32.store (global.get $args) (local.get $msg))
    (call $call_method
      (call $global_get (i32.const 48) (i32.const 7))
      (i32.const 56) (i32.const 3)
      (global.get $args) (i32.const 1)))

  (func (export "random_bytes") (result i32)
    (i32.store (global.get $args) (call $bytes_new (i32.const 200) (i32.const 16)))
    (call $call_method
      (call $global_get (i32.const 64) (i32.const 6))
      (i32.const 72) (i32.const 15)
      (global.get $args) (i32.const 1)))

  (func (export "missing_global") (result i32)
    (call $global_get (i32.const 96) (i32.const 7)))
  (func (export "take") (result i32)
    (call $exn_take))
"#;
    guest(&imports, body)
}

#[test]
fn test_console_log_accepts_every_level() {
    let mut inst = instance(&platform_guest());
    for level in 0..6u32 {
        inst.call::<u32, ()>("log", level).unwrap();
    }
}

#[test]
fn test_random_fill_writes_guest_memory() {
    let mut inst = instance(&platform_guest());
    inst.call::<(u32, u32), ()>("random", (512, 64)).unwrap();
    // 64 random bytes are all zero with negligible probability.
    let words: Vec<u32> = (0..16)
        .map(|i| inst.call::<u32, u32>("read_word", 512 + 4 * i).unwrap())
        .collect();
    assert!(words.iter().any(|w| *w != 0));
    assert!(inst.take_exception().is_none());
}

#[test]
fn test_random_fill_out_of_bounds_is_a_fault() {
    let mut inst = instance(&platform_guest());
    for (ptr, len) in [(65530, 64), (0, u32::MAX), (u32::MAX, 1)] {
        let err = inst
            .call::<(u32, u32), ()>("random", (ptr, len))
            .err()
            .expect("out-of-bounds fill must fault");
        assert!(
            matches!(err.as_bridge(), Some(BridgeError::OutOfBounds { .. })),
            "unexpected error: {err}"
        );
    }
}

#[test]
fn test_console_reachable_through_globals() {
    let mut inst = instance(&platform_guest());
    let msg = inst.alloc(HostValue::string("via console.log")).unwrap();
    let out: u32 = inst.call("console_log_via_global", msg).unwrap();
    assert_eq!(inst.value(out), Some(HostValue::Undefined));
    assert!(inst.take_exception().is_none());
}

#[test]
fn test_crypto_get_random_values() {
    let mut inst = instance(&platform_guest());
    let h = call_handle(&mut inst, "random_bytes").unwrap();
    match inst.value(h) {
        Some(HostValue::Bytes(bytes)) => {
            assert_eq!(bytes.len(), 16);
            assert!(bytes.to_vec().iter().any(|b| *b != 0));
        }
        other => panic!("expected bytes, got {other:?}"),
    }
}

#[test]
fn test_missing_global_is_undefined() {
    let mut inst = instance(&platform_guest());
    let h = call_handle(&mut inst, "missing_global").unwrap();
    assert_eq!(inst.value(h), Some(HostValue::Undefined));
}

#[test]
fn test_installed_global_is_visible() {
    let mut inst = instance(&platform_guest());
    let calls = std::rc::Rc::new(std::cell::Cell::new(0));
    let counter = calls.clone();
    let console = HostValue::object();
    console
        .set_property(
            "log",
            Callable::native("log", move |_, _| {
                counter.set(counter.get() + 1);
                Ok(HostValue::Undefined)
            })
            .into(),
        )
        .unwrap();
    inst.install_global("console", console);

    let msg = inst.alloc(HostValue::string("intercepted")).unwrap();
    inst.call::<u32, u32>("console_log_via_global", msg).unwrap();
    assert_eq!(calls.get(), 1);
}
