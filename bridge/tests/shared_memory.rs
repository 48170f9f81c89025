//! One shared linear memory, two instances on two threads.

mod common;

use common::*;
use tether_bridge::{MemoryPlan, MemorySource};
use tether_hostapi::HostValue;

fn shared_guest() -> String {
    let imports = [
        import("string_new", "(param i32 i32) (result i32)"),
        import("string_get", "(param i32 i32)"),
        import("bytes_new", "(param i32 i32) (result i32)"),
        import("bytes_copy_to", "(param i32 i32)"),
    ]
    .concat();
    let body = r#"
  (func (export "encode") (param $h i32) (result i32)
    (call $string_get (i32.const 8) (local.get $h))
    (i32.load (i32.const 8)))
  (func (export "encoded_len") (result i32)
    (i32.load (i32.const 12)))
  (func (export "decode") (param $ptr i32) (param $len i32) (result i32)
    (call $string_new (local.get $ptr) (local.get $len)))
  (func (export "copy_bytes") (param $h i32) (param $dst i32)
    (call $bytes_copy_to (local.get $h) (local.get $dst)))
  (func (export "wrap_bytes") (param $ptr i32) (param $len i32) (result i32)
    (call $bytes_new (local.get $ptr) (local.get $len)))
"#;
    guest_importing_memory("(memory 1 100 shared)", &imports, body)
}

#[test]
fn test_shared_plan_detected() {
    let bridge = bridge(&shared_guest());
    assert_eq!(
        bridge.memory_plan(),
        MemoryPlan::Import {
            shared: true,
            minimum: 1,
            maximum: Some(100)
        }
    );
}

#[test]
fn test_worker_reads_what_main_wrote() {
    let bridge = bridge(&shared_guest());
    let mut main = bridge.instantiate(MemorySource::Fresh).unwrap();
    let region = main.shared_memory().expect("memory is shared");

    let text = "shared → worker";
    let h = main.alloc(HostValue::string(text)).unwrap();
    let ptr: u32 = main.call("encode", h).unwrap();
    let len: u32 = main.call("encoded_len", ()).unwrap();
    assert_eq!(len as usize, text.len());

    let decoded = std::thread::scope(|s| {
        s.spawn(|| {
            let mut worker = bridge
                .instantiate(MemorySource::Shared(region.clone()))
                .unwrap();
            assert_eq!(worker.memory_size(), region.data_size());

            // The return area main wrote is visible here too.
            let seen_len: u32 = worker.call("encoded_len", ()).unwrap();
            assert_eq!(seen_len, len);

            let h: u32 = worker.call("decode", (ptr, len)).unwrap();
            worker
                .value(h)
                .and_then(|v| v.as_str().map(str::to_string))
        })
        .join()
        .unwrap()
    });

    assert_eq!(decoded.as_deref(), Some(text));
}

#[test]
fn test_instances_keep_separate_handle_tables() {
    let bridge = bridge(&shared_guest());
    let mut a = bridge.instantiate(MemorySource::Fresh).unwrap();
    let region = a.shared_memory().unwrap();
    let mut b = bridge.instantiate(MemorySource::Shared(region)).unwrap();

    let h = a.alloc(HostValue::string("only in a")).unwrap();
    assert!(a.value(h).is_some());
    assert!(b.value(h).is_none());
    assert_eq!(b.handles().live(), 0);

    // Same bytes, so b can decode what a encoded.
    let ptr: u32 = a.call("encode", h).unwrap();
    let len: u32 = b.call("encoded_len", ()).unwrap();
    let hb: u32 = b.call("decode", (ptr, len)).unwrap();
    assert_eq!(b.value(hb), Some(HostValue::string("only in a")));
}

#[test]
fn test_adapters_copy_through_shared_region() {
    let bridge = bridge(&shared_guest());
    let mut main = bridge.instantiate(MemorySource::Fresh).unwrap();
    let region = main.shared_memory().unwrap();

    let payload: Vec<u8> = (0..=255u8).collect();
    let h = main.alloc(HostValue::bytes(payload.clone())).unwrap();
    main.call::<(u32, u32), ()>("copy_bytes", (h, 8192)).unwrap();

    let text = "gr\u{f6}\u{df}e \u{2192} \u{6771}\u{4eac}";
    let (seen, ptr) = std::thread::scope(|s| {
        s.spawn(|| {
            let mut worker = bridge
                .instantiate(MemorySource::Shared(region.clone()))
                .unwrap();
            let wrapped: u32 = worker.call("wrap_bytes", (8192u32, 256u32)).unwrap();
            let seen = match worker.value(wrapped) {
                Some(HostValue::Bytes(bytes)) => bytes.to_vec(),
                other => panic!("expected bytes, got {other:?}"),
            };

            // Non-ASCII takes the realloc path, all of it in shared memory.
            let h = worker.alloc(HostValue::string(text)).unwrap();
            let ptr: u32 = worker.call("encode", h).unwrap();
            (seen, ptr)
        })
        .join()
        .unwrap()
    });
    assert_eq!(seen, payload);

    let len: u32 = main.call("encoded_len", ()).unwrap();
    let decoded: u32 = main.call("decode", (ptr, len)).unwrap();
    assert_eq!(main.value(decoded), Some(HostValue::string(text)));
}
