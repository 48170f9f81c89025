//! String and byte marshaling across the boundary.
//!
//! Strings cross as `(ptr, len)` pairs of UTF-8 in guest memory. Encoding
//! allocates through the guest's own allocator, and because allocation can
//! grow the memory, every write re-fetches the region and its byte view
//! immediately before touching it.
//!
//! Decoding is strict. This bridge only ever writes valid UTF-8, so a
//! malformed sequence on read means corruption or a contract violation
//! upstream and is reported as a fault, never replaced.

use crate::error::BridgeError;
use crate::handles::Handle;
use crate::traits::GuestHeap;
use crate::views::View;

/// A guest-owned buffer produced by the codec. The guest frees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestSlice {
    pub ptr: u32,
    pub len: u32,
    /// Bytes actually allocated; at least `len`.
    pub capacity: u32,
}

/// How [`encode_to_guest`] sizes its allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeStrategy {
    /// One allocation of exactly the encoded length.
    Exact,
    /// Allocate the host string length, copy the ASCII prefix, and only
    /// reallocate to the worst case once a non-ASCII character shows up.
    #[default]
    AsciiFastPath,
}

fn to_u32(n: usize, what: &str) -> Result<u32, BridgeError> {
    u32::try_from(n)
        .map_err(|_| BridgeError::ResourceExhausted(format!("{what} of {n} bytes exceeds guest address space")))
}

/// Encode `s` into a fresh guest allocation.
pub fn encode_to_guest<H: GuestHeap + ?Sized>(
    heap: &mut H,
    s: &str,
    strategy: EncodeStrategy,
) -> Result<GuestSlice, BridgeError> {
    match strategy {
        EncodeStrategy::Exact => pass_bytes(heap, s.as_bytes()),
        EncodeStrategy::AsciiFastPath => encode_ascii_fast_path(heap, s),
    }
}

fn encode_ascii_fast_path<H: GuestHeap + ?Sized>(
    heap: &mut H,
    s: &str,
) -> Result<GuestSlice, BridgeError> {
    let mut capacity = to_u32(s.encode_utf16().count(), "string")?;
    let mut ptr = heap.malloc(capacity)?;

    let bytes = s.as_bytes();
    let prefix = bytes.iter().take_while(|b| b.is_ascii()).count();
    {
        let (mut mem, views) = heap.memory()?;
        views.view_u8(&mem).write(&mut mem, ptr, &bytes[..prefix])?;
    }

    if prefix < bytes.len() {
        // `prefix` sits on a char boundary: non-ASCII bytes only occur inside
        // multi-byte sequences, and the first one starts a sequence.
        let rest = &s[prefix..];
        let worst = prefix + rest.encode_utf16().count() * 3;
        let worst = to_u32(worst, "string")?;
        ptr = heap.realloc(ptr, capacity, worst)?;
        capacity = worst;

        let (mut mem, views) = heap.memory()?;
        views
            .view_u8(&mem)
            .write(&mut mem, ptr + prefix as u32, rest.as_bytes())?;
    }

    Ok(GuestSlice {
        ptr,
        len: to_u32(bytes.len(), "string")?,
        capacity,
    })
}

/// Decode the UTF-8 range `[ptr, ptr + len)` of guest memory.
pub fn decode_from_guest<H: GuestHeap + ?Sized>(
    heap: &mut H,
    ptr: u32,
    len: u32,
) -> Result<String, BridgeError> {
    let (mem, views) = heap.memory()?;
    let raw = views.view_u8(&mem).read(&mem, ptr, len)?;
    String::from_utf8(raw).map_err(|e| BridgeError::Encoding {
        ptr,
        len,
        reason: e.utf8_error().to_string(),
    })
}

/// Copy `bytes` into a fresh guest allocation of exactly their length.
pub fn pass_bytes<H: GuestHeap + ?Sized>(
    heap: &mut H,
    bytes: &[u8],
) -> Result<GuestSlice, BridgeError> {
    let len = to_u32(bytes.len(), "buffer")?;
    let ptr = heap.malloc(len)?;
    let (mut mem, views) = heap.memory()?;
    views.view_u8(&mem).write(&mut mem, ptr, bytes)?;
    Ok(GuestSlice {
        ptr,
        len,
        capacity: len,
    })
}

/// Copy `[ptr, ptr + len)` out of guest memory.
pub fn read_bytes<H: GuestHeap + ?Sized>(
    heap: &mut H,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>, BridgeError> {
    let (mem, views) = heap.memory()?;
    views.view_u8(&mem).read(&mem, ptr, len)
}

/// Copy `bytes` into guest memory at `ptr` (an existing guest buffer).
pub fn write_bytes<H: GuestHeap + ?Sized>(
    heap: &mut H,
    ptr: u32,
    bytes: &[u8],
) -> Result<(), BridgeError> {
    let (mut mem, views) = heap.memory()?;
    views.view_u8(&mem).write(&mut mem, ptr, bytes)
}

/// Read an array of `len` handles stored as `u32`s at `ptr`.
pub fn read_handles<H: GuestHeap + ?Sized>(
    heap: &mut H,
    ptr: u32,
    len: u32,
) -> Result<Vec<Handle>, BridgeError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let base = View::<u32>::index_of(ptr)?;
    let (mem, views) = heap.memory()?;
    let view = views.view_u32(&mem);
    (0..len as usize)
        .map(|i| view.get(&mem, base + i).map(Handle))
        .collect()
}

/// Write a `(ptr, len)` pair into the 8-byte return area at `ret`.
pub fn write_slice_ret<H: GuestHeap + ?Sized>(
    heap: &mut H,
    ret: u32,
    slice: GuestSlice,
) -> Result<(), BridgeError> {
    let idx = View::<i32>::index_of(ret)?;
    let (mut mem, views) = heap.memory()?;
    let view = views.view_i32(&mem);
    view.set(&mut mem, idx, slice.ptr as i32)?;
    view.set(&mut mem, idx + 1, slice.len as i32)
}

/// Write an optional number into the 16-byte return area at `ret`: an `i32`
/// presence flag at offset 0 and the `f64` at offset 8.
pub fn write_number_ret<H: GuestHeap + ?Sized>(
    heap: &mut H,
    ret: u32,
    value: Option<f64>,
) -> Result<(), BridgeError> {
    let flag_idx = View::<i32>::index_of(ret)?;
    let num_idx = View::<f64>::index_of(ret)? + 1;
    let (mut mem, views) = heap.memory()?;
    views
        .view_f64(&mem)
        .set(&mut mem, num_idx, value.unwrap_or(0.0))?;
    views
        .view_i32(&mem)
        .set(&mut mem, flag_idx, value.is_some() as i32)
}
