//! Per-instance mutable state held in the Wasmtime Store.
//!
//! `HostState` owns everything one guest instance can name: the handle
//! table, the view cache, the exception register and the job queue.
//! `Boundary` is the adapter-side view of a store: it implements the core
//! crate's `GuestHeap` and `CallContext` so the codec, closures and promises
//! run unchanged against wasmtime.

use wasmtime::{AsContextMut, Func, Ref, StoreContextMut, Table, TypedFunc, Val};

use tether_hostapi::codec::{self, EncodeStrategy};
use tether_hostapi::{
    BridgeError, CallContext, CallError, GuestHeap, Handle, HandleTable, HostValue, JobQueue,
    ObjectRef, Region, ViewCache,
};

use crate::memory::GuestMemory;

/// Guest exports the bridge calls back into.
#[derive(Clone, Default)]
pub struct GuestExports {
    pub malloc: Option<TypedFunc<u32, u32>>,
    pub realloc: Option<TypedFunc<(u32, u32, u32), u32>>,
    pub table: Option<Table>,
}

/// Per-instance mutable state held in the Wasmtime `Store`.
pub struct HostState {
    /// Host values the guest holds handles to.
    pub handles: HandleTable,
    /// Views over the current memory region.
    pub views: ViewCache,
    /// The most recent value thrown through a catching adapter.
    pub exception: Option<HostValue>,
    /// A value the guest threw, in flight while the guest unwinds.
    pub pending_throw: Option<HostValue>,
    /// Reactions waiting for `run_until_idle`.
    pub jobs: JobQueue,
    /// Object behind `global_get`.
    pub globals: ObjectRef,
    pub(crate) memory: Option<GuestMemory>,
    pub(crate) exports: GuestExports,
}

impl HostState {
    pub fn new(max_handles: usize, globals: ObjectRef) -> Self {
        Self {
            handles: HandleTable::with_limit(max_handles),
            views: ViewCache::new(),
            exception: None,
            pending_throw: None,
            jobs: JobQueue::new(),
            globals,
            memory: None,
            exports: GuestExports::default(),
        }
    }

    /// Park a thrown value in the exception register, releasing the old one.
    pub fn set_exception(&mut self, value: HostValue) {
        if let Some(old) = self.exception.replace(value) {
            log::debug!("exception register overwritten, dropping {}", old.debug_string());
        }
    }
}

/// A store borrowed for the duration of one boundary call.
pub struct Boundary<'c> {
    cx: StoreContextMut<'c, HostState>,
}

impl<'c> Boundary<'c> {
    pub fn new(cx: StoreContextMut<'c, HostState>) -> Self {
        Self { cx }
    }

    pub fn state(&mut self) -> &mut HostState {
        self.cx.data_mut()
    }

    /// Clone the value behind handle `h`.
    pub fn value(&mut self, op: &'static str, h: u32) -> Result<HostValue, BridgeError> {
        self.state().handles.get_for(op, Handle(h)).cloned()
    }

    /// Hand `value` to the guest as a handle. Primitives with a reserved
    /// handle never consume a slot.
    pub fn alloc(&mut self, value: HostValue) -> Result<u32, BridgeError> {
        let handle = match value {
            HostValue::Undefined => Handle::UNDEFINED,
            HostValue::Null => Handle::NULL,
            HostValue::Bool(b) => Handle::of_bool(b),
            value => self.state().handles.allocate(value)?,
        };
        Ok(handle.0)
    }

    /// Decode a guest UTF-8 range.
    pub fn read_str(&mut self, ptr: u32, len: u32) -> Result<String, BridgeError> {
        codec::decode_from_guest(self, ptr, len)
    }

    /// Resolve an argument array of handles.
    pub fn read_args(&mut self, ptr: u32, len: u32) -> Result<Vec<HostValue>, BridgeError> {
        let handles = codec::read_handles(self, ptr, len)?;
        handles
            .into_iter()
            .map(|h| self.value("args", h.0))
            .collect()
    }

    /// Encode `s` into a fresh guest buffer and write `(ptr, len)` at `ret`.
    /// Without a guest `realloc` the string goes into one exact allocation.
    pub fn return_str(&mut self, ret: u32, s: &str) -> Result<(), BridgeError> {
        let strategy = match self.state().exports.realloc {
            Some(_) => EncodeStrategy::AsciiFastPath,
            None => EncodeStrategy::Exact,
        };
        let slice = codec::encode_to_guest(self, s, strategy)?;
        codec::write_slice_ret(self, ret, slice)
    }

    /// Map a trap out of guest code back onto the bridge's error model.
    pub fn settle_trap(&mut self, err: anyhow::Error) -> CallError {
        settle_trap(self.state(), err)
    }

    fn exports(&mut self) -> GuestExports {
        self.state().exports.clone()
    }

    fn table_func(&mut self, index: u32) -> Result<Func, BridgeError> {
        let table = self
            .exports()
            .table
            .ok_or_else(|| BridgeError::MissingExport("function table".into()))?;
        match table.get(&mut self.cx, index.into()) {
            Some(Ref::Func(Some(f))) => Ok(f),
            _ => Err(BridgeError::Protocol(format!(
                "table entry {index} is not a function"
            ))),
        }
    }

    fn call_table(&mut self, index: u32, params: &[Val]) -> Result<Option<Val>, CallError> {
        let func = self.table_func(index)?;
        let results_len = func.ty(&self.cx).results().len();
        let mut results = vec![Val::I32(0); results_len];
        match func.call(&mut self.cx, params, &mut results) {
            Ok(()) => Ok(results.into_iter().next()),
            Err(err) => Err(self.settle_trap(err)),
        }
    }
}

/// Classify a trap: a value the guest threw, a bridge fault raised by an
/// adapter, or a trap of the guest's own.
pub(crate) fn settle_trap(state: &mut HostState, err: anyhow::Error) -> CallError {
    if let Some(thrown) = state.pending_throw.take() {
        return CallError::Thrown(thrown);
    }
    match err.downcast_ref::<BridgeError>() {
        Some(fault) => CallError::Fault(fault.clone()),
        None => CallError::Fault(BridgeError::GuestTrap(format!("{err:#}"))),
    }
}

fn trap(err: anyhow::Error) -> BridgeError {
    match err.downcast_ref::<BridgeError>() {
        Some(fault) => fault.clone(),
        None => BridgeError::GuestTrap(format!("{err:#}")),
    }
}

impl GuestHeap for Boundary<'_> {
    fn malloc(&mut self, size: u32) -> Result<u32, BridgeError> {
        let malloc = self
            .exports()
            .malloc
            .ok_or_else(|| BridgeError::MissingExport("tether_malloc".into()))?;
        malloc.call(&mut self.cx, size).map_err(trap)
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32) -> Result<u32, BridgeError> {
        let realloc = self
            .exports()
            .realloc
            .ok_or_else(|| BridgeError::MissingExport("tether_realloc".into()))?;
        realloc
            .call(&mut self.cx, (ptr, old_size, new_size))
            .map_err(trap)
    }

    fn memory(&mut self) -> Result<(Region<'_>, &mut ViewCache), BridgeError> {
        let private = match &self.state().memory {
            Some(GuestMemory::Private(memory)) => Some(*memory),
            Some(GuestMemory::Shared(_)) => None,
            None => return Err(BridgeError::NoMemory),
        };
        if let Some(memory) = private {
            let (bytes, state) = memory.data_and_store_mut(&mut self.cx);
            return Ok((Region::Private(bytes), &mut state.views));
        }
        let state = self.state();
        match &state.memory {
            Some(GuestMemory::Shared(region)) => {
                Ok((Region::Shared(region.data()), &mut state.views))
            }
            _ => Err(BridgeError::NoMemory),
        }
    }
}

impl CallContext for Boundary<'_> {
    fn call_guest(
        &mut self,
        entry: u32,
        a: u32,
        b: u32,
        args: &[HostValue],
    ) -> Result<HostValue, CallError> {
        let mut params = vec![Val::I32(a as i32), Val::I32(b as i32)];
        for arg in args {
            params.push(Val::I32(self.alloc(arg.clone())? as i32));
        }
        match self.call_table(entry, &params)? {
            Some(Val::I32(h)) if h != 0 => Ok(self
                .state()
                .handles
                .take_for("closure result", Handle(h as u32))?),
            _ => Ok(HostValue::Undefined),
        }
    }

    fn destroy_guest(&mut self, dtor: u32, a: u32, b: u32) -> Result<(), BridgeError> {
        match self.call_table(dtor, &[Val::I32(a as i32), Val::I32(b as i32)]) {
            Ok(_) => Ok(()),
            Err(CallError::Fault(fault)) => Err(fault),
            Err(CallError::Thrown(value)) => Err(BridgeError::GuestTrap(format!(
                "closure destructor threw {}",
                value.debug_string()
            ))),
        }
    }

    fn jobs(&mut self) -> &mut JobQueue {
        &mut self.state().jobs
    }
}

impl<'c, T> From<&'c mut T> for Boundary<'c>
where
    T: AsContextMut<Data = HostState>,
{
    fn from(store: &'c mut T) -> Self {
        Self::new(store.as_context_mut())
    }
}
