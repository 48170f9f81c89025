//! Guest linear memory negotiation.
//!
//! A guest either exports its own memory or imports one from the bridge.
//! An imported memory is sized from the module's declared limits and the
//! bridge configuration: at least `initial_pages` and the declared minimum,
//! at most `max_pages` and the declared maximum. A shared import can be
//! backed by a region another instance already uses; that is how worker
//! threads see the same bytes.

use wasmtime::{
    AsContext, AsContextMut, Engine, Extern, ExternType, Instance, Memory, MemoryType, Module,
    SharedMemory,
};

use crate::config::BridgeConfig;
use crate::error::RuntimeError;

/// The memory an instance reads and writes through.
#[derive(Clone)]
pub enum GuestMemory {
    Private(Memory),
    Shared(SharedMemory),
}

impl GuestMemory {
    /// Current size in bytes.
    pub fn data_size(&self, store: impl AsContext) -> usize {
        match self {
            Self::Private(m) => m.data_size(&store),
            Self::Shared(s) => s.data_size(),
        }
    }

    pub fn as_shared(&self) -> Option<&SharedMemory> {
        match self {
            Self::Shared(s) => Some(s),
            Self::Private(_) => None,
        }
    }

    /// Look up the instance's exported memory, private or shared.
    pub fn exported(instance: &Instance, mut store: impl AsContextMut, name: &str) -> Option<Self> {
        if let Some(m) = instance.get_memory(&mut store, name) {
            return Some(Self::Private(m));
        }
        instance.get_shared_memory(&mut store, name).map(Self::Shared)
    }
}

/// Where an instance's memory comes from.
#[derive(Clone, Default)]
pub enum MemorySource {
    /// Create a region of the size the module asks for.
    #[default]
    Fresh,
    /// Reuse a shared region, typically one created by another instance.
    Shared(SharedMemory),
}

/// What the module declares about its memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryPlan {
    /// The module defines and exports its own memory.
    Exported,
    /// The module imports `memory` from the adapter module.
    Import {
        shared: bool,
        minimum: u64,
        maximum: Option<u64>,
    },
}

impl MemoryPlan {
    /// Inspect `module`'s memory import, if it has one.
    pub fn of(module: &Module, config: &BridgeConfig) -> Self {
        module
            .imports()
            .filter(|i| i.module() == config.import_module && i.name() == "memory")
            .find_map(|i| match i.ty() {
                ExternType::Memory(mt) => Some(Self::Import {
                    shared: mt.is_shared(),
                    minimum: mt.minimum(),
                    maximum: mt.maximum(),
                }),
                _ => None,
            })
            .unwrap_or(Self::Exported)
    }
}

/// Compute `(initial, maximum)` pages for an imported memory.
pub fn negotiate_pages(
    minimum: u64,
    maximum: Option<u64>,
    config: &BridgeConfig,
) -> Result<(u32, u32), RuntimeError> {
    let cap = maximum
        .unwrap_or(u64::MAX)
        .min(config.max_pages as u64);
    if minimum > cap {
        return Err(RuntimeError::MemoryError(format!(
            "module needs at least {minimum} pages but at most {cap} are allowed"
        )));
    }
    let initial = minimum.max(config.initial_pages as u64).min(cap);
    Ok((initial as u32, cap as u32))
}

/// Create or adopt the memory the module imports. Returns `None` when the
/// module exports its own memory, which is only known after instantiation.
pub fn provide(
    engine: &Engine,
    mut store: impl AsContextMut,
    plan: &MemoryPlan,
    source: MemorySource,
    config: &BridgeConfig,
) -> Result<Option<(Extern, GuestMemory)>, RuntimeError> {
    match (plan, source) {
        (MemoryPlan::Exported, MemorySource::Fresh) => Ok(None),
        (MemoryPlan::Exported, MemorySource::Shared(_)) => Err(RuntimeError::MemoryError(
            "module defines its own memory; a shared region cannot be supplied".into(),
        )),
        (MemoryPlan::Import { shared: false, .. }, MemorySource::Shared(_)) => {
            Err(RuntimeError::MemoryError(
                "module imports a private memory; a shared region cannot be supplied".into(),
            ))
        }
        (MemoryPlan::Import { shared: true, .. }, MemorySource::Shared(region)) => {
            Ok(Some((region.clone().into(), GuestMemory::Shared(region))))
        }
        (
            MemoryPlan::Import {
                shared,
                minimum,
                maximum,
            },
            MemorySource::Fresh,
        ) => {
            let (initial, max) = negotiate_pages(*minimum, *maximum, config)?;
            if *shared {
                let region = SharedMemory::new(engine, MemoryType::shared(initial, max))?;
                Ok(Some((region.clone().into(), GuestMemory::Shared(region))))
            } else {
                let memory = Memory::new(&mut store, MemoryType::new(initial, Some(max)))?;
                Ok(Some((memory.into(), GuestMemory::Private(memory))))
            }
        }
    }
}
