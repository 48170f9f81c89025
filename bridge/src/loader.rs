//! Module loading: fetch, compile, link, start.
//!
//! A module arrives as raw bytes, a file, or a fetched response. Files take
//! wasmtime's compile-from-file path, which maps the file instead of
//! buffering it. A response body cannot be handed to the engine as a
//! stream, so it is always buffered; a response without the
//! `application/wasm` content type is still accepted, with a warning.
//!
//! [`Loader`] drives one instance through the phases
//! `Uninitialized → Fetching → Compiling → Linked → Started` and makes the
//! current phase observable.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use wasmtime::{Engine, Module};

use crate::config::BridgeConfig;
use crate::error::RuntimeError;
use crate::memory::MemorySource;
use crate::runtime::{Bridge, GuestInstance};

/// MIME type a streaming-capable module response carries.
pub const WASM_CONTENT_TYPE: &str = "application/wasm";

/// Where a module comes from.
pub enum ModuleSource {
    /// Binary or text module bytes already in memory.
    Bytes(Vec<u8>),
    /// A module file on disk.
    File(PathBuf),
    /// A fetched response body.
    Response {
        content_type: Option<String>,
        body: Box<dyn Read + Send>,
    },
}

impl fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::File(path) => write!(f, "File({})", path.display()),
            Self::Response { content_type, .. } => write!(f, "Response({content_type:?})"),
        }
    }
}

/// Loader lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Fetching,
    Compiling,
    Linked,
    Started,
}

fn is_wasm_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(WASM_CONTENT_TYPE))
}

/// Fetch and compile `source`, reporting each phase to `on_phase`.
pub(crate) fn compile(
    engine: &Engine,
    source: ModuleSource,
    on_phase: &mut dyn FnMut(Phase),
) -> Result<Module, RuntimeError> {
    on_phase(Phase::Fetching);
    let module = match source {
        ModuleSource::Bytes(bytes) => {
            on_phase(Phase::Compiling);
            Module::new(engine, &bytes)?
        }
        ModuleSource::File(path) => {
            on_phase(Phase::Compiling);
            Module::from_file(engine, &path)?
        }
        ModuleSource::Response {
            content_type,
            mut body,
        } => {
            match content_type.as_deref() {
                Some(ct) if is_wasm_content_type(ct) => {
                    log::debug!("response bodies are not streamed into the engine; buffering");
                }
                other => log::warn!(
                    "module response has content type {other:?}, expected {WASM_CONTENT_TYPE}; \
                     falling back to buffered compilation"
                ),
            }
            let mut bytes = Vec::new();
            body.read_to_end(&mut bytes)?;
            on_phase(Phase::Compiling);
            Module::new(engine, &bytes)?
        }
    };
    Ok(module)
}

/// Drives a single guest instance from source to started.
pub struct Loader {
    config: BridgeConfig,
    phase: Phase,
    bridge: Option<Bridge>,
    instance: Option<GuestInstance>,
}

impl Loader {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            phase: Phase::Uninitialized,
            bridge: None,
            instance: None,
        }
    }

    pub fn phase(&self) -> Phase {
        match &self.instance {
            Some(instance) => instance.phase(),
            None => self.phase,
        }
    }

    /// Fetch, compile, validate and instantiate `source`.
    ///
    /// On failure the loader returns to `Uninitialized` and can be retried.
    pub fn load(
        &mut self,
        source: ModuleSource,
        memory: MemorySource,
    ) -> Result<&mut GuestInstance, RuntimeError> {
        if self.phase() != Phase::Uninitialized {
            return Err(RuntimeError::LoadError(format!(
                "cannot load in phase {:?}",
                self.phase()
            )));
        }

        let config = self.config.clone();
        let phase = &mut self.phase;
        let loaded = Bridge::load_with(source, config, &mut |reached| *phase = reached)
            .and_then(|bridge| {
                let instance = bridge.instantiate(memory)?;
                Ok((bridge, instance))
            });
        match loaded {
            Ok((bridge, instance)) => {
                self.phase = instance.phase();
                self.bridge = Some(bridge);
                Ok(self.instance.insert(instance))
            }
            Err(err) => {
                log::debug!("load failed during {:?}: {err}", self.phase);
                self.phase = Phase::Uninitialized;
                Err(err)
            }
        }
    }

    /// Run the guest start entry point. A second call fails.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        match self.instance.as_mut() {
            Some(instance) => instance.start(),
            None => Err(RuntimeError::LoadError("nothing loaded".into())),
        }
    }

    pub fn bridge(&self) -> Option<&Bridge> {
        self.bridge.as_ref()
    }

    pub fn instance(&mut self) -> Option<&mut GuestInstance> {
        self.instance.as_mut()
    }
}
