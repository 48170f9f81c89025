//! WASM module validation: guest ABI compatibility checks.
//!
//! Validates a compiled module before it is instantiated. Checks:
//!
//! 1. All imports come from the adapter module
//! 2. Every function import names a known adapter
//! 3. The only non-function import is `memory`
//! 4. The module has a memory, imported or exported
//! 5. Allocator, table and start exports, where present, have the right types

use wasmtime::{ExternType, Module, ValType};

use crate::config::BridgeConfig;
use crate::error::RuntimeError;
use crate::linker::ADAPTERS;

/// Optional function exports: (name, i32 param count, i32 result count).
const TYPED_EXPORTS: &[(&str, usize, usize)] = &[
    ("tether_malloc", 1, 1),
    ("tether_realloc", 3, 1),
    ("tether_free", 2, 0),
];

fn is_i32(vt: &ValType) -> bool {
    matches!(vt, ValType::I32)
}

/// Validate that a module can be linked against the bridge.
pub fn validate_module(module: &Module, config: &BridgeConfig) -> Result<(), RuntimeError> {
    let imports_memory = validate_imports(module, config)?;
    validate_exports(module, config, imports_memory)?;
    Ok(())
}

/// Returns whether the module imports its memory.
fn validate_imports(module: &Module, config: &BridgeConfig) -> Result<bool, RuntimeError> {
    let mut imports_memory = false;
    for import in module.imports() {
        let module_name = import.module();
        if module_name != config.import_module {
            return Err(RuntimeError::ValidationError(format!(
                "import from unknown module '{}' (only '{}' allowed): {}",
                module_name,
                config.import_module,
                import.name()
            )));
        }

        match import.ty() {
            ExternType::Func(_) => {
                if !ADAPTERS.contains(&import.name()) {
                    return Err(RuntimeError::ValidationError(format!(
                        "unknown adapter: {}::{}",
                        module_name,
                        import.name()
                    )));
                }
            }
            ExternType::Memory(_) if import.name() == "memory" => imports_memory = true,
            _ => {
                return Err(RuntimeError::ValidationError(format!(
                    "non-function import not allowed: {}::{}",
                    module_name,
                    import.name()
                )));
            }
        }
    }
    Ok(imports_memory)
}

fn validate_exports(
    module: &Module,
    config: &BridgeConfig,
    imports_memory: bool,
) -> Result<(), RuntimeError> {
    let exports_memory = module
        .exports()
        .any(|e| e.name() == config.memory_export && matches!(e.ty(), ExternType::Memory(_)));
    if !imports_memory && !exports_memory {
        return Err(RuntimeError::ValidationError(format!(
            "module must export '{}' or import '{}::memory'",
            config.memory_export, config.import_module
        )));
    }

    let mut expected: Vec<(&str, usize, usize)> = TYPED_EXPORTS.to_vec();
    expected.push((config.start_export.as_str(), 0, 0));
    for (name, param_count, result_count) in expected {
        let Some(export) = module.exports().find(|e| e.name() == name) else {
            continue;
        };
        let func_ty = match export.ty() {
            ExternType::Func(ft) => ft,
            _ => {
                return Err(RuntimeError::ValidationError(format!(
                    "export '{}' must be a function",
                    name
                )));
            }
        };
        let params: Vec<ValType> = func_ty.params().collect();
        let results: Vec<ValType> = func_ty.results().collect();
        if params.len() != param_count
            || !params.iter().all(is_i32)
            || results.len() != result_count
            || !results.iter().all(is_i32)
        {
            return Err(RuntimeError::ValidationError(format!(
                "export '{}' has wrong signature: expected {} i32 params and {} i32 results",
                name, param_count, result_count
            )));
        }
    }

    if let Some(table) = module.exports().find(|e| e.name() == config.table_export) {
        if !matches!(table.ty(), ExternType::Table(_)) {
            return Err(RuntimeError::ValidationError(format!(
                "export '{}' must be a table",
                config.table_export
            )));
        }
    }

    Ok(())
}
