//! Bridges: the objects a core module's imports are satisfied with.
//!
//! Three shapes, mirroring where the entities come from: dynamic host
//! functions typed with the importer's declared signature, direct
//! borrows of another module's exports, and synthetic core modules
//! (emitted by [`crate::emit`]) that re-export memories, tables and
//! globals under the names a consumer expects.

use std::sync::Arc;

use indexmap::IndexMap;
use wasmer::{
    AsStoreMut, Extern, Function, FunctionEnv, FunctionEnvMut, FunctionType, RuntimeError, Value,
};

use crate::abi::{
    flatten_all, layout::FlatType, uses_retptr, FlatReader, FlatValue, GuestMemory, LiftContext,
    LowerContext,
};
use crate::component::CanonicalOptions;
use crate::context::{self, HostContext};
use crate::errors::{ComponentError, Error, ErrorKind, Phase};
use crate::instance::{lookup_instance, InstanceCtx};
use crate::registry::FuncDef;
use crate::types::InterfaceType;
use crate::values::InterfaceValue;

fn any_uses_resources(types: &[InterfaceType]) -> bool {
    types.iter().any(InterfaceType::uses_resources)
}

/// A host function resolved at pre-instantiation time, together with
/// everything needed to type and bind it at call time.
#[derive(Debug)]
pub(crate) struct HostBinding {
    /// The registry path the function was resolved from.
    pub path: String,
    /// The resolved definition.
    pub def: Arc<FuncDef>,
    /// Canonical options of the lowering that produced this import.
    pub opts: CanonicalOptions,
    /// Where the bound linear memory lives: `(core instance, export)`.
    pub memory_source: Option<(u32, String)>,
    /// Where the canonical realloc lives: `(core instance, export)`.
    pub realloc_source: Option<(u32, String)>,
}

/// One entity of a virtual instance.
#[derive(Debug, Clone)]
pub(crate) enum Entity {
    /// A borrowed export of an already-instantiated core module.
    ModuleExport {
        /// Owning core-instance index.
        source: u32,
        /// The borrowed extern.
        value: Extern,
    },
    /// A direct borrow of a module's memory.
    DirectMemory {
        /// Owning core-instance index.
        source: u32,
        /// The borrowed memory.
        memory: wasmer::Memory,
    },
    /// A direct borrow of a module's global.
    DirectGlobal {
        /// Owning core-instance index.
        source: u32,
        /// The borrowed global.
        global: wasmer::Global,
    },
    /// A direct borrow of a module's table.
    TableSource {
        /// Owning core-instance index.
        source: u32,
        /// The borrowed table.
        table: wasmer::Table,
    },
    /// A host function pre-bound to a guest memory and allocator.
    BoundHostFunc {
        /// The binding created at pre-instantiation.
        binding: Arc<HostBinding>,
    },
    /// An unresolved import; calling it traps with a descriptive
    /// message.
    TrapFunc {
        /// The import path, for the trap message.
        name: String,
        /// Why it could not be resolved.
        reason: String,
    },
}

/// A named, insertion-ordered collection of entities synthesised from
/// exports of other instances. Insertion order is preserved because it
/// dictates indirect-call table indices visible to the engine.
#[derive(Debug, Default, Clone)]
pub(crate) struct VirtualInstance {
    /// The instance name (its import-module name to consumers).
    pub name: String,
    /// Entities by export name.
    pub entities: IndexMap<String, Entity>,
}

impl VirtualInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: IndexMap::new(),
        }
    }

    /// Whether any entity needs a synthetic module to be realised
    /// (memories, tables and globals cannot come from host shims on
    /// every engine).
    pub fn needs_synthetic_bridge(&self) -> bool {
        self.entities.values().any(|e| {
            matches!(
                e,
                Entity::DirectMemory { .. } | Entity::DirectGlobal { .. } | Entity::TableSource { .. }
            )
        })
    }
}

fn host_error(err: Error) -> RuntimeError {
    RuntimeError::user(Box::new(err))
}

/// Creates the dynamic host [`Function`] for one resolved binding.
///
/// The function is typed with the *importing module's* declared
/// signature, never the registry's: the two differ for lowered
/// canonical functions, where strings and aggregates become pointer
/// pairs and wide results arrive through a trailing retptr parameter.
pub(crate) fn make_host_function(
    store: &mut impl AsStoreMut,
    env: &FunctionEnv<InstanceCtx>,
    core_ty: &FunctionType,
    binding: Arc<HostBinding>,
) -> Function {
    let ty = core_ty.clone();
    Function::new_with_env(store, env, ty, move |env, args| {
        host_trampoline(&binding, env, args).map_err(host_error)
    })
}

/// Creates the trap stub for an unresolved import.
pub(crate) fn make_trap_function(
    store: &mut impl AsStoreMut,
    core_ty: &FunctionType,
    name: &str,
    reason: &str,
) -> Function {
    let message = format!("unresolved host import \"{name}\": {reason}");
    Function::new(store, core_ty.clone(), move |_args| {
        Err(RuntimeError::new(message.clone()))
    })
}

/// The guest-to-host call path: recover the owning instance, bind
/// memory and realloc, lift the guest's flat arguments, run the
/// handler, lower its results back.
fn host_trampoline(
    binding: &HostBinding,
    mut env: FunctionEnvMut<'_, InstanceCtx>,
    args: &[Value],
) -> Result<Vec<Value>, Error> {
    let (data, mut store) = env.data_and_store_mut();

    // Owner recovery: the per-instance environment is the fast path;
    // the ambient cell covers handlers reached without one. Failing
    // both, the handler runs detached and cannot touch guest state.
    let shared = match data.shared() {
        Some(shared) => Some(shared),
        None => context::current_instance().and_then(lookup_instance),
    };

    let (memory, realloc) = data.canonical_pair(&mut store, binding)?;

    let param_types = binding.def.params.clone();
    let result_types = binding.def.results.clone();
    let retptr = uses_retptr(&result_types);
    let expected_flat = flatten_all(&param_types).len() + usize::from(retptr);
    if args.len() != expected_flat {
        return Err(ComponentError::new(
            Phase::Host,
            ErrorKind::TypeMismatch,
            format!(
                "host import `{}` called with {} flat argument(s), expected {expected_flat}",
                binding.path,
                args.len()
            ),
        )
        .into());
    }

    let mut flat_args = Vec::with_capacity(args.len());
    for value in args {
        flat_args.push(FlatValue::from_core(value)?);
    }
    let (flat_params, ret_area) = if retptr {
        let (params, ptr) = flat_args.split_at(flat_args.len() - 1);
        (params.to_vec(), Some(ptr[0].as_ptr()?))
    } else {
        (flat_args, None)
    };

    // Lift the arguments out of guest memory. The resource tables are
    // locked only when handle types force it: lowering may re-enter
    // the guest through realloc, and a handler reached from there must
    // still be able to take the lock.
    let encoding = binding.opts.string_encoding;
    let mut lifted_borrows = Vec::new();
    let lifted = {
        let mem = GuestMemory::new(&mut store, memory.clone(), realloc.clone());
        let mut reader = FlatReader::new(&flat_params);
        if let Some(shared) = shared.as_ref().filter(|_| any_uses_resources(&param_types)) {
            let mut resources = shared.lock_resources();
            let mut cx = LiftContext::with_resources(&mem, encoding, &mut resources);
            let values = cx.lift_all(&param_types, &mut reader);
            lifted_borrows = cx.lifted_borrows.clone();
            values
        } else {
            LiftContext::new(&mem, encoding).lift_all(&param_types, &mut reader)
        }
    };

    // Run the handler; borrows taken while lifting are retired
    // whatever the outcome.
    let outcome = lifted.and_then(|values| {
        let cx = match &shared {
            Some(shared) => shared.host_context(),
            None => HostContext::detached(),
        };
        if cx.is_cancelled() {
            return Err(ComponentError::new(
                Phase::Host,
                ErrorKind::InvalidInput,
                format!("call to `{}` cancelled", binding.path),
            )
            .into());
        }
        (binding.def.handler)(cx, &values)
    });
    if let Some(shared) = &shared {
        let mut resources = shared.lock_resources();
        for (ty, handle) in lifted_borrows.drain(..) {
            if let Err(err) = resources.end_lift_borrow(ty, handle) {
                tracing::warn!(path = %binding.path, %err, "failed to end lifted borrow");
            }
        }
    }
    let results = outcome?;

    if results.len() != result_types.len() {
        return Err(ComponentError::new(
            Phase::Host,
            ErrorKind::TypeMismatch,
            format!(
                "host import `{}` returned {} value(s), expected {}",
                binding.path,
                results.len(),
                result_types.len()
            ),
        )
        .into());
    }

    // Lower the results back towards the guest.
    let mut mem = GuestMemory::new(&mut store, memory, realloc);
    let flat_results =
        if let Some(shared) = shared.as_ref().filter(|_| any_uses_resources(&result_types)) {
            let mut resources = shared.lock_resources();
            let mut cx = LowerContext::with_resources(&mut mem, encoding, &mut resources);
            lower_host_results(&mut cx, &results, &result_types, ret_area)?
        } else {
            let mut cx = LowerContext::new(&mut mem, encoding);
            lower_host_results(&mut cx, &results, &result_types, ret_area)?
        };
    Ok(flat_results.iter().map(|v| v.to_core()).collect())
}

fn lower_host_results<M: crate::abi::AbiMemory + crate::abi::AbiAllocator>(
    cx: &mut LowerContext<'_, M>,
    results: &[InterfaceValue],
    result_types: &[InterfaceType],
    ret_area: Option<u32>,
) -> Result<Vec<FlatValue>, Error> {
    match ret_area {
        Some(base) => {
            cx.store_all(results, result_types, base)?;
            Ok(Vec::new())
        }
        None => cx.lower_all(results, result_types),
    }
}

/// The core signature a lowered host import presents to the engine:
/// flattened parameters, plus a trailing retptr parameter when the
/// results exceed one slot.
pub(crate) fn lowered_signature(def: &FuncDef) -> FunctionType {
    let mut params: Vec<wasmer::Type> = flatten_all(&def.params)
        .into_iter()
        .map(FlatType::to_core)
        .collect();
    let results: Vec<wasmer::Type> = if uses_retptr(&def.results) {
        params.push(wasmer::Type::I32);
        Vec::new()
    } else {
        flatten_all(&def.results)
            .into_iter()
            .map(FlatType::to_core)
            .collect()
    };
    FunctionType::new(params, results)
}
