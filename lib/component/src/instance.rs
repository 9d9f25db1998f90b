//! Live component instances.
//!
//! [`InstancePre::instantiate`] walks the cached topological order,
//! materialises every core instance inside a fresh store, populates
//! virtual instances, resolves the component's export table by
//! following lift / alias / re-export chains, and drives the start
//! function. A process-wide registry maps monotonic instance ids to
//! the state host handlers need to recover their owning instance.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use dashmap::DashMap;
use wasmer::{Extern, Function, FunctionEnv, FunctionType, Imports, Memory, Store, StoreMut};

use crate::abi::ReallocFn;
use crate::bridge::{self, Entity, HostBinding, VirtualInstance};
use crate::component::{
    ComponentFuncDef, CoreExportDecl, CoreExternKind, CoreFuncDef, CoreInstanceDecl, ExportSort,
    StringEncoding,
};
use crate::context::{self, CancelToken, HostContext};
use crate::emit::{
    CoreValType, GlobalReExport, MemoryReExport, SyntheticModule, TableReExport,
};
use crate::errors::{ComponentError, Error, ErrorKind, InstantiationError, Phase};
use crate::graph::FuncImportClass;
use crate::linker::{make_binding, InstancePre};
use crate::registry::FuncDef;
use crate::resources::ResourceStore;
use crate::types::InterfaceType;

/// Re-export chains longer than this are treated as adversarial.
const MAX_REEXPORT_DEPTH: usize = 100;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

static INSTANCES: LazyLock<DashMap<u64, Arc<InstanceShared>>> = LazyLock::new(DashMap::new);

/// Looks up a live instance by id. Ids are monotonic and never
/// recycled, so a closed-then-freed instance can never be mistaken for
/// a live one.
pub(crate) fn lookup_instance(id: u64) -> Option<Arc<InstanceShared>> {
    INSTANCES.get(&id).map(|entry| Arc::clone(entry.value()))
}

fn register_instance(shared: &Arc<InstanceShared>) {
    INSTANCES.insert(shared.id, Arc::clone(shared));
}

fn unregister_instance(id: u64) {
    INSTANCES.remove(&id);
}

/// The slice of instance state host handlers can reach from any
/// thread: the resource tables and the cancellation flag.
pub(crate) struct InstanceShared {
    pub id: u64,
    resources: Mutex<ResourceStore>,
    cancel: CancelToken,
}

impl InstanceShared {
    fn new(id: u64) -> Self {
        Self {
            id,
            resources: Mutex::new(ResourceStore::new()),
            cancel: CancelToken::new(),
        }
    }

    pub(crate) fn lock_resources(&self) -> MutexGuard<'_, ResourceStore> {
        match self.resources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn host_context(&self) -> HostContext<'_> {
        HostContext::new(self.id, &self.resources, &self.cancel)
    }

    pub(crate) fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

/// Per-instance data attached to every host function environment.
pub(crate) struct InstanceCtx {
    shared: Arc<InstanceShared>,
    /// Core instances by declaration index, populated as instantiation
    /// walks the topological order.
    modules: HashMap<u32, wasmer::Instance>,
    /// The `(memory, realloc)` pair resolved lazily on the first host
    /// call that needs it.
    canonical: Option<(Option<Memory>, Option<ReallocFn>)>,
}

impl InstanceCtx {
    pub(crate) fn shared(&self) -> Option<Arc<InstanceShared>> {
        Some(Arc::clone(&self.shared))
    }

    /// Resolves the memory and realloc a binding was declared against,
    /// caching the pair on first resolution.
    pub(crate) fn canonical_pair(
        &mut self,
        store: &mut StoreMut<'_>,
        binding: &HostBinding,
    ) -> Result<(Option<Memory>, Option<ReallocFn>), Error> {
        if binding.memory_source.is_none() && binding.realloc_source.is_none() {
            return Ok((None, None));
        }
        if let Some(pair) = &self.canonical {
            return Ok(pair.clone());
        }
        let memory = match &binding.memory_source {
            Some((instance, name)) => Some(
                self.module(*instance)?
                    .exports
                    .get_memory(name)
                    .map_err(Error::from)?
                    .clone(),
            ),
            None => None,
        };
        let realloc = match &binding.realloc_source {
            Some((instance, name)) => Some(
                self.module(*instance)?
                    .exports
                    .get_typed_function::<(i32, i32, i32, i32), i32>(&*store, name)
                    .map_err(Error::from)?,
            ),
            None => None,
        };
        let pair = (memory, realloc);
        self.canonical = Some(pair.clone());
        Ok(pair)
    }

    fn module(&self, index: u32) -> Result<&wasmer::Instance, Error> {
        self.modules.get(&index).ok_or_else(|| {
            ComponentError::new(
                Phase::Runtime,
                ErrorKind::NotInitialized,
                format!("core instance {index} is not instantiated yet"),
            )
            .into()
        })
    }
}

/// One materialised core instance: a real module or a virtual one.
pub(crate) enum CoreInstance {
    Module(wasmer::Instance),
    Virtual(VirtualInstance),
}

/// The canonical options of a lifted export, fully resolved to live
/// engine objects.
#[derive(Clone)]
pub(crate) struct LiftedOptions {
    pub params: Vec<InterfaceType>,
    pub results: Vec<InterfaceType>,
    pub memory: Option<Memory>,
    pub realloc: Option<ReallocFn>,
    pub post_return: Option<Function>,
    pub string_encoding: StringEncoding,
}

/// What a component-level export resolves to.
#[derive(Clone)]
pub(crate) enum ExportTarget {
    /// A core function, optionally behind the canonical ABI.
    Core {
        func: Function,
        canon: Option<LiftedOptions>,
    },
    /// A re-exported host function; calls go straight to the handler.
    Host { def: Arc<FuncDef> },
}

/// What an export of a core instance resolves to when a consumer
/// imports it.
enum ResolvedExport {
    Extern(Extern),
    Binding(Arc<HostBinding>),
    Trap { name: String, reason: String },
}

fn lookup_core_export(
    core: &HashMap<u32, CoreInstance>,
    instance: u32,
    name: &str,
) -> Result<Option<ResolvedExport>, Error> {
    let entry = core.get(&instance).ok_or_else(|| {
        Error::from(ComponentError::new(
            Phase::Linking,
            ErrorKind::NotInitialized,
            format!("core instance {instance} referenced before instantiation"),
        ))
    })?;
    Ok(match entry {
        CoreInstance::Module(inst) => inst
            .exports
            .get_extern(name)
            .cloned()
            .map(ResolvedExport::Extern),
        CoreInstance::Virtual(v) => v.entities.get(name).map(|entity| match entity {
            Entity::ModuleExport { value, .. } => ResolvedExport::Extern(value.clone()),
            Entity::DirectMemory { memory, .. } => {
                ResolvedExport::Extern(Extern::Memory(memory.clone()))
            }
            Entity::DirectGlobal { global, .. } => {
                ResolvedExport::Extern(Extern::Global(global.clone()))
            }
            Entity::TableSource { table, .. } => {
                ResolvedExport::Extern(Extern::Table(table.clone()))
            }
            Entity::BoundHostFunc { binding } => ResolvedExport::Binding(Arc::clone(binding)),
            Entity::TrapFunc { name, reason } => ResolvedExport::Trap {
                name: name.clone(),
                reason: reason.clone(),
            },
        }),
    })
}

impl InstancePre {
    /// Materialises one live instance. Cheap relative to
    /// [`crate::Linker::instantiate_pre`]; safe to call concurrently
    /// from many threads.
    pub fn instantiate(&self) -> Result<Instance, Error> {
        let mut store = Store::new(self.linker.engine.clone());
        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(InstanceShared::new(id));
        register_instance(&shared);

        let mut bridge_names = Vec::new();
        match self.instantiate_inner(&mut store, &shared, &mut bridge_names) {
            Ok((core, exports)) => Ok(Instance {
                id,
                store,
                shared,
                core,
                exports,
                bridge_names,
                linker: Arc::clone(&self.linker),
                closed: false,
            }),
            Err(err) => {
                // Roll back: close every companion module created for
                // this instance and drop the registration.
                self.linker.release_bridges(&bridge_names);
                unregister_instance(id);
                Err(err)
            }
        }
    }

    fn instantiate_inner(
        &self,
        store: &mut Store,
        shared: &Arc<InstanceShared>,
        bridge_names: &mut Vec<String>,
    ) -> Result<(HashMap<u32, CoreInstance>, HashMap<String, ExportTarget>), Error> {
        let component = &self.component;
        let env = FunctionEnv::new(
            store,
            InstanceCtx {
                shared: Arc::clone(shared),
                modules: HashMap::new(),
                canonical: None,
            },
        );

        // The engine-facing signature of every function import, keyed
        // by (namespace, field). Host shims are typed from these, not
        // from the registry declarations.
        let mut import_sigs: HashMap<(String, String), FunctionType> = HashMap::new();
        for decl in &component.core_instances {
            let CoreInstanceDecl::Instantiate { module, .. } = decl else {
                continue;
            };
            for import in self.modules[*module as usize].imports() {
                if let wasmer::ExternType::Function(sig) = import.ty() {
                    import_sigs
                        .entry((import.module().to_owned(), import.name().to_owned()))
                        .or_insert_with(|| sig.clone());
                }
            }
        }

        // One host namespace per aggregated bridge name.
        let mut host_funcs: HashMap<(String, String), Function> = HashMap::new();
        for (ns, entries) in &self.host_namespaces {
            for (field, binding) in entries {
                let key = (ns.clone(), field.clone());
                let sig = import_sigs
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| bridge::lowered_signature(&binding.def));
                let func = bridge::make_host_function(store, &env, &sig, Arc::clone(binding));
                host_funcs.insert(key, func);
            }
        }

        let mut core: HashMap<u32, CoreInstance> = HashMap::new();
        // Synthetic bridges instantiated for virtual instances, by
        // virtual-instance index.
        let mut synthetic: HashMap<u32, wasmer::Instance> = HashMap::new();

        for &index in &self.graph.order {
            match &component.core_instances[index as usize] {
                CoreInstanceDecl::Instantiate { module, args } => {
                    let instance = self.instantiate_module(
                        store,
                        &env,
                        &core,
                        &mut synthetic,
                        bridge_names,
                        &host_funcs,
                        index,
                        *module,
                        args,
                    )?;
                    env.as_mut(store).modules.insert(index, instance.clone());
                    core.insert(index, CoreInstance::Module(instance));
                }
                CoreInstanceDecl::FromExports { exports } => {
                    let virtual_instance = self.populate_virtual(&core, index, exports)?;
                    core.insert(index, CoreInstance::Virtual(virtual_instance));
                }
            }
        }

        let exports = self.build_exports(store, &core)?;

        if let Some(start) = &component.start {
            let target = self
                .resolve_component_func(store, &core, start.func)?
                .ok_or_else(|| {
                    Error::from(ComponentError::new(
                        Phase::Linking,
                        ErrorKind::NotFound,
                        format!("start function {} cannot be resolved", start.func),
                    ))
                })?;
            let mut args = Vec::with_capacity(start.args.len());
            for &value_index in &start.args {
                args.push(
                    component
                        .values
                        .get(value_index as usize)
                        .cloned()
                        .ok_or_else(|| {
                            Error::from(ComponentError::new(
                                Phase::Validate,
                                ErrorKind::NotFound,
                                format!("start argument value {value_index} out of range"),
                            ))
                        })?,
                );
            }
            context::with_current_instance(shared.id, || {
                crate::call::invoke(store, shared, &target, &args)
            })?;
        }

        Ok((core, exports))
    }

    /// Builds the import object for one core module and instantiates
    /// it under this instance's store.
    #[allow(clippy::too_many_arguments)]
    fn instantiate_module(
        &self,
        store: &mut Store,
        env: &FunctionEnv<InstanceCtx>,
        core: &HashMap<u32, CoreInstance>,
        synthetic: &mut HashMap<u32, wasmer::Instance>,
        bridge_names: &mut Vec<String>,
        host_funcs: &HashMap<(String, String), Function>,
        index: u32,
        module: u32,
        args: &[crate::component::InstantiateArg],
    ) -> Result<wasmer::Instance, Error> {
        let module_obj = &self.modules[module as usize];
        let mut imports = Imports::new();

        for import in module_obj.imports() {
            let ns = import.module();
            let field = import.name();
            let func_sig = match import.ty() {
                wasmer::ExternType::Function(sig) => Some(sig.clone()),
                _ => None,
            };

            let arg = args.iter().find(|a| a.name == ns);
            let value: Extern = match arg {
                Some(arg) => self.arg_extern(
                    store,
                    env,
                    core,
                    synthetic,
                    bridge_names,
                    host_funcs,
                    index,
                    arg.instance,
                    ns,
                    field,
                    func_sig.as_ref(),
                )?,
                None => match host_funcs.get(&(ns.to_owned(), field.to_owned())) {
                    Some(func) => Extern::Function(func.clone()),
                    None => {
                        let sig = func_sig.as_ref().ok_or_else(|| {
                            Error::from(
                                InstantiationError::new(
                                    "bridge_create",
                                    index,
                                    "non-function import has no provider",
                                )
                                .with_import_path(format!("{ns}#{field}")),
                            )
                        })?;
                        Extern::Function(bridge::make_trap_function(
                            store,
                            sig,
                            &format!("{ns}#{field}"),
                            "no host function registered",
                        ))
                    }
                },
            };
            imports.define(ns, field, value);
        }

        wasmer::Instance::new(store, module_obj, &imports).map_err(|e| {
            InstantiationError::new("instantiate", index, "engine rejected the module")
                .with_cause(e)
                .into()
        })
    }

    /// Resolves the extern a consumer's `(namespace, field)` import
    /// receives from an argument instance.
    #[allow(clippy::too_many_arguments)]
    fn arg_extern(
        &self,
        store: &mut Store,
        env: &FunctionEnv<InstanceCtx>,
        core: &HashMap<u32, CoreInstance>,
        synthetic: &mut HashMap<u32, wasmer::Instance>,
        bridge_names: &mut Vec<String>,
        host_funcs: &HashMap<(String, String), Function>,
        consumer: u32,
        source: u32,
        ns: &str,
        field: &str,
        func_sig: Option<&FunctionType>,
    ) -> Result<Extern, Error> {
        // Virtual instances carrying memories, tables or globals are
        // realised through a synthetic core module so the entities
        // reach the consumer with engine-level identity.
        if let Some(CoreInstance::Virtual(v)) = core.get(&source) {
            if v.needs_synthetic_bridge() && func_sig.is_none() {
                let bridge_instance =
                    self.synthetic_bridge(store, synthetic, bridge_names, consumer, source, v, ns)?;
                if let Some(value) = bridge_instance.exports.get_extern(field) {
                    return Ok(value.clone());
                }
            }
        }

        match lookup_core_export(core, source, field)? {
            Some(ResolvedExport::Extern(value)) => Ok(value),
            Some(ResolvedExport::Binding(binding)) => {
                // The aggregated host namespace already carries this
                // function; fall back to a fresh one only when the
                // pre-resolution pass never saw a consumer for it.
                if let Some(func) = host_funcs.get(&(ns.to_owned(), field.to_owned())) {
                    return Ok(Extern::Function(func.clone()));
                }
                let sig = match func_sig {
                    Some(sig) => sig.clone(),
                    None => bridge::lowered_signature(&binding.def),
                };
                Ok(Extern::Function(bridge::make_host_function(
                    store,
                    env,
                    &sig,
                    binding,
                )))
            }
            Some(ResolvedExport::Trap { name, reason }) => {
                let sig = func_sig.ok_or_else(|| {
                    Error::from(
                        InstantiationError::new("bridge_create", consumer, reason.clone())
                            .with_import_path(name.clone()),
                    )
                })?;
                Ok(Extern::Function(bridge::make_trap_function(
                    store, sig, &name, &reason,
                )))
            }
            None => match func_sig {
                Some(sig) => Ok(Extern::Function(bridge::make_trap_function(
                    store,
                    sig,
                    &format!("{ns}#{field}"),
                    "instance does not export this function",
                ))),
                None => Err(InstantiationError::new(
                    "bridge_create",
                    consumer,
                    format!("instance `{ns}` does not export `{field}`"),
                )
                .with_import_path(format!("{ns}#{field}"))
                .into()),
            },
        }
    }

    /// Gets or creates the synthetic bridge module realising a virtual
    /// instance's entities, and instantiates it once per live
    /// instance.
    #[allow(clippy::too_many_arguments)]
    fn synthetic_bridge(
        &self,
        store: &mut Store,
        synthetic: &mut HashMap<u32, wasmer::Instance>,
        bridge_names: &mut Vec<String>,
        consumer: u32,
        source: u32,
        virtual_instance: &VirtualInstance,
        ns: &str,
    ) -> Result<wasmer::Instance, Error> {
        if let Some(existing) = synthetic.get(&source) {
            return Ok(existing.clone());
        }

        let name = format!("$bridge:{}:{source}", self.pre_id);
        let spec = synthetic_spec(store, virtual_instance);
        let engine = self.linker.engine.clone();
        let module = self
            .linker
            .get_or_create_bridge(&name, true, || {
                let bytes = spec.encode();
                wasmer::Module::new(&engine, &bytes[..]).map_err(|e| {
                    Error::from(
                        ComponentError::new(
                            Phase::Compile,
                            ErrorKind::InvalidData,
                            "synthetic bridge module failed to compile",
                        )
                        .with_cause(e),
                    )
                })
            })
            .map_err(|e| bridge_create_error(consumer, ns, e))?;
        bridge_names.push(name);

        let mut imports = Imports::new();
        for (entity_name, entity) in &virtual_instance.entities {
            match entity {
                Entity::DirectMemory { memory, .. } => {
                    imports.define("$src", entity_name, memory.clone());
                }
                Entity::DirectGlobal { global, .. } => {
                    imports.define("$src", entity_name, global.clone());
                }
                Entity::TableSource { table, .. } => {
                    imports.define("$src", entity_name, table.clone());
                }
                _ => {}
            }
        }
        let instance = wasmer::Instance::new(store, &module, &imports)
            .map_err(|e| bridge_create_error(consumer, ns, e.into()))?;
        synthetic.insert(source, instance.clone());
        Ok(instance)
    }

    /// Populates one virtual instance from the pre-computed index
    /// spaces, in declaration order.
    fn populate_virtual(
        &self,
        core: &HashMap<u32, CoreInstance>,
        index: u32,
        exports: &[CoreExportDecl],
    ) -> Result<VirtualInstance, Error> {
        let component = &self.component;
        let mut out = VirtualInstance::new(format!("$virtual:{index}"));
        for decl in exports {
            let entity = match decl.kind {
                CoreExternKind::Func => self.virtual_func_entity(index, &decl.name, core)?,
                CoreExternKind::Memory => {
                    let re = component.core_memories.get(decl.index as usize).ok_or_else(
                        || index_space_error("core-memory", decl.index),
                    )?;
                    match lookup_core_export(core, re.instance, &re.name)? {
                        Some(ResolvedExport::Extern(Extern::Memory(memory))) => {
                            Entity::DirectMemory {
                                source: re.instance,
                                memory,
                            }
                        }
                        _ => return Err(entity_shape_error("memory", &re.name, re.instance)),
                    }
                }
                CoreExternKind::Global => {
                    let re = component.core_globals.get(decl.index as usize).ok_or_else(
                        || index_space_error("core-global", decl.index),
                    )?;
                    match lookup_core_export(core, re.instance, &re.name)? {
                        Some(ResolvedExport::Extern(Extern::Global(global))) => {
                            Entity::DirectGlobal {
                                source: re.instance,
                                global,
                            }
                        }
                        _ => return Err(entity_shape_error("global", &re.name, re.instance)),
                    }
                }
                CoreExternKind::Table => {
                    let re = component.core_tables.get(decl.index as usize).ok_or_else(
                        || index_space_error("core-table", decl.index),
                    )?;
                    match lookup_core_export(core, re.instance, &re.name)? {
                        Some(ResolvedExport::Extern(Extern::Table(table))) => Entity::TableSource {
                            source: re.instance,
                            table,
                        },
                        _ => return Err(entity_shape_error("table", &re.name, re.instance)),
                    }
                }
            };
            out.entities.insert(decl.name.clone(), entity);
        }
        Ok(out)
    }

    /// The function entity behind one virtual-instance export, using
    /// the import classification computed at pre-instantiation.
    fn virtual_func_entity(
        &self,
        index: u32,
        name: &str,
        core: &HashMap<u32, CoreInstance>,
    ) -> Result<Entity, Error> {
        match self.classification.funcs.get(&(index, name.to_owned())) {
            Some(FuncImportClass::Adapter { instance, name }) => {
                match lookup_core_export(core, *instance, name)? {
                    Some(ResolvedExport::Extern(value @ Extern::Function(_))) => {
                        Ok(Entity::ModuleExport {
                            source: *instance,
                            value,
                        })
                    }
                    Some(ResolvedExport::Binding(binding)) => Ok(Entity::BoundHostFunc { binding }),
                    Some(ResolvedExport::Trap { name, reason }) => {
                        Ok(Entity::TrapFunc { name, reason })
                    }
                    _ => Ok(Entity::TrapFunc {
                        name: name.clone(),
                        reason: format!("core instance {instance} does not export this function"),
                    }),
                }
            }
            Some(FuncImportClass::Host { path, opts }) => {
                match self.linker.registry.resolve(path)? {
                    Some(def) => Ok(Entity::BoundHostFunc {
                        binding: Arc::new(make_binding(&self.component, path, def, opts)?),
                    }),
                    None => Ok(Entity::TrapFunc {
                        name: path.clone(),
                        reason: "no host function registered".to_owned(),
                    }),
                }
            }
            None => Ok(Entity::TrapFunc {
                name: name.to_owned(),
                reason: "unclassified virtual export".to_owned(),
            }),
        }
    }

    /// Builds the component-level export table.
    fn build_exports(
        &self,
        store: &mut Store,
        core: &HashMap<u32, CoreInstance>,
    ) -> Result<HashMap<String, ExportTarget>, Error> {
        let mut out = HashMap::new();
        for export in &self.component.exports {
            match &export.sort {
                ExportSort::Func(index) => {
                    if let Some(target) = self.resolve_component_func(store, core, *index)? {
                        out.insert(export.name.clone(), target);
                    }
                }
                ExportSort::Instance(methods) => {
                    for (method, index) in methods {
                        if let Some(target) = self.resolve_component_func(store, core, *index)? {
                            out.insert(format!("{}#{method}", export.name), target);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Follows a component function's definition chain to a callable
    /// target: a direct core function, a lifted core function with
    /// canonical options, or a host definition.
    ///
    /// Chains are followed at most [`MAX_REEXPORT_DEPTH`] links. The
    /// visited set lives in a small stack buffer and spills to a hash
    /// set only for deep chains; real-world chains stay below the
    /// buffer. Cycles and over-deep chains make the export unresolvable
    /// rather than aborting instantiation: a later `call` reports
    /// `not_found`.
    fn resolve_component_func(
        &self,
        store: &mut Store,
        core: &HashMap<u32, CoreInstance>,
        index: u32,
    ) -> Result<Option<ExportTarget>, Error> {
        let mut stack = [0u32; 8];
        let mut stack_len = 0usize;
        let mut spill: Option<HashSet<u32>> = None;
        let mut current = index;

        for _ in 0..MAX_REEXPORT_DEPTH {
            let seen = stack[..stack_len].contains(&current)
                || spill.as_ref().is_some_and(|s| s.contains(&current));
            if seen {
                tracing::warn!(
                    func = current,
                    "component-function re-export chain contains a cycle; export skipped"
                );
                return Ok(None);
            }
            if stack_len < stack.len() {
                stack[stack_len] = current;
                stack_len += 1;
            } else {
                spill
                    .get_or_insert_with(|| stack.iter().copied().collect())
                    .insert(current);
            }

            match self.component.component_func(current)? {
                ComponentFuncDef::ReExport { func } => current = *func,
                ComponentFuncDef::Import { import, name } => {
                    let import = self.component.imports.get(*import as usize).ok_or_else(
                        || index_space_error("component-import", *import),
                    )?;
                    let path = if name.is_empty() {
                        import.name.clone()
                    } else {
                        format!("{}#{name}", import.name)
                    };
                    return Ok(self
                        .linker
                        .registry
                        .resolve(&path)?
                        .map(|def| ExportTarget::Host { def }));
                }
                ComponentFuncDef::CoreAlias { core_func } => {
                    match self.component.core_func(*core_func)? {
                        CoreFuncDef::Alias { instance, name } => {
                            return self.core_export_target(core, *instance, name, None);
                        }
                        // A lowered function used directly: follow the
                        // component function it lowers.
                        CoreFuncDef::Lower { func, .. } => current = *func,
                    }
                }
                ComponentFuncDef::Lift { .. } => {
                    // The lift parameters were collected into the
                    // canonLifts table at pre-instantiation.
                    let lift = self.canon_lifts.get(&current).cloned().ok_or_else(|| {
                        Error::from(ComponentError::new(
                            Phase::Linking,
                            ErrorKind::NotInitialized,
                            format!("component-function {current} has no collected lift"),
                        ))
                    })?;
                    match self.component.core_func(lift.core_func)? {
                        CoreFuncDef::Alias { instance, name } => {
                            let (params, results) = self.lift_func_types(lift.ty)?;
                            let canon = self.resolve_lift_options(
                                store,
                                core,
                                lift.opts.clone(),
                                params,
                                results,
                            )?;
                            return self.core_export_target(core, *instance, name, Some(canon));
                        }
                        // Lowering a lifted function fuses away both
                        // canonical hops.
                        CoreFuncDef::Lower { func, .. } => current = *func,
                    }
                }
            }
        }
        tracing::warn!(
            func = index,
            depth = MAX_REEXPORT_DEPTH,
            "component-function re-export chain too deep; export skipped"
        );
        Ok(None)
    }

    fn core_export_target(
        &self,
        core: &HashMap<u32, CoreInstance>,
        instance: u32,
        name: &str,
        canon: Option<LiftedOptions>,
    ) -> Result<Option<ExportTarget>, Error> {
        match lookup_core_export(core, instance, name)? {
            Some(ResolvedExport::Extern(Extern::Function(func))) => {
                Ok(Some(ExportTarget::Core { func, canon }))
            }
            Some(ResolvedExport::Binding(binding)) => Ok(Some(ExportTarget::Host {
                def: Arc::clone(&binding.def),
            })),
            _ => Ok(None),
        }
    }

    /// Resolves a lift's canonical options to live engine objects.
    fn resolve_lift_options(
        &self,
        store: &mut Store,
        core: &HashMap<u32, CoreInstance>,
        opts: crate::component::CanonicalOptions,
        params: Vec<InterfaceType>,
        results: Vec<InterfaceType>,
    ) -> Result<LiftedOptions, Error> {
        let component = &self.component;
        let memory = match opts.memory {
            Some(index) => {
                let re = component
                    .core_memories
                    .get(index as usize)
                    .ok_or_else(|| index_space_error("core-memory", index))?;
                match lookup_core_export(core, re.instance, &re.name)? {
                    Some(ResolvedExport::Extern(Extern::Memory(memory))) => Some(memory),
                    _ => return Err(entity_shape_error("memory", &re.name, re.instance)),
                }
            }
            None => None,
        };
        let realloc = match opts.realloc {
            Some(index) => match component.core_func(index)? {
                CoreFuncDef::Alias { instance, name } => {
                    let CoreInstance::Module(inst) = core.get(instance).ok_or_else(|| {
                        index_space_error("core-instance", *instance)
                    })?
                    else {
                        return Err(entity_shape_error("realloc", name, *instance));
                    };
                    Some(
                        inst.exports
                            .get_typed_function::<(i32, i32, i32, i32), i32>(&*store, name)
                            .map_err(Error::from)?,
                    )
                }
                CoreFuncDef::Lower { .. } => {
                    return Err(ComponentError::new(
                        Phase::Validate,
                        ErrorKind::InvalidInput,
                        "canonical realloc must be a core module export",
                    )
                    .into());
                }
            },
            None => None,
        };
        let post_return = match opts.post_return {
            Some(index) => match component.core_func(index)? {
                CoreFuncDef::Alias { instance, name } => {
                    match lookup_core_export(core, *instance, name)? {
                        Some(ResolvedExport::Extern(Extern::Function(func))) => Some(func),
                        _ => return Err(entity_shape_error("post-return", name, *instance)),
                    }
                }
                CoreFuncDef::Lower { .. } => {
                    return Err(ComponentError::new(
                        Phase::Validate,
                        ErrorKind::InvalidInput,
                        "post-return must be a core module export",
                    )
                    .into());
                }
            },
            None => None,
        };
        Ok(LiftedOptions {
            params,
            results,
            memory,
            realloc,
            post_return,
            string_encoding: opts.string_encoding,
        })
    }

    /// The parameter and result types of a lift, resolved through the
    /// component's type index space.
    fn lift_func_types(&self, ty: u32) -> Result<(Vec<InterfaceType>, Vec<InterfaceType>), Error> {
        let resolver = crate::types::TypeResolver::new(&self.component.types);
        let func = resolver.func_type(ty)?;
        Ok((
            func.params.iter().map(|(_, t)| t.clone()).collect(),
            func.results.clone(),
        ))
    }
}

fn index_space_error(space: &str, index: u32) -> Error {
    ComponentError::new(
        Phase::Validate,
        ErrorKind::NotFound,
        format!("{space} index {index} out of range"),
    )
    .into()
}

fn entity_shape_error(what: &str, name: &str, instance: u32) -> Error {
    ComponentError::new(
        Phase::Linking,
        ErrorKind::TypeMismatch,
        format!("`{name}` of core instance {instance} is not a {what}"),
    )
    .into()
}

fn bridge_create_error(instance: u32, ns: &str, cause: Error) -> Error {
    InstantiationError::new("bridge_create", instance, "failed to realise bridge")
        .with_import_path(ns.to_owned())
        .with_cause(cause)
        .into()
}

/// Builds the synthetic-module spec realising a virtual instance's
/// memories, tables and globals.
fn synthetic_spec(store: &mut Store, virtual_instance: &VirtualInstance) -> SyntheticModule {
    let mut spec = SyntheticModule::default();
    for (name, entity) in &virtual_instance.entities {
        match entity {
            Entity::DirectMemory { memory, .. } => {
                let ty = memory.ty(&*store);
                spec.memory = Some(MemoryReExport {
                    from_module: "$src".into(),
                    from_name: name.clone(),
                    export_as: name.clone(),
                    min: u64::from(ty.minimum.0),
                    max: ty.maximum.map(|p| u64::from(p.0)),
                });
            }
            Entity::TableSource { table, .. } => {
                let ty = table.ty(&*store);
                spec.table = Some(TableReExport {
                    from_module: "$src".into(),
                    from_name: name.clone(),
                    export_as: name.clone(),
                    min: ty.minimum,
                    max: ty.maximum,
                });
            }
            Entity::DirectGlobal { global, .. } => {
                let ty = global.ty(&*store);
                if let Some(val_type) = core_val_type(ty.ty) {
                    spec.global_imports.push(GlobalReExport {
                        from_module: "$src".into(),
                        from_name: name.clone(),
                        export_as: name.clone(),
                        ty: val_type,
                        mutable: ty.mutability.is_mutable(),
                    });
                }
            }
            _ => {}
        }
    }
    spec
}

fn core_val_type(ty: wasmer::Type) -> Option<CoreValType> {
    match ty {
        wasmer::Type::I32 => Some(CoreValType::I32),
        wasmer::Type::I64 => Some(CoreValType::I64),
        wasmer::Type::F32 => Some(CoreValType::F32),
        wasmer::Type::F64 => Some(CoreValType::F64),
        _ => None,
    }
}

/// A live component instance.
///
/// An `Instance` owns its store and is not safe for concurrent use;
/// one logical task owns it at a time. Many instances of the same
/// [`InstancePre`] can live side by side without sharing any mutable
/// state.
pub struct Instance {
    id: u64,
    pub(crate) store: Store,
    pub(crate) shared: Arc<InstanceShared>,
    pub(crate) core: HashMap<u32, CoreInstance>,
    pub(crate) exports: HashMap<String, ExportTarget>,
    bridge_names: Vec<String>,
    linker: Arc<crate::linker::LinkerShared>,
    pub(crate) closed: bool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("exports", &self.exports.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Instance {
    /// The unique, monotonically assigned id of this instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Names of the callable exports, including `instance#method`
    /// surfaced methods.
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(String::as_str)
    }

    /// The cancellation token host handlers observe through their
    /// context.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel_token()
    }

    /// Direct access to this instance's resource tables.
    pub fn with_resources<R>(&self, f: impl FnOnce(&mut ResourceStore) -> R) -> R {
        f(&mut self.shared.lock_resources())
    }

    /// Closes the instance: unregisters it globally, releases its
    /// bridge references and drops its core modules. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        unregister_instance(self.id);
        self.core.clear();
        self.exports.clear();
        self.linker.release_bridges(&self.bridge_names);
        self.bridge_names.clear();
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.close();
    }
}
