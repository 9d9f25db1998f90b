//! The linker: host bindings, the engine-level bridge cache, and the
//! compile-once pre-instantiation of components.
//!
//! A [`Linker`] is cheap to clone and safe to share between threads.
//! [`Linker::instantiate_pre`] runs everything expensive exactly once
//! per component — module compilation, graph construction, host-import
//! resolution — so that [`InstancePre::instantiate`] only has to walk
//! the cached plan.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use wasmer::{Engine, Module};

use crate::bridge::HostBinding;
use crate::component::{
    CanonicalOptions, Component, ComponentFuncDef, CoreFuncDef, CoreInstanceDecl,
};
use crate::context::{HostContext, HostHandler};
use crate::emit::rewrite_empty_import_modules;
use crate::errors::{ComponentError, Error, ErrorKind, MissingImportsError, Phase};
use crate::graph::{classify_imports, DependencyGraph, FuncImportClass, ImportClassification};
use crate::registry::{FuncDef, HostRegistry};
use crate::types::InterfaceType;
use crate::values::InterfaceValue;

/// Linker configuration.
#[derive(Debug, Clone)]
pub struct LinkerConfig {
    /// Whether versioned lookups may fall back to semver-compatible
    /// siblings.
    pub semver_matching: bool,
    /// Whether modules should be run through an asyncify transform.
    /// The transform itself lives outside this crate; the flag is
    /// carried for embedders that layer it on top.
    pub asyncify_transform: bool,
    /// Import path patterns the asyncify transform applies to.
    pub asyncify_imports: Vec<String>,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            semver_matching: true,
            asyncify_transform: false,
            asyncify_imports: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct BridgeEntry {
    pub module: Module,
    pub refs: u32,
    pub virtual_source: bool,
}

/// Shared linker state.
pub(crate) struct LinkerShared {
    pub engine: Engine,
    pub config: LinkerConfig,
    pub registry: HostRegistry,
    // Serialises every bridge create/replace/release, so concurrent
    // instantiations never race to build or dispose the same module.
    bridges: Mutex<HashMap<String, BridgeEntry>>,
}

impl LinkerShared {
    fn lock_bridges(&self) -> MutexGuard<'_, HashMap<String, BridgeEntry>> {
        match self.bridges.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fetches a cached bridge module, or builds it. An existing entry
    /// built from a virtual source is closed and rebuilt when a real
    /// source arrives under the same name. Every successful return
    /// adds one reference for the calling instance.
    pub(crate) fn get_or_create_bridge(
        &self,
        name: &str,
        virtual_source: bool,
        build: impl FnOnce() -> Result<Module, Error>,
    ) -> Result<Module, Error> {
        let mut bridges = self.lock_bridges();
        if let Some(entry) = bridges.get_mut(name) {
            if entry.virtual_source && !virtual_source {
                let module = build()?;
                entry.module = module.clone();
                entry.virtual_source = false;
                entry.refs += 1;
                return Ok(module);
            }
            entry.refs += 1;
            return Ok(entry.module.clone());
        }
        let module = build()?;
        bridges.insert(
            name.to_owned(),
            BridgeEntry {
                module: module.clone(),
                refs: 1,
                virtual_source,
            },
        );
        Ok(module)
    }

    /// Releases one reference per name; bridges whose count reaches
    /// zero are disposed.
    pub(crate) fn release_bridges(&self, names: &[String]) {
        let mut bridges = self.lock_bridges();
        for name in names {
            if let Some(entry) = bridges.get_mut(name) {
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs == 0 {
                    bridges.remove(name);
                }
            }
        }
    }

    pub(crate) fn bridge_count(&self) -> usize {
        self.lock_bridges().len()
    }
}

/// The component linker.
#[derive(Clone)]
pub struct Linker {
    inner: Arc<LinkerShared>,
}

impl std::fmt::Debug for Linker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linker")
            .field("config", &self.inner.config)
            .field("bridges", &self.inner.bridge_count())
            .finish()
    }
}

impl Default for Linker {
    fn default() -> Self {
        Self::new(Engine::default())
    }
}

impl Linker {
    /// Creates a linker over an engine with the default configuration.
    pub fn new(engine: Engine) -> Self {
        Self::with_config(engine, LinkerConfig::default())
    }

    /// Creates a linker with an explicit configuration.
    pub fn with_config(engine: Engine, config: LinkerConfig) -> Self {
        let registry = HostRegistry::new(config.semver_matching);
        Self {
            inner: Arc::new(LinkerShared {
                engine,
                config,
                registry,
                bridges: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The engine modules are compiled against.
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// The linker configuration.
    pub fn config(&self) -> &LinkerConfig {
        &self.inner.config
    }

    /// Gets or creates the namespace at `path`.
    pub fn namespace(&self, path: &str) -> Result<(), Error> {
        self.inner.registry.namespace(path)
    }

    /// Registers (or overwrites) a host function at
    /// `package:ns/interface@version#name`.
    pub fn define_func<F>(
        &self,
        path: &str,
        handler: F,
        params: Vec<InterfaceType>,
        results: Vec<InterfaceType>,
    ) -> Result<(), Error>
    where
        F: Fn(HostContext<'_>, &[InterfaceValue]) -> Result<Vec<InterfaceValue>, Error>
            + Send
            + Sync
            + 'static,
    {
        let handler: HostHandler = Arc::new(handler);
        self.inner.registry.define_func(path, handler, params, results)
    }

    /// Looks up a host function definition.
    pub fn resolve(&self, path: &str) -> Result<Option<Arc<FuncDef>>, Error> {
        self.inner.registry.resolve(path)
    }

    /// Resets the registry and drops every cached bridge.
    pub fn close(&self) {
        self.inner.registry.close();
        self.inner.lock_bridges().clear();
    }

    /// Number of live engine-level bridge modules.
    pub fn cached_bridge_count(&self) -> usize {
        self.inner.bridge_count()
    }

    /// Runs the expensive, per-component phase: compiles every core
    /// module, derives the instantiation plan and pre-resolves every
    /// host import. Unresolved imports fail here, all at once.
    pub fn instantiate_pre(&self, component: Component) -> Result<InstancePre, Error> {
        component.validate_section_order()?;
        let component = Arc::new(component);

        let mut modules = Vec::with_capacity(component.core_modules.len());
        for binary in &component.core_modules {
            let binary = rewrite_empty_import_modules(binary)?;
            let module = Module::new(&self.inner.engine, &binary[..]).map_err(|e| {
                Error::from(
                    ComponentError::new(
                        Phase::Compile,
                        ErrorKind::InvalidData,
                        "core module failed to compile",
                    )
                    .with_cause(e),
                )
            })?;
            modules.push(module);
        }

        let graph = DependencyGraph::build(&component)?;
        let classification = classify_imports(&component)?;

        let mut canon_lifts = HashMap::new();
        for (index, def) in component.component_funcs.iter().enumerate() {
            if let ComponentFuncDef::Lift { core_func, ty, opts } = def {
                canon_lifts.insert(
                    index as u32,
                    LiftDef {
                        core_func: *core_func,
                        ty: *ty,
                        opts: opts.clone(),
                    },
                );
            }
        }

        let host_namespaces = self.resolve_imports(&component, &modules, &classification)?;

        static PRE_IDS: AtomicU64 = AtomicU64::new(1);
        Ok(InstancePre {
            linker: Arc::clone(&self.inner),
            component,
            modules,
            graph,
            classification,
            canon_lifts,
            host_namespaces,
            pre_id: PRE_IDS.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Compiles and instantiates in one step.
    pub fn instantiate(&self, component: Component) -> Result<crate::instance::Instance, Error> {
        self.instantiate_pre(component)?.instantiate()
    }

    /// Walks every import of every `instantiate` declaration and
    /// decides how it will be satisfied, aggregating the successfully
    /// resolved host bindings by bridge-module name so each host
    /// namespace is built exactly once per live instance. Unresolved
    /// host imports are gathered and reported together.
    fn resolve_imports(
        &self,
        component: &Component,
        modules: &[Module],
        classification: &ImportClassification,
    ) -> Result<BTreeMap<String, Vec<(String, Arc<HostBinding>)>>, Error> {
        let mut namespaces: BTreeMap<String, Vec<(String, Arc<HostBinding>)>> = BTreeMap::new();
        let mut missing = MissingImportsError::default();

        for decl in &component.core_instances {
            let CoreInstanceDecl::Instantiate { module, args } = decl else {
                continue;
            };
            let module = modules.get(*module as usize).ok_or_else(|| {
                Error::from(ComponentError::new(
                    Phase::Validate,
                    ErrorKind::NotFound,
                    format!("core-module index {module} out of range"),
                ))
            })?;
            for import in module.imports() {
                let ns = import.module().to_owned();
                let field = import.name().to_owned();
                let is_func = matches!(import.ty(), wasmer::ExternType::Function(_));

                let arg = args.iter().find(|a| a.name == ns);
                let binding = match arg {
                    Some(arg) => {
                        match component.core_instances.get(arg.instance as usize) {
                            Some(CoreInstanceDecl::FromExports { .. }) if is_func => {
                                match classification.funcs.get(&(arg.instance, field.clone())) {
                                    Some(FuncImportClass::Host { path, opts }) => {
                                        match self.inner.registry.resolve(path)? {
                                            Some(def) => Some(Arc::new(make_binding(
                                                component, path, def, opts,
                                            )?)),
                                            None => {
                                                push_missing(&mut missing, path);
                                                continue;
                                            }
                                        }
                                    }
                                    // Adapter-provided functions and
                                    // missing exports (trap stubs) are
                                    // wired from live entities during
                                    // instantiation.
                                    _ => None,
                                }
                            }
                            // Entity imports and real-module sources
                            // are wired from live exports during
                            // instantiation.
                            Some(_) => None,
                            None => {
                                return Err(ComponentError::new(
                                    Phase::Validate,
                                    ErrorKind::NotFound,
                                    format!(
                                        "argument `{ns}` names core instance {} which does \
                                         not exist",
                                        arg.instance
                                    ),
                                )
                                .into());
                            }
                        }
                    }
                    None => {
                        // No adapter provides this namespace: the host
                        // registry must.
                        let path = format!("{ns}#{field}");
                        match self.inner.registry.resolve(&path)? {
                            Some(def) if is_func => Some(Arc::new(make_binding(
                                component,
                                &path,
                                def,
                                &CanonicalOptions::default(),
                            )?)),
                            _ => {
                                push_missing(&mut missing, &path);
                                continue;
                            }
                        }
                    }
                };

                if let Some(binding) = binding {
                    let entries = namespaces.entry(ns.clone()).or_default();
                    if !entries.iter().any(|(f, _)| f == &field) {
                        entries.push((field, binding));
                    }
                }
            }
        }

        if !missing.is_empty() {
            return Err(missing.into());
        }
        Ok(namespaces)
    }
}

fn push_missing(missing: &mut MissingImportsError, path: &str) {
    match path.rsplit_once('#') {
        Some((ns, name)) => missing.push(ns, name),
        None => missing.push(path, ""),
    }
}

/// Resolves the memory and realloc references of a lowering into
/// `(core instance, export name)` pairs usable at call time.
pub(crate) fn make_binding(
    component: &Component,
    path: &str,
    def: Arc<FuncDef>,
    opts: &CanonicalOptions,
) -> Result<HostBinding, Error> {
    let memory_source = match opts.memory {
        Some(index) => {
            let re = component.core_memories.get(index as usize).ok_or_else(|| {
                Error::from(ComponentError::new(
                    Phase::Validate,
                    ErrorKind::NotFound,
                    format!("core-memory index {index} out of range"),
                ))
            })?;
            Some((re.instance, re.name.clone()))
        }
        None => None,
    };
    let realloc_source = match opts.realloc {
        Some(index) => match component.core_func(index)? {
            CoreFuncDef::Alias { instance, name } => Some((*instance, name.clone())),
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
    Ok(HostBinding {
        path: path.to_owned(),
        def,
        opts: opts.clone(),
        memory_source,
        realloc_source,
    })
}

/// A `canon lift` definition collected at pre-instantiation time.
#[derive(Debug, Clone)]
pub(crate) struct LiftDef {
    pub core_func: u32,
    pub ty: u32,
    pub opts: CanonicalOptions,
}

/// The reusable, thread-safe result of pre-instantiating a component.
/// Many live instances can be created from one `InstancePre`, serially
/// or concurrently.
pub struct InstancePre {
    pub(crate) linker: Arc<LinkerShared>,
    pub(crate) component: Arc<Component>,
    pub(crate) modules: Vec<Module>,
    pub(crate) graph: DependencyGraph,
    pub(crate) classification: ImportClassification,
    pub(crate) canon_lifts: HashMap<u32, LiftDef>,
    pub(crate) host_namespaces: BTreeMap<String, Vec<(String, Arc<HostBinding>)>>,
    pub(crate) pre_id: u64,
}

impl std::fmt::Debug for InstancePre {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePre")
            .field("modules", &self.modules.len())
            .field("order", &self.graph.order)
            .field("host_namespaces", &self.host_namespaces.len())
            .field("pre_id", &self.pre_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = LinkerConfig::default();
        assert!(config.semver_matching);
        assert!(!config.asyncify_transform);
        assert!(config.asyncify_imports.is_empty());
    }

    #[test]
    fn bridge_refcounts_dispose_at_zero() {
        let linker = Linker::default();
        let build = || {
            let wat = r#"(module (func (export "f")))"#;
            Ok(Module::new(linker.engine(), wat::parse_str(wat).unwrap()).unwrap())
        };
        linker
            .inner
            .get_or_create_bridge("b", false, build)
            .unwrap();
        linker
            .inner
            .get_or_create_bridge("b", false, || unreachable!("cached"))
            .unwrap();
        assert_eq!(linker.cached_bridge_count(), 1);
        linker.inner.release_bridges(&["b".to_owned()]);
        assert_eq!(linker.cached_bridge_count(), 1);
        linker.inner.release_bridges(&["b".to_owned()]);
        assert_eq!(linker.cached_bridge_count(), 0);
    }
}
