//! The dependency graph over a component's core instances.
//!
//! Two artifacts are derived from a validated component before any
//! engine work happens: a deterministic topological order in which the
//! core instances must be materialised, and a classification of every
//! function a virtual instance supplies — satisfied by another core
//! instance (adapter-provided) or required from the host registry.

use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::component::{
    CanonicalOptions, Component, ComponentFuncDef, CoreExternKind, CoreFuncDef, CoreInstanceDecl,
};
use crate::errors::{ComponentError, Error, ErrorKind, Phase};

/// The cached instantiation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Core-instance indices in the order they must be instantiated.
    pub order: Vec<u32>,
}

impl DependencyGraph {
    /// Builds the topological order over the component's core-instance
    /// declarations.
    ///
    /// Edges run from every named argument instance to its consumer,
    /// and from the owner of every aliased export to the virtual
    /// instance referencing it. Kahn's algorithm with the instance
    /// index as tie-breaker keeps the order deterministic and stable
    /// across runs.
    pub fn build(component: &Component) -> Result<Self, Error> {
        let n = component.core_instances.len();
        let mut successors: Vec<Vec<u32>> = vec![Vec::new(); n];
        let mut indegree: Vec<u32> = vec![0; n];

        let mut add_edge = |from: u32, to: u32| -> Result<(), Error> {
            if from as usize >= n || to as usize >= n {
                return Err(ComponentError::new(
                    Phase::Validate,
                    ErrorKind::NotFound,
                    format!("core-instance index {from} out of range ({n} instances)"),
                )
                .into());
            }
            if from != to {
                successors[from as usize].push(to);
                indegree[to as usize] += 1;
            }
            Ok(())
        };

        for (index, decl) in component.core_instances.iter().enumerate() {
            let index = index as u32;
            match decl {
                CoreInstanceDecl::Instantiate { args, .. } => {
                    for arg in args {
                        add_edge(arg.instance, index)?;
                    }
                }
                CoreInstanceDecl::FromExports { exports } => {
                    for export in exports {
                        for owner in export_owners(component, export.kind, export.index) {
                            add_edge(owner, index)?;
                        }
                    }
                }
            }
        }

        let mut heap: BinaryHeap<std::cmp::Reverse<u32>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| std::cmp::Reverse(i as u32))
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(std::cmp::Reverse(index)) = heap.pop() {
            order.push(index);
            for &next in &successors[index as usize] {
                indegree[next as usize] -= 1;
                if indegree[next as usize] == 0 {
                    heap.push(std::cmp::Reverse(next));
                }
            }
        }
        if order.len() != n {
            return Err(ComponentError::new(
                Phase::Validate,
                ErrorKind::InvalidInput,
                "core-instance dependency graph contains a cycle",
            )
            .into());
        }
        Ok(Self { order })
    }
}

/// The core instances an index-space entry borrows from.
fn export_owners(component: &Component, kind: CoreExternKind, index: u32) -> Vec<u32> {
    match kind {
        CoreExternKind::Func => match component.core_funcs.get(index as usize) {
            Some(CoreFuncDef::Alias { instance, .. }) => vec![*instance],
            // Lowered functions are host-side; they create no
            // instance-to-instance edge.
            _ => vec![],
        },
        CoreExternKind::Table => component
            .core_tables
            .get(index as usize)
            .map(|r| vec![r.instance])
            .unwrap_or_default(),
        CoreExternKind::Memory => component
            .core_memories
            .get(index as usize)
            .map(|r| vec![r.instance])
            .unwrap_or_default(),
        CoreExternKind::Global => component
            .core_globals
            .get(index as usize)
            .map(|r| vec![r.instance])
            .unwrap_or_default(),
    }
}

/// How one function export of a virtual instance is satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum FuncImportClass {
    /// Satisfied by the named export of another core instance.
    Adapter {
        /// Owning core-instance index.
        instance: u32,
        /// Export name within the owner.
        name: String,
    },
    /// Required from the host registry.
    Host {
        /// Registry path, `namespace#function`.
        path: String,
        /// Canonical options of the lowering, used to bind memory and
        /// realloc at call time.
        opts: CanonicalOptions,
    },
}

/// Classification of every function supplied by virtual instances,
/// keyed by `(core-instance index, export name)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportClassification {
    /// The per-export classification.
    pub funcs: HashMap<(u32, String), FuncImportClass>,
}

/// Walks the component-function and core-function index spaces and
/// tags every function a virtual instance supplies as
/// adapter-provided or required-from-host.
pub fn classify_imports(component: &Component) -> Result<ImportClassification, Error> {
    let mut classification = ImportClassification::default();
    for (index, decl) in component.core_instances.iter().enumerate() {
        let CoreInstanceDecl::FromExports { exports } = decl else {
            continue;
        };
        for export in exports {
            if export.kind != CoreExternKind::Func {
                continue;
            }
            let class = classify_core_func(component, export.index)?;
            classification
                .funcs
                .insert((index as u32, export.name.clone()), class);
        }
    }
    Ok(classification)
}

fn classify_core_func(component: &Component, index: u32) -> Result<FuncImportClass, Error> {
    match component.core_func(index)? {
        CoreFuncDef::Alias { instance, name } => Ok(FuncImportClass::Adapter {
            instance: *instance,
            name: name.clone(),
        }),
        CoreFuncDef::Lower { func, opts } => {
            let mut visited = HashSet::new();
            classify_component_func(component, *func, &mut visited, opts.clone())
        }
    }
}

fn classify_component_func(
    component: &Component,
    mut index: u32,
    visited: &mut HashSet<u32>,
    opts: CanonicalOptions,
) -> Result<FuncImportClass, Error> {
    loop {
        if !visited.insert(index) {
            return Err(ComponentError::new(
                Phase::Validate,
                ErrorKind::InvalidInput,
                format!("component-function {index} participates in a definition cycle"),
            )
            .into());
        }
        match component.component_func(index)? {
            ComponentFuncDef::Import { import, name } => {
                let import = component.imports.get(*import as usize).ok_or_else(|| {
                    Error::from(ComponentError::new(
                        Phase::Validate,
                        ErrorKind::NotFound,
                        format!("component-import index {import} out of range"),
                    ))
                })?;
                let path = if name.is_empty() {
                    import.name.clone()
                } else {
                    format!("{}#{}", import.name, name)
                };
                return Ok(FuncImportClass::Host { path, opts });
            }
            ComponentFuncDef::ReExport { func } => index = *func,
            // Lowering a lifted or aliased core function degenerates to
            // the underlying core function, with no ABI hop.
            ComponentFuncDef::Lift { core_func, .. }
            | ComponentFuncDef::CoreAlias { core_func } => {
                let core_func = *core_func;
                return match component.core_func(core_func)? {
                    CoreFuncDef::Alias { instance, name } => Ok(FuncImportClass::Adapter {
                        instance: *instance,
                        name: name.clone(),
                    }),
                    CoreFuncDef::Lower { func, .. } => {
                        classify_component_func(component, *func, visited, opts)
                    }
                };
            }
        }
    }
}
