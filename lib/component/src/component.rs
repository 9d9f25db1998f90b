//! The parsed component data model.
//!
//! A [`Component`] is the immutable output of the component binary
//! decoder (an external collaborator): core module binaries, core
//! instance declarations, alias and canonical definitions, imports,
//! exports, the start record, and the pre-computed index spaces the
//! linker walks during pre-instantiation.

use crate::errors::{ComponentError, Error, ErrorKind, Phase};
use crate::types::TypeDef;
use crate::values::InterfaceValue;

/// The sort of a core-level entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreExternKind {
    /// A core function.
    Func,
    /// A core table.
    Table,
    /// A core linear memory.
    Memory,
    /// A core global.
    Global,
}

/// A reference to a named export of a core instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreExportRef {
    /// Core-instance index the export is taken from.
    pub instance: u32,
    /// Export name within that instance.
    pub name: String,
}

/// An alias declaration: pulls one export of a core instance into the
/// matching core index space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    /// The sort of the aliased entity.
    pub kind: CoreExternKind,
    /// Core-instance index the export is taken from.
    pub instance: u32,
    /// Export name within that instance.
    pub name: String,
}

/// A named argument of an `instantiate` core-instance declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstantiateArg {
    /// The import-module name this argument satisfies.
    pub name: String,
    /// The core instance supplying the entities.
    pub instance: u32,
}

/// One export of a synthesised (`FromExports`) core instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreExportDecl {
    /// Export name the consumers will import.
    pub name: String,
    /// The sort of the exported entity.
    pub kind: CoreExternKind,
    /// Index into the core index space of that sort (`core_funcs`,
    /// `core_tables`, `core_memories` or `core_globals`).
    pub index: u32,
}

/// A core-instance declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreInstanceDecl {
    /// Instantiate core module `module` with the given named argument
    /// instances.
    Instantiate {
        /// Core-module index.
        module: u32,
        /// Named argument instances.
        args: Vec<InstantiateArg>,
    },
    /// A virtual instance synthesised from a list of exports of other
    /// instances.
    FromExports {
        /// The exports, in declaration order. Order is preserved all
        /// the way to the engine because it dictates indirect-call
        /// table indices.
        exports: Vec<CoreExportDecl>,
    },
}

/// How guest strings are encoded in linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringEncoding {
    /// UTF-8, the only supported encoding.
    #[default]
    Utf8,
    /// UTF-16; rejected at transcode time.
    Utf16,
    /// Latin-1/UTF-16 compact encoding; rejected at transcode time.
    CompactUtf16,
}

/// The options attached to a `canon lift` or `canon lower` definition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CanonicalOptions {
    /// Index into the core-memory index space of the linear memory the
    /// canonical ABI reads and writes.
    pub memory: Option<u32>,
    /// Index into the core-function index space of the canonical
    /// reallocation function (`cabi_realloc`).
    pub realloc: Option<u32>,
    /// Index into the core-function index space of the post-return
    /// cleanup function.
    pub post_return: Option<u32>,
    /// String encoding in effect for this definition.
    pub string_encoding: StringEncoding,
}

/// One entry of the core-function index space.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreFuncDef {
    /// An alias of a core instance's exported function.
    Alias {
        /// Core-instance index.
        instance: u32,
        /// Export name.
        name: String,
    },
    /// A `canon lower` of a component-level function.
    Lower {
        /// Component-function index being lowered.
        func: u32,
        /// Canonical options of the lowering.
        opts: CanonicalOptions,
    },
}

/// One entry of the component-function index space.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentFuncDef {
    /// A function of an imported instance.
    Import {
        /// Index into [`Component::imports`].
        import: u32,
        /// Function name within the imported instance; empty when the
        /// import itself is a bare function import.
        name: String,
    },
    /// A direct alias of a core function, with no canonical ABI
    /// applied.
    CoreAlias {
        /// Core-function index.
        core_func: u32,
    },
    /// A `canon lift` of a core function into a typed component
    /// function.
    Lift {
        /// Core-function index of the implementation.
        core_func: u32,
        /// Type index of the component function type.
        ty: u32,
        /// Canonical options of the lift.
        opts: CanonicalOptions,
    },
    /// A re-export of another component function.
    ReExport {
        /// The component-function index re-exported.
        func: u32,
    },
}

/// A component-level import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentImport {
    /// The import name, e.g. `wasi:io/streams@0.2.1`.
    pub name: String,
}

/// What a component-level export refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportSort {
    /// A component function.
    Func(u32),
    /// An exported instance; each named function is surfaced to
    /// callers as `<instance>#<method>`.
    Instance(Vec<(String, u32)>),
}

/// A component-level export.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentExport {
    /// Export name.
    pub name: String,
    /// What is exported.
    pub sort: ExportSort,
}

/// The component start record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartDecl {
    /// Component-function index of the start function.
    pub func: u32,
    /// Indices into [`Component::values`] of the start arguments.
    pub args: Vec<u32>,
}

/// Ordering marker emitted by the decoder for each declaration, in
/// binary order. Used to validate that the pre-computed index spaces
/// are consistent with the section layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// A core-module declaration.
    CoreModule,
    /// A core-instance declaration.
    CoreInstance,
    /// An alias declaration.
    Alias,
    /// A type declaration.
    Type,
    /// A canonical definition (lift or lower).
    Canon,
    /// A component import.
    Import,
    /// A component export.
    Export,
    /// A value declaration.
    Value,
    /// The start record.
    Start,
}

/// A parsed, validated component.
///
/// All fields are public: the structure is produced by the binary
/// decoder and consumed read-only by the linker.
#[derive(Debug, Clone, Default)]
pub struct Component {
    /// Core module binaries, in declaration order.
    pub core_modules: Vec<Vec<u8>>,
    /// Core-instance declarations, in declaration order.
    pub core_instances: Vec<CoreInstanceDecl>,
    /// Alias declarations, in declaration order.
    pub aliases: Vec<Alias>,
    /// The type index space.
    pub types: Vec<TypeDef>,
    /// The core-function index space.
    pub core_funcs: Vec<CoreFuncDef>,
    /// The core-table index space.
    pub core_tables: Vec<CoreExportRef>,
    /// The core-memory index space.
    pub core_memories: Vec<CoreExportRef>,
    /// The core-global index space.
    pub core_globals: Vec<CoreExportRef>,
    /// The component-function index space.
    pub component_funcs: Vec<ComponentFuncDef>,
    /// Component-level imports.
    pub imports: Vec<ComponentImport>,
    /// Component-level exports.
    pub exports: Vec<ComponentExport>,
    /// Component-level values, referenced by the start record.
    pub values: Vec<InterfaceValue>,
    /// The start record, if any.
    pub start: Option<StartDecl>,
    /// Per-section ordering markers, in binary order.
    pub section_order: Vec<SectionKind>,
}

impl Component {
    /// Checks that the section-order markers agree with the pre-computed
    /// index spaces. A decoder bug here would silently corrupt the
    /// instantiation plan, so the linker refuses such inputs.
    pub fn validate_section_order(&self) -> Result<(), Error> {
        if self.section_order.is_empty() {
            // Hand-assembled components may omit the markers.
            return Ok(());
        }
        let count = |kind: SectionKind| {
            self.section_order.iter().filter(|k| **k == kind).count()
        };
        let canon_defs = self
            .core_funcs
            .iter()
            .filter(|f| matches!(f, CoreFuncDef::Lower { .. }))
            .count()
            + self
                .component_funcs
                .iter()
                .filter(|f| matches!(f, ComponentFuncDef::Lift { .. }))
                .count();
        let checks: &[(SectionKind, usize)] = &[
            (SectionKind::CoreModule, self.core_modules.len()),
            (SectionKind::CoreInstance, self.core_instances.len()),
            (SectionKind::Alias, self.aliases.len()),
            (SectionKind::Type, self.types.len()),
            (SectionKind::Canon, canon_defs),
            (SectionKind::Import, self.imports.len()),
            (SectionKind::Export, self.exports.len()),
            (SectionKind::Value, self.values.len()),
            (SectionKind::Start, usize::from(self.start.is_some())),
        ];
        for (kind, expected) in checks {
            let seen = count(*kind);
            if seen != *expected {
                return Err(ComponentError::new(
                    Phase::Validate,
                    ErrorKind::InvalidInput,
                    format!(
                        "section order lists {seen} {kind:?} declaration(s) but the index \
                         spaces carry {expected}"
                    ),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Looks up a core-function definition.
    pub fn core_func(&self, index: u32) -> Result<&CoreFuncDef, Error> {
        self.core_funcs.get(index as usize).ok_or_else(|| {
            ComponentError::new(
                Phase::Validate,
                ErrorKind::NotFound,
                format!("core-function index {index} out of range"),
            )
            .into()
        })
    }

    /// Looks up a component-function definition.
    pub fn component_func(&self, index: u32) -> Result<&ComponentFuncDef, Error> {
        self.component_funcs.get(index as usize).ok_or_else(|| {
            ComponentError::new(
                Phase::Validate,
                ErrorKind::NotFound,
                format!("component-function index {index} out of range"),
            )
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_order_is_accepted() {
        let component = Component::default();
        assert!(component.validate_section_order().is_ok());
    }

    #[test]
    fn section_order_mismatch_is_rejected() {
        let component = Component {
            core_modules: vec![vec![]],
            section_order: vec![SectionKind::CoreModule, SectionKind::CoreModule],
            ..Default::default()
        };
        let err = component.validate_section_order().unwrap_err();
        assert!(err.to_string().contains("section order"));
    }
}
