//! Synthetic core-module emission.
//!
//! Bridges between core instances are realised as small, throwaway
//! core modules that import entities from their owning modules and
//! re-export them under the names a consumer expects. This module
//! builds those binaries with `wasm-encoder`, and rewrites empty
//! import-module names to the `$` sentinel, since some engines refuse
//! empty module names.

use wasm_encoder::{
    ConstExpr, EntityType, ExportKind, ExportSection, GlobalSection, ImportSection, Module,
    RawSection, TypeSection,
};
use wasmparser::{Parser, Payload};

use crate::errors::{ComponentError, Error, ErrorKind, Phase};

/// The module-name sentinel substituted for empty import-module names.
pub const EMPTY_MODULE_SENTINEL: &str = "$";

/// Default minimum size of a re-exported table.
pub const DEFAULT_TABLE_MIN: u32 = 2;

/// A core value type, as far as synthetic modules need one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreValType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl From<CoreValType> for wasm_encoder::ValType {
    fn from(ty: CoreValType) -> Self {
        match ty {
            CoreValType::I32 => Self::I32,
            CoreValType::I64 => Self::I64,
            CoreValType::F32 => Self::F32,
            CoreValType::F64 => Self::F64,
        }
    }
}

/// A function imported from its owning module and re-exported under a
/// consumer-visible name.
#[derive(Debug, Clone)]
pub struct FuncReExport {
    /// Import-module name of the owner.
    pub from_module: String,
    /// Export name within the owner.
    pub from_name: String,
    /// Name the consumer imports.
    pub export_as: String,
    /// Core parameter types.
    pub params: Vec<CoreValType>,
    /// Core result types.
    pub results: Vec<CoreValType>,
}

/// An imported, re-exported table.
#[derive(Debug, Clone)]
pub struct TableReExport {
    /// Import-module name of the owner.
    pub from_module: String,
    /// Export name within the owner.
    pub from_name: String,
    /// Name the consumer imports.
    pub export_as: String,
    /// Minimum size; [`DEFAULT_TABLE_MIN`] unless a consumer demands
    /// more.
    pub min: u32,
    /// Maximum size, if bounded.
    pub max: Option<u32>,
}

/// An imported, re-exported linear memory.
#[derive(Debug, Clone)]
pub struct MemoryReExport {
    /// Import-module name of the owner.
    pub from_module: String,
    /// Export name within the owner.
    pub from_name: String,
    /// Name the consumer imports.
    pub export_as: String,
    /// Minimum size in pages.
    pub min: u64,
    /// Maximum size in pages, if bounded.
    pub max: Option<u64>,
}

/// An imported, re-exported global.
#[derive(Debug, Clone)]
pub struct GlobalReExport {
    /// Import-module name of the owner.
    pub from_module: String,
    /// Export name within the owner.
    pub from_name: String,
    /// Name the consumer imports.
    pub export_as: String,
    /// Value type.
    pub ty: CoreValType,
    /// Mutability.
    pub mutable: bool,
}

/// Initial value of a locally defined global.
#[derive(Debug, Clone, Copy)]
pub enum GlobalInit {
    /// `i32` initialiser.
    I32(i32),
    /// `i64` initialiser.
    I64(i64),
    /// `f32` initialiser.
    F32(f32),
    /// `f64` initialiser.
    F64(f64),
}

impl GlobalInit {
    fn val_type(&self) -> CoreValType {
        match self {
            Self::I32(_) => CoreValType::I32,
            Self::I64(_) => CoreValType::I64,
            Self::F32(_) => CoreValType::F32,
            Self::F64(_) => CoreValType::F64,
        }
    }

    fn const_expr(&self) -> ConstExpr {
        match *self {
            Self::I32(v) => ConstExpr::i32_const(v),
            Self::I64(v) => ConstExpr::i64_const(v),
            Self::F32(v) => ConstExpr::f32_const(v.into()),
            Self::F64(v) => ConstExpr::f64_const(v.into()),
        }
    }
}

/// A locally defined, exported global.
#[derive(Debug, Clone)]
pub struct LocalGlobal {
    /// Export name.
    pub export_as: String,
    /// Mutability.
    pub mutable: bool,
    /// Initial value, which also fixes the type.
    pub init: GlobalInit,
}

/// The shape of one synthetic module.
#[derive(Debug, Clone, Default)]
pub struct SyntheticModule {
    /// Imported and re-exported functions.
    pub funcs: Vec<FuncReExport>,
    /// An imported and re-exported table, if any.
    pub table: Option<TableReExport>,
    /// An imported and re-exported memory, if any.
    pub memory: Option<MemoryReExport>,
    /// Imported and re-exported globals.
    pub global_imports: Vec<GlobalReExport>,
    /// Locally defined, exported globals.
    pub globals: Vec<LocalGlobal>,
}

impl SyntheticModule {
    /// Encodes the module to its binary form.
    ///
    /// Import-module names are passed through [`sanitize_module_name`],
    /// so an empty owner name never reaches the engine.
    pub fn encode(&self) -> Vec<u8> {
        let mut types = TypeSection::new();
        let mut imports = ImportSection::new();
        let mut globals = GlobalSection::new();
        let mut exports = ExportSection::new();

        for (index, func) in self.funcs.iter().enumerate() {
            types.ty().function(
                func.params.iter().map(|t| (*t).into()),
                func.results.iter().map(|t| (*t).into()),
            );
            imports.import(
                sanitize_module_name(&func.from_module),
                &func.from_name,
                EntityType::Function(index as u32),
            );
            exports.export(&func.export_as, ExportKind::Func, index as u32);
        }

        if let Some(table) = &self.table {
            imports.import(
                sanitize_module_name(&table.from_module),
                &table.from_name,
                EntityType::Table(wasm_encoder::TableType {
                    element_type: wasm_encoder::RefType::FUNCREF,
                    table64: false,
                    minimum: u64::from(table.min),
                    maximum: table.max.map(u64::from),
                    shared: false,
                }),
            );
            exports.export(&table.export_as, ExportKind::Table, 0);
        }

        if let Some(memory) = &self.memory {
            imports.import(
                sanitize_module_name(&memory.from_module),
                &memory.from_name,
                EntityType::Memory(wasm_encoder::MemoryType {
                    minimum: memory.min,
                    maximum: memory.max,
                    memory64: false,
                    shared: false,
                    page_size_log2: None,
                }),
            );
            exports.export(&memory.export_as, ExportKind::Memory, 0);
        }

        for (index, global) in self.global_imports.iter().enumerate() {
            imports.import(
                sanitize_module_name(&global.from_module),
                &global.from_name,
                EntityType::Global(wasm_encoder::GlobalType {
                    val_type: global.ty.into(),
                    mutable: global.mutable,
                    shared: false,
                }),
            );
            exports.export(&global.export_as, ExportKind::Global, index as u32);
        }

        let import_globals = self.global_imports.len() as u32;
        for (index, global) in self.globals.iter().enumerate() {
            globals.global(
                wasm_encoder::GlobalType {
                    val_type: global.init.val_type().into(),
                    mutable: global.mutable,
                    shared: false,
                },
                &global.init.const_expr(),
            );
            exports.export(
                &global.export_as,
                ExportKind::Global,
                import_globals + index as u32,
            );
        }

        let mut module = Module::new();
        if !self.funcs.is_empty() {
            module.section(&types);
        }
        module.section(&imports);
        if !self.globals.is_empty() {
            module.section(&globals);
        }
        module.section(&exports);
        module.finish()
    }
}

/// Replaces an empty import-module name with the `$` sentinel.
pub fn sanitize_module_name(name: &str) -> &str {
    if name.is_empty() {
        EMPTY_MODULE_SENTINEL
    } else {
        name
    }
}

fn parse_error(err: wasmparser::BinaryReaderError) -> Error {
    ComponentError::new(Phase::Parse, ErrorKind::InvalidData, "malformed core module")
        .with_cause(err)
        .into()
}

/// Rewrites a core module so that every import with an empty module
/// name imports from [`EMPTY_MODULE_SENTINEL`] instead. All other
/// sections are copied verbatim. Returns the input untouched when no
/// import needs the rewrite.
pub fn rewrite_empty_import_modules(bytes: &[u8]) -> Result<Vec<u8>, Error> {
    let mut needs_rewrite = false;
    for payload in Parser::new(0).parse_all(bytes) {
        if let Payload::ImportSection(reader) = payload.map_err(parse_error)? {
            for import in reader {
                if import.map_err(parse_error)?.module.is_empty() {
                    needs_rewrite = true;
                    break;
                }
            }
        }
    }
    if !needs_rewrite {
        return Ok(bytes.to_vec());
    }

    let mut out = Module::new();
    for payload in Parser::new(0).parse_all(bytes) {
        match payload.map_err(parse_error)? {
            Payload::Version { .. } | Payload::End(_) => {}
            Payload::ImportSection(reader) => {
                let mut section = ImportSection::new();
                for import in reader {
                    let import = import.map_err(parse_error)?;
                    section.import(
                        sanitize_module_name(import.module),
                        import.name,
                        entity_type(import.ty)?,
                    );
                }
                out.section(&section);
            }
            // The whole code section is copied through CodeSectionStart.
            Payload::CodeSectionEntry(_) => {}
            other => {
                if let Some((id, range)) = other.as_section() {
                    out.section(&RawSection {
                        id,
                        data: &bytes[range],
                    });
                }
            }
        }
    }
    Ok(out.finish())
}

fn entity_type(ty: wasmparser::TypeRef) -> Result<EntityType, Error> {
    use wasmparser::TypeRef;
    Ok(match ty {
        TypeRef::Func(index) => EntityType::Function(index),
        TypeRef::Table(t) => EntityType::Table(wasm_encoder::TableType {
            element_type: ref_type(t.element_type)?,
            table64: t.table64,
            minimum: t.initial,
            maximum: t.maximum,
            shared: t.shared,
        }),
        TypeRef::Memory(m) => EntityType::Memory(wasm_encoder::MemoryType {
            minimum: m.initial,
            maximum: m.maximum,
            memory64: m.memory64,
            shared: m.shared,
            page_size_log2: m.page_size_log2,
        }),
        TypeRef::Global(g) => EntityType::Global(wasm_encoder::GlobalType {
            val_type: val_type(g.content_type)?,
            mutable: g.mutable,
            shared: g.shared,
        }),
        TypeRef::Tag(_) => {
            return Err(ComponentError::new(
                Phase::Parse,
                ErrorKind::Unsupported,
                "tag imports are not supported",
            )
            .into());
        }
    })
}

fn ref_type(ty: wasmparser::RefType) -> Result<wasm_encoder::RefType, Error> {
    if ty.is_func_ref() {
        Ok(wasm_encoder::RefType::FUNCREF)
    } else if ty.is_extern_ref() {
        Ok(wasm_encoder::RefType::EXTERNREF)
    } else {
        Err(ComponentError::new(
            Phase::Parse,
            ErrorKind::Unsupported,
            "exotic reference types are not supported",
        )
        .into())
    }
}

fn val_type(ty: wasmparser::ValType) -> Result<wasm_encoder::ValType, Error> {
    use wasmparser::ValType;
    Ok(match ty {
        ValType::I32 => wasm_encoder::ValType::I32,
        ValType::I64 => wasm_encoder::ValType::I64,
        ValType::F32 => wasm_encoder::ValType::F32,
        ValType::F64 => wasm_encoder::ValType::F64,
        ValType::V128 => wasm_encoder::ValType::V128,
        ValType::Ref(_) => {
            return Err(ComponentError::new(
                Phase::Parse,
                ErrorKind::Unsupported,
                "reference-typed globals are not supported",
            )
            .into());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imports_of(bytes: &[u8]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for payload in Parser::new(0).parse_all(bytes) {
            if let Payload::ImportSection(reader) = payload.unwrap() {
                for import in reader {
                    let import = import.unwrap();
                    out.push((import.module.to_owned(), import.name.to_owned()));
                }
            }
        }
        out
    }

    fn exports_of(bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for payload in Parser::new(0).parse_all(bytes) {
            if let Payload::ExportSection(reader) = payload.unwrap() {
                for export in reader {
                    out.push(export.unwrap().name.to_owned());
                }
            }
        }
        out
    }

    #[test]
    fn synthetic_module_validates_and_re_exports() {
        let spec = SyntheticModule {
            funcs: vec![FuncReExport {
                from_module: "$src".into(),
                from_name: "f".into(),
                export_as: "callback".into(),
                params: vec![CoreValType::I32, CoreValType::I32],
                results: vec![CoreValType::I32],
            }],
            table: Some(TableReExport {
                from_module: "$src".into(),
                from_name: "table".into(),
                export_as: "__indirect_function_table".into(),
                min: DEFAULT_TABLE_MIN,
                max: None,
            }),
            memory: Some(MemoryReExport {
                from_module: "$src".into(),
                from_name: "memory".into(),
                export_as: "memory".into(),
                min: 1,
                max: None,
            }),
            global_imports: vec![GlobalReExport {
                from_module: "$src".into(),
                from_name: "sp".into(),
                export_as: "__stack_pointer".into(),
                ty: CoreValType::I32,
                mutable: true,
            }],
            globals: vec![LocalGlobal {
                export_as: "base".into(),
                mutable: false,
                init: GlobalInit::I32(1024),
            }],
        };
        let bytes = spec.encode();
        wasmparser::validate(&bytes).unwrap();
        assert_eq!(
            imports_of(&bytes),
            vec![
                ("$src".to_owned(), "f".to_owned()),
                ("$src".to_owned(), "table".to_owned()),
                ("$src".to_owned(), "memory".to_owned()),
                ("$src".to_owned(), "sp".to_owned()),
            ],
        );
        assert_eq!(
            exports_of(&bytes),
            vec![
                "callback",
                "__indirect_function_table",
                "memory",
                "__stack_pointer",
                "base",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>(),
        );
    }

    #[test]
    fn empty_owner_names_are_sanitized() {
        let spec = SyntheticModule {
            funcs: vec![FuncReExport {
                from_module: String::new(),
                from_name: "f".into(),
                export_as: "f".into(),
                params: vec![],
                results: vec![],
            }],
            ..Default::default()
        };
        let bytes = spec.encode();
        assert_eq!(imports_of(&bytes), vec![("$".to_owned(), "f".to_owned())]);
    }

    #[test]
    fn rewrite_replaces_only_empty_module_names() {
        let bytes = wat::parse_str(
            r#"(module
                (import "" "a" (func (param i32) (result i32)))
                (import "env" "b" (func))
                (import "" "mem" (memory 1))
                (func (export "id") (param i32) (result i32) local.get 0)
            )"#,
        )
        .unwrap();
        let rewritten = rewrite_empty_import_modules(&bytes).unwrap();
        wasmparser::validate(&rewritten).unwrap();
        assert_eq!(
            imports_of(&rewritten),
            vec![
                ("$".to_owned(), "a".to_owned()),
                ("env".to_owned(), "b".to_owned()),
                ("$".to_owned(), "mem".to_owned()),
            ],
        );
        // The function body must survive the raw-section copy.
        assert_eq!(exports_of(&rewritten), vec!["id".to_owned()]);
    }

    #[test]
    fn rewrite_is_identity_without_empty_names() {
        let bytes = wat::parse_str(r#"(module (import "env" "f" (func)))"#).unwrap();
        let rewritten = rewrite_empty_import_modules(&bytes).unwrap();
        assert_eq!(rewritten, bytes);
    }
}
