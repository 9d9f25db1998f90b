#![allow(dead_code)]

use wasmer_component::{
    CanonicalOptions, Component, ComponentExport, ComponentFuncDef, ComponentImport,
    CoreExportDecl, CoreExportRef, CoreExternKind, CoreFuncDef, CoreInstanceDecl, ExportSort,
    InstantiateArg, InterfaceFuncType, InterfaceType, TypeDef,
};

pub fn wat(text: &str) -> Vec<u8> {
    ::wat::parse_str(text).expect("test module source must assemble")
}

pub fn func_type(params: &[(&str, InterfaceType)], results: &[InterfaceType]) -> TypeDef {
    TypeDef::Func(InterfaceFuncType::new(
        params
            .iter()
            .map(|(name, ty)| ((*name).to_owned(), ty.clone()))
            .collect(),
        results.to_vec(),
    ))
}

pub fn instantiate(module: u32, args: &[(&str, u32)]) -> CoreInstanceDecl {
    CoreInstanceDecl::Instantiate {
        module,
        args: args
            .iter()
            .map(|(name, instance)| InstantiateArg {
                name: (*name).to_owned(),
                instance: *instance,
            })
            .collect(),
    }
}

pub fn from_exports(exports: &[(&str, CoreExternKind, u32)]) -> CoreInstanceDecl {
    CoreInstanceDecl::FromExports {
        exports: exports
            .iter()
            .map(|(name, kind, index)| CoreExportDecl {
                name: (*name).to_owned(),
                kind: *kind,
                index: *index,
            })
            .collect(),
    }
}

pub fn alias(instance: u32, name: &str) -> CoreFuncDef {
    CoreFuncDef::Alias {
        instance,
        name: name.to_owned(),
    }
}

pub fn lower(func: u32) -> CoreFuncDef {
    CoreFuncDef::Lower {
        func,
        opts: CanonicalOptions::default(),
    }
}

pub fn lift(core_func: u32, ty: u32) -> ComponentFuncDef {
    ComponentFuncDef::Lift {
        core_func,
        ty,
        opts: CanonicalOptions::default(),
    }
}

pub fn lift_with(core_func: u32, ty: u32, opts: CanonicalOptions) -> ComponentFuncDef {
    ComponentFuncDef::Lift {
        core_func,
        ty,
        opts,
    }
}

pub fn import(import: u32, name: &str) -> ComponentFuncDef {
    ComponentFuncDef::Import {
        import,
        name: name.to_owned(),
    }
}

pub fn export_func(name: &str, index: u32) -> ComponentExport {
    ComponentExport {
        name: name.to_owned(),
        sort: ExportSort::Func(index),
    }
}

pub fn component_import(name: &str) -> ComponentImport {
    ComponentImport {
        name: name.to_owned(),
    }
}

pub fn memory_ref(instance: u32, name: &str) -> CoreExportRef {
    CoreExportRef {
        instance,
        name: name.to_owned(),
    }
}

/// A guest with a linear memory, a bump `cabi_realloc` and exports
/// echoing a string and a `{name, age}` record through a return area.
pub const ECHO_GUEST: &str = r#"
(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 4096))
  (func (export "cabi_realloc") (param i32 i32 i32 i32) (result i32)
    (local $ptr i32)
    (local.set $ptr
      (i32.and (i32.add (global.get $next) (i32.const 7)) (i32.const -8)))
    (global.set $next (i32.add (local.get $ptr) (local.get 3)))
    (local.get $ptr))
  (func (export "echo") (param i32 i32) (result i32)
    (i32.store (i32.const 16) (local.get 0))
    (i32.store (i32.const 20) (local.get 1))
    (i32.const 16))
  (func (export "echo-person") (param i32 i32 i32) (result i32)
    (i32.store (i32.const 32) (local.get 0))
    (i32.store (i32.const 36) (local.get 1))
    (i32.store (i32.const 40) (local.get 2))
    (i32.const 32))
  (func (export "post-echo") (param i32)
    unreachable))
"#;

/// Component with a single module exporting `compute(a, b) = a * b`.
pub fn compute_component() -> Component {
    Component {
        core_modules: vec![wat(
            r#"(module
                (func (export "compute") (param i32 i32) (result i32)
                  (i32.mul (local.get 0) (local.get 1))))"#,
        )],
        core_instances: vec![instantiate(0, &[])],
        core_funcs: vec![alias(0, "compute")],
        types: vec![func_type(
            &[("a", InterfaceType::U32), ("b", InterfaceType::U32)],
            &[InterfaceType::U32],
        )],
        component_funcs: vec![lift(0, 0)],
        exports: vec![export_func("compute", 0)],
        ..Default::default()
    }
}

/// Component whose module calls back into the registered host `add`.
pub fn host_callback_component() -> Component {
    Component {
        core_modules: vec![wat(
            r#"(module
                (import "test:minimal/host@0.1.0" "add"
                  (func $add (param i32 i32) (result i32)))
                (func (export "compute-using-host") (param i32 i32) (result i32)
                  (call $add (local.get 0) (local.get 1))))"#,
        )],
        core_instances: vec![
            from_exports(&[("add", CoreExternKind::Func, 0)]),
            instantiate(0, &[("test:minimal/host@0.1.0", 0)]),
        ],
        core_funcs: vec![lower(0), alias(1, "compute-using-host")],
        types: vec![func_type(
            &[("a", InterfaceType::U32), ("b", InterfaceType::U32)],
            &[InterfaceType::U32],
        )],
        component_funcs: vec![import(0, "add"), lift(1, 0)],
        imports: vec![component_import("test:minimal/host@0.1.0")],
        exports: vec![export_func("compute-using-host", 1)],
        ..Default::default()
    }
}

/// Component around [`ECHO_GUEST`] exporting `echo(string) -> string`
/// and `echo-person(record) -> record`, with canonical memory and
/// realloc options.
pub fn echo_component(with_post_return: bool) -> Component {
    let person = InterfaceType::Record(vec![
        ("name".to_owned(), InterfaceType::String),
        ("age".to_owned(), InterfaceType::U32),
    ]);
    let canon = CanonicalOptions {
        memory: Some(0),
        realloc: Some(2),
        post_return: with_post_return.then_some(3),
        ..Default::default()
    };
    Component {
        core_modules: vec![wat(ECHO_GUEST)],
        core_instances: vec![instantiate(0, &[])],
        core_memories: vec![memory_ref(0, "memory")],
        core_funcs: vec![
            alias(0, "echo"),
            alias(0, "echo-person"),
            alias(0, "cabi_realloc"),
            alias(0, "post-echo"),
        ],
        types: vec![
            func_type(&[("s", InterfaceType::String)], &[InterfaceType::String]),
            func_type(&[("p", person.clone())], &[person]),
        ],
        component_funcs: vec![
            lift_with(0, 0, canon.clone()),
            lift_with(1, 1, canon),
        ],
        exports: vec![export_func("echo", 0), export_func("echo-person", 1)],
        ..Default::default()
    }
}
