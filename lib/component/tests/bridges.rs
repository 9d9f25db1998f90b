//! Bridge realisation, ref-counting and instance isolation.

mod common;

use anyhow::Result;
use common::*;
use wasmer_component::{
    Component, ComponentFuncDef, CoreExternKind, ErrorKind, InterfaceType, InterfaceValue, Linker,
};

/// Module A owns a memory; module B reaches it through a virtual
/// instance, which the linker realises as a synthetic bridge module.
fn shared_memory_component() -> Component {
    Component {
        core_modules: vec![
            wat(
                r#"(module
                    (memory (export "memory") 1)
                    (func (export "poke") (param i32 i32)
                      (i32.store (local.get 0) (local.get 1))))"#,
            ),
            wat(
                r#"(module
                    (import "shared" "memory" (memory 1))
                    (func (export "peek") (param i32) (result i32)
                      (i32.load (local.get 0))))"#,
            ),
        ],
        core_instances: vec![
            instantiate(0, &[]),
            from_exports(&[("memory", CoreExternKind::Memory, 0)]),
            instantiate(1, &[("shared", 1)]),
        ],
        core_memories: vec![memory_ref(0, "memory")],
        core_funcs: vec![alias(0, "poke"), alias(2, "peek")],
        types: vec![
            func_type(
                &[("addr", InterfaceType::U32), ("value", InterfaceType::U32)],
                &[],
            ),
            func_type(&[("addr", InterfaceType::U32)], &[InterfaceType::U32]),
        ],
        component_funcs: vec![lift(0, 0), lift(1, 1)],
        exports: vec![export_func("poke", 0), export_func("peek", 1)],
        ..Default::default()
    }
}

#[test]
fn synthetic_bridge_shares_memory_between_modules() -> Result<()> {
    let linker = Linker::default();
    let mut instance = linker.instantiate(shared_memory_component())?;
    instance.call("poke", &[64u32.into(), 99u32.into()])?;
    assert_eq!(
        instance.call("peek", &[64u32.into()])?,
        vec![InterfaceValue::U32(99)]
    );
    Ok(())
}

#[test]
fn bridges_are_shared_and_disposed_at_zero_refs() -> Result<()> {
    let linker = Linker::default();
    let pre = linker.instantiate_pre(shared_memory_component())?;

    let mut first = pre.instantiate()?;
    let mut second = pre.instantiate()?;
    assert_eq!(
        linker.cached_bridge_count(),
        1,
        "both instances share one engine-level bridge module"
    );

    // Closing one instance leaves the bridge usable by the other.
    first.close();
    assert_eq!(linker.cached_bridge_count(), 1);
    second.call("poke", &[8u32.into(), 1u32.into()])?;
    assert_eq!(
        second.call("peek", &[8u32.into()])?,
        vec![InterfaceValue::U32(1)]
    );

    // Closing the last owner disposes it.
    second.close();
    assert_eq!(linker.cached_bridge_count(), 0);
    Ok(())
}

#[test]
fn live_instances_share_no_mutable_state() -> Result<()> {
    let linker = Linker::default();
    let pre = linker.instantiate_pre(shared_memory_component())?;
    let mut first = pre.instantiate()?;
    let mut second = pre.instantiate()?;
    assert_ne!(first.id(), second.id());

    first.call("poke", &[128u32.into(), 7u32.into()])?;
    assert_eq!(
        first.call("peek", &[128u32.into()])?,
        vec![InterfaceValue::U32(7)]
    );
    // The write is invisible from the sibling instance.
    assert_eq!(
        second.call("peek", &[128u32.into()])?,
        vec![InterfaceValue::U32(0)]
    );
    Ok(())
}

#[test]
fn per_instance_globals_stay_isolated() -> Result<()> {
    let component = Component {
        core_modules: vec![wat(
            r#"(module
                (global $n (mut i32) (i32.const 0))
                (func (export "bump") (result i32)
                  (global.set $n (i32.add (global.get $n) (i32.const 1)))
                  (global.get $n)))"#,
        )],
        core_instances: vec![instantiate(0, &[])],
        core_funcs: vec![alias(0, "bump")],
        types: vec![func_type(&[], &[InterfaceType::U32])],
        component_funcs: vec![lift(0, 0)],
        exports: vec![export_func("bump", 0)],
        ..Default::default()
    };
    let linker = Linker::default();
    let pre = linker.instantiate_pre(component)?;
    let mut first = pre.instantiate()?;
    let mut second = pre.instantiate()?;

    assert_eq!(first.call("bump", &[])?, vec![InterfaceValue::U32(1)]);
    assert_eq!(first.call("bump", &[])?, vec![InterfaceValue::U32(2)]);
    assert_eq!(second.call("bump", &[])?, vec![InterfaceValue::U32(1)]);
    Ok(())
}

#[test]
fn topological_order_is_stable_across_pres() -> Result<()> {
    // Two pre-instantiations of the same component must produce
    // identical instantiation orders; the instances they create behave
    // identically.
    let linker = Linker::default();
    let pre_a = linker.instantiate_pre(shared_memory_component())?;
    let pre_b = linker.instantiate_pre(shared_memory_component())?;
    let mut a = pre_a.instantiate()?;
    let mut b = pre_b.instantiate()?;
    a.call("poke", &[16u32.into(), 3u32.into()])?;
    b.call("poke", &[16u32.into(), 3u32.into()])?;
    assert_eq!(a.call("peek", &[16u32.into()])?, b.call("peek", &[16u32.into()])?);
    Ok(())
}

#[test]
fn cyclic_re_exports_resolve_to_not_found() -> Result<()> {
    let component = Component {
        component_funcs: vec![
            ComponentFuncDef::ReExport { func: 1 },
            ComponentFuncDef::ReExport { func: 0 },
        ],
        exports: vec![export_func("loop", 0)],
        ..Default::default()
    };
    let linker = Linker::default();
    let mut instance = linker.instantiate(component)?;
    let err = instance.call("loop", &[]).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
    Ok(())
}

#[test]
fn trap_stubs_fire_only_when_called() -> Result<()> {
    // The virtual instance does not export `missing`; the import is
    // filled with a trap stub, and only calling it fails.
    let component = Component {
        core_modules: vec![wat(
            r#"(module
                (import "partial" "missing" (func $missing (result i32)))
                (func (export "ok") (result i32) (i32.const 5))
                (func (export "bad") (result i32) (call $missing)))"#,
        )],
        core_instances: vec![
            from_exports(&[]),
            instantiate(0, &[("partial", 0)]),
        ],
        core_funcs: vec![alias(1, "ok"), alias(1, "bad")],
        types: vec![func_type(&[], &[InterfaceType::U32])],
        component_funcs: vec![lift(0, 0), lift(1, 0)],
        exports: vec![export_func("ok", 0), export_func("bad", 1)],
        ..Default::default()
    };
    let linker = Linker::default();
    let mut instance = linker.instantiate(component)?;
    assert_eq!(instance.call("ok", &[])?, vec![InterfaceValue::U32(5)]);
    let err = instance.call("bad", &[]).unwrap_err();
    assert!(
        err.to_string().contains("unresolved host import"),
        "trap message should name the unresolved import: {err}"
    );
    Ok(())
}
