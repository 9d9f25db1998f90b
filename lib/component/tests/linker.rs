//! End-to-end scenarios: typed calls through real wasm modules.

mod common;

use anyhow::Result;
use common::*;
use wasmer_component::{
    Component, ComponentFuncDef, Error, ErrorKind, InterfaceType, InterfaceValue, Linker,
    LinkerConfig, StartDecl,
};

fn add_handler(
    _cx: wasmer_component::HostContext<'_>,
    args: &[InterfaceValue],
) -> std::result::Result<Vec<InterfaceValue>, Error> {
    let (InterfaceValue::U32(a), InterfaceValue::U32(b)) = (&args[0], &args[1]) else {
        panic!("host `add` called with {args:?}");
    };
    Ok(vec![InterfaceValue::U32(a + b)])
}

#[test]
fn simple_compute() -> Result<()> {
    let linker = Linker::default();
    let mut instance = linker.instantiate(compute_component())?;
    let results = instance.call("compute", &[5u32.into(), 6u32.into()])?;
    assert_eq!(results, vec![InterfaceValue::U32(30)]);
    Ok(())
}

#[test]
fn compute_using_host_callback() -> Result<()> {
    let linker = Linker::default();
    linker.define_func(
        "test:minimal/host@0.1.0#add",
        add_handler,
        vec![InterfaceType::U32, InterfaceType::U32],
        vec![InterfaceType::U32],
    )?;
    let mut instance = linker.instantiate(host_callback_component())?;
    let results = instance.call("compute-using-host", &[10u32.into(), 5u32.into()])?;
    assert_eq!(results, vec![InterfaceValue::U32(15)]);
    Ok(())
}

#[test]
fn strings_round_trip() -> Result<()> {
    let linker = Linker::default();
    let mut instance = linker.instantiate(echo_component(false))?;
    let results = instance.call("echo", &["hello".into()])?;
    assert_eq!(results, vec![InterfaceValue::String("hello".into())]);

    // Non-ASCII goes through the same UTF-8 path.
    let results = instance.call("echo", &["grüße 🌍".into()])?;
    assert_eq!(results, vec![InterfaceValue::String("grüße 🌍".into())]);
    Ok(())
}

#[test]
fn record_by_retptr_round_trips() -> Result<()> {
    let linker = Linker::default();
    let mut instance = linker.instantiate(echo_component(false))?;
    let person = InterfaceValue::Record(vec![
        ("name".to_owned(), InterfaceValue::String("Alice".into())),
        ("age".to_owned(), InterfaceValue::U32(30)),
    ]);
    let results = instance.call("echo-person", &[person.clone()])?;
    assert_eq!(results, vec![person]);
    Ok(())
}

#[test]
fn missing_import_fails_fast_with_every_path() {
    let linker = Linker::default();
    let err = linker
        .instantiate(host_callback_component())
        .err()
        .expect("unregistered host import must fail pre-instantiation");
    let Error::MissingImports(missing) = err else {
        panic!("expected MissingImports, got {err}");
    };
    assert_eq!(missing.len(), 1);
    let rendered = missing.to_string();
    assert!(rendered.contains("test:minimal/host@0.1.0"));
    assert!(rendered.contains("add"));
}

fn semver_component() -> Component {
    Component {
        core_modules: vec![wat(
            r#"(module
                (import "test:dep/iface@0.2.0" "read" (func $read (result i32)))
                (func (export "get") (result i32) (call $read)))"#,
        )],
        core_instances: vec![instantiate(0, &[])],
        core_funcs: vec![alias(0, "get")],
        types: vec![func_type(&[], &[InterfaceType::U32])],
        component_funcs: vec![lift(0, 0)],
        exports: vec![export_func("get", 0)],
        ..Default::default()
    }
}

#[test]
fn semver_matching_resolves_compatible_patch() -> Result<()> {
    let linker = Linker::default();
    linker.define_func(
        "test:dep/iface@0.2.1#read",
        |_cx, _args| Ok(vec![InterfaceValue::U32(7)]),
        vec![],
        vec![InterfaceType::U32],
    )?;
    let mut instance = linker.instantiate(semver_component())?;
    assert_eq!(instance.call("get", &[])?, vec![InterfaceValue::U32(7)]);
    Ok(())
}

#[test]
fn semver_matching_off_misses_compatible_patch() -> Result<()> {
    let engine = wasmer::Engine::default();
    let linker = Linker::with_config(
        engine,
        LinkerConfig {
            semver_matching: false,
            ..Default::default()
        },
    );
    linker.define_func(
        "test:dep/iface@0.2.1#read",
        |_cx, _args| Ok(vec![InterfaceValue::U32(7)]),
        vec![],
        vec![InterfaceType::U32],
    )?;
    let err = linker.instantiate(semver_component()).err().expect(
        "an exact-version miss must not resolve when semver matching is off",
    );
    assert!(matches!(err, Error::MissingImports(_)));
    Ok(())
}

#[test]
fn post_return_runs_and_its_trap_is_swallowed() -> Result<()> {
    let linker = Linker::default();
    let mut instance = linker.instantiate(echo_component(true))?;
    // `post-echo` hits an unreachable; the call must still succeed.
    let results = instance.call("echo", &["still fine".into()])?;
    assert_eq!(results, vec![InterfaceValue::String("still fine".into())]);
    Ok(())
}

#[test]
fn start_function_runs_before_first_call() -> Result<()> {
    let component = Component {
        core_modules: vec![wat(
            r#"(module
                (global $n (mut i32) (i32.const 0))
                (func (export "init") (global.set $n (i32.const 42)))
                (func (export "get") (result i32) (global.get $n)))"#,
        )],
        core_instances: vec![instantiate(0, &[])],
        core_funcs: vec![alias(0, "init"), alias(0, "get")],
        types: vec![func_type(&[], &[InterfaceType::U32])],
        component_funcs: vec![ComponentFuncDef::CoreAlias { core_func: 0 }, lift(1, 0)],
        start: Some(StartDecl {
            func: 0,
            args: vec![],
        }),
        exports: vec![export_func("get", 1)],
        ..Default::default()
    };
    let linker = Linker::default();
    let mut instance = linker.instantiate(component)?;
    assert_eq!(instance.call("get", &[])?, vec![InterfaceValue::U32(42)]);
    Ok(())
}

#[test]
fn call_raw_moves_raw_words() -> Result<()> {
    let linker = Linker::default();
    let mut instance = linker.instantiate(compute_component())?;
    assert_eq!(instance.call_raw("compute", &[5, 6])?, vec![30]);
    assert!(instance.call_raw("compute", &[5]).is_err());
    Ok(())
}

#[test]
fn unknown_export_is_not_found() -> Result<()> {
    let linker = Linker::default();
    let mut instance = linker.instantiate(compute_component())?;
    let err = instance.call("nope", &[]).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
    Ok(())
}

#[test]
fn arity_mismatch_is_rejected_before_the_guest_runs() -> Result<()> {
    let linker = Linker::default();
    let mut instance = linker.instantiate(compute_component())?;
    let err = instance.call("compute", &[1u32.into()]).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::InvalidInput));
    Ok(())
}

#[test]
fn instance_exports_surface_methods() -> Result<()> {
    let mut component = compute_component();
    component.exports = vec![wasmer_component::ComponentExport {
        name: "calc".to_owned(),
        sort: wasmer_component::ExportSort::Instance(vec![("mul".to_owned(), 0)]),
    }];
    let linker = Linker::default();
    let mut instance = linker.instantiate(component)?;
    let results = instance.call("calc#mul", &[3u32.into(), 9u32.into()])?;
    assert_eq!(results, vec![InterfaceValue::U32(27)]);
    Ok(())
}

#[test]
fn closed_instances_reject_calls() -> Result<()> {
    let linker = Linker::default();
    let mut instance = linker.instantiate(compute_component())?;
    instance.close();
    instance.close(); // idempotent
    let err = instance.call("compute", &[1u32.into(), 2u32.into()]).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotInitialized));
    Ok(())
}
