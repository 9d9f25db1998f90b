//! The invocation layer: per-export calling conventions.
//!
//! [`Instance::call`] applies the canonical ABI when the export was
//! lifted with canonical options, falls back to a best-effort
//! primitive widener when it was not, and always runs the post-return
//! cleanup hook after the caller has observed the decoded results.
//! [`Instance::call_raw`] bypasses all of it and moves raw words.

use std::sync::Arc;

use wasmer::{Function, Store, Value};

use crate::abi::{
    uses_retptr, AbiMemory, FlatReader, FlatValue, GuestMemory, LiftContext, LowerContext,
};
use crate::context;
use crate::errors::{ComponentError, Error, ErrorKind, Phase};
use crate::instance::{ExportTarget, Instance, InstanceShared, LiftedOptions};
use crate::types::InterfaceType;
use crate::values::InterfaceValue;

impl Instance {
    /// Calls a typed export with host values, returning the decoded
    /// results.
    pub fn call(
        &mut self,
        name: &str,
        args: &[InterfaceValue],
    ) -> Result<Vec<InterfaceValue>, Error> {
        self.ensure_open()?;
        let target = self
            .exports
            .get(name)
            .cloned()
            .ok_or_else(|| Error::export_not_found(name))?;
        let id = self.id();
        let store = &mut self.store;
        let shared = &self.shared;
        context::with_current_instance(id, || invoke(store, shared, &target, args))
    }

    /// Calls an export with raw word-sized arguments: no coercion, no
    /// canonical ABI, results returned as raw words.
    pub fn call_raw(&mut self, name: &str, args: &[u64]) -> Result<Vec<u64>, Error> {
        self.ensure_open()?;
        let target = self
            .exports
            .get(name)
            .cloned()
            .ok_or_else(|| Error::export_not_found(name))?;
        let ExportTarget::Core { func, .. } = &target else {
            return Err(ComponentError::new(
                Phase::Runtime,
                ErrorKind::Unsupported,
                format!("`{name}` is not backed by a core function"),
            )
            .into());
        };
        let id = self.id();
        let store = &mut self.store;

        let ty = func.ty(&*store);
        if args.len() != ty.params().len() {
            return Err(arity_error(ty.params().len(), args.len()));
        }
        let core_args: Vec<Value> = args
            .iter()
            .zip(ty.params())
            .map(|(bits, ty)| raw_to_value(*bits, *ty))
            .collect::<Result<_, _>>()?;

        let results = context::with_current_instance(id, || func.call(store, &core_args))?;
        results.iter().map(value_to_raw).collect()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(ComponentError::new(
                Phase::Runtime,
                ErrorKind::NotInitialized,
                "instance is closed",
            )
            .into());
        }
        Ok(())
    }
}

/// Dispatches a resolved export target. Also used to drive the start
/// function during instantiation.
pub(crate) fn invoke(
    store: &mut Store,
    shared: &Arc<InstanceShared>,
    target: &ExportTarget,
    args: &[InterfaceValue],
) -> Result<Vec<InterfaceValue>, Error> {
    match target {
        ExportTarget::Host { def } => {
            if args.len() != def.params.len() {
                return Err(arity_error(def.params.len(), args.len()));
            }
            (def.handler)(shared.host_context(), args)
        }
        ExportTarget::Core {
            func,
            canon: Some(opts),
        } => call_canonical(store, shared, func, opts, args),
        ExportTarget::Core { func, canon: None } => call_coerced(store, func, args),
    }
}

/// The full canonical path: lower, call, lift (retptr-aware), retire
/// borrows, post-return.
fn call_canonical(
    store: &mut Store,
    shared: &Arc<InstanceShared>,
    func: &Function,
    opts: &LiftedOptions,
    args: &[InterfaceValue],
) -> Result<Vec<InterfaceValue>, Error> {
    if args.len() != opts.params.len() {
        return Err(arity_error(opts.params.len(), args.len()));
    }
    let encoding = opts.string_encoding;
    let params_use_resources = opts.params.iter().any(InterfaceType::uses_resources);
    let results_use_resources = opts.results.iter().any(InterfaceType::uses_resources);

    // Lower the arguments, allocating guest buffers through the
    // component's realloc.
    let mut lowered_borrows: Vec<(u32, u32)> = Vec::new();
    let flat_args = {
        let mut mem = GuestMemory::new(store, opts.memory.clone(), opts.realloc.clone());
        if params_use_resources {
            let mut resources = shared.lock_resources();
            let mut cx = LowerContext::with_resources(&mut mem, encoding, &mut resources);
            let flat = cx.lower_all(args, &opts.params);
            lowered_borrows = cx.lowered_borrows.clone();
            flat
        } else {
            LowerContext::new(&mut mem, encoding).lower_all(args, &opts.params)
        }
    };
    let flat_args = match flat_args {
        Ok(flat) => flat,
        Err(err) => {
            retire_lowered_borrows(shared, &mut lowered_borrows);
            return Err(err);
        }
    };

    let core_args: Vec<Value> = flat_args.iter().map(|v| v.to_core()).collect();
    let core_results = match func.call(store, &core_args) {
        Ok(results) => results,
        Err(trap) => {
            retire_lowered_borrows(shared, &mut lowered_borrows);
            return Err(trap.into());
        }
    };
    retire_lowered_borrows(shared, &mut lowered_borrows);

    let mut flat_results = Vec::with_capacity(core_results.len());
    for value in core_results.iter() {
        flat_results.push(FlatValue::from_core(value)?);
    }

    // Decode the results, following the return pointer when the flat
    // shape does not fit the value stack.
    let retptr = uses_retptr(&opts.results);
    let mut lifted_borrows: Vec<(u32, u32)> = Vec::new();
    let values = {
        let mem = GuestMemory::new(store, opts.memory.clone(), opts.realloc.clone());
        if results_use_resources {
            let mut resources = shared.lock_resources();
            let mut cx = LiftContext::with_resources(&mem, encoding, &mut resources);
            let values = lift_results(&mut cx, &opts.results, &flat_results, retptr);
            lifted_borrows = cx.lifted_borrows.clone();
            values
        } else {
            let mut cx = LiftContext::new(&mem, encoding);
            lift_results(&mut cx, &opts.results, &flat_results, retptr)
        }
    };
    if !lifted_borrows.is_empty() {
        let mut resources = shared.lock_resources();
        for (ty, handle) in lifted_borrows.drain(..) {
            if let Err(err) = resources.end_lift_borrow(ty, handle) {
                tracing::warn!(%err, "failed to end lifted borrow");
            }
        }
    }
    let values = values?;

    // The guest may now reclaim the buffers the encoder wrote; errors
    // here are logged and never fail the call, the results are already
    // materialised.
    if let Some(post_return) = &opts.post_return {
        if let Err(err) = post_return.call(store, &core_results) {
            tracing::warn!(%err, "post-return hook failed");
        }
    }

    Ok(values)
}

fn lift_results<M: AbiMemory>(
    cx: &mut LiftContext<'_, M>,
    types: &[InterfaceType],
    flat: &[FlatValue],
    retptr: bool,
) -> Result<Vec<InterfaceValue>, Error> {
    if retptr {
        let ptr = flat
            .first()
            .ok_or_else(|| {
                Error::from(ComponentError::decode(
                    ErrorKind::TypeMismatch,
                    "wide results need a return pointer, but the call returned nothing",
                ))
            })?
            .as_ptr()?;
        cx.load_all(types, ptr)
    } else {
        let mut reader = FlatReader::new(flat);
        cx.lift_all(types, &mut reader)
    }
}

fn retire_lowered_borrows(shared: &Arc<InstanceShared>, borrows: &mut Vec<(u32, u32)>) {
    if borrows.is_empty() {
        return;
    }
    let mut resources = shared.lock_resources();
    for (ty, handle) in borrows.drain(..) {
        if let Err(err) = resources.end_lower_borrow(ty, handle) {
            tracing::warn!(%err, "failed to end lowered borrow");
        }
    }
}

/// The no-canonical-options path: a best-effort primitive widener onto
/// the core signature.
fn call_coerced(
    store: &mut Store,
    func: &Function,
    args: &[InterfaceValue],
) -> Result<Vec<InterfaceValue>, Error> {
    let ty = func.ty(&*store);
    if args.len() != ty.params().len() {
        return Err(arity_error(ty.params().len(), args.len()));
    }
    let core_args: Vec<Value> = args
        .iter()
        .zip(ty.params())
        .map(|(value, ty)| widen(value, *ty))
        .collect::<Result<_, _>>()?;
    let results = func.call(store, &core_args)?;
    results.iter().map(narrow).collect()
}

/// Widens a host primitive onto a core value type: integer widths
/// stretch, booleans become 0/1, floats may be bit-cast. Anything else
/// cannot be coerced.
fn widen(value: &InterfaceValue, ty: wasmer::Type) -> Result<Value, Error> {
    use InterfaceValue as V;
    let coerced = match (value, ty) {
        (V::Bool(v), wasmer::Type::I32) => Some(Value::I32(i32::from(*v))),
        (V::S8(v), wasmer::Type::I32) => Some(Value::I32(i32::from(*v))),
        (V::U8(v), wasmer::Type::I32) => Some(Value::I32(i32::from(*v))),
        (V::S16(v), wasmer::Type::I32) => Some(Value::I32(i32::from(*v))),
        (V::U16(v), wasmer::Type::I32) => Some(Value::I32(i32::from(*v))),
        (V::S32(v), wasmer::Type::I32) => Some(Value::I32(*v)),
        (V::U32(v), wasmer::Type::I32) => Some(Value::I32(*v as i32)),
        (V::Char(v), wasmer::Type::I32) => Some(Value::I32(*v as u32 as i32)),
        (V::F32(v), wasmer::Type::I32) => Some(Value::I32(v.to_bits() as i32)),

        (V::Bool(v), wasmer::Type::I64) => Some(Value::I64(i64::from(*v))),
        (V::S8(v), wasmer::Type::I64) => Some(Value::I64(i64::from(*v))),
        (V::U8(v), wasmer::Type::I64) => Some(Value::I64(i64::from(*v))),
        (V::S16(v), wasmer::Type::I64) => Some(Value::I64(i64::from(*v))),
        (V::U16(v), wasmer::Type::I64) => Some(Value::I64(i64::from(*v))),
        (V::S32(v), wasmer::Type::I64) => Some(Value::I64(i64::from(*v))),
        (V::U32(v), wasmer::Type::I64) => Some(Value::I64(i64::from(*v))),
        (V::S64(v), wasmer::Type::I64) => Some(Value::I64(*v)),
        (V::U64(v), wasmer::Type::I64) => Some(Value::I64(*v as i64)),
        (V::Char(v), wasmer::Type::I64) => Some(Value::I64(i64::from(*v as u32))),
        (V::F64(v), wasmer::Type::I64) => Some(Value::I64(v.to_bits() as i64)),

        (V::F32(v), wasmer::Type::F32) => Some(Value::F32(*v)),
        (V::U32(v), wasmer::Type::F32) => Some(Value::F32(f32::from_bits(*v))),
        (V::S32(v), wasmer::Type::F32) => Some(Value::F32(f32::from_bits(*v as u32))),

        (V::F64(v), wasmer::Type::F64) => Some(Value::F64(*v)),
        (V::U64(v), wasmer::Type::F64) => Some(Value::F64(f64::from_bits(*v))),
        (V::S64(v), wasmer::Type::F64) => Some(Value::F64(f64::from_bits(*v as u64))),

        _ => None,
    };
    coerced.ok_or_else(|| Error::cannot_coerce(value.host_type(), type_name(ty)))
}

fn narrow(value: &Value) -> Result<InterfaceValue, Error> {
    match value {
        Value::I32(v) => Ok(InterfaceValue::S32(*v)),
        Value::I64(v) => Ok(InterfaceValue::S64(*v)),
        Value::F32(v) => Ok(InterfaceValue::F32(*v)),
        Value::F64(v) => Ok(InterfaceValue::F64(*v)),
        other => Err(ComponentError::decode(
            ErrorKind::Unsupported,
            format!("core result {other:?} has no host representation"),
        )
        .into()),
    }
}

fn raw_to_value(bits: u64, ty: wasmer::Type) -> Result<Value, Error> {
    match ty {
        wasmer::Type::I32 => Ok(Value::I32(bits as u32 as i32)),
        wasmer::Type::I64 => Ok(Value::I64(bits as i64)),
        wasmer::Type::F32 => Ok(Value::F32(f32::from_bits(bits as u32))),
        wasmer::Type::F64 => Ok(Value::F64(f64::from_bits(bits))),
        other => Err(ComponentError::new(
            Phase::Runtime,
            ErrorKind::Unsupported,
            format!("raw calls cannot carry {other:?} parameters"),
        )
        .into()),
    }
}

fn value_to_raw(value: &Value) -> Result<u64, Error> {
    match value {
        Value::I32(v) => Ok(u64::from(*v as u32)),
        Value::I64(v) => Ok(*v as u64),
        Value::F32(v) => Ok(u64::from(v.to_bits())),
        Value::F64(v) => Ok(v.to_bits()),
        other => Err(ComponentError::new(
            Phase::Runtime,
            ErrorKind::Unsupported,
            format!("raw calls cannot carry {other:?} results"),
        )
        .into()),
    }
}

fn arity_error(expected: usize, got: usize) -> Error {
    ComponentError::new(
        Phase::Validate,
        ErrorKind::InvalidInput,
        format!("expected {expected} argument(s), got {got}"),
    )
    .into()
}

fn type_name(ty: wasmer::Type) -> &'static str {
    match ty {
        wasmer::Type::I32 => "i32",
        wasmer::Type::I64 => "i64",
        wasmer::Type::F32 => "f32",
        wasmer::Type::F64 => "f64",
        wasmer::Type::V128 => "v128",
        wasmer::Type::ExternRef => "externref",
        wasmer::Type::FuncRef => "funcref",
        wasmer::Type::ExceptionRef => "exceptionref",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widener_matrix() {
        assert_eq!(
            widen(&InterfaceValue::Bool(true), wasmer::Type::I32).unwrap(),
            Value::I32(1)
        );
        assert_eq!(
            widen(&InterfaceValue::U8(200), wasmer::Type::I64).unwrap(),
            Value::I64(200)
        );
        assert_eq!(
            widen(&InterfaceValue::S16(-3), wasmer::Type::I32).unwrap(),
            Value::I32(-3)
        );
        assert_eq!(
            widen(&InterfaceValue::U32(u32::MAX), wasmer::Type::I32).unwrap(),
            Value::I32(-1)
        );
        let Value::F32(bits) = widen(&InterfaceValue::U32(0x3f80_0000), wasmer::Type::F32).unwrap()
        else {
            panic!("expected f32");
        };
        assert_eq!(bits, 1.0);
    }

    #[test]
    fn widener_rejects_compounds() {
        let err = widen(&InterfaceValue::String("x".into()), wasmer::Type::I32).unwrap_err();
        assert_eq!(err.kind(), Some(crate::errors::ErrorKind::TypeMismatch));
        let err = widen(&InterfaceValue::U64(1), wasmer::Type::I32).unwrap_err();
        assert_eq!(err.kind(), Some(crate::errors::ErrorKind::TypeMismatch));
    }

    #[test]
    fn raw_words_round_trip() {
        let v = raw_to_value(0xffff_ffff, wasmer::Type::I32).unwrap();
        assert_eq!(value_to_raw(&v).unwrap(), 0xffff_ffff);
        let v = raw_to_value(f64::to_bits(2.5), wasmer::Type::F64).unwrap();
        assert_eq!(value_to_raw(&v).unwrap(), f64::to_bits(2.5));
    }
}
