//! Flat-call and linear-memory layout rules of the canonical ABI.
//!
//! Every interface type has two representations: a list of flat core
//! value slots used for parameters and small results, and a
//! `{size, align}` layout used when values live in linear memory.
//! A result list that needs more than [`MAX_FLAT_RESULTS`] slots comes
//! back through a return pointer instead of the value stack.

use crate::errors::{ComponentError, Error, ErrorKind, Phase};
use crate::types::InterfaceType;

/// Results wider than this many flat slots travel through a return
/// pointer.
pub const MAX_FLAT_RESULTS: usize = 1;

/// The type of one flat core value slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatType {
    /// 32-bit integer slot.
    I32,
    /// 64-bit integer slot.
    I64,
    /// 32-bit float slot.
    F32,
    /// 64-bit float slot.
    F64,
}

impl FlatType {
    /// The engine-level value type of this slot.
    pub fn to_core(self) -> wasmer::Type {
        match self {
            Self::I32 => wasmer::Type::I32,
            Self::I64 => wasmer::Type::I64,
            Self::F32 => wasmer::Type::F32,
            Self::F64 => wasmer::Type::F64,
        }
    }
}

/// One flat core value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlatValue {
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
}

impl FlatValue {
    /// The slot type of this value.
    pub fn ty(&self) -> FlatType {
        match self {
            Self::I32(_) => FlatType::I32,
            Self::I64(_) => FlatType::I64,
            Self::F32(_) => FlatType::F32,
            Self::F64(_) => FlatType::F64,
        }
    }

    /// The zero value of a slot type.
    pub fn zero(ty: FlatType) -> Self {
        match ty {
            FlatType::I32 => Self::I32(0),
            FlatType::I64 => Self::I64(0),
            FlatType::F32 => Self::F32(0.0),
            FlatType::F64 => Self::F64(0.0),
        }
    }

    /// Reinterprets this value as the (equal or wider) joined slot
    /// type. Integer widening is unsigned; floats move bit-for-bit.
    pub fn convert_to(self, ty: FlatType) -> Self {
        match (self, ty) {
            (v, t) if v.ty() == t => v,
            (Self::I32(v), FlatType::I64) => Self::I64(i64::from(v as u32)),
            (Self::F32(v), FlatType::I32) => Self::I32(v.to_bits() as i32),
            (Self::F32(v), FlatType::I64) => Self::I64(i64::from(v.to_bits())),
            (Self::F64(v), FlatType::I64) => Self::I64(v.to_bits() as i64),
            // Joins never produce another combination.
            (v, t) => {
                debug_assert!(false, "no conversion from {:?} to {t:?}", v.ty());
                Self::zero(t)
            }
        }
    }

    /// Undoes [`Self::convert_to`]: narrows a joined slot back to the
    /// type a variant case expects.
    pub fn convert_from_joined(self, ty: FlatType) -> Self {
        match (self, ty) {
            (v, t) if v.ty() == t => v,
            (Self::I64(v), FlatType::I32) => Self::I32(v as u32 as i32),
            (Self::I32(v), FlatType::F32) => Self::F32(f32::from_bits(v as u32)),
            (Self::I64(v), FlatType::F32) => Self::F32(f32::from_bits(v as u32)),
            (Self::I64(v), FlatType::F64) => Self::F64(f64::from_bits(v as u64)),
            (v, t) => {
                debug_assert!(false, "no narrowing from {:?} to {t:?}", v.ty());
                Self::zero(t)
            }
        }
    }

    /// Converts to an engine value.
    pub fn to_core(self) -> wasmer::Value {
        match self {
            Self::I32(v) => wasmer::Value::I32(v),
            Self::I64(v) => wasmer::Value::I64(v),
            Self::F32(v) => wasmer::Value::F32(v),
            Self::F64(v) => wasmer::Value::F64(v),
        }
    }

    /// Converts from an engine value; reference types have no flat
    /// representation.
    pub fn from_core(value: &wasmer::Value) -> Result<Self, Error> {
        match value {
            wasmer::Value::I32(v) => Ok(Self::I32(*v)),
            wasmer::Value::I64(v) => Ok(Self::I64(*v)),
            wasmer::Value::F32(v) => Ok(Self::F32(*v)),
            wasmer::Value::F64(v) => Ok(Self::F64(*v)),
            other => Err(ComponentError::new(
                Phase::Decode,
                ErrorKind::Unsupported,
                format!("core value {other:?} has no canonical representation"),
            )
            .into()),
        }
    }

    /// The pointer stored in an i32 slot.
    pub fn as_ptr(&self) -> Result<u32, Error> {
        match self {
            Self::I32(v) => Ok(*v as u32),
            other => Err(ComponentError::new(
                Phase::Decode,
                ErrorKind::TypeMismatch,
                format!("expected an i32 pointer slot, found {:?}", other.ty()),
            )
            .into()),
        }
    }
}

/// The join of two slot types, used when different variant cases place
/// different core types in the same slot.
pub fn join(a: FlatType, b: FlatType) -> FlatType {
    use FlatType::*;
    match (a, b) {
        (a, b) if a == b => a,
        (I32, F32) | (F32, I32) => I32,
        _ => I64,
    }
}

/// Number of flat slots a type occupies.
pub fn flat_count(ty: &InterfaceType) -> usize {
    match ty {
        InterfaceType::Bool
        | InterfaceType::S8
        | InterfaceType::U8
        | InterfaceType::S16
        | InterfaceType::U16
        | InterfaceType::S32
        | InterfaceType::U32
        | InterfaceType::S64
        | InterfaceType::U64
        | InterfaceType::F32
        | InterfaceType::F64
        | InterfaceType::Char
        | InterfaceType::Enum(_)
        | InterfaceType::Own(_)
        | InterfaceType::Borrow(_) => 1,
        InterfaceType::String | InterfaceType::List(_) => 2,
        InterfaceType::Record(fields) => fields.iter().map(|(_, t)| flat_count(t)).sum(),
        InterfaceType::Tuple(tys) => tys.iter().map(flat_count).sum(),
        InterfaceType::Variant(cases) => {
            1 + cases
                .iter()
                .map(|(_, t)| t.as_ref().map_or(0, flat_count))
                .max()
                .unwrap_or(0)
        }
        InterfaceType::Option(t) => 1 + flat_count(t),
        InterfaceType::Result { ok, err } => {
            let ok = ok.as_deref().map_or(0, flat_count);
            let err = err.as_deref().map_or(0, flat_count);
            1 + ok.max(err)
        }
        InterfaceType::Flags(names) => if names.len() <= 32 { 1 } else { 2 },
    }
}

/// Appends the flat slot types of `ty` to `out`.
pub fn flatten(ty: &InterfaceType, out: &mut Vec<FlatType>) {
    match ty {
        InterfaceType::Bool
        | InterfaceType::S8
        | InterfaceType::U8
        | InterfaceType::S16
        | InterfaceType::U16
        | InterfaceType::S32
        | InterfaceType::U32
        | InterfaceType::Char
        | InterfaceType::Enum(_)
        | InterfaceType::Own(_)
        | InterfaceType::Borrow(_) => out.push(FlatType::I32),
        InterfaceType::S64 | InterfaceType::U64 => out.push(FlatType::I64),
        InterfaceType::F32 => out.push(FlatType::F32),
        InterfaceType::F64 => out.push(FlatType::F64),
        InterfaceType::String | InterfaceType::List(_) => {
            out.push(FlatType::I32);
            out.push(FlatType::I32);
        }
        InterfaceType::Record(fields) => {
            for (_, field) in fields {
                flatten(field, out);
            }
        }
        InterfaceType::Tuple(tys) => {
            for ty in tys {
                flatten(ty, out);
            }
        }
        InterfaceType::Variant(cases) => {
            let payloads: Vec<Option<&InterfaceType>> =
                cases.iter().map(|(_, t)| t.as_ref()).collect();
            flatten_cases(&payloads, out);
        }
        InterfaceType::Option(t) => flatten_cases(&[None, Some(t.as_ref())], out),
        InterfaceType::Result { ok, err } => {
            flatten_cases(&[ok.as_deref(), err.as_deref()], out);
        }
        InterfaceType::Flags(names) => {
            out.push(FlatType::I32);
            if names.len() > 32 {
                out.push(FlatType::I32);
            }
        }
    }
}

/// Discriminated unions flatten to a discriminant slot followed by the
/// element-wise join of every case's slots.
fn flatten_cases(cases: &[Option<&InterfaceType>], out: &mut Vec<FlatType>) {
    out.push(FlatType::I32);
    out.extend(case_payload_slots(cases));
}

/// The element-wise join of every case's flat slots, discriminant
/// excluded. Shorter cases simply contribute nothing to the tail.
pub fn case_payload_slots(cases: &[Option<&InterfaceType>]) -> Vec<FlatType> {
    let mut joined: Vec<FlatType> = Vec::new();
    for case in cases {
        let Some(case) = case else { continue };
        let mut slots = Vec::new();
        flatten(case, &mut slots);
        for (index, slot) in slots.into_iter().enumerate() {
            match joined.get(index) {
                Some(existing) => joined[index] = join(*existing, slot),
                None => joined.push(slot),
            }
        }
    }
    joined
}

/// The flat slot types of a type list.
pub fn flatten_all(tys: &[InterfaceType]) -> Vec<FlatType> {
    let mut out = Vec::new();
    for ty in tys {
        flatten(ty, &mut out);
    }
    out
}

/// Whether a result list comes back through a return pointer.
pub fn uses_retptr(results: &[InterfaceType]) -> bool {
    results.iter().map(flat_count).sum::<usize>() > MAX_FLAT_RESULTS
}

/// Size and alignment of a type in linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Size in bytes, a multiple of the alignment.
    pub size: u32,
    /// Alignment in bytes, a power of two.
    pub align: u32,
}

impl Layout {
    const fn new(size: u32, align: u32) -> Self {
        Self { size, align }
    }
}

/// Rounds `offset` up to `align`.
pub fn align_to(offset: u32, align: u32) -> u32 {
    (offset + align - 1) & !(align - 1)
}

/// Size in bytes of a discriminant for `cases` cases.
pub fn discriminant_size(cases: usize) -> u32 {
    if cases <= 0x100 {
        1
    } else if cases <= 0x10000 {
        2
    } else {
        4
    }
}

fn payload_layout(cases: &[Option<&InterfaceType>]) -> Layout {
    let mut size = 0;
    let mut align = 1;
    for case in cases.iter().flatten() {
        let l = layout(case);
        size = size.max(l.size);
        align = align.max(l.align);
    }
    Layout::new(size, align)
}

/// Layout of a discriminated union: discriminant, padding, payload.
fn variant_layout(cases: &[Option<&InterfaceType>]) -> Layout {
    let discriminant = discriminant_size(cases.len());
    let payload = payload_layout(cases);
    let align = discriminant.max(payload.align);
    let offset = align_to(discriminant, payload.align.max(1));
    Layout::new(align_to(offset + payload.size, align), align)
}

/// Byte offset of a discriminated union's payload.
pub fn variant_payload_offset(cases: usize, payload_align: u32) -> u32 {
    align_to(discriminant_size(cases), payload_align.max(1))
}

/// The maximum alignment among a union's payloads.
pub fn max_case_align(cases: &[Option<&InterfaceType>]) -> u32 {
    cases
        .iter()
        .flatten()
        .map(|t| layout(t).align)
        .max()
        .unwrap_or(1)
}

/// `{size, align}` of a type in linear memory.
pub fn layout(ty: &InterfaceType) -> Layout {
    match ty {
        InterfaceType::Bool | InterfaceType::S8 | InterfaceType::U8 => Layout::new(1, 1),
        InterfaceType::S16 | InterfaceType::U16 => Layout::new(2, 2),
        InterfaceType::S32
        | InterfaceType::U32
        | InterfaceType::F32
        | InterfaceType::Char
        | InterfaceType::Own(_)
        | InterfaceType::Borrow(_) => Layout::new(4, 4),
        InterfaceType::S64 | InterfaceType::U64 | InterfaceType::F64 => Layout::new(8, 8),
        InterfaceType::String | InterfaceType::List(_) => Layout::new(8, 4),
        InterfaceType::Record(fields) => {
            record_layout(fields.iter().map(|(_, t)| t)).0
        }
        InterfaceType::Tuple(tys) => record_layout(tys.iter()).0,
        InterfaceType::Variant(cases) => {
            let payloads: Vec<Option<&InterfaceType>> =
                cases.iter().map(|(_, t)| t.as_ref()).collect();
            variant_layout(&payloads)
        }
        InterfaceType::Option(t) => variant_layout(&[None, Some(t.as_ref())]),
        InterfaceType::Result { ok, err } => variant_layout(&[ok.as_deref(), err.as_deref()]),
        InterfaceType::Enum(cases) => {
            let d = discriminant_size(cases.len());
            Layout::new(d, d)
        }
        InterfaceType::Flags(names) => {
            if names.len() <= 32 {
                Layout::new(4, 4)
            } else {
                Layout::new(8, 4)
            }
        }
    }
}

/// Layout of a field sequence plus the byte offset of each field.
pub fn record_layout<'a>(
    fields: impl Iterator<Item = &'a InterfaceType>,
) -> (Layout, Vec<u32>) {
    let mut offsets = Vec::new();
    let mut offset = 0;
    let mut align = 1;
    for field in fields {
        let l = layout(field);
        offset = align_to(offset, l.align);
        offsets.push(offset);
        offset += l.size;
        align = align.max(l.align);
    }
    (Layout::new(align_to(offset, align), align), offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use InterfaceType as T;

    fn record(fields: &[(&str, T)]) -> T {
        T::Record(
            fields
                .iter()
                .map(|(n, t)| ((*n).to_owned(), t.clone()))
                .collect(),
        )
    }

    #[test]
    fn flat_count_laws() {
        assert_eq!(flat_count(&T::String), 2);
        assert_eq!(flat_count(&T::List(Box::new(T::U32))), 2);
        let person = record(&[("name", T::String), ("age", T::U32)]);
        assert_eq!(flat_count(&person), 3);
        assert_eq!(flat_count(&T::Option(Box::new(T::U32))), 2);
        assert_eq!(
            flat_count(&T::Result {
                ok: Some(Box::new(T::U32)),
                err: Some(Box::new(T::String)),
            }),
            3
        );
        assert_eq!(
            flat_count(&T::Variant(vec![
                ("a".into(), Some(T::U32)),
                ("b".into(), Some(T::String)),
                ("c".into(), None),
            ])),
            3
        );
        assert_eq!(flat_count(&T::Enum(vec!["a".into(), "b".into()])), 1);
        assert_eq!(flat_count(&T::Flags(vec!["x".into(); 32])), 1);
        assert_eq!(flat_count(&T::Flags(vec!["x".into(); 33])), 2);
    }

    #[test]
    fn retptr_threshold() {
        assert!(!uses_retptr(&[T::U32]));
        assert!(!uses_retptr(&[]));
        assert!(uses_retptr(&[T::String]));
        assert!(uses_retptr(&[T::U32, T::U32]));
    }

    #[test]
    fn join_rule() {
        use FlatType::*;
        assert_eq!(join(I32, I32), I32);
        assert_eq!(join(I32, F32), I32);
        assert_eq!(join(F32, I32), I32);
        assert_eq!(join(F32, F64), I64);
        assert_eq!(join(I32, I64), I64);
        assert_eq!(join(F64, F64), F64);
    }

    #[test]
    fn variant_slots_are_joined_elementwise() {
        let ty = T::Variant(vec![
            ("a".into(), Some(T::F32)),
            ("b".into(), Some(T::U32)),
            ("c".into(), Some(T::String)),
        ]);
        assert_eq!(
            flatten_all(&[ty]),
            vec![FlatType::I32, FlatType::I32, FlatType::I32],
        );
    }

    #[test]
    fn record_layout_pads_for_alignment() {
        let person = record(&[("name", T::String), ("age", T::U32)]);
        assert_eq!(layout(&person), Layout { size: 12, align: 4 });
        let mixed = record(&[("a", T::U8), ("b", T::U64), ("c", T::U16)]);
        assert_eq!(layout(&mixed), Layout { size: 24, align: 8 });
        let (_, offsets) = record_layout([T::U8, T::U64, T::U16].iter());
        assert_eq!(offsets, vec![0, 8, 16]);
    }

    #[test]
    fn variant_layout_accounts_for_discriminant() {
        let ty = T::Option(Box::new(T::U64));
        assert_eq!(layout(&ty), Layout { size: 16, align: 8 });
        let small = T::Option(Box::new(T::U8));
        assert_eq!(layout(&small), Layout { size: 2, align: 1 });
        assert_eq!(discriminant_size(256), 1);
        assert_eq!(discriminant_size(257), 2);
        assert_eq!(discriminant_size(65537), 4);
    }
}
