//! The canonical ABI transcoder.
//!
//! Values of the interface type system cross the host/guest boundary
//! in two shapes: a flat list of core values for parameters and
//! single-slot results, and linear-memory records behind a return
//! pointer for anything wider. [`lower`] encodes host values on the
//! way in, [`lift`] decodes guest results on the way out, and
//! [`layout`] owns the flat-count and size/alignment rules both sides
//! agree on.

pub mod layout;
pub mod lift;
pub mod lower;
pub mod memory;

pub use layout::{flat_count, flatten_all, uses_retptr, FlatType, FlatValue, Layout};
pub use lift::{FlatReader, LiftContext};
pub use lower::LowerContext;
pub use memory::{AbiAllocator, AbiMemory, GuestMemory, ReallocFn};

#[cfg(test)]
mod tests {
    use super::memory::testing::MockMemory;
    use super::*;
    use crate::component::StringEncoding;
    use crate::errors::{Error, ErrorKind};
    use crate::resources::ResourceStore;
    use crate::types::InterfaceType;
    use crate::values::InterfaceValue;

    fn roundtrip_flat(value: InterfaceValue, ty: InterfaceType) {
        let mut mem = MockMemory::new(0x10000);
        let types = vec![ty];
        let values = vec![value];
        let flat = LowerContext::new(&mut mem, StringEncoding::Utf8)
            .lower_all(&values, &types)
            .unwrap();
        assert_eq!(flat.len(), types.iter().map(flat_count).sum::<usize>());
        let mut reader = FlatReader::new(&flat);
        let lifted = LiftContext::new(&mem, StringEncoding::Utf8)
            .lift_all(&types, &mut reader)
            .unwrap();
        assert!(reader.is_done());
        assert_eq!(lifted, values);
    }

    fn roundtrip_memory(value: InterfaceValue, ty: InterfaceType) {
        let mut mem = MockMemory::new(0x10000);
        let base = 0x800;
        LowerContext::new(&mut mem, StringEncoding::Utf8)
            .store(&value, &ty, base)
            .unwrap();
        let lifted = LiftContext::new(&mem, StringEncoding::Utf8)
            .load(&ty, base)
            .unwrap();
        assert_eq!(lifted, value);
    }

    fn battery() -> Vec<(InterfaceValue, InterfaceType)> {
        use InterfaceType as T;
        use InterfaceValue as V;
        vec![
            (V::Bool(true), T::Bool),
            (V::S8(-5), T::S8),
            (V::U8(200), T::U8),
            (V::S16(-20_000), T::S16),
            (V::U16(50_000), T::U16),
            (V::S32(-7), T::S32),
            (V::U32(0xdead_beef), T::U32),
            (V::S64(-1 << 40), T::S64),
            (V::U64(u64::MAX), T::U64),
            (V::F32(3.5), T::F32),
            (V::F64(-0.25), T::F64),
            (V::Char('Ω'), T::Char),
            (V::String("hello".into()), T::String),
            (
                V::List(vec![V::U32(1), V::U32(2), V::U32(3)]),
                T::List(Box::new(T::U32)),
            ),
            (
                V::Record(vec![("x".into(), V::S32(-1)), ("y".into(), V::S32(2))]),
                T::Record(vec![("x".into(), T::S32), ("y".into(), T::S32)]),
            ),
            (V::Option(Some(Box::new(V::U32(9)))), T::Option(Box::new(T::U32))),
            (V::Option(None), T::Option(Box::new(T::U32))),
            (
                V::Result(Ok(Some(Box::new(V::U32(1))))),
                T::Result {
                    ok: Some(Box::new(T::U32)),
                    err: Some(Box::new(T::String)),
                },
            ),
            (
                V::Result(Err(Some(Box::new(V::String("boom".into()))))),
                T::Result {
                    ok: Some(Box::new(T::U32)),
                    err: Some(Box::new(T::String)),
                },
            ),
            (
                V::Variant {
                    case: 1,
                    payload: Some(Box::new(V::String("tag".into()))),
                },
                T::Variant(vec![
                    ("a".into(), Some(T::U32)),
                    ("b".into(), Some(T::String)),
                    ("c".into(), None),
                ]),
            ),
            (
                V::Variant {
                    case: 2,
                    payload: None,
                },
                T::Variant(vec![
                    ("a".into(), Some(T::U32)),
                    ("b".into(), Some(T::String)),
                    ("c".into(), None),
                ]),
            ),
            (V::Enum(1), T::Enum(vec!["a".into(), "b".into()])),
            (V::Flags(0b1011), T::Flags(vec!["r".into(), "w".into(), "x".into(), "s".into()])),
        ]
    }

    #[test]
    fn flat_round_trips() {
        for (value, ty) in battery() {
            roundtrip_flat(value, ty);
        }
    }

    #[test]
    fn memory_round_trips() {
        for (value, ty) in battery() {
            roundtrip_memory(value, ty);
        }
    }

    #[test]
    fn nested_aggregates_round_trip() {
        use InterfaceType as T;
        use InterfaceValue as V;
        let ty = T::List(Box::new(T::Record(vec![
            ("name".into(), T::String),
            ("age".into(), T::U32),
        ])));
        let value = V::List(vec![
            V::Record(vec![
                ("name".into(), V::String("Alice".into())),
                ("age".into(), V::U32(30)),
            ]),
            V::Record(vec![
                ("name".into(), V::String("Bob".into())),
                ("age".into(), V::U32(31)),
            ]),
        ]);
        roundtrip_flat(value.clone(), ty.clone());
        roundtrip_memory(value, ty);
    }

    #[test]
    fn wide_results_round_trip_through_memory() {
        use InterfaceType as T;
        use InterfaceValue as V;
        let types = vec![T::String, T::U32, T::U64];
        let values = vec![V::String("abc".into()), V::U32(7), V::U64(8)];
        assert!(uses_retptr(&types));

        let mut mem = MockMemory::new(0x10000);
        let base = 0x400;
        LowerContext::new(&mut mem, StringEncoding::Utf8)
            .store_all(&values, &types, base)
            .unwrap();
        let lifted = LiftContext::new(&mem, StringEncoding::Utf8)
            .load_all(&types, base)
            .unwrap();
        assert_eq!(lifted, values);
    }

    #[test]
    fn error_paths_annotate_fields() {
        use InterfaceType as T;
        use InterfaceValue as V;
        let ty = T::Record(vec![("name".into(), T::String), ("age".into(), T::U32)]);
        let value = V::Record(vec![
            ("name".into(), V::String("ok".into())),
            ("age".into(), V::Bool(false)),
        ]);
        let mut mem = MockMemory::new(0x10000);
        let err = LowerContext::new(&mut mem, StringEncoding::Utf8)
            .lower_all(&[value], &[ty])
            .unwrap_err();
        let Error::Component(err) = err else {
            panic!("expected a component error, got {err}");
        };
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert_eq!(err.path, vec!["0".to_string(), "age".to_string()]);
    }

    #[test]
    fn non_utf8_guest_strings_are_rejected() {
        let mut mem = MockMemory::new(0x100);
        mem.bytes[0..2].copy_from_slice(&[0xff, 0xfe]);
        let flat = vec![FlatValue::I32(0), FlatValue::I32(2)];
        let mut reader = FlatReader::new(&flat);
        let err = LiftContext::new(&mem, StringEncoding::Utf8)
            .lift_all(&[InterfaceType::String], &mut reader)
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidUtf8));
    }

    #[test]
    fn unsupported_encodings_are_rejected() {
        let mut mem = MockMemory::new(0x100);
        let err = LowerContext::new(&mut mem, StringEncoding::Utf16)
            .lower_all(&[InterfaceValue::String("x".into())], &[InterfaceType::String])
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Unsupported));
    }

    #[test]
    fn allocation_failure_aborts_encoding() {
        let mut mem = MockMemory::new(0x100);
        mem.fail_alloc = true;
        let err = LowerContext::new(&mut mem, StringEncoding::Utf8)
            .lower_all(&[InterfaceValue::String("body".into())], &[InterfaceType::String])
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Allocation));
    }

    #[test]
    fn invalid_enum_discriminants_are_rejected() {
        let ty = InterfaceType::Enum(vec!["a".into(), "b".into()]);
        let flat = vec![FlatValue::I32(7)];
        let mem = MockMemory::new(0x10);
        let mut reader = FlatReader::new(&flat);
        let err = LiftContext::new(&mem, StringEncoding::Utf8)
            .lift_all(std::slice::from_ref(&ty), &mut reader)
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidEnum));
    }

    #[test]
    fn resource_handles_round_trip_between_tables() {
        use InterfaceType as T;
        let mut mem = MockMemory::new(0x100);
        let mut guest = ResourceStore::new();

        // Host passes an owned resource in: lowering mints a guest
        // handle for the representation.
        let flat = LowerContext::with_resources(&mut mem, StringEncoding::Utf8, &mut guest)
            .lower_all(&[InterfaceValue::Own { ty: 3, rep: 41 }], &[T::Own(3)])
            .unwrap();
        let FlatValue::I32(handle) = flat[0] else {
            panic!("own handles lower to i32");
        };
        assert_eq!(guest.resource_rep(3, handle as u32).unwrap(), 41);

        // The guest hands it back: lifting transfers ownership out.
        let mut reader = FlatReader::new(&flat);
        let lifted = LiftContext::with_resources(&mem, StringEncoding::Utf8, &mut guest)
            .lift_all(&[T::Own(3)], &mut reader)
            .unwrap();
        assert_eq!(lifted, vec![InterfaceValue::Own { ty: 3, rep: 41 }]);
        assert!(guest.resource_rep(3, handle as u32).is_err());
    }

    #[test]
    fn borrows_are_recorded_for_retirement() {
        use InterfaceType as T;
        let mut mem = MockMemory::new(0x100);
        let mut guest = ResourceStore::new();
        let mut cx = LowerContext::with_resources(&mut mem, StringEncoding::Utf8, &mut guest);
        cx.lower_all(&[InterfaceValue::Borrow { ty: 2, rep: 8 }], &[T::Borrow(2)])
            .unwrap();
        let borrows = cx.lowered_borrows.clone();
        assert_eq!(borrows.len(), 1);
        let (ty, handle) = borrows[0];
        drop(cx);
        guest.end_lower_borrow(ty, handle).unwrap();
        assert!(guest.resource_rep(ty, handle).is_err());
    }
}
