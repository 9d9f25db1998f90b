//! Lifting: flat core values and linear memory back into host values.

use crate::abi::layout::{
    case_payload_slots, discriminant_size, flatten, layout, max_case_align, record_layout,
    variant_payload_offset, FlatType, FlatValue,
};
use crate::abi::memory::AbiMemory;
use crate::component::StringEncoding;
use crate::errors::{ComponentError, Error, ErrorKind};
use crate::resources::{Handle, ResourceStore};
use crate::types::InterfaceType;
use crate::values::InterfaceValue;

/// A cursor over the flat results of a call.
pub struct FlatReader<'a> {
    slots: &'a [FlatValue],
    pos: usize,
}

impl<'a> FlatReader<'a> {
    /// Creates a reader over a flat value list.
    pub fn new(slots: &'a [FlatValue]) -> Self {
        Self { slots, pos: 0 }
    }

    /// Takes the next slot.
    pub fn next(&mut self) -> Result<FlatValue, Error> {
        let slot = self.slots.get(self.pos).copied().ok_or_else(|| {
            Error::from(ComponentError::decode(
                ErrorKind::TypeMismatch,
                format!("flat value list exhausted after {} slot(s)", self.pos),
            ))
        })?;
        self.pos += 1;
        Ok(slot)
    }

    /// Whether every slot has been consumed.
    pub fn is_done(&self) -> bool {
        self.pos == self.slots.len()
    }
}

fn expect_i32(slot: FlatValue) -> Result<i32, Error> {
    match slot {
        FlatValue::I32(v) => Ok(v),
        other => Err(ComponentError::decode(
            ErrorKind::TypeMismatch,
            format!("expected an i32 slot, found {:?}", other.ty()),
        )
        .into()),
    }
}

fn expect_i64(slot: FlatValue) -> Result<i64, Error> {
    match slot {
        FlatValue::I64(v) => Ok(v),
        other => Err(ComponentError::decode(
            ErrorKind::TypeMismatch,
            format!("expected an i64 slot, found {:?}", other.ty()),
        )
        .into()),
    }
}

/// The state of one lifting pass.
pub struct LiftContext<'c, M> {
    mem: &'c M,
    encoding: StringEncoding,
    resources: Option<&'c mut ResourceStore>,
    /// Borrow handles taken from guest results; the caller ends them
    /// with `end-lift-borrow` once the results are materialised,
    /// whatever the call outcome was.
    pub lifted_borrows: Vec<(u32, Handle)>,
}

impl<'c, M: AbiMemory> LiftContext<'c, M> {
    /// Creates a lifting pass over `mem` with no resource tables.
    pub fn new(mem: &'c M, encoding: StringEncoding) -> Self {
        Self {
            mem,
            encoding,
            resources: None,
            lifted_borrows: Vec::new(),
        }
    }

    /// Creates a lifting pass that can retire resource handles.
    pub fn with_resources(
        mem: &'c M,
        encoding: StringEncoding,
        resources: &'c mut ResourceStore,
    ) -> Self {
        Self {
            mem,
            encoding,
            resources: Some(resources),
            lifted_borrows: Vec::new(),
        }
    }

    /// Lifts a value list from flat slots.
    pub fn lift_all(
        &mut self,
        types: &[InterfaceType],
        reader: &mut FlatReader<'_>,
    ) -> Result<Vec<InterfaceValue>, Error> {
        let mut out = Vec::with_capacity(types.len());
        for (index, ty) in types.iter().enumerate() {
            let value = self
                .lift(ty, reader)
                .map_err(|e| annotate_index(e, index))?;
            out.push(value);
        }
        Ok(out)
    }

    /// Reads a value list laid out at `base` with the record layout of
    /// `types`. This is the retptr path.
    pub fn load_all(
        &mut self,
        types: &[InterfaceType],
        base: u32,
    ) -> Result<Vec<InterfaceValue>, Error> {
        let (_, offsets) = record_layout(types.iter());
        let mut out = Vec::with_capacity(types.len());
        for (index, (ty, offset)) in types.iter().zip(offsets).enumerate() {
            let value = self
                .load(ty, base + offset)
                .map_err(|e| annotate_index(e, index))?;
            out.push(value);
        }
        Ok(out)
    }

    /// Lifts one value from flat slots.
    pub fn lift(
        &mut self,
        ty: &InterfaceType,
        reader: &mut FlatReader<'_>,
    ) -> Result<InterfaceValue, Error> {
        use InterfaceType as T;
        use InterfaceValue as V;
        Ok(match ty {
            T::Bool => V::Bool(expect_i32(reader.next()?)? != 0),
            T::S8 => V::S8(expect_i32(reader.next()?)? as i8),
            T::U8 => V::U8(expect_i32(reader.next()?)? as u8),
            T::S16 => V::S16(expect_i32(reader.next()?)? as i16),
            T::U16 => V::U16(expect_i32(reader.next()?)? as u16),
            T::S32 => V::S32(expect_i32(reader.next()?)?),
            T::U32 => V::U32(expect_i32(reader.next()?)? as u32),
            T::S64 => V::S64(expect_i64(reader.next()?)?),
            T::U64 => V::U64(expect_i64(reader.next()?)? as u64),
            T::F32 => match reader.next()? {
                FlatValue::F32(v) => V::F32(v),
                other => return Err(slot_mismatch("f32", other)),
            },
            T::F64 => match reader.next()? {
                FlatValue::F64(v) => V::F64(v),
                other => return Err(slot_mismatch("f64", other)),
            },
            T::Char => V::Char(decode_char(expect_i32(reader.next()?)? as u32)?),
            T::String => {
                let ptr = reader.next()?.as_ptr()?;
                let len = reader.next()?.as_ptr()?;
                V::String(self.string_from_memory(ptr, len)?)
            }
            T::List(elem) => {
                let ptr = reader.next()?.as_ptr()?;
                let len = reader.next()?.as_ptr()?;
                V::List(self.list_from_memory(ptr, len, elem)?)
            }
            T::Record(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for (name, field_ty) in fields {
                    let value = self
                        .lift(field_ty, reader)
                        .map_err(|e| annotate_field(e, name))?;
                    values.push((name.clone(), value));
                }
                V::Record(values)
            }
            T::Tuple(tys) => {
                let mut values = Vec::with_capacity(tys.len());
                for (index, ty) in tys.iter().enumerate() {
                    values.push(self.lift(ty, reader).map_err(|e| annotate_index(e, index))?);
                }
                V::Tuple(values)
            }
            T::Variant(cases) => {
                let slots: Vec<_> = cases.iter().map(|(_, t)| t.as_ref()).collect();
                let (discr, payload) = self.lift_union(&slots, reader)?;
                if discr as usize >= cases.len() {
                    return Err(invalid_discr(ErrorKind::InvalidVariant, discr, cases.len()));
                }
                V::Variant {
                    case: discr,
                    payload: payload.map(Box::new),
                }
            }
            T::Enum(cases) => {
                let discr = expect_i32(reader.next()?)? as u32;
                if discr as usize >= cases.len() {
                    return Err(invalid_discr(ErrorKind::InvalidEnum, discr, cases.len()));
                }
                V::Enum(discr)
            }
            T::Option(elem) => {
                let (discr, payload) = self.lift_union(&[None, Some(elem.as_ref())], reader)?;
                match discr {
                    0 => V::Option(None),
                    1 => V::Option(payload.map(Box::new)),
                    other => return Err(invalid_discr(ErrorKind::InvalidVariant, other, 2)),
                }
            }
            T::Result { ok, err } => {
                let (discr, payload) = self.lift_union(&[ok.as_deref(), err.as_deref()], reader)?;
                match discr {
                    0 => V::Result(Ok(payload.map(Box::new))),
                    1 => V::Result(Err(payload.map(Box::new))),
                    other => return Err(invalid_discr(ErrorKind::InvalidVariant, other, 2)),
                }
            }
            T::Flags(names) => {
                let lo = expect_i32(reader.next()?)? as u32;
                let mut bits = u64::from(lo);
                if names.len() > 32 {
                    let hi = expect_i32(reader.next()?)? as u32;
                    bits |= u64::from(hi) << 32;
                }
                V::Flags(bits)
            }
            T::Own(decl) => {
                let handle = expect_i32(reader.next()?)? as u32;
                let rep = self.resources_mut()?.lift_own(*decl, handle)?;
                V::Own { ty: *decl, rep }
            }
            T::Borrow(decl) => {
                let handle = expect_i32(reader.next()?)? as u32;
                let rep = self.resources_mut()?.lift_borrow(*decl, handle)?;
                self.lifted_borrows.push((*decl, handle));
                V::Borrow { ty: *decl, rep }
            }
        })
    }

    /// Lifts a discriminated union from flat slots: reads the
    /// discriminant, consumes every joined payload slot, and lifts the
    /// selected case from the slots it actually uses.
    fn lift_union(
        &mut self,
        cases: &[Option<&InterfaceType>],
        reader: &mut FlatReader<'_>,
    ) -> Result<(u32, Option<InterfaceValue>), Error> {
        let discr = expect_i32(reader.next()?)? as u32;
        let joined = case_payload_slots(cases);
        let mut payload_slots = Vec::with_capacity(joined.len());
        for _ in &joined {
            payload_slots.push(reader.next()?);
        }
        let Some(case_ty) = cases.get(discr as usize).copied().flatten() else {
            // Either no payload for this case, or an out-of-range
            // discriminant the caller rejects; unused slots are simply
            // ignored.
            return Ok((discr, None));
        };
        let mut case_types: Vec<FlatType> = Vec::new();
        flatten(case_ty, &mut case_types);
        let converted: Vec<FlatValue> = case_types
            .iter()
            .zip(&payload_slots)
            .map(|(ty, slot)| slot.convert_from_joined(*ty))
            .collect();
        let mut sub = FlatReader::new(&converted);
        let value = self.lift(case_ty, &mut sub)?;
        Ok((discr, Some(value)))
    }

    /// Reads one value at `offset` in linear memory.
    pub fn load(&mut self, ty: &InterfaceType, offset: u32) -> Result<InterfaceValue, Error> {
        use InterfaceType as T;
        use InterfaceValue as V;
        Ok(match ty {
            T::Bool => V::Bool(self.mem.read_u8(offset)? != 0),
            T::S8 => V::S8(self.mem.read_u8(offset)? as i8),
            T::U8 => V::U8(self.mem.read_u8(offset)?),
            T::S16 => V::S16(self.mem.read_u16(offset)? as i16),
            T::U16 => V::U16(self.mem.read_u16(offset)?),
            T::S32 => V::S32(self.mem.read_u32(offset)? as i32),
            T::U32 => V::U32(self.mem.read_u32(offset)?),
            T::S64 => V::S64(self.mem.read_u64(offset)? as i64),
            T::U64 => V::U64(self.mem.read_u64(offset)?),
            T::F32 => V::F32(f32::from_bits(self.mem.read_u32(offset)?)),
            T::F64 => V::F64(f64::from_bits(self.mem.read_u64(offset)?)),
            T::Char => V::Char(decode_char(self.mem.read_u32(offset)?)?),
            T::String => {
                let ptr = self.mem.read_u32(offset)?;
                let len = self.mem.read_u32(offset + 4)?;
                V::String(self.string_from_memory(ptr, len)?)
            }
            T::List(elem) => {
                let ptr = self.mem.read_u32(offset)?;
                let len = self.mem.read_u32(offset + 4)?;
                V::List(self.list_from_memory(ptr, len, elem)?)
            }
            T::Record(fields) => {
                let (_, offsets) = record_layout(fields.iter().map(|(_, t)| t));
                let mut values = Vec::with_capacity(fields.len());
                for ((name, field_ty), field_offset) in fields.iter().zip(offsets) {
                    let value = self
                        .load(field_ty, offset + field_offset)
                        .map_err(|e| annotate_field(e, name))?;
                    values.push((name.clone(), value));
                }
                V::Record(values)
            }
            T::Tuple(tys) => {
                let (_, offsets) = record_layout(tys.iter());
                let mut values = Vec::with_capacity(tys.len());
                for (index, (ty, field_offset)) in tys.iter().zip(offsets).enumerate() {
                    let value = self
                        .load(ty, offset + field_offset)
                        .map_err(|e| annotate_index(e, index))?;
                    values.push(value);
                }
                V::Tuple(values)
            }
            T::Variant(cases) => {
                let slots: Vec<_> = cases.iter().map(|(_, t)| t.as_ref()).collect();
                let discr = self.read_discriminant(offset, slots.len())?;
                if discr as usize >= cases.len() {
                    return Err(invalid_discr(ErrorKind::InvalidVariant, discr, cases.len()));
                }
                let payload = self.load_union_payload(&slots, discr, offset)?;
                V::Variant {
                    case: discr,
                    payload: payload.map(Box::new),
                }
            }
            T::Enum(cases) => {
                let discr = self.read_discriminant(offset, cases.len())?;
                if discr as usize >= cases.len() {
                    return Err(invalid_discr(ErrorKind::InvalidEnum, discr, cases.len()));
                }
                V::Enum(discr)
            }
            T::Option(elem) => {
                let slots = [None, Some(elem.as_ref())];
                let discr = self.read_discriminant(offset, 2)?;
                match discr {
                    0 => V::Option(None),
                    1 => V::Option(self.load_union_payload(&slots, 1, offset)?.map(Box::new)),
                    other => return Err(invalid_discr(ErrorKind::InvalidVariant, other, 2)),
                }
            }
            T::Result { ok, err } => {
                let slots = [ok.as_deref(), err.as_deref()];
                let discr = self.read_discriminant(offset, 2)?;
                let payload = self.load_union_payload(&slots, discr, offset)?;
                match discr {
                    0 => V::Result(Ok(payload.map(Box::new))),
                    1 => V::Result(Err(payload.map(Box::new))),
                    other => return Err(invalid_discr(ErrorKind::InvalidVariant, other, 2)),
                }
            }
            T::Flags(names) => {
                if names.len() <= 32 {
                    V::Flags(u64::from(self.mem.read_u32(offset)?))
                } else {
                    V::Flags(self.mem.read_u64(offset)?)
                }
            }
            T::Own(decl) => {
                let handle = self.mem.read_u32(offset)?;
                let rep = self.resources_mut()?.lift_own(*decl, handle)?;
                V::Own { ty: *decl, rep }
            }
            T::Borrow(decl) => {
                let handle = self.mem.read_u32(offset)?;
                let rep = self.resources_mut()?.lift_borrow(*decl, handle)?;
                self.lifted_borrows.push((*decl, handle));
                V::Borrow { ty: *decl, rep }
            }
        })
    }

    fn load_union_payload(
        &mut self,
        cases: &[Option<&InterfaceType>],
        discr: u32,
        offset: u32,
    ) -> Result<Option<InterfaceValue>, Error> {
        let Some(case_ty) = cases.get(discr as usize).copied().flatten() else {
            return Ok(None);
        };
        let payload_offset = variant_payload_offset(cases.len(), max_case_align(cases));
        Ok(Some(self.load(case_ty, offset + payload_offset)?))
    }

    fn read_discriminant(&mut self, offset: u32, cases: usize) -> Result<u32, Error> {
        Ok(match discriminant_size(cases) {
            1 => u32::from(self.mem.read_u8(offset)?),
            2 => u32::from(self.mem.read_u16(offset)?),
            _ => self.mem.read_u32(offset)?,
        })
    }

    fn string_from_memory(&mut self, ptr: u32, len: u32) -> Result<String, Error> {
        if self.encoding != StringEncoding::Utf8 {
            return Err(ComponentError::decode(
                ErrorKind::Unsupported,
                format!("string encoding {:?} is not supported (only UTF-8)", self.encoding),
            )
            .into());
        }
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.mem.read(ptr, len)?;
        String::from_utf8(bytes).map_err(|e| {
            ComponentError::decode(ErrorKind::InvalidUtf8, "guest string is not valid UTF-8")
                .with_cause(e)
                .into()
        })
    }

    fn list_from_memory(
        &mut self,
        ptr: u32,
        len: u32,
        elem: &InterfaceType,
    ) -> Result<Vec<InterfaceValue>, Error> {
        let elem_layout = layout(elem);
        let mut items = Vec::with_capacity(len.min(4096) as usize);
        for index in 0..len {
            let offset = ptr
                .checked_add(index.checked_mul(elem_layout.size).ok_or_else(overflow)?)
                .ok_or_else(overflow)?;
            items.push(
                self.load(elem, offset)
                    .map_err(|e| annotate_index(e, index as usize))?,
            );
        }
        Ok(items)
    }

    fn resources_mut(&mut self) -> Result<&mut ResourceStore, Error> {
        self.resources.as_deref_mut().ok_or_else(|| {
            Error::from(ComponentError::decode(
                ErrorKind::NotInitialized,
                "no resource tables available in this lifting context",
            ))
        })
    }
}

fn overflow() -> Error {
    ComponentError::decode(ErrorKind::Overflow, "list extent overflows the address space").into()
}

fn decode_char(scalar: u32) -> Result<char, Error> {
    char::from_u32(scalar).ok_or_else(|| {
        ComponentError::decode(
            ErrorKind::InvalidData,
            format!("{scalar:#x} is not a Unicode scalar value"),
        )
        .into()
    })
}

fn invalid_discr(kind: ErrorKind, discr: u32, cases: usize) -> Error {
    ComponentError::decode(
        kind,
        format!("discriminant {discr} out of range ({cases} cases)"),
    )
    .into()
}

fn slot_mismatch(want: &str, found: FlatValue) -> Error {
    ComponentError::decode(
        ErrorKind::TypeMismatch,
        format!("expected an {want} slot, found {:?}", found.ty()),
    )
    .into()
}

fn annotate_field(err: Error, name: &str) -> Error {
    match err {
        Error::Component(e) => Error::Component(e.annotate(name)),
        other => other,
    }
}

fn annotate_index(err: Error, index: usize) -> Error {
    annotate_field(err, &index.to_string())
}
