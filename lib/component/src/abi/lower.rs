//! Lowering: host values into flat core values and linear memory.

use crate::abi::layout::{
    case_payload_slots, discriminant_size, layout, max_case_align, record_layout,
    variant_payload_offset, FlatValue,
};
use crate::abi::memory::{AbiAllocator, AbiMemory};
use crate::component::StringEncoding;
use crate::errors::{ComponentError, Error, ErrorKind};
use crate::resources::{Handle, ResourceStore};
use crate::types::InterfaceType;
use crate::values::InterfaceValue;

/// The state of one lowering pass: the guest memory and allocator,
/// the string encoding in effect, and the resource table side effects
/// to undo or complete once the call finishes.
pub struct LowerContext<'c, M> {
    mem: &'c mut M,
    encoding: StringEncoding,
    resources: Option<&'c mut ResourceStore>,
    /// Temporary borrow handles created while lowering; the caller
    /// retires them with `end-lower-borrow` after the call returns.
    pub lowered_borrows: Vec<(u32, Handle)>,
}

fn mismatch(value: &InterfaceValue, ty: &InterfaceType) -> Error {
    ComponentError::encode(
        ErrorKind::TypeMismatch,
        "host value does not match the declared parameter type",
    )
    .with_host_type(value.host_type())
    .with_wit_type(ty.describe())
    .into()
}

fn unsupported_encoding(encoding: StringEncoding) -> Error {
    ComponentError::encode(
        ErrorKind::Unsupported,
        format!("string encoding {encoding:?} is not supported (only UTF-8)"),
    )
    .into()
}

impl<'c, M: AbiMemory + AbiAllocator> LowerContext<'c, M> {
    /// Creates a lowering pass over `mem` with no resource tables.
    pub fn new(mem: &'c mut M, encoding: StringEncoding) -> Self {
        Self {
            mem,
            encoding,
            resources: None,
            lowered_borrows: Vec::new(),
        }
    }

    /// Creates a lowering pass that can mint resource handles.
    pub fn with_resources(
        mem: &'c mut M,
        encoding: StringEncoding,
        resources: &'c mut ResourceStore,
    ) -> Self {
        Self {
            mem,
            encoding,
            resources: Some(resources),
            lowered_borrows: Vec::new(),
        }
    }

    /// Lowers a value list into one flat parameter vector.
    pub fn lower_all(
        &mut self,
        values: &[InterfaceValue],
        types: &[InterfaceType],
    ) -> Result<Vec<FlatValue>, Error> {
        if values.len() != types.len() {
            return Err(ComponentError::encode(
                ErrorKind::InvalidInput,
                format!("expected {} argument(s), got {}", types.len(), values.len()),
            )
            .into());
        }
        let mut out = Vec::new();
        for (index, (value, ty)) in values.iter().zip(types).enumerate() {
            self.lower(value, ty, &mut out)
                .map_err(|e| annotate_index(e, index))?;
        }
        Ok(out)
    }

    /// Writes a value list at `base` using the record layout of
    /// `types`. This is the host-side retptr path.
    pub fn store_all(
        &mut self,
        values: &[InterfaceValue],
        types: &[InterfaceType],
        base: u32,
    ) -> Result<(), Error> {
        if values.len() != types.len() {
            return Err(ComponentError::encode(
                ErrorKind::InvalidInput,
                format!("expected {} result(s), got {}", types.len(), values.len()),
            )
            .into());
        }
        let (_, offsets) = record_layout(types.iter());
        for (index, ((value, ty), offset)) in values.iter().zip(types).zip(offsets).enumerate() {
            self.store(value, ty, base + offset)
                .map_err(|e| annotate_index(e, index))?;
        }
        Ok(())
    }

    /// Lowers one value into flat slots.
    pub fn lower(
        &mut self,
        value: &InterfaceValue,
        ty: &InterfaceType,
        out: &mut Vec<FlatValue>,
    ) -> Result<(), Error> {
        use InterfaceType as T;
        use InterfaceValue as V;
        match (value, ty) {
            (V::Bool(v), T::Bool) => out.push(FlatValue::I32(i32::from(*v))),
            (V::S8(v), T::S8) => out.push(FlatValue::I32(i32::from(*v))),
            (V::U8(v), T::U8) => out.push(FlatValue::I32(i32::from(*v))),
            (V::S16(v), T::S16) => out.push(FlatValue::I32(i32::from(*v))),
            (V::U16(v), T::U16) => out.push(FlatValue::I32(i32::from(*v))),
            (V::S32(v), T::S32) => out.push(FlatValue::I32(*v)),
            (V::U32(v), T::U32) => out.push(FlatValue::I32(*v as i32)),
            (V::S64(v), T::S64) => out.push(FlatValue::I64(*v)),
            (V::U64(v), T::U64) => out.push(FlatValue::I64(*v as i64)),
            (V::F32(v), T::F32) => out.push(FlatValue::F32(*v)),
            (V::F64(v), T::F64) => out.push(FlatValue::F64(*v)),
            (V::Char(v), T::Char) => out.push(FlatValue::I32(*v as i32)),
            (V::String(v), T::String) => {
                let (ptr, len) = self.string_to_memory(v)?;
                out.push(FlatValue::I32(ptr as i32));
                out.push(FlatValue::I32(len as i32));
            }
            (V::List(items), T::List(elem)) => {
                let (ptr, len) = self.list_to_memory(items, elem)?;
                out.push(FlatValue::I32(ptr as i32));
                out.push(FlatValue::I32(len as i32));
            }
            (V::Record(values), T::Record(fields)) => {
                if values.len() != fields.len() {
                    return Err(ComponentError::encode(
                        ErrorKind::FieldMissing,
                        format!(
                            "record has {} field(s), type declares {}",
                            values.len(),
                            fields.len()
                        ),
                    )
                    .with_wit_type(ty.describe())
                    .into());
                }
                for ((name, value), (decl_name, field_ty)) in values.iter().zip(fields) {
                    if name != decl_name {
                        return Err(ComponentError::encode(
                            ErrorKind::FieldUnknown,
                            format!("record field `{name}` does not match declared `{decl_name}`"),
                        )
                        .into());
                    }
                    self.lower(value, field_ty, out)
                        .map_err(|e| annotate_field(e, decl_name))?;
                }
            }
            (V::Tuple(values), T::Tuple(tys)) if values.len() == tys.len() => {
                for (index, (value, ty)) in values.iter().zip(tys).enumerate() {
                    self.lower(value, ty, out)
                        .map_err(|e| annotate_index(e, index))?;
                }
            }
            (V::Variant { case, payload }, T::Variant(cases)) => {
                let declared = cases.get(*case as usize).ok_or_else(|| {
                    Error::from(
                        ComponentError::encode(
                            ErrorKind::InvalidVariant,
                            format!("variant case {case} out of range ({} cases)", cases.len()),
                        )
                        .with_wit_type(ty.describe()),
                    )
                })?;
                let slots: Vec<_> = cases.iter().map(|(_, t)| t.as_ref()).collect();
                self.lower_union(
                    *case,
                    payload.as_deref(),
                    declared.1.as_ref(),
                    &declared.0,
                    &slots,
                    out,
                )?;
            }
            (V::Enum(case), T::Enum(cases)) => {
                if *case as usize >= cases.len() {
                    return Err(ComponentError::encode(
                        ErrorKind::InvalidEnum,
                        format!("enum case {case} out of range ({} cases)", cases.len()),
                    )
                    .with_wit_type(ty.describe())
                    .into());
                }
                out.push(FlatValue::I32(*case as i32));
            }
            (V::Option(payload), T::Option(elem)) => {
                let discr = u32::from(payload.is_some());
                self.lower_union(
                    discr,
                    payload.as_deref(),
                    payload.is_some().then_some(elem.as_ref()),
                    "some",
                    &[None, Some(elem.as_ref())],
                    out,
                )?;
            }
            (V::Result(result), T::Result { ok, err }) => {
                let (discr, payload, payload_ty, label) = match result {
                    Ok(v) => (0, v.as_deref(), ok.as_deref(), "ok"),
                    Err(v) => (1, v.as_deref(), err.as_deref(), "err"),
                };
                if payload.is_some() != payload_ty.is_some() {
                    return Err(ComponentError::encode(
                        ErrorKind::InvalidVariant,
                        format!("result `{label}` payload does not match the declared type"),
                    )
                    .with_wit_type(ty.describe())
                    .into());
                }
                self.lower_union(
                    discr,
                    payload,
                    payload_ty,
                    label,
                    &[ok.as_deref(), err.as_deref()],
                    out,
                )?;
            }
            (V::Flags(bits), T::Flags(names)) => {
                check_flags_width(names)?;
                let masked = mask_flags(*bits, names.len());
                out.push(FlatValue::I32(masked as u32 as i32));
                if names.len() > 32 {
                    out.push(FlatValue::I32((masked >> 32) as u32 as i32));
                }
            }
            (V::Own { ty: vty, rep }, T::Own(decl)) if vty == decl => {
                let handle = self.resources_mut()?.lower_own(*decl, *rep);
                out.push(FlatValue::I32(handle as i32));
            }
            (V::Borrow { ty: vty, rep }, T::Borrow(decl)) if vty == decl => {
                let handle = self.resources_mut()?.lower_borrow(*decl, *rep);
                self.lowered_borrows.push((*decl, handle));
                out.push(FlatValue::I32(handle as i32));
            }
            (value, ty) => return Err(mismatch(value, ty)),
        }
        Ok(())
    }

    /// Lowers a discriminated union into flat slots: the discriminant
    /// followed by the case payload, padded and reinterpreted to the
    /// joined slot types.
    #[allow(clippy::too_many_arguments)]
    fn lower_union(
        &mut self,
        discr: u32,
        payload: Option<&InterfaceValue>,
        payload_ty: Option<&InterfaceType>,
        case_name: &str,
        cases: &[Option<&InterfaceType>],
        out: &mut Vec<FlatValue>,
    ) -> Result<(), Error> {
        out.push(FlatValue::I32(discr as i32));
        let joined = case_payload_slots(cases);
        let mut case_slots = Vec::new();
        match (payload, payload_ty) {
            (Some(value), Some(ty)) => {
                self.lower(value, ty, &mut case_slots)
                    .map_err(|e| annotate_field(e, case_name))?;
            }
            (None, None) => {}
            _ => {
                return Err(ComponentError::encode(
                    ErrorKind::InvalidVariant,
                    format!("case `{case_name}` payload does not match the declared type"),
                )
                .into());
            }
        }
        for (index, slot_ty) in joined.iter().enumerate() {
            out.push(match case_slots.get(index) {
                Some(slot) => slot.convert_to(*slot_ty),
                None => FlatValue::zero(*slot_ty),
            });
        }
        Ok(())
    }

    /// Writes one value at `offset` in linear memory.
    pub fn store(
        &mut self,
        value: &InterfaceValue,
        ty: &InterfaceType,
        offset: u32,
    ) -> Result<(), Error> {
        use InterfaceType as T;
        use InterfaceValue as V;
        match (value, ty) {
            (V::Bool(v), T::Bool) => self.mem.write_u8(offset, u8::from(*v))?,
            (V::S8(v), T::S8) => self.mem.write_u8(offset, *v as u8)?,
            (V::U8(v), T::U8) => self.mem.write_u8(offset, *v)?,
            (V::S16(v), T::S16) => self.mem.write_u16(offset, *v as u16)?,
            (V::U16(v), T::U16) => self.mem.write_u16(offset, *v)?,
            (V::S32(v), T::S32) => self.mem.write_u32(offset, *v as u32)?,
            (V::U32(v), T::U32) => self.mem.write_u32(offset, *v)?,
            (V::S64(v), T::S64) => self.mem.write_u64(offset, *v as u64)?,
            (V::U64(v), T::U64) => self.mem.write_u64(offset, *v)?,
            (V::F32(v), T::F32) => self.mem.write_u32(offset, v.to_bits())?,
            (V::F64(v), T::F64) => self.mem.write_u64(offset, v.to_bits())?,
            (V::Char(v), T::Char) => self.mem.write_u32(offset, *v as u32)?,
            (V::String(v), T::String) => {
                let (ptr, len) = self.string_to_memory(v)?;
                self.mem.write_u32(offset, ptr)?;
                self.mem.write_u32(offset + 4, len)?;
            }
            (V::List(items), T::List(elem)) => {
                let (ptr, len) = self.list_to_memory(items, elem)?;
                self.mem.write_u32(offset, ptr)?;
                self.mem.write_u32(offset + 4, len)?;
            }
            (V::Record(values), T::Record(fields)) if values.len() == fields.len() => {
                let (_, offsets) = record_layout(fields.iter().map(|(_, t)| t));
                for ((name, value), (field_ty, field_offset)) in values
                    .iter()
                    .zip(fields.iter().map(|(_, t)| t).zip(offsets))
                {
                    self.store(value, field_ty, offset + field_offset)
                        .map_err(|e| annotate_field(e, name))?;
                }
            }
            (V::Tuple(values), T::Tuple(tys)) if values.len() == tys.len() => {
                let (_, offsets) = record_layout(tys.iter());
                for (index, ((value, ty), field_offset)) in
                    values.iter().zip(tys).zip(offsets).enumerate()
                {
                    self.store(value, ty, offset + field_offset)
                        .map_err(|e| annotate_index(e, index))?;
                }
            }
            (V::Variant { case, payload }, T::Variant(cases)) => {
                let declared = cases.get(*case as usize).ok_or_else(|| {
                    Error::from(ComponentError::encode(
                        ErrorKind::InvalidVariant,
                        format!("variant case {case} out of range ({} cases)", cases.len()),
                    ))
                })?;
                let slots: Vec<_> = cases.iter().map(|(_, t)| t.as_ref()).collect();
                self.store_union(
                    *case,
                    payload.as_deref(),
                    declared.1.as_ref(),
                    &declared.0,
                    &slots,
                    offset,
                )?;
            }
            (V::Enum(case), T::Enum(cases)) => {
                if *case as usize >= cases.len() {
                    return Err(ComponentError::encode(
                        ErrorKind::InvalidEnum,
                        format!("enum case {case} out of range ({} cases)", cases.len()),
                    )
                    .into());
                }
                self.write_discriminant(offset, *case, cases.len())?;
            }
            (V::Option(payload), T::Option(elem)) => {
                let discr = u32::from(payload.is_some());
                self.store_union(
                    discr,
                    payload.as_deref(),
                    payload.is_some().then_some(elem.as_ref()),
                    "some",
                    &[None, Some(elem.as_ref())],
                    offset,
                )?;
            }
            (V::Result(result), T::Result { ok, err }) => {
                let (discr, payload, payload_ty, label) = match result {
                    Ok(v) => (0, v.as_deref(), ok.as_deref(), "ok"),
                    Err(v) => (1, v.as_deref(), err.as_deref(), "err"),
                };
                self.store_union(
                    discr,
                    payload,
                    payload_ty,
                    label,
                    &[ok.as_deref(), err.as_deref()],
                    offset,
                )?;
            }
            (V::Flags(bits), T::Flags(names)) => {
                check_flags_width(names)?;
                let masked = mask_flags(*bits, names.len());
                if names.len() <= 32 {
                    self.mem.write_u32(offset, masked as u32)?;
                } else {
                    self.mem.write_u64(offset, masked)?;
                }
            }
            (V::Own { ty: vty, rep }, T::Own(decl)) if vty == decl => {
                let handle = self.resources_mut()?.lower_own(*decl, *rep);
                self.mem.write_u32(offset, handle)?;
            }
            (V::Borrow { ty: vty, rep }, T::Borrow(decl)) if vty == decl => {
                let handle = self.resources_mut()?.lower_borrow(*decl, *rep);
                self.lowered_borrows.push((*decl, handle));
                self.mem.write_u32(offset, handle)?;
            }
            (value, ty) => return Err(mismatch(value, ty)),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn store_union(
        &mut self,
        discr: u32,
        payload: Option<&InterfaceValue>,
        payload_ty: Option<&InterfaceType>,
        case_name: &str,
        cases: &[Option<&InterfaceType>],
        offset: u32,
    ) -> Result<(), Error> {
        self.write_discriminant(offset, discr, cases.len())?;
        match (payload, payload_ty) {
            (Some(value), Some(ty)) => {
                let payload_offset =
                    variant_payload_offset(cases.len(), max_case_align(cases));
                self.store(value, ty, offset + payload_offset)
                    .map_err(|e| annotate_field(e, case_name))?;
            }
            (None, None) => {}
            _ => {
                return Err(ComponentError::encode(
                    ErrorKind::InvalidVariant,
                    format!("case `{case_name}` payload does not match the declared type"),
                )
                .into());
            }
        }
        Ok(())
    }

    fn write_discriminant(&mut self, offset: u32, discr: u32, cases: usize) -> Result<(), Error> {
        match discriminant_size(cases) {
            1 => self.mem.write_u8(offset, discr as u8),
            2 => self.mem.write_u16(offset, discr as u16),
            _ => self.mem.write_u32(offset, discr),
        }
    }

    fn string_to_memory(&mut self, value: &str) -> Result<(u32, u32), Error> {
        if self.encoding != StringEncoding::Utf8 {
            return Err(unsupported_encoding(self.encoding));
        }
        let bytes = value.as_bytes();
        if bytes.is_empty() {
            return Ok((0, 0));
        }
        let ptr = self.mem.alloc(bytes.len() as u32, 1)?;
        self.mem.write(ptr, bytes)?;
        Ok((ptr, bytes.len() as u32))
    }

    fn list_to_memory(
        &mut self,
        items: &[InterfaceValue],
        elem: &InterfaceType,
    ) -> Result<(u32, u32), Error> {
        let elem_layout = layout(elem);
        let total = elem_layout
            .size
            .checked_mul(items.len() as u32)
            .ok_or_else(|| {
                Error::from(ComponentError::encode(
                    ErrorKind::Overflow,
                    format!("list of {} element(s) overflows linear memory", items.len()),
                ))
            })?;
        if total == 0 {
            return Ok((0, items.len() as u32));
        }
        let ptr = self.mem.alloc(total, elem_layout.align)?;
        for (index, item) in items.iter().enumerate() {
            self.store(item, elem, ptr + index as u32 * elem_layout.size)
                .map_err(|e| annotate_index(e, index))?;
        }
        Ok((ptr, items.len() as u32))
    }

    fn resources_mut(&mut self) -> Result<&mut ResourceStore, Error> {
        self.resources.as_deref_mut().ok_or_else(|| {
            Error::from(ComponentError::encode(
                ErrorKind::NotInitialized,
                "no resource tables available in this lowering context",
            ))
        })
    }
}

fn mask_flags(bits: u64, count: usize) -> u64 {
    if count >= 64 {
        bits
    } else {
        bits & ((1u64 << count) - 1)
    }
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

/// Flag sets wider than 64 do not fit the host-side bitset.
pub(crate) fn check_flags_width(names: &[String]) -> Result<(), Error> {
    if names.len() > 64 {
        return Err(ComponentError::validate(
            ErrorKind::Unsupported,
            format!("{} flags exceed the supported maximum of 64", names.len()),
        )
        .into());
    }
    Ok(())
}
