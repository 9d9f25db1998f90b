//! The interface-level (WIT) type system understood by the canonical
//! ABI transcoder, and the resolver over a component's type index
//! space.

use crate::errors::{ComponentError, Error, ErrorKind, Phase};

/// An interface-level type.
///
/// This is the type language of component-level function signatures:
/// primitives, compounds (`list`, `tuple`, `option`, `result`) and named
/// shapes (records, variants, enums, flags and resource handles).
/// Nested types are stored inline; a component's *defined* types are
/// reached through [`TypeResolver`].
#[derive(Debug, Clone, PartialEq)]
pub enum InterfaceType {
    /// `bool`, lowered as an `i32` of 0 or 1.
    Bool,
    /// Signed 8-bit integer.
    S8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer.
    S16,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 32-bit integer.
    S32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    S64,
    /// Unsigned 64-bit integer.
    U64,
    /// IEEE 754 single-precision float.
    F32,
    /// IEEE 754 double-precision float.
    F64,
    /// A Unicode scalar value.
    Char,
    /// A UTF-8 string, lowered as a (pointer, length) pair.
    String,
    /// `list<T>`, lowered as a (pointer, length) pair.
    List(Box<InterfaceType>),
    /// A record with named fields, laid out in declaration order.
    Record(Vec<(String, InterfaceType)>),
    /// A tuple, a record with positional fields.
    Tuple(Vec<InterfaceType>),
    /// A variant: a discriminant picking one of the named cases, each
    /// with an optional payload.
    Variant(Vec<(String, Option<InterfaceType>)>),
    /// An enum: a variant with no payloads.
    Enum(Vec<String>),
    /// `option<T>`.
    Option(Box<InterfaceType>),
    /// `result<T, E>`; either side may carry no payload.
    Result {
        /// Payload of the `ok` case.
        ok: Option<Box<InterfaceType>>,
        /// Payload of the `err` case.
        err: Option<Box<InterfaceType>>,
    },
    /// A set of named flags packed into one or two 32-bit words.
    Flags(Vec<String>),
    /// An owned handle to the resource type with the given id.
    Own(u32),
    /// A borrowed handle to the resource type with the given id.
    Borrow(u32),
}

impl InterfaceType {
    /// Whether values of this type carry resource handles anywhere in
    /// their structure. Transcoding such values needs the owning
    /// instance's resource tables.
    pub fn uses_resources(&self) -> bool {
        match self {
            Self::Own(_) | Self::Borrow(_) => true,
            Self::List(t) | Self::Option(t) => t.uses_resources(),
            Self::Record(fields) => fields.iter().any(|(_, t)| t.uses_resources()),
            Self::Tuple(tys) => tys.iter().any(Self::uses_resources),
            Self::Variant(cases) => cases
                .iter()
                .any(|(_, t)| t.as_ref().is_some_and(Self::uses_resources)),
            Self::Result { ok, err } => {
                ok.as_deref().is_some_and(Self::uses_resources)
                    || err.as_deref().is_some_and(Self::uses_resources)
            }
            _ => false,
        }
    }

    /// A short display name used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Bool => "bool".into(),
            Self::S8 => "s8".into(),
            Self::U8 => "u8".into(),
            Self::S16 => "s16".into(),
            Self::U16 => "u16".into(),
            Self::S32 => "s32".into(),
            Self::U32 => "u32".into(),
            Self::S64 => "s64".into(),
            Self::U64 => "u64".into(),
            Self::F32 => "f32".into(),
            Self::F64 => "f64".into(),
            Self::Char => "char".into(),
            Self::String => "string".into(),
            Self::List(t) => format!("list<{}>", t.describe()),
            Self::Record(_) => "record".into(),
            Self::Tuple(tys) => format!("tuple<{} fields>", tys.len()),
            Self::Variant(_) => "variant".into(),
            Self::Enum(_) => "enum".into(),
            Self::Option(t) => format!("option<{}>", t.describe()),
            Self::Result { .. } => "result".into(),
            Self::Flags(_) => "flags".into(),
            Self::Own(id) => format!("own<{id}>"),
            Self::Borrow(id) => format!("borrow<{id}>"),
        }
    }
}

/// The type of a component-level function: named parameters and a
/// (possibly empty) result list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InterfaceFuncType {
    /// Parameter names and types, in declaration order.
    pub params: Vec<(String, InterfaceType)>,
    /// Result types.
    pub results: Vec<InterfaceType>,
}

impl InterfaceFuncType {
    /// Creates a function type from parameters and results.
    pub fn new(params: Vec<(String, InterfaceType)>, results: Vec<InterfaceType>) -> Self {
        Self { params, results }
    }
}

/// One entry of a component's type index space.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDef {
    /// A component function type, the target of `canon lift`.
    Func(InterfaceFuncType),
    /// A defined value type.
    Defined(InterfaceType),
    /// A resource type declaration; the id names its handle table.
    Resource(u32),
}

/// Resolves indices into a component's type index space.
///
/// Defined-type chains are followed; the resolver is cheap to construct
/// and borrows the component's type list.
#[derive(Debug, Clone, Copy)]
pub struct TypeResolver<'a> {
    types: &'a [TypeDef],
}

impl<'a> TypeResolver<'a> {
    /// Creates a resolver over a type index space.
    pub fn new(types: &'a [TypeDef]) -> Self {
        Self { types }
    }

    fn get(&self, index: u32) -> Result<&'a TypeDef, Error> {
        self.types.get(index as usize).ok_or_else(|| {
            ComponentError::new(
                Phase::Validate,
                ErrorKind::NotFound,
                format!("type index {index} out of range ({} types)", self.types.len()),
            )
            .into()
        })
    }

    /// Resolves a type index to a function type.
    pub fn func_type(&self, index: u32) -> Result<&'a InterfaceFuncType, Error> {
        match self.get(index)? {
            TypeDef::Func(ty) => Ok(ty),
            other => Err(ComponentError::new(
                Phase::Validate,
                ErrorKind::TypeMismatch,
                format!("type index {index} is not a function type: {other:?}"),
            )
            .into()),
        }
    }

    /// Resolves a type index to a value type.
    pub fn value_type(&self, index: u32) -> Result<&'a InterfaceType, Error> {
        match self.get(index)? {
            TypeDef::Defined(ty) => Ok(ty),
            other => Err(ComponentError::new(
                Phase::Validate,
                ErrorKind::TypeMismatch,
                format!("type index {index} is not a value type: {other:?}"),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_distinguishes_sorts() {
        let types = vec![
            TypeDef::Func(InterfaceFuncType::new(
                vec![("a".into(), InterfaceType::U32)],
                vec![InterfaceType::U32],
            )),
            TypeDef::Defined(InterfaceType::String),
        ];
        let resolver = TypeResolver::new(&types);
        assert!(resolver.func_type(0).is_ok());
        assert!(resolver.func_type(1).is_err());
        assert!(resolver.value_type(1).is_ok());
        assert!(resolver.value_type(2).is_err());
    }
}
