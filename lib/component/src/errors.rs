//! The errors reported while linking, transcoding and calling into
//! components.
//!
//! Every failure path in this crate produces a typed, structured error.
//! [`ComponentError`] is the workhorse: it carries the pipeline
//! [`Phase`] the failure happened in, an [`ErrorKind`] tag, an optional
//! path into the interface value being transcoded, and an optional
//! underlying cause. [`MissingImportsError`] and [`InstantiationError`]
//! cover the two aggregate failure modes of instantiation.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// The pipeline phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Compiling a core module or a synthesised bridge module.
    Compile,
    /// Lowering host values into flat values and linear memory.
    Encode,
    /// Lifting flat values and linear memory back into host values.
    Decode,
    /// Validating signatures, arities or component structure.
    Validate,
    /// Executing guest code.
    Runtime,
    /// Wiring imports to exports.
    Linking,
    /// Loading a component or core module binary.
    Load,
    /// Running a registered host function.
    Host,
    /// Parsing paths, versions or binaries.
    Parse,
}

impl Phase {
    /// The stable, lower-case tag for this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Encode => "encode",
            Self::Decode => "decode",
            Self::Validate => "validate",
            Self::Runtime => "runtime",
            Self::Linking => "linking",
            Self::Load => "load",
            Self::Host => "host",
            Self::Parse => "parse",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained classification of a [`ComponentError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    TypeMismatch,
    OutOfBounds,
    InvalidData,
    Unsupported,
    Allocation,
    FieldMissing,
    FieldUnknown,
    InvalidUtf8,
    Overflow,
    NilPointer,
    InvalidEnum,
    InvalidVariant,
    MissingImport,
    NotFound,
    NotInitialized,
    InvalidInput,
    Registration,
    Instantiation,
}

impl ErrorKind {
    /// The stable, snake-case tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TypeMismatch => "type_mismatch",
            Self::OutOfBounds => "out_of_bounds",
            Self::InvalidData => "invalid_data",
            Self::Unsupported => "unsupported",
            Self::Allocation => "allocation",
            Self::FieldMissing => "field_missing",
            Self::FieldUnknown => "field_unknown",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::Overflow => "overflow",
            Self::NilPointer => "nil_pointer",
            Self::InvalidEnum => "invalid_enum",
            Self::InvalidVariant => "invalid_variant",
            Self::MissingImport => "missing_import",
            Self::NotFound => "not_found",
            Self::NotInitialized => "not_initialized",
            Self::InvalidInput => "invalid_input",
            Self::Registration => "registration",
            Self::Instantiation => "instantiation",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured error raised anywhere in the linking or canonical-ABI
/// pipeline.
#[derive(Debug)]
pub struct ComponentError {
    /// The phase the error was raised in.
    pub phase: Phase,
    /// The error classification.
    pub kind: ErrorKind,
    /// Path of field names into the interface value being transcoded,
    /// outermost first. Empty when the error is not value-related.
    pub path: Vec<String>,
    /// The Rust-side type involved, when known.
    pub host_type: Option<&'static str>,
    /// The interface-level type involved, when known.
    pub wit_type: Option<String>,
    /// Human-readable description.
    pub detail: String,
    /// Underlying cause, when the error wraps another one.
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ComponentError {
    /// Creates an error in the given phase with the given kind.
    pub fn new(phase: Phase, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            path: Vec::new(),
            host_type: None,
            wit_type: None,
            detail: detail.into(),
            cause: None,
        }
    }

    /// Shorthand for an error raised while lowering values.
    pub fn encode(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::new(Phase::Encode, kind, detail)
    }

    /// Shorthand for an error raised while lifting values.
    pub fn decode(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::new(Phase::Decode, kind, detail)
    }

    /// Shorthand for an error raised while validating input.
    pub fn validate(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::new(Phase::Validate, kind, detail)
    }

    /// Records the interface-level type the error relates to.
    pub fn with_wit_type(mut self, ty: impl Into<String>) -> Self {
        self.wit_type = Some(ty.into());
        self
    }

    /// Records the host-side type the error relates to.
    pub fn with_host_type(mut self, ty: &'static str) -> Self {
        self.host_type = Some(ty);
        self
    }

    /// Attaches an underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Prepends a field name to the value path. Transcoders call this
    /// while unwinding so the outermost field ends up first.
    pub fn annotate(mut self, segment: impl Into<String>) -> Self {
        self.path.insert(0, segment.into());
        self
    }
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error ({})", self.phase, self.kind)?;
        if !self.path.is_empty() {
            write!(f, " at `{}`", self.path.join("."))?;
        }
        write!(f, ": {}", self.detail)?;
        if let Some(wit) = &self.wit_type {
            write!(f, " (wit type `{wit}`)")?;
        }
        if let Some(host) = &self.host_type {
            write!(f, " (host type `{host}`)")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ComponentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Every unresolved host import of a component, grouped by namespace.
///
/// Raised once, at pre-instantiation time, instead of lazily failing on
/// the first unresolved import hit at runtime. Function names that look
/// like mangled Rust symbols are demangled for readability.
#[derive(Debug, Default)]
pub struct MissingImportsError {
    /// Namespace (e.g. `wasi:io/streams@0.2.1`) to unresolved function
    /// names within it.
    pub missing: BTreeMap<String, Vec<String>>,
}

impl MissingImportsError {
    /// Records one unresolved import.
    pub fn push(&mut self, namespace: impl Into<String>, name: impl Into<String>) {
        self.missing
            .entry(namespace.into())
            .or_default()
            .push(name.into());
    }

    /// Whether any import is missing.
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    /// Total number of unresolved imports.
    pub fn len(&self) -> usize {
        self.missing.values().map(Vec::len).sum()
    }
}

impl fmt::Display for MissingImportsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} unresolved host import(s):", self.len())?;
        for (namespace, names) in &self.missing {
            writeln!(f, "  {namespace}:")?;
            for name in names {
                let demangled = rustc_demangle::demangle(name).to_string();
                if demangled != *name {
                    writeln!(f, "    {demangled} ({name})")?;
                } else {
                    writeln!(f, "    {name}")?;
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for MissingImportsError {}

/// A failure while materialising one core instance of a live component
/// instance.
#[derive(Debug)]
pub struct InstantiationError {
    /// The instantiation sub-phase, e.g. `"bridge_create"` or
    /// `"instantiate"`.
    pub phase: &'static str,
    /// Index of the core-instance declaration being materialised.
    pub instance_index: u32,
    /// The import path being satisfied when the failure happened, if
    /// any.
    pub import_path: String,
    /// Human-readable reason.
    pub reason: String,
    /// Underlying cause.
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl InstantiationError {
    /// Creates an instantiation error for the given sub-phase and core
    /// instance.
    pub fn new(phase: &'static str, instance_index: u32, reason: impl Into<String>) -> Self {
        Self {
            phase,
            instance_index,
            import_path: String::new(),
            reason: reason.into(),
            cause: None,
        }
    }

    /// Records the import path being satisfied.
    pub fn with_import_path(mut self, path: impl Into<String>) -> Self {
        self.import_path = path.into();
        self
    }

    /// Attaches an underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for InstantiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instantiation failed (phase {}, core instance {})",
            self.phase, self.instance_index
        )?;
        if !self.import_path.is_empty() {
            write!(f, " while satisfying `{}`", self.import_path)?;
        }
        write!(f, ": {}", self.reason)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for InstantiationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// The crate-level error type.
///
/// Engine-level errors are wrapped rather than stringified so callers
/// can still reach the original trap or link failure.
#[derive(Debug, Error)]
pub enum Error {
    /// A structured linking/transcoding error.
    #[error(transparent)]
    Component(#[from] ComponentError),

    /// One or more host imports could not be resolved.
    #[error(transparent)]
    MissingImports(#[from] MissingImportsError),

    /// A core instance could not be materialised.
    #[error(transparent)]
    Instantiation(#[from] InstantiationError),

    /// A trap or host error escaped a guest call.
    #[error(transparent)]
    Runtime(#[from] wasmer::RuntimeError),

    /// A core or bridge module failed to compile.
    #[error(transparent)]
    Compile(#[from] wasmer::CompileError),

    /// The engine rejected an instantiation.
    #[error(transparent)]
    Engine(#[from] wasmer::InstantiationError),

    /// A named export was missing or of the wrong sort.
    #[error(transparent)]
    Export(#[from] wasmer::ExportError),

    /// A linear-memory access was out of bounds.
    #[error(transparent)]
    MemoryAccess(#[from] wasmer::MemoryAccessError),
}

impl Error {
    /// The `not_found` error used when an export lookup fails.
    pub fn export_not_found(name: &str) -> Self {
        ComponentError::new(
            Phase::Runtime,
            ErrorKind::NotFound,
            format!("no export named `{name}`"),
        )
        .into()
    }

    /// The `type_mismatch` error used when a host value cannot be
    /// coerced to a core type.
    pub fn cannot_coerce(host_type: &'static str, want: &str) -> Self {
        ComponentError::new(
            Phase::Encode,
            ErrorKind::TypeMismatch,
            format!("cannot coerce host value to core `{want}`"),
        )
        .with_host_type(host_type)
        .into()
    }

    /// Returns the structured kind tag when this is a component error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Component(e) => Some(e.kind),
            Self::MissingImports(_) => Some(ErrorKind::MissingImport),
            Self::Instantiation(_) => Some(ErrorKind::Instantiation),
            _ => None,
        }
    }
}
