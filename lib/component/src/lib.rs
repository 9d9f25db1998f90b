#![warn(
    nonstandard_style,
    unused_imports,
    unused_mut,
    unused_variables,
    unreachable_patterns,
    missing_docs
)]
#![forbid(unsafe_code)]
#![doc(html_favicon_url = "https://wasmer.io/static/icons/favicon.ico")]
#![doc(html_logo_url = "https://avatars3.githubusercontent.com/u/44205449?s=200&v=4")]

//! WebAssembly Component Model linking for the Wasmer runtime.
//!
//! This crate takes a parsed component — a tree of core modules with
//! typed imports, exports and canonical definitions — wires its core
//! instances together with host-supplied functions and with each
//! other, and exposes the component's typed exports as callable
//! procedures.
//!
//! The pieces:
//!
//! * [`Linker`] holds the host binding registry and the engine-level
//!   bridge cache. Host functions are registered under
//!   `package:ns/interface@version#function` paths with optional
//!   semver-compatible lookup.
//! * [`Linker::instantiate_pre`] runs the expensive per-component
//!   phase once: core modules compile, the instantiation order is
//!   derived, every host import resolves (or fails fast, all
//!   together).
//! * [`InstancePre::instantiate`] materialises any number of isolated
//!   live [`Instance`]s, each with its own store, resource tables and
//!   memory.
//! * [`Instance::call`] applies the canonical ABI — flat values, guest
//!   allocation, return pointers, post-return cleanup — while
//!   [`Instance::call_raw`] moves raw words.
//!
//! ```no_run
//! use wasmer_component::{Component, InterfaceValue, Linker};
//!
//! # fn main() -> Result<(), wasmer_component::Error> {
//! # let component = Component::default();
//! let linker = Linker::default();
//! linker.define_func(
//!     "test:minimal/host@0.1.0#add",
//!     |_cx, args| {
//!         let (a, b) = match (&args[0], &args[1]) {
//!             (InterfaceValue::U32(a), InterfaceValue::U32(b)) => (*a, *b),
//!             _ => unreachable!(),
//!         };
//!         Ok(vec![InterfaceValue::U32(a + b)])
//!     },
//!     vec![
//!         wasmer_component::InterfaceType::U32,
//!         wasmer_component::InterfaceType::U32,
//!     ],
//!     vec![wasmer_component::InterfaceType::U32],
//! )?;
//!
//! let pre = linker.instantiate_pre(component)?;
//! let mut instance = pre.instantiate()?;
//! let results = instance.call("compute", &[5u32.into(), 6u32.into()])?;
//! # drop(results);
//! # Ok(())
//! # }
//! ```

pub mod abi;
mod bridge;
mod call;
pub mod component;
mod context;
pub mod emit;
mod errors;
pub mod graph;
mod instance;
mod linker;
pub mod registry;
pub mod resources;
mod types;
mod values;

pub use crate::component::{
    Alias, CanonicalOptions, Component, ComponentExport, ComponentFuncDef, ComponentImport,
    CoreExportDecl, CoreExportRef, CoreExternKind, CoreFuncDef, CoreInstanceDecl, ExportSort,
    InstantiateArg, SectionKind, StartDecl, StringEncoding,
};
pub use crate::context::{CancelToken, HostContext, HostHandler};
pub use crate::errors::{
    ComponentError, Error, ErrorKind, InstantiationError, MissingImportsError, Phase,
};
pub use crate::instance::Instance;
pub use crate::linker::{InstancePre, Linker, LinkerConfig};
pub use crate::registry::{FuncDef, HostRegistry};
pub use crate::resources::{Destructor, Handle, ResourceStore, ResourceTable};
pub use crate::types::{InterfaceFuncType, InterfaceType, TypeDef, TypeResolver};
pub use crate::values::InterfaceValue;

// The engine this crate links against.
pub use wasmer;
