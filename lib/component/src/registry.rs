//! The host binding registry.
//!
//! Host functions live in a tree of versioned namespaces mirroring the
//! component-model path syntax
//! `package:namespace/interface@major.minor.patch#function`. Lookups
//! prefer an exact version match and, when semver matching is enabled,
//! fall back to the highest registered sibling that is
//! semver-compatible with the request.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use semver::Version;

use crate::context::HostHandler;
use crate::errors::{ComponentError, Error, ErrorKind, Phase};
use crate::types::InterfaceType;

/// A registered host function: its handler and the interface-level
/// signature it was declared with.
#[derive(Clone)]
pub struct FuncDef {
    /// The handler invoked on every call.
    pub handler: HostHandler,
    /// Declared parameter types.
    pub params: Vec<InterfaceType>,
    /// Declared result types.
    pub results: Vec<InterfaceType>,
}

impl FuncDef {
    /// Bundles a handler with its declared signature.
    pub fn new(
        handler: HostHandler,
        params: Vec<InterfaceType>,
        results: Vec<InterfaceType>,
    ) -> Self {
        Self {
            handler,
            params,
            results,
        }
    }
}

impl fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncDef")
            .field("params", &self.params)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// One node of the namespace tree.
#[derive(Default)]
struct Namespace {
    funcs: HashMap<String, Arc<FuncDef>>,
    // Keyed by `name@major.minor.patch`, or bare `name` when
    // unversioned.
    children: HashMap<String, Arc<RwLock<Namespace>>>,
}

/// A path segment split into its name and optional version.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    name: String,
    version: Option<Version>,
}

impl Segment {
    fn key(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{}.{}.{}", self.name, v.major, v.minor, v.patch),
            None => self.name.clone(),
        }
    }
}

fn parse_version(text: &str) -> Result<Version, Error> {
    let mut parts = [0u64; 3];
    let mut count = 0;
    for piece in text.split('.') {
        if count == 3 {
            return Err(invalid_path(format!("version `{text}` has too many components")));
        }
        parts[count] = piece
            .parse::<u64>()
            .map_err(|_| invalid_path(format!("version component `{piece}` is not numeric")))?;
        count += 1;
    }
    if count == 0 {
        return Err(invalid_path("empty version"));
    }
    Ok(Version::new(parts[0], parts[1], parts[2]))
}

fn parse_segment(text: &str) -> Result<Segment, Error> {
    match text.split_once('@') {
        Some((name, version)) if !name.is_empty() => Ok(Segment {
            name: name.to_owned(),
            version: Some(parse_version(version)?),
        }),
        Some(_) => Err(invalid_path(format!("segment `{text}` has an empty name"))),
        None if text.is_empty() => Err(invalid_path("empty path segment")),
        None => Ok(Segment {
            name: text.to_owned(),
            version: None,
        }),
    }
}

fn parse_path(path: &str) -> Result<(Vec<Segment>, Option<String>), Error> {
    let (namespace, func) = match path.rsplit_once('#') {
        Some((ns, f)) if !f.is_empty() => (ns, Some(f.to_owned())),
        Some((ns, _)) => (ns, None),
        None => (path, None),
    };
    let mut segments = Vec::new();
    for part in namespace.split('/') {
        segments.push(parse_segment(part)?);
    }
    Ok((segments, func))
}

fn invalid_path(detail: impl Into<String>) -> Error {
    ComponentError::new(Phase::Parse, ErrorKind::InvalidInput, detail).into()
}

/// Whether `candidate` can satisfy a request for `wanted` under semver
/// rules. Majors must agree; a zero major treats the minor as breaking,
/// so it must agree too. Within the compatible range the candidate's
/// `(minor, patch)` must be at least the requested pair.
fn semver_compatible(wanted: &Version, candidate: &Version) -> bool {
    if candidate.major != wanted.major {
        return false;
    }
    if wanted.major == 0 && candidate.minor != wanted.minor {
        return false;
    }
    (candidate.minor, candidate.patch) >= (wanted.minor, wanted.patch)
}

/// The hierarchical, versioned registry of host functions.
///
/// The registry is safe for concurrent use: every node is behind a
/// read-write lock, so lookups proceed while other namespaces are being
/// registered.
pub struct HostRegistry {
    root: Arc<RwLock<Namespace>>,
    semver_matching: bool,
}

impl fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegistry")
            .field("semver_matching", &self.semver_matching)
            .finish_non_exhaustive()
    }
}

impl HostRegistry {
    /// Creates an empty registry.
    pub fn new(semver_matching: bool) -> Self {
        Self {
            root: Arc::default(),
            semver_matching,
        }
    }

    fn read(node: &Arc<RwLock<Namespace>>) -> std::sync::RwLockReadGuard<'_, Namespace> {
        match node.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(node: &Arc<RwLock<Namespace>>) -> std::sync::RwLockWriteGuard<'_, Namespace> {
        match node.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Walks to the namespace named by `path`, creating nodes on
    /// demand. The path must not name a function.
    pub fn namespace(&self, path: &str) -> Result<(), Error> {
        let (segments, func) = parse_path(path)?;
        if func.is_some() {
            return Err(invalid_path(format!(
                "`{path}` names a function, not a namespace"
            )));
        }
        self.walk_or_create(&segments)?;
        Ok(())
    }

    fn walk_or_create(&self, segments: &[Segment]) -> Result<Arc<RwLock<Namespace>>, Error> {
        let mut node = Arc::clone(&self.root);
        for segment in segments {
            let key = segment.key();
            let child = {
                let mut guard = Self::write(&node);
                Arc::clone(guard.children.entry(key).or_default())
            };
            node = child;
        }
        Ok(node)
    }

    /// Registers (or overwrites) a host function at `path`, which must
    /// end in `#name`.
    pub fn define_func(
        &self,
        path: &str,
        handler: HostHandler,
        params: Vec<InterfaceType>,
        results: Vec<InterfaceType>,
    ) -> Result<(), Error> {
        let (segments, func) = parse_path(path)?;
        let Some(func) = func else {
            return Err(ComponentError::new(
                Phase::Parse,
                ErrorKind::Registration,
                format!("`{path}` does not name a function (missing `#name`)"),
            )
            .into());
        };
        let node = self.walk_or_create(&segments)?;
        let def = Arc::new(FuncDef::new(handler, params, results));
        Self::write(&node).funcs.insert(func, def);
        Ok(())
    }

    /// Looks up the function named by `path`. Returns `None` when any
    /// segment or the function itself cannot be found; the caller
    /// surfaces that as an unresolved-import error.
    pub fn resolve(&self, path: &str) -> Result<Option<Arc<FuncDef>>, Error> {
        let (segments, func) = parse_path(path)?;
        let Some(func) = func else {
            return Err(invalid_path(format!("`{path}` does not name a function")));
        };
        let mut node = Arc::clone(&self.root);
        for segment in &segments {
            let child = {
                let guard = Self::read(&node);
                match guard.children.get(&segment.key()) {
                    Some(child) => Some(Arc::clone(child)),
                    None => self.semver_fallback(&guard, segment),
                }
            };
            match child {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        let def = Self::read(&node).funcs.get(&func).cloned();
        Ok(def)
    }

    /// Searches a node's children for the best semver-compatible match
    /// of a versioned segment. Higher minor beats higher patch.
    fn semver_fallback(
        &self,
        node: &Namespace,
        segment: &Segment,
    ) -> Option<Arc<RwLock<Namespace>>> {
        if !self.semver_matching {
            return None;
        }
        let wanted = segment.version.as_ref()?;
        let mut best: Option<(Version, Arc<RwLock<Namespace>>)> = None;
        for (key, child) in &node.children {
            let Ok(candidate) = parse_segment(key) else {
                continue;
            };
            if candidate.name != segment.name {
                continue;
            }
            let Some(version) = candidate.version else {
                continue;
            };
            if !semver_compatible(wanted, &version) {
                continue;
            }
            let better = match &best {
                Some((current, _)) => {
                    (version.minor, version.patch) > (current.minor, current.patch)
                }
                None => true,
            };
            if better {
                best = Some((version, Arc::clone(child)));
            }
        }
        best.map(|(_, child)| child)
    }

    /// Drops every registration, resetting the registry in place.
    pub fn close(&self) {
        let mut guard = Self::write(&self.root);
        *guard = Namespace::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::InterfaceValue;

    fn noop_handler() -> HostHandler {
        Arc::new(|_cx, _args| Ok(Vec::<InterfaceValue>::new()))
    }

    fn registry(semver: bool) -> HostRegistry {
        let registry = HostRegistry::new(semver);
        registry
            .define_func(
                "test:dep/iface@0.2.1#read",
                noop_handler(),
                vec![],
                vec![InterfaceType::U32],
            )
            .unwrap();
        registry
    }

    #[test]
    fn exact_match_resolves() {
        let registry = registry(true);
        assert!(registry.resolve("test:dep/iface@0.2.1#read").unwrap().is_some());
        assert!(registry.resolve("test:dep/iface@0.2.1#write").unwrap().is_none());
    }

    #[test]
    fn semver_matrix() {
        // Registered: 0.2.1 only.
        let on = registry(true);
        let off = registry(false);
        // Older patch request is satisfied only when matching is on.
        assert!(on.resolve("test:dep/iface@0.2.0#read").unwrap().is_some());
        assert!(off.resolve("test:dep/iface@0.2.0#read").unwrap().is_none());
        // Pre-1.0 minors are breaking in either mode.
        assert!(on.resolve("test:dep/iface@0.1.0#read").unwrap().is_none());
        assert!(off.resolve("test:dep/iface@0.1.0#read").unwrap().is_none());
        // Newer patch than anything registered never matches.
        assert!(on.resolve("test:dep/iface@0.2.2#read").unwrap().is_none());
        assert!(off.resolve("test:dep/iface@0.2.2#read").unwrap().is_none());
    }

    #[test]
    fn higher_minor_beats_higher_patch() {
        let registry = HostRegistry::new(true);
        for version in ["1.1.9", "1.2.0"] {
            registry
                .define_func(
                    &format!("pkg:ns/api@{version}#go"),
                    noop_handler(),
                    vec![InterfaceType::U32],
                    vec![],
                )
                .unwrap();
        }
        // Request 1.0.0; both siblings are compatible, 1.2.0 must win.
        let def = registry.resolve("pkg:ns/api@1.0.0#go").unwrap().unwrap();
        assert_eq!(def.params, vec![InterfaceType::U32]);
        let exact = registry.resolve("pkg:ns/api@1.1.9#go").unwrap();
        assert!(exact.is_some());
    }

    #[test]
    fn short_versions_default_missing_parts_to_zero() {
        let registry = HostRegistry::new(true);
        registry
            .define_func("pkg:ns/api@1#go", noop_handler(), vec![], vec![])
            .unwrap();
        assert!(registry.resolve("pkg:ns/api@1.0.0#go").unwrap().is_some());
        assert!(registry.resolve("pkg:ns/api@1.0#go").unwrap().is_some());
    }

    #[test]
    fn unversioned_segments_match_exactly() {
        let registry = HostRegistry::new(true);
        registry
            .define_func("env#log", noop_handler(), vec![], vec![])
            .unwrap();
        assert!(registry.resolve("env#log").unwrap().is_some());
        assert!(registry.resolve("env@1.0.0#log").unwrap().is_none());
    }

    #[test]
    fn redefinition_overwrites() {
        let registry = HostRegistry::new(true);
        registry
            .define_func("env#log", noop_handler(), vec![], vec![])
            .unwrap();
        registry
            .define_func("env#log", noop_handler(), vec![InterfaceType::String], vec![])
            .unwrap();
        let def = registry.resolve("env#log").unwrap().unwrap();
        assert_eq!(def.params, vec![InterfaceType::String]);
    }

    #[test]
    fn close_resets() {
        let registry = registry(true);
        registry.close();
        assert!(registry.resolve("test:dep/iface@0.2.1#read").unwrap().is_none());
    }

    #[test]
    fn concurrent_define_and_resolve() {
        let registry = Arc::new(HostRegistry::new(true));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        registry
                            .define_func(
                                &format!("pkg:ns/iface{w}@1.{i}.0#go"),
                                noop_handler(),
                                vec![],
                                vec![],
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|w| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        // Must never error or deadlock, whatever the
                        // interleaving; hits may or may not exist yet.
                        let _ = registry.resolve(&format!("pkg:ns/iface{w}@1.0.0#go")).unwrap();
                    }
                })
            })
            .collect();
        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert!(registry.resolve("pkg:ns/iface0@1.0.0#go").unwrap().is_some());
    }

    #[test]
    fn bad_paths_are_rejected() {
        let registry = HostRegistry::new(true);
        assert!(registry.define_func("env", noop_handler(), vec![], vec![]).is_err());
        assert!(registry.resolve("a//b#f").is_err());
        assert!(registry.resolve("a@x.y#f").is_err());
        assert!(registry.namespace("ns#f").is_err());
    }
}
