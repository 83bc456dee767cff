//! Hierarchical registry of native functions, constant values, and nested
//! modules, built before the first script runs.
//!
//! Nodes and callables live in arenas owned by the tree; everything the
//! runtime sees is an index ([`FuncId`]), never a native address. Constants
//! are stored as deferred producers so they materialize against whichever
//! context installs them.

use std::collections::BTreeMap;

use crate::callable::{IntoNativeCallable, NativeCallable};
use crate::error::EngineError;
use crate::ffi::{Context, Value};
use crate::marshal::ScriptType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueId(pub(crate) u32);

pub(crate) type ValueProducer = Box<dyn Fn(*mut Context) -> Value>;

struct NodeData {
    /// Dotted path from the root, for diagnostics only.
    path: String,
    children: BTreeMap<String, NodeId>,
    funcs: BTreeMap<String, FuncId>,
    values: BTreeMap<String, ValueId>,
}

impl NodeData {
    fn new(path: String) -> Self {
        Self {
            path,
            children: BTreeMap::new(),
            funcs: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    fn name_in_use(&self, name: &str) -> bool {
        self.children.contains_key(name)
            || self.funcs.contains_key(name)
            || self.values.contains_key(name)
    }
}

pub struct ModuleTree {
    nodes: Vec<NodeData>,
    funcs: Vec<Box<dyn NativeCallable>>,
    values: Vec<ValueProducer>,
}

impl ModuleTree {
    pub(crate) const ROOT: NodeId = NodeId(0);

    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![NodeData::new(String::new())],
            funcs: Vec::new(),
            values: Vec::new(),
        }
    }

    fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.0 as usize]
    }

    fn display_path(&self, id: NodeId) -> &str {
        let path = self.node(id).path.as_str();
        if path.is_empty() {
            "the global namespace"
        } else {
            path
        }
    }

    pub(crate) fn callable(&self, id: FuncId) -> Option<&dyn NativeCallable> {
        self.funcs.get(id.0 as usize).map(|c| c.as_ref())
    }

    pub(crate) fn producer(&self, id: ValueId) -> Option<&ValueProducer> {
        self.values.get(id.0 as usize)
    }

    pub(crate) fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent).children.get(name).copied()
    }

    pub(crate) fn funcs_of(&self, id: NodeId) -> impl Iterator<Item = (&str, FuncId)> {
        self.node(id).funcs.iter().map(|(n, f)| (n.as_str(), *f))
    }

    pub(crate) fn values_of(&self, id: NodeId) -> impl Iterator<Item = (&str, ValueId)> {
        self.node(id).values.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub(crate) fn children_of(&self, id: NodeId) -> impl Iterator<Item = (&str, NodeId)> {
        self.node(id).children.iter().map(|(n, c)| (n.as_str(), *c))
    }

    /// Every exported name of a node: functions, values, and child modules.
    pub(crate) fn export_names(&self, id: NodeId) -> Vec<String> {
        let node = self.node(id);
        let mut names = Vec::with_capacity(
            node.funcs.len() + node.values.len() + node.children.len(),
        );
        names.extend(node.funcs.keys().cloned());
        names.extend(node.values.keys().cloned());
        names.extend(node.children.keys().cloned());
        names
    }

    /// Snapshot of the top-level native modules and their export names, used
    /// by the ahead-of-time compiler's stub loader.
    pub(crate) fn export_surface(&self) -> BTreeMap<String, Vec<String>> {
        self.node(Self::ROOT)
            .children
            .iter()
            .map(|(name, id)| (name.clone(), self.export_names(*id)))
            .collect()
    }

    fn check_name(&self, parent: NodeId, name: &str) -> Result<(), EngineError> {
        if name.is_empty() {
            return Err(EngineError::registration(format!(
                "empty name registered in {}",
                self.display_path(parent)
            )));
        }
        if self.node(parent).name_in_use(name) {
            return Err(EngineError::registration(format!(
                "duplicate registration in {}: {name}",
                self.display_path(parent)
            )));
        }
        Ok(())
    }

    fn ensure_child(&mut self, parent: NodeId, name: &str) -> Result<NodeId, EngineError> {
        if let Some(existing) = self.child(parent, name) {
            return Ok(existing);
        }
        self.check_name(parent, name)?;
        let parent_path = self.node(parent).path.as_str();
        let path = if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}.{name}")
        };
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData::new(path));
        self.node_mut(parent).children.insert(name.to_string(), id);
        Ok(id)
    }

    fn add_func(
        &mut self,
        parent: NodeId,
        name: &str,
        callable: Box<dyn NativeCallable>,
    ) -> Result<(), EngineError> {
        self.check_name(parent, name)?;
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(callable);
        self.node_mut(parent).funcs.insert(name.to_string(), id);
        Ok(())
    }

    fn add_value(
        &mut self,
        parent: NodeId,
        name: &str,
        producer: ValueProducer,
    ) -> Result<(), EngineError> {
        self.check_name(parent, name)?;
        let id = ValueId(self.values.len() as u32);
        self.values.push(producer);
        self.node_mut(parent).values.insert(name.to_string(), id);
        Ok(())
    }
}

/// Fluent builder over one tree node. Registration methods return the node
/// again so declarations chain with `?`:
///
/// ```ignore
/// engine
///     .globals_mut()?
///     .module("math")?
///     .func("add", |a: i32, b: i32| a + b)?
///     .value("PI", std::f64::consts::PI)?;
/// ```
pub struct ModuleRef<'a> {
    tree: &'a mut ModuleTree,
    node: NodeId,
}

impl std::fmt::Debug for ModuleRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRef").field("node", &self.node).finish()
    }
}

impl<'a> ModuleRef<'a> {
    pub(crate) fn new(tree: &'a mut ModuleTree, node: NodeId) -> Self {
        Self { tree, node }
    }

    /// Descend into (creating if absent) the named child module.
    pub fn module(self, name: &str) -> Result<ModuleRef<'a>, EngineError> {
        let node = self.tree.ensure_child(self.node, name)?;
        Ok(ModuleRef {
            tree: self.tree,
            node,
        })
    }

    /// Register a native function. Arity and per-argument conversions come
    /// from the function's own signature.
    pub fn func<Args, F>(self, name: &str, f: F) -> Result<ModuleRef<'a>, EngineError>
    where
        F: IntoNativeCallable<Args>,
    {
        self.tree
            .add_func(self.node, name, Box::new(f.into_callable()))?;
        Ok(self)
    }

    /// Register a constant. The value is captured now and rematerialized
    /// against the live context whenever it is installed.
    pub fn value<T>(self, name: &str, value: T) -> Result<ModuleRef<'a>, EngineError>
    where
        T: ScriptType + Clone,
    {
        let producer: ValueProducer =
            Box::new(move |ctx| unsafe { value.clone().into_value(ctx) });
        self.tree.add_value(self.node, name, producer)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_rejected_per_node() {
        let mut tree = ModuleTree::new();
        ModuleRef::new(&mut tree, ModuleTree::ROOT)
            .module("math")
            .expect("create math")
            .func("add", |a: i32, b: i32| a + b)
            .expect("register add");

        let err = ModuleRef::new(&mut tree, ModuleTree::ROOT)
            .module("math")
            .expect("reopen math")
            .func("add", |a: i32, b: i32| a * b)
            .expect_err("duplicate function name must fail");
        assert_eq!(err.kind, crate::error::EngineErrorKind::Registration);
        assert!(err.message.contains("math"), "message: {}", err.message);

        // Same name in a different category of the same node is also an
        // error: both would land on the same runtime object.
        let err = ModuleRef::new(&mut tree, ModuleTree::ROOT)
            .module("math")
            .expect("reopen math")
            .value("add", 1i32)
            .expect_err("cross-category duplicate must fail");
        assert_eq!(err.kind, crate::error::EngineErrorKind::Registration);
    }

    #[test]
    fn same_name_is_fine_in_sibling_modules() {
        let mut tree = ModuleTree::new();
        ModuleRef::new(&mut tree, ModuleTree::ROOT)
            .module("a")
            .and_then(|m| m.func("go", || {}))
            .expect("a.go");
        ModuleRef::new(&mut tree, ModuleTree::ROOT)
            .module("b")
            .and_then(|m| m.func("go", || {}))
            .expect("b.go");
    }

    #[test]
    fn export_names_cover_all_categories() {
        let mut tree = ModuleTree::new();
        let graphics = ModuleRef::new(&mut tree, ModuleTree::ROOT)
            .module("graphics")
            .expect("graphics");
        graphics
            .func("clear", |_r: f64, _g: f64, _b: f64, _a: f64| {})
            .expect("clear")
            .value("DEFAULT_SCALE", 1.0f64)
            .expect("scale")
            .module("color")
            .expect("color");

        let id = tree.child(ModuleTree::ROOT, "graphics").expect("node");
        let mut names = tree.export_names(id);
        names.sort();
        assert_eq!(names, ["DEFAULT_SCALE", "clear", "color"]);
    }

    #[test]
    fn module_is_create_or_get() {
        let mut tree = ModuleTree::new();
        ModuleRef::new(&mut tree, ModuleTree::ROOT)
            .module("audio")
            .expect("create");
        ModuleRef::new(&mut tree, ModuleTree::ROOT)
            .module("audio")
            .expect("get")
            .func("play", |_name: String| {})
            .expect("register");
        assert_eq!(tree.export_surface()["audio"], vec!["play".to_string()]);
    }
}
