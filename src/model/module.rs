use ndarray::ArrayD;

use super::layers::{Layer, ParamKind};

/// A node of the module tree: one layer plus its named children.
#[derive(Debug, Clone)]
pub struct Module {
    layer: Layer,
    children: Vec<(String, Module)>,
}

/// A tensor of the module tree with its fully qualified name
/// (e.g. `features.0.1.running_var`).
#[derive(Debug, Clone)]
pub struct NamedTensor<'a> {
    pub name: String,
    pub kind: ParamKind,
    pub value: &'a ArrayD<f32>,
}

impl Module {
    /// A module without children
    pub fn leaf(layer: Layer) -> Self {
        Self { layer, children: Vec::new() }
    }

    /// A module with explicitly named children
    pub fn container(layer: Layer, children: Vec<(String, Module)>) -> Self {
        Self { layer, children }
    }

    /// A `Sequential` whose children are named by position ("0", "1", ...).
    pub fn sequential(children: Vec<Module>) -> Self {
        let children = children
            .into_iter()
            .enumerate()
            .map(|(i, child)| (i.to_string(), child))
            .collect();
        Self { layer: Layer::Sequential, children }
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.children.iter().map(|(name, child)| (name.as_str(), child))
    }

    pub fn child(&self, name: &str) -> Option<&Module> {
        self.children
            .iter()
            .find(|(child_name, _)| child_name == name)
            .map(|(_, child)| child)
    }

    pub(crate) fn into_children(self) -> Vec<(String, Module)> {
        self.children
    }

    /// Resolves a dotted path relative to this module. The empty path is the module itself.
    pub fn get(&self, path: &str) -> Option<&Module> {
        if path.is_empty() {
            return Some(self);
        }
        path.split('.').try_fold(self, |module, segment| module.child(segment))
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Module> {
        if path.is_empty() {
            return Some(self);
        }
        let mut module = self;
        for segment in path.split('.') {
            module = module
                .children
                .iter_mut()
                .find(|(name, _)| name == segment)
                .map(|(_, child)| child)?;
        }
        Some(module)
    }

    /// Mutable access to a tensor by its fully qualified name.
    pub fn tensor_mut(&mut self, qualified: &str) -> Option<&mut ArrayD<f32>> {
        let (path, local) = match qualified.rsplit_once('.') {
            Some((path, local)) => (path, local),
            None => ("", qualified),
        };
        self.get_mut(path)?.layer.tensor_mut(local)
    }

    /// Walks the tree in declaration order, yielding `(qualified_name, module)`
    /// pairs lazily. The root comes first, under the empty name.
    pub fn named_modules(&self) -> NamedModules<'_> {
        NamedModules { stack: vec![(String::new(), self)] }
    }

    /// Every tensor in the tree (parameters and buffers), in traversal order.
    pub fn named_tensors(&self) -> impl Iterator<Item = NamedTensor<'_>> + '_ {
        self.named_modules().flat_map(|(prefix, module)| {
            module
                .layer
                .tensors()
                .into_iter()
                .map(move |(local, kind, value)| NamedTensor {
                    name: qualify(&prefix, local),
                    kind,
                    value,
                })
        })
    }

    /// Trainable tensors only, in traversal order.
    pub fn named_parameters(&self) -> impl Iterator<Item = NamedTensor<'_>> + '_ {
        self.named_tensors().filter(|tensor| tensor.kind == ParamKind::Parameter)
    }

    /// Number of trainable scalars, buffers excluded.
    pub fn num_parameters(&self) -> usize {
        self.named_parameters()
            .map(|tensor| tensor.value.len())
            .sum()
    }

    /// One-line description: the layer repr for leaves, type and child count for containers.
    pub fn descriptor(&self) -> String {
        if self.layer.is_container() {
            let count = self.children.len();
            format!(
                "{}({} {})",
                self.layer.type_name(),
                count,
                if count == 1 { "child" } else { "children" }
            )
        } else {
            self.layer.to_string()
        }
    }
}

/// Lazy pre-order traversal over a module tree.
pub struct NamedModules<'a> {
    stack: Vec<(String, &'a Module)>,
}

impl<'a> Iterator for NamedModules<'a> {
    type Item = (String, &'a Module);

    fn next(&mut self) -> Option<Self::Item> {
        let (name, module) = self.stack.pop()?;
        // Reverse so the first declared child is visited next
        for (child_name, child) in module.children.iter().rev() {
            self.stack.push((qualify(&name, child_name), child));
        }
        Some((name, module))
    }
}

pub(crate) fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
