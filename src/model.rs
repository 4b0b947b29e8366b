//! Hierarchical design arena.
//!
//! Models, signals and blocks live in flat vectors and refer to each other by
//! index. A parent owns its children by [`ModelId`]; ports are plain signals
//! with a direction. Nothing here is checked beyond local well-formedness, the
//! whole-design rules run in [`crate::elaborate`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::ir::{Assign, Expr};
use crate::value::{self, mask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    Internal,
}

#[derive(Debug, Clone)]
pub struct SignalDecl {
    pub name: String,
    pub model: ModelId,
    pub width: usize,
    pub direction: Direction,
    pub init: u64,
}

#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub parent: Option<ModelId>,
    pub children: Vec<ModelId>,
    pub signals: Vec<SignalId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Combinational,
    Clocked,
}

#[derive(Debug, Clone)]
pub struct BlockDef {
    pub name: String,
    pub model: ModelId,
    pub kind: BlockKind,
    pub assigns: Vec<Assign>,
}

#[derive(Debug, Clone, Copy)]
pub enum Connection {
    Alias(SignalId, SignalId),
    Const(SignalId, u64),
    /// Bit ranges of two signals joined; which side drives is settled at
    /// elaboration.
    Slice {
        a: SignalId,
        a_range: (usize, usize),
        b: SignalId,
        b_range: (usize, usize),
    },
}

#[derive(Debug, Clone)]
pub struct Design {
    pub(crate) models: Vec<Model>,
    pub(crate) signals: Vec<SignalDecl>,
    pub(crate) blocks: Vec<BlockDef>,
    pub(crate) connections: Vec<Connection>,
    names: HashMap<(ModelId, String), SignalId>,
}

impl Design {
    pub fn new(root_name: &str) -> Self {
        Self {
            models: vec![Model {
                name: root_name.to_string(),
                parent: None,
                children: Vec::new(),
                signals: Vec::new(),
            }],
            signals: Vec::new(),
            blocks: Vec::new(),
            connections: Vec::new(),
            names: HashMap::new(),
        }
    }

    pub fn root(&self) -> ModelId {
        ModelId(0)
    }

    pub fn add_model(&mut self, parent: ModelId, name: &str) -> Result<ModelId> {
        let taken = self.models[parent.0]
            .children
            .iter()
            .any(|c| self.models[c.0].name == name);
        if taken {
            return Err(SimError::DuplicateName(self.child_path(parent, name)));
        }
        let id = ModelId(self.models.len());
        self.models.push(Model {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            signals: Vec::new(),
        });
        self.models[parent.0].children.push(id);
        Ok(id)
    }

    fn declare(
        &mut self,
        model: ModelId,
        name: &str,
        width: usize,
        direction: Direction,
        init: u64,
    ) -> Result<SignalId> {
        value::check_width(width)?;
        if init & !mask(width) != 0 {
            return Err(SimError::Width(format!(
                "initial value {:#x} of `{}` does not fit in {} bits",
                init,
                self.child_path(model, name),
                width
            )));
        }
        let key = (model, name.to_string());
        if self.names.contains_key(&key) {
            return Err(SimError::DuplicateName(self.child_path(model, name)));
        }
        let id = SignalId(self.signals.len());
        self.signals.push(SignalDecl {
            name: name.to_string(),
            model,
            width,
            direction,
            init,
        });
        self.names.insert(key, id);
        self.models[model.0].signals.push(id);
        Ok(id)
    }

    pub fn input(&mut self, model: ModelId, name: &str, width: usize) -> Result<SignalId> {
        self.declare(model, name, width, Direction::In, 0)
    }

    pub fn output(&mut self, model: ModelId, name: &str, width: usize) -> Result<SignalId> {
        self.declare(model, name, width, Direction::Out, 0)
    }

    pub fn wire(&mut self, model: ModelId, name: &str, width: usize) -> Result<SignalId> {
        self.declare(model, name, width, Direction::Internal, 0)
    }

    /// Internal signal with a reset value, normally written by a clocked block.
    pub fn reg(&mut self, model: ModelId, name: &str, width: usize, reset: u64) -> Result<SignalId> {
        self.declare(model, name, width, Direction::Internal, reset)
    }

    /// Output port with a reset value.
    pub fn reg_output(
        &mut self,
        model: ModelId,
        name: &str,
        width: usize,
        reset: u64,
    ) -> Result<SignalId> {
        self.declare(model, name, width, Direction::Out, reset)
    }

    pub fn comb(&mut self, model: ModelId, name: &str, assigns: Vec<Assign>) {
        self.block(model, name, BlockKind::Combinational, assigns)
    }

    pub fn clocked(&mut self, model: ModelId, name: &str, assigns: Vec<Assign>) {
        self.block(model, name, BlockKind::Clocked, assigns)
    }

    fn block(&mut self, model: ModelId, name: &str, kind: BlockKind, assigns: Vec<Assign>) {
        let name = self.child_path(model, name);
        self.blocks.push(BlockDef { name, model, kind, assigns });
    }

    /// Merge two signals into one net at elaboration.
    pub fn connect(&mut self, a: SignalId, b: SignalId) -> Result<()> {
        let (wa, wb) = (self.try_signal(a)?.width, self.try_signal(b)?.width);
        if wa != wb {
            return Err(SimError::Width(format!(
                "cannot connect `{}` ({} bits) to `{}` ({} bits)",
                self.path(a),
                wa,
                self.path(b),
                wb
            )));
        }
        self.connections.push(Connection::Alias(a, b));
        Ok(())
    }

    /// Join bits `[lo, hi)` of `a` to bits `[lo, hi)` of `b`. The driven side
    /// feeds the other through a generated `<net>#slice` block.
    pub fn connect_slice(
        &mut self,
        a: SignalId,
        a_range: (usize, usize),
        b: SignalId,
        b_range: (usize, usize),
    ) -> Result<()> {
        let (wa, wb) = (self.try_signal(a)?.width, self.try_signal(b)?.width);
        value::check_range(a_range.0, a_range.1, wa)?;
        value::check_range(b_range.0, b_range.1, wb)?;
        let (la, lb) = (a_range.1 - a_range.0, b_range.1 - b_range.0);
        if la != lb {
            return Err(SimError::Width(format!(
                "cannot connect `{}[{}:{}]` ({} bits) to `{}[{}:{}]` ({} bits)",
                self.path(a),
                a_range.0,
                a_range.1,
                la,
                self.path(b),
                b_range.0,
                b_range.1,
                lb
            )));
        }
        self.connections.push(Connection::Slice { a, a_range, b, b_range });
        Ok(())
    }

    /// Tie a signal to a constant.
    pub fn connect_const(&mut self, port: SignalId, value: u64) -> Result<()> {
        let width = self.try_signal(port)?.width;
        if value & !mask(width) != 0 {
            return Err(SimError::Width(format!(
                "constant {:#x} does not fit `{}` ({} bits)",
                value,
                self.path(port),
                width
            )));
        }
        self.connections.push(Connection::Const(port, value));
        Ok(())
    }

    /// Read expression for a declared signal.
    pub fn sig(&self, id: SignalId) -> Expr {
        Expr::Signal { id, width: self.signals[id.0].width }
    }

    pub fn signal(&self, id: SignalId) -> &SignalDecl {
        &self.signals[id.0]
    }

    /// Like [`Design::signal`], but an id from another design is an error.
    pub fn try_signal(&self, id: SignalId) -> Result<&SignalDecl> {
        self.signals
            .get(id.0)
            .ok_or_else(|| SimError::UnknownSignal(format!("#{}", id.0)))
    }

    pub fn model(&self, id: ModelId) -> &Model {
        &self.models[id.0]
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    pub fn lookup(&self, model: ModelId, name: &str) -> Option<SignalId> {
        self.names.get(&(model, name.to_string())).copied()
    }

    pub fn child(&self, parent: ModelId, name: &str) -> Option<ModelId> {
        self.models[parent.0]
            .children
            .iter()
            .copied()
            .find(|c| self.models[c.0].name == name)
    }

    /// Resolve a dotted path relative to `model` (`lane0.req_val`).
    pub fn resolve(&self, model: ModelId, path: &str) -> Result<SignalId> {
        let mut current = model;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                return self
                    .lookup(current, part)
                    .ok_or_else(|| SimError::UnknownSignal(path.to_string()));
            }
            current = self
                .child(current, part)
                .ok_or_else(|| SimError::UnknownSignal(path.to_string()))?;
        }
        Err(SimError::UnknownSignal(path.to_string()))
    }

    /// Dotted path of a model, empty for the root.
    pub fn model_path(&self, id: ModelId) -> String {
        let mut names = Vec::new();
        let mut current = id;
        while let Some(parent) = self.models[current.0].parent {
            names.push(self.models[current.0].name.as_str());
            current = parent;
        }
        names.reverse();
        names.join(".")
    }

    fn child_path(&self, model: ModelId, name: &str) -> String {
        let prefix = self.model_path(model);
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", prefix, name)
        }
    }

    pub fn path(&self, id: SignalId) -> String {
        let decl = &self.signals[id.0];
        self.child_path(decl.model, &decl.name)
    }

    pub fn is_root_port(&self, id: SignalId) -> bool {
        let decl = &self.signals[id.0];
        decl.model == self.root() && decl.direction != Direction::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let mut d = Design::new("top");
        let root = d.root();
        let lane = d.add_model(root, "lane0").unwrap();
        let inner = d.add_model(lane, "acc").unwrap();
        let a = d.input(root, "a", 8).unwrap();
        let b = d.output(lane, "req_val", 1).unwrap();
        let c = d.reg(inner, "q", 4, 3).unwrap();
        assert_eq!(d.path(a), "a");
        assert_eq!(d.path(b), "lane0.req_val");
        assert_eq!(d.path(c), "lane0.acc.q");
        assert_eq!(d.resolve(root, "lane0.acc.q").unwrap(), c);
        assert_eq!(d.resolve(lane, "req_val").unwrap(), b);
        assert!(matches!(d.resolve(root, "lane1.q"), Err(SimError::UnknownSignal(_))));
        assert!(d.is_root_port(a));
        assert!(!d.is_root_port(b));
    }

    #[test]
    fn test_declaration_checks() {
        let mut d = Design::new("top");
        let root = d.root();
        assert!(matches!(d.input(root, "x", 0), Err(SimError::Width(_))));
        assert!(matches!(d.reg(root, "r", 2, 4), Err(SimError::Width(_))));
        let x = d.input(root, "x", 4).unwrap();
        assert!(matches!(d.wire(root, "x", 4), Err(SimError::DuplicateName(_))));
        let y = d.output(root, "y", 5).unwrap();
        assert!(matches!(d.connect(x, y), Err(SimError::Width(_))));
        assert!(matches!(d.connect_const(x, 16), Err(SimError::Width(_))));
        assert!(d.connect_const(x, 15).is_ok());
        d.add_model(root, "m").unwrap();
        assert!(matches!(d.add_model(root, "m"), Err(SimError::DuplicateName(_))));
    }

    #[test]
    fn test_slice_connection_checks() {
        let mut d = Design::new("top");
        let root = d.root();
        let x = d.input(root, "x", 8).unwrap();
        let y = d.output(root, "y", 4).unwrap();
        assert!(d.connect_slice(x, (4, 8), y, (0, 4)).is_ok());
        assert!(matches!(d.connect_slice(x, (0, 3), y, (0, 4)), Err(SimError::Width(_))));
        assert!(matches!(d.connect_slice(x, (6, 10), y, (0, 4)), Err(SimError::Range { .. })));
        assert!(matches!(d.connect_slice(x, (2, 2), y, (0, 0)), Err(SimError::Range { .. })));
        assert_eq!(d.connections.len(), 1);
    }

    #[test]
    fn test_foreign_signal_ids() {
        let mut other = Design::new("other");
        let oroot = other.root();
        other.input(oroot, "a", 4).unwrap();
        let foreign = other.input(oroot, "b", 4).unwrap();

        let mut d = Design::new("top");
        let root = d.root();
        let x = d.input(root, "x", 4).unwrap();
        let unknown = SimError::UnknownSignal("#1".to_string());
        assert_eq!(d.connect(x, foreign), Err(unknown.clone()));
        assert_eq!(d.connect(foreign, x), Err(unknown.clone()));
        assert_eq!(d.connect_const(foreign, 1), Err(unknown));
        assert!(d.try_signal(x).is_ok());
    }
}
