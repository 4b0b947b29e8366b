//! JSON design descriptions.
//!
//! The format follows the RHDL `ModuleIR` layout: ports, nets, regs,
//! continuous assigns and processes, extended with child instances and
//! connections. Names inside a module are local; `child.port` reaches into an
//! instance.

use serde::Deserialize;

use crate::error::{Result, SimError};
use crate::ir::{Assign, BinaryOp, Expr, UnaryOp};
use crate::model::{Design, ModelId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortDef {
    pub name: String,
    pub direction: PortDirection,
    pub width: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetDef {
    pub name: String,
    pub width: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegDef {
    pub name: String,
    pub width: usize,
    #[serde(default)]
    pub reset_value: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExprDef {
    Signal { name: String, width: usize },
    Literal { value: u64, width: usize },
    UnaryOp { op: String, operand: Box<ExprDef>, width: usize },
    BinaryOp { op: String, left: Box<ExprDef>, right: Box<ExprDef>, width: usize },
    Mux { condition: Box<ExprDef>, when_true: Box<ExprDef>, when_false: Box<ExprDef>, width: usize },
    Slice { base: Box<ExprDef>, low: usize, high: usize, width: usize },
    Concat { parts: Vec<ExprDef>, width: usize },
    Resize { expr: Box<ExprDef>, width: usize },
    SignExtend { expr: Box<ExprDef>, width: usize },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignDef {
    pub target: String,
    /// Bits `[low, high)` of the target; whole signal when absent.
    #[serde(default)]
    pub range: Option<(usize, usize)>,
    pub expr: ExprDef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessDef {
    pub name: String,
    #[serde(default)]
    pub clocked: bool,
    pub statements: Vec<AssignDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceDef {
    pub name: String,
    pub module: ModuleIR,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConnectionDef {
    Slice { a: String, a_range: (usize, usize), b: String, b_range: (usize, usize) },
    Alias { a: String, b: String },
    Const { port: String, value: u64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleIR {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<PortDef>,
    #[serde(default)]
    pub nets: Vec<NetDef>,
    #[serde(default)]
    pub regs: Vec<RegDef>,
    #[serde(default)]
    pub assigns: Vec<AssignDef>,
    #[serde(default)]
    pub processes: Vec<ProcessDef>,
    #[serde(default)]
    pub instances: Vec<InstanceDef>,
    #[serde(default)]
    pub connections: Vec<ConnectionDef>,
}

fn unary_op(op: &str) -> Result<UnaryOp> {
    match op {
        "~" | "not" => Ok(UnaryOp::Not),
        "&" | "reduce_and" => Ok(UnaryOp::ReduceAnd),
        "|" | "reduce_or" => Ok(UnaryOp::ReduceOr),
        "^" | "reduce_xor" => Ok(UnaryOp::ReduceXor),
        other => Err(SimError::Parse(format!("unknown unary operator `{}`", other))),
    }
}

fn binary_op(op: &str) -> Result<BinaryOp> {
    let op = match op {
        "&" => BinaryOp::And,
        "|" => BinaryOp::Or,
        "^" => BinaryOp::Xor,
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Rem,
        "<<" => BinaryOp::Shl,
        ">>" => BinaryOp::Shr,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        ">" => BinaryOp::Gt,
        "<=" => BinaryOp::Le,
        ">=" => BinaryOp::Ge,
        other => return Err(SimError::Parse(format!("unknown binary operator `{}`", other))),
    };
    Ok(op)
}

struct Resolver<'a> {
    design: &'a Design,
    model: ModelId,
}

impl Resolver<'_> {
    fn expr(&self, def: &ExprDef) -> Result<Expr> {
        let expr = match def {
            ExprDef::Signal { name, width } => {
                let id = self.design.resolve(self.model, name)?;
                let declared = self.design.signal(id).width;
                if declared != *width {
                    return Err(SimError::Width(format!(
                        "`{}` is {} bits wide but read as {}",
                        name, declared, width
                    )));
                }
                Expr::Signal { id, width: declared }
            }
            ExprDef::Literal { value, width } => Expr::Literal { value: *value, width: *width },
            ExprDef::UnaryOp { op, operand, width } => Expr::Unary {
                op: unary_op(op)?,
                operand: Box::new(self.expr(operand)?),
                width: *width,
            },
            ExprDef::BinaryOp { op, left, right, width } => Expr::Binary {
                op: binary_op(op)?,
                left: Box::new(self.expr(left)?),
                right: Box::new(self.expr(right)?),
                width: *width,
            },
            ExprDef::Mux { condition, when_true, when_false, width } => Expr::Mux {
                cond: Box::new(self.expr(condition)?),
                when_true: Box::new(self.expr(when_true)?),
                when_false: Box::new(self.expr(when_false)?),
                width: *width,
            },
            ExprDef::Slice { base, low, high, width } => {
                if high.saturating_sub(*low) != *width {
                    return Err(SimError::Range { lo: *low, hi: *high, width: *width });
                }
                Expr::Slice { base: Box::new(self.expr(base)?), low: *low, width: *width }
            }
            ExprDef::Concat { parts, width } => Expr::Concat {
                parts: parts.iter().map(|p| self.expr(p)).collect::<Result<_>>()?,
                width: *width,
            },
            ExprDef::Resize { expr, width } => {
                Expr::Zext { expr: Box::new(self.expr(expr)?), width: *width }
            }
            ExprDef::SignExtend { expr, width } => {
                Expr::Sext { expr: Box::new(self.expr(expr)?), width: *width }
            }
        };
        Ok(expr)
    }

    fn assign(&self, def: &AssignDef) -> Result<Assign> {
        let target = self.design.resolve(self.model, &def.target)?;
        let expr = self.expr(&def.expr)?;
        Ok(match def.range {
            None => Assign::new(target, expr),
            Some((lo, hi)) => Assign::slice(target, lo, hi, expr),
        })
    }
}

fn declare(design: &mut Design, model: ModelId, ir: &ModuleIR) -> Result<()> {
    for port in &ir.ports {
        match port.direction {
            PortDirection::In => design.input(model, &port.name, port.width)?,
            PortDirection::Out => design.output(model, &port.name, port.width)?,
        };
    }
    for net in &ir.nets {
        design.wire(model, &net.name, net.width)?;
    }
    for reg in &ir.regs {
        design.reg(model, &reg.name, reg.width, reg.reset_value.unwrap_or(0))?;
    }
    for inst in &ir.instances {
        let child = design.add_model(model, &inst.name)?;
        declare(design, child, &inst.module)?;
    }
    Ok(())
}

/// Blocks and connections, once every signal in the tree exists.
fn populate(design: &mut Design, model: ModelId, ir: &ModuleIR) -> Result<()> {
    for inst in &ir.instances {
        let child = design
            .child(model, &inst.name)
            .ok_or_else(|| SimError::UnknownSignal(inst.name.clone()))?;
        populate(design, child, &inst.module)?;
    }

    let (assigns, processes) = {
        let resolver = Resolver { design: &*design, model };
        let assigns = ir
            .assigns
            .iter()
            .map(|a| resolver.assign(a))
            .collect::<Result<Vec<_>>>()?;
        let processes = ir
            .processes
            .iter()
            .map(|p| {
                let body = p.statements.iter().map(|s| resolver.assign(s)).collect::<Result<Vec<_>>>()?;
                Ok((p.name.as_str(), p.clocked, body))
            })
            .collect::<Result<Vec<_>>>()?;
        (assigns, processes)
    };
    for (i, assign) in assigns.into_iter().enumerate() {
        design.comb(model, &format!("assign_{}", i), vec![assign]);
    }
    for (name, clocked, body) in processes {
        if clocked {
            design.clocked(model, name, body);
        } else {
            design.comb(model, name, body);
        }
    }

    for conn in &ir.connections {
        match conn {
            ConnectionDef::Alias { a, b } => {
                let a = design.resolve(model, a)?;
                let b = design.resolve(model, b)?;
                design.connect(a, b)?;
            }
            ConnectionDef::Const { port, value } => {
                let port = design.resolve(model, port)?;
                design.connect_const(port, *value)?;
            }
            ConnectionDef::Slice { a, a_range, b, b_range } => {
                let a = design.resolve(model, a)?;
                let b = design.resolve(model, b)?;
                design.connect_slice(a, *a_range, b, *b_range)?;
            }
        }
    }
    Ok(())
}

impl Design {
    pub fn from_module(ir: &ModuleIR) -> Result<Design> {
        let mut design = Design::new(&ir.name);
        let root = design.root();
        declare(&mut design, root, ir)?;
        populate(&mut design, root, ir)?;
        Ok(design)
    }

    pub fn from_json(json: &str) -> Result<Design> {
        let mut deserializer = serde_json::Deserializer::from_str(json);
        deserializer.disable_recursion_limit();
        let ir = ModuleIR::deserialize(&mut deserializer)?;
        Design::from_module(&ir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::core::Simulator;

    const REGISTERED_ADDER: &str = r#"{
        "name": "top",
        "ports": [
            {"name": "a", "direction": "in", "width": 8},
            {"name": "y", "direction": "out", "width": 8}
        ],
        "regs": [{"name": "acc", "width": 8, "reset_value": 1}],
        "processes": [{
            "name": "accumulate",
            "clocked": true,
            "statements": [{
                "target": "acc",
                "expr": {"type": "binary_op", "op": "+",
                         "left": {"type": "signal", "name": "acc", "width": 8},
                         "right": {"type": "signal", "name": "a", "width": 8},
                         "width": 8}
            }]
        }],
        "instances": [{
            "name": "pt",
            "module": {
                "name": "pass",
                "ports": [
                    {"name": "in_", "direction": "in", "width": 8},
                    {"name": "out", "direction": "out", "width": 8}
                ],
                "assigns": [{"target": "out", "expr": {"type": "signal", "name": "in_", "width": 8}}]
            }
        }],
        "connections": [
            {"a": "acc", "b": "pt.in_"},
            {"a": "pt.out", "b": "y"}
        ]
    }"#;

    #[test]
    fn test_load_and_run() {
        let design = Design::from_json(REGISTERED_ADDER).unwrap();
        let mut sim = Simulator::new(design, SimConfig::default());
        sim.elaborate().unwrap();
        sim.reset().unwrap();
        assert_eq!(sim.peek("y").unwrap(), 1);
        sim.write("a", 2).unwrap();
        sim.cycle().unwrap();
        sim.cycle().unwrap();
        assert_eq!(sim.peek("y").unwrap(), 5);
        assert_eq!(sim.port_names(), vec!["a", "y"]);
    }

    #[test]
    fn test_unknown_names_rejected() {
        let json = r#"{"name": "top",
            "ports": [{"name": "y", "direction": "out", "width": 1}],
            "assigns": [{"target": "y", "expr": {"type": "signal", "name": "ghost", "width": 1}}]}"#;
        assert_eq!(
            Design::from_json(json).unwrap_err(),
            SimError::UnknownSignal("ghost".to_string())
        );

        let json = r#"{"name": "top",
            "ports": [{"name": "y", "direction": "out", "width": 1}],
            "assigns": [{"target": "y", "expr": {"type": "unary_op", "op": "!!",
                "operand": {"type": "literal", "value": 0, "width": 1}, "width": 1}}]}"#;
        assert!(matches!(Design::from_json(json), Err(SimError::Parse(_))));
        assert!(matches!(Design::from_json("{"), Err(SimError::Parse(_))));
    }

    #[test]
    fn test_slice_target_and_const() {
        let json = r#"{"name": "top",
            "ports": [{"name": "y", "direction": "out", "width": 8},
                      {"name": "k", "direction": "out", "width": 4}],
            "processes": [{"name": "fill", "statements": [
                {"target": "y", "expr": {"type": "literal", "value": 0, "width": 8}},
                {"target": "y", "range": [4, 8], "expr": {"type": "signal", "name": "k", "width": 4}}
            ]}],
            "connections": [{"port": "k", "value": 9}]}"#;
        let design = Design::from_json(json).unwrap();
        let mut sim = Simulator::new(design, SimConfig::default());
        sim.elaborate().unwrap();
        sim.reset().unwrap();
        assert_eq!(sim.peek("y").unwrap(), 0x90);
    }

    #[test]
    fn test_slice_connections() {
        let json = r#"{"name": "top",
            "ports": [{"name": "in_", "direction": "in", "width": 8},
                      {"name": "hi", "direction": "out", "width": 4},
                      {"name": "lo", "direction": "out", "width": 4}],
            "connections": [{"a": "hi", "a_range": [0, 4], "b": "in_", "b_range": [4, 8]},
                            {"a": "in_", "a_range": [0, 4], "b": "lo", "b_range": [0, 4]}]}"#;
        let design = Design::from_json(json).unwrap();
        let mut sim = Simulator::new(design, SimConfig::default());
        sim.elaborate().unwrap();
        sim.reset().unwrap();
        sim.write("in_", 0x5c).unwrap();
        sim.evaluate().unwrap();
        assert_eq!(sim.peek("hi").unwrap(), 0x5);
        assert_eq!(sim.peek("lo").unwrap(), 0xc);
    }
}
