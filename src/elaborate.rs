//! Elaboration: collapse connected signals into nets and check drivers.
//!
//! After this pass every `SignalId` inside a [`Netlist`] block indexes
//! [`Netlist::nets`], not the declaration table of the [`Design`].

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::error::{Result, SimError};
use crate::ir::{Assign, Expr};
use crate::model::{BlockDef, BlockKind, Connection, Design, Direction, SignalId};
use crate::value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Undriven,
    External,
    Comb(usize),
    Clocked(usize),
}

#[derive(Debug, Clone)]
pub struct Net {
    pub name: String,
    pub width: usize,
    pub init: u64,
    pub driver: Driver,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub assigns: Vec<Assign>,
    /// Sorted, deduplicated.
    pub reads: Vec<SignalId>,
    /// Sorted, deduplicated.
    pub writes: Vec<SignalId>,
}

#[derive(Debug, Clone)]
pub struct Netlist {
    pub nets: Vec<Net>,
    pub comb: Vec<Block>,
    pub clocked: Vec<Block>,
    paths: HashMap<String, usize>,
    ports: Vec<String>,
    signal_names: Vec<String>,
}

impl Netlist {
    pub fn net(&self, path: &str) -> Result<usize> {
        self.paths
            .get(path)
            .copied()
            .ok_or_else(|| SimError::UnknownSignal(path.to_string()))
    }

    /// Net index for an external write; internally driven nets are refused.
    pub fn writable(&self, path: &str) -> Result<usize> {
        let net = self.net(path)?;
        match self.nets[net].driver {
            Driver::External | Driver::Undriven => Ok(net),
            driver => Err(SimError::MultiDriver {
                signal: path.to_string(),
                drivers: vec![self.describe(driver), "external write".to_string()],
            }),
        }
    }

    pub fn describe(&self, driver: Driver) -> String {
        describe(driver, &self.comb, &self.clocked)
    }

    /// Root ports in declaration order.
    pub fn port_names(&self) -> &[String] {
        &self.ports
    }

    /// Every declared signal path, aliases included.
    pub fn signal_names(&self) -> &[String] {
        &self.signal_names
    }

    pub fn width(&self, net: usize) -> usize {
        self.nets[net].width
    }
}

fn describe(driver: Driver, comb: &[Block], clocked: &[Block]) -> String {
    match driver {
        Driver::Undriven => "nothing".to_string(),
        Driver::External => "external input".to_string(),
        Driver::Comb(b) => format!("combinational block `{}`", comb[b].name),
        Driver::Clocked(b) => format!("clocked block `{}`", clocked[b].name),
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// The smaller index always becomes the representative.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra < rb {
            self.parent[rb] = ra;
        } else if rb < ra {
            self.parent[ra] = rb;
        }
    }
}

fn in_block(name: &str, e: SimError) -> SimError {
    match e {
        SimError::Width(msg) => SimError::Width(format!("block `{}`: {}", name, msg)),
        other => other,
    }
}

fn check_block(design: &Design, block: &BlockDef) -> Result<()> {
    for assign in &block.assigns {
        let decl = design.try_signal(assign.target.signal)?;
        let mut foreign = None;
        assign.expr.for_each_signal(&mut |id| {
            if foreign.is_none() && design.try_signal(id).is_err() {
                foreign = Some(id);
            }
        });
        if let Some(id) = foreign {
            return Err(SimError::UnknownSignal(format!("#{}", id.0)));
        }
        if let Some((lo, hi)) = assign.target.range {
            value::check_range(lo, hi, decl.width)?;
        }
        assign.expr.validate().map_err(|e| in_block(&block.name, e))?;
        let expected = assign.target.width(decl.width);
        if assign.expr.width() != expected {
            return Err(SimError::Width(format!(
                "block `{}`: {}-bit value assigned to {} bits of `{}`",
                block.name,
                assign.expr.width(),
                expected,
                design.path(assign.target.signal)
            )));
        }
    }
    Ok(())
}

fn rewrite(name: String, assigns: &[Assign], net_of: &[usize]) -> Block {
    let mut assigns = assigns.to_vec();
    let mut reads = Vec::new();
    let mut writes = Vec::new();
    for assign in &mut assigns {
        assign.target.signal = SignalId(net_of[assign.target.signal.0]);
        assign.expr.map_signals(&mut |id| SignalId(net_of[id.0]));
        assign.expr.for_each_signal(&mut |id| reads.push(id));
        writes.push(assign.target.signal);
    }
    reads.sort();
    reads.dedup();
    writes.sort();
    writes.dedup();
    Block { name, assigns, reads, writes }
}

/// One slice link, routed: bits of `src` feed bits of `dst`.
#[derive(Clone, Copy)]
struct SliceRoute {
    src: SignalId,
    src_range: (usize, usize),
    dst: SignalId,
    dst_range: (usize, usize),
}

/// Route every slice connection away from its driven side and lower the
/// links landing on each net into a single `<net>#slice` block.
///
/// A link whose sides are both undriven waits until another link feeds one
/// of them; if nothing ever does, it runs from `a` to `b`.
fn lower_slices(
    design: &Design,
    net_of: &[usize],
    nets: &[Net],
    comb: &mut Vec<Block>,
    clocked: &[Block],
    drivers: &mut [Vec<Driver>],
) -> Result<()> {
    let links: Vec<SliceRoute> = design
        .connections
        .iter()
        .filter_map(|c| match *c {
            Connection::Slice { a, a_range, b, b_range } => {
                Some(SliceRoute { src: a, src_range: a_range, dst: b, dst_range: b_range })
            }
            _ => None,
        })
        .collect();
    if links.is_empty() {
        return Ok(());
    }

    let driven: Vec<bool> = drivers.iter().map(|d| !d.is_empty()).collect();
    let mut fed = vec![false; nets.len()];
    let mut routes: Vec<Option<SliceRoute>> = vec![None; links.len()];
    let mut left = links.len();
    while left > 0 {
        let mut progress = false;
        for (k, link) in links.iter().enumerate() {
            if routes[k].is_some() {
                continue;
            }
            let (na, nb) = (net_of[link.src.0], net_of[link.dst.0]);
            let forward = match (driven[na], driven[nb]) {
                (true, true) => {
                    return Err(SimError::MultiDriver {
                        signal: nets[nb].name.clone(),
                        drivers: vec![
                            describe(drivers[nb][0], comb, clocked),
                            format!(
                                "slice connection from `{}[{}:{}]`",
                                design.path(link.src),
                                link.src_range.0,
                                link.src_range.1
                            ),
                        ],
                    });
                }
                (true, false) => Some(true),
                (false, true) => Some(false),
                (false, false) if fed[na] && !fed[nb] => Some(true),
                (false, false) if fed[nb] && !fed[na] => Some(false),
                _ => None,
            };
            if let Some(forward) = forward {
                let route = if forward {
                    *link
                } else {
                    SliceRoute {
                        src: link.dst,
                        src_range: link.dst_range,
                        dst: link.src,
                        dst_range: link.src_range,
                    }
                };
                fed[net_of[route.dst.0]] = true;
                routes[k] = Some(route);
                left -= 1;
                progress = true;
            }
        }
        if !progress {
            if let Some(k) = routes.iter().position(Option::is_none) {
                fed[net_of[links[k].dst.0]] = true;
                routes[k] = Some(links[k]);
                left -= 1;
            }
        }
    }

    let mut by_net: BTreeMap<usize, Vec<Assign>> = BTreeMap::new();
    for route in routes.into_iter().flatten() {
        let (lo, hi) = route.src_range;
        let value = design.sig(route.src).slice(lo, hi);
        let assign = Assign::slice(route.dst, route.dst_range.0, route.dst_range.1, value);
        by_net.entry(net_of[route.dst.0]).or_default().push(assign);
    }
    for (net, assigns) in by_net {
        let name = format!("{}#slice", nets[net].name);
        drivers[net].push(Driver::Comb(comb.len()));
        comb.push(rewrite(name, &assigns, net_of));
    }
    Ok(())
}

pub fn elaborate(design: &Design) -> Result<Netlist> {
    for block in &design.blocks {
        check_block(design, block)?;
    }

    let n = design.signal_count();
    let mut uf = UnionFind::new(n);
    for connection in &design.connections {
        if let Connection::Alias(a, b) = connection {
            uf.union(a.0, b.0);
        }
    }

    let mut net_of = vec![0usize; n];
    let mut nets: Vec<Net> = Vec::new();
    let mut named = Vec::new();
    for i in 0..n {
        let rep = uf.find(i);
        if rep == i {
            let decl = design.signal(SignalId(i));
            net_of[i] = nets.len();
            nets.push(Net {
                name: design.path(SignalId(i)),
                width: decl.width,
                init: 0,
                driver: Driver::Undriven,
            });
            named.push(false);
        } else {
            net_of[i] = net_of[rep];
        }
    }
    for i in 0..n {
        let id = SignalId(i);
        let net = net_of[i];
        if nets[net].init == 0 {
            nets[net].init = design.signal(id).init;
        }
        if design.is_root_port(id) && !named[net] {
            nets[net].name = design.path(id);
            named[net] = true;
        }
    }

    let mut comb = Vec::new();
    let mut clocked = Vec::new();
    for block in &design.blocks {
        let rewritten = rewrite(block.name.clone(), &block.assigns, &net_of);
        match block.kind {
            BlockKind::Combinational => comb.push(rewritten),
            BlockKind::Clocked => clocked.push(rewritten),
        }
    }
    for connection in &design.connections {
        if let Connection::Const(port, value) = *connection {
            let expr = Expr::lit(value, design.signal(port).width);
            let name = format!("{}#const", design.path(port));
            comb.push(rewrite(name, &[Assign::new(port, expr)], &net_of));
        }
    }

    let mut drivers: Vec<Vec<Driver>> = vec![Vec::new(); nets.len()];
    let root = design.root();
    for i in 0..n {
        let decl = design.signal(SignalId(i));
        let net = net_of[i];
        if decl.model == root && decl.direction == Direction::In && !drivers[net].contains(&Driver::External) {
            drivers[net].push(Driver::External);
        }
    }
    for (b, block) in comb.iter().enumerate() {
        for w in &block.writes {
            drivers[w.0].push(Driver::Comb(b));
        }
    }
    for (b, block) in clocked.iter().enumerate() {
        for w in &block.writes {
            drivers[w.0].push(Driver::Clocked(b));
        }
    }

    lower_slices(design, &net_of, &nets, &mut comb, &clocked, &mut drivers)?;

    let mut netlist = Netlist {
        nets,
        comb,
        clocked,
        paths: HashMap::new(),
        ports: Vec::new(),
        signal_names: Vec::new(),
    };
    for (net, found) in drivers.iter().enumerate() {
        if found.len() > 1 {
            return Err(SimError::MultiDriver {
                signal: netlist.nets[net].name.clone(),
                drivers: found.iter().map(|d| netlist.describe(*d)).collect(),
            });
        }
        netlist.nets[net].driver = found.first().copied().unwrap_or(Driver::Undriven);
    }

    for i in 0..n {
        let id = SignalId(i);
        let decl = design.signal(id);
        let path = design.path(id);
        if decl.direction == Direction::In
            && decl.model != root
            && netlist.nets[net_of[i]].driver == Driver::Undriven
        {
            return Err(SimError::UnconnectedInput { port: path });
        }
        if design.is_root_port(id) {
            netlist.ports.push(path.clone());
        }
        netlist.paths.insert(path.clone(), net_of[i]);
        netlist.signal_names.push(path);
    }

    debug!(
        "elaborated {} signals into {} nets ({} combinational, {} clocked blocks)",
        n,
        netlist.nets.len(),
        netlist.comb.len(),
        netlist.clocked.len()
    );
    Ok(netlist)
}
