//! Matrix-vector multiply lane and lane manager
//!
//! A lane computes one row's dot product: it reads matrix and vector words
//! alternately over a memory request/response channel, accumulates the
//! products, writes the result, then holds `done` until its next start pulse.
//! Lane `i` works on row `i` (`matrix_base + i * size * 4`) and writes to
//! `dest_base + i * 4`.
//!
//! The manager decodes configuration messages into broadcast registers and
//! ANDs every lane's `done` into one aggregate flag.

use crate::error::Result;
use crate::extensions::memory::{self, TYPE_READ, TYPE_WRITE};
use crate::extensions::source::MSG_WIDTH;
use crate::ir::{Assign, Expr};
use crate::model::{Design, Direction, ModelId};

pub const ADDR_WIDTH: usize = 32;
pub const DATA_WIDTH: usize = 32;
const STATE_WIDTH: usize = 3;

const IDLE: u64 = 0;
const RD_M: u64 = 1;
const WT_M: u64 = 2;
const RD_V: u64 = 3;
const WT_V: u64 = 4;
const WR: u64 = 5;
const WT_W: u64 = 6;

fn word(value: u64) -> Expr {
    Expr::lit(value, DATA_WIDTH)
}

fn bit(value: u64) -> Expr {
    Expr::lit(value, 1)
}

/// Build a lane child model under `parent`.
pub fn lane(d: &mut Design, parent: ModelId, name: &str, lane_id: u64) -> Result<ModelId> {
    let m = d.add_model(parent, name)?;

    let matrix_base = d.input(m, "matrix_base", ADDR_WIDTH)?;
    let vector_base = d.input(m, "vector_base", ADDR_WIDTH)?;
    let dest_base = d.input(m, "dest_base", ADDR_WIDTH)?;
    let size = d.input(m, "size", DATA_WIDTH)?;
    let go = d.input(m, "go", 1)?;
    let done = d.reg_output(m, "done", 1, 0)?;

    let req_val = d.output(m, "req_val", 1)?;
    let req_rdy = d.input(m, "req_rdy", 1)?;
    let req_type = d.output(m, "req_type", 1)?;
    let req_addr = d.output(m, "req_addr", ADDR_WIDTH)?;
    let req_data = d.output(m, "req_data", DATA_WIDTH)?;
    let resp_val = d.input(m, "resp_val", 1)?;
    let resp_rdy = d.output(m, "resp_rdy", 1)?;
    let resp_data = d.input(m, "resp_data", DATA_WIDTH)?;

    let state = d.reg(m, "state", STATE_WIDTH, IDLE)?;
    let count = d.reg(m, "count", DATA_WIDTH, 0)?;
    let m_ptr = d.reg(m, "m_ptr", ADDR_WIDTH, 0)?;
    let v_ptr = d.reg(m, "v_ptr", ADDR_WIDTH, 0)?;
    let d_addr = d.reg(m, "d_addr", ADDR_WIDTH, 0)?;
    let m_val = d.reg(m, "m_val", DATA_WIDTH, 0)?;
    let accum = d.reg(m, "accum", DATA_WIDTH, 0)?;

    let launch = d.wire(m, "launch", 1)?;
    let req_fire = d.wire(m, "req_fire", 1)?;
    let resp_fire = d.wire(m, "resp_fire", 1)?;

    let st = d.sig(state);
    let is = |s: u64| st.clone().cmp_eq(Expr::lit(s, STATE_WIDTH));

    d.comb(
        m,
        "outputs",
        vec![
            Assign::new(req_val, is(RD_M) | is(RD_V) | is(WR)),
            Assign::new(req_type, Expr::mux(is(WR), bit(TYPE_WRITE), bit(TYPE_READ))),
            Assign::new(
                req_addr,
                Expr::mux(is(RD_M), d.sig(m_ptr), Expr::mux(is(RD_V), d.sig(v_ptr), d.sig(d_addr))),
            ),
            Assign::new(req_data, d.sig(accum)),
            Assign::new(resp_rdy, is(WT_M) | is(WT_V) | is(WT_W)),
        ],
    );
    d.comb(
        m,
        "handshake",
        vec![
            Assign::new(launch, d.sig(go) & is(IDLE)),
            Assign::new(req_fire, d.sig(req_val) & d.sig(req_rdy)),
            Assign::new(resp_fire, d.sig(resp_val) & d.sig(resp_rdy)),
        ],
    );

    let start = d.sig(launch);
    let on_req = |s: u64| is(s) & d.sig(req_fire);
    let on_resp = |s: u64| is(s) & d.sig(resp_fire);
    let last = d.sig(count).cmp_eq(word(1));

    let first = Expr::mux(
        d.sig(size).cmp_eq(word(0)),
        Expr::lit(WR, STATE_WIDTH),
        Expr::lit(RD_M, STATE_WIDTH),
    );
    let after_v = Expr::mux(last, Expr::lit(WR, STATE_WIDTH), Expr::lit(RD_M, STATE_WIDTH));
    let transitions = [
        (on_req(RD_M), Expr::lit(WT_M, STATE_WIDTH)),
        (on_resp(WT_M), Expr::lit(RD_V, STATE_WIDTH)),
        (on_req(RD_V), Expr::lit(WT_V, STATE_WIDTH)),
        (on_resp(WT_V), after_v),
        (on_req(WR), Expr::lit(WT_W, STATE_WIDTH)),
        (on_resp(WT_W), Expr::lit(IDLE, STATE_WIDTH)),
    ];
    let next_state = transitions
        .into_iter()
        .rev()
        .fold(st.clone(), |rest, (cond, target)| Expr::mux(cond, target, rest));
    let next_state = Expr::mux(start.clone(), first, next_state);

    let row_offset = d.sig(size) * word(lane_id * 4);
    let product = d.sig(m_val) * d.sig(resp_data);

    let fsm = vec![
        Assign::new(state, next_state),
        Assign::new(
            m_ptr,
            Expr::mux(
                start.clone(),
                d.sig(matrix_base) + row_offset,
                Expr::mux(on_req(RD_M), d.sig(m_ptr) + word(4), d.sig(m_ptr)),
            ),
        ),
        Assign::new(
            v_ptr,
            Expr::mux(
                start.clone(),
                d.sig(vector_base),
                Expr::mux(on_req(RD_V), d.sig(v_ptr) + word(4), d.sig(v_ptr)),
            ),
        ),
        Assign::new(
            d_addr,
            Expr::mux(start.clone(), d.sig(dest_base) + word(lane_id * 4), d.sig(d_addr)),
        ),
        Assign::new(
            count,
            Expr::mux(
                start.clone(),
                d.sig(size),
                Expr::mux(on_resp(WT_V), d.sig(count) - word(1), d.sig(count)),
            ),
        ),
        Assign::new(m_val, Expr::mux(on_resp(WT_M), d.sig(resp_data), d.sig(m_val))),
        Assign::new(
            accum,
            Expr::mux(
                start.clone(),
                word(0),
                Expr::mux(on_resp(WT_V), d.sig(accum) + product, d.sig(accum)),
            ),
        ),
        Assign::new(
            done,
            Expr::mux(start, bit(0), Expr::mux(on_resp(WT_W), bit(1), d.sig(done))),
        ),
    ];
    d.clocked(m, "fsm", fsm);
    Ok(m)
}

/// Build a manager child model driving `nlanes` lanes.
///
/// Ports: `cfg_val`, `cfg_rdy`, `cfg_msg` on the configuration side;
/// `size`, `matrix_base`, `vector_base`, `dest_base`, `go` broadcast to the
/// lanes; `done_<i>` from each lane and `all_done` out.
pub fn manager(d: &mut Design, parent: ModelId, name: &str, nlanes: usize) -> Result<ModelId> {
    let m = d.add_model(parent, name)?;

    let cfg_val = d.input(m, "cfg_val", 1)?;
    let cfg_rdy = d.output(m, "cfg_rdy", 1)?;
    let cfg_msg = d.input(m, "cfg_msg", MSG_WIDTH)?;
    d.connect_const(cfg_rdy, 1)?;

    let size = d.reg_output(m, "size", DATA_WIDTH, 0)?;
    let matrix_base = d.reg_output(m, "matrix_base", ADDR_WIDTH, 0)?;
    let vector_base = d.reg_output(m, "vector_base", ADDR_WIDTH, 0)?;
    let dest_base = d.reg_output(m, "dest_base", ADDR_WIDTH, 0)?;
    let go = d.reg_output(m, "go", 1, 0)?;

    let mut dones = Vec::with_capacity(nlanes);
    for i in 0..nlanes {
        dones.push(d.input(m, &format!("done_{}", i), 1)?);
    }
    let all_done = d.output(m, "all_done", 1)?;

    let fire = d.sig(cfg_val) & d.sig(cfg_rdy);
    let selector = d.sig(cfg_msg).slice(32, MSG_WIDTH);
    let value = d.sig(cfg_msg).slice(0, 32);
    let select = |sel: u64| fire.clone() & selector.clone().cmp_eq(Expr::lit(sel, 3));
    let latch = |reg, sel| Assign::new(reg, Expr::mux(select(sel), value.clone(), d.sig(reg)));

    let start = select(0) & value.clone().cmp_ne(word(0));
    let config = vec![
        latch(size, 1),
        latch(matrix_base, 2),
        latch(vector_base, 3),
        latch(dest_base, 4),
        Assign::new(go, start),
    ];
    d.clocked(m, "config", config);

    let aggregate = dones
        .iter()
        .map(|id| d.sig(*id))
        .reduce(|acc, done| acc & done)
        .unwrap_or_else(|| bit(1));
    d.comb(m, "reduce", vec![Assign::new(all_done, aggregate)]);
    Ok(m)
}

/// Declare root memory ports `<prefix>*` and connect them to a requester child.
fn memory_ports(d: &mut Design, requester: ModelId, prefix: &str) -> Result<()> {
    let root = d.root();
    for (name, width, dir) in memory::PORTS {
        let port_name = format!("{}{}", prefix, name);
        let outer = match dir {
            Direction::In => d.input(root, &port_name, width)?,
            _ => d.output(root, &port_name, width)?,
        };
        let inner = d.resolve(requester, name)?;
        d.connect(outer, inner)?;
    }
    Ok(())
}

/// A single lane with its control surface and memory channel `mem0_*` on
/// root ports.
pub struct LaneHarness;

impl LaneHarness {
    pub fn build(lane_id: u64) -> Result<Design> {
        let mut d = Design::new("lane_harness");
        let root = d.root();
        let l = lane(&mut d, root, "lane", lane_id)?;
        for port in ["matrix_base", "vector_base", "dest_base", "size"] {
            let outer = d.input(root, port, DATA_WIDTH)?;
            let inner = d.resolve(l, port)?;
            d.connect(outer, inner)?;
        }
        let go = d.input(root, "go", 1)?;
        let lane_go = d.resolve(l, "go")?;
        d.connect(go, lane_go)?;
        let done = d.output(root, "done", 1)?;
        let lane_done = d.resolve(l, "done")?;
        d.connect(done, lane_done)?;
        memory_ports(&mut d, l, "mem0_")?;
        Ok(d)
    }
}

/// A manager fed from root `cfg_*` ports, `nlanes` lanes each on a root
/// memory channel `mem<i>_*`, and the aggregate `done`.
pub struct ManagedHarness;

impl ManagedHarness {
    pub fn build(nlanes: usize) -> Result<Design> {
        let mut d = Design::new("managed_harness");
        let root = d.root();
        let mgr = manager(&mut d, root, "mgr", nlanes)?;

        for (port, width, dir) in [
            ("cfg_val", 1, Direction::In),
            ("cfg_rdy", 1, Direction::Out),
            ("cfg_msg", MSG_WIDTH, Direction::In),
        ] {
            let outer = match dir {
                Direction::In => d.input(root, port, width)?,
                _ => d.output(root, port, width)?,
            };
            let inner = d.resolve(mgr, port)?;
            d.connect(outer, inner)?;
        }
        let done = d.output(root, "done", 1)?;
        let all_done = d.resolve(mgr, "all_done")?;
        d.connect(done, all_done)?;

        for i in 0..nlanes {
            let l = lane(&mut d, root, &format!("lane{}", i), i as u64)?;
            for port in ["size", "matrix_base", "vector_base", "dest_base", "go"] {
                let from = d.resolve(mgr, port)?;
                let to = d.resolve(l, port)?;
                d.connect(from, to)?;
            }
            let lane_done = d.resolve(l, "done")?;
            let mgr_done = d.resolve(mgr, &format!("done_{}", i))?;
            d.connect(lane_done, mgr_done)?;
            memory_ports(&mut d, l, &format!("mem{}_", i))?;
        }
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::core::Simulator;
    use crate::extensions::source::{ConfigMsg, Selector};

    fn managed(nlanes: usize) -> Simulator {
        let mut sim = Simulator::new(ManagedHarness::build(nlanes).unwrap(), SimConfig::default());
        sim.elaborate().unwrap();
        sim.reset().unwrap();
        sim
    }

    #[test]
    fn test_lane_idle_after_reset() {
        let mut sim = Simulator::new(LaneHarness::build(0).unwrap(), SimConfig::default());
        sim.elaborate().unwrap();
        sim.reset().unwrap();
        assert_eq!(sim.peek("done").unwrap(), 0);
        assert_eq!(sim.peek("mem0_req_val").unwrap(), 0);
        assert_eq!(sim.peek("mem0_resp_rdy").unwrap(), 0);
        assert_eq!(sim.peek("lane.state").unwrap(), IDLE);
    }

    #[test]
    fn test_lane_issues_first_read_after_start() {
        let mut sim = Simulator::new(LaneHarness::build(1).unwrap(), SimConfig::default());
        sim.elaborate().unwrap();
        sim.reset().unwrap();
        sim.write("matrix_base", 0).unwrap();
        sim.write("size", 3).unwrap();
        sim.write("go", 1).unwrap();
        sim.cycle().unwrap();
        assert_eq!(sim.peek("mem0_req_val").unwrap(), 1);
        assert_eq!(sim.peek("mem0_req_type").unwrap(), TYPE_READ);
        assert_eq!(sim.peek("mem0_req_addr").unwrap(), 12);
    }

    #[test]
    fn test_manager_latches_config() {
        let mut sim = managed(2);
        assert_eq!(sim.peek("cfg_rdy").unwrap(), 1);
        sim.write("cfg_val", 1).unwrap();
        for msg in [ConfigMsg::new(Selector::Size, 3), ConfigMsg::new(Selector::DestBase, 160)] {
            sim.write("cfg_msg", msg.encode()).unwrap();
            sim.cycle().unwrap();
        }
        assert_eq!(sim.peek("mgr.size").unwrap(), 3);
        assert_eq!(sim.peek("lane1.dest_base").unwrap(), 160);
        assert_eq!(sim.peek("mgr.go").unwrap(), 0);

        sim.write("cfg_msg", ConfigMsg::new(Selector::Go, 1).encode()).unwrap();
        sim.cycle().unwrap();
        assert_eq!(sim.peek("lane0.go").unwrap(), 1);
        sim.write("cfg_val", 0).unwrap();
        sim.cycle().unwrap();
        assert_eq!(sim.peek("lane0.go").unwrap(), 0);
    }

    #[test]
    fn test_zero_go_never_pulses() {
        let mut sim = managed(1);
        sim.write("cfg_val", 1).unwrap();
        sim.write("cfg_msg", ConfigMsg::new(Selector::Go, 0).encode()).unwrap();
        for _ in 0..4 {
            sim.cycle().unwrap();
            assert_eq!(sim.peek("mgr.go").unwrap(), 0);
            assert_eq!(sim.peek("lane0.state").unwrap(), IDLE);
        }
    }
}
