//! Property tests: determinism, backend equivalence, write visibility and
//! the aggregate completion reduction.

mod common;

use cycle_sim::extensions::mvmult::manager;
use cycle_sim::{build, lockstep, Assign, Backend, Design, Expr, SimConfig, SimError, Simulate};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Designs
// ---------------------------------------------------------------------------

const INPUTS: [(&str, usize); 3] = [("a", 8), ("b", 8), ("op", 2)];

/// Small datapath touching every operator kind, with a slice-written history
/// register.
fn datapath() -> Design {
    let mut d = Design::new("datapath");
    let root = d.root();
    let a = d.input(root, "a", 8).unwrap();
    let b = d.input(root, "b", 8).unwrap();
    let op = d.input(root, "op", 2).unwrap();
    let t = d.wire(root, "t", 8).unwrap();
    let acc = d.reg(root, "acc", 8, 3).unwrap();
    let hist = d.reg_output(root, "hist", 16, 0).unwrap();
    let y = d.output(root, "y", 8).unwrap();
    let flags = d.output(root, "flags", 3).unwrap();
    let misc = d.output(root, "misc", 8).unwrap();

    let (ea, eb, eop, et, eacc) = (d.sig(a), d.sig(b), d.sig(op), d.sig(t), d.sig(acc));
    let sel = |v: u64| eop.clone().cmp_eq(Expr::lit(v, 2));
    let alu = Expr::mux(
        sel(0),
        ea.clone() + eb.clone(),
        Expr::mux(sel(1), ea.clone() - eb.clone(), Expr::mux(sel(2), ea.clone() * eb.clone(), ea.clone() ^ eb.clone())),
    );
    d.comb(root, "alu", vec![Assign::new(t, alu)]);

    let mixed = ea.clone().div(eb.clone())
        ^ ea.clone().rem(eb.clone())
        ^ (ea.clone() >> eb.clone().slice(0, 3))
        ^ ea.clone().slice(0, 4).sext(8)
        ^ (eb.clone() << Expr::lit(2, 3))
        ^ !eacc.clone();
    d.comb(
        root,
        "out",
        vec![
            Assign::new(y, et.clone() ^ eacc.clone()),
            Assign::new(
                flags,
                Expr::concat(vec![
                    et.clone().reduce_xor(),
                    et.clone().cmp_lt(eacc.clone()),
                    ea.cmp_eq(eb).zext(1),
                ]),
            ),
            Assign::new(misc, mixed),
        ],
    );

    let ehist = d.sig(hist);
    d.clocked(
        root,
        "update",
        vec![
            Assign::new(acc, eacc + et.clone()),
            Assign::slice(hist, 8, 16, ehist.slice(0, 8)),
            Assign::slice(hist, 0, 8, et),
        ],
    );
    d
}

fn reducer(nlanes: usize) -> Design {
    let mut d = Design::new("reducer");
    let root = d.root();
    let mgr = manager(&mut d, root, "mgr", nlanes).unwrap();
    for (port, width) in [("cfg_val", 1), ("cfg_msg", 35)] {
        let outer = d.input(root, port, width).unwrap();
        let inner = d.resolve(mgr, port).unwrap();
        d.connect(outer, inner).unwrap();
    }
    for i in 0..nlanes {
        let outer = d.input(root, &format!("d{}", i), 1).unwrap();
        let inner = d.resolve(mgr, &format!("done_{}", i)).unwrap();
        d.connect(outer, inner).unwrap();
    }
    let all = d.output(root, "all_done", 1).unwrap();
    let inner = d.resolve(mgr, "all_done").unwrap();
    d.connect(all, inner).unwrap();
    d
}

// ---------------------------------------------------------------------------
// Helpers / Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Step {
    Write(usize, u64),
    WriteNext(usize, u64),
    Slice { port: usize, lo: usize, len: usize, value: u64, next: bool },
    Cycle,
    Evaluate,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..3usize, any::<u64>()).prop_map(|(p, v)| Step::Write(p, v)),
        (0..3usize, any::<u64>()).prop_map(|(p, v)| Step::WriteNext(p, v)),
        (0..2usize, 0..8usize, 1..8usize, any::<u64>(), any::<bool>())
            .prop_map(|(port, lo, len, value, next)| Step::Slice { port, lo, len, value, next }),
        Just(Step::Cycle),
        Just(Step::Cycle),
        Just(Step::Evaluate),
    ]
}

fn fit(value: u64, width: usize) -> u64 {
    value & ((1u64 << width) - 1)
}

fn apply(sim: &mut dyn Simulate, step: &Step) -> Result<(), SimError> {
    match *step {
        Step::Write(p, v) => sim.write(INPUTS[p].0, fit(v, INPUTS[p].1)),
        Step::WriteNext(p, v) => sim.write_next(INPUTS[p].0, fit(v, INPUTS[p].1)),
        Step::Slice { port, lo, len, value, next } => {
            let (name, width) = INPUTS[port];
            let hi = (lo + len).min(width);
            let value = fit(value, hi - lo);
            if next {
                sim.write_slice_next(name, lo, hi, value)
            } else {
                sim.write_slice(name, lo, hi, value)
            }
        }
        Step::Cycle => sim.cycle(),
        Step::Evaluate => sim.evaluate(),
    }
}

fn observe(sim: &dyn Simulate) -> Vec<u64> {
    sim.port_names().iter().map(|p| sim.peek(p).unwrap()).collect()
}

fn outputs(sim: &dyn Simulate) -> Vec<u64> {
    ["y", "flags", "misc", "hist"].iter().map(|p| sim.peek(p).unwrap()).collect()
}

fn trace(backend: Backend, steps: &[Step]) -> Vec<Vec<u64>> {
    common::init_logger();
    let mut sim = build(datapath(), SimConfig::default().with_backend(backend)).unwrap();
    sim.reset().unwrap();
    let mut out = vec![observe(sim.as_ref())];
    for step in steps {
        apply(sim.as_mut(), step).unwrap();
        out.push(observe(sim.as_ref()));
    }
    out
}

/// Per-step observations, or the error a step stopped with.
fn outcomes(backend: Backend, limit: usize, steps: &[Step]) -> Vec<Result<Vec<u64>, SimError>> {
    let config = SimConfig::default().with_backend(backend).with_max_settle_evals(limit);
    let mut sim = build(datapath(), config).unwrap();
    let mut out = vec![sim.reset().map(|_| observe(sim.as_ref()))];
    for step in steps {
        let result = apply(sim.as_mut(), step);
        out.push(result.map(|_| observe(sim.as_ref())));
    }
    out
}

// ---------------------------------------------------------------------------
// Property Tests
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The same operation sequence from reset always observes the same values.
    #[test]
    fn runs_are_deterministic(steps in prop::collection::vec(arb_step(), 0..40)) {
        prop_assert_eq!(trace(Backend::Interpreted, &steps), trace(Backend::Interpreted, &steps));
    }

    /// The compiled backend observes exactly what the interpreter observes.
    #[test]
    fn compiled_matches_interpreter(steps in prop::collection::vec(arb_step(), 0..40)) {
        prop_assert_eq!(trace(Backend::Interpreted, &steps), trace(Backend::Compiled, &steps));

        let mut checked = lockstep(datapath(), SimConfig::default(), Backend::Compiled).unwrap();
        checked.reset().unwrap();
        for step in &steps {
            prop_assert!(apply(&mut checked, step).is_ok());
        }
    }

    /// Every backend stops at the same settle under the same evaluation bound.
    #[test]
    fn settle_limit_is_shared(limit in 1usize..4, steps in prop::collection::vec(arb_step(), 0..20)) {
        let reference = outcomes(Backend::Interpreted, limit, &steps);
        for backend in Backend::available() {
            prop_assert_eq!(&outcomes(backend, limit, &steps), &reference);
        }
    }

    /// An immediate write changes nothing observable until the next settle.
    #[test]
    fn writes_wait_for_settle(a1 in any::<u8>(), a2 in any::<u8>(), cycles in 0u64..4) {
        for backend in Backend::available() {
            let mut sim = build(datapath(), SimConfig::default().with_backend(backend)).unwrap();
            sim.reset().unwrap();
            sim.write("a", a1 as u64).unwrap();
            sim.cycles(cycles + 1).unwrap();
            let before = outputs(sim.as_ref());
            prop_assert_eq!(sim.peek("t").unwrap(), a1 as u64);

            sim.write("a", a2 as u64).unwrap();
            prop_assert_eq!(&outputs(sim.as_ref()), &before);
            prop_assert_eq!(sim.peek("t").unwrap(), a1 as u64);

            sim.evaluate().unwrap();
            prop_assert_eq!(sim.peek("t").unwrap(), a2 as u64);
            prop_assert_eq!(sim.ncycles(), cycles + 1);
        }
    }

    /// Aggregate completion is the AND of every lane's flag.
    #[test]
    fn aggregate_done_is_and(flags in prop::collection::vec(any::<bool>(), 1..6)) {
        let mut sim = build(reducer(flags.len()), SimConfig::default()).unwrap();
        sim.reset().unwrap();
        for (i, flag) in flags.iter().enumerate() {
            sim.write(&format!("d{}", i), *flag as u64).unwrap();
        }
        sim.evaluate().unwrap();
        prop_assert_eq!(sim.peek("all_done").unwrap() == 1, flags.iter().all(|f| *f));
    }

    /// The order in which lanes finish never changes the aggregate.
    #[test]
    fn completion_order_is_irrelevant(
        order in (1usize..6).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    ) {
        let mut sim = build(reducer(order.len()), SimConfig::default()).unwrap();
        sim.reset().unwrap();
        for (k, lane) in order.iter().enumerate() {
            prop_assert_eq!(sim.peek("all_done").unwrap(), 0);
            sim.write(&format!("d{}", lane), 1).unwrap();
            sim.cycle().unwrap();
            let last = k + 1 == order.len();
            prop_assert_eq!(sim.peek("all_done").unwrap(), last as u64);
        }
    }
}
