//! Native backend: netlist → Rust source → cdylib.
//!
//! Source generation is always available. Compiling with `rustc` and loading
//! the library needs the `native` feature.

use std::fmt::Write as _;

use crate::elaborate::Netlist;
use crate::ir::{Assign, BinaryOp, Expr, UnaryOp};
use crate::schedule::Schedule;
use crate::value::mask;

pub fn mask_const(width: usize) -> String {
    format!("0x{:x}u64", mask(width))
}

/// FNV-1a, used as the library cache key.
pub fn code_hash(code: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in code.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn expr_to_rust(expr: &Expr) -> String {
    match expr {
        Expr::Signal { id, .. } => format!("s[{}]", id.0),
        Expr::Literal { value, width } => format!("0x{:x}u64", value & mask(*width)),
        Expr::Unary { op, operand, width } => {
            let a = expr_to_rust(operand);
            match op {
                UnaryOp::Not => format!("(!{} & {})", a, mask_const(*width)),
                UnaryOp::ReduceAnd => {
                    let m = mask_const(operand.width());
                    format!("((({} & {}) == {}) as u64)", a, m, m)
                }
                UnaryOp::ReduceOr => format!("(({} != 0) as u64)", a),
                UnaryOp::ReduceXor => format!("(({}).count_ones() as u64 & 1)", a),
            }
        }
        Expr::Binary { op, left, right, width } => {
            let l = expr_to_rust(left);
            let r = expr_to_rust(right);
            let m = mask_const(*width);
            match op {
                BinaryOp::And => format!("({} & {})", l, r),
                BinaryOp::Or => format!("({} | {})", l, r),
                BinaryOp::Xor => format!("({} ^ {})", l, r),
                BinaryOp::Add => format!("({}.wrapping_add({}) & {})", l, r, m),
                BinaryOp::Sub => format!("({}.wrapping_sub({}) & {})", l, r, m),
                BinaryOp::Mul => format!("({}.wrapping_mul({}) & {})", l, r, m),
                BinaryOp::Div => format!("div({}, {})", l, r),
                BinaryOp::Rem => format!("rem({}, {})", l, r),
                BinaryOp::Shl => format!("(shl({}, {}) & {})", l, r, m),
                BinaryOp::Shr => format!("shr({}, {})", l, r),
                BinaryOp::Eq => format!("(({} == {}) as u64)", l, r),
                BinaryOp::Ne => format!("(({} != {}) as u64)", l, r),
                BinaryOp::Lt => format!("(({} < {}) as u64)", l, r),
                BinaryOp::Gt => format!("(({} > {}) as u64)", l, r),
                BinaryOp::Le => format!("(({} <= {}) as u64)", l, r),
                BinaryOp::Ge => format!("(({} >= {}) as u64)", l, r),
            }
        }
        Expr::Mux { cond, when_true, when_false, .. } => format!(
            "(if {} != 0 {{ {} }} else {{ {} }})",
            expr_to_rust(cond),
            expr_to_rust(when_true),
            expr_to_rust(when_false)
        ),
        Expr::Slice { base, low, width } => {
            format!("(({} >> {}) & {})", expr_to_rust(base), low, mask_const(*width))
        }
        Expr::Concat { parts, width } => {
            let mut terms = Vec::new();
            let mut shift = 0usize;
            for part in parts.iter().rev() {
                let code = format!("({} & {})", expr_to_rust(part), mask_const(part.width()));
                if shift > 0 {
                    terms.push(format!("({} << {})", code, shift));
                } else {
                    terms.push(code);
                }
                shift += part.width();
            }
            format!("(({}) & {})", terms.join(" | "), mask_const(*width))
        }
        Expr::Zext { expr, width } => format!("({} & {})", expr_to_rust(expr), mask_const(*width)),
        Expr::Sext { expr, width } => format!(
            "(sext({}, {}) & {})",
            expr_to_rust(expr),
            expr.width(),
            mask_const(*width)
        ),
    }
}

fn store(code: &mut String, indent: &str, dst: &str, netlist: &Netlist, assign: &Assign) {
    let net = assign.target.signal.0;
    let value = expr_to_rust(&assign.expr);
    match assign.target.range {
        None => {
            let _ = writeln!(code, "{}{}[{}] = {} & {};", indent, dst, net, value, mask_const(netlist.width(net)));
        }
        Some(_) => {
            let (shift, m) = assign.target.placement(netlist.width(net));
            let _ = writeln!(
                code,
                "{i}{d}[{n}] = ({d}[{n}] & !0x{m:x}u64) | (({v} << {s}) & 0x{m:x}u64);",
                i = indent,
                d = dst,
                n = net,
                m = m,
                v = value,
                s = shift
            );
        }
    }
}

const PRELUDE: &str = r#"#[inline(always)]
fn div(l: u64, r: u64) -> u64 { if r != 0 { l / r } else { 0 } }
#[inline(always)]
fn rem(l: u64, r: u64) -> u64 { if r != 0 { l % r } else { 0 } }
#[inline(always)]
fn shl(l: u64, r: u64) -> u64 { if r >= 64 { 0 } else { l << r } }
#[inline(always)]
fn shr(l: u64, r: u64) -> u64 { if r >= 64 { 0 } else { l >> r } }
#[inline(always)]
fn sext(v: u64, w: u32) -> u64 {
    if w >= 64 { v } else { let s = 64 - w; (((v << s) as i64) >> s) as u64 }
}
"#;

/// Rust source for `eval_block` (one match arm per combinational block,
/// keyed by block index) and `sample` (every clocked assignment staged into
/// `next`/`next_mask`).
pub fn generate_code(netlist: &Netlist, schedule: &Schedule) -> String {
    let mut code = String::new();
    code.push_str("//! Auto-generated by cycle_sim\n\n");
    code.push_str("#![allow(unused_parens, unused_variables, dead_code)]\n\n");
    code.push_str(PRELUDE);

    code.push_str("\n#[inline(always)]\npub fn eval_block_inline(block: usize, s: &mut [u64]) {\n");
    code.push_str("    match block {\n");
    for &b in schedule.order() {
        let _ = writeln!(code, "        // {}", netlist.comb[b].name);
        let _ = writeln!(code, "        {} => {{", b);
        for assign in &netlist.comb[b].assigns {
            store(&mut code, "            ", "s", netlist, assign);
        }
        code.push_str("        }\n");
    }
    code.push_str("        _ => {}\n    }\n}\n\n");

    code.push_str("#[inline(always)]\npub fn sample_inline(s: &[u64], next: &mut [u64], next_mask: &mut [u64]) {\n");
    for block in &netlist.clocked {
        let _ = writeln!(code, "    // {}", block.name);
        for assign in &block.assigns {
            store(&mut code, "    ", "next", netlist, assign);
            let net = assign.target.signal.0;
            let (_, m) = assign.target.placement(netlist.width(net));
            let _ = writeln!(code, "    next_mask[{}] |= 0x{:x}u64;", net, m);
        }
    }
    code.push_str("}\n\n");

    code.push_str("#[no_mangle]\n");
    code.push_str("pub unsafe extern \"C\" fn eval_block(block: usize, signals: *mut u64, len: usize) {\n");
    code.push_str("    let s = std::slice::from_raw_parts_mut(signals, len);\n");
    code.push_str("    eval_block_inline(block, s);\n");
    code.push_str("}\n\n");
    code.push_str("#[no_mangle]\n");
    code.push_str("pub unsafe extern \"C\" fn sample(signals: *const u64, next: *mut u64, next_mask: *mut u64, len: usize) {\n");
    code.push_str("    let s = std::slice::from_raw_parts(signals, len);\n");
    code.push_str("    let next = std::slice::from_raw_parts_mut(next, len);\n");
    code.push_str("    let next_mask = std::slice::from_raw_parts_mut(next_mask, len);\n");
    code.push_str("    sample_inline(s, next, next_mask);\n");
    code.push_str("}\n");
    code
}

#[cfg(feature = "native")]
pub use loaded::NativeSimulator;

#[cfg(feature = "native")]
mod loaded {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use std::sync::Arc;

    use log::info;

    use super::{code_hash, generate_code};
    use crate::backend::{Backend, Simulate};
    use crate::elaborate::Netlist;
    use crate::error::{Result, SimError};
    use crate::lifecycle::{Lifecycle, SimState};
    use crate::config::SimConfig;
    use crate::schedule::{drain, DirtySet, Schedule};
    use crate::store::{SignalStore, WriteOp};
    use crate::value::Bits;

    type EvalFn = unsafe extern "C" fn(usize, *mut u64, usize);
    type SampleFn = unsafe extern "C" fn(*const u64, *mut u64, *mut u64, usize);

    fn native_err(e: impl std::fmt::Display) -> SimError {
        SimError::Native(e.to_string())
    }

    /// Compile `code` into a cdylib under `cache_dir`, reusing an earlier
    /// build of identical source. Returns the library and whether it was cached.
    fn compile(code: &str, cache_dir: &Path) -> Result<(libloading::Library, bool)> {
        let hash = code_hash(code);
        fs::create_dir_all(cache_dir).map_err(native_err)?;
        let lib_ext = if cfg!(target_os = "macos") {
            "dylib"
        } else if cfg!(target_os = "windows") {
            "dll"
        } else {
            "so"
        };
        let lib_path = cache_dir.join(format!("cycle_sim_{:016x}.{}", hash, lib_ext));
        let src_path = cache_dir.join(format!("cycle_sim_{:016x}.rs", hash));

        let cached = lib_path.exists();
        if !cached {
            fs::write(&src_path, code).map_err(native_err)?;
            let output = Command::new("rustc")
                .args([
                    "--crate-type=cdylib",
                    "--edition=2021",
                    "-C",
                    "opt-level=3",
                    "-C",
                    "panic=abort",
                    "-A",
                    "warnings",
                    "-o",
                ])
                .arg(&lib_path)
                .arg(&src_path)
                .output()
                .map_err(native_err)?;
            if !output.status.success() {
                return Err(SimError::Native(format!(
                    "rustc failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                )));
            }
        }
        // SAFETY: the library was produced from our own generated source.
        let lib = unsafe { libloading::Library::new(&lib_path) }.map_err(native_err)?;
        Ok((lib, cached))
    }

    pub struct NativeSimulator {
        netlist: Arc<Netlist>,
        schedule: Arc<Schedule>,
        store: SignalStore,
        dirty: DirtySet,
        max_settle_evals: usize,
        next: Vec<u64>,
        next_mask: Vec<u64>,
        seq_targets: Vec<usize>,
        eval_block_fn: EvalFn,
        sample_fn: SampleFn,
        lifecycle: Lifecycle,
        _lib: libloading::Library,
    }

    impl NativeSimulator {
        pub fn new(netlist: Arc<Netlist>, schedule: Arc<Schedule>, config: &SimConfig) -> Result<Self> {
            let code = generate_code(&netlist, &schedule);
            let dir: PathBuf = config
                .native_cache_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("cycle_sim_cache"));
            let (lib, cached) = compile(&code, &dir)?;
            info!(
                "native backend ready ({}, {} bytes of source)",
                if cached { "cache hit" } else { "compiled" },
                code.len()
            );
            // SAFETY: symbol signatures match the generated `extern "C"` functions.
            let (eval_block_fn, sample_fn) = unsafe {
                let e: libloading::Symbol<EvalFn> = lib.get(b"eval_block").map_err(native_err)?;
                let s: libloading::Symbol<SampleFn> = lib.get(b"sample").map_err(native_err)?;
                (*e, *s)
            };
            let mut seq_targets: Vec<usize> = netlist
                .clocked
                .iter()
                .flat_map(|b| b.writes.iter().map(|w| w.0))
                .collect();
            seq_targets.sort_unstable();
            seq_targets.dedup();
            let n = netlist.nets.len();
            Ok(Self {
                store: SignalStore::new(&netlist),
                dirty: DirtySet::new(schedule.block_count()),
                max_settle_evals: config.max_settle_evals,
                netlist,
                schedule,
                next: vec![0; n],
                next_mask: vec![0; n],
                seq_targets,
                eval_block_fn,
                sample_fn,
                lifecycle: Lifecycle::new(SimState::Elaborated),
                _lib: lib,
            })
        }

        fn settle(&mut self) -> Result<()> {
            let eval_block = self.eval_block_fn;
            drain(
                &mut self.dirty,
                &self.schedule,
                &self.netlist,
                &mut self.store.values,
                self.max_settle_evals,
                // SAFETY: the generated code indexes only nets of this netlist.
                |b, values| unsafe { eval_block(b, values.as_mut_ptr(), values.len()) },
            )?;
            Ok(())
        }

        fn step(&mut self) -> Result<()> {
            self.settle()?;
            self.sample();
            for net in self.store.commit() {
                self.dirty.mark_readers(&self.schedule, net, None);
            }
            self.store.ncycles += 1;
            self.settle()
        }

        fn sample(&mut self) {
            for &net in &self.seq_targets {
                self.next_mask[net] = 0;
            }
            let values = &self.store.values;
            // SAFETY: all three buffers hold one slot per net.
            unsafe {
                (self.sample_fn)(
                    values.as_ptr(),
                    self.next.as_mut_ptr(),
                    self.next_mask.as_mut_ptr(),
                    values.len(),
                )
            }
            for &net in &self.seq_targets {
                let m = self.next_mask[net];
                if m != 0 {
                    self.store.stage(net, self.next[net], m);
                }
            }
        }

        fn external(
            &mut self,
            op: &'static str,
            path: &str,
            range: Option<(usize, usize)>,
            value: u64,
            next: bool,
        ) -> Result<()> {
            self.lifecycle.write(op)?;
            let write = WriteOp::resolve(&self.netlist, path, range, value)?;
            if next {
                self.store.write_next(&write);
            } else if self.store.write_now(&write) {
                self.dirty.mark_readers(&self.schedule, write.net, None);
            }
            Ok(())
        }
    }

    impl Simulate for NativeSimulator {
        fn backend(&self) -> Backend {
            Backend::Native
        }

        fn state(&self) -> SimState {
            self.lifecycle.state()
        }

        fn elaborate(&mut self) -> Result<()> {
            self.lifecycle.elaborate()
        }

        fn reset(&mut self) -> Result<()> {
            self.lifecycle.reset()?;
            self.store.reset(&self.netlist);
            self.dirty.clear();
            self.dirty.mark_all(&self.schedule);
            let result = self.settle();
            self.lifecycle.guard(result)?;
            self.lifecycle.enter(SimState::Reset);
            Ok(())
        }

        fn cycle(&mut self) -> Result<()> {
            self.lifecycle.cycle()?;
            let result = self.step();
            self.lifecycle.guard(result)?;
            self.lifecycle.enter(SimState::Running);
            Ok(())
        }

        fn evaluate(&mut self) -> Result<()> {
            self.lifecycle.evaluate()?;
            let result = self.settle();
            self.lifecycle.guard(result)
        }

        fn read(&self, path: &str) -> Result<Bits> {
            self.lifecycle.observe("read")?;
            let net = self.netlist.net(path)?;
            Ok(Bits::from_raw(self.netlist.width(net), self.store.values[net]))
        }

        fn write(&mut self, path: &str, value: u64) -> Result<()> {
            self.external("write", path, None, value, false)
        }

        fn write_next(&mut self, path: &str, value: u64) -> Result<()> {
            self.external("write_next", path, None, value, true)
        }

        fn write_slice(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
            self.external("write_slice", path, Some((lo, hi)), value, false)
        }

        fn write_slice_next(&mut self, path: &str, lo: usize, hi: usize, value: u64) -> Result<()> {
            self.external("write_slice_next", path, Some((lo, hi)), value, true)
        }

        fn ncycles(&self) -> u64 {
            self.store.ncycles
        }

        fn port_names(&self) -> Vec<String> {
            self.netlist.port_names().to_vec()
        }
    }
}
