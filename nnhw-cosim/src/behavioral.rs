//! Behavioral stand-in for the hardware emission backend.
//!
//! [`BehavioralBackend`] accepts a compiled [`Design`] and returns a module
//! that executes it cycle by cycle against the memory image. Each operator
//! runs in two phases:
//!
//! 1. **Fetch**: operands stream in over the data port, `ceil(bits / bus_width)`
//!    cycles plus a fixed pipeline latency
//! 2. **Compute**: output tiles complete one after another; a tile's cycle
//!    count follows from the operator's parallelism attributes
//!
//! Results are computed with the same fixed-point kernels as the software
//! reference, so any disagreement points at scheduling, addressing, or layout.

use std::sync::Arc;

use nnhw_compiler::emit::{Design, EmitBackend, ModuleHandle, Port};
use nnhw_compiler::eval::matmul_dims;
use nnhw_compiler::ir::graph::{Graph, TensorId};
use nnhw_compiler::ir::op::{OpId, OpKind, Operator};
use nnhw_compiler::kernels;
use nnhw_compiler::memory::RegionKind;
use nnhw_compiler::{CompileContext, CompileError, CompileResult};

use crate::error::{SimError, SimResult};
use crate::hardware::{ControlRegs, Dut};
use crate::memory::MemoryImage;
use crate::protocol::{STATUS_BUSY, STATUS_DONE};

/// Output elements the datapath finishes together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub cycles: u64,
    /// Logical row-major output indices.
    pub elements: Vec<usize>,
}

/// Execution plan of one operator instance.
#[derive(Debug, Clone)]
pub struct OpPlan {
    pub op: OpId,
    pub instance: String,
    pub fetch_cycles: u64,
    pub tiles: Vec<Tile>,
}

impl OpPlan {
    pub fn cycles(&self) -> u64 {
        self.fetch_cycles + self.tiles.iter().map(|t| t.cycles).sum::<u64>()
    }
}

fn plan_op(
    graph: &Graph,
    op: &Operator,
    bus_width: u32,
    latency: u64,
    instance: String,
) -> Result<OpPlan, String> {
    let bits: u64 = op
        .inputs()
        .iter()
        .map(|&id| graph.tensor(id).memory_size() * 8)
        .sum();
    let fetch_cycles = bits.div_ceil(bus_width as u64).max(1) + latency;

    let out = graph.tensor(op.output());
    let tiles = match &op.kind {
        OpKind::Matmul(mm) => {
            let attrs = mm.attrs.ok_or("matmul has not been scheduled")?;
            let (m, n) = (out.shape[0], out.shape[1]);
            let k = graph.tensor(mm.a).shape[1];
            let cycles = (k.div_ceil(attrs.par_left_col)
                * attrs.concur_out_col.div_ceil(attrs.par_out_col)) as u64;
            let mut tiles = Vec::new();
            for row0 in (0..m).step_by(attrs.par_left_row) {
                for col0 in (0..n).step_by(attrs.concur_out_col) {
                    let elements = (row0..(row0 + attrs.par_left_row).min(m))
                        .flat_map(|r| (col0..(col0 + attrs.concur_out_col).min(n)).map(move |c| r * n + c))
                        .collect();
                    tiles.push(Tile { cycles, elements });
                }
            }
            tiles
        }
        OpKind::Add(_) | OpKind::Normalize(_) | OpKind::Activation(_) => {
            if !op.is_scheduled() {
                return Err(format!("{} has not been scheduled", op.kind_name()));
            }
            let par = op.out_par();
            let cols = out.innermost();
            let rows = out.num_elements() / cols;
            (0..rows)
                .flat_map(|r| {
                    (0..cols).step_by(par).map(move |c0| Tile {
                        cycles: 1,
                        elements: (r * cols + c0..r * cols + (c0 + par).min(cols)).collect(),
                    })
                })
                .collect()
        }
    };
    Ok(OpPlan {
        op: op.id,
        instance,
        fetch_cycles,
        tiles,
    })
}

/// Builds [`BehavioralModule`]s; counts how many designs reached it.
#[derive(Debug, Clone)]
pub struct BehavioralBackend {
    latency: u64,
    emitted: usize,
}

impl Default for BehavioralBackend {
    fn default() -> Self {
        BehavioralBackend {
            latency: 2,
            emitted: 0,
        }
    }
}

impl BehavioralBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra cycles each operator spends filling its pipeline.
    pub fn with_latency(mut self, latency: u64) -> Self {
        self.latency = latency;
        self
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }
}

impl EmitBackend for BehavioralBackend {
    type Module = BehavioralModule;

    fn emit(&mut self, ctx: &mut CompileContext, design: Arc<Design>) -> CompileResult<BehavioralModule> {
        self.emitted += 1;
        let name = ctx.reserve(&design.name);
        let graph = &design.graph;
        let mut plans = Vec::with_capacity(graph.ops.len());
        for op_id in graph.topo_order()? {
            let op = graph.op(op_id);
            let instance = ctx.reserve(&format!("{}_{}", op.kind_name(), op.name));
            let plan = plan_op(graph, op, design.config.bus_width, self.latency, instance)
                .map_err(|reason| CompileError::Emit {
                    module: name.clone(),
                    reason: format!("operator `{}`: {reason}", op.name),
                })?;
            log::debug!(
                "{}: {} tiles, {} cycles",
                plan.instance,
                plan.tiles.len(),
                plan.cycles()
            );
            plans.push(plan);
        }
        log::info!(
            "emitted behavioral module `{name}` ({} operators, ~{} cycles)",
            plans.len(),
            plans.iter().map(OpPlan::cycles).sum::<u64>()
        );
        Ok(BehavioralModule {
            ports: Port::standard(design.config.bus_width),
            name,
            design,
            plans,
            regs: ControlRegs::default(),
            phase: Phase::Idle,
            completed: 0,
        })
    }
}

#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Fetch {
        op: usize,
        left: u64,
    },
    Compute {
        op: usize,
        tile: usize,
        left: u64,
        operands: Vec<Vec<i64>>,
    },
}

#[derive(Debug)]
pub struct BehavioralModule {
    name: String,
    ports: Vec<Port>,
    design: Arc<Design>,
    plans: Vec<OpPlan>,
    regs: ControlRegs,
    phase: Phase,
    completed: u32,
}

impl ModuleHandle for BehavioralModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> &[Port] {
        &self.ports
    }
}

impl BehavioralModule {
    pub fn plans(&self) -> &[OpPlan] {
        &self.plans
    }

    pub fn design(&self) -> &Arc<Design> {
        &self.design
    }

    /// Address of `id` as the module sees it; scratch tensors are relative to `GLOBAL_ADDR`.
    fn addr_of(&self, id: TensorId) -> SimResult<u64> {
        let t = self.design.graph.tensor(id);
        let addr = t.addr().ok_or_else(|| SimError::Layout {
            tensor: t.name.clone(),
            reason: "no address assigned".into(),
        })?;
        let scratch = self.design.memory.region(RegionKind::Scratch)?;
        if scratch.contains(addr) {
            Ok(self.regs.global_addr as u64 + (addr - scratch.base))
        } else {
            Ok(addr)
        }
    }

    fn fetch(&self, op: usize, mem: &mut MemoryImage) -> SimResult<Vec<Vec<i64>>> {
        let graph = &self.design.graph;
        let operator = graph.op(self.plans[op].op);
        let operands = operator
            .inputs()
            .into_iter()
            .map(|id| mem.read_tensor(self.addr_of(id)?, graph.tensor(id)))
            .collect::<SimResult<Vec<_>>>()?;
        let out = graph.tensor(operator.output());
        mem.fill(self.addr_of(out.id)?, out.memory_size(), 0)?;
        Ok(operands)
    }

    fn write_tile(
        &self,
        op: usize,
        tile: usize,
        operands: &[Vec<i64>],
        mem: &mut MemoryImage,
    ) -> SimResult<()> {
        let graph = &self.design.graph;
        let operator = graph.op(self.plans[op].op);
        let out = graph.tensor(operator.output());
        let base = self.addr_of(out.id)?;
        for &idx in &self.plans[op].tiles[tile].elements {
            let value = compute(graph, operator, operands, idx)?;
            mem.write_element(base, out, idx, value)?;
        }
        Ok(())
    }

    fn complete(&mut self, op: usize, mem: &mut MemoryImage) -> SimResult<Phase> {
        self.completed += 1;
        mem.write_u32(self.regs.handshake_addr as u64, self.completed)?;
        log::debug!("{}: done", self.plans[op].instance);
        match self.plans.get(op + 1) {
            Some(next) => Ok(Phase::Fetch {
                op: op + 1,
                left: next.fetch_cycles,
            }),
            None => {
                self.regs.status = STATUS_DONE;
                Ok(Phase::Idle)
            }
        }
    }
}

fn compute(graph: &Graph, op: &Operator, operands: &[Vec<i64>], idx: usize) -> SimResult<i64> {
    let dtype = graph.tensor(op.output()).dtype;
    let unquantized = || {
        SimError::from(CompileError::Emit {
            module: op.name.clone(),
            reason: "operator has no requantization parameters".into(),
        })
    };
    let value = match &op.kind {
        OpKind::Matmul(mm) => {
            let requant = mm.requant.as_ref().ok_or_else(unquantized)?;
            let dims = matmul_dims(graph, mm.a, mm.output, mm.transposed_b);
            let bias = mm.bias.map(|_| operands[2].as_slice());
            kernels::matmul_element(
                &operands[0],
                &operands[1],
                bias,
                dims,
                requant,
                mm.act,
                dtype,
                idx / dims.n,
                idx % dims.n,
            )
        }
        OpKind::Add(add) => {
            let requant = add.requant.as_ref().ok_or_else(unquantized)?;
            let rhs = &operands[1];
            kernels::add_element(operands[0][idx], rhs[idx % rhs.len()], requant, dtype)
        }
        OpKind::Normalize(norm) => {
            let requant = norm.requant.as_ref().ok_or_else(unquantized)?;
            let c = idx % graph.tensor(norm.output).innermost();
            kernels::normalize_element(
                operands[0][idx],
                operands[1][c],
                operands[2][c],
                requant,
                norm.act,
                dtype,
            )
        }
        OpKind::Activation(act) => {
            let requant = act.requant.as_ref().ok_or_else(unquantized)?;
            kernels::finish(operands[0][idx] as i128, requant, Some(act.func), dtype)
        }
    };
    Ok(value)
}

impl Dut for BehavioralModule {
    fn reset(&mut self) {
        self.regs = ControlRegs::default();
        self.phase = Phase::Idle;
        self.completed = 0;
    }

    fn write_control(&mut self, reg: u32, value: u32) -> SimResult<()> {
        self.regs.write(reg, value)
    }

    fn read_control(&self, reg: u32) -> SimResult<u32> {
        self.regs.read(reg)
    }

    fn step(&mut self, mem: &mut MemoryImage) -> SimResult<()> {
        if self.regs.start {
            self.regs.start = false;
            self.completed = 0;
            log::debug!("{}: start", self.name);
            self.phase = match self.plans.first() {
                Some(first) => {
                    self.regs.status = STATUS_BUSY;
                    Phase::Fetch {
                        op: 0,
                        left: first.fetch_cycles,
                    }
                }
                None => {
                    self.regs.status = STATUS_DONE;
                    Phase::Idle
                }
            };
            return Ok(());
        }

        self.phase = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => Phase::Idle,
            Phase::Fetch { op, left } if left > 1 => Phase::Fetch { op, left: left - 1 },
            Phase::Fetch { op, .. } => {
                let operands = self.fetch(op, mem)?;
                Phase::Compute {
                    op,
                    tile: 0,
                    left: self.plans[op].tiles[0].cycles,
                    operands,
                }
            }
            Phase::Compute {
                op,
                tile,
                left,
                operands,
            } if left > 1 => Phase::Compute {
                op,
                tile,
                left: left - 1,
                operands,
            },
            Phase::Compute {
                op,
                tile,
                operands,
                ..
            } => {
                self.write_tile(op, tile, &operands, mem)?;
                match self.plans[op].tiles.get(tile + 1) {
                    Some(next) => Phase::Compute {
                        op,
                        tile: tile + 1,
                        left: next.cycles,
                        operands,
                    },
                    None => self.complete(op, mem)?,
                }
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnhw_compiler::ingest::GraphBuilder;
    use nnhw_compiler::ir::graph::DType;
    use nnhw_compiler::{compile, AttrRequest, AttrRequests, HwConfig, ValueRanges};

    fn matmul_design(par: usize) -> (BehavioralModule, usize) {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", vec![3, 4], DType::int(32)).unwrap();
        let w = b
            .variable("w", vec![4, 5], DType::int(32), vec![0.5; 20])
            .unwrap();
        let y = b.matmul("mm", x, w, None, DType::int(32)).unwrap();
        b.output(y).unwrap();
        let graph = b.finish().unwrap();

        let mut ctx = CompileContext::new("mm", HwConfig::default()).unwrap();
        let ranges = ValueRanges::from([("x".to_string(), (-8.0, 8.0))]);
        let requests = AttrRequests::from([("mm".to_string(), AttrRequest::new().par_out_col(par))]);
        let mut backend = BehavioralBackend::new().with_latency(0);
        let out = compile(&mut ctx, graph, &ranges, &requests, &mut backend).unwrap();
        (out.module, backend.emitted())
    }

    #[test]
    fn tiles_cover_every_output_once() {
        let (module, emitted) = matmul_design(2);
        assert_eq!(emitted, 1);
        let plan = &module.plans()[0];
        assert_eq!(plan.instance, "matmul_mm");
        let mut seen: Vec<usize> = plan.tiles.iter().flat_map(|t| t.elements.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..15).collect::<Vec<_>>());
        // 3 rows x ceil(5 / 2) column groups
        assert_eq!(plan.tiles.len(), 9);
        assert!(plan.tiles.iter().all(|t| t.cycles == 4));
    }

    #[test]
    fn wider_parallelism_is_faster() {
        let (narrow, _) = matmul_design(1);
        let (wide, _) = matmul_design(5);
        assert!(wide.plans()[0].cycles() < narrow.plans()[0].cycles());
    }

    #[test]
    fn idle_until_started() {
        let (mut module, _) = matmul_design(1);
        let mut mem = MemoryImage::new(module.design().memory.end, 0);
        for _ in 0..10 {
            module.step(&mut mem).unwrap();
        }
        assert_eq!(module.read_control(crate::protocol::REG_STATUS).unwrap(), 0);
    }
}
