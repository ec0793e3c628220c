//! Attribute scheduling: per-operator parallelism, burst alignment, aligned shapes.
//!
//! A factor that does not divide its dimension pads that dimension to the next
//! multiple of the factor in the tensor's aligned shape; the logical shape never
//! changes. The innermost axis of every tensor is padded to its lane unit, the
//! lcm of the burst minimum for its dtype and every lane factor touching it.

use std::collections::HashMap;

use crate::config::{BurstPolicy, HwConfig};
use crate::error::{CompileError, CompileResult};
use crate::ir::graph::{AlignedLayout, Graph, TensorId};
use crate::ir::op::{Activation, Add, LaneAttrs, MatmulAttrs, Normalize, OpId, OpKind, Stationary};
use crate::quantize::QuantizedGraph;

/// Requested attributes for one operator. Unset fields take their defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrRequest {
    pub par_left_col: Option<usize>,
    pub par_left_row: Option<usize>,
    pub par_out_col: Option<usize>,
    pub concur_out_col: Option<usize>,
    pub stationary: Option<Stationary>,
}

impl AttrRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn par_left_col(mut self, v: usize) -> Self {
        self.par_left_col = Some(v);
        self
    }

    pub fn par_left_row(mut self, v: usize) -> Self {
        self.par_left_row = Some(v);
        self
    }

    pub fn par_out_col(mut self, v: usize) -> Self {
        self.par_out_col = Some(v);
        self
    }

    pub fn concur_out_col(mut self, v: usize) -> Self {
        self.concur_out_col = Some(v);
        self
    }

    pub fn stationary(mut self, v: Stationary) -> Self {
        self.stationary = Some(v);
        self
    }
}

/// Attribute requests keyed by operator name.
pub type AttrRequests = HashMap<String, AttrRequest>;

/// A quantized graph whose operators carry validated attributes and whose
/// tensors carry aligned layouts.
#[derive(Debug, Clone)]
pub struct ScheduledGraph {
    graph: Graph,
    config: HwConfig,
}

impl ScheduledGraph {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn config(&self) -> &HwConfig {
        &self.config
    }

    pub fn into_parts(self) -> (Graph, HwConfig) {
        (self.graph, self.config)
    }
}

pub(crate) fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub(crate) fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

fn pad(dim: usize, unit: usize) -> usize {
    dim.div_ceil(unit) * unit
}

/// Check one factor against the burst minimum for a `width`-bit operand.
fn burst_check(
    op: &str,
    field: &str,
    factor: usize,
    tensor: &str,
    width: u32,
    config: &HwConfig,
) -> CompileResult<usize> {
    let minimum = config.burst_elements(width);
    if factor < minimum {
        return match config.burst_policy {
            BurstPolicy::Reject => Err(CompileError::attribute(
                op,
                format!(
                    "{field}={factor} is below the burst minimum ceil({}/{width})={minimum} for `{tensor}`",
                    config.bus_width
                ),
            )),
            BurstPolicy::Widen => {
                log::warn!("{op}: widening {field} from {factor} to burst minimum {minimum}");
                Ok(minimum)
            }
        };
    }
    Ok(factor)
}

fn positive(op: &str, field: &str, v: Option<usize>, default: usize) -> CompileResult<usize> {
    match v {
        Some(0) => Err(CompileError::attribute(op, format!("{field} must be >= 1"))),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

/// Validate `req` against operator `op_id` and store the resulting attributes on it.
pub fn apply_attributes(
    graph: &mut Graph,
    op_id: OpId,
    req: &AttrRequest,
    config: &HwConfig,
) -> CompileResult<()> {
    let op = graph.op(op_id);
    let name = op.name.clone();

    let kind = match &op.kind {
        OpKind::Matmul(mm) => {
            let a = graph.tensor(mm.a);
            let b = graph.tensor(mm.b);
            let out = graph.tensor(mm.output);

            let mut par_left_col = positive(&name, "par_left_col", req.par_left_col, 1)?;
            let par_left_row = positive(&name, "par_left_row", req.par_left_row, 1)?;
            let mut par_out_col = positive(&name, "par_out_col", req.par_out_col, 1)?;

            par_left_col =
                burst_check(&name, "par_left_col", par_left_col, &a.name, a.dtype.width, config)?;
            if mm.transposed_b {
                par_left_col =
                    burst_check(&name, "par_left_col", par_left_col, &b.name, b.dtype.width, config)?;
            }
            par_out_col =
                burst_check(&name, "par_out_col", par_out_col, &out.name, out.dtype.width, config)?;

            let concur_out_col =
                positive(&name, "concur_out_col", req.concur_out_col, par_out_col)?;
            if concur_out_col % par_out_col != 0 {
                return Err(CompileError::attribute(
                    &name,
                    format!(
                        "concur_out_col={concur_out_col} is not a multiple of par_out_col={par_out_col}"
                    ),
                ));
            }
            let padded_cols = pad(out.innermost(), par_out_col);
            let concur_out_col = concur_out_col.min(padded_cols);

            let attrs = MatmulAttrs {
                par_left_col,
                par_left_row,
                par_out_col,
                concur_out_col,
                stationary: req.stationary.unwrap_or_default(),
            };
            log::debug!("{name}: {attrs:?}");
            let mut mm = mm.clone();
            mm.attrs = Some(attrs);
            OpKind::Matmul(mm)
        }
        OpKind::Add(add) => OpKind::Add(Add {
            attrs: Some(lane_attrs(graph, op_id, req, config)?),
            ..add.clone()
        }),
        OpKind::Normalize(norm) => OpKind::Normalize(Normalize {
            attrs: Some(lane_attrs(graph, op_id, req, config)?),
            ..norm.clone()
        }),
        OpKind::Activation(act) => OpKind::Activation(Activation {
            attrs: Some(lane_attrs(graph, op_id, req, config)?),
            ..act.clone()
        }),
    };
    graph.op_mut(op_id).kind = kind;
    Ok(())
}

/// Elementwise operators take a single lane factor, checked against every operand.
fn lane_attrs(
    graph: &Graph,
    op_id: OpId,
    req: &AttrRequest,
    config: &HwConfig,
) -> CompileResult<LaneAttrs> {
    let op = graph.op(op_id);
    let name = op.name.as_str();
    for (field, v) in [
        ("par_left_col", req.par_left_col),
        ("par_left_row", req.par_left_row),
    ] {
        if v.is_some_and(|v| v != 1) {
            return Err(CompileError::attribute(
                name,
                format!("{field} is only meaningful for matmul operators"),
            ));
        }
    }
    if req.stationary == Some(Stationary::Left) {
        return Err(CompileError::attribute(
            name,
            "stationary operand is only meaningful for matmul operators",
        ));
    }

    let mut par = positive(name, "par_out_col", req.par_out_col, 1)?;
    if req.concur_out_col.is_some_and(|c| c != par) {
        return Err(CompileError::attribute(
            name,
            "concur_out_col must equal par_out_col for elementwise operators",
        ));
    }
    for id in op.inputs().into_iter().chain([op.output()]) {
        let t = graph.tensor(id);
        par = burst_check(name, "par_out_col", par, &t.name, t.dtype.width, config)?;
    }
    let attrs = LaneAttrs { par };
    log::debug!("{name}: {attrs:?}");
    Ok(attrs)
}

/// Apply `requests` (defaults for unnamed operators) and compute every aligned layout.
pub fn schedule(
    quantized: QuantizedGraph,
    requests: &AttrRequests,
    config: &HwConfig,
) -> CompileResult<ScheduledGraph> {
    config.validate()?;
    let mut graph = quantized.into_graph();

    for name in requests.keys() {
        if graph.op_by_name(name).is_none() {
            return Err(CompileError::attribute(name, "no operator with this name"));
        }
    }
    for op_id in 0..graph.ops.len() {
        let req = requests
            .get(&graph.op(op_id).name)
            .copied()
            .unwrap_or_default();
        apply_attributes(&mut graph, op_id, &req, config)?;
    }

    finalize_alignment(&mut graph, config);
    log::info!(
        "scheduled {} operators on a {}-bit bus",
        graph.ops.len(),
        config.bus_width
    );
    Ok(ScheduledGraph {
        graph,
        config: config.clone(),
    })
}

/// Innermost lane unit and row unit of every tensor, from the operator attributes.
fn alignment_units(graph: &Graph, config: &HwConfig) -> (Vec<usize>, Vec<usize>) {
    let mut lanes: Vec<usize> = graph
        .tensors
        .iter()
        .map(|t| config.burst_elements(t.dtype.width))
        .collect();
    let mut rows = vec![1; graph.tensors.len()];
    let mut lane_groups: Vec<Vec<TensorId>> = Vec::new();

    for op in &graph.ops {
        match &op.kind {
            OpKind::Matmul(mm) => {
                let attrs = mm.attrs.unwrap_or_default();
                let mut touch = |id: TensorId, lane: usize, row: usize| {
                    lanes[id] = lcm(lanes[id], lane);
                    rows[id] = lcm(rows[id], row);
                };
                touch(mm.a, attrs.par_left_col, attrs.par_left_row);
                if mm.transposed_b {
                    touch(mm.b, attrs.par_left_col, attrs.par_out_col);
                } else {
                    touch(mm.b, attrs.par_out_col, 1);
                }
                if let Some(bias) = mm.bias {
                    touch(bias, attrs.par_out_col, 1);
                }
                touch(mm.output, attrs.par_out_col, attrs.par_left_row);
            }
            OpKind::Add(_) | OpKind::Normalize(_) | OpKind::Activation(_) => {
                let par = op.out_par();
                let group: Vec<TensorId> = op.inputs().into_iter().chain([op.output()]).collect();
                for &id in &group {
                    lanes[id] = lcm(lanes[id], par);
                }
                lane_groups.push(group);
            }
        }
    }

    // elementwise operands share one lane unit
    loop {
        let mut changed = false;
        for group in &lane_groups {
            let unit = group.iter().fold(1, |u, &id| lcm(u, lanes[id]));
            for &id in group {
                if lanes[id] != unit {
                    lanes[id] = unit;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    (lanes, rows)
}

fn finalize_alignment(graph: &mut Graph, config: &HwConfig) {
    let (lanes, rows) = alignment_units(graph, config);
    for t in &mut graph.tensors {
        let mut shape = t.shape.clone();
        let rank = shape.len();
        shape[rank - 1] = pad(shape[rank - 1], lanes[t.id]);
        if rank >= 2 {
            shape[rank - 2] = pad(shape[rank - 2], rows[t.id]);
        }
        if shape != t.shape {
            log::debug!("{}: aligned {:?} -> {:?}", t.name, t.shape, shape);
        }
        t.aligned = Some(AlignedLayout {
            shape,
            lanes: lanes[t.id],
        });
    }
}
