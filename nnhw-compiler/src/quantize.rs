//! Quantizer: fixed-point scale factors, effective widths, and operator requantization.
//!
//! Ranges come from three places, first match wins:
//! 1. declared by the caller in [`ValueRanges`]
//! 2. observed from the data of a variable or constant
//! 3. propagated from the producing operator, in topological order
//!
//! A declared range fixes the effective width to the bits its magnitude needs;
//! observed and propagated ranges use the full declared width. Operator outputs
//! carry the scale their fixed-point rescale actually realises, so the evaluator,
//! the hardware model, and dequantization all agree.

use std::collections::HashMap;

use crate::error::{CompileError, CompileResult};
use crate::ir::fixed::{self, FixedMul};
use crate::ir::graph::{DType, Graph, QuantParams, RangeSource, TensorId};
use crate::ir::op::{ActFunc, AddRequant, OpKind, Requant};

/// Real-valued `(min, max)` per tensor name.
pub type ValueRanges = HashMap<String, (f64, f64)>;

/// A graph whose every tensor carries `QuantParams` and whose operators carry requantization.
#[derive(Debug, Clone)]
pub struct QuantizedGraph {
    graph: Graph,
}

impl QuantizedGraph {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }
}

/// Bits a signed (or unsigned) integer needs to hold magnitude `m`.
pub fn bits_needed(m: f64, signed: bool) -> u32 {
    let ceil = m.abs().ceil();
    let int = if ceil >= u128::MAX as f64 {
        u128::MAX
    } else {
        ceil as u128
    };
    let bits = u128::BITS - int.leading_zeros();
    if signed {
        bits + 1
    } else {
        bits.max(1)
    }
}

/// Largest quantized magnitude of a `width`-bit integer.
fn qmax(width: u32, signed: bool) -> f64 {
    if signed {
        2f64.powi(width as i32 - 1) - 1.0
    } else {
        2f64.powi(width as i32) - 1.0
    }
}

fn magnitude((lo, hi): (f64, f64)) -> f64 {
    lo.abs().max(hi.abs())
}

pub fn quantize(mut graph: Graph, ranges: &ValueRanges) -> CompileResult<QuantizedGraph> {
    for name in ranges.keys() {
        if graph.tensor_by_name(name).is_none() {
            log::warn!("value range given for unknown tensor `{name}`, ignoring");
        }
    }

    for t in &mut graph.tensors {
        t.quant = None;
        t.quantized = None;
    }

    // declared, then observed
    for id in 0..graph.tensors.len() {
        let tensor = graph.tensor(id);
        let quant = if let Some(&range) = ranges.get(&tensor.name) {
            Some(declared(&tensor.name, tensor.dtype, range)?)
        } else if let Some(values) = tensor.kind.values() {
            Some(observed(&tensor.name, tensor.dtype, values)?)
        } else {
            None
        };
        graph.tensor_mut(id).quant = quant;
    }

    for op_id in graph.topo_order()? {
        let op = graph.op(op_id).clone();
        for input in op.inputs() {
            if graph.tensor(input).quant.is_none() {
                return Err(CompileError::range(
                    &graph.tensor(input).name,
                    format!(
                        "no declared range, no data, and no producer to propagate from (consumed by `{}`)",
                        op.name
                    ),
                ));
            }
        }

        let output = op.output();
        if graph.tensor(output).quant.is_none() {
            let range = propagate(&graph, &op.kind);
            let out = graph.tensor(output);
            let quant = full_width(&out.name, out.dtype, range, RangeSource::Propagated)?;
            graph.tensor_mut(output).quant = Some(quant);
        }

        let realised = requantize(&mut graph, op_id)?;
        if let Some(q) = graph.tensor_mut(output).quant.as_mut() {
            q.scale_factor = realised;
        }
    }

    for t in &graph.tensors {
        if t.quant.is_none() {
            return Err(CompileError::range(
                &t.name,
                "no declared range, no data, and no producer to propagate from",
            ));
        }
    }

    quantize_parameters(&mut graph);

    for t in &graph.tensors {
        if let Some(q) = &t.quant {
            log::debug!(
                "{}: scale {:.6} width {} range {:?} ({:?})",
                t.name,
                q.scale_factor,
                q.width,
                q.range,
                q.source
            );
        }
    }
    log::info!(
        "quantized {} tensors, {} operators",
        graph.tensors.len(),
        graph.ops.len()
    );
    Ok(QuantizedGraph { graph })
}

fn check_range(name: &str, dtype: DType, (lo, hi): (f64, f64)) -> CompileResult<()> {
    if !(lo.is_finite() && hi.is_finite()) || lo > hi {
        return Err(CompileError::range(
            name,
            format!("invalid range ({lo}, {hi})"),
        ));
    }
    if !dtype.signed && lo < 0.0 {
        return Err(CompileError::range(
            name,
            format!("negative minimum {lo} for unsigned {dtype}"),
        ));
    }
    Ok(())
}

fn declared(name: &str, dtype: DType, range: (f64, f64)) -> CompileResult<QuantParams> {
    check_range(name, dtype, range)?;
    let m = magnitude(range);
    if m == 0.0 {
        return Err(CompileError::range(name, "declared range has zero magnitude"));
    }
    let needed = bits_needed(m, dtype.signed);
    if needed > dtype.width {
        return Err(CompileError::BitWidth {
            tensor: name.to_string(),
            needed,
            declared: dtype.width,
        });
    }
    Ok(QuantParams {
        scale_factor: qmax(needed, dtype.signed) / m,
        width: needed,
        range,
        source: RangeSource::Declared,
    })
}

fn observed(name: &str, dtype: DType, values: &[f64]) -> CompileResult<QuantParams> {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    full_width(name, dtype, (lo, hi), RangeSource::Observed)
}

fn full_width(
    name: &str,
    dtype: DType,
    range: (f64, f64),
    source: RangeSource,
) -> CompileResult<QuantParams> {
    check_range(name, dtype, range)?;
    let m = magnitude(range);
    let m = if m == 0.0 { 1.0 } else { m };
    Ok(QuantParams {
        scale_factor: qmax(dtype.width, dtype.signed) / m,
        width: dtype.width,
        range,
        source,
    })
}

fn range_of(graph: &Graph, id: TensorId) -> (f64, f64) {
    graph.tensor(id).quant.as_ref().map_or((0.0, 0.0), |q| q.range)
}

fn with_act(range: (f64, f64), act: Option<ActFunc>) -> (f64, f64) {
    act.map_or(range, |f| f.apply_range(range))
}

/// Output range of an operator from its operand ranges.
fn propagate(graph: &Graph, kind: &OpKind) -> (f64, f64) {
    match kind {
        OpKind::Matmul(mm) => {
            let k = graph.tensor(mm.a).innermost() as f64;
            let a = magnitude(range_of(graph, mm.a));
            let b = magnitude(range_of(graph, mm.b));
            let bias = mm.bias.map_or(0.0, |id| magnitude(range_of(graph, id)));
            let m = k * a * b + bias;
            with_act((-m, m), mm.act)
        }
        OpKind::Add(add) => {
            let (l_lo, l_hi) = range_of(graph, add.lhs);
            let (r_lo, r_hi) = range_of(graph, add.rhs);
            (l_lo + r_lo, l_hi + r_hi)
        }
        OpKind::Normalize(norm) => {
            let x = magnitude(range_of(graph, norm.input));
            let g = magnitude(range_of(graph, norm.scale));
            let b = magnitude(range_of(graph, norm.shift));
            let m = x * g + b;
            with_act((-m, m), norm.act)
        }
        OpKind::Activation(act) => act.func.apply_range(range_of(graph, act.input)),
    }
}

fn scale_of(graph: &Graph, id: TensorId) -> f64 {
    graph.tensor(id).scale_factor().unwrap_or(1.0)
}

/// Operator results share their operator's name, so errors name the output tensor.
fn ratio(op: &str, what: &str, r: f64) -> CompileResult<FixedMul> {
    FixedMul::from_ratio(r)
        .ok_or_else(|| CompileError::range(op, format!("{what} rescale ratio {r} is not representable")))
}

fn slope_mul(op: &str, act: Option<ActFunc>) -> CompileResult<Option<FixedMul>> {
    match act {
        Some(ActFunc::LeakyRelu { slope }) => ratio(op, "leaky slope", slope).map(Some),
        _ => Ok(None),
    }
}

/// Fill in the operator's requantization and return the output scale it realises.
fn requantize(graph: &mut Graph, op_id: usize) -> CompileResult<f64> {
    let op = graph.op(op_id).clone();
    let target = scale_of(graph, op.output());
    let name = op.name.as_str();

    let (kind, realised) = match op.kind {
        OpKind::Matmul(mut mm) => {
            let acc = scale_of(graph, mm.a) * scale_of(graph, mm.b);
            let out = ratio(name, "output", target / acc)?;
            let bias = match mm.bias {
                Some(id) => Some(ratio(name, "bias", acc / scale_of(graph, id))?),
                None => None,
            };
            let slope = slope_mul(name, mm.act)?;
            mm.requant = Some(Requant { out, bias, slope });
            (OpKind::Matmul(mm), out.ratio() * acc)
        }
        OpKind::Add(mut add) => {
            let lhs = scale_of(graph, add.lhs);
            let rhs = scale_of(graph, add.rhs);
            let (rl, rr) = (target / lhs, target / rhs);
            let unrepresentable =
                || CompileError::range(name, format!("add rescale ratios {rl}, {rr} not representable"));
            // precision from the smaller ratio, headroom for the larger multiplier in an i64
            let precise = fixed::shift_for(rl.min(rr)).ok_or_else(unrepresentable)?;
            let larger = rl.max(rr);
            if !larger.is_finite() || larger >= 2f64.powi(62) {
                return Err(unrepresentable());
            }
            let headroom = (62 - larger.log2().ceil() as i32).max(0) as u32;
            let rshift = precise.min(headroom);
            let unit = 2f64.powi(rshift as i32);
            let lhs_mul = (rl * unit).round() as i64;
            if lhs_mul == 0 {
                return Err(CompileError::range(
                    name,
                    format!("lhs rescale ratio {rl} underflows the shared shift"),
                ));
            }
            // rhs is rescaled onto the scale the lhs term actually lands on
            let realised = lhs_mul as f64 / unit * lhs;
            let rhs_mul = (realised / rhs * unit).round() as i64;
            add.requant = Some(AddRequant {
                lhs_mul,
                rhs_mul,
                rshift,
            });
            (OpKind::Add(add), realised)
        }
        OpKind::Normalize(mut norm) => {
            let acc = scale_of(graph, norm.input) * scale_of(graph, norm.scale);
            let out = ratio(name, "output", target / acc)?;
            let bias = ratio(name, "shift", acc / scale_of(graph, norm.shift))?;
            let slope = slope_mul(name, norm.act)?;
            norm.requant = Some(Requant {
                out,
                bias: Some(bias),
                slope,
            });
            (OpKind::Normalize(norm), out.ratio() * acc)
        }
        OpKind::Activation(mut act) => {
            let acc = scale_of(graph, act.input);
            let out = ratio(name, "output", target / acc)?;
            let slope = slope_mul(name, Some(act.func))?;
            act.requant = Some(Requant {
                out,
                bias: None,
                slope,
            });
            (OpKind::Activation(act), out.ratio() * acc)
        }
    };
    graph.op_mut(op_id).kind = kind;
    Ok(realised)
}

/// `round(v * scale)` saturated to the declared dtype, for every variable and constant.
fn quantize_parameters(graph: &mut Graph) {
    for t in &mut graph.tensors {
        let (Some(values), Some(q)) = (t.kind.values(), t.quant.as_ref()) else {
            continue;
        };
        let ints = values
            .iter()
            .map(|&v| t.dtype.saturate(fixed::quantize_value(v, q.scale_factor)))
            .collect();
        t.quantized = Some(ints);
    }
}
