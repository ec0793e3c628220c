//! Software graph evaluators.
//!
//! `eval_quantized` runs the fixed-point kernels and is the reference the
//! hardware is verified against. `eval_float` runs the naive float kernels on
//! the real-valued parameters and measures how far quantization drifts.

use std::collections::HashMap;

use crate::error::{CompileError, CompileResult};
use crate::ir::graph::{Graph, TensorId};
use crate::ir::op::OpKind;
use crate::kernels::{self, naive, MatmulDims};

pub type Values<T> = HashMap<TensorId, Vec<T>>;

fn not_quantized(op: &str) -> CompileError {
    CompileError::Graph(format!("operator `{op}` has no requantization parameters"))
}

fn fetch<'a, T>(graph: &Graph, values: &'a Values<T>, id: TensorId) -> CompileResult<&'a [T]> {
    values
        .get(&id)
        .map(Vec::as_slice)
        .ok_or_else(|| CompileError::Graph(format!("no value bound for `{}`", graph.tensor(id).name)))
}

fn bind_inputs<T: Clone>(graph: &Graph, inputs: &Values<T>) -> CompileResult<Values<T>> {
    let mut values = Values::new();
    for id in graph.placeholders() {
        let t = graph.tensor(id);
        let data = inputs
            .get(&id)
            .ok_or_else(|| CompileError::Graph(format!("missing input `{}`", t.name)))?;
        if data.len() != t.num_elements() {
            return Err(CompileError::Graph(format!(
                "input `{}` has {} values, expected {}",
                t.name,
                data.len(),
                t.num_elements()
            )));
        }
        values.insert(id, data.clone());
    }
    Ok(values)
}

pub fn matmul_dims(graph: &Graph, a: TensorId, output: TensorId, transposed_b: bool) -> MatmulDims {
    let a = &graph.tensor(a).shape;
    let out = &graph.tensor(output).shape;
    MatmulDims {
        m: a[0],
        k: a[1],
        n: out[1],
        transposed_b,
    }
}

/// Evaluate every tensor in the quantized integer domain.
pub fn eval_quantized(graph: &Graph, inputs: &Values<i64>) -> CompileResult<Values<i64>> {
    let mut values = bind_inputs(graph, inputs)?;
    for t in &graph.tensors {
        if t.kind.is_parameter() {
            let ints = t.quantized.clone().ok_or_else(|| {
                CompileError::Graph(format!("parameter `{}` has not been quantized", t.name))
            })?;
            values.insert(t.id, ints);
        }
    }

    for op_id in graph.topo_order()? {
        let op = graph.op(op_id);
        let out = graph.tensor(op.output());
        let mut result = vec![0i64; out.num_elements()];
        match &op.kind {
            OpKind::Matmul(mm) => {
                let requant = mm.requant.as_ref().ok_or_else(|| not_quantized(&op.name))?;
                let bias = match mm.bias {
                    Some(id) => Some(fetch(graph, &values, id)?),
                    None => None,
                };
                kernels::matmul(
                    fetch(graph, &values, mm.a)?,
                    fetch(graph, &values, mm.b)?,
                    bias,
                    matmul_dims(graph, mm.a, mm.output, mm.transposed_b),
                    requant,
                    mm.act,
                    out.dtype,
                    &mut result,
                );
            }
            OpKind::Add(add) => {
                let requant = add.requant.as_ref().ok_or_else(|| not_quantized(&op.name))?;
                kernels::add(
                    fetch(graph, &values, add.lhs)?,
                    fetch(graph, &values, add.rhs)?,
                    requant,
                    out.dtype,
                    &mut result,
                );
            }
            OpKind::Normalize(norm) => {
                let requant = norm.requant.as_ref().ok_or_else(|| not_quantized(&op.name))?;
                kernels::normalize(
                    fetch(graph, &values, norm.input)?,
                    fetch(graph, &values, norm.scale)?,
                    fetch(graph, &values, norm.shift)?,
                    out.innermost(),
                    requant,
                    norm.act,
                    out.dtype,
                    &mut result,
                );
            }
            OpKind::Activation(act) => {
                let requant = act.requant.as_ref().ok_or_else(|| not_quantized(&op.name))?;
                kernels::activation(
                    fetch(graph, &values, act.input)?,
                    act.func,
                    requant,
                    out.dtype,
                    &mut result,
                );
            }
        }
        values.insert(op.output(), result);
    }
    Ok(values)
}

/// Evaluate every tensor with real arithmetic on the unquantized parameters.
pub fn eval_float(graph: &Graph, inputs: &Values<f64>) -> CompileResult<Values<f64>> {
    let mut values = bind_inputs(graph, inputs)?;
    for t in &graph.tensors {
        if let Some(data) = t.kind.values() {
            values.insert(t.id, data.to_vec());
        }
    }

    for op_id in graph.topo_order()? {
        let op = graph.op(op_id);
        let out = graph.tensor(op.output());
        let mut result = vec![0.0; out.num_elements()];
        match &op.kind {
            OpKind::Matmul(mm) => {
                let bias = match mm.bias {
                    Some(id) => Some(fetch(graph, &values, id)?),
                    None => None,
                };
                naive::matmul(
                    fetch(graph, &values, mm.a)?,
                    fetch(graph, &values, mm.b)?,
                    bias,
                    matmul_dims(graph, mm.a, mm.output, mm.transposed_b),
                    mm.act,
                    &mut result,
                );
            }
            OpKind::Add(add) => naive::add(
                fetch(graph, &values, add.lhs)?,
                fetch(graph, &values, add.rhs)?,
                &mut result,
            ),
            OpKind::Normalize(norm) => naive::normalize(
                fetch(graph, &values, norm.input)?,
                fetch(graph, &values, norm.scale)?,
                fetch(graph, &values, norm.shift)?,
                norm.act,
                &mut result,
            ),
            OpKind::Activation(act) => {
                naive::activation(fetch(graph, &values, act.input)?, act.func, &mut result)
            }
        }
        values.insert(op.output(), result);
    }
    Ok(values)
}

/// How far dequantized results are from real arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Drift {
    pub max_abs_error: f64,
    /// Relative to the magnitude of the float result, ignoring values near zero.
    pub max_rel_error: f64,
}

pub fn drift(quantized: &[i64], scale_factor: f64, float: &[f64]) -> Drift {
    let peak = float.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let floor = peak * 1e-3;
    quantized
        .iter()
        .zip(float)
        .fold(Drift::default(), |acc, (&q, &f)| {
            let err = (q as f64 / scale_factor - f).abs();
            let rel = if f.abs() > floor { err / f.abs() } else { 0.0 };
            Drift {
                max_abs_error: acc.max_abs_error.max(err),
                max_rel_error: acc.max_rel_error.max(rel),
            }
        })
}
