//! Naive floating-point reference implementations.
//! Used to measure how far the fixed-point results drift from real arithmetic.

use super::MatmulDims;
use crate::ir::op::ActFunc;

/// Matrix multiply with optional bias and activation (naive)
///
/// - `a`:    [M, K]
/// - `b`:    [K, N], or [N, K] when transposed
/// - `bias`: [N]
/// - `output`: [M, N]
pub fn matmul(
    a: &[f64],
    b: &[f64],
    bias: Option<&[f64]>,
    dims: MatmulDims,
    act: Option<ActFunc>,
    output: &mut [f64],
) {
    for row in 0..dims.m {
        for col in 0..dims.n {
            let mut sum = bias.map_or(0.0, |b| b[col]);
            for k in 0..dims.k {
                sum += a[row * dims.k + k] * b[dims.b_index(k, col)];
            }
            output[row * dims.n + col] = act.map_or(sum, |f| f.apply_f64(sum));
        }
    }
}

/// Element-wise add, `rhs` repeating when it is a single innermost row.
pub fn add(lhs: &[f64], rhs: &[f64], output: &mut [f64]) {
    for (i, out) in output.iter_mut().enumerate() {
        *out = lhs[i] + rhs[i % rhs.len()];
    }
}

/// Folded batch norm: `x * scale[c] + shift[c]`
pub fn normalize(
    input: &[f64],
    scale: &[f64],
    shift: &[f64],
    act: Option<ActFunc>,
    output: &mut [f64],
) {
    let channels = scale.len();
    for (i, out) in output.iter_mut().enumerate() {
        let c = i % channels;
        let y = input[i] * scale[c] + shift[c];
        *out = act.map_or(y, |f| f.apply_f64(y));
    }
}

pub fn activation(input: &[f64], func: ActFunc, output: &mut [f64]) {
    for (x, out) in input.iter().zip(output.iter_mut()) {
        *out = func.apply_f64(*x);
    }
}
