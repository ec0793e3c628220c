//! Operator kernels.
//!
//! - `naive`: floating-point reference implementations
//! - Root module: fixed-point kernels, bit-exact with the generated hardware
//!
//! All buffers are row-major over the logical shape. Accumulation happens in
//! `i128`, saturating for 64-bit operands, activations are applied in the
//! accumulator domain, and the result is rescaled once and saturated to the
//! output dtype.

pub mod naive;

use crate::ir::fixed::round_shift;
use crate::ir::graph::DType;
use crate::ir::op::{ActFunc, AddRequant, Requant};

/// Matmul problem size. `b` is `[k, n]`, or `[n, k]` when `transposed_b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub transposed_b: bool,
}

impl MatmulDims {
    #[inline]
    pub fn b_index(&self, k: usize, n: usize) -> usize {
        if self.transposed_b {
            n * self.k + k
        } else {
            k * self.n + n
        }
    }
}

/// Apply the optional activation to an accumulator, rescale, and saturate.
#[inline]
pub fn finish(acc: i128, requant: &Requant, act: Option<ActFunc>, dtype: DType) -> i64 {
    let acc = match act {
        None => acc,
        Some(ActFunc::Relu) => acc.max(0),
        Some(ActFunc::LeakyRelu { .. }) if acc < 0 => requant.slope.map_or(0, |s| s.apply(acc)),
        Some(ActFunc::LeakyRelu { .. }) => acc,
    };
    dtype.saturate(requant.out.apply(acc))
}

/// Fixed-point matrix multiply: `C[m, n] = act(A[m, k] @ B + bias[n])`
#[allow(clippy::too_many_arguments)]
pub fn matmul(
    a: &[i64],
    b: &[i64],
    bias: Option<&[i64]>,
    dims: MatmulDims,
    requant: &Requant,
    act: Option<ActFunc>,
    dtype: DType,
    output: &mut [i64],
) {
    for row in 0..dims.m {
        for col in 0..dims.n {
            output[row * dims.n + col] =
                matmul_element(a, b, bias, dims, requant, act, dtype, row, col);
        }
    }
}

/// One output element of [`matmul`]; the hardware model evaluates elements in its own order.
#[allow(clippy::too_many_arguments)]
#[inline]
pub fn matmul_element(
    a: &[i64],
    b: &[i64],
    bias: Option<&[i64]>,
    dims: MatmulDims,
    requant: &Requant,
    act: Option<ActFunc>,
    dtype: DType,
    row: usize,
    col: usize,
) -> i64 {
    let mut acc: i128 = 0;
    for k in 0..dims.k {
        acc = acc.saturating_add(a[row * dims.k + k] as i128 * b[dims.b_index(k, col)] as i128);
    }
    if let (Some(bias), Some(bias_mul)) = (bias, requant.bias) {
        acc = acc.saturating_add(bias_mul.apply(bias[col] as i128));
    }
    finish(acc, requant, act, dtype)
}

/// Fixed-point elementwise add. `rhs` is either `lhs.len()` long or one innermost row.
pub fn add(lhs: &[i64], rhs: &[i64], requant: &AddRequant, dtype: DType, output: &mut [i64]) {
    for (i, out) in output.iter_mut().enumerate() {
        *out = add_element(lhs[i], rhs[i % rhs.len()], requant, dtype);
    }
}

#[inline]
pub fn add_element(lhs: i64, rhs: i64, requant: &AddRequant, dtype: DType) -> i64 {
    let sum = (lhs as i128 * requant.lhs_mul as i128)
        .saturating_add(rhs as i128 * requant.rhs_mul as i128);
    dtype.saturate(round_shift(sum, requant.rshift))
}

/// Fixed-point folded batch norm over the innermost axis of length `channels`.
#[allow(clippy::too_many_arguments)]
pub fn normalize(
    input: &[i64],
    scale: &[i64],
    shift: &[i64],
    channels: usize,
    requant: &Requant,
    act: Option<ActFunc>,
    dtype: DType,
    output: &mut [i64],
) {
    for (i, out) in output.iter_mut().enumerate() {
        let c = i % channels;
        *out = normalize_element(input[i], scale[c], shift[c], requant, act, dtype);
    }
}

#[inline]
pub fn normalize_element(
    x: i64,
    scale: i64,
    shift: i64,
    requant: &Requant,
    act: Option<ActFunc>,
    dtype: DType,
) -> i64 {
    let mut acc = x as i128 * scale as i128;
    if let Some(shift_mul) = requant.bias {
        acc = acc.saturating_add(shift_mul.apply(shift as i128));
    }
    finish(acc, requant, act, dtype)
}

/// Fixed-point standalone activation; the accumulator is the input itself.
pub fn activation(input: &[i64], func: ActFunc, requant: &Requant, dtype: DType, output: &mut [i64]) {
    for (x, out) in input.iter().zip(output.iter_mut()) {
        *out = finish(*x as i128, requant, Some(func), dtype);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::fixed::FixedMul;

    fn identity() -> Requant {
        Requant {
            out: FixedMul::IDENTITY,
            bias: Some(FixedMul::IDENTITY),
            slope: None,
        }
    }

    #[test]
    fn matmul_identity_requant_is_exact() {
        // [[1, 2], [3, 4]] @ [[5, 6], [7, 8]] + [1, -1]
        let a = [1, 2, 3, 4];
        let b = [5, 6, 7, 8];
        let bias = [1, -1];
        let dims = MatmulDims {
            m: 2,
            k: 2,
            n: 2,
            transposed_b: false,
        };
        let mut out = [0; 4];
        matmul(&a, &b, Some(&bias), dims, &identity(), None, DType::int(32), &mut out);
        assert_eq!(out, [20, 21, 44, 49]);
    }

    #[test]
    fn transposed_b_matches() {
        let a = [1, 2, 3, 4];
        let bt = [5, 7, 6, 8];
        let dims = MatmulDims {
            m: 2,
            k: 2,
            n: 2,
            transposed_b: true,
        };
        let mut out = [0; 4];
        matmul(&a, &bt, None, dims, &identity(), None, DType::int(32), &mut out);
        assert_eq!(out, [19, 22, 43, 50]);
    }

    #[test]
    fn output_saturates() {
        let dims = MatmulDims {
            m: 1,
            k: 2,
            n: 1,
            transposed_b: false,
        };
        let mut out = [0; 1];
        matmul(&[100, 100], &[100, 100], None, dims, &identity(), None, DType::int(8), &mut out);
        assert_eq!(out, [127]);
    }

    #[test]
    fn wide_accumulation_saturates() {
        // 8 products of i64 extremes exceed i128
        let dims = MatmulDims {
            m: 2,
            k: 8,
            n: 2,
            transposed_b: false,
        };
        let big = i64::MAX;
        let mut out = [0; 4];
        let neg: Vec<i64> = (0..16).map(|i| if i % 2 == 0 { big } else { -big }).collect();
        matmul(&[big; 16], &neg, None, dims, &identity(), None, DType::int(64), &mut out);
        assert_eq!(out, [i64::MAX, i64::MIN, i64::MAX, i64::MIN]);

        let requant = AddRequant {
            lhs_mul: i64::MAX,
            rhs_mul: i64::MAX,
            rshift: 0,
        };
        assert_eq!(add_element(i64::MAX, i64::MAX, &requant, DType::int(64)), i64::MAX);
    }

    #[test]
    fn leaky_applies_slope_to_negatives() {
        let requant = Requant {
            out: FixedMul::IDENTITY,
            bias: None,
            slope: FixedMul::from_ratio(0.25),
        };
        let mut out = [0; 3];
        activation(
            &[-8, 0, 8],
            ActFunc::LeakyRelu { slope: 0.25 },
            &requant,
            DType::int(8),
            &mut out,
        );
        assert_eq!(out, [-2, 0, 8]);
    }

    #[test]
    fn add_broadcasts_row() {
        let requant = AddRequant {
            lhs_mul: 2,
            rhs_mul: 1,
            rshift: 1,
        };
        let mut out = [0; 4];
        add(&[1, 2, 3, 4], &[10, 20], &requant, DType::int(16), &mut out);
        // (2*l + r) / 2, halves away from zero
        assert_eq!(out, [6, 12, 8, 14]);
    }

    #[test]
    fn normalize_per_channel() {
        let mut out = [0; 4];
        normalize(
            &[1, -2, 3, -4],
            &[2, 3],
            &[1, 1],
            2,
            &identity(),
            Some(ActFunc::Relu),
            DType::int(8),
            &mut out,
        );
        assert_eq!(out, [3, 0, 7, 0]);
    }
}
