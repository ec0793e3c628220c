//! Hardware operators.
//! Each op maps to one hardware block and one fixed-point kernel.

use crate::ir::fixed::FixedMul;
use crate::ir::graph::TensorId;

pub type OpId = usize;

#[derive(Debug, Clone)]
pub struct Operator {
    pub id: OpId,
    pub name: String,
    pub kind: OpKind,
}

#[derive(Debug, Clone)]
pub enum OpKind {
    /// `output[m, n] = act(sum_k a[m, k] * b[k, n] + bias[n])`
    Matmul(Matmul),

    /// Elementwise add; `rhs` may be 1-D, broadcast along the innermost axis.
    Add(Add),

    /// Folded batch normalization: `act(x * scale[c] + shift[c])` over the innermost axis.
    Normalize(Normalize),

    /// Standalone activation.
    Activation(Activation),
}

#[derive(Debug, Clone)]
pub struct Matmul {
    pub a: TensorId,
    pub b: TensorId,
    pub bias: Option<TensorId>,
    pub output: TensorId,
    /// `b` is stored `[N, K]` instead of `[K, N]`.
    pub transposed_b: bool,
    pub act: Option<ActFunc>,
    pub attrs: Option<MatmulAttrs>,
    pub requant: Option<Requant>,
}

#[derive(Debug, Clone)]
pub struct Add {
    pub lhs: TensorId,
    pub rhs: TensorId,
    pub output: TensorId,
    pub attrs: Option<LaneAttrs>,
    pub requant: Option<AddRequant>,
}

#[derive(Debug, Clone)]
pub struct Normalize {
    pub input: TensorId,
    pub scale: TensorId,
    pub shift: TensorId,
    pub output: TensorId,
    pub act: Option<ActFunc>,
    pub attrs: Option<LaneAttrs>,
    pub requant: Option<Requant>,
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub input: TensorId,
    pub output: TensorId,
    pub func: ActFunc,
    pub attrs: Option<LaneAttrs>,
    pub requant: Option<Requant>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActFunc {
    Relu,
    LeakyRelu { slope: f64 },
}

impl ActFunc {
    pub fn apply_f64(&self, x: f64) -> f64 {
        match *self {
            ActFunc::Relu => x.max(0.0),
            ActFunc::LeakyRelu { slope } => {
                if x < 0.0 {
                    x * slope
                } else {
                    x
                }
            }
        }
    }

    /// Range of the activation given the range of its input.
    pub fn apply_range(&self, (lo, hi): (f64, f64)) -> (f64, f64) {
        (self.apply_f64(lo), self.apply_f64(hi))
    }
}

/// Which matmul operand stays resident while the other streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stationary {
    Left,
    #[default]
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulAttrs {
    /// Reduction-axis elements consumed per cycle.
    pub par_left_col: usize,
    /// Left rows processed together.
    pub par_left_row: usize,
    /// Output columns produced per cycle.
    pub par_out_col: usize,
    /// Output columns kept in flight (on-chip accumulator depth).
    pub concur_out_col: usize,
    pub stationary: Stationary,
}

impl Default for MatmulAttrs {
    fn default() -> Self {
        MatmulAttrs {
            par_left_col: 1,
            par_left_row: 1,
            par_out_col: 1,
            concur_out_col: 1,
            stationary: Stationary::Right,
        }
    }
}

/// Parallelism of an elementwise operator: elements per cycle along the innermost axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneAttrs {
    pub par: usize,
}

impl Default for LaneAttrs {
    fn default() -> Self {
        LaneAttrs { par: 1 }
    }
}

/// Integer rescaling of an accumulator into the output scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requant {
    /// Accumulator scale to output scale.
    pub out: FixedMul,
    /// Bias (or shift) scale to accumulator scale.
    pub bias: Option<FixedMul>,
    /// Negative-side slope of a leaky activation, applied in the accumulator domain.
    pub slope: Option<FixedMul>,
}

/// Two-operand rescale sharing one right shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddRequant {
    pub lhs_mul: i64,
    pub rhs_mul: i64,
    pub rshift: u32,
}

impl Operator {
    pub fn inputs(&self) -> Vec<TensorId> {
        match &self.kind {
            OpKind::Matmul(mm) => {
                let mut v = vec![mm.a, mm.b];
                if let Some(bias) = mm.bias {
                    v.push(bias);
                }
                v
            }
            OpKind::Add(add) => vec![add.lhs, add.rhs],
            OpKind::Normalize(norm) => vec![norm.input, norm.scale, norm.shift],
            OpKind::Activation(act) => vec![act.input],
        }
    }

    pub fn output(&self) -> TensorId {
        match &self.kind {
            OpKind::Matmul(Matmul { output, .. })
            | OpKind::Add(Add { output, .. })
            | OpKind::Normalize(Normalize { output, .. })
            | OpKind::Activation(Activation { output, .. }) => *output,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            OpKind::Matmul(_) => "matmul",
            OpKind::Add(_) => "add",
            OpKind::Normalize(_) => "normalize",
            OpKind::Activation(_) => "activation",
        }
    }

    /// Output columns produced per cycle.
    pub fn out_par(&self) -> usize {
        match &self.kind {
            OpKind::Matmul(mm) => mm.attrs.unwrap_or_default().par_out_col,
            OpKind::Add(Add { attrs, .. })
            | OpKind::Normalize(Normalize { attrs, .. })
            | OpKind::Activation(Activation { attrs, .. }) => attrs.unwrap_or_default().par,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        match &self.kind {
            OpKind::Matmul(mm) => mm.attrs.is_some(),
            OpKind::Add(Add { attrs, .. })
            | OpKind::Normalize(Normalize { attrs, .. })
            | OpKind::Activation(Activation { attrs, .. }) => attrs.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matmul(bias: Option<TensorId>) -> Operator {
        Operator {
            id: 0,
            name: "mm".into(),
            kind: OpKind::Matmul(Matmul {
                a: 0,
                b: 1,
                bias,
                output: 3,
                transposed_b: false,
                act: None,
                attrs: None,
                requant: None,
            }),
        }
    }

    #[test]
    fn operands_in_order() {
        assert_eq!(matmul(Some(2)).inputs(), vec![0, 1, 2]);
        assert_eq!(matmul(None).inputs(), vec![0, 1]);
        assert_eq!(matmul(None).output(), 3);
    }

    #[test]
    fn defaults_until_scheduled() {
        let mut op = matmul(None);
        assert!(!op.is_scheduled());
        assert_eq!(op.out_par(), 1);
        if let OpKind::Matmul(mm) = &mut op.kind {
            mm.attrs = Some(MatmulAttrs {
                par_out_col: 4,
                concur_out_col: 8,
                ..MatmulAttrs::default()
            });
        }
        assert!(op.is_scheduled());
        assert_eq!(op.out_par(), 4);
    }

    #[test]
    fn leaky_range() {
        let act = ActFunc::LeakyRelu { slope: 0.1 };
        assert_eq!(act.apply_range((-10.0, 5.0)), (-1.0, 5.0));
        assert_eq!(ActFunc::Relu.apply_range((-10.0, 5.0)), (0.0, 5.0));
        assert_eq!(ActFunc::Relu.apply_range((-10.0, -5.0)), (0.0, 0.0));
    }
}
