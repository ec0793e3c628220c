//! Graph construction.
//!
//! `GraphBuilder` is the ingestion surface: declare placeholders and
//! parameters, chain operators, then mark results as outputs. Every
//! constructor checks operand shapes so later stages can index freely.

use crate::error::{CompileError, CompileResult};
use crate::ir::graph::{DType, Graph, TensorId, TensorKind};
use crate::ir::op::{ActFunc, Activation, Add, Matmul, Normalize, OpKind, Operator};

#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn placeholder(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        dtype: DType,
    ) -> CompileResult<TensorId> {
        self.graph
            .add_tensor(name, shape, dtype, TensorKind::Placeholder)
    }

    pub fn variable(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        dtype: DType,
        values: Vec<f64>,
    ) -> CompileResult<TensorId> {
        check_finite(name, &values)?;
        self.graph
            .add_tensor(name, shape, dtype, TensorKind::Variable { values })
    }

    pub fn constant(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        dtype: DType,
        values: Vec<f64>,
    ) -> CompileResult<TensorId> {
        check_finite(name, &values)?;
        self.graph
            .add_tensor(name, shape, dtype, TensorKind::Constant { values })
    }

    /// `a [M, K] x b [K, N] (+ bias [N])`.
    pub fn matmul(
        &mut self,
        name: &str,
        a: TensorId,
        b: TensorId,
        bias: Option<TensorId>,
        dtype: DType,
    ) -> CompileResult<TensorId> {
        self.push_matmul(name, a, b, bias, false, None, dtype)
    }

    /// Dense layer with weights stored `[N, K]`: `act(x w^T + bias)`.
    pub fn linear(
        &mut self,
        name: &str,
        x: TensorId,
        w: TensorId,
        bias: Option<TensorId>,
        act: Option<ActFunc>,
        dtype: DType,
    ) -> CompileResult<TensorId> {
        self.push_matmul(name, x, w, bias, true, act, dtype)
    }

    #[allow(clippy::too_many_arguments)]
    fn push_matmul(
        &mut self,
        name: &str,
        a: TensorId,
        b: TensorId,
        bias: Option<TensorId>,
        transposed_b: bool,
        act: Option<ActFunc>,
        dtype: DType,
    ) -> CompileResult<TensorId> {
        let a_shape = self.shape_of(a)?;
        let b_shape = self.shape_of(b)?;
        if a_shape.len() != 2 || b_shape.len() != 2 {
            return Err(CompileError::Graph(format!(
                "`{name}`: matmul operands must be 2-D, got {a_shape:?} and {b_shape:?}"
            )));
        }
        let (k_b, n) = if transposed_b {
            (b_shape[1], b_shape[0])
        } else {
            (b_shape[0], b_shape[1])
        };
        if a_shape[1] != k_b {
            return Err(CompileError::Graph(format!(
                "`{name}`: reduction length mismatch ({} vs {k_b})",
                a_shape[1]
            )));
        }
        if let Some(bias) = bias {
            let bias_shape = self.shape_of(bias)?;
            if bias_shape != [n] {
                return Err(CompileError::Graph(format!(
                    "`{name}`: bias shape {bias_shape:?} does not match {n} output columns"
                )));
            }
        }
        check_act(name, act)?;
        let output = self.result(name, vec![a_shape[0], n], dtype)?;
        self.push_op(
            name,
            OpKind::Matmul(Matmul {
                a,
                b,
                bias,
                output,
                transposed_b,
                act,
                attrs: None,
                requant: None,
            }),
        )?;
        Ok(output)
    }

    /// Elementwise `lhs + rhs`; `rhs` is either the same shape or 1-D over the innermost axis.
    pub fn add(
        &mut self,
        name: &str,
        lhs: TensorId,
        rhs: TensorId,
        dtype: DType,
    ) -> CompileResult<TensorId> {
        let lhs_shape = self.shape_of(lhs)?;
        let rhs_shape = self.shape_of(rhs)?;
        let inner = lhs_shape.last().copied().unwrap_or(1);
        if rhs_shape != lhs_shape && rhs_shape != [inner] {
            return Err(CompileError::Graph(format!(
                "`{name}`: cannot broadcast {rhs_shape:?} onto {lhs_shape:?}"
            )));
        }
        let output = self.result(name, lhs_shape, dtype)?;
        self.push_op(
            name,
            OpKind::Add(Add {
                lhs,
                rhs,
                output,
                attrs: None,
                requant: None,
            }),
        )?;
        Ok(output)
    }

    /// Folded batch normalization, per innermost-axis channel.
    pub fn normalize(
        &mut self,
        name: &str,
        input: TensorId,
        scale: TensorId,
        shift: TensorId,
        act: Option<ActFunc>,
        dtype: DType,
    ) -> CompileResult<TensorId> {
        let shape = self.shape_of(input)?;
        let channels = shape.last().copied().unwrap_or(1);
        for operand in [scale, shift] {
            let operand_shape = self.shape_of(operand)?;
            if operand_shape != [channels] {
                return Err(CompileError::Graph(format!(
                    "`{name}`: `{}` has shape {operand_shape:?}, expected [{channels}]",
                    self.graph.tensor(operand).name
                )));
            }
        }
        check_act(name, act)?;
        let output = self.result(name, shape, dtype)?;
        self.push_op(
            name,
            OpKind::Normalize(Normalize {
                input,
                scale,
                shift,
                output,
                act,
                attrs: None,
                requant: None,
            }),
        )?;
        Ok(output)
    }

    pub fn activation(
        &mut self,
        name: &str,
        input: TensorId,
        func: ActFunc,
        dtype: DType,
    ) -> CompileResult<TensorId> {
        let shape = self.shape_of(input)?;
        check_act(name, Some(func))?;
        let output = self.result(name, shape, dtype)?;
        self.push_op(
            name,
            OpKind::Activation(Activation {
                input,
                output,
                func,
                attrs: None,
                requant: None,
            }),
        )?;
        Ok(output)
    }

    /// Mark an operator result as a graph output.
    pub fn output(&mut self, id: TensorId) -> CompileResult<()> {
        let tensor = self
            .graph
            .tensors
            .get_mut(id)
            .ok_or_else(|| CompileError::Graph(format!("unknown tensor id {id}")))?;
        match tensor.kind {
            TensorKind::Intermediate | TensorKind::Output => {
                tensor.kind = TensorKind::Output;
                Ok(())
            }
            _ => Err(CompileError::Graph(format!(
                "`{}` is not an operator result and cannot be an output",
                tensor.name
            ))),
        }
    }

    /// Record the axis permutation relating the graph layout to the source framework layout.
    pub fn permute(&mut self, id: TensorId, perm: Vec<usize>) -> CompileResult<()> {
        let rank = self.shape_of(id)?.len();
        let mut seen = vec![false; rank];
        for &axis in &perm {
            if axis >= rank || std::mem::replace(&mut seen[axis], true) {
                return Err(CompileError::Graph(format!(
                    "{perm:?} is not a permutation of {rank} axes"
                )));
            }
        }
        if perm.len() != rank {
            return Err(CompileError::Graph(format!(
                "{perm:?} is not a permutation of {rank} axes"
            )));
        }
        self.graph.tensor_mut(id).perm = Some(perm);
        Ok(())
    }

    /// Finish construction. The graph must be acyclic and expose at least one output.
    pub fn finish(self) -> CompileResult<Graph> {
        if self.graph.outputs().is_empty() {
            return Err(CompileError::Graph("graph has no outputs".into()));
        }
        self.graph.topo_order()?;
        log::debug!(
            "built graph: {} tensors, {} operators",
            self.graph.tensors.len(),
            self.graph.ops.len()
        );
        Ok(self.graph)
    }

    fn shape_of(&self, id: TensorId) -> CompileResult<Vec<usize>> {
        self.graph
            .tensors
            .get(id)
            .map(|t| t.shape.clone())
            .ok_or_else(|| CompileError::Graph(format!("unknown tensor id {id}")))
    }

    fn result(&mut self, name: &str, shape: Vec<usize>, dtype: DType) -> CompileResult<TensorId> {
        self.graph
            .add_tensor(name, shape, dtype, TensorKind::Intermediate)
    }

    fn push_op(&mut self, name: &str, kind: OpKind) -> CompileResult<()> {
        self.graph.add_op(Operator {
            id: 0,
            name: name.to_string(),
            kind,
        })?;
        Ok(())
    }
}

fn check_finite(name: &str, values: &[f64]) -> CompileResult<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(i) => Err(CompileError::Graph(format!(
            "`{name}` has a non-finite value at index {i}"
        ))),
        None => Ok(()),
    }
}

fn check_act(name: &str, act: Option<ActFunc>) -> CompileResult<()> {
    match act {
        Some(ActFunc::LeakyRelu { slope }) if !(slope.is_finite() && slope > 0.0) => {
            Err(CompileError::Graph(format!(
                "`{name}`: leaky relu slope must be positive, got {slope}"
            )))
        }
        _ => Ok(()),
    }
}
