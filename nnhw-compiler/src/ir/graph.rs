//! Core graph types: tensors, their lifecycle kinds, and structural queries.

use std::collections::HashMap;
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::error::{CompileError, CompileResult};
use crate::ir::op::{OpId, Operator};

pub type TensorId = usize;

/// Fixed-point element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub width: u32,
    pub signed: bool,
}

impl DType {
    pub fn new(width: u32, signed: bool) -> CompileResult<Self> {
        if width == 0 || width > 64 {
            return Err(CompileError::Graph(format!(
                "unsupported element width {width} (expected 1..=64)"
            )));
        }
        Ok(DType { width, signed })
    }

    pub const fn int(width: u32) -> Self {
        DType {
            width,
            signed: true,
        }
    }

    pub const fn uint(width: u32) -> Self {
        DType {
            width,
            signed: false,
        }
    }

    /// Largest representable value.
    pub fn max_value(&self) -> i64 {
        if self.signed {
            ((1i128 << (self.width - 1)) - 1) as i64
        } else {
            ((1i128 << self.width) - 1).min(i64::MAX as i128) as i64
        }
    }

    /// Smallest representable value.
    pub fn min_value(&self) -> i64 {
        if self.signed {
            (-(1i128 << (self.width - 1))) as i64
        } else {
            0
        }
    }

    pub fn saturate(&self, v: i128) -> i64 {
        v.clamp(self.min_value() as i128, self.max_value() as i128) as i64
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.signed { "int" } else { "uint" };
        write!(f, "{prefix}{}", self.width)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorKind {
    /// Graph input, bound fresh on every run.
    Placeholder,
    /// Trained parameter, serialized into the parameter blob.
    Variable { values: Vec<f64> },
    /// Fixed parameter, serialized into the parameter blob after variables.
    Constant { values: Vec<f64> },
    /// Operator result consumed only inside the graph.
    Intermediate,
    /// Operator result returned to the caller.
    Output,
}

impl TensorKind {
    pub fn is_parameter(&self) -> bool {
        matches!(self, TensorKind::Variable { .. } | TensorKind::Constant { .. })
    }

    pub fn values(&self) -> Option<&[f64]> {
        match self {
            TensorKind::Variable { values } | TensorKind::Constant { values } => Some(values),
            _ => None,
        }
    }
}

/// Where a tensor's value range came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSource {
    Declared,
    Observed,
    Propagated,
}

/// Numeric semantics assigned by the quantizer.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    /// Quantized integer = round(real * scale_factor).
    pub scale_factor: f64,
    /// Effective bit width, never larger than the declared dtype width.
    pub width: u32,
    pub range: (f64, f64),
    pub source: RangeSource,
}

/// Shape padded to parallelism and burst boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignedLayout {
    pub shape: Vec<usize>,
    /// Lane unit of the innermost axis (elements per transfer).
    pub lanes: usize,
}

impl AlignedLayout {
    /// Row-major element strides of the aligned shape.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.shape.len()];
        for axis in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.shape[axis + 1];
        }
        strides
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone)]
pub struct Tensor {
    pub id: TensorId,
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub kind: TensorKind,
    /// Axis reordering relative to the framework layout the model came from.
    pub perm: Option<Vec<usize>>,
    pub quant: Option<QuantParams>,
    /// Quantized parameter values, present for variables and constants after quantization.
    pub quantized: Option<Vec<i64>>,
    pub aligned: Option<AlignedLayout>,
    addr: Option<u64>,
}

impl Tensor {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn scale_factor(&self) -> Option<f64> {
        self.quant.as_ref().map(|q| q.scale_factor)
    }

    pub fn addr(&self) -> Option<u64> {
        self.addr
    }

    /// Assign the memory address. Addresses are immutable once set.
    pub fn assign_addr(&mut self, addr: u64) -> CompileResult<()> {
        match self.addr {
            Some(existing) if existing != addr => Err(CompileError::Graph(format!(
                "address of `{}` already assigned ({existing:#x}), refusing {addr:#x}",
                self.name
            ))),
            _ => {
                self.addr = Some(addr);
                Ok(())
            }
        }
    }

    /// Bytes occupied in the memory image (aligned shape, bit-packed).
    pub fn memory_size(&self) -> u64 {
        let elems = self
            .aligned
            .as_ref()
            .map_or(self.num_elements(), |a| a.num_elements());
        (elems as u64 * self.dtype.width as u64).div_ceil(8)
    }

    pub fn innermost(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Inverse of `perm`: maps graph layout back to the framework layout.
    pub fn reversed_perm(&self) -> Option<Vec<usize>> {
        self.perm.as_ref().map(|perm| {
            let mut rev = vec![0; perm.len()];
            for (i, &p) in perm.iter().enumerate() {
                rev[p] = i;
            }
            rev
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub tensors: Vec<Tensor>,
    pub ops: Vec<Operator>,
    names: HashMap<String, TensorId>,
    op_names: HashMap<String, OpId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    pub fn op(&self, id: OpId) -> &Operator {
        &self.ops[id]
    }

    pub fn op_mut(&mut self, id: OpId) -> &mut Operator {
        &mut self.ops[id]
    }

    pub fn add_tensor(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        dtype: DType,
        kind: TensorKind,
    ) -> CompileResult<TensorId> {
        if self.names.contains_key(name) {
            return Err(CompileError::Graph(format!("duplicate tensor name `{name}`")));
        }
        if shape.is_empty() || shape.contains(&0) {
            return Err(CompileError::Graph(format!(
                "tensor `{name}` has invalid shape {shape:?} (dimensions must be positive)"
            )));
        }
        if let Some(values) = kind.values() {
            let elems: usize = shape.iter().product();
            if values.len() != elems {
                return Err(CompileError::Graph(format!(
                    "tensor `{name}` has {} values for shape {shape:?} ({elems} elements)",
                    values.len()
                )));
            }
        }
        let id = self.tensors.len();
        self.tensors.push(Tensor {
            id,
            name: name.to_string(),
            shape,
            dtype,
            kind,
            perm: None,
            quant: None,
            quantized: None,
            aligned: None,
            addr: None,
        });
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    pub(crate) fn add_op(&mut self, op: Operator) -> CompileResult<OpId> {
        if self.op_names.contains_key(&op.name) {
            return Err(CompileError::Graph(format!(
                "duplicate operator name `{}`",
                op.name
            )));
        }
        let id = self.ops.len();
        self.op_names.insert(op.name.clone(), id);
        self.ops.push(Operator { id, ..op });
        Ok(id)
    }

    pub fn tensor_by_name(&self, name: &str) -> Option<TensorId> {
        self.names.get(name).copied()
    }

    pub fn op_by_name(&self, name: &str) -> Option<OpId> {
        self.op_names.get(name).copied()
    }

    fn ids_where(&self, pred: impl Fn(&TensorKind) -> bool) -> Vec<TensorId> {
        self.tensors
            .iter()
            .filter(|t| pred(&t.kind))
            .map(|t| t.id)
            .collect()
    }

    /// Placeholders in declaration order.
    pub fn placeholders(&self) -> Vec<TensorId> {
        self.ids_where(|k| matches!(k, TensorKind::Placeholder))
    }

    pub fn variables(&self) -> Vec<TensorId> {
        self.ids_where(|k| matches!(k, TensorKind::Variable { .. }))
    }

    pub fn constants(&self) -> Vec<TensorId> {
        self.ids_where(|k| matches!(k, TensorKind::Constant { .. }))
    }

    pub fn outputs(&self) -> Vec<TensorId> {
        self.ids_where(|k| matches!(k, TensorKind::Output))
    }

    pub fn intermediates(&self) -> Vec<TensorId> {
        self.ids_where(|k| matches!(k, TensorKind::Intermediate))
    }

    /// `(name, id)` view of a tensor list, e.g. `graph.named(&graph.placeholders())`.
    pub fn named(&self, ids: &[TensorId]) -> Vec<(&str, TensorId)> {
        ids.iter()
            .map(|&id| (self.tensor(id).name.as_str(), id))
            .collect()
    }

    /// Operators in declaration order.
    pub fn operators(&self) -> Vec<(&str, OpId)> {
        self.ops.iter().map(|op| (op.name.as_str(), op.id)).collect()
    }

    /// Operator writing `id`, if any.
    pub fn producer(&self, id: TensorId) -> Option<OpId> {
        self.ops.iter().find(|op| op.output() == id).map(|op| op.id)
    }

    pub fn consumers(&self, id: TensorId) -> Vec<OpId> {
        self.ops
            .iter()
            .filter(|op| op.inputs().contains(&id))
            .map(|op| op.id)
            .collect()
    }

    /// Operators ordered so every producer precedes its consumers.
    pub fn topo_order(&self) -> CompileResult<Vec<OpId>> {
        let mut deps: DiGraph<OpId, TensorId> = DiGraph::new();
        let nodes: Vec<_> = self.ops.iter().map(|op| deps.add_node(op.id)).collect();

        let mut producers = HashMap::new();
        for op in &self.ops {
            if let Some(prev) = producers.insert(op.output(), op.id) {
                return Err(CompileError::Graph(format!(
                    "tensor `{}` is written by both `{}` and `{}`",
                    self.tensor(op.output()).name,
                    self.op(prev).name,
                    op.name
                )));
            }
        }
        for op in &self.ops {
            for input in op.inputs() {
                if let Some(&src) = producers.get(&input) {
                    deps.add_edge(nodes[src], nodes[op.id], input);
                }
            }
        }

        let sorted = toposort(&deps, None).map_err(|cycle| {
            CompileError::Graph(format!(
                "operator `{}` is part of a dependency cycle",
                self.op(deps[cycle.node_id()]).name
            ))
        })?;
        Ok(sorted.into_iter().map(|n| deps[n]).collect())
    }
}
