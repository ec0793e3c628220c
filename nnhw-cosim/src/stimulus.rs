//! Test vectors and expected results.
//!
//! Inputs are drawn from a seeded RNG inside each placeholder's quantized
//! range, so a given seed always produces the same run. References come from
//! the fixed-point evaluator.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nnhw_compiler::eval::{drift, eval_float, eval_quantized, Drift, Values};
use nnhw_compiler::ir::graph::{Graph, Tensor, TensorId};

use crate::error::{SimError, SimResult};

#[derive(Debug, Clone)]
pub struct Stimulus {
    pub inputs: Values<i64>,
    /// Expected values per output tensor.
    pub references: Values<i64>,
}

/// Integer bounds of `t`'s quantized range, clamped to its dtype.
fn int_bounds(t: &Tensor) -> SimResult<(i64, i64)> {
    let q = t.quant.as_ref().ok_or_else(|| SimError::Layout {
        tensor: t.name.clone(),
        reason: "not quantized".into(),
    })?;
    let lo = ((q.range.0 * q.scale_factor).ceil() as i64).max(t.dtype.min_value());
    let hi = ((q.range.1 * q.scale_factor).floor() as i64).min(t.dtype.max_value());
    Ok((lo.min(hi), hi))
}

impl Stimulus {
    /// Random inputs for every placeholder and the references they imply.
    pub fn generate(graph: &Graph, seed: u64) -> SimResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut inputs = Values::new();
        for id in graph.placeholders() {
            let t = graph.tensor(id);
            let (lo, hi) = int_bounds(t)?;
            let data = (0..t.num_elements())
                .map(|_| rng.gen_range(lo..=hi))
                .collect();
            log::debug!("stimulus `{}`: {} values in [{lo}, {hi}]", t.name, t.num_elements());
            inputs.insert(id, data);
        }
        Self::with_inputs(graph, inputs)
    }

    pub fn with_inputs(graph: &Graph, inputs: Values<i64>) -> SimResult<Self> {
        let mut all = eval_quantized(graph, &inputs)?;
        let references = graph
            .outputs()
            .into_iter()
            .filter_map(|id| all.remove(&id).map(|v| (id, v)))
            .collect();
        Ok(Stimulus { inputs, references })
    }

    pub fn reference(&self, output: TensorId) -> Option<&[i64]> {
        self.references.get(&output).map(Vec::as_slice)
    }

    /// Per-output distance between the dequantized references and real arithmetic
    /// on the dequantized inputs.
    pub fn drift(&self, graph: &Graph) -> SimResult<HashMap<String, Drift>> {
        let mut real = Values::new();
        for (&id, ints) in &self.inputs {
            let t = graph.tensor(id);
            let scale = t.scale_factor().ok_or_else(|| SimError::Layout {
                tensor: t.name.clone(),
                reason: "not quantized".into(),
            })?;
            real.insert(id, ints.iter().map(|&v| v as f64 / scale).collect());
        }
        let float = eval_float(graph, &real)?;
        let mut report = HashMap::new();
        for (&id, quantized) in &self.references {
            let t = graph.tensor(id);
            if let (Some(scale), Some(expected)) = (t.scale_factor(), float.get(&id)) {
                report.insert(t.name.clone(), drift(quantized, scale, expected));
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnhw_compiler::ingest::GraphBuilder;
    use nnhw_compiler::ir::graph::DType;
    use nnhw_compiler::ir::op::ActFunc;
    use nnhw_compiler::quantize::{quantize, ValueRanges};

    fn relu_graph() -> Graph {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", vec![4, 8], DType::int(16)).unwrap();
        let y = b.activation("relu", x, ActFunc::Relu, DType::int(16)).unwrap();
        b.output(y).unwrap();
        let ranges = ValueRanges::from([("x".to_string(), (-120.0, 120.0))]);
        quantize(b.finish().unwrap(), &ranges).unwrap().into_graph()
    }

    #[test]
    fn same_seed_same_vectors() {
        let g = relu_graph();
        let a = Stimulus::generate(&g, 7).unwrap();
        let b = Stimulus::generate(&g, 7).unwrap();
        let c = Stimulus::generate(&g, 8).unwrap();
        assert_eq!(a.inputs, b.inputs);
        assert_ne!(a.inputs, c.inputs);
    }

    #[test]
    fn inputs_stay_in_range() {
        let g = relu_graph();
        let stim = Stimulus::generate(&g, 1).unwrap();
        let x = g.tensor_by_name("x").unwrap();
        assert!(stim.inputs[&x].iter().all(|v| (-127..=127).contains(v)));
        let y = g.tensor_by_name("relu").unwrap();
        assert!(stim.reference(y).unwrap().iter().all(|&v| v >= 0));
    }

    #[test]
    fn relu_drift_is_rounding_only() {
        let g = relu_graph();
        let stim = Stimulus::generate(&g, 3).unwrap();
        let report = stim.drift(&g).unwrap();
        // half an output step at most
        assert!(report["relu"].max_abs_error < 0.01, "{:?}", report["relu"]);
    }
}
