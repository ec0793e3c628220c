//! Built-in models the binary and the integration tests simulate.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nnhw_compiler::ingest::GraphBuilder;
use nnhw_compiler::ir::graph::{DType, Graph};
use nnhw_compiler::ir::op::ActFunc;
use nnhw_compiler::{
    compile, AttrRequest, AttrRequests, Compilation, CompileContext, HwConfig, ValueRanges,
};

use crate::behavioral::{BehavioralBackend, BehavioralModule};
use crate::clock::CycleClock;
use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::stimulus::Stimulus;
use crate::verifier::{Verifier, VerifyReport};

pub const SCENARIOS: &[&str] = &["matmul-add", "linear"];

/// A model plus everything the compiler needs besides the hardware config.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub graph: Graph,
    pub ranges: ValueRanges,
    pub requests: AttrRequests,
}

fn weights(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// `d = a @ b + c` over 15x15 int32 matrices; `b` is a trained weight.
pub fn matmul_add(par: usize, seed: u64) -> SimResult<Scenario> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dtype = DType::int(32);
    let mut b = GraphBuilder::new();
    let a = b.placeholder("a", vec![15, 15], dtype)?;
    let w = b.variable("b", vec![15, 15], dtype, weights(&mut rng, 15 * 15))?;
    let c = b.placeholder("c", vec![15, 15], dtype)?;
    let prod = b.matmul("matmul", a, w, None, dtype)?;
    let d = b.add("add", prod, c, dtype)?;
    b.output(d)?;

    Ok(Scenario {
        name: "matrix_multiply_add".into(),
        graph: b.finish()?,
        ranges: ValueRanges::from([
            ("a".to_string(), (-120.0, 120.0)),
            ("c".to_string(), (-120.0, 120.0)),
        ]),
        requests: AttrRequests::from([
            ("matmul".to_string(), AttrRequest::new().par_out_col(par)),
            ("add".to_string(), AttrRequest::new().par_out_col(par)),
        ]),
    })
}

/// Fully connected layer, folded batch norm, and leaky ReLU.
pub fn linear(par: usize, seed: u64) -> SimResult<Scenario> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dtype = DType::int(32);
    let mut b = GraphBuilder::new();
    let x = b.placeholder("act", vec![4, 15], dtype)?;
    let w = b.variable("fc.weight", vec![13, 15], dtype, weights(&mut rng, 13 * 15))?;
    let bias = b.variable("fc.bias", vec![13], dtype, weights(&mut rng, 13))?;
    let fc = b.linear("fc", x, w, Some(bias), None, dtype)?;
    let scale: Vec<f64> = (0..13).map(|_| rng.gen_range(0.5..1.5)).collect();
    let scale = b.variable("bn.scale", vec![13], dtype, scale)?;
    let shift = b.variable("bn.shift", vec![13], dtype, weights(&mut rng, 13))?;
    let leaky = Some(ActFunc::LeakyRelu { slope: 0.1 });
    let y = b.normalize("bn", fc, scale, shift, leaky, dtype)?;
    b.output(y)?;

    Ok(Scenario {
        name: "linear".into(),
        graph: b.finish()?,
        ranges: ValueRanges::from([("act".to_string(), (-120.0, 120.0))]),
        requests: AttrRequests::from([
            ("fc".to_string(), AttrRequest::new().par_out_col(par)),
            ("bn".to_string(), AttrRequest::new().par_out_col(par)),
        ]),
    })
}

pub fn by_name(name: &str, par: usize, seed: u64) -> SimResult<Scenario> {
    match name {
        "matmul-add" => matmul_add(par, seed),
        "linear" => linear(par, seed),
        other => Err(SimError::Config(format!(
            "unknown scenario `{other}` (expected one of {})",
            SCENARIOS.join(", ")
        ))),
    }
}

impl Scenario {
    pub fn compile(self, hw: HwConfig) -> SimResult<Compilation<BehavioralModule>> {
        let mut ctx = CompileContext::new(&self.name, hw)?;
        let mut backend = BehavioralBackend::new();
        Ok(compile(
            &mut ctx,
            self.graph,
            &self.ranges,
            &self.requests,
            &mut backend,
        )?)
    }

    /// Compile, generate stimulus from `sim.seed`, and verify on the behavioral model.
    pub fn run(self, hw: HwConfig, sim: SimConfig) -> SimResult<VerifyReport> {
        let compiled = self.compile(hw)?;
        let stimulus = Stimulus::generate(&compiled.design.graph, sim.seed)?;
        for (output, d) in stimulus.drift(&compiled.design.graph)? {
            log::info!(
                "{output}: max abs error {:.3e}, max rel error {:.3e}",
                d.max_abs_error,
                d.max_rel_error
            );
        }
        let mut verifier = Verifier::new(
            Arc::clone(&compiled.design),
            compiled.module,
            CycleClock::new(),
            stimulus,
            sim,
        )?;
        verifier.run()
    }
}
