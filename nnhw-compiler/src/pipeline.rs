//! End-to-end compilation: quantize, schedule, allocate, emit.
//!
//! Stages run strictly in order and the first failure aborts the run, so a
//! quantization error never reaches the backend.

use std::sync::Arc;

use crate::context::CompileContext;
use crate::emit::{Design, EmitBackend};
use crate::error::{CompileResult, Stage};
use crate::ir::graph::Graph;
use crate::memory::{param_blob, plan_memory};
use crate::quantize::{quantize, ValueRanges};
use crate::schedule::{schedule, AttrRequests};

/// A compiled design and the module the backend produced for it.
#[derive(Debug)]
pub struct Compilation<M> {
    pub design: Arc<Design>,
    pub module: M,
}

pub fn compile<B: EmitBackend>(
    ctx: &mut CompileContext,
    graph: Graph,
    ranges: &ValueRanges,
    requests: &AttrRequests,
    backend: &mut B,
) -> CompileResult<Compilation<B::Module>> {
    ctx.enter(Stage::Quantize);
    let quantized = quantize(graph, ranges)?;

    ctx.enter(Stage::Schedule);
    let scheduled = schedule(quantized, requests, ctx.config())?;

    ctx.enter(Stage::Allocate);
    let (mut graph, config) = scheduled.into_parts();
    let memory = plan_memory(&mut graph, config.chunk_size, config.memory_bound)?;
    let blob = param_blob(&graph, &memory)?;

    ctx.enter(Stage::Emit);
    let design = Arc::new(Design {
        name: ctx.module_name().to_string(),
        graph,
        memory,
        config,
        param_blob: blob,
    });
    let module = backend.emit(ctx, Arc::clone(&design))?;
    log::info!(
        "compiled `{}`: {} operators, {} byte image",
        design.name,
        design.graph.ops.len(),
        design.memory.end
    );
    Ok(Compilation { design, module })
}
