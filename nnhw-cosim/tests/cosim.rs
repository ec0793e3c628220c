use std::sync::Arc;

use nnhw_compiler::emit::{ModuleHandle, Port};
use nnhw_compiler::ingest::GraphBuilder;
use nnhw_compiler::ir::graph::DType;
use nnhw_compiler::ir::op::ActFunc;
use nnhw_compiler::memory::RegionKind;
use nnhw_compiler::{
    compile, AttrRequest, AttrRequests, BurstPolicy, CompileContext, CompileError, HwConfig,
    ValueRanges,
};
use nnhw_cosim::scenario::{self, Scenario};
use nnhw_cosim::{
    BehavioralBackend, BehavioralModule, Clock, CycleClock, Dut, MemoryImage, SimConfig,
    SimError, SimResult, Stimulus, Verdict, Verifier, VerifierState,
};

fn verifier_for(
    scenario: Scenario,
    hw: HwConfig,
    sim: SimConfig,
) -> Verifier<BehavioralModule, CycleClock> {
    let compiled = scenario.compile(hw).unwrap();
    let stimulus = Stimulus::generate(&compiled.design.graph, sim.seed).unwrap();
    Verifier::new(
        Arc::clone(&compiled.design),
        compiled.module,
        CycleClock::new(),
        stimulus,
        sim,
    )
    .unwrap()
}

#[test]
fn matmul_add_int32_par2_passes() {
    let report = scenario::matmul_add(2, 0)
        .unwrap()
        .run(HwConfig::default(), SimConfig::default())
        .unwrap();
    assert_eq!(report.verdict, Verdict::Passed, "{:?}", report.mismatches);
    assert!(report.cycles > 0);
    assert_eq!(report.checked, 15 * 15);
    assert_eq!(report.handshake, 2);
    assert!(report.to_string().ends_with("# verify: PASSED"));
}

#[test]
fn matmul_add_reference_tracks_real_arithmetic() {
    let compiled = scenario::matmul_add(2, 0)
        .unwrap()
        .compile(HwConfig::default())
        .unwrap();
    let graph = &compiled.design.graph;
    let report = Stimulus::generate(graph, 0).unwrap().drift(graph).unwrap();
    let add = &report["add"];
    assert!(add.max_rel_error < 0.02, "{add:?}");
}

#[test]
fn more_parallelism_takes_fewer_cycles() {
    let slow = scenario::matmul_add(1, 0)
        .unwrap()
        .run(HwConfig::default(), SimConfig::default())
        .unwrap();
    let fast = scenario::matmul_add(4, 0)
        .unwrap()
        .run(HwConfig::default(), SimConfig::default())
        .unwrap();
    assert!(slow.passed() && fast.passed());
    assert!(fast.cycles < slow.cycles, "{} vs {}", fast.cycles, slow.cycles);
}

#[test]
fn corrupted_reference_fails_at_that_index() {
    let compiled = scenario::matmul_add(2, 0)
        .unwrap()
        .compile(HwConfig::default())
        .unwrap();
    let graph = &compiled.design.graph;
    let mut stimulus = Stimulus::generate(graph, 0).unwrap();
    let out = graph.outputs()[0];
    let reference = stimulus.references.get_mut(&out).unwrap();
    reference[37] = reference[37].wrapping_add(1);

    let mut verifier = Verifier::new(
        Arc::clone(&compiled.design),
        compiled.module,
        CycleClock::new(),
        stimulus,
        SimConfig::default(),
    )
    .unwrap();
    let report = verifier.run().unwrap();
    assert_eq!(verifier.state(), VerifierState::Done(Verdict::Failed));
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].index, 37);
    assert_eq!(report.mismatches[0].output, "add");
    assert!(report.to_string().ends_with("# verify: FAILED"));
}

#[test]
fn linear_without_activation_range_never_reaches_backend() {
    let mut s = scenario::linear(1, 0).unwrap();
    s.ranges.clear();
    let mut ctx = CompileContext::new("linear", HwConfig::default()).unwrap();
    let mut backend = BehavioralBackend::new();
    let err = compile(&mut ctx, s.graph, &s.ranges, &s.requests, &mut backend).unwrap_err();
    assert!(matches!(err, CompileError::RangeInference { ref tensor, .. } if tensor == "act"));
    assert_eq!(backend.emitted(), 0);
}

#[test]
fn linear_batchnorm_leaky_relu_passes() {
    let sim = SimConfig::default().with_seed(11);
    let report = scenario::linear(1, 11)
        .unwrap()
        .run(HwConfig::default(), sim)
        .unwrap();
    assert!(report.passed(), "{:?}", report.mismatches);
    assert_eq!(report.checked, 4 * 13);
}

#[test]
fn zero_warmup_still_passes() {
    let sim = SimConfig::default().with_warmup_cycles(0).with_seed(3);
    let report = scenario::linear(13, 3)
        .unwrap()
        .run(HwConfig::default(), sim)
        .unwrap();
    assert!(report.passed());
}

/// Jumps far ahead on every edge.
struct SkippingClock {
    cycles: u64,
    step: u64,
}

impl Clock for SkippingClock {
    fn tick(&mut self) -> u64 {
        self.cycles += self.step;
        self.cycles
    }

    fn cycles(&self) -> u64 {
        self.cycles
    }
}

#[test]
fn timeout_without_verdict() {
    let compiled = scenario::matmul_add(2, 0)
        .unwrap()
        .compile(HwConfig::default())
        .unwrap();
    let stimulus = Stimulus::generate(&compiled.design.graph, 0).unwrap();
    let clock = SkippingClock {
        cycles: 0,
        step: 10_000,
    };
    let sim = SimConfig::default().with_max_cycles(50_000);
    let mut verifier =
        Verifier::new(Arc::clone(&compiled.design), compiled.module, clock, stimulus, sim).unwrap();
    let err = verifier.run().unwrap_err();
    assert!(matches!(err, SimError::Timeout { cycles: 50_000, .. }), "{err}");
    assert_eq!(verifier.state(), VerifierState::Waiting);
    assert!(verifier.verify().is_err());
}

#[test]
fn timeout_with_real_clock() {
    let sim = SimConfig::default().with_max_cycles(20);
    let mut verifier = verifier_for(scenario::matmul_add(2, 0).unwrap(), HwConfig::default(), sim);
    assert!(matches!(verifier.run(), Err(SimError::Timeout { cycles: 20, .. })));
}

#[test]
fn int8_par1_rejected_then_widened() {
    let build = || {
        let mut b = GraphBuilder::new();
        let x = b.placeholder("x", vec![6, 10], DType::int(8)).unwrap();
        let y = b
            .activation("act", x, ActFunc::LeakyRelu { slope: 0.25 }, DType::int(8))
            .unwrap();
        b.output(y).unwrap();
        Scenario {
            name: "leaky".into(),
            graph: b.finish().unwrap(),
            ranges: ValueRanges::from([("x".to_string(), (-60.0, 60.0))]),
            requests: AttrRequests::from([("act".to_string(), AttrRequest::new().par_out_col(1))]),
        }
    };

    let err = build().compile(HwConfig::default()).unwrap_err();
    assert!(
        matches!(err, SimError::Compile(CompileError::AttributeValidation { ref op, .. }) if op == "act"),
        "{err}"
    );

    let hw = HwConfig::default().with_burst_policy(BurstPolicy::Widen);
    let report = build().run(hw, SimConfig::default()).unwrap();
    assert!(report.passed(), "{:?}", report.mismatches);
    assert_eq!(report.checked, 60);
}

/// Behaves like the wrapped module but also scribbles on a fixed address.
#[derive(Debug)]
struct Scribbler {
    inner: BehavioralModule,
    target: u64,
}

impl ModuleHandle for Scribbler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn ports(&self) -> &[Port] {
        self.inner.ports()
    }
}

impl Dut for Scribbler {
    fn reset(&mut self) {
        self.inner.reset()
    }

    fn write_control(&mut self, reg: u32, value: u32) -> SimResult<()> {
        self.inner.write_control(reg, value)
    }

    fn read_control(&self, reg: u32) -> SimResult<u32> {
        self.inner.read_control(reg)
    }

    fn step(&mut self, mem: &mut MemoryImage) -> SimResult<()> {
        self.inner.step(mem)?;
        if self.inner.read_control(nnhw_cosim::protocol::REG_STATUS)? != 0 {
            mem.write_u32(self.target, 0xdead_beef)?;
        }
        Ok(())
    }
}

#[test]
fn writes_into_reference_region_detected() {
    let compiled = scenario::matmul_add(2, 0)
        .unwrap()
        .compile(HwConfig::default())
        .unwrap();
    let design = Arc::clone(&compiled.design);
    let target = design.memory.region(RegionKind::Reference).unwrap().base;
    let stimulus = Stimulus::generate(&design.graph, 0).unwrap();
    let dut = Scribbler {
        inner: compiled.module,
        target,
    };
    let mut verifier =
        Verifier::new(design, dut, CycleClock::new(), stimulus, SimConfig::default()).unwrap();
    let err = verifier.run().unwrap_err();
    assert!(
        matches!(err, SimError::ProtectedWrite { ref region, addr } if region == "reference" && addr == target),
        "{err}"
    );
}

#[test]
fn unwritten_outputs_keep_fill_pattern() {
    let mut verifier = verifier_for(
        scenario::matmul_add(2, 0).unwrap(),
        HwConfig::default(),
        SimConfig::default(),
    );
    verifier.address().unwrap();
    let out = verifier
        .dut()
        .design()
        .graph
        .tensor_by_name("add")
        .unwrap();
    let addr = verifier.dut().design().graph.tensor(out).addr().unwrap();
    assert_eq!(verifier.image().read(addr, 4).unwrap(), &[100; 4]);
}

/// Computes correctly but clears the completion counter after every step.
#[derive(Debug)]
struct SilentHandshake {
    inner: BehavioralModule,
    handshake: u64,
}

impl ModuleHandle for SilentHandshake {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn ports(&self) -> &[Port] {
        self.inner.ports()
    }
}

impl Dut for SilentHandshake {
    fn reset(&mut self) {
        self.inner.reset()
    }

    fn write_control(&mut self, reg: u32, value: u32) -> SimResult<()> {
        self.inner.write_control(reg, value)
    }

    fn read_control(&self, reg: u32) -> SimResult<u32> {
        self.inner.read_control(reg)
    }

    fn step(&mut self, mem: &mut MemoryImage) -> SimResult<()> {
        self.inner.step(mem)?;
        mem.write_u32(self.handshake, 0)
    }
}

#[test]
fn wrong_handshake_count_does_not_change_verdict() {
    let compiled = scenario::matmul_add(2, 0)
        .unwrap()
        .compile(HwConfig::default())
        .unwrap();
    let design = Arc::clone(&compiled.design);
    let stimulus = Stimulus::generate(&design.graph, 0).unwrap();
    let dut = SilentHandshake {
        inner: compiled.module,
        handshake: design.memory.handshake_addr,
    };
    let mut verifier =
        Verifier::new(design, dut, CycleClock::new(), stimulus, SimConfig::default()).unwrap();
    let report = verifier.run().unwrap();
    assert_eq!(report.handshake, 0);
    assert!(report.passed(), "{:?}", report.mismatches);
    assert_eq!(verifier.state(), VerifierState::Done(Verdict::Passed));
}
