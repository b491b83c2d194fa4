use std::sync::Arc;

use cinder_dbt::exec::{DecodedInsn, Interpreter};
use cinder_dbt::ir::{BinOp, Instr, Operand, Terminator};
use cinder_dbt::profile::NoProfile;
use cinder_dbt::{
    BranchProfile, BranchTargetProfile, BuiltTrace, GuestFault, HostCodeGenerator, IrEvaluator,
    LazyState, ProcessState, RegId, TraceBuilder, TraceExit, TranslatorConfig, Validity, Width,
};
use cinder_refisa::asm::{self, assemble, R0, R1, R2, R3, R4, R5};
use cinder_refisa::isa::{FLAGS, FLAG_Z, LINK, REG_COUNT};
use cinder_refisa::{RefInterpreter, RefIsa, RefMachine};

const MEM_SIZE: usize = 0x1000;

fn machine(program: &[[u8; 4]]) -> RefMachine {
    RefMachine::with_image(MEM_SIZE, 0, &assemble(program)).unwrap()
}

fn build(arch: &RefIsa, m: &RefMachine, config: &TranslatorConfig) -> BuiltTrace {
    TraceBuilder::new(arch, m, &NoProfile, config)
        .build(0)
        .unwrap()
}

fn run_compiled(trace: &BuiltTrace, m: &mut RefMachine) -> TraceExit {
    let generated = IrEvaluator::new().generate(trace).unwrap();
    generated.code.invoke(m)
}

fn interpret(m: &mut RefMachine, steps: usize) -> Result<(), GuestFault> {
    for _ in 0..steps {
        let pc = m.pc();
        let insn = RefInterpreter.decode(m, pc)?;
        insn.execute(m)?;
    }
    Ok(())
}

fn count_instrs(trace: &BuiltTrace, pred: impl Fn(&Instr) -> bool) -> usize {
    trace
        .graph
        .iter()
        .flat_map(|(_, block)| block.instrs.iter())
        .filter(|i| pred(i))
        .count()
}

/// `r1 = 5; do { r1 -= 1 } while r1 != 0; exit(r1)`.
fn countdown() -> Vec<[u8; 4]> {
    vec![
        asm::movi(R1, 5),
        asm::addi(R1, R1, -1),
        asm::bnz(-4),
        asm::movi(R0, 0),
        asm::syscall(),
    ]
}

#[test]
fn backward_branch_to_equivalent_state_reuses_the_block() {
    let arch = RefIsa::new();
    let m = machine(&countdown());
    let trace = build(&arch, &m, &TranslatorConfig::default());

    // Every instruction is decoded exactly once; the loop edge links back to pc 4.
    assert_eq!(arch.decode_count(), 5);
    assert_eq!(trace.instruction_count, 5);
    assert_eq!(trace.keys.len(), 5);
    assert_eq!(trace.keys_at(4).count(), 1);
}

#[test]
fn compiled_countdown_matches_interpretation() {
    let arch = RefIsa::new();
    let mut m = machine(&countdown());
    let trace = build(&arch, &m, &TranslatorConfig::default());

    assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(20));
    assert!(m.finished());
    assert_eq!(m.exit_status(), Some(0));
    assert_eq!(m.reg(R1), 0);
    assert_eq!(m.flags(), FLAG_Z);
}

#[test]
fn same_pc_under_different_lazy_states_gets_distinct_blocks() {
    let arch = RefIsa::new();
    let program = [
        asm::cmpi(R1, 0),
        asm::bz(12),
        asm::movw(R2, 7),
        asm::b(4),
        asm::mov(R3, R2),
        asm::movi(R0, 0),
        asm::syscall(),
    ];
    let m = machine(&program);
    let trace = build(&arch, &m, &TranslatorConfig::default());

    // pc 16 is reached with r2 full (taken) and with r2 holding only a 16-bit view (fall-through).
    let keys: Vec<_> = trace.keys_at(16).collect();
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
    assert!(keys
        .iter()
        .any(|k| k.tags()[R2.index()] == Validity::Partial(Width::W16)));

    // Reading r2 combines the view, so both paths converge on one block at pc 20.
    assert_eq!(trace.keys_at(20).count(), 1);
    assert_eq!(arch.decode_count(), 8);
}

#[test]
fn distinct_paths_compute_the_right_values() {
    let arch = RefIsa::new();
    let program = [
        asm::cmpi(R1, 0),
        asm::bz(12),
        asm::movw(R2, 7),
        asm::b(4),
        asm::mov(R3, R2),
        asm::movi(R0, 0),
        asm::syscall(),
    ];
    let config = TranslatorConfig::default();

    for (r1, expected) in [(0, 0xabcd_0000), (5, 0xabcd_0007)] {
        let mut m = machine(&program);
        m.set_reg(R1, r1);
        m.set_reg(R2, 0xabcd_0000);
        let trace = build(&arch, &m, &config);
        assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(28));
        assert_eq!(m.reg(R3), expected, "r1 = {r1}");
    }
}

#[test]
fn tight_loops_terminate() {
    let arch = RefIsa::new();
    let m = machine(&[asm::b(0)]);
    let trace = build(&arch, &m, &TranslatorConfig::default());
    assert_eq!(trace.instruction_count, 1);
    assert!(matches!(
        trace.graph.block(trace.graph.entry()).term,
        Some(Terminator::Jump(_))
    ));

    // The back edge carries deferred flags, so pc 0 is decoded again under that state and then
    // links to the branch already decoded with flags deferred.
    let arch = RefIsa::new();
    let m = machine(&[asm::addi(R1, R1, 1), asm::b(-4)]);
    let trace = build(&arch, &m, &TranslatorConfig::default());
    assert_eq!(trace.keys_at(0).count(), 2);
    assert_eq!(trace.keys_at(4).count(), 1);
    assert_eq!(arch.decode_count(), 3);
}

/// `ldw r1, [r2]; addi r1, r1, 4; bz L; movi r3, 1; L: movi r0, 0; syscall`
fn flags_scenario() -> Vec<[u8; 4]> {
    vec![
        asm::ldw(R1, R2, 0),
        asm::addi(R1, R1, 4),
        asm::bz(8),
        asm::movi(R3, 1),
        asm::movi(R0, 0),
        asm::syscall(),
    ]
}

#[test]
fn deferred_flags_are_materialised_once_and_target_inlined() {
    let arch = RefIsa::new();
    let m = machine(&flags_scenario());
    let trace = build(&arch, &m, &TranslatorConfig::default());

    assert_eq!(trace.stats.materializations, 1);
    // `L` was already decoded on the fall-through path under the same state.
    assert_eq!(trace.keys_at(16).count(), 1);
    assert_eq!(arch.decode_count(), 6);
    assert_eq!(trace.stats.exit_stubs, 1);
}

#[test]
fn exhausted_budget_leaves_through_exit_stub() {
    let arch = RefIsa::new();
    let mut m = machine(&flags_scenario());
    m.set_reg(R2, 0x100);
    m.store_u32(0x100, (-4i32) as u32).unwrap();
    let config = TranslatorConfig {
        instruction_budget: [3, 3, 3],
        ..TranslatorConfig::default()
    };
    let trace = build(&arch, &m, &config);

    assert_eq!(trace.instruction_count, 3);
    assert_eq!(trace.stats.materializations, 1);
    assert_eq!(trace.stats.inlined_branches, 0);
    // One stub for `L` and one where the budget ran out on the fall-through path.
    assert_eq!(trace.stats.exit_stubs, 2);

    let canonical = LazyState::canonical(REG_COUNT);
    let stub_key = trace.keys_at(16).next().unwrap();
    assert_eq!(stub_key, &canonical.make_key(16));

    assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(16));
    assert_eq!(m.reg(R1), 0);
    assert_eq!(m.flags(), FLAG_Z);
}

#[test]
fn sub_register_combination_is_emitted_once_per_block() {
    let arch = RefIsa::new();
    let program = [
        asm::movw(R2, 7),
        asm::add(R3, R2, R2),
        asm::movi(R0, 0),
        asm::syscall(),
    ];
    let mut m = machine(&program);
    m.set_reg(R2, 0xabcd_0000);
    let trace = build(&arch, &m, &TranslatorConfig::default());

    let clears_low_half = |i: &Instr| {
        matches!(
            i,
            Instr::Bin {
                op: BinOp::And,
                rhs: Operand::Imm(mask),
                ..
            } if *mask == !0xffffu64
        )
    };
    assert_eq!(count_instrs(&trace, clears_low_half), 1);

    assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(16));
    assert_eq!(m.reg(R2), 0xabcd_0007);
    assert_eq!(m.reg(R3), 0x579a_000e);
}

#[test]
fn unused_registers_lose_their_fill_and_spill_code() {
    let arch = RefIsa::new();
    let m = machine(&[asm::movi(R1, 1), asm::b(0)]);
    let trace = build(&arch, &m, &TranslatorConfig::default());
    let fills = count_instrs(&trace, |i| matches!(i, Instr::Fill { .. }));
    assert_eq!(fills, 1);
    assert!(trace.stats.eliminated_instrs > 0);

    let config = TranslatorConfig {
        eliminate_register_fills: false,
        ..TranslatorConfig::default()
    };
    let trace = build(&arch, &m, &config);
    let fills = count_instrs(&trace, |i| matches!(i, Instr::Fill { .. }));
    assert_eq!(fills, REG_COUNT);
}

#[test]
fn bad_instruction_spills_exact_state_and_faults() {
    let arch = RefIsa::new();
    let mut image = assemble(&[asm::movi(R1, 5), asm::addi(R1, R1, -5)]);
    image.extend_from_slice(&[0x11, 0xde, 0xad, 0x00]);
    let mut m = RefMachine::with_image(MEM_SIZE, 0, &image).unwrap();
    let trace = build(&arch, &m, &TranslatorConfig::default());
    assert_eq!(trace.stats.bad_instructions, 1);

    let exit = run_compiled(&trace, &mut m);
    assert_eq!(
        exit,
        TraceExit::Fault(GuestFault::bad_instruction(8, &[0x11, 0xde, 0xad, 0x00]))
    );
    assert_eq!(m.reg(R1), 0);
    assert_eq!(m.reg(FLAGS), FLAG_Z);
    assert_eq!(m.pc(), 8);
}

#[test]
fn single_instruction_mode_translates_one_instruction() {
    let arch = RefIsa::new();
    let mut m = machine(&countdown());
    let config = TranslatorConfig {
        single_instruction: true,
        ..TranslatorConfig::default()
    };
    let trace = build(&arch, &m, &config);
    assert_eq!(trace.instruction_count, 1);
    assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(4));
    assert_eq!(m.reg(R1), 5);
}

#[test]
fn system_call_reloads_registers_and_ends_the_trace() {
    let arch = RefIsa::new();
    let program = [
        asm::movi(R0, 1),
        asm::movi(R1, 42),
        asm::syscall(),
        asm::movi(R3, 3),
    ];
    let mut m = machine(&program);
    let trace = build(&arch, &m, &TranslatorConfig::default());
    assert_eq!(trace.instruction_count, 3);
    assert_eq!(trace.stats.system_calls, 1);

    assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(12));
    assert_eq!(m.output(), &[42]);
    // The write call clears r0; the trace must not spill its stale copy over it.
    assert_eq!(m.reg(R0), 0);
    assert_eq!(m.reg(R3), 0);
}

#[test]
#[should_panic(expected = "out of range")]
fn out_of_range_register_is_a_contract_violation() {
    let mut lazy = LazyState::canonical(2);
    lazy.set(RegId(5), Validity::Full);
}

#[test]
fn translated_calls_register_their_procedure() {
    let arch = Arc::new(RefIsa::new());
    let profile = Arc::new(BranchProfile::new());
    let m = machine(&[asm::call(8), asm::nop(), asm::ret()]);
    let config = TranslatorConfig::default();
    let trace = TraceBuilder::new(&*arch, &m, &*profile, &config)
        .build(0)
        .unwrap();

    // Calls always leave the trace.
    assert_eq!(trace.instruction_count, 1);
    let procedure = profile.procedure(8).unwrap();
    assert_eq!(procedure.calls.len(), 1);
    assert_eq!(procedure.calls[0].return_pc, 4);
}

#[test]
fn indirect_calls_and_barriers_leave_the_trace() {
    let arch = RefIsa::new();
    let program = [
        asm::movi(R5, 12),
        asm::callr(R5),
        asm::nop(),
        asm::movi(R1, 9),
        asm::isync(),
        asm::movi(R2, 1),
    ];
    let mut m = machine(&program);
    let trace = build(&arch, &m, &TranslatorConfig::default());
    assert_eq!(trace.instruction_count, 2);
    assert_eq!(trace.stats.dynamic_dispatches, 1);
    assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(12));
    assert_eq!(m.reg(LINK), 8);

    // The barrier ends translation even though the next instruction is in budget.
    let trace = TraceBuilder::new(&arch, &m, &NoProfile, &TranslatorConfig::default())
        .build(12)
        .unwrap();
    assert_eq!(trace.instruction_count, 2);
    assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(20));
    assert_eq!(m.reg(R1), 9);
    assert_eq!(m.reg(R2), 0);
}

#[test]
fn callr_through_the_link_register_jumps_to_its_old_value() {
    let arch = RefIsa::new();
    let program = [asm::movi(LINK, 12), asm::callr(LINK), asm::nop(), asm::nop()];
    let mut compiled = machine(&program);
    let trace = build(&arch, &compiled, &TranslatorConfig::default());
    assert_eq!(run_compiled(&trace, &mut compiled), TraceExit::Continue(12));

    let mut interpreted = machine(&program);
    interpret(&mut interpreted, 2).unwrap();
    assert_eq!(interpreted.pc(), 12);
    assert_eq!(interpreted.reg(LINK), 8);
    assert_eq!(compiled.pc(), interpreted.pc());
    assert_eq!(compiled.regs(), interpreted.regs());
}

#[test]
fn memory_fault_leaves_the_state_before_the_faulting_instruction() {
    let program = [
        asm::movi(R1, 5),
        asm::cmpi(R1, 5),
        asm::stw(R1, R2, 0),
        asm::ldw(R3, R4, 0),
        asm::movi(R1, 6),
    ];
    let setup = |m: &mut RefMachine| {
        m.set_reg(R2, 0x80);
        m.set_reg(R4, 0x2000);
    };
    let fault = GuestFault::MemoryFault { addr: 0x2000 };

    let arch = RefIsa::new();
    let mut compiled = machine(&program);
    setup(&mut compiled);
    let trace = build(&arch, &compiled, &TranslatorConfig::default());
    assert_eq!(
        run_compiled(&trace, &mut compiled),
        TraceExit::Fault(fault.clone())
    );

    let mut interpreted = machine(&program);
    setup(&mut interpreted);
    assert_eq!(interpret(&mut interpreted, 4), Err(fault));
    assert_eq!(interpreted.pc(), 12);
    assert_eq!(interpreted.flags(), FLAG_Z);

    // The store before the fault landed, the deferred flags were made real and nothing after the
    // faulting load ran.
    assert_eq!(compiled.pc(), interpreted.pc());
    assert_eq!(compiled.regs(), interpreted.regs());
    assert_eq!(compiled.load_u32(0x80).unwrap(), 5);
    assert_eq!(compiled.memory(), interpreted.memory());
}

#[test]
fn several_profiled_targets_dispatch_through_a_switch() {
    let program = [
        asm::jr(R5),      // 0
        asm::movi(R1, 1), // 4
        asm::isync(),     // 8
        asm::movi(R1, 2), // 12
        asm::isync(),     // 16
    ];
    let profile = BranchProfile::new();
    profile.profile_branch(0, 4);
    profile.profile_branch(0, 12);
    let arch = RefIsa::new();
    let config = TranslatorConfig::default();
    let m = machine(&program);
    let trace = TraceBuilder::new(&arch, &m, &profile, &config)
        .build(0)
        .unwrap();

    assert_eq!(trace.stats.dynamic_dispatches, 1);
    assert_eq!(trace.stats.inlined_branches, 2);
    let cases = trace
        .graph
        .iter()
        .find_map(|(_, block)| match &block.term {
            Some(Terminator::Switch { cases, .. }) => {
                Some(cases.iter().map(|(pc, _)| *pc).collect::<Vec<_>>())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(cases, vec![4, 12]);

    // An unprofiled target takes the fallback exit.
    for (r5, next, r1) in [(4, 12, 1), (12, 20, 2), (16, 16, 0)] {
        let mut m = machine(&program);
        m.set_reg(R5, r5);
        assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(next), "r5 = {r5}");
        assert_eq!(m.reg(R1), r1, "r5 = {r5}");
    }
}

#[test]
fn forward_branch_to_undecoded_code_is_inlined_with_flags_deferred() {
    let program = [
        asm::cmpi(R1, 0), // 0
        asm::b(8),        // 4: -> 12
        asm::movi(R3, 1), // 8
        asm::bz(8),       // 12: -> 20
        asm::movi(R3, 2), // 16
        asm::isync(),     // 20
    ];
    let arch = RefIsa::new();
    let m = machine(&program);
    let trace = build(&arch, &m, &TranslatorConfig::default());

    assert_eq!(trace.stats.inlined_branches, 1);
    assert_eq!(trace.keys_at(8).count(), 0);
    assert_eq!(arch.decode_count(), 5);
    let at_target: Vec<_> = trace.keys_at(12).collect();
    assert_eq!(at_target.len(), 1);
    assert_eq!(at_target[0].tags()[FLAGS.index()], Validity::NotMaterialized);
    assert_eq!(trace.stats.materializations, 1);

    for (r1, r3, flags) in [(0, 0, FLAG_Z), (5, 2, 0)] {
        let mut m = machine(&program);
        m.set_reg(R1, r1);
        assert_eq!(run_compiled(&trace, &mut m), TraceExit::Continue(24));
        assert_eq!(m.reg(R3), r3, "r1 = {r1}");
        assert_eq!(m.flags(), flags, "r1 = {r1}");
    }
}

#[test]
fn compiled_dynamic_target_at_the_size_threshold_is_not_inlined() {
    let program = [
        asm::movi(R5, 12), // 0
        asm::jr(R5),       // 4
        asm::nop(),        // 8
        asm::movi(R1, 7),  // 12
        asm::isync(),      // 16
    ];
    let profile = Arc::new(BranchProfile::new());
    profile.profile_branch(4, 12);
    let m = machine(&program);
    let translator = cinder_refisa::translator(
        Arc::new(RefIsa::new()),
        Arc::clone(&profile) as Arc<dyn BranchTargetProfile>,
        TranslatorConfig::default(),
    );
    translator.compile(12, &m).unwrap();
    let size = translator.cache().size_hint(12).unwrap();

    let arch = RefIsa::new();
    let at_threshold = TranslatorConfig {
        inline_size_threshold: size,
        ..TranslatorConfig::default()
    };
    let trace = TraceBuilder::new(&arch, &m, &*profile, &at_threshold)
        .with_cache(translator.cache())
        .build(0)
        .unwrap();
    assert_eq!(trace.stats.dynamic_dispatches, 1);
    assert_eq!(trace.stats.inlined_branches, 0);
    assert_eq!(arch.decode_count(), 2);
    assert_eq!(trace.keys_at(12).count(), 1);
    let mut exited = machine(&program);
    assert_eq!(run_compiled(&trace, &mut exited), TraceExit::Continue(12));
    assert_eq!(exited.reg(R1), 0);

    // One host instruction of headroom and the same target is inlined.
    let arch = RefIsa::new();
    let above = TranslatorConfig {
        inline_size_threshold: size + 1,
        ..TranslatorConfig::default()
    };
    let trace = TraceBuilder::new(&arch, &m, &*profile, &above)
        .with_cache(translator.cache())
        .build(0)
        .unwrap();
    assert_eq!(trace.stats.inlined_branches, 1);
    assert_eq!(arch.decode_count(), 4);
    let mut inlined = machine(&program);
    assert_eq!(run_compiled(&trace, &mut inlined), TraceExit::Continue(20));
    assert_eq!(inlined.reg(R1), 7);
}

#[test]
fn recorded_indirect_calls_register_their_call_site() {
    let program = [
        asm::movi(R5, 12), // 0
        asm::callr(R5),    // 4
        asm::nop(),        // 8
        asm::ret(),        // 12
    ];
    let config = TranslatorConfig {
        opt_level: 1,
        record_uncaught_branches: true,
        ..TranslatorConfig::default()
    };
    let arch = RefIsa::new();
    let mut m = machine(&program);
    let trace = TraceBuilder::new(&arch, &m, &NoProfile, &config)
        .build(0)
        .unwrap();

    let profile = Arc::new(BranchProfile::new());
    let generated = IrEvaluator::with_profile(Arc::clone(&profile) as Arc<dyn BranchTargetProfile>)
        .generate(&trace)
        .unwrap();
    assert_eq!(generated.code.invoke(&mut m), TraceExit::Continue(12));

    let procedure = profile.procedure(12).unwrap();
    assert_eq!(procedure.calls.len(), 1);
    assert_eq!(procedure.calls[0].site, 4);
    assert_eq!(procedure.calls[0].return_pc, 8);
    assert_eq!(profile.branch_probability(4, 12), Some(1.0));
}
