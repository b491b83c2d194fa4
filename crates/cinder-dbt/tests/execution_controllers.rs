use std::sync::Arc;

use cinder_dbt::exec::{StagedController, ThreadedInterpreter, TranslationController};
use cinder_dbt::{
    BranchProfile, BranchTargetProfile, ExecError, ExecutedTier, ExecutionController, GuestFault,
    ProcessState, Translator, TranslatorConfig,
};
use cinder_refisa::asm::{self, assemble, R0, R1, R2, R3, R4, R5};
use cinder_refisa::{RefInterpreter, RefIsa, RefMachine};

fn machine(program: &[[u8; 4]]) -> RefMachine {
    RefMachine::with_image(0x100, 0, &assemble(program)).unwrap()
}

fn translator(profile: Arc<BranchProfile>) -> Translator {
    cinder_refisa::translator(Arc::new(RefIsa::new()), profile, TranslatorConfig::default())
}

fn countdown(from: i16) -> Vec<[u8; 4]> {
    vec![
        asm::movi(R1, from),
        asm::addi(R1, R1, -1),
        asm::bnz(-4),
        asm::movi(R0, 0),
        asm::syscall(),
    ]
}

#[test]
fn promoted_blocks_are_never_interpreted_again() {
    let mut m = machine(&countdown(50));
    let mut staged: StagedController<RefMachine, _> = StagedController::new(
        RefInterpreter,
        translator(Arc::new(BranchProfile::new())),
        10,
    );

    let mut promoted_at = None;
    let mut step = 0;
    while !m.finished() {
        let out = staged.step(&mut m).unwrap();
        if out.entry_pc == 4 {
            match (out.tier, promoted_at) {
                (ExecutedTier::Compiled, None) => promoted_at = Some(step),
                (ExecutedTier::Interpreter, Some(at)) => {
                    panic!("block 0x4 interpreted at step {step} after promotion at step {at}")
                }
                _ => {}
            }
        }
        step += 1;
    }

    assert!(staged.is_promoted(4));
    assert_eq!(staged.heat(4), None);
    assert_eq!(staged.heat(0), Some(3));
    // One visit of the three-instruction entry block, six two-instruction visits to pass a
    // threshold of 10, then the compiled loop runs to completion.
    assert_eq!(promoted_at, Some(7));
    assert_eq!(staged.stats().promotions, 1);
    assert_eq!(staged.stats().interpreted_instructions, 15);
    assert_eq!(m.reg(R1), 0);
    assert_eq!(m.exit_status(), Some(0));
}

#[test]
fn interpreted_indirect_jumps_specialise_later_traces() {
    let program = [
        asm::movi(R5, 16),
        asm::jr(R5),
        asm::nop(),
        asm::nop(),
        asm::addi(R1, R1, 1),
        asm::cmpi(R1, 20),
        asm::bnz(-20),
        asm::movi(R0, 0),
        asm::syscall(),
    ];
    let profile = Arc::new(BranchProfile::new());
    let mut m = machine(&program);
    let mut staged: StagedController<RefMachine, _> =
        StagedController::new(RefInterpreter, translator(Arc::clone(&profile)), 5);

    let summary = staged.run(&mut m, None).unwrap();
    assert!(summary.finished);
    assert_eq!(m.reg(R1), 20);
    assert!(staged.is_promoted(16));
    assert!(!staged.is_promoted(4));
    assert_eq!(
        profile.known_branch_targets(4).into_iter().collect::<Vec<_>>(),
        vec![16]
    );

    // The dispatch at the `jr` links straight back to the loop head instead of leaving the trace.
    let built = staged.translator().build(16, &m).unwrap();
    assert_eq!(built.stats.dynamic_dispatches, 1);
    assert_eq!(built.stats.inlined_branches, 1);
    assert_eq!(built.keys_at(16).count(), 1);
    assert_eq!(built.stats.exit_stubs, 2);
}

#[test]
fn threaded_interpreter_memoises_only_long_blocks() {
    let mut m = machine(&countdown(5));
    let mut threaded: ThreadedInterpreter<RefMachine, _> =
        ThreadedInterpreter::new(RefInterpreter, 2);

    let summary = threaded.run(&mut m, None).unwrap();
    assert!(summary.finished);
    assert_eq!(summary.interpreted_instructions, 13);
    assert_eq!(summary.compiled_instructions, 0);
    assert!(threaded.is_memoised(0));
    assert!(!threaded.is_memoised(4));
    assert_eq!(m.exit_status(), Some(0));
}

#[test]
fn translation_controller_surfaces_guest_faults() {
    let mut image = assemble(&[asm::movi(R1, 7)]);
    image.extend_from_slice(&[0xff, 0, 0, 0]);
    let mut m = RefMachine::with_image(0x100, 0, &image).unwrap();
    let mut controller = TranslationController::new(translator(Arc::new(BranchProfile::new())));

    let err = controller.run(&mut m, None).unwrap_err();
    assert_eq!(
        err,
        ExecError::Fault(GuestFault::bad_instruction(4, &[0xff, 0, 0, 0]))
    );
    assert_eq!(m.reg(R1), 7);
    assert_eq!(m.pc(), 4);
}

#[test]
fn compiled_and_threaded_memory_faults_agree() {
    let program = [
        asm::movi(R1, 5),
        asm::addi(R1, R1, -5),
        asm::stw(R1, R2, 0),
        asm::ldw(R3, R4, 0),
        asm::movi(R1, 6),
    ];
    let setup = |m: &mut RefMachine| {
        m.set_reg(R2, 0x80);
        m.set_reg(R3, 0x33);
        m.set_reg(R4, 0x200);
        m.store_u32(0x80, 0xdead).unwrap();
    };
    let expected = ExecError::Fault(GuestFault::MemoryFault { addr: 0x200 });

    let mut compiled = machine(&program);
    setup(&mut compiled);
    let mut controller = TranslationController::new(translator(Arc::new(BranchProfile::new())));
    assert_eq!(controller.run(&mut compiled, None).unwrap_err(), expected);

    let mut threaded_state = machine(&program);
    setup(&mut threaded_state);
    let mut threaded: ThreadedInterpreter<RefMachine, _> =
        ThreadedInterpreter::new(RefInterpreter, 0);
    assert_eq!(threaded.run(&mut threaded_state, None).unwrap_err(), expected);

    assert_eq!(compiled.pc(), 12);
    assert_eq!(compiled.pc(), threaded_state.pc());
    assert_eq!(compiled.regs(), threaded_state.regs());
    assert_eq!(compiled.memory(), threaded_state.memory());
    assert_eq!(compiled.reg(R3), 0x33);
    assert_eq!(compiled.load_u32(0x80).unwrap(), 0);
}

#[test]
fn interpreted_indirect_calls_register_their_call_site() {
    let program = [
        asm::movi(R5, 16), // 0
        asm::callr(R5),    // 4
        asm::movi(R0, 0),  // 8
        asm::syscall(),    // 12
        asm::nop(),        // 16
        asm::ret(),        // 20
    ];
    let profile = Arc::new(BranchProfile::new());
    let mut m = machine(&program);
    let mut staged: StagedController<RefMachine, _> =
        StagedController::new(RefInterpreter, translator(Arc::clone(&profile)), 1000);

    let summary = staged.run(&mut m, None).unwrap();
    assert!(summary.finished);
    assert_eq!(summary.compiled_instructions, 0);

    let procedure = profile.procedure(16).unwrap();
    assert_eq!(procedure.calls.len(), 1);
    assert_eq!(procedure.calls[0].site, 4);
    assert_eq!(procedure.calls[0].return_pc, 8);
    assert!(procedure.return_sites.contains(&20));
    assert_eq!(
        profile.known_branch_targets(20).into_iter().collect::<Vec<_>>(),
        vec![8]
    );
}

#[test]
fn run_honours_the_step_limit() {
    let mut m = machine(&[asm::b(0)]);
    let mut controller = TranslationController::new(translator(Arc::new(BranchProfile::new())));
    let summary = controller.run(&mut m, Some(0)).unwrap();
    assert_eq!(summary.steps, 0);
    assert!(!summary.finished);
    assert_eq!(summary.final_pc, 0);
}
