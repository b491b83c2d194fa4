#![cfg(not(target_arch = "wasm32"))]

use cinder_dbt::exec::{DecodedInsn, Interpreter};
use cinder_dbt::profile::NoProfile;
use cinder_dbt::{
    HostCodeGenerator, IrEvaluator, ProcessState, RegId, TraceBuilder, TraceExit, TranslatorConfig,
};
use cinder_refisa::asm;
use cinder_refisa::isa::{FLAGS, REG_COUNT};
use cinder_refisa::{RefInterpreter, RefIsa, RefMachine};
use proptest::prelude::*;

fn reg() -> impl Strategy<Value = RegId> {
    (0u16..8).prop_map(RegId)
}

/// Non-control-transfer instructions: a sequence of them never leaves the trace early.
fn straight_line_insn() -> impl Strategy<Value = [u8; 4]> {
    prop_oneof![
        Just(asm::nop()),
        (reg(), any::<i16>()).prop_map(|(rd, imm)| asm::movi(rd, imm)),
        (reg(), reg()).prop_map(|(rd, rs)| asm::mov(rd, rs)),
        (reg(), reg(), reg()).prop_map(|(rd, rs, rt)| asm::add(rd, rs, rt)),
        (reg(), reg(), any::<i8>()).prop_map(|(rd, rs, imm)| asm::addi(rd, rs, imm)),
        (reg(), reg(), reg()).prop_map(|(rd, rs, rt)| asm::sub(rd, rs, rt)),
        (reg(), any::<u16>()).prop_map(|(rd, imm)| asm::movw(rd, imm)),
        (reg(), any::<u8>()).prop_map(|(rd, imm)| asm::movb(rd, imm)),
        (reg(), reg()).prop_map(|(rd, rs)| asm::addw(rd, rs)),
        (reg(), any::<i8>()).prop_map(|(rs, imm)| asm::cmpi(rs, imm)),
    ]
}

fn machine(program: &[[u8; 4]], regs: &[u32; REG_COUNT]) -> RefMachine {
    let mut m = RefMachine::with_image(0x400, 0, &asm::assemble(program)).unwrap();
    for (i, v) in regs.iter().enumerate() {
        m.set_reg(RegId(i as u16), *v);
    }
    m
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 512,
        .. ProptestConfig::default()
    })]

    #[test]
    fn compiled_straight_line_code_matches_interpretation(
        program in proptest::collection::vec(straight_line_insn(), 1..32),
        regs in proptest::array::uniform9(any::<u32>()),
        always_spill in any::<bool>(),
    ) {
        let len = program.len();
        let config = TranslatorConfig {
            instruction_budget: [len; 3],
            always_spill,
            ..TranslatorConfig::default()
        };

        let mut compiled = machine(&program, &regs);
        let arch = RefIsa::new();
        let built = TraceBuilder::new(&arch, &compiled, &NoProfile, &config)
            .build(0)
            .unwrap();
        prop_assert_eq!(built.instruction_count, len);
        let generated = IrEvaluator::new().generate(&built).unwrap();
        let exit = generated.code.invoke(&mut compiled);
        prop_assert_eq!(exit, TraceExit::Continue(4 * len as u64));

        let mut interpreted = machine(&program, &regs);
        for _ in 0..len {
            let insn = RefInterpreter.decode(&interpreted, interpreted.pc()).unwrap();
            insn.execute(&mut interpreted).unwrap();
        }

        prop_assert_eq!(
            compiled.regs(),
            interpreted.regs(),
            "flags: compiled {:#x} interpreted {:#x}; program {:02x?}",
            compiled.reg(FLAGS),
            interpreted.reg(FLAGS),
            program
        );
        prop_assert_eq!(compiled.pc(), interpreted.pc());
    }
}
