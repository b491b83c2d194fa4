//! Register file adapter: binds guest registers to host working variables for one trace.
//!
//! Each guest register owns one slot holding its full-width working variable plus lazily created
//! narrow view variables. Slots are allocated by the first [`RegisterFile::fill`] and live until the
//! trace is finished, so blocks decoded later reuse the values filled in the pre-fill block.
//!
//! The adapter also owns the sub-register rules. When a narrow view is written the register becomes
//! [`Validity::Partial`]; reading a different width afterwards combines the view back into the
//! full value (or truncates a wider valid value), and the derived view is memoised per block.

use std::collections::HashSet;

use crate::arch::{RegId, Width};
use crate::ir::{BinOp, BlockGraph, BlockId, Instr, Operand, Var};
use crate::lazy::{LazyState, Validity};

/// Which registers a spill sequence stores back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillMode {
    /// Only registers read or written by the trace.
    InUse,
    /// Every register that has been filled.
    All,
}

#[derive(Clone, Debug, Default)]
struct Slot {
    full: Option<Var>,
    views: [Option<Var>; 4],
    in_use: bool,
}

fn width_slot(width: Width) -> usize {
    match width {
        Width::W8 => 0,
        Width::W16 => 1,
        Width::W32 => 2,
        Width::W64 => 3,
    }
}

#[derive(Debug)]
pub struct RegisterFile {
    widths: Vec<Width>,
    slots: Vec<Slot>,
    /// Views derived from a wider value in the current block.
    fresh_views: HashSet<(RegId, Width)>,
}

impl RegisterFile {
    /// `widths[i]` is the architectural width of register `i`.
    pub fn new(widths: Vec<Width>) -> Self {
        let slots = vec![Slot::default(); widths.len()];
        Self {
            widths,
            slots,
            fresh_views: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, reg: RegId) -> &Slot {
        assert!(
            reg.index() < self.slots.len(),
            "register index {} out of range (register file has {} slots)",
            reg.0,
            self.slots.len()
        );
        &self.slots[reg.index()]
    }

    fn slot_mut(&mut self, reg: RegId) -> &mut Slot {
        assert!(
            reg.index() < self.slots.len(),
            "register index {} out of range (register file has {} slots)",
            reg.0,
            self.slots.len()
        );
        &mut self.slots[reg.index()]
    }

    fn native_width(&self, reg: RegId) -> Width {
        self.widths[reg.index()]
    }

    /// Load `reg` from process state into its working variable at `at`. Idempotent: a register that
    /// is already allocated is not loaded again.
    pub fn fill(&mut self, g: &mut BlockGraph, at: BlockId, reg: RegId) -> Var {
        if let Some(v) = self.slot(reg).full {
            return v;
        }
        let v = g.new_var();
        g.push_instr(at, Instr::Fill { dst: v, reg });
        self.slot_mut(reg).full = Some(v);
        v
    }

    /// Reload every allocated register, e.g. after a system call may have changed process state.
    pub fn refill_all(&mut self, g: &mut BlockGraph, at: BlockId) {
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(v) = slot.full {
                g.push_instr(
                    at,
                    Instr::Fill {
                        dst: v,
                        reg: RegId(i as u16),
                    },
                );
            }
        }
        self.fresh_views.clear();
    }

    /// # Panics
    ///
    /// Panics if `reg` was never filled.
    pub fn spill(&mut self, g: &mut BlockGraph, at: BlockId, reg: RegId) {
        let src = self
            .slot(reg)
            .full
            .unwrap_or_else(|| panic!("spilling register {} which was never filled", reg.0));
        g.push_instr(at, Instr::Spill { reg, src });
    }

    pub fn spill_all(&mut self, g: &mut BlockGraph, at: BlockId, mode: SpillMode) {
        for i in 0..self.slots.len() {
            let slot = &self.slots[i];
            let wanted = match mode {
                SpillMode::InUse => slot.in_use,
                SpillMode::All => true,
            };
            if wanted && slot.full.is_some() {
                self.spill(g, at, RegId(i as u16));
            }
        }
    }

    /// Start of a new basic block: views derived in the previous block cannot be trusted on other
    /// paths into this one.
    pub fn begin_block(&mut self) {
        self.fresh_views.clear();
    }

    /// Full-width working variable of `reg` without touching its lazy tag.
    ///
    /// Used by materialisers, which produce the value from scratch.
    pub fn full_var(&self, reg: RegId) -> Var {
        self.slot(reg)
            .full
            .unwrap_or_else(|| panic!("register {} used before it was filled", reg.0))
    }

    fn view_var(&mut self, g: &mut BlockGraph, reg: RegId, width: Width) -> Var {
        let slot = self.slot_mut(reg);
        if let Some(v) = slot.views[width_slot(width)] {
            return v;
        }
        let v = g.new_var();
        self.slot_mut(reg).views[width_slot(width)] = Some(v);
        v
    }

    /// Variable holding `width` bits of `reg` readable in block `at`.
    ///
    /// # Panics
    ///
    /// Panics if the register is [`Validity::NotMaterialized`]; the caller must materialise it
    /// through the architecture first.
    pub fn read(
        &mut self,
        g: &mut BlockGraph,
        at: BlockId,
        reg: RegId,
        width: Width,
        lazy: &mut LazyState,
    ) -> Var {
        self.slot_mut(reg).in_use = true;
        let native = self.native_width(reg);
        match lazy.get(reg) {
            Validity::NotMaterialized => {
                panic!("register {} read while its value is deferred", reg.0)
            }
            Validity::Partial(valid) if valid == width => self.view_var(g, reg, width),
            Validity::Partial(valid) if width < valid => {
                let source = self.view_var(g, reg, valid);
                self.truncate(g, at, reg, source, width)
            }
            Validity::Partial(_) => {
                self.resolve_register(g, at, reg, lazy);
                self.read(g, at, reg, width, lazy)
            }
            Validity::Full if width >= native => self.full_var(reg),
            Validity::Full => {
                let source = self.full_var(reg);
                self.truncate(g, at, reg, source, width)
            }
        }
    }

    fn truncate(
        &mut self,
        g: &mut BlockGraph,
        at: BlockId,
        reg: RegId,
        source: Var,
        width: Width,
    ) -> Var {
        let view = self.view_var(g, reg, width);
        if self.fresh_views.insert((reg, width)) {
            g.push_instr(
                at,
                Instr::Bin {
                    dst: view,
                    op: BinOp::And,
                    lhs: Operand::Var(source),
                    rhs: Operand::Imm(width.mask()),
                },
            );
        }
        view
    }

    /// Variable the caller must assign to write `width` bits of `reg`. Updates the lazy tag.
    ///
    /// A narrow write over a view of a different width first folds that view into the full value,
    /// so at most one view is ever authoritative.
    pub fn write(
        &mut self,
        g: &mut BlockGraph,
        at: BlockId,
        reg: RegId,
        width: Width,
        lazy: &mut LazyState,
    ) -> Var {
        self.slot_mut(reg).in_use = true;
        self.fresh_views.retain(|(r, _)| *r != reg);
        let native = self.native_width(reg);
        if width >= native {
            lazy.set(reg, Validity::Full);
            return self.full_var(reg);
        }
        match lazy.get(reg) {
            Validity::NotMaterialized => {
                panic!("narrow write to register {} while its value is deferred", reg.0)
            }
            Validity::Partial(valid) if valid != width => self.resolve_register(g, at, reg, lazy),
            _ => {}
        }
        lazy.set(reg, Validity::Partial(width));
        self.view_var(g, reg, width)
    }

    /// Force `reg` back to [`Validity::Full`] by combining an authoritative narrow view into the
    /// full value. No-op for registers that are already full.
    pub fn resolve_register(
        &mut self,
        g: &mut BlockGraph,
        at: BlockId,
        reg: RegId,
        lazy: &mut LazyState,
    ) {
        let Validity::Partial(valid) = lazy.get(reg) else {
            assert!(
                lazy.get(reg) == Validity::Full,
                "register {} must be materialised before it can be combined",
                reg.0
            );
            return;
        };
        self.slot_mut(reg).in_use = true;
        let full = self.full_var(reg);
        let view = self.view_var(g, reg, valid);
        g.push_instr(
            at,
            Instr::Bin {
                dst: view,
                op: BinOp::And,
                lhs: Operand::Var(view),
                rhs: Operand::Imm(valid.mask()),
            },
        );
        g.push_instr(
            at,
            Instr::Bin {
                dst: full,
                op: BinOp::And,
                lhs: Operand::Var(full),
                rhs: Operand::Imm(!valid.mask()),
            },
        );
        g.push_instr(
            at,
            Instr::Bin {
                dst: full,
                op: BinOp::Or,
                lhs: Operand::Var(full),
                rhs: Operand::Var(view),
            },
        );
        // The masked view now equals the low bits of the full value.
        self.fresh_views.retain(|(r, _)| *r != reg);
        self.fresh_views.insert((reg, valid));
        lazy.set(reg, Validity::Full);
    }

    /// Mark `reg` as touched without emitting anything.
    pub fn touch(&mut self, reg: RegId) {
        self.slot_mut(reg).in_use = true;
    }

    /// Registers that were filled but never read or written.
    pub fn unused(&self) -> Vec<RegId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.full.is_some() && !s.in_use)
            .map(|(i, _)| RegId(i as u16))
            .collect()
    }
}
