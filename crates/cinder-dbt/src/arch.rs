//! Guest architecture capability consumed by the trace builder.
//!
//! The builder never depends on a concrete guest ISA. Everything it needs from one (register
//! table, initial lazy state, per-instruction translation and materialisation of deferred state)
//! goes through [`GuestArchitecture`].

use crate::builder::TraceEmitter;
use crate::lazy::LazyState;

/// Guest virtual address of an instruction.
pub type GuestAddr = u64;

/// Index into a guest architecture's register table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegId(pub u16);

impl RegId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Width of a register view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    /// Mask selecting the low `bits()` bits of a 64-bit value.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegClass {
    General,
    Float,
    /// Condition codes / flag groups. These are the usual candidates for deferred evaluation.
    Flags,
    /// Architecture specific registers (link register, count register, segment bases, ...).
    Special,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterDesc {
    pub name: &'static str,
    pub class: RegClass,
    pub width: Width,
}

impl RegisterDesc {
    pub const fn new(name: &'static str, class: RegClass, width: Width) -> Self {
        Self { name, class, width }
    }
}

/// Read-only view of guest code used by decoders while translating.
pub trait CodeSource {
    /// Copy up to `buf.len()` bytes starting at `pc` into `buf`, returning how many bytes were
    /// readable. A short read means the code ran off mapped memory.
    fn fetch(&self, pc: GuestAddr, buf: &mut [u8]) -> usize;
}

/// Everything the trace builder needs to know about one guest ISA.
pub trait GuestArchitecture: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register table. Its length defines the valid [`RegId`] range and the length of every
    /// [`LazyState`] produced for this architecture.
    fn registers(&self) -> &[RegisterDesc];

    /// Lazy state at a trace entry. Everything is loaded from persistent storage at that point, so
    /// this is normally [`LazyState::canonical`].
    fn initial_lazy_state(&self) -> LazyState {
        LazyState::canonical(self.registers().len())
    }

    /// Upper bound on the encoded size of one instruction; used to report raw bytes on faults.
    fn max_instruction_len(&self) -> usize;

    /// Translate the instruction at `pc`, emitting all of its effects through `tx`.
    ///
    /// Returns the address of the next instruction when control falls through to it, and `None`
    /// exactly when it does not (branches, returns, faults). When `None` is returned the current
    /// block must already carry a terminator.
    fn translate(
        &self,
        tx: &mut TraceEmitter<'_>,
        lazy: &mut LazyState,
        pc: GuestAddr,
    ) -> Option<GuestAddr>;

    /// Compute the value of a register group whose tag is
    /// [`Validity::NotMaterialized`](crate::lazy::Validity::NotMaterialized) into its working
    /// variable, and mark it valid in `lazy`.
    ///
    /// Architectures that never defer anything can keep the default, which treats the request as
    /// a decoder bug.
    fn materialize(&self, tx: &mut TraceEmitter<'_>, reg: RegId, lazy: &mut LazyState) {
        let _ = (tx, lazy);
        panic!(
            "{}: register {} was left unmaterialised but the architecture has no materialiser",
            self.name(),
            reg.0
        );
    }
}
