//! Lazy architectural state.
//!
//! A [`LazyState`] records, per guest register (or flag group), whether the host working variable
//! for it holds the architectural value. Decoders leave values deferred when computing them is
//! more expensive than remembering how to compute them later (flags are the classic case), or when
//! an instruction only wrote a narrow view of a wider register.
//!
//! Two program points with the same pc but different lazy states need different host code, so the
//! trace builder keys its block map on [`LazyKey`] (pc + tag vector) rather than on the pc alone.

use std::fmt;

use crate::arch::{GuestAddr, RegId, Width};

/// Materialisation tag for one register group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Validity {
    /// The value is deferred; only the architecture knows how to produce it.
    NotMaterialized,
    /// Only the view of the given width is authoritative. The full-width working variable is
    /// stale in those low bits and must be combined before use.
    Partial(Width),
    /// The full-width working variable holds the architectural value.
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LazyState {
    tags: Vec<Validity>,
}

impl LazyState {
    /// The resolved state: every group [`Validity::Full`].
    pub fn canonical(len: usize) -> Self {
        Self {
            tags: vec![Validity::Full; len],
        }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// # Panics
    ///
    /// Panics if `reg` is outside the architecture's register table.
    pub fn get(&self, reg: RegId) -> Validity {
        self.check(reg);
        self.tags[reg.index()]
    }

    /// # Panics
    ///
    /// Panics if `reg` is outside the architecture's register table.
    pub fn set(&mut self, reg: RegId, tag: Validity) {
        self.check(reg);
        self.tags[reg.index()] = tag;
    }

    pub fn defer(&mut self, reg: RegId) {
        self.set(reg, Validity::NotMaterialized);
    }

    pub fn tags(&self) -> &[Validity] {
        &self.tags
    }

    /// Registers whose tag is not [`Validity::Full`], in register order.
    pub fn pending(&self) -> impl Iterator<Item = (RegId, Validity)> + '_ {
        self.tags
            .iter()
            .enumerate()
            .filter(|(_, tag)| **tag != Validity::Full)
            .map(|(i, tag)| (RegId(i as u16), *tag))
    }

    pub fn is_resolved(&self) -> bool {
        self.tags.iter().all(|tag| *tag == Validity::Full)
    }

    /// Structural equivalence: the tag vectors are equal. Values are never compared.
    pub fn equivalent(&self, other: &LazyState) -> bool {
        self.tags == other.tags
    }

    pub fn make_key(&self, pc: GuestAddr) -> LazyKey {
        LazyKey {
            pc,
            tags: self.tags.clone(),
        }
    }

    #[inline]
    fn check(&self, reg: RegId) {
        assert!(
            reg.index() < self.tags.len(),
            "register index {} out of range (lazy state tracks {} registers)",
            reg.0,
            self.tags.len()
        );
    }
}

/// Block-map key: a pc together with the lazy state it is reached under.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LazyKey {
    pub pc: GuestAddr,
    tags: Vec<Validity>,
}

impl LazyKey {
    pub fn tags(&self) -> &[Validity] {
        &self.tags
    }
}

impl fmt::Debug for LazyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}.", self.pc)?;
        for tag in &self.tags {
            let c = match tag {
                Validity::NotMaterialized => 'n',
                Validity::Partial(Width::W8) => 'b',
                Validity::Partial(Width::W16) => 'h',
                Validity::Partial(Width::W32) => 'w',
                Validity::Partial(Width::W64) => 'q',
                Validity::Full => 'f',
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}
