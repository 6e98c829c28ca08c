//! Mode manager (C9): derives the current CPU mode from CR0/CR4/EFER.

use crate::registers::RegisterFile;

/// The operating mode the rest of the core dispatches on.
///
/// Mode is a pure function of `(CR0.PE, CR0.PG, CR4.PAE, EFER.LME)` —
/// recomputing it from the same inputs always yields the same tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    ProtectedPaging,
    ProtectedPae,
    Long,
}

impl CpuMode {
    /// Derives the mode from the relevant control-register bits. Called
    /// after every CR0/CR4/EFER write (`spec.md` §4.9).
    #[must_use]
    pub fn derive(regs: &RegisterFile) -> Self {
        let pe = regs.cr0().contains(crate::registers::Cr0Flags::PROTECTION_ENABLE);
        let pg = regs.cr0().contains(crate::registers::Cr0Flags::PAGING);
        let pae = regs.cr4().contains(crate::registers::Cr4Flags::PAE);
        let lme = regs.efer().contains(crate::registers::EferFlags::LME);

        match (pe, pg, pae, lme) {
            (false, _, _, _) => CpuMode::Real,
            (true, false, _, _) => CpuMode::Protected,
            (true, true, false, _) => CpuMode::ProtectedPaging,
            (true, true, true, false) => CpuMode::ProtectedPae,
            (true, true, true, true) => CpuMode::Long,
        }
    }

    /// Long mode requires PE, PG, PAE, and LME all set; only then is
    /// 4-level paging fully armed (`spec.md` §4.4).
    #[must_use]
    pub fn is_long(self) -> bool {
        matches!(self, CpuMode::Long)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterFile;

    #[test]
    fn mode_is_real_until_protection_enable_is_set() {
        let regs = RegisterFile::new();
        assert_eq!(CpuMode::derive(&regs), CpuMode::Real);
    }

    #[test]
    fn mode_is_long_only_when_all_four_bits_set() {
        let mut regs = RegisterFile::new();
        regs.set_cr0(1 | (1 << 31));
        regs.set_cr4(1 << 5);
        regs.set_efer(1 << 8);
        assert_eq!(CpuMode::derive(&regs), CpuMode::Long);

        regs.set_cr4(0);
        assert_eq!(CpuMode::derive(&regs), CpuMode::ProtectedPaging);
    }

    #[test]
    fn mode_is_a_pure_function_of_its_inputs() {
        let mut a = RegisterFile::new();
        let mut b = RegisterFile::new();
        a.set_cr0(1 | (1 << 31));
        a.set_cr4(1 << 5);
        a.set_efer(1 << 8);
        b.set_cr0(1 | (1 << 31));
        b.set_cr4(1 << 5);
        b.set_efer(1 << 8);
        assert_eq!(CpuMode::derive(&a), CpuMode::derive(&b));
    }
}
