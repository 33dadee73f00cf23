//! Translation-control and memory-attribute register values.
//!
//! Pure bit assembly, kept separate from the privileged-register writes so
//! the encoding is testable anywhere: 48-bit VAs in both halves, 4 KiB
//! granule, write-back inner-shareable walks, and the physical-address
//! size reported by `ID_AA64MMFR0_EL1`.

/// MAIR attribute index for device-nGnRnE memory.
pub const MAIR_DEVICE_INDEX: u64 = 0;
/// MAIR attribute index for normal cacheable memory.
pub const MAIR_NORMAL_INDEX: u64 = 1;

/// MAIR_EL1 value: index 0 = device-nGnRnE (0x00), index 1 = normal
/// write-back read/write-allocate (0xFF).
pub const MAIR_VALUE: u64 = 0xFF << (8 * MAIR_NORMAL_INDEX);

/// Largest IPS tag we program (52-bit physical addresses).
const MAX_IPS_TAG: u64 = 6;

/// Assembles the TCR_EL1 value for the given physical-address-size tag
/// (the low nibble of `ID_AA64MMFR0_EL1`).
///
/// Always inlined: the early boot caller runs from the low-half boot
/// section and cannot branch into the high-half text.
#[inline(always)]
#[must_use]
pub fn compute_tcr(pa_size_tag: u64) -> u64 {
    let ips = pa_size_tag.min(MAX_IPS_TAG);

    let mut tcr = 0u64;
    // TTBR0 half: T0SZ = 16 (48-bit), WB/WA inner+outer, inner shareable,
    // 4 KiB granule (TG0 = 0).
    tcr |= 16; // T0SZ
    tcr |= 0b01 << 8; // IRGN0
    tcr |= 0b01 << 10; // ORGN0
    tcr |= 0b11 << 12; // SH0
    // TTBR1 half: T1SZ = 16, same walk attributes, 4 KiB granule
    // (TG1 = 0b10).
    tcr |= 16 << 16; // T1SZ
    tcr |= 0b01 << 24; // IRGN1
    tcr |= 0b01 << 26; // ORGN1
    tcr |= 0b11 << 28; // SH1
    tcr |= 0b10 << 30; // TG1
    // Intermediate physical size from the feature register.
    tcr |= ips << 32;
    tcr
}

/// `ID_AA64MMFR0_EL1` reports 4 KiB-granule support in bits 28..31:
/// 0 means supported, 0xF means unsupported.
#[inline(always)]
#[must_use]
pub fn granule_4k_supported(mmfr0: u64) -> bool {
    (mmfr0 >> 28) & 0xF != 0xF
}

/// Extracts the physical-address-size tag from `ID_AA64MMFR0_EL1`.
#[inline(always)]
#[must_use]
pub fn pa_size_tag(mmfr0: u64) -> u64 {
    mmfr0 & 0xF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcr_va_sizes_are_48_bit() {
        let tcr = compute_tcr(0);
        assert_eq!(tcr & 0x3F, 16); // T0SZ
        assert_eq!((tcr >> 16) & 0x3F, 16); // T1SZ
    }

    #[test]
    fn tcr_granules() {
        let tcr = compute_tcr(0);
        assert_eq!((tcr >> 14) & 0b11, 0); // TG0 = 4 KiB
        assert_eq!((tcr >> 30) & 0b11, 0b10); // TG1 = 4 KiB
    }

    #[test]
    fn tcr_ips_from_feature_tag() {
        assert_eq!((compute_tcr(0) >> 32) & 0b111, 0); // 32-bit PA
        assert_eq!((compute_tcr(5) >> 32) & 0b111, 5); // 48-bit PA
        // Out-of-range tags clamp.
        assert_eq!((compute_tcr(0xF) >> 32) & 0b111, MAX_IPS_TAG);
    }

    #[test]
    fn mair_layout() {
        // Device index must be attribute 0x00, normal 0xFF.
        assert_eq!((MAIR_VALUE >> (8 * MAIR_DEVICE_INDEX)) & 0xFF, 0x00);
        assert_eq!((MAIR_VALUE >> (8 * MAIR_NORMAL_INDEX)) & 0xFF, 0xFF);
    }

    #[test]
    fn granule_support_detection() {
        assert!(granule_4k_supported(0x0000_0000));
        assert!(granule_4k_supported(0x1000_0005));
        assert!(!granule_4k_supported(0xF000_0000));
        assert_eq!(pa_size_tag(0x1234_5678_9ABC_DEF5), 5);
    }
}
