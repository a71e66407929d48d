//! Barcode-layout protocols.
//!
//! Each single-cell library prep puts the cell barcode and the UMI at fixed
//! positions of the barcode read. The quantifier only needs the two lengths
//! and a way to split a read prefix, so protocols are a small capability
//! trait rather than a type parameter.

use crate::utils::seq_to_int;

/// Capability interface of a barcode layout.
pub trait Protocol {
    /// Cell-barcode length in bases.
    fn barcode_length(&self) -> usize;

    /// UMI length in bases.
    fn umi_length(&self) -> usize;

    /// Split the read prefix into 2-bit encoded `(barcode, umi)`.
    ///
    /// Returns `None` when the read is too short or contains a non-ACGT base.
    fn extract(&self, read: &str) -> Option<(u64, u64)> {
        let (bl, ul) = (self.barcode_length(), self.umi_length());
        let bytes = read.as_bytes();
        if bytes.len() < bl + ul
            || !bytes[..bl + ul].iter().all(|c| matches!(c, b'A' | b'C' | b'G' | b'T'))
        {
            return None;
        }
        Some((seq_to_int(&read[..bl]), seq_to_int(&read[bl..bl + ul])))
    }
}

/// DropSeq: 12 base barcode, 8 base UMI.
pub struct DropSeq;

impl Protocol for DropSeq {
    fn barcode_length(&self) -> usize {
        12
    }
    fn umi_length(&self) -> usize {
        8
    }
}

/// 10x Chromium v2: 16 base barcode, 10 base UMI.
pub struct Chromium;

impl Protocol for Chromium {
    fn barcode_length(&self) -> usize {
        16
    }
    fn umi_length(&self) -> usize {
        10
    }
}

/// 10x Chromium v3: 16 base barcode, 12 base UMI.
pub struct ChromiumV3;

impl Protocol for ChromiumV3 {
    fn barcode_length(&self) -> usize {
        16
    }
    fn umi_length(&self) -> usize {
        12
    }
}

/// 10x GemCode v1: 14 base barcode, 10 base UMI.
pub struct Gemcode;

impl Protocol for Gemcode {
    fn barcode_length(&self) -> usize {
        14
    }
    fn umi_length(&self) -> usize {
        10
    }
}

/// User-specified layout for protocols we do not know by name.
pub struct CustomProtocol {
    /// Cell-barcode length in bases.
    pub barcode_length: usize,
    /// UMI length in bases.
    pub umi_length: usize,
}

impl Protocol for CustomProtocol {
    fn barcode_length(&self) -> usize {
        self.barcode_length
    }
    fn umi_length(&self) -> usize {
        self.umi_length
    }
}
