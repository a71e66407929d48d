//! Small shared helpers: 2-bit sequence codecs, Hamming distance on encoded
//! sequences and the progress bar used by the dispatcher.

use indicatif::{ProgressBar, ProgressStyle};

/// Encode an ACGT sequence into its 2-bit integer representation
/// (A=00, C=01, G=10, T=11; the first base lands in the highest bits,
/// so numeric order matches lexicographic order).
///
/// Panics on a non-ACGT byte; callers validate their input first.
pub fn seq_to_int(seq: &str) -> u64 {
    assert!(seq.len() <= 32, "sequence longer than 32 bases");
    let mut r: u64 = 0;
    for c in seq.bytes() {
        let code = match c {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' => 3,
            _ => panic!("non-ACGT base {}", c as char),
        };
        r = (r << 2) | code;
    }
    r
}

/// Decode a 2-bit encoded sequence of known length back into a string.
pub fn int_to_seq(i: u64, len: usize) -> String {
    let mut seq = String::with_capacity(len);
    for k in (0..len).rev() {
        seq.push(match (i >> (2 * k)) & 3 {
            0 => 'A',
            1 => 'C',
            2 => 'G',
            _ => 'T',
        });
    }
    seq
}

/// Hamming distance between two 2-bit encoded sequences of the same length:
/// the number of base positions at which they differ.
pub fn hamming_dist(a: u64, b: u64) -> u32 {
    let x = a ^ b;
    // fold each 2-bit symbol difference down to its low bit
    ((x | (x >> 1)) & 0x5555_5555_5555_5555).count_ones()
}

/// Progress bar over cells, styled like the rest of our tools.
pub fn get_progressbar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40} {pos}/{len} cells [{elapsed_precise}] {msg}")
            .unwrap(),
    );
    bar
}
