//! Stripe layout arithmetic shared by the write and read paths.
//!
//! For a logical file of `total_len` bytes in `block_size` units:
//!
//! - full blocks alternate between data disc 0 and data disc 1 in logical
//!   order;
//! - a final partial block always lands on data disc 0;
//! - the parity file stores `d0_block[j] XOR d1_block[j]` by *file
//!   position* `j` (the shorter operand zero-padded) followed by the
//!   logical length as a trailing big-endian `u64`.
//!
//! Data disc 0 therefore never holds fewer bytes than data disc 1, and the
//! parity file's data region always mirrors data disc 0's block structure.

/// Byte width of the parity file's logical-length trailer.
pub(crate) const PARITY_TRAILER_LEN: usize = 8;

/// Per-disc block structure of one striped logical file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StripeLayout {
    pub block_size: usize,
    pub total_len: u64,
    /// Block lengths on data disc 0, in file order.
    pub disc0_blocks: Vec<usize>,
    /// Block lengths on data disc 1, in file order (always full blocks).
    pub disc1_blocks: Vec<usize>,
}

impl StripeLayout {
    pub(crate) fn compute(total_len: u64, block_size: usize) -> Self {
        let block = block_size as u64;
        let full_blocks = total_len / block;
        let residue = (total_len % block) as usize;

        let disc0_full = full_blocks.div_ceil(2) as usize;
        let disc1_full = (full_blocks / 2) as usize;

        let mut disc0_blocks = vec![block_size; disc0_full];
        if residue > 0 {
            disc0_blocks.push(residue);
        }
        Self {
            block_size,
            total_len,
            disc0_blocks,
            disc1_blocks: vec![block_size; disc1_full],
        }
    }

    pub(crate) fn disc0_len(&self) -> u64 {
        self.disc0_blocks.iter().map(|&len| len as u64).sum()
    }

    pub(crate) fn disc1_len(&self) -> u64 {
        self.disc1_blocks.iter().map(|&len| len as u64).sum()
    }
}

/// XOR of two blocks, zero-padding the shorter; result length is the longer.
pub(crate) fn xor_blocks(a: &[u8], b: &[u8]) -> Vec<u8> {
    let (longer, shorter) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut out = longer.to_vec();
    for (slot, &byte) in out.iter_mut().zip(shorter.iter()) {
        *slot ^= byte;
    }
    out
}
