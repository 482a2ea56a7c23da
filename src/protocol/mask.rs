//! Payload masking (RFC 6455 Section 5.3).

/// XOR the payload with the 4-byte masking key.
///
/// Masking and unmasking are the same operation. Processes aligned 4-byte
/// chunks as `u32` words with a byte-wise tail.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);
    let (chunks, tail) = data.split_at_mut(data.len() / 4 * 4);

    for chunk in chunks.chunks_exact_mut(4) {
        let val = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        chunk.copy_from_slice(&(val ^ mask_u32).to_ne_bytes());
    }

    for (i, byte) in tail.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}
