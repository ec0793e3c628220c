//! Element layout inside the memory image.
//!
//! Elements are bit-packed little-endian: element `i` of a `w`-bit tensor
//! occupies bits `i*w .. (i+1)*w` counted from the tensor's base address.
//! Element order is row-major over the aligned shape; padding lanes are zero.

use crate::ir::graph::AlignedLayout;

/// Write the low `width` bits of `value` at `bit_offset`.
pub fn write_bits(buf: &mut [u8], bit_offset: usize, width: u32, value: i64) {
    let raw = value as u64;
    for bit in 0..width as usize {
        let pos = bit_offset + bit;
        let mask = 1u8 << (pos % 8);
        if (raw >> bit) & 1 == 1 {
            buf[pos / 8] |= mask;
        } else {
            buf[pos / 8] &= !mask;
        }
    }
}

/// Read `width` bits at `bit_offset`, sign-extending when `signed`.
pub fn read_bits(buf: &[u8], bit_offset: usize, width: u32, signed: bool) -> i64 {
    let mut raw: u64 = 0;
    for bit in 0..width as usize {
        let pos = bit_offset + bit;
        if (buf[pos / 8] >> (pos % 8)) & 1 == 1 {
            raw |= 1 << bit;
        }
    }
    if signed && width < 64 && (raw >> (width - 1)) & 1 == 1 {
        raw |= u64::MAX << width;
    }
    raw as i64
}

/// Aligned flat index of the logical row-major element `index`.
pub fn aligned_index(index: usize, shape: &[usize], aligned: &AlignedLayout) -> usize {
    let strides = aligned.strides();
    let mut rem = index;
    let mut flat = 0;
    for axis in (0..shape.len()).rev() {
        flat += (rem % shape[axis]) * strides[axis];
        rem /= shape[axis];
    }
    flat
}

/// Bytes needed for `elements` values of `width` bits.
pub fn packed_len(elements: usize, width: u32) -> usize {
    (elements * width as usize).div_ceil(8)
}

/// Pack logical values into their aligned, bit-packed byte image.
pub fn pack(values: &[i64], shape: &[usize], aligned: &AlignedLayout, width: u32) -> Vec<u8> {
    let mut buf = vec![0u8; packed_len(aligned.num_elements(), width)];
    for (i, &v) in values.iter().enumerate() {
        let slot = aligned_index(i, shape, aligned);
        write_bits(&mut buf, slot * width as usize, width, v);
    }
    buf
}

/// Inverse of [`pack`] over the logical elements.
pub fn unpack(
    buf: &[u8],
    shape: &[usize],
    aligned: &AlignedLayout,
    width: u32,
    signed: bool,
) -> Vec<i64> {
    let count: usize = shape.iter().product();
    (0..count)
        .map(|i| {
            let slot = aligned_index(i, shape, aligned);
            read_bits(buf, slot * width as usize, width, signed)
        })
        .collect()
}
