//! The flat, byte-addressable image behind the `maxi` data port.
//!
//! The host fills it before launch, the design reads operands from it and
//! writes results back. Ranges the design must not touch are protected once
//! the verifier has addressed the design.

use std::ops::Range;

use nnhw_compiler::ir::graph::{AlignedLayout, Tensor};
use nnhw_compiler::memory::layout;

use crate::error::{SimError, SimResult};
use crate::protocol::{read_u32_le, write_u32_le};

#[derive(Debug, Clone)]
struct Protected {
    name: String,
    range: Range<u64>,
}

#[derive(Debug, Clone)]
pub struct MemoryImage {
    bytes: Vec<u8>,
    protected: Vec<Protected>,
}

fn aligned(tensor: &Tensor) -> SimResult<&AlignedLayout> {
    tensor.aligned.as_ref().ok_or_else(|| SimError::Layout {
        tensor: tensor.name.clone(),
        reason: "no aligned shape".into(),
    })
}

impl MemoryImage {
    /// An image of `size` bytes, every byte set to `fill`.
    pub fn new(size: u64, fill: u8) -> Self {
        MemoryImage {
            bytes: vec![fill; size as usize],
            protected: Vec::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn span(&self, addr: u64, len: u64) -> SimResult<Range<usize>> {
        match addr.checked_add(len) {
            Some(end) if end <= self.len() => Ok(addr as usize..end as usize),
            _ => Err(SimError::OutOfBounds {
                addr,
                len,
                size: self.len(),
            }),
        }
    }

    fn check_writable(&self, addr: u64, len: u64) -> SimResult<()> {
        let end = addr.saturating_add(len);
        match self
            .protected
            .iter()
            .find(|p| addr < p.range.end && p.range.start < end)
        {
            Some(p) => Err(SimError::ProtectedWrite {
                region: p.name.clone(),
                addr: addr.max(p.range.start),
            }),
            None => Ok(()),
        }
    }

    /// Make `[addr, addr + len)` read-only until [`unprotect_all`](Self::unprotect_all).
    pub fn protect(&mut self, name: impl Into<String>, addr: u64, len: u64) {
        if len > 0 {
            self.protected.push(Protected {
                name: name.into(),
                range: addr..addr + len,
            });
        }
    }

    pub fn unprotect_all(&mut self) {
        self.protected.clear();
    }

    pub fn read(&self, addr: u64, len: u64) -> SimResult<&[u8]> {
        let span = self.span(addr, len)?;
        Ok(&self.bytes[span])
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> SimResult<()> {
        let span = self.span(addr, data.len() as u64)?;
        self.check_writable(addr, data.len() as u64)?;
        self.bytes[span].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, addr: u64, len: u64, byte: u8) -> SimResult<()> {
        let span = self.span(addr, len)?;
        self.check_writable(addr, len)?;
        self.bytes[span].fill(byte);
        Ok(())
    }

    pub fn read_u32(&self, addr: u64) -> SimResult<u32> {
        let span = self.span(addr, 4)?;
        read_u32_le(&self.bytes, span.start).ok_or(SimError::OutOfBounds {
            addr,
            len: 4,
            size: self.len(),
        })
    }

    pub fn write_u32(&mut self, addr: u64, val: u32) -> SimResult<()> {
        let span = self.span(addr, 4)?;
        self.check_writable(addr, 4)?;
        write_u32_le(&mut self.bytes, span.start, val).ok_or(SimError::OutOfBounds {
            addr,
            len: 4,
            size: self.len(),
        })
    }

    /// Write all logical values of `tensor` at `base`, padding lanes zeroed.
    pub fn load_tensor(&mut self, base: u64, tensor: &Tensor, values: &[i64]) -> SimResult<()> {
        if values.len() != tensor.num_elements() {
            return Err(SimError::Layout {
                tensor: tensor.name.clone(),
                reason: format!(
                    "{} values for {} elements",
                    values.len(),
                    tensor.num_elements()
                ),
            });
        }
        let bytes = layout::pack(values, &tensor.shape, aligned(tensor)?, tensor.dtype.width);
        self.write(base, &bytes)
    }

    /// Read all logical values of `tensor` stored at `base`.
    pub fn read_tensor(&self, base: u64, tensor: &Tensor) -> SimResult<Vec<i64>> {
        let bytes = self.read(base, tensor.memory_size())?;
        Ok(layout::unpack(
            bytes,
            &tensor.shape,
            aligned(tensor)?,
            tensor.dtype.width,
            tensor.dtype.signed,
        ))
    }

    /// Byte span and in-span bit offset of logical element `index`.
    fn element_span(&self, base: u64, tensor: &Tensor, index: usize) -> SimResult<(u64, u64, usize)> {
        let slot = layout::aligned_index(index, &tensor.shape, aligned(tensor)?);
        let width = tensor.dtype.width as usize;
        let bit = slot * width;
        let first = base + (bit / 8) as u64;
        let len = ((bit % 8 + width).div_ceil(8)) as u64;
        self.span(first, len)?;
        Ok((first, len, bit % 8))
    }

    pub fn read_element(&self, base: u64, tensor: &Tensor, index: usize) -> SimResult<i64> {
        let (addr, len, shift) = self.element_span(base, tensor, index)?;
        let bytes = self.read(addr, len)?;
        Ok(layout::read_bits(
            bytes,
            shift,
            tensor.dtype.width,
            tensor.dtype.signed,
        ))
    }

    pub fn write_element(
        &mut self,
        base: u64,
        tensor: &Tensor,
        index: usize,
        value: i64,
    ) -> SimResult<()> {
        let (addr, len, shift) = self.element_span(base, tensor, index)?;
        self.check_writable(addr, len)?;
        let start = addr as usize;
        layout::write_bits(
            &mut self.bytes[start..start + len as usize],
            shift,
            tensor.dtype.width,
            value,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nnhw_compiler::ir::graph::{DType, Graph, TensorKind};
    use proptest::prelude::*;

    fn tensor(width: u32, shape: Vec<usize>, lanes: usize) -> Tensor {
        let mut g = Graph::new();
        let id = g
            .add_tensor("t", shape.clone(), DType::int(width), TensorKind::Placeholder)
            .unwrap();
        let mut aligned = shape;
        let last = aligned.len() - 1;
        aligned[last] = aligned[last].div_ceil(lanes) * lanes;
        g.tensor_mut(id).aligned = Some(AlignedLayout {
            shape: aligned,
            lanes,
        });
        g.tensor(id).clone()
    }

    #[test]
    fn starts_filled() {
        let image = MemoryImage::new(16, 100);
        assert_eq!(image.read(0, 16).unwrap(), &[100u8; 16][..]);
        assert!(matches!(
            image.read(12, 8),
            Err(SimError::OutOfBounds { addr: 12, len: 8, size: 16 })
        ));
    }

    #[test]
    fn tensor_roundtrip_zeroes_padding() {
        let t = tensor(8, vec![2, 3], 4);
        let mut image = MemoryImage::new(64, 100);
        image.load_tensor(8, &t, &[1, -2, 3, 4, 5, -6]).unwrap();
        assert_eq!(image.read(8, 8).unwrap(), &[1, 0xfe, 3, 0, 4, 5, 0xfa, 0]);
        assert_eq!(image.read_tensor(8, &t).unwrap(), vec![1, -2, 3, 4, 5, -6]);
        assert_eq!(image.read_element(8, &t, 4).unwrap(), 5);
        assert_eq!(image.read(16, 1).unwrap(), &[100]);
    }

    #[test]
    fn sub_byte_elements() {
        let t = tensor(4, vec![1, 3], 4);
        let mut image = MemoryImage::new(8, 0);
        image.write_element(0, &t, 1, -1).unwrap();
        image.write_element(0, &t, 2, 5).unwrap();
        assert_eq!(image.read(0, 2).unwrap(), &[0xf0, 0x05]);
        assert_eq!(image.read_element(0, &t, 1).unwrap(), -1);
    }

    #[test]
    fn protected_ranges_reject_writes() {
        let t = tensor(32, vec![4], 1);
        let mut image = MemoryImage::new(64, 0);
        image.protect("reference", 16, 16);
        assert!(image.write_u32(12, 7).is_ok());
        let err = image.write_element(16, &t, 1, 9).unwrap_err();
        assert!(matches!(
            err,
            SimError::ProtectedWrite { ref region, addr: 20 } if region == "reference"
        ));
        assert!(image.fill(30, 4, 0).is_err());
        image.unprotect_all();
        assert!(image.write_element(16, &t, 1, 9).is_ok());
        assert_eq!(image.read_u32(20).unwrap(), 9);
    }

    proptest! {
        #[test]
        fn element_writes_leave_neighbours_alone(
            width in 1u32..=32,
            index in 0usize..12,
            value in any::<i64>(),
        ) {
            let t = tensor(width, vec![3, 4], 4);
            let mut image = MemoryImage::new(64, 0);
            let before: Vec<i64> = (0..12).map(|i| image.read_element(0, &t, i).unwrap()).collect();
            image.write_element(0, &t, index, value).unwrap();
            for i in (0..12).filter(|&i| i != index) {
                prop_assert_eq!(image.read_element(0, &t, i).unwrap(), before[i]);
            }
            let mask = (1u64 << width) - 1;
            let got = image.read_element(0, &t, index).unwrap() as u64 & mask;
            prop_assert_eq!(got, value as u64 & mask);
        }
    }
}
