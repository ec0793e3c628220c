//! Memory allocation for the accelerator's flat, byte-addressable image.
//!
//! One pass, four regions, in this order:
//! 1. **Activations** — placeholders, then outputs (declaration order)
//! 2. **Parameters** — variables, then constants; the serialized parameter blob
//! 3. **Reference** — one slot per output holding the expected results
//! 4. **Scratch** — intermediates, then one chunk of handshake bookkeeping
//!
//! Every entity starts on a chunk boundary.

pub mod layout;

use std::collections::HashMap;

use crate::error::{CompileError, CompileResult};
use crate::ir::graph::{Graph, TensorId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Activations,
    Parameters,
    Reference,
    Scratch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub kind: RegionKind,
    pub base: u64,
    /// Chunk-rounded byte size.
    pub size: u64,
    pub chunk_size: u64,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Chunk-aligned addresses for `items`, walked in order from `start`.
///
/// `addr = running`, then `running = ceil((addr + size) / chunk) * chunk`.
/// Returns the addresses and the final running offset.
pub fn allocate<'a>(
    items: impl IntoIterator<Item = (&'a str, u64)>,
    start: u64,
    chunk_size: u64,
    bound: u64,
) -> CompileResult<(Vec<u64>, u64)> {
    if chunk_size == 0 {
        return Err(CompileError::Config("chunk_size must be > 0".into()));
    }
    let mut running = start.div_ceil(chunk_size) * chunk_size;
    let mut addrs = Vec::new();
    for (name, size) in items {
        let addr = running;
        let end = addr
            .checked_add(size)
            .map(|end| end.div_ceil(chunk_size) * chunk_size)
            .filter(|&end| end <= bound)
            .ok_or_else(|| CompileError::AddressOverflow {
                entity: name.to_string(),
                end: addr.saturating_add(size),
                bound,
            })?;
        addrs.push(addr);
        running = end;
    }
    Ok((addrs, running))
}

/// Address metadata handed to the emission backend and the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    pub chunk_size: u64,
    /// Regions in allocation order.
    pub regions: Vec<MemoryRegion>,
    /// Reference slot address per output tensor.
    pub reference: Vec<(TensorId, u64)>,
    /// Parameter offsets relative to the parameter region base; the blob has no header.
    pub param_offsets: Vec<(TensorId, u64)>,
    /// Word where the hardware records completion.
    pub handshake_addr: u64,
    /// First byte after the last region.
    pub end: u64,
}

impl MemoryMap {
    pub fn region(&self, kind: RegionKind) -> CompileResult<&MemoryRegion> {
        self.regions
            .iter()
            .find(|r| r.kind == kind)
            .ok_or_else(|| CompileError::Graph(format!("memory map has no {kind:?} region")))
    }

    pub fn reference_addr(&self, output: TensorId) -> Option<u64> {
        self.reference
            .iter()
            .find(|(id, _)| *id == output)
            .map(|&(_, addr)| addr)
    }

    pub fn param_offset(&self, id: TensorId) -> Option<u64> {
        self.param_offsets
            .iter()
            .find(|(t, _)| *t == id)
            .map(|&(_, off)| off)
    }
}

/// Running offset shared by the four region passes.
struct Cursor {
    running: u64,
    chunk_size: u64,
    bound: u64,
    regions: Vec<MemoryRegion>,
}

impl Cursor {
    fn place(&mut self, kind: RegionKind, items: &[(String, u64)]) -> CompileResult<Vec<u64>> {
        let (addrs, end) = allocate(
            items.iter().map(|(name, size)| (name.as_str(), *size)),
            self.running,
            self.chunk_size,
            self.bound,
        )?;
        self.regions.push(MemoryRegion {
            kind,
            base: self.running,
            size: end - self.running,
            chunk_size: self.chunk_size,
        });
        self.running = end;
        Ok(addrs)
    }
}

fn sized(graph: &Graph, ids: &[TensorId]) -> Vec<(String, u64)> {
    ids.iter()
        .map(|&id| {
            let t = graph.tensor(id);
            (t.name.clone(), t.memory_size())
        })
        .collect()
}

/// Assign every tensor address and lay out the four regions.
pub fn plan_memory(graph: &mut Graph, chunk_size: u64, bound: u64) -> CompileResult<MemoryMap> {
    let mut cursor = Cursor {
        running: 0,
        chunk_size,
        bound,
        regions: Vec::with_capacity(4),
    };

    let activations: Vec<TensorId> = graph
        .placeholders()
        .into_iter()
        .chain(graph.outputs())
        .collect();
    let addrs = cursor.place(RegionKind::Activations, &sized(graph, &activations))?;
    for (&id, &addr) in activations.iter().zip(&addrs) {
        graph.tensor_mut(id).assign_addr(addr)?;
    }

    let params: Vec<TensorId> = graph
        .variables()
        .into_iter()
        .chain(graph.constants())
        .collect();
    let param_base = cursor.running;
    let addrs = cursor.place(RegionKind::Parameters, &sized(graph, &params))?;
    let mut param_offsets = Vec::with_capacity(params.len());
    for (&id, &addr) in params.iter().zip(&addrs) {
        graph.tensor_mut(id).assign_addr(addr)?;
        param_offsets.push((id, addr - param_base));
    }

    let outputs = graph.outputs();
    let slots: Vec<(String, u64)> = sized(graph, &outputs)
        .into_iter()
        .map(|(name, size)| (format!("{name}.reference"), size))
        .collect();
    let addrs = cursor.place(RegionKind::Reference, &slots)?;
    let reference: Vec<(TensorId, u64)> = outputs.into_iter().zip(addrs).collect();

    let intermediates = graph.intermediates();
    let mut scratch = sized(graph, &intermediates);
    scratch.push(("handshake".to_string(), chunk_size));
    let addrs = cursor.place(RegionKind::Scratch, &scratch)?;
    for (&id, &addr) in intermediates.iter().zip(&addrs) {
        graph.tensor_mut(id).assign_addr(addr)?;
    }

    let map = MemoryMap {
        chunk_size,
        regions: cursor.regions,
        reference,
        param_offsets,
        handshake_addr: addrs[intermediates.len()],
        end: cursor.running,
    };
    for region in &map.regions {
        log::debug!(
            "{:?}: {:#x}..{:#x} ({} bytes)",
            region.kind,
            region.base,
            region.end(),
            region.size
        );
    }
    log::info!("memory image: {} bytes, chunk {}", map.end, chunk_size);
    Ok(map)
}

/// Serialize variables then constants at their chunk-aligned blob offsets.
///
/// Gap bytes are zero. Tensors must be quantized and aligned.
pub fn param_blob(graph: &Graph, map: &MemoryMap) -> CompileResult<Vec<u8>> {
    let region = map.region(RegionKind::Parameters)?;
    let mut blob = vec![0u8; region.size as usize];
    for &(id, offset) in &map.param_offsets {
        let t = graph.tensor(id);
        let (Some(values), Some(aligned)) = (t.quantized.as_ref(), t.aligned.as_ref()) else {
            return Err(CompileError::Graph(format!(
                "parameter `{}` has not been quantized and aligned",
                t.name
            )));
        };
        let bytes = layout::pack(values, &t.shape, aligned, t.dtype.width);
        let start = offset as usize;
        blob[start..start + bytes.len()].copy_from_slice(&bytes);
    }
    Ok(blob)
}

/// Name → address table, useful for logs and host drivers.
pub fn address_table(graph: &Graph) -> HashMap<String, u64> {
    graph
        .tensors
        .iter()
        .filter_map(|t| t.addr().map(|a| (t.name.clone(), a)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::graph::{DType, TensorKind};
    use proptest::prelude::*;

    #[test]
    fn sizes_100_and_50_in_chunks_of_64() {
        let (addrs, end) = allocate([("a", 100), ("b", 50)], 0, 64, 1 << 20).unwrap();
        assert_eq!(addrs, vec![0, 128]);
        assert_eq!(end, 192);
    }

    #[test]
    fn overflow_names_entity() {
        let err = allocate([("a", 100), ("big", 1000)], 0, 64, 512).unwrap_err();
        assert_eq!(
            err,
            CompileError::AddressOverflow {
                entity: "big".into(),
                end: 1128,
                bound: 512
            }
        );
    }

    #[test]
    fn zero_chunk_is_config_error() {
        assert!(matches!(
            allocate([("a", 1)], 0, 0, 64),
            Err(CompileError::Config(_))
        ));
    }

    fn small_graph() -> Graph {
        let mut g = Graph::new();
        g.add_tensor("x", vec![4], DType::int(32), TensorKind::Placeholder)
            .unwrap();
        g.add_tensor(
            "w",
            vec![3],
            DType::int(8),
            TensorKind::Variable {
                values: vec![1.0, 2.0, 3.0],
            },
        )
        .unwrap();
        g.add_tensor(
            "k",
            vec![2],
            DType::int(16),
            TensorKind::Constant {
                values: vec![1.0, -1.0],
            },
        )
        .unwrap();
        g.add_tensor("t", vec![8], DType::int(32), TensorKind::Intermediate)
            .unwrap();
        g.add_tensor("y", vec![100], DType::int(32), TensorKind::Output)
            .unwrap();
        g
    }

    #[test]
    fn regions_in_order() {
        let mut g = small_graph();
        let map = plan_memory(&mut g, 64, 1 << 20).unwrap();
        let addr = |name: &str| g.tensor(g.tensor_by_name(name).unwrap()).addr().unwrap();

        assert_eq!(addr("x"), 0);
        assert_eq!(addr("y"), 64); // outputs follow placeholders
        assert_eq!(addr("w"), 512);
        assert_eq!(addr("k"), 576);
        assert_eq!(map.param_offsets, vec![(1, 0), (2, 64)]);
        assert_eq!(map.reference, vec![(4, 640)]);
        assert_eq!(addr("t"), 1088);
        assert_eq!(map.handshake_addr, 1152);
        assert_eq!(map.end, 1216);

        let kinds: Vec<_> = map.regions.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RegionKind::Activations,
                RegionKind::Parameters,
                RegionKind::Reference,
                RegionKind::Scratch
            ]
        );
        for pair in map.regions.windows(2) {
            assert_eq!(pair[0].end(), pair[1].base);
        }
        assert_eq!(map.region(RegionKind::Reference).unwrap().base, 640);
    }

    #[test]
    fn region_lookup_ignores_storage_order() {
        let mut g = small_graph();
        let mut map = plan_memory(&mut g, 64, 1 << 20).unwrap();
        let scratch = map.region(RegionKind::Scratch).unwrap().clone();
        map.regions.reverse();
        assert_eq!(map.region(RegionKind::Scratch).unwrap(), &scratch);
        map.regions.retain(|r| r.kind != RegionKind::Reference);
        assert!(map.region(RegionKind::Reference).is_err());
    }

    #[test]
    fn blob_places_params_at_offsets() {
        let mut g = small_graph();
        for t in &mut g.tensors {
            t.aligned = Some(crate::ir::graph::AlignedLayout {
                shape: t.shape.clone(),
                lanes: 1,
            });
        }
        g.tensor_mut(1).quantized = Some(vec![1, 2, 3]);
        g.tensor_mut(2).quantized = Some(vec![1, -1]);
        let map = plan_memory(&mut g, 64, 1 << 20).unwrap();
        let blob = param_blob(&g, &map).unwrap();
        assert_eq!(blob.len(), 128);
        assert_eq!(&blob[..4], &[1, 2, 3, 0]);
        assert_eq!(&blob[64..68], &[1, 0, 0xff, 0xff]);
        assert!(blob[68..].iter().all(|&b| b == 0));
    }

    #[test]
    fn unquantized_params_rejected() {
        let mut g = small_graph();
        let map = plan_memory(&mut g, 64, 1 << 20).unwrap();
        assert!(param_blob(&g, &map).is_err());
    }

    proptest! {
        #[test]
        fn addresses_disjoint_and_aligned(
            sizes in prop::collection::vec(1u64..5000, 1..20),
            chunk in prop::sample::select(vec![1u64, 4, 16, 64, 256]),
        ) {
            let names: Vec<String> = (0..sizes.len()).map(|i| format!("t{i}")).collect();
            let items = names.iter().map(String::as_str).zip(sizes.iter().copied());
            let (addrs, _) = allocate(items, 0, chunk, u64::MAX).unwrap();
            for (i, (&a, &s)) in addrs.iter().zip(&sizes).enumerate() {
                prop_assert_eq!(a % chunk, 0);
                if let Some(&next) = addrs.get(i + 1) {
                    prop_assert!(a + s <= next);
                }
            }

            // reproducible
            let again = allocate(
                names.iter().map(String::as_str).zip(sizes.iter().copied()),
                0,
                chunk,
                u64::MAX,
            )
            .unwrap();
            prop_assert_eq!(again.0, addrs);
        }
    }
}
