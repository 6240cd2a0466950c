use std::collections::{HashMap, HashSet};

use crate::error::Error;
use crate::ir::{Buffer, PrimFunc, Stmt};

/// Banking geometry of the local SRAM
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BankGeometry {
    pub bank_num: i64,
    pub bank_size: i64,
}

impl Default for BankGeometry {
    fn default() -> Self {
        Self {
            bank_num: 16,
            bank_size: 16 * 1024,
        }
    }
}

impl BankGeometry {
    /// Total local memory in bytes
    #[must_use]
    pub fn mem_size(self) -> i64 {
        self.bank_num * self.bank_size
    }
}

/// One on-chip allocation the planner must place
#[derive(Debug, Clone)]
pub struct Allocation {
    pub name: String,
    /// Planner-visible byte size (the per-lane slice of the tensor)
    pub size: i64,
    /// Live interval, inclusive on both ends
    pub first: u32,
    pub last: u32,
}

impl Allocation {
    #[must_use]
    pub fn new(name: impl Into<String>, size: i64, first: u32, last: u32) -> Self {
        Self {
            name: name.into(),
            size,
            first,
            last,
        }
    }
}

#[derive(Debug, Clone)]
struct Placed {
    index: usize,
    start: i64,
    end: i64,
    first: u32,
    last: u32,
}

/// Bank-conflict-aware first-fit placement over a banked local memory.
///
/// Allocations are placed largest first. For each one, every feasible
/// starting bank is probed with a smallest-gap first-fit against the
/// already-placed, live-overlapping allocations; among the fitting
/// candidates the one whose bank span holds the fewest conflicting
/// neighbors wins, ties toward the lower offset.
#[derive(Debug)]
pub struct BankAllocator {
    geometry: BankGeometry,
    placed: Vec<Placed>,
    bank_residents: Vec<Vec<usize>>,
    total_consumption: i64,
}

impl BankAllocator {
    #[must_use]
    pub fn new(geometry: BankGeometry) -> Self {
        Self {
            geometry,
            placed: Vec::new(),
            bank_residents: vec![Vec::new(); geometry.bank_num as usize],
            total_consumption: 0,
        }
    }

    /// High-water mark of the packing, once [`assign`](Self::assign) ran
    #[must_use]
    pub fn total_consumption(&self) -> i64 {
        self.total_consumption
    }

    /// Place every allocation; returns byte offsets in input order.
    ///
    /// `conflicts[i]` is the set of allocation indices that should
    /// preferentially not share a bank with allocation `i`.
    pub fn assign(
        &mut self,
        allocs: &[Allocation],
        conflicts: &[HashSet<usize>],
    ) -> Result<Vec<i64>, Error> {
        let mut order: Vec<usize> = (0..allocs.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(allocs[i].size));

        let mut offsets = vec![0i64; allocs.len()];
        for &index in &order {
            let alloc = &allocs[index];
            let candidate = self.place_one(index, alloc, conflicts)?;
            offsets[index] = candidate.start;
            self.insert(candidate);
        }
        Ok(offsets)
    }

    fn place_one(
        &self,
        index: usize,
        alloc: &Allocation,
        conflicts: &[HashSet<usize>],
    ) -> Result<Placed, Error> {
        let BankGeometry {
            bank_num,
            bank_size,
        } = self.geometry;
        let cross_banks = (alloc.size + bank_size - 1) / bank_size;
        let mut best: Option<(Placed, i64)> = None;
        for bank in 0..bank_num {
            if bank + cross_banks >= bank_num {
                break;
            }
            let offset = bank * bank_size;
            let window_end = offset + (cross_banks + 1) * bank_size;
            let candidate = self.search(index, alloc, offset, window_end);
            if candidate.end >= window_end.min(self.geometry.mem_size()) {
                continue;
            }
            let count = self.conflict_count(&candidate, conflicts);
            match &best {
                Some((_, best_count)) if count >= *best_count => {}
                _ => best = Some((candidate, count)),
            }
        }
        best.map(|(placed, _)| placed).ok_or_else(|| Error::AllocationFailed {
            buffer: alloc.name.clone(),
            reason: format!(
                "{} bytes do not fit in {} banks of {} bytes",
                alloc.size, bank_num, bank_size
            ),
        })
    }

    /// Smallest-gap first-fit within `[offset, window_end)`, skipping
    /// placed allocations whose live interval does not overlap
    fn search(&self, index: usize, alloc: &Allocation, offset: i64, window_end: i64) -> Placed {
        let mut prev_offset = offset;
        let mut best_offset = None;
        let mut smallest_gap = i64::MAX;
        for placed in &self.placed {
            if placed.start > window_end {
                break;
            }
            let overlap_start = alloc.first.max(placed.first);
            let overlap_end = alloc.last.min(placed.last);
            if overlap_start < overlap_end {
                let gap = placed.start - prev_offset;
                if gap >= alloc.size && gap < smallest_gap {
                    smallest_gap = gap;
                    best_offset = Some(prev_offset);
                }
                prev_offset = prev_offset.max(placed.end);
            }
        }
        let start = best_offset.unwrap_or(prev_offset);
        Placed {
            index,
            start,
            end: start + alloc.size,
            first: alloc.first,
            last: alloc.last,
        }
    }

    fn conflict_count(&self, candidate: &Placed, conflicts: &[HashSet<usize>]) -> i64 {
        let bank_start = candidate.start / self.geometry.bank_size;
        let bank_end = candidate.end / self.geometry.bank_size;
        let mut count = 0;
        for bank in bank_start..=bank_end {
            let Some(residents) = self.bank_residents.get(bank as usize) else {
                continue;
            };
            for &other in residents {
                if conflicts[candidate.index].contains(&other) {
                    count += 1;
                }
            }
        }
        count
    }

    fn insert(&mut self, placed: Placed) {
        self.total_consumption = self.total_consumption.max(placed.end);
        let bank_start = placed.start / self.geometry.bank_size;
        let bank_end = placed.end / self.geometry.bank_size;
        for bank in bank_start..=bank_end {
            if let Some(residents) = self.bank_residents.get_mut(bank as usize) {
                residents.push(placed.index);
            }
        }
        let at = self
            .placed
            .iter()
            .position(|p| p.start >= placed.start)
            .unwrap_or(self.placed.len());
        self.placed.insert(at, placed);
    }
}

/// Collect the on-chip buffers declared inside a function body, in
/// declaration order
fn collect_decl_buffers(stmt: &Stmt, out: &mut Vec<Buffer>) {
    match stmt {
        Stmt::DeclBuffer { buffer, body } => {
            out.push(buffer.clone());
            collect_decl_buffers(body, out);
        }
        Stmt::For { body, .. }
        | Stmt::LetStmt { body, .. }
        | Stmt::Allocate { body, .. }
        | Stmt::AttrStmt { body, .. } => collect_decl_buffers(body, out),
        Stmt::IfThenElse {
            then_case,
            else_case,
            ..
        } => {
            collect_decl_buffers(then_case, out);
            if let Some(else_case) = else_case {
                collect_decl_buffers(else_case, out);
            }
        }
        Stmt::Seq(stmts) => {
            for s in stmts {
                collect_decl_buffers(s, out);
            }
        }
        Stmt::Evaluate(_) => {}
    }
}

/// Planner-visible byte size of a buffer: the per-bank slice of its
/// element count times the element width
fn planner_size(buffer: &Buffer, geometry: BankGeometry) -> i64 {
    let elems: i64 = buffer.shape.iter().product();
    let bytes = match (buffer.dtype.is_float(), buffer.dtype.bits) {
        (true, 16) => 2,
        (true, 32) => 4,
        _ => 1,
    };
    elems / geometry.bank_num * bytes
}

/// Run the planner over a function and attach `name -> byte offset`
/// attributes for every declared on-chip buffer.
pub fn assign_addresses_with(func: &mut PrimFunc, geometry: BankGeometry) -> Result<(), Error> {
    let mut buffers = Vec::new();
    collect_decl_buffers(&func.body, &mut buffers);
    if buffers.is_empty() {
        return Ok(());
    }

    let allocs: Vec<Allocation> = buffers
        .iter()
        .map(|b| Allocation::new(b.name.clone(), planner_size(b, geometry), 1, 4))
        .collect();
    // Baseline conflict relation: every pair of live buffers conflicts
    let conflicts: Vec<HashSet<usize>> = (0..allocs.len())
        .map(|i| (0..allocs.len()).filter(|&j| j != i).collect())
        .collect();

    let mut allocator = BankAllocator::new(geometry);
    let offsets = allocator.assign(&allocs, &conflicts)?;

    let mut seen: HashMap<String, i64> = HashMap::new();
    for (alloc, offset) in allocs.iter().zip(&offsets) {
        seen.insert(alloc.name.clone(), *offset);
    }
    for (name, offset) in seen {
        func.attrs.insert(name, offset);
    }
    Ok(())
}

/// [`assign_addresses_with`] under the default 16 x 16 KiB geometry
pub fn assign_addresses(func: &mut PrimFunc) -> Result<(), Error> {
    assign_addresses_with(func, BankGeometry::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_conflicts(n: usize) -> Vec<HashSet<usize>> {
        (0..n)
            .map(|i| (0..n).filter(|&j| j != i).collect())
            .collect()
    }

    #[test]
    fn descending_size_first_fit() {
        let kib = 1024;
        let allocs = vec![
            Allocation::new("a", 20 * kib, 1, 4),
            Allocation::new("b", 20 * kib, 1, 4),
            Allocation::new("c", 10 * kib, 1, 4),
        ];
        let mut allocator = BankAllocator::new(BankGeometry::default());
        let offsets = allocator.assign(&allocs, &all_conflicts(3)).unwrap();
        assert_eq!(offsets, vec![0, 32 * kib, 64 * kib]);
        // Every placement starts on a bank boundary here
        for offset in offsets {
            assert_eq!(offset % (16 * kib), 0);
        }
    }

    #[test]
    fn disjoint_live_ranges_may_overlap() {
        let kib = 1024;
        let allocs = vec![
            Allocation::new("a", 8 * kib, 1, 2),
            Allocation::new("b", 8 * kib, 3, 4),
        ];
        let mut allocator = BankAllocator::new(BankGeometry::default());
        let offsets = allocator
            .assign(&allocs, &vec![HashSet::new(), HashSet::new()])
            .unwrap();
        // No live overlap: the first-fit sees no obstacle at offset 0
        assert_eq!(offsets, vec![0, 0]);
    }

    #[test]
    fn overflow_is_allocation_failed() {
        let geometry = BankGeometry::default();
        let allocs = vec![Allocation::new("huge", geometry.mem_size(), 1, 4)];
        let mut allocator = BankAllocator::new(geometry);
        let err = allocator.assign(&allocs, &all_conflicts(1)).unwrap_err();
        match err {
            Error::AllocationFailed { buffer, .. } => assert_eq!(buffer, "huge"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn soundness_and_bounds() {
        let kib = 1024;
        let sizes = [30 * kib, 14 * kib, 14 * kib, 6 * kib, 3 * kib];
        let allocs: Vec<Allocation> = sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| Allocation::new(format!("t{i}"), s, 1, 4))
            .collect();
        let geometry = BankGeometry::default();
        let mut allocator = BankAllocator::new(geometry);
        let offsets = allocator.assign(&allocs, &all_conflicts(sizes.len())).unwrap();
        for (i, (&off, alloc)) in offsets.iter().zip(&allocs).enumerate() {
            assert!(off >= 0);
            assert!(off + alloc.size <= geometry.mem_size());
            for (j, (&off2, alloc2)) in offsets.iter().zip(&allocs).enumerate() {
                if i == j {
                    continue;
                }
                let disjoint = off + alloc.size <= off2 || off2 + alloc2.size <= off;
                assert!(disjoint, "t{i} and t{j} overlap");
            }
        }
    }
}
