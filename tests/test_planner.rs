use std::collections::HashSet;

use tilelang_codegen::DataType;
use tilelang_codegen::ir::{Buffer, PrimFunc, Stmt, StorageScope, Var};
use tilelang_codegen::planner::{Allocation, BankAllocator, BankGeometry, assign_addresses};

const KIB: i64 = 1024;

fn all_conflicts(n: usize) -> Vec<HashSet<usize>> {
    (0..n)
        .map(|i| (0..n).filter(|&j| j != i).collect())
        .collect()
}

fn local(name: &str, shape: &[i64]) -> Buffer {
    Buffer::with_data(
        name,
        Var::new(name, DataType::handle()),
        DataType::f32(),
        shape.to_vec(),
        StorageScope::SharedDyn,
    )
}

fn func_with_locals(locals: &[Buffer]) -> PrimFunc {
    let body = locals.iter().rev().fold(Stmt::Seq(Vec::new()), |acc, buf| {
        Stmt::DeclBuffer {
            buffer: buf.clone(),
            body: Box::new(Stmt::Allocate {
                var: buf.data.clone(),
                dtype: buf.dtype,
                extents: buf.shape.clone(),
                body: Box::new(acc),
            }),
        }
    });
    let param = Buffer::new("X", DataType::f32(), vec![16, 16], StorageScope::Global);
    PrimFunc::new("kernel", vec![param], body)
}

#[test]
fn test_three_way_packing() {
    // 20 KiB, 20 KiB and 10 KiB, all mutually live: descending-size
    // first-fit lands them on fresh bank boundaries
    let allocs = vec![
        Allocation::new("a", 20 * KIB, 1, 4),
        Allocation::new("b", 20 * KIB, 1, 4),
        Allocation::new("c", 10 * KIB, 1, 4),
    ];
    let mut allocator = BankAllocator::new(BankGeometry::default());
    let offsets = allocator.assign(&allocs, &all_conflicts(3)).unwrap();
    assert_eq!(offsets, vec![0, 32 * KIB, 64 * KIB]);
    assert_eq!(allocator.total_consumption(), 74 * KIB);
}

#[test]
fn test_size_order_preference() {
    // The small allocation is listed first but the large one is placed
    // first, so the large one takes offset 0
    let allocs = vec![
        Allocation::new("small", 4 * KIB, 1, 4),
        Allocation::new("large", 40 * KIB, 1, 4),
    ];
    let mut allocator = BankAllocator::new(BankGeometry::default());
    let offsets = allocator.assign(&allocs, &all_conflicts(2)).unwrap();
    assert_eq!(offsets[1], 0);
    assert!(offsets[0] >= 40 * KIB);
}

#[test]
fn test_planner_soundness_over_random_sizes() {
    let sizes = [
        18 * KIB,
        3 * KIB,
        25 * KIB,
        7 * KIB,
        7 * KIB,
        KIB,
        12 * KIB,
    ];
    let allocs: Vec<Allocation> = sizes
        .iter()
        .enumerate()
        .map(|(i, &s)| Allocation::new(format!("t{i}"), s, 1, 4))
        .collect();
    let geometry = BankGeometry::default();
    let mut allocator = BankAllocator::new(geometry);
    let offsets = allocator.assign(&allocs, &all_conflicts(allocs.len())).unwrap();
    for (i, (&off, a)) in offsets.iter().zip(&allocs).enumerate() {
        assert!(off >= 0);
        assert!(off + a.size <= geometry.mem_size());
        for (j, (&off2, a2)) in offsets.iter().zip(&allocs).enumerate() {
            if i != j {
                assert!(
                    off + a.size <= off2 || off2 + a2.size <= off,
                    "t{i} and t{j} overlap"
                );
            }
        }
    }
}

#[test]
fn test_assign_addresses_attaches_attrs() {
    // Planner sizes are product / bank_num * elem_bytes: these three
    // f32 tensors weigh 20 KiB, 20 KiB and 10 KiB respectively
    let locals = [
        local("a_buf", &[80, 1024]),
        local("b_buf", &[80, 1024]),
        local("c_buf", &[40, 1024]),
    ];
    let mut func = func_with_locals(&locals);
    assign_addresses(&mut func).unwrap();
    assert_eq!(func.attrs["a_buf"], 0);
    assert_eq!(func.attrs["b_buf"], 32 * KIB);
    assert_eq!(func.attrs["c_buf"], 64 * KIB);
}

#[test]
fn test_local_memory_overflow_names_buffer() {
    // 16 Ki x 1 Ki f32 elements: 4 MiB per-lane slice, far over 256 KiB
    let locals = [local("giant", &[16 * KIB, KIB])];
    let mut func = func_with_locals(&locals);
    let err = assign_addresses(&mut func).unwrap_err();
    assert!(err.to_string().contains("giant"));
}

#[test]
fn test_function_without_locals_is_untouched() {
    let mut func = func_with_locals(&[]);
    assign_addresses(&mut func).unwrap();
    assert!(func.attrs.is_empty());
}
