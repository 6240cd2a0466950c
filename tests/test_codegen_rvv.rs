use tilelang_codegen::ir::{
    Buffer, Expr, IrModule, PrimFunc, Region, Stmt, StorageScope, Var,
};
use tilelang_codegen::{DataType, build_tilelang_rvv};

fn local(name: &str, dtype: DataType, shape: &[i64]) -> Buffer {
    Buffer::with_data(
        name,
        Var::new(name, DataType::handle()),
        dtype,
        shape.to_vec(),
        StorageScope::SharedDyn,
    )
}

fn with_locals(locals: &[Buffer], body: Stmt) -> Stmt {
    locals.iter().rev().fold(body, |acc, buf| Stmt::DeclBuffer {
        buffer: buf.clone(),
        body: Box::new(Stmt::Allocate {
            var: buf.data.clone(),
            dtype: buf.dtype,
            extents: buf.shape.clone(),
            body: Box::new(acc),
        }),
    })
}

fn full(buffer: &Buffer) -> Expr {
    Expr::Region(Region::full(buffer.clone()))
}

fn count(hay: &str, needle: &str) -> usize {
    hay.matches(needle).count()
}

#[test]
fn test_prologue_epilogue_and_main() {
    let x = Buffer::new("X", DataType::f32(), vec![4, 8], StorageScope::Global);
    let func = PrimFunc::new("touch", vec![x], Stmt::Seq(Vec::new()));
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();

    // File structure: Tensor typedef up front, then the function, then main
    assert!(source.contains("#include <riscv_vector.h>"));
    assert!(source.contains("typedef struct {"));
    assert!(source.contains("size_t shape[4];"));
    assert!(source.contains("void touch(void* v1) {"));

    // Parameter materialization: heap tensor, copy-in, row-major strides
    assert!(source.contains(
        "Tensor v2 = (Tensor){.addr = malloc(32 * sizeof(float)), .size = 32 * sizeof(float), \
         .shape = {1, 4, 1, 8}, .stride = {1, 1, 1, 1}};"
    ));
    assert!(source.contains("memcpy(v2.addr, v1, v2.size);"));
    assert!(source.contains("v2.stride[i] = v2.shape[i+1] * v2.stride[i+1];"));

    // Copy-out and release
    assert!(source.contains("memcpy(v1, v2.addr, v2.size);"));
    assert!(source.contains("free(v2.addr);"));

    // Testbench driver with a correctly sized dummy buffer
    assert!(source.contains("int main() {"));
    assert!(source.contains("void* v1 = malloc(32 * sizeof(float));"));
    assert!(source.contains("touch(v1);"));
    assert!(source.contains("free(v1);"));
    assert!(source.contains("return 0;"));
}

#[test]
fn test_elementwise_mul_const_tile() {
    let t = local("tile", DataType::f32(), &[16, 4]);
    let body = with_locals(
        std::slice::from_ref(&t),
        Stmt::call(
            "rvv.mul_C",
            vec![full(&t), full(&t), Expr::f32imm(2.0)],
        ),
    );
    let param = Buffer::new("X", DataType::f32(), vec![16, 4], StorageScope::Global);
    let func = PrimFunc::new("scale", vec![param], body);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();

    // One flat strip-mined loop over all 64 elements
    assert!(source.contains("size_t total_elements = tile.shape[1] * tile.shape[3];"));
    assert!(source.contains("vl = __riscv_vsetvl_e32m1(total_elements - offset);"));
    assert!(source.contains("float temp_const = 2;"));
    assert!(source.contains("vfloat32m1_t v_src1 = __riscv_vfmv_v_f_f32m1(temp_const, vl);"));
    assert!(source.contains("vfloat32m1_t v_dst = __riscv_vfmul_vv_f32m1(v_src0, v_src1, vl);"));
    assert!(source.contains("__riscv_vse32_v_f32m1(dst_ptr + offset, v_dst, vl);"));
    assert!(source.contains("asm volatile (\"fence ow, ow\" ::: \"memory\");"));
}

#[test]
fn test_reduce_sum_rows() {
    let input = local("acc", DataType::f32(), &[16, 8192]);
    let output = local("sums", DataType::f32(), &[16, 1]);
    let body = with_locals(
        &[input.clone(), output.clone()],
        Stmt::call("rvv.reduce_sum", vec![full(&input), full(&output)]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![16, 8192], StorageScope::Global);
    let func = PrimFunc::new("row_sums", vec![param], body);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();

    assert!(source.contains("size_t N = acc.shape[1];"));
    assert!(source.contains("size_t M = acc.shape[3];"));
    assert!(source.contains("for (size_t i = 0; i < N; i++) {"));
    // Unordered single-register sum reduction per strip
    assert!(source.contains("vec_acc = __riscv_vfredusum_vs_f32m1_f32m1(vec, vec_acc, vl);"));
    assert!(source.contains("output_ptr[i] = __riscv_vfmv_f_s_f32m1_f32(vec_acc);"));
    assert!(source.contains("asm volatile (\"fence ow, ow\" ::: \"memory\");"));
}

#[test]
fn test_reduce_max_identities() {
    let fin = local("fin", DataType::f32(), &[4, 64]);
    let fout = local("fout", DataType::f32(), &[4, 1]);
    let iin = local("iin", DataType::i32(), &[4, 64]);
    let iout = local("iout", DataType::i32(), &[4, 1]);
    let uin = local("uin", DataType::u32(), &[4, 64]);
    let uout = local("uout", DataType::u32(), &[4, 1]);
    let body = with_locals(
        &[
            fin.clone(),
            fout.clone(),
            iin.clone(),
            iout.clone(),
            uin.clone(),
            uout.clone(),
        ],
        Stmt::seq(vec![
            Stmt::call("rvv.reduce_max", vec![full(&fin), full(&fout)]),
            Stmt::call("rvv.reduce_max", vec![full(&iin), full(&iout)]),
            Stmt::call("rvv.reduce_max", vec![full(&uin), full(&uout)]),
        ]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![4, 64], StorageScope::Global);
    let func = PrimFunc::new("maxima", vec![param], body);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();

    assert!(source.contains("float init_val = (float)(-INFINITY);"));
    assert!(source.contains("__riscv_vfredmax_vs_f32m1_f32m1"));
    assert!(source.contains("int32_t init_val = INT32_MIN;"));
    assert!(source.contains("__riscv_vredmax_vs_i32m1_i32m1"));
    assert!(source.contains("uint32_t init_val = 0;"));
    assert!(source.contains("__riscv_vredmaxu_vs_u32m1_u32m1"));
    assert!(source.contains("__riscv_vmv_x_s_i32m1_i32(vec_acc);"));
    assert!(source.contains("__riscv_vmv_x_s_u32m1_u32(vec_acc);"));
}

#[test]
fn test_copy_fence_only_when_global() {
    let x = Buffer::new("X", DataType::f32(), vec![32, 64], StorageScope::Global);
    let a = local("a_buf", DataType::f32(), &[32, 64]);
    let b = local("b_buf", DataType::f32(), &[32, 64]);
    let local_only = with_locals(
        &[a.clone(), b.clone()],
        Stmt::call("rvv.copy", vec![full(&a), full(&b)]),
    );
    let func = PrimFunc::new("local_move", vec![x.clone()], local_only);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();
    assert_eq!(count(&source, "fence ow, ow"), 0);

    let a2 = local("a_buf", DataType::f32(), &[32, 64]);
    let from_global = with_locals(
        std::slice::from_ref(&a2),
        Stmt::call(
            "rvv.copy",
            vec![
                Expr::Region(Region::new(
                    x.clone(),
                    vec![(Expr::int(0), 32), (Expr::int(0), 64)],
                )),
                full(&a2),
            ],
        ),
    );
    let func = PrimFunc::new("load_tile", vec![x], from_global);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();
    assert_eq!(count(&source, "fence ow, ow"), 1);
    // The global endpoint folds its byte offset into the typed base once
    assert!(source.contains(
        "float* src_ptr = (float*)((uint8_t*)v2.addr + ((0) * 64 + (0) * 1) * 4);"
    ));
    assert!(source.contains("float* dst_ptr = (float*)a_buf.addr;"));
    assert!(source.contains("size_t vl = __riscv_vsetvl_e32m1(min_cols - offset);"));
    assert!(source.contains(
        "__riscv_vse32_v_f32m1(dst_ptr + i * a_buf.shape[3] + offset, data, vl);"
    ));
}

#[test]
fn test_copy_narrowing_spills_through_scratch() {
    let a = local("wide", DataType::f32(), &[8, 32]);
    let b = local("narrow", DataType::f16(), &[8, 32]);
    let body = with_locals(
        &[a.clone(), b.clone()],
        Stmt::call("rvv.copy", vec![full(&a), full(&b)]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![8, 32], StorageScope::Global);
    let func = PrimFunc::new("narrowing", vec![param], body);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();
    // Bounded scratch, never a runtime-sized array
    assert!(source.contains("float temp_f32[256];"));
    assert!(source.contains("size_t chunk = min_cols - offset < 256 ? min_cols - offset : 256;"));
    assert!(source.contains("= (_Float16)temp_f32[idx];"));
    assert!(!source.contains("temp_f32[vl]"));
}

#[test]
fn test_gemm_fp16_widened_accumulator() {
    let a = local("A_tile", DataType::f16(), &[16, 8]);
    let b = local("B_tile", DataType::f16(), &[16, 8]);
    let c = local("C_tile", DataType::f32(), &[16, 16]);
    let body = with_locals(
        &[a.clone(), b.clone(), c.clone()],
        Stmt::call(
            "rvv.gemm",
            vec![
                full(&a),
                full(&b),
                full(&c),
                Expr::int(16),
                Expr::int(16),
                Expr::int(8),
                Expr::int(1),
            ],
        ),
    );
    let param = Buffer::new("X", DataType::f16(), vec![16, 8], StorageScope::Global);
    let func = PrimFunc::new("matmul_t", vec![param], body);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();

    assert!(source.contains("_Float16* A = (_Float16*)A_tile.addr;"));
    assert!(source.contains("float* C = (float*)C_tile.addr;"));
    // FP16 operands accumulate into a 2x LMUL FP32 register
    assert!(source.contains("vfloat32m2_t acc, a_bcast, b_convert;"));
    assert!(source.contains("acc = __riscv_vfmv_v_f_f32m2(0.0f, vl);"));
    // trans_B indexes B by output column
    assert!(source.contains("vfloat16m1_t b_vec = __riscv_vle16_v_f16m1(B + j * 8 + k, vl);"));
    assert!(source.contains("b_convert = __riscv_vfwcvt_f_f_v_f32m2(b_vec, vl);"));
    assert!(source.contains("acc = __riscv_vfmacc_vv_f32m2(acc, a_bcast, b_convert, vl);"));
    assert!(source.contains("__riscv_vse32_v_f32m2(C + i * 16 + j, current, vl);"));
}

#[test]
fn test_exp_bounded_spill() {
    let t = local("scores", DataType::f32(), &[8, 64]);
    let body = with_locals(
        std::slice::from_ref(&t),
        Stmt::call("rvv.exp", vec![full(&t)]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![8, 64], StorageScope::Global);
    let func = PrimFunc::new("softmax_exp", vec![param], body);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();
    assert!(source.contains("float temp[256];"));
    assert!(source.contains(
        "size_t chunk = total_elements - offset < 256 ? total_elements - offset : 256;"
    ));
    assert!(source.contains("temp[j] = expf(temp[j]);"));
    assert!(source.contains("asm volatile (\"fence ow, ow\" ::: \"memory\");"));
}

#[test]
fn test_embedding_out_of_range_zero_fill() {
    let out = local("out", DataType::f32(), &[128, 64]);
    let params = local("table", DataType::f32(), &[30, 64]);
    let index = local("ids", DataType::u32(), &[1, 128]);
    let body = with_locals(
        &[out.clone(), params.clone(), index.clone()],
        Stmt::call(
            "rvv.embedding",
            vec![
                full(&out),
                full(&params),
                full(&index),
                full(&params),
                full(&out),
                Expr::int(1),
                Expr::int(64),
                Expr::int(30),
                Expr::int(128),
                Expr::f32imm(0.0),
            ],
        ),
    );
    let param = Buffer::new("X", DataType::f32(), vec![30, 64], StorageScope::Global);
    let func = PrimFunc::new("embed", vec![param], body);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();

    assert!(source.contains("uint32_t* index_ptr = (uint32_t*)ids.addr;"));
    assert!(source.contains("uint32_t idx = index_ptr[i];"));
    assert!(source.contains("if (idx >= 30) {"));
    assert!(source.contains("vfloat32m1_t zero_vec = __riscv_vfmv_v_f_f32m1(0, vl);"));
    assert!(source.contains(
        "vfloat32m1_t vec = __riscv_vle32_v_f32m1(params_ptr + idx * 64 + j, vl);"
    ));
    assert!(source.contains("__riscv_vse32_v_f32m1(output_ptr + i * 64 + j, vec, vl);"));
}

#[test]
fn test_fill_and_rsqrt() {
    let t = local("var_buf", DataType::f32(), &[8, 16]);
    let body = with_locals(
        std::slice::from_ref(&t),
        Stmt::seq(vec![
            Stmt::call(
                "rvv.fill",
                vec![full(&t), Expr::f32imm(f64::NEG_INFINITY)],
            ),
            Stmt::call("rvv.rsqrt", vec![full(&t), full(&t)]),
        ]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![8, 16], StorageScope::Global);
    let func = PrimFunc::new("norm_tail", vec![param], body);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();

    assert!(source.contains("float broadcast_val = (float)(-INFINITY);"));
    assert!(source.contains("vfloat32m1_t vec_val = __riscv_vfmv_v_f_f32m1(broadcast_val, vl);"));
    // rsqrt: sqrt, 7-bit reciprocal estimate, one Newton step
    assert!(source.contains("vfloat32m1_t vec_sqrt = __riscv_vfsqrt_v_f32m1(vec_src, vl);"));
    assert!(source.contains("vfloat32m1_t vec_rec = __riscv_vfrec7_v_f32m1(vec_sqrt, vl);"));
    assert!(source.contains(
        "vec_rec = __riscv_vfmul_vv_f32m1(vec_rec, __riscv_vfrsub_vf_f32m1(\
         __riscv_vfmul_vv_f32m1(vec_sqrt, vec_rec, vl), 2.0, vl), vl);"
    ));
}

#[test]
fn test_elementwise_row_scalar_operand() {
    let dst = local("out", DataType::f32(), &[16, 64]);
    let a = local("lhs", DataType::f32(), &[16, 64]);
    let b = local("row", DataType::f32(), &[16, 1]);
    let body = with_locals(
        &[dst.clone(), a.clone(), b.clone()],
        Stmt::call("rvv.div", vec![full(&dst), full(&a), full(&b)]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![16, 64], StorageScope::Global);
    let func = PrimFunc::new("rowwise", vec![param], body);
    let source = build_tilelang_rvv(&IrModule::single(func)).unwrap();

    assert!(source.contains("float scale_val = src1_ptr[row_idx];"));
    assert!(source.contains("vfloat32m1_t v_dst = __riscv_vfdiv_vf_f32m1(v_src0, scale_val, vl);"));
    assert!(source.contains(
        "__riscv_vse32_v_f32m1(dst_ptr + row_idx * row_size + col_offset, v_dst, vl);"
    ));
}
