use tilelang_codegen::ir::{
    BinOp, Buffer, Expr, ForKind, IrModule, PrimFunc, Region, Stmt, StorageScope, Var,
};
use tilelang_codegen::target::ppl::Ppl;
use tilelang_codegen::{DataType, Emitter, assign_addresses, build_tilelang_ppl};

fn local(name: &str, dtype: DataType, shape: &[i64]) -> Buffer {
    Buffer::with_data(
        name,
        Var::new(name, DataType::handle()),
        dtype,
        shape.to_vec(),
        StorageScope::SharedDyn,
    )
}

/// Wrap `body` in DeclBuffer + Allocate pairs, outermost first
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

/// The tiled row-max kernel: 16 tiles of 512 rows, each tile DMA'd in,
/// reduced in two pool passes, DMA'd out
fn reduce_max_func() -> PrimFunc {
    let x = Buffer::new("X", DataType::f32(), vec![8192, 1020], StorageScope::Global);
    let y = Buffer::new("Y", DataType::f32(), vec![8192, 1], StorageScope::Global);
    let x_shared = local("X_shared", DataType::f32(), &[512, 1020]);
    let y_shared = local("Y_shared", DataType::f32(), &[512, 1]);
    let tmp = local("tmp_buffer", DataType::f32(), &[512, 32]);
    let by = Var::new("by", DataType::i32());
    let tile_min = Expr::binary(BinOp::Mul, Expr::var(&by), Expr::int(512));

    let loop_body = Stmt::seq(vec![
        Stmt::call(
            "ppl.copy",
            vec![
                Expr::Region(Region::new(
                    x.clone(),
                    vec![(tile_min.clone(), 512), (Expr::int(0), 1020)],
                )),
                full(&x_shared),
            ],
        ),
        Stmt::call(
            "ppl.fill",
            vec![full(&y_shared), Expr::f32imm(-2147483648.0)],
        ),
        Stmt::call(
            "ppl.reduce_max",
            vec![
                full(&x_shared),
                full(&y_shared),
                full(&tmp),
                Expr::int(32),
                Expr::int(1024),
                Expr::int(8192),
            ],
        ),
        Stmt::call(
            "ppl.copy",
            vec![
                full(&y_shared),
                Expr::Region(Region::new(
                    y.clone(),
                    vec![(tile_min, 512), (Expr::int(0), 1)],
                )),
            ],
        ),
    ]);
    let body = with_locals(
        &[x_shared, y_shared, tmp],
        Stmt::For {
            var: by,
            min: Expr::int(0),
            extent: Expr::int(16),
            kind: ForKind::Serial,
            body: Box::new(loop_body),
        },
    );
    PrimFunc::new("reduce_max", vec![x, y], body)
}

#[test]
fn test_reduce_max_kernel() {
    let mut func = reduce_max_func();
    assign_addresses(&mut func).unwrap();
    assert_eq!(func.attrs["X_shared"], 0);
    assert_eq!(func.attrs["tmp_buffer"], 131072);
    assert_eq!(func.attrs["Y_shared"], 147456);

    let source = build_tilelang_ppl(&IrModule::single(func)).unwrap();

    // Header declarations come first
    assert!(source.starts_with("#include \"ppl_helper.h\""));
    assert!(source.contains("static data_type_t __ppl_get_dtype(int type) {"));
    assert!(source.contains("DT_FP32, DT_FP32, DT_FP16, DT_BFP16"));

    // Parameters become global addresses plus stack descriptors
    assert!(source.contains("void reduce_max(global_addr_t v1, global_addr_t v2) {"));
    assert!(source.contains(
        "__ppl_tensor_info v3 = {.shape = {1, 8192, 1, 1020}, .stride = NULL, .addr = v1, \
         .dtype = DT_FP32, .mode = 2, .align_mode = 0, .size = 33423360"
    ));
    // The output descriptor is 8192 x 4 bytes
    assert!(source.contains(
        "__ppl_tensor_info v4 = {.shape = {1, 8192, 1, 1}, .stride = NULL, .addr = v2, \
         .dtype = DT_FP32, .mode = 2, .align_mode = 0, .size = 32768"
    ));

    // On-chip tensors carry the planner offsets and per-lane sizes
    assert!(source.contains(
        "__ppl_tensor_info X_shared = {.shape = {1, 512, 1, 1020}, .stride = NULL, .addr = 0, \
         .dtype = DT_FP32, .mode = 2, .align_mode = 1, .size = 32640"
    ));
    assert!(source.contains(".addr = 147456"));
    assert!(source.contains(".addr = 131072"));

    // One tile loop driving one S2L, one fill, two pools, one L2S
    assert!(source.contains("for (int by = 0; by < 16; ++by) {"));
    assert_eq!(count(&source, "tpu_gdma_cpy_S2L("), 1);
    assert_eq!(count(&source, "tpu_gdma_cpy_L2S("), 1);
    assert_eq!(count(&source, "tpu_bdc_fp_max_pool2d("), 2);
    // Identity fill plus the ragged-edge pad fill
    assert_eq!(count(&source, "tpu_bdc_set_C("), 2);
    assert!(source.contains("scalar_t Y_shared_scalar_f32 = {.f32 = -2147483648};"));

    // The sliced global source inherits the parent strides and offset
    assert!(source.contains(
        ".stride = {8355840, 1020, 1020, 1}, .addr = v3.addr + (((by * 512)) * 1020 + (0) * 1) * 4"
    ));

    // Reduction interior
    assert!(source.contains("int eu_num = 32;"));
    assert!(source.contains("int align_w = 1024;"));
    assert!(source.contains("scalar_t pad_val = {.f32 = FP_NEG_MAX(DT_FP32)};"));
    assert!(source.contains("if (align_w > X_shared.shape.w) {"));
    assert!(source.contains("dim2 kernel = {align_w / eu_num, 1};"));
    assert!(source.contains("dim2 kernel2 = {1, eu_num};"));
    assert!(source.contains("pad_val.f32 = FP_NEG_MAX(DT_FP32);"));

    // Launch trailer
    assert!(source.contains("typedef struct {"));
    assert!(source.contains("} tpu_kernel_api_reduce_max_args_t;"));
    assert!(source.contains("void reduce_max_kernel(const void *args) {"));
    assert!(source.contains("reduce_max(api->v1, api->v2);"));
    assert!(source.contains("tpu_poll();"));
    assert!(source.contains("TPUKERNEL_FUNC_REGISTER(reduce_max_kernel)"));
}

#[test]
fn test_reduce_sum_scale_cast() {
    let input = local("acc", DataType::f16(), &[64, 64]);
    let output = local("sums", DataType::f16(), &[64, 1]);
    let tmp = local("tmp", DataType::f16(), &[64, 32]);
    let body = with_locals(
        &[input.clone(), output.clone(), tmp.clone()],
        Stmt::call(
            "ppl.reduce_sum",
            vec![
                full(&input),
                full(&output),
                full(&tmp),
                Expr::int(32),
                Expr::int(64),
                Expr::int(4096),
            ],
        ),
    );
    let param = Buffer::new("X", DataType::f16(), vec![64, 64], StorageScope::Global);
    let func = PrimFunc::new("reduce_sum", vec![param], body);
    let source = build_tilelang_ppl(&IrModule::single(func)).unwrap();
    assert_eq!(count(&source, "tpu_bdc_fp_avg_pool2d("), 2);
    assert!(source.contains("scalar_t pad_val = {.f16 = 0};"));
    assert!(source.contains("scalar_t scale = {.f32 = (float)1.0};"));
    assert!(source.contains("scale = tpu_cast(scale, DT_FP16, DT_FP32, RM_HALF_TO_EVEN);"));
}

#[test]
fn test_copy_dispatch_by_scope() {
    let a = local("a_buf", DataType::f32(), &[8, 8]);
    let b = local("b_buf", DataType::f32(), &[8, 8]);
    let c = local("c_buf", DataType::f16(), &[8, 8]);
    let body = with_locals(
        &[a.clone(), b.clone(), c.clone()],
        Stmt::seq(vec![
            // Same scope, same dtype: plain on-chip copy
            Stmt::call("ppl.copy", vec![full(&a), full(&b)]),
            // Same scope, mixed dtype: cast with round-half-to-even
            Stmt::call("ppl.copy", vec![full(&a), full(&c)]),
        ]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![8, 8], StorageScope::Global);
    let func = PrimFunc::new("copies", vec![param], body);
    let source = build_tilelang_ppl(&IrModule::single(func)).unwrap();
    assert_eq!(count(&source, "tpu_bdc_cpy("), 1);
    assert_eq!(count(&source, "tpu_gdma_cpy_S2L("), 0);
    assert!(source.contains("RM_HALF_TO_EVEN"));
    assert!(source.contains("tpu_bdc_cast("));
}

#[test]
fn test_gemm_and_parallel_fences() {
    let a = local("A_shared", DataType::f16(), &[64, 128]);
    let b = local("B_shared", DataType::f16(), &[128, 32]);
    let c = local("acc", DataType::f32(), &[64, 32]);
    let gemm = |trans: i64| {
        Stmt::call(
            "ppl.gemm",
            vec![
                full(&a),
                full(&b),
                full(&c),
                Expr::int(64),
                Expr::int(32),
                Expr::int(128),
                Expr::int(trans),
            ],
        )
    };
    let body = with_locals(
        &[a.clone(), b.clone(), c.clone()],
        Stmt::seq(vec![
            Stmt::AttrStmt {
                key: "tpu_parallel_start".to_string(),
                value: Expr::int(0),
                body: Box::new(gemm(0)),
            },
            Stmt::AttrStmt {
                key: "tpu_parallel_end".to_string(),
                value: Expr::int(0),
                body: Box::new(Stmt::Seq(Vec::new())),
            },
            Stmt::AttrStmt {
                key: "some_other_attr".to_string(),
                value: Expr::int(0),
                body: Box::new(gemm(1)),
            },
        ]),
    );
    let param = Buffer::new("X", DataType::f16(), vec![64, 128], StorageScope::Global);
    let func = PrimFunc::new("matmul", vec![param], body);
    let source = build_tilelang_ppl(&IrModule::single(func)).unwrap();
    assert_eq!(count(&source, "tpu_parallel_start();"), 1);
    assert_eq!(count(&source, "tpu_parallel_end();"), 1);
    // M, K, N argument order; FP32 accumulate over FP16 operands
    assert!(source.contains(
        "tpu_bdc_fp_mm(acc.addr, A_shared.addr, B_shared.addr, 64, 128, 32, DT_FP32, DT_FP16, \
         true);"
    ));
    assert!(source.contains(
        "tpu_bdc_fp_mm_R_trans(acc.addr, A_shared.addr, B_shared.addr, 64, 128, 32, DT_FP32, \
         DT_FP16);"
    ));
}

#[test]
fn test_elementwise_broadcast_protocol() {
    let dst = local("out", DataType::f32(), &[64, 256]);
    let a = local("lhs", DataType::f32(), &[64, 256]);
    let col = local("col", DataType::f32(), &[64, 1]);
    let same = local("rhs", DataType::f32(), &[64, 256]);
    let body = with_locals(
        &[dst.clone(), a.clone(), col.clone(), same.clone()],
        Stmt::seq(vec![
            Stmt::call("ppl.div", vec![full(&dst), full(&a), full(&col)]),
            Stmt::call("ppl.add", vec![full(&dst), full(&a), full(&same)]),
            Stmt::call("ppl.mul_C", vec![full(&dst), full(&a), Expr::f32imm(0.5)]),
        ]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![64, 256], StorageScope::Global);
    let func = PrimFunc::new("eltwise", vec![param], body);
    let source = build_tilelang_ppl(&IrModule::single(func)).unwrap();
    // The (C, 1) divisor takes the aligned-stride broadcast route
    assert!(source.contains("dim4 col_stride;"));
    assert!(source.contains("tpu_aligned_stride(&col_stride, 0, &col.shape, DT_FP32);"));
    assert!(source.contains("col_stride.w = 0;"));
    assert!(source.contains("&col_stride, DT_FP32);"));
    assert!(source.contains("tpu_bdc_fp_div("));
    // The full-width operand keeps its descriptor stride
    assert!(source.contains(
        "tpu_bdc_fp_add(out.addr, lhs.addr, rhs.addr, &out.shape, (out.default_stride ? NULL : \
         &out.stride), (lhs.default_stride ? NULL : &lhs.stride), (rhs.default_stride ? NULL : \
         &rhs.stride), DT_FP32);"
    ));
    assert!(source.contains("tpu_bdc_fp_mul_C(out.addr, lhs.addr, (scalar_t){.f32 = 5e-1}"));
}

#[test]
fn test_exp_and_rsqrt() {
    let t = local("scores", DataType::f32(), &[8, 64]);
    let work0 = local("work0", DataType::f32(), &[8, 64]);
    let work1 = local("work1", DataType::f32(), &[8, 64]);
    let coeff = local("coeff", DataType::f32(), &[1, 32]);
    let table = local("table", DataType::f32(), &[1, 192]);
    let body = with_locals(
        &[
            t.clone(),
            work0.clone(),
            work1.clone(),
            coeff.clone(),
            table.clone(),
        ],
        Stmt::seq(vec![
            Stmt::call(
                "ppl.exp",
                vec![
                    full(&t),
                    full(&t),
                    full(&work0),
                    full(&work1),
                    full(&coeff),
                    full(&table),
                ],
            ),
            Stmt::call("ppl.rsqrt", vec![full(&t), full(&t)]),
        ]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![8, 64], StorageScope::Global);
    let func = PrimFunc::new("softmax_tail", vec![param], body);
    let source = build_tilelang_ppl(&IrModule::single(func)).unwrap();
    assert!(source.contains("tpu_bdc_load_fp32_exp_coeff(coeff.addr);"));
    assert!(source.contains("tpu_bdc_load_fp32_exp_table(table.addr);"));
    assert!(source.contains(
        "tpu_bdc_fp32_exp(scores.addr, scores.addr, work0.addr, work1.addr, coeff.addr, \
         table.addr, &scores.shape);"
    ));
    assert!(source.contains("tpu_bdc_fp32_rsqrt(scores.addr, scores.addr, &scores.shape);"));
}

fn embedding_func(select: i64, inner: i64) -> PrimFunc {
    let out = local("out", DataType::f16(), &[128, inner]);
    let params = local("params", DataType::f16(), &[select, inner]);
    let index = local("index", DataType::u16(), &[1, 128]);
    let params_tmp = local("params_tmp", DataType::f16(), &[inner, select]);
    let out_tmp = local("out_tmp", DataType::f16(), &[inner, 128]);
    let body = with_locals(
        &[
            out.clone(),
            params.clone(),
            index.clone(),
            params_tmp.clone(),
            out_tmp.clone(),
        ],
        Stmt::call(
            "ppl.embedding",
            vec![
                full(&out),
                full(&params),
                full(&index),
                full(&params_tmp),
                full(&out_tmp),
                Expr::int(1),
                Expr::int(inner),
                Expr::int(select),
                Expr::int(128),
                Expr::f32imm(0.0),
            ],
        ),
    );
    let param = Buffer::new("X", DataType::f16(), vec![select, inner], StorageScope::Global);
    PrimFunc::new("embedding", vec![param], body)
}

#[test]
fn test_embedding_index_axis_split() {
    // select < inner: the index axis is divided across cores
    let source = build_tilelang_ppl(&IrModule::single(embedding_func(30, 64))).unwrap();
    assert!(source.contains("int core_idx = tpu_core_index();"));
    assert!(source.contains("int index_slice = (128 + core_num - 1) / core_num;"));
    assert!(source.contains("int real_index_slice = MIN(index_slice, 128 - core_idx * index_slice);"));
    assert!(source.contains("if (core_idx < allocated_core) {"));
    assert!(source.contains("tpu_bdc_w_gather(output_subview_shared.addr, params_tmp.addr"));
    // Transpose in, gather, transpose out
    assert_eq!(count(&source, "tpu_gdma_cpy_cw_trans_L2L("), 2);
    // Index dtype tag follows the index tensor's own dtype
    assert!(source.contains("DT_FP16, DT_UINT16);"));
}

#[test]
fn test_embedding_inner_axis_split() {
    // select >= inner: the inner axis is divided across cores
    let source = build_tilelang_ppl(&IrModule::single(embedding_func(256, 64))).unwrap();
    assert!(source.contains("int inner_slice = (64 + core_num - 1) / core_num;"));
    assert!(source.contains("if (inner_slice > 0) {"));
    assert!(!source.contains("int index_slice"));
}

#[test]
fn test_double_buffered_allocation_names() {
    let var = Var::new("X_shared", DataType::handle());
    let buffer = Buffer::with_data(
        "X_shared",
        var.clone(),
        DataType::f16(),
        vec![64, 64],
        StorageScope::SharedDyn,
    );
    // A leading extent of 2 requests two buffered copies
    let body = Stmt::DeclBuffer {
        buffer,
        body: Box::new(Stmt::Allocate {
            var,
            dtype: DataType::f16(),
            extents: vec![2, 64, 64],
            body: Box::new(Stmt::Seq(Vec::new())),
        }),
    };
    let param = Buffer::new("X", DataType::f16(), vec![64, 64], StorageScope::Global);
    let func = PrimFunc::new("pipelined", vec![param], body);
    let source = build_tilelang_ppl(&IrModule::single(func)).unwrap();
    assert!(source.contains("__ppl_tensor_info X_shared = "));
    assert!(source.contains("__ppl_tensor_info X_shared_1 = "));
}

#[test]
fn test_unknown_intrinsic_degrades_to_extern_call() {
    let param = Buffer::new("X", DataType::f32(), vec![4, 4], StorageScope::Global);
    let func = PrimFunc::new(
        "mystery",
        vec![param],
        Stmt::call("ppl.transcend", vec![Expr::int(3)]),
    );
    let mut cg = Emitter::<Ppl>::new();
    cg.add_function(&func).unwrap();
    let source = cg.finish();
    assert!(source.contains("ppl.transcend(3);"));
    assert_eq!(cg.warnings().len(), 1);
    assert!(cg.warnings()[0].contains("ppl.transcend"));
}

#[test]
fn test_region_rank_must_be_two_or_four() {
    let a = local("a_buf", DataType::f32(), &[8, 8]);
    let bad = Expr::Region(Region::new(a.clone(), vec![(Expr::int(0), 8)]));
    let body = with_locals(
        std::slice::from_ref(&a),
        Stmt::call("ppl.copy", vec![bad.clone(), bad]),
    );
    let param = Buffer::new("X", DataType::f32(), vec![8, 8], StorageScope::Global);
    let func = PrimFunc::new("bad_rank", vec![param], body);
    let err = build_tilelang_ppl(&IrModule::single(func)).unwrap_err();
    assert!(err.to_string().contains("malformed IR"));
}

#[test]
fn test_let_and_loop_rendering() {
    let n = Var::new("n", DataType::i32());
    let i = Var::new("i", DataType::i32());
    let body = Stmt::LetStmt {
        var: n.clone(),
        value: Expr::binary(BinOp::Add, Expr::int(10), Expr::int(5)),
        body: Box::new(Stmt::For {
            var: i.clone(),
            min: Expr::int(2),
            extent: Expr::int(6),
            kind: ForKind::Unrolled,
            body: Box::new(Stmt::Evaluate(Expr::call_extern(
                "consume",
                vec![Expr::var(&i), Expr::var(&n)],
            ))),
        }),
    };
    let param = Buffer::new("X", DataType::f32(), vec![4, 4], StorageScope::Global);
    let func = PrimFunc::new("scalars", vec![param], body);
    let source = build_tilelang_ppl(&IrModule::single(func)).unwrap();
    assert!(source.contains("int n = (10 + 5);"));
    assert!(source.contains("#pragma unroll"));
    // The upper bound is min + extent, constant-folded
    assert!(source.contains("for (int i = 2; i < 8; ++i) {"));
    assert!(source.contains("consume(i, n);"));
}
