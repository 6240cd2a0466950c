//! TPU backend: lowers tensor intrinsics onto the `tpu_*` runtime.
//!
//! Kernels address tensors through `__ppl_tensor_info` descriptors built
//! around opaque local/global addresses; DMA moves data between global
//! memory and the banked local SRAM, BDC primitives compute on it.

use crate::dtype::{self, DataType, DtypeTag};
use crate::emit::{CopyEnds, Emitter, IntrinsicFn, Target, build_module};
use crate::error::Error;
use crate::ir::{Expr, IrModule, PrimFunc, Region, Var};

/// NPU lane count; local tensors are striped across the lanes, so the
/// per-lane descriptor size divides by it
const LANE_NUM: i64 = 64;

/// The TPU target
pub struct Ppl;

impl Target for Ppl {
    const NS: &'static str = "ppl";
    const DESCRIPTOR: &'static str = "__ppl_tensor_info";

    fn type_token(t: DataType) -> Result<String, Error> {
        dtype::type_token(t)
    }

    fn intrinsic(op: &str) -> Option<IntrinsicFn<Self>> {
        Some(match op {
            "copy" => copy,
            "fill" => fill,
            "gemm" => gemm,
            "add" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise(e, a, "tpu_bdc_fp_add"),
            "sub" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise(e, a, "tpu_bdc_fp_sub"),
            "mul" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise(e, a, "tpu_bdc_fp_mul"),
            "div" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise(e, a, "tpu_bdc_fp_div"),
            "add_C" => {
                |e: &mut Emitter<Self>, a: &[Expr]| elementwise_const(e, a, "tpu_bdc_fp_add_C")
            }
            "mul_C" => {
                |e: &mut Emitter<Self>, a: &[Expr]| elementwise_const(e, a, "tpu_bdc_fp_mul_C")
            }
            "exp" => exp,
            "reduce_max" => |e: &mut Emitter<Self>, a: &[Expr]| reduce(e, a, ReduceKind::Max),
            "reduce_sum" => |e: &mut Emitter<Self>, a: &[Expr]| reduce(e, a, ReduceKind::Sum),
            "embedding" => embedding,
            "rsqrt" => rsqrt,
            _ => return None,
        })
    }

    fn emit_attr(e: &mut Emitter<Self>, key: &str) {
        match key {
            "tpu_parallel_start" => e.line("tpu_parallel_start();"),
            "tpu_parallel_end" => e.line("tpu_parallel_end();"),
            _ => {}
        }
    }

    fn emit_allocate(
        e: &mut Emitter<Self>,
        var: &Var,
        dtype: DataType,
        extents: &[i64],
    ) -> Result<(), Error> {
        let (reps, d0, d1) = match *extents {
            [d0, d1] => (1, d0, d1),
            [reps, d0, d1] => (reps, d0, d1),
            _ => {
                return Err(Error::MalformedIr(format!(
                    "allocate of `{}` has {} extents",
                    var.hint,
                    extents.len()
                )));
            }
        };
        let tag = value_tag(dtype)?;
        let tensor_size = d0 * d1 / LANE_NUM * tag.bytes();
        for _ in 0..reps {
            let vid = e.alloc_var_id(var);
            let addr = e.fn_attrs.get(&vid).copied().unwrap_or(0);
            e.buffer_addrs.insert(var.clone(), addr);
            e.line(&format!(
                "__ppl_tensor_info {vid} = {{.shape = {{1, {d0}, 1, {d1}}}, .stride = NULL, \
                 .addr = {addr}, .dtype = {}, .mode = 2, .align_mode = 1, .size = {tensor_size}, \
                 .unsigned_flag = 0, .default_stride = true}};",
                tag.name()
            ));
            e.buffer_shapes.insert(vid, [1, d0, 1, d1]);
        }
        Ok(())
    }

    fn emit_prologue(e: &mut Emitter<Self>, func: &PrimFunc) -> Result<Vec<String>, Error> {
        let count = func.params.len();
        let mut param_vids = Vec::with_capacity(count);
        let mut descriptors = Vec::with_capacity(count);
        for (i, param) in func.params.iter().enumerate() {
            let vid = e.fresh(&format!("v{}", i + 1));
            let rid = e.fresh(&format!("v{}", i + 1 + count));
            let buffer = func.buffer_map.get(param).ok_or_else(|| {
                Error::MalformedIr(format!("parameter `{}` has no buffer", param.hint))
            })?;
            let shape = e.register_buffer(&buffer.name, &buffer.shape)?;
            let tag = value_tag(buffer.dtype)?;
            let size: i64 = buffer.shape.iter().product::<i64>() * tag.bytes();
            descriptors.push(format!(
                "__ppl_tensor_info {rid} = {{.shape = {{{}, {}, {}, {}}}, .stride = NULL, \
                 .addr = {vid}, .dtype = {}, .mode = 2, .align_mode = 0, .size = {size}, \
                 .unsigned_flag = 0, .default_stride = true}};",
                shape[0],
                shape[1],
                shape[2],
                shape[3],
                tag.name()
            ));
            e.var_ids.insert(param.clone(), rid.clone());
            let base = param.hint.strip_suffix("_handle").unwrap_or(&param.hint);
            e.parameter_map.insert(base.to_string(), rid.clone());
            e.parameter_map.insert(buffer.name.clone(), rid);
            param_vids.push(vid);
        }
        let args = param_vids
            .iter()
            .map(|v| format!("global_addr_t {v}"))
            .collect::<Vec<_>>()
            .join(", ");
        e.line(&format!("void {}({args}) {{", func.name));
        e.begin_scope();
        for inst in descriptors {
            e.line(&inst);
        }
        Ok(param_vids)
    }

    fn emit_epilogue(
        e: &mut Emitter<Self>,
        func: &PrimFunc,
        params: &[String],
    ) -> Result<(), Error> {
        e.end_scope();
        e.line("}");
        e.raw("\n");
        let api_name = format!("tpu_kernel_api_{}_args_t", func.name);
        e.line("typedef struct {");
        for vid in params {
            e.line(&format!("  global_addr_t {vid};"));
        }
        e.line(&format!("}} {api_name};"));
        e.line(&format!("void {}_kernel(const void *args) {{", func.name));
        e.line(&format!("  {api_name} *api = ({api_name}*)args;"));
        let call_args = params
            .iter()
            .map(|vid| format!("api->{vid}"))
            .collect::<Vec<_>>()
            .join(", ");
        e.line(&format!("  {}({call_args});", func.name));
        e.line("  tpu_poll();");
        e.line("}");
        e.line(&format!("TPUKERNEL_FUNC_REGISTER({}_kernel)", func.name));
        e.raw("\n");
        Ok(())
    }

    fn decl_prefix() -> String {
        let mut out = String::from("#include \"ppl_helper.h\"\n\n");
        out.push_str(
            "typedef struct {\n  dim4 shape;\n  dim4 stride;\n  global_addr_t addr;\n  \
             data_type_t dtype;\n  int mode;\n  int align_mode;\n  int size;\n  int offset;\n  \
             bool unsigned_flag;\n  bool default_stride;\n} __ppl_tensor_info;\n",
        );
        out.push_str("static data_type_t __ppl_get_dtype(int type) {\n");
        let table = DtypeTag::helper_table().join(", ");
        out.push_str(&format!("  data_type_t __dtype[] = {{{table}}};\n"));
        out.push_str("  return __dtype[type];\n}\n\n");
        out
    }
}

/// Emit C source for every function of the module
pub fn build_tilelang_ppl(module: &IrModule) -> Result<String, Error> {
    build_module::<Ppl>(module)
}

// ---- argument accessors -------------------------------------------------

fn arg_region<'a>(args: &'a [Expr], i: usize) -> Result<&'a Region, Error> {
    args.get(i)
        .and_then(Expr::as_region)
        .ok_or_else(|| Error::MalformedIr(format!("intrinsic argument {i} is not a region")))
}

fn arg_int(args: &[Expr], i: usize) -> Result<i64, Error> {
    args.get(i)
        .and_then(Expr::as_int)
        .ok_or_else(|| Error::MalformedIr(format!("intrinsic argument {i} is not an integer")))
}

fn arg_float(args: &[Expr], i: usize) -> Result<f64, Error> {
    args.get(i)
        .and_then(Expr::as_float)
        .ok_or_else(|| Error::MalformedIr(format!("intrinsic argument {i} is not a float")))
}

fn arg_bool(args: &[Expr], i: usize) -> Result<bool, Error> {
    arg_int(args, i).map(|v| v != 0)
}

/// Dtype tag of a tensor operand; the compute primitives cover fp16/fp32
fn value_tag(dtype: DataType) -> Result<DtypeTag, Error> {
    match DtypeTag::from_dtype(dtype)? {
        tag @ (DtypeTag::Fp16 | DtypeTag::Fp32) => Ok(tag),
        _ => Err(Error::UnsupportedType(dtype)),
    }
}

/// Stride argument for a runtime call: `NULL` for default row-major,
/// the descriptor's stride otherwise
fn stride_arg(id: &str) -> String {
    format!("({id}.default_stride ? NULL : &{id}.stride)")
}

// ---- intrinsic lowering -------------------------------------------------

/// Build a view descriptor for one copy endpoint. Global regions inherit
/// the parent tensor's strides and carry the byte offset of their origin;
/// on-chip regions alias the backing descriptor with default strides.
fn copy_view(e: &mut Emitter<Ppl>, region: &Region) -> Result<(String, DtypeTag), Error> {
    let id = e.region_tensor_id(region)?;
    let view = e.fresh(&region.buffer.name);
    let (shape_lit, _) = Emitter::<Ppl>::region_shape_literal(region)?;
    let tag = value_tag(region.buffer.dtype)?;
    if region.buffer.scope.is_global() {
        let strides = match e.buffer_strides.get(&region.buffer.name) {
            Some(s) => *s,
            None => Emitter::<Ppl>::default_strides(Emitter::<Ppl>::normalize_shape(
                &region.buffer.shape,
            )?),
        };
        let offset = e.region_offset_expr(region)?;
        let min_expr = format!("{offset} * {}", tag.bytes());
        e.line(&format!(
            "__ppl_tensor_info {view} = {{.shape = {shape_lit}, .stride = {{{}, {}, {}, {}}}, \
             .addr = {id}.addr + {min_expr}, .dtype = {}, .mode = 2, .size = 1, \
             .offset = {min_expr}, .unsigned_flag = 0, .default_stride = false}};",
            strides[0],
            strides[1],
            strides[2],
            strides[3],
            tag.name()
        ));
    } else {
        e.line(&format!(
            "__ppl_tensor_info {view} = {{.shape = {shape_lit}, .stride = NULL, \
             .addr = {id}.addr, .dtype = {}, .mode = 0, .size = 1, .offset = 0, \
             .unsigned_flag = 0, .default_stride = true}};",
            tag.name()
        ));
    }
    Ok((view, tag))
}

fn copy(e: &mut Emitter<Ppl>, args: &[Expr]) -> Result<(), Error> {
    let src = arg_region(args, 0)?;
    let dst = arg_region(args, 1)?;
    let (src_id, src_tag) = copy_view(e, src)?;
    let (dst_id, dst_tag) = copy_view(e, dst)?;
    if src_tag != dst_tag {
        // Mixed dtypes become an on-chip cast, round half to even
        e.line(&format!(
            "tpu_bdc_cast({dst_id}.addr, {src_id}.addr, &{dst_id}.shape, {}, {}, {}, {}, \
             RM_HALF_TO_EVEN);",
            stride_arg(&dst_id),
            stride_arg(&src_id),
            dst_tag.name(),
            src_tag.name()
        ));
        return Ok(());
    }
    let ends = CopyEnds::from_regions(src, dst);
    let op = if ends == CopyEnds::SRC_GLOBAL {
        "tpu_gdma_cpy_S2L"
    } else if ends == CopyEnds::DST_GLOBAL {
        "tpu_gdma_cpy_L2S"
    } else {
        "tpu_bdc_cpy"
    };
    e.line(&format!(
        "{op}({dst_id}.addr, {src_id}.addr, &{dst_id}.shape, {}, {}, {});",
        stride_arg(&dst_id),
        stride_arg(&src_id),
        src_tag.name()
    ));
    Ok(())
}

fn fill(e: &mut Emitter<Ppl>, args: &[Expr]) -> Result<(), Error> {
    let tensor = arg_region(args, 0)?;
    let value = arg_float(args, 1)?;
    let id = e.region_tensor_id(tensor)?;
    let tag = value_tag(tensor.buffer.dtype)?;
    let field = tag.scalar_field();
    let scalar = format!("{id}_scalar_{field}");
    e.line(&format!(
        "scalar_t {scalar} = {{.{field} = {}}};",
        Emitter::<Ppl>::scalar_literal(value)
    ));
    e.line(&format!(
        "tpu_bdc_set_C({id}.addr, {scalar}, &{id}.shape, {}, {});",
        stride_arg(&id),
        tag.name()
    ));
    Ok(())
}

fn gemm(e: &mut Emitter<Ppl>, args: &[Expr]) -> Result<(), Error> {
    let a = e.region_tensor_id(arg_region(args, 0)?)?;
    let b = e.region_tensor_id(arg_region(args, 1)?)?;
    let c = e.region_tensor_id(arg_region(args, 2)?)?;
    let m = arg_int(args, 3)?;
    let n = arg_int(args, 4)?;
    let k = arg_int(args, 5)?;
    let trans_b = arg_bool(args, 6)?;
    if trans_b {
        e.line(&format!(
            "tpu_bdc_fp_mm_R_trans({c}.addr, {a}.addr, {b}.addr, {m}, {k}, {n}, DT_FP32, DT_FP16);"
        ));
    } else {
        e.line(&format!(
            "tpu_bdc_fp_mm({c}.addr, {a}.addr, {b}.addr, {m}, {k}, {n}, DT_FP32, DT_FP16, true);"
        ));
    }
    Ok(())
}

fn elementwise(e: &mut Emitter<Ppl>, args: &[Expr], op: &str) -> Result<(), Error> {
    let dst = arg_region(args, 0)?;
    let a = arg_region(args, 1)?;
    let b = arg_region(args, 2)?;
    let dst_id = e.region_tensor_id(dst)?;
    let a_id = e.region_tensor_id(a)?;
    let b_id = e.region_tensor_id(b)?;
    let tag = value_tag(dst.buffer.dtype)?;
    let a_shape = Emitter::<Ppl>::normalize_shape(&a.buffer.shape)?;
    let b_shape = Emitter::<Ppl>::normalize_shape(&b.buffer.shape)?;
    // Per-row broadcast: a (C, 1) right operand against a full left
    // operand takes an explicit aligned stride with w pinned to 0
    let b_stride = if b_shape[3] == 1 && a_shape[3] != 1 {
        e.line(&format!("dim4 {b_id}_stride;"));
        e.line(&format!(
            "tpu_aligned_stride(&{b_id}_stride, 0, &{b_id}.shape, {});",
            tag.name()
        ));
        e.line(&format!("{b_id}_stride.w = 0;"));
        format!("&{b_id}_stride")
    } else {
        stride_arg(&b_id)
    };
    e.line(&format!(
        "{op}({dst_id}.addr, {a_id}.addr, {b_id}.addr, &{dst_id}.shape, {}, {}, {b_stride}, {});",
        stride_arg(&dst_id),
        stride_arg(&a_id),
        tag.name()
    ));
    Ok(())
}

fn elementwise_const(e: &mut Emitter<Ppl>, args: &[Expr], op: &str) -> Result<(), Error> {
    let dst = arg_region(args, 0)?;
    let a = arg_region(args, 1)?;
    let value = arg_float(args, 2)?;
    let dst_id = e.region_tensor_id(dst)?;
    let a_id = e.region_tensor_id(a)?;
    let tag = value_tag(dst.buffer.dtype)?;
    let field = tag.scalar_field();
    e.line(&format!(
        "{op}({dst_id}.addr, {a_id}.addr, (scalar_t){{.{field} = {}}}, &{dst_id}.shape, {}, {}, {});",
        Emitter::<Ppl>::scalar_literal(value),
        stride_arg(&dst_id),
        stride_arg(&a_id),
        tag.name()
    ));
    Ok(())
}

fn exp(e: &mut Emitter<Ppl>, args: &[Expr]) -> Result<(), Error> {
    let dst = e.region_tensor_id(arg_region(args, 0)?)?;
    let src = e.region_tensor_id(arg_region(args, 1)?)?;
    let work0 = e.region_tensor_id(arg_region(args, 2)?)?;
    let work1 = e.region_tensor_id(arg_region(args, 3)?)?;
    let coeff = e.region_tensor_id(arg_region(args, 4)?)?;
    let table = e.region_tensor_id(arg_region(args, 5)?)?;
    e.line(&format!("tpu_bdc_load_fp32_exp_coeff({coeff}.addr);"));
    e.line(&format!("tpu_bdc_load_fp32_exp_table({table}.addr);"));
    e.line(&format!(
        "tpu_bdc_fp32_exp({dst}.addr, {src}.addr, {work0}.addr, {work1}.addr, {coeff}.addr, \
         {table}.addr, &{src}.shape);"
    ));
    Ok(())
}

#[derive(Copy, Clone, PartialEq)]
enum ReduceKind {
    Max,
    Sum,
}

/// Two-pass tree reduction over the innermost axis.
///
/// The (C, W) input is reshaped to (C, H', eu_num) with H' = align_w /
/// eu_num; the ragged right edge is padded with the identity, then two
/// pool2d passes with kernels (H', 1) and (1, eu_num) collapse the axis.
/// Sum reuses the average pool with a scale of 1.
fn reduce(e: &mut Emitter<Ppl>, args: &[Expr], kind: ReduceKind) -> Result<(), Error> {
    let input = e.region_tensor_id(arg_region(args, 0)?)?;
    let output = e.region_tensor_id(arg_region(args, 1)?)?;
    let tmp = e.region_tensor_id(arg_region(args, 2)?)?;
    let eu_num = arg_int(args, 3)?;
    let align_w = arg_int(args, 4)?;
    let stride_n = arg_int(args, 5)?;
    let dtype = arg_region(args, 0)?.buffer.dtype;
    let tag = match (kind, DtypeTag::from_dtype(dtype)?) {
        (_, tag @ (DtypeTag::Fp16 | DtypeTag::Fp32)) => tag,
        (
            ReduceKind::Sum,
            tag @ (DtypeTag::Int32 | DtypeTag::Uint32 | DtypeTag::Int16),
        ) => tag,
        _ => return Err(Error::UnsupportedType(dtype)),
    };
    let field = tag.scalar_field();
    let identity = match kind {
        ReduceKind::Max => format!("FP_NEG_MAX({})", tag.name()),
        ReduceKind::Sum => "0".to_string(),
    };
    let pool = match kind {
        ReduceKind::Max => "tpu_bdc_fp_max_pool2d",
        ReduceKind::Sum => "tpu_bdc_fp_avg_pool2d",
    };

    e.line("{");
    e.begin_scope();
    e.line(&format!("int eu_num = {eu_num};"));
    e.line(&format!("int align_w = {align_w};"));
    e.line(&format!("scalar_t pad_val = {{.{field} = {identity}}};"));

    // Pad the ragged tail of each row with the identity
    e.line(&format!("if (align_w > {input}.shape.w) {{"));
    e.begin_scope();
    e.line(&format!(
        "dim4 fill_shape = {{{input}.shape.n, {input}.shape.c, 1, align_w - {input}.shape.w}};"
    ));
    e.line(&format!("int elem_size = {};", tag.bytes()));
    e.line(&format!("int offset = {input}.shape.w * elem_size;"));
    e.line(&format!(
        "dim4 fill_tensor_stride = {{{stride_n}, align_w, {input}.shape.w, 1}};"
    ));
    e.line(&format!(
        "__ppl_tensor_info fill_tensor = {{.shape = fill_shape, .stride = fill_tensor_stride, \
         .addr = {input}.addr + offset, .dtype = {}, .mode = 0, .align_mode = 4, .size = 1, \
         .offset = offset, .unsigned_flag = 0, .default_stride = false}};",
        tag.name()
    ));
    e.line(&format!(
        "tpu_bdc_set_C(fill_tensor.addr, pad_val, &fill_shape, \
         (fill_tensor.default_stride ? NULL : &fill_tensor.stride), {});",
        tag.name()
    ));
    e.end_scope();
    e.line("}");

    e.line(&format!(
        "dim4 in_reduce_h = {{{input}.shape.n, {input}.shape.c, align_w / eu_num, eu_num}};"
    ));
    e.line(&format!(
        "dim4 out_reduce_h = {{{input}.shape.n, {input}.shape.c, 1, eu_num}};"
    ));
    e.line(&format!(
        "dim4 in_reduce_w = {{{input}.shape.n, {input}.shape.c, 1, eu_num}};"
    ));
    e.line(&format!(
        "dim4 out_reduce_w = {{{input}.shape.n, {input}.shape.c, 1, 1}};"
    ));
    e.line("dim2 kernel = {align_w / eu_num, 1};");
    e.line("padding_t pad = {0, 0, 0, 0};");
    e.line("dim2 stride = {1, 1};");
    e.line("dim2 dilation = {1, 1};");
    e.line(&format!(
        "__ppl_tensor_info input_view = {{.shape = in_reduce_h, .stride = {{0}}, \
         .addr = {input}.addr, .dtype = {}, .mode = 0, .align_mode = 1, .size = 1, .offset = 0, \
         .unsigned_flag = 0, .default_stride = true}};",
        tag.name()
    ));
    e.line(&format!(
        "__ppl_tensor_info tmp_view = {{.shape = out_reduce_h, .stride = {{0}}, \
         .addr = {tmp}.addr, .dtype = {}, .mode = 0, .align_mode = 1, .size = 1, .offset = 0, \
         .unsigned_flag = 0, .default_stride = true}};",
        tag.name()
    ));

    let last_arg = match kind {
        ReduceKind::Max => "pad_val".to_string(),
        ReduceKind::Sum => {
            // Average pool with unit scale degenerates to a plain sum; the
            // scale is 1.0 cast through the operand dtype
            e.line("scalar_t scale = {.f32 = (float)1.0};");
            if tag != DtypeTag::Fp32 {
                e.line(&format!(
                    "scale = tpu_cast(scale, {}, DT_FP32, RM_HALF_TO_EVEN);",
                    tag.name()
                ));
            }
            "scale".to_string()
        }
    };
    e.line(&format!(
        "{pool}(tmp_view.addr, input_view.addr, &input_view.shape, &kernel, &pad, &stride, \
         &dilation, {}, {last_arg});",
        tag.name()
    ));

    e.line("dim2 kernel2 = {1, eu_num};");
    e.line(&format!(
        "__ppl_tensor_info output_view = {{.shape = out_reduce_w, .stride = {{0}}, \
         .addr = {output}.addr, .dtype = {}, .mode = 0, .align_mode = 1, .size = 1, .offset = 0, \
         .unsigned_flag = 0, .default_stride = true}};",
        tag.name()
    ));
    e.line(&format!(
        "__ppl_tensor_info tmp_view2 = {{.shape = in_reduce_w, .stride = {{0}}, \
         .addr = {tmp}.addr, .dtype = {}, .mode = 0, .align_mode = 1, .size = 1, .offset = 0, \
         .unsigned_flag = 0, .default_stride = true}};",
        tag.name()
    ));
    if kind == ReduceKind::Max {
        e.line(&format!("pad_val.{field} = {identity};"));
    }
    e.line(&format!(
        "{pool}(output_view.addr, tmp_view2.addr, &tmp_view2.shape, &kernel2, &pad, &stride, \
         &dilation, {}, {last_arg});",
        tag.name()
    ));
    e.end_scope();
    e.line("}");
    Ok(())
}

/// Embedding gather with a cross-core work partition.
///
/// Params are first transposed (S, I) -> (I, S) into scratch so the
/// gather can select along W; the smaller of the two axes picks the split
/// strategy; the gathered output transposes back to (N, I).
fn embedding(e: &mut Emitter<Ppl>, args: &[Expr]) -> Result<(), Error> {
    let output = e.region_tensor_id(arg_region(args, 0)?)?;
    let params = e.region_tensor_id(arg_region(args, 1)?)?;
    let index = e.region_tensor_id(arg_region(args, 2)?)?;
    let params_tmp = e.region_tensor_id(arg_region(args, 3)?)?;
    let output_tmp = e.region_tensor_id(arg_region(args, 4)?)?;
    let inner = arg_int(args, 6)?;
    let select = arg_int(args, 7)?;
    let index_num = arg_int(args, 8)?;

    let value_dtype = arg_region(args, 0)?.buffer.dtype;
    let tag = match DtypeTag::from_dtype(value_dtype)? {
        tag @ (DtypeTag::Fp16 | DtypeTag::Fp32 | DtypeTag::Int32 | DtypeTag::Uint32) => tag,
        _ => return Err(Error::UnsupportedType(value_dtype)),
    };
    let index_dtype = arg_region(args, 2)?.buffer.dtype;
    let index_tag = match DtypeTag::from_dtype(index_dtype)? {
        tag @ (DtypeTag::Int16 | DtypeTag::Uint16 | DtypeTag::Int32 | DtypeTag::Uint32) => tag,
        _ => return Err(Error::UnsupportedType(index_dtype)),
    };
    let elem = tag.bytes();
    let index_elem = index_tag.bytes();

    e.line("{");
    e.begin_scope();
    e.line("int core_idx = tpu_core_index();");
    e.line("int core_num = tpu_core_num();");

    // Layouts as stored (N-major) and as computed (I-major, transposed)
    e.line(&format!(
        "dim4 ori_output_shape = {{1, {index_num}, 1, {inner}}};"
    ));
    e.line(&format!(
        "dim4 ori_params_shape = {{1, {select}, 1, {inner}}};"
    ));
    e.line(&format!("dim4 ori_index_shape = {{1, {index_num}, 1, 1}};"));
    e.line(&format!(
        "dim4 ori_output_stride = {{{}, {inner}, {inner}, 1}};",
        index_num * inner
    ));
    e.line(&format!(
        "dim4 ori_params_stride = {{{}, {inner}, {inner}, 1}};",
        select * inner
    ));
    e.line(&format!("dim4 ori_index_stride = {{{index_num}, 1, 1, 1}};"));
    e.line(&format!(
        "dim4 output_shape = {{1, {inner}, 1, {index_num}}};"
    ));
    e.line(&format!("dim4 params_shape = {{1, {inner}, 1, {select}}};"));
    e.line(&format!("dim4 index_shape = {{1, {index_num}, 1, 1}};"));
    e.line(&format!(
        "dim4 output_stride = {{{}, {index_num}, {index_num}, 1}};",
        index_num * inner
    ));
    e.line(&format!(
        "dim4 params_stride = {{{}, {select}, {select}, 1}};",
        select * inner
    ));
    e.line(&format!("dim4 index_stride = {{{index_num}, 1, 1, 1}};"));
    e.line(&format!(
        "tpu_gdma_cpy_cw_trans_L2L({params_tmp}.addr, {params}.addr, &params_shape, \
         &params_stride, &ori_params_stride, {});",
        tag.name()
    ));

    if select < inner {
        // Split along the index axis: each core gathers a slice of rows
        e.line(&format!(
            "int index_slice = ({index_num} + core_num - 1) / core_num;"
        ));
        e.line(&format!(
            "int allocated_core = ({index_num} + index_slice - 1) / index_slice;"
        ));
        e.line(&format!(
            "int real_index_slice = MIN(index_slice, {index_num} - core_idx * index_slice);"
        ));
        e.line("if (core_idx < allocated_core) {");
        e.begin_scope();
        e.line("dim4 index_subview_shape = {1, real_index_slice, 1, 1};");
        e.line("dim4 index_subview_stride = {real_index_slice, 1, 1, 1};");
        e.line(&format!(
            "dim4 output_subview_shape = {{1, {inner}, 1, real_index_slice}};"
        ));
        e.line(&format!(
            "dim4 output_subview_stride = {{{inner} * real_index_slice, real_index_slice, \
             real_index_slice, 1}};"
        ));
        e.line(&format!(
            "__ppl_tensor_info index_subview_shared = {{.shape = index_subview_shape, \
             .stride = index_subview_stride, .addr = {index}.addr + core_idx * index_slice * \
             {index_elem}, .dtype = {}, .mode = 2, .align_mode = 0, .size = real_index_slice, \
             .unsigned_flag = 0, .default_stride = true}};",
            index_tag.name()
        ));
        e.line(&format!(
            "__ppl_tensor_info output_subview_shared = {{.shape = output_subview_shape, \
             .stride = output_subview_stride, .addr = {output_tmp}.addr + core_idx * {inner} * \
             real_index_slice * {elem}, .dtype = {}, .mode = 2, .align_mode = 0, \
             .size = real_index_slice * {inner}, .unsigned_flag = 0, .default_stride = true}};",
            tag.name()
        ));
        e.line(&format!(
            "tpu_bdc_w_gather(output_subview_shared.addr, {params_tmp}.addr, \
             index_subview_shared.addr, &output_shape, params_shape.w, {}, {});",
            tag.name(),
            index_tag.name()
        ));
        e.end_scope();
        e.line("}");
    } else {
        // Split along the inner axis: each core gathers a slice of columns
        e.line(&format!(
            "int inner_slice = ({inner} + core_num - 1) / core_num;"
        ));
        e.line(&format!(
            "int real_inner_slice = MIN(inner_slice, {inner} - core_idx * inner_slice);"
        ));
        e.line("if (inner_slice > 0) {");
        e.begin_scope();
        e.line(&format!(
            "dim4 params_subview_shape = {{1, real_inner_slice, 1, {select}}};"
        ));
        e.line(&format!(
            "dim4 params_subview_stride = {{real_inner_slice * {select}, {select}, {select}, 1}};"
        ));
        e.line(&format!(
            "dim4 output_subview_shape = {{1, real_inner_slice, 1, {index_num}}};"
        ));
        e.line(&format!(
            "dim4 output_subview_stride = {{{index_num} * real_inner_slice, {index_num}, \
             {index_num}, 1}};"
        ));
        e.line(&format!(
            "__ppl_tensor_info params_subview_shared = {{.shape = params_subview_shape, \
             .stride = params_subview_stride, .addr = {params}.addr + core_idx * inner_slice * \
             {elem}, .dtype = {}, .mode = 2, .align_mode = 0, .size = real_inner_slice * \
             {select}, .unsigned_flag = 0, .default_stride = true}};",
            tag.name()
        ));
        e.line(&format!(
            "__ppl_tensor_info output_subview_shared = {{.shape = output_subview_shape, \
             .stride = output_subview_stride, .addr = {output_tmp}.addr + core_idx * \
             inner_slice * {elem}, .dtype = {}, .mode = 2, .align_mode = 0, \
             .size = real_inner_slice * {index_num}, .unsigned_flag = 0, \
             .default_stride = true}};",
            tag.name()
        ));
        e.line(&format!(
            "tpu_bdc_w_gather(output_subview_shared.addr, {params_tmp}.addr, {index}.addr, \
             &output_subview_shared.shape, params_shape.w, {}, {});",
            tag.name(),
            index_tag.name()
        ));
        e.end_scope();
        e.line("}");
    }

    e.line(&format!(
        "tpu_gdma_cpy_cw_trans_L2L({output}.addr, {output_tmp}.addr, &ori_output_shape, \
         &ori_output_stride, &output_stride, {});",
        tag.name()
    ));
    e.end_scope();
    e.line("}");
    Ok(())
}

fn rsqrt(e: &mut Emitter<Ppl>, args: &[Expr]) -> Result<(), Error> {
    let dst = e.region_tensor_id(arg_region(args, 0)?)?;
    let src = e.region_tensor_id(arg_region(args, 1)?)?;
    e.line(&format!(
        "tpu_bdc_fp32_rsqrt({dst}.addr, {src}.addr, &{src}.shape);"
    ));
    Ok(())
}
