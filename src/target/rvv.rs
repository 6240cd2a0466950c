//! RISC-V Vector backend: lowers tensor intrinsics onto strip-mined
//! `__riscv_*` intrinsic loops over heap-allocated tensors.
//!
//! Parameters arrive as raw `void*` buffers; the emitted prologue copies
//! them into heap `Tensor` records, the epilogue copies results back. A
//! `main` testbench driver closes each file.

use crate::dtype::{self, DataType, TypeKind};
use crate::emit::{CopyEnds, Emitter, IntrinsicFn, Target, build_module};
use crate::error::Error;
use crate::ir::{Expr, IrModule, PrimFunc, Region, Var};

/// Capacity of the stack scratch used where a vector must spill for
/// scalar math; strip lengths are clamped so the spill stays in bounds
const SPILL_CAPACITY: i64 = 256;

const FENCE: &str = "asm volatile (\"fence ow, ow\" ::: \"memory\");";

/// The RVV target
pub struct Rvv;

impl Target for Rvv {
    const NS: &'static str = "rvv";
    const DESCRIPTOR: &'static str = "Tensor";

    fn type_token(t: DataType) -> Result<String, Error> {
        dtype::type_token_rvv(t)
    }

    fn intrinsic(op: &str) -> Option<IntrinsicFn<Self>> {
        Some(match op {
            "copy" => copy,
            "fill" => fill,
            "gemm" => gemm,
            "add" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise(e, a, "add"),
            "sub" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise(e, a, "sub"),
            "mul" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise(e, a, "mul"),
            "div" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise(e, a, "div"),
            "add_C" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise_const(e, a, "add"),
            "mul_C" => |e: &mut Emitter<Self>, a: &[Expr]| elementwise_const(e, a, "mul"),
            "exp" => exp,
            "reduce_max" => |e: &mut Emitter<Self>, a: &[Expr]| reduce(e, a, ReduceKind::Max),
            "reduce_sum" => |e: &mut Emitter<Self>, a: &[Expr]| reduce(e, a, ReduceKind::Sum),
            "embedding" => embedding,
            "rsqrt" => rsqrt,
            _ => return None,
        })
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
        let info = VecInfo::of(dtype)?;
        let count = d0 * d1;
        for _ in 0..reps {
            let vid = e.alloc_var_id(var);
            let addr = e.fn_attrs.get(&vid).copied().unwrap_or(0);
            e.buffer_addrs.insert(var.clone(), addr);
            e.line(&format!(
                "Tensor {vid} = (Tensor){{.addr = malloc({count} * sizeof({ctype})), \
                 .size = {count} * sizeof({ctype}), .shape = {{1, {d0}, 1, {d1}}}, \
                 .stride = {{1, 1, 1, 1}}}};",
                ctype = info.ctype
            ));
            e.line(&format!("memset({vid}.addr, 0, {vid}.size);"));
            e.line("for (int i = 2; i >= 0; i--) {");
            e.line(&format!(
                "  {vid}.stride[i] = {vid}.shape[i+1] * {vid}.stride[i+1];"
            ));
            e.line("}");
            e.buffer_shapes.insert(vid, [1, d0, 1, d1]);
        }
        Ok(())
    }

    fn emit_prologue(e: &mut Emitter<Self>, func: &PrimFunc) -> Result<Vec<String>, Error> {
        let count = func.params.len();
        let mut param_vids = Vec::with_capacity(count);
        let mut insts = Vec::with_capacity(count);
        for (i, param) in func.params.iter().enumerate() {
            let vid = e.fresh(&format!("v{}", i + 1));
            let rid = e.fresh(&format!("v{}", i + 1 + count));
            let buffer = func.buffer_map.get(param).ok_or_else(|| {
                Error::MalformedIr(format!("parameter `{}` has no buffer", param.hint))
            })?;
            let shape = e.register_buffer(&buffer.name, &buffer.shape)?;
            let info = VecInfo::of(buffer.dtype)?;
            let size: i64 = buffer.shape.iter().product();
            insts.push(format!(
                "Tensor {rid} = (Tensor){{.addr = malloc({size} * sizeof({ctype})), \
                 .size = {size} * sizeof({ctype}), .shape = {{{}, {}, {}, {}}}, \
                 .stride = {{1, 1, 1, 1}}}};",
                shape[0],
                shape[1],
                shape[2],
                shape[3],
                ctype = info.ctype
            ));
            insts.push(format!("memcpy({rid}.addr, {vid}, {rid}.size);"));
            insts.push("for (int i = 2; i >= 0; i--) {".to_string());
            insts.push(format!(
                "  {rid}.stride[i] = {rid}.shape[i+1] * {rid}.stride[i+1];"
            ));
            insts.push("}".to_string());
            e.var_ids.insert(param.clone(), rid.clone());
            let base = param.hint.strip_suffix("_handle").unwrap_or(&param.hint);
            e.parameter_map.insert(base.to_string(), rid.clone());
            e.parameter_map.insert(buffer.name.clone(), rid);
            param_vids.push(vid);
        }
        let args = param_vids
            .iter()
            .map(|v| format!("void* {v}"))
            .collect::<Vec<_>>()
            .join(", ");
        e.line(&format!("void {}({args}) {{", func.name));
        e.begin_scope();
        for inst in insts {
            e.line(&inst);
        }
        Ok(param_vids)
    }

    fn emit_epilogue(
        e: &mut Emitter<Self>,
        func: &PrimFunc,
        params: &[String],
    ) -> Result<(), Error> {
        // Copy results back to the caller's buffers and release the heap
        for (param, vid) in func.params.iter().zip(params) {
            let rid = e.var_id(param)?;
            e.line(&format!("memcpy({vid}, {rid}.addr, {rid}.size);"));
            e.line(&format!("free({rid}.addr);"));
        }
        e.end_scope();
        e.line("}");
        e.raw("\n");

        // Testbench driver
        e.line("int main() {");
        e.begin_scope();
        for (param, vid) in func.params.iter().zip(params) {
            let buffer = func.buffer_map.get(param).ok_or_else(|| {
                Error::MalformedIr(format!("parameter `{}` has no buffer", param.hint))
            })?;
            let info = VecInfo::of(buffer.dtype)?;
            let size: i64 = buffer.shape.iter().product();
            e.line(&format!(
                "void* {vid} = malloc({size} * sizeof({}));",
                info.ctype
            ));
        }
        e.line(&format!("{}({});", func.name, params.join(", ")));
        for vid in params {
            e.line(&format!("free({vid});"));
        }
        e.line("return 0;");
        e.end_scope();
        e.line("}");
        e.raw("\n");
        Ok(())
    }

    fn decl_prefix() -> String {
        let mut out = String::new();
        out.push_str("#include <stdint.h>\n");
        out.push_str("#include <stdlib.h>\n");
        out.push_str("#include <string.h>\n");
        out.push_str("#include <math.h>\n");
        out.push_str("#include <riscv_vector.h>\n\n");
        out.push_str(
            "typedef struct {\n    void* addr;\n    size_t size;\n    size_t shape[4];\n    \
             size_t stride[4];\n} Tensor;\n\n",
        );
        out
    }
}

/// Emit C source for every function of the module
pub fn build_tilelang_rvv(module: &IrModule) -> Result<String, Error> {
    build_module::<Rvv>(module)
}

/// RVV lowering profile of a scalar dtype: C element type, element width,
/// LMUL=1 register type and intrinsic suffix
#[derive(Debug, Copy, Clone)]
struct VecInfo {
    ctype: &'static str,
    eew: u8,
    vtype: &'static str,
    /// Intrinsic suffix, e.g. `f32m1`
    suffix: &'static str,
    /// Scalar-result suffix, e.g. the `f32` of `vfmv_f_s_f32m1_f32`
    short: &'static str,
    float: bool,
    unsigned: bool,
}

impl VecInfo {
    fn of(t: DataType) -> Result<Self, Error> {
        let info = match (t.kind, t.bits, t.lanes) {
            (TypeKind::Float, 16, 1) => Self {
                ctype: "_Float16",
                eew: 16,
                vtype: "vfloat16m1_t",
                suffix: "f16m1",
                short: "f16",
                float: true,
                unsigned: false,
            },
            (TypeKind::Float, 32, 1) => Self {
                ctype: "float",
                eew: 32,
                vtype: "vfloat32m1_t",
                suffix: "f32m1",
                short: "f32",
                float: true,
                unsigned: false,
            },
            (TypeKind::Int, 8, 1) => Self {
                ctype: "int8_t",
                eew: 8,
                vtype: "vint8m1_t",
                suffix: "i8m1",
                short: "i8",
                float: false,
                unsigned: false,
            },
            (TypeKind::Int, 16, 1) => Self {
                ctype: "int16_t",
                eew: 16,
                vtype: "vint16m1_t",
                suffix: "i16m1",
                short: "i16",
                float: false,
                unsigned: false,
            },
            (TypeKind::Int, 32, 1) => Self {
                ctype: "int32_t",
                eew: 32,
                vtype: "vint32m1_t",
                suffix: "i32m1",
                short: "i32",
                float: false,
                unsigned: false,
            },
            (TypeKind::UInt, 8, 1) => Self {
                ctype: "uint8_t",
                eew: 8,
                vtype: "vuint8m1_t",
                suffix: "u8m1",
                short: "u8",
                float: false,
                unsigned: true,
            },
            (TypeKind::UInt, 16, 1) => Self {
                ctype: "uint16_t",
                eew: 16,
                vtype: "vuint16m1_t",
                suffix: "u16m1",
                short: "u16",
                float: false,
                unsigned: true,
            },
            (TypeKind::UInt, 32, 1) => Self {
                ctype: "uint32_t",
                eew: 32,
                vtype: "vuint32m1_t",
                suffix: "u32m1",
                short: "u32",
                float: false,
                unsigned: true,
            },
            _ => return Err(Error::UnsupportedType(t)),
        };
        Ok(info)
    }

    fn float_only(t: DataType) -> Result<Self, Error> {
        let info = Self::of(t)?;
        if info.float {
            Ok(info)
        } else {
            Err(Error::UnsupportedType(t))
        }
    }
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

// ---- intrinsic lowering -------------------------------------------------

/// Typed base pointer for one copy endpoint. Global regions fold their
/// byte offset into the base once; everything after is element-typed.
fn copy_base(e: &mut Emitter<Rvv>, region: &Region, info: VecInfo) -> Result<String, Error> {
    let id = e.region_tensor_id(region)?;
    if region.buffer.scope.is_global() {
        let offset = e.region_offset_expr(region)?;
        Ok(format!(
            "({ctype}*)((uint8_t*){id}.addr + {offset} * {bytes})",
            ctype = info.ctype,
            bytes = region.buffer.dtype.elem_bytes()
        ))
    } else {
        Ok(format!("({ctype}*){id}.addr", ctype = info.ctype))
    }
}

fn copy(e: &mut Emitter<Rvv>, args: &[Expr]) -> Result<(), Error> {
    let src = arg_region(args, 0)?;
    let dst = arg_region(args, 1)?;
    let src_info = VecInfo::of(src.buffer.dtype)?;
    let dst_info = VecInfo::of(dst.buffer.dtype)?;
    let src_id = e.region_tensor_id(src)?;
    let dst_id = e.region_tensor_id(dst)?;
    let src_base = copy_base(e, src, src_info)?;
    let dst_base = copy_base(e, dst, dst_info)?;

    let narrowing = src_info.ctype == "float" && dst_info.ctype == "_Float16";
    let widening = src_info.ctype == "_Float16" && dst_info.ctype == "float";
    if src_info.ctype != dst_info.ctype && !narrowing && !widening {
        return Err(Error::UnsupportedType(dst.buffer.dtype));
    }

    e.line("{");
    e.begin_scope();
    e.line(&format!(
        "size_t min_cols = {src_id}.shape[3] < {dst_id}.shape[3] ? {src_id}.shape[3] : \
         {dst_id}.shape[3];"
    ));
    e.line(&format!("{}* src_ptr = {src_base};", src_info.ctype));
    e.line(&format!("{}* dst_ptr = {dst_base};", dst_info.ctype));
    e.line(&format!(
        "size_t rows = {src_id}.shape[1] < {dst_id}.shape[1] ? {src_id}.shape[1] : \
         {dst_id}.shape[1];"
    ));
    e.line("for (size_t i = 0; i < rows; i++) {");
    e.begin_scope();
    e.line("size_t offset = 0;");
    e.line("while (offset < min_cols) {");
    e.begin_scope();
    if narrowing {
        // f32 -> f16 spills through a bounded stack buffer
        e.line(&format!(
            "size_t chunk = min_cols - offset < {SPILL_CAPACITY} ? min_cols - offset : \
             {SPILL_CAPACITY};"
        ));
        e.line(&format!(
            "size_t vl = __riscv_vsetvl_e{}m1(chunk);",
            src_info.eew
        ));
    } else {
        e.line(&format!(
            "size_t vl = __riscv_vsetvl_e{}m1(min_cols - offset);",
            src_info.eew
        ));
    }
    e.line(&format!(
        "{vtype} data = __riscv_vle{eew}_v_{suffix}(src_ptr + i * {src_id}.shape[3] + offset, vl);",
        vtype = src_info.vtype,
        eew = src_info.eew,
        suffix = src_info.suffix
    ));
    if narrowing {
        e.line(&format!("float temp_f32[{SPILL_CAPACITY}];"));
        e.line("__riscv_vse32_v_f32m1(temp_f32, data, vl);");
        e.line("for (size_t idx = 0; idx < vl; idx++) {");
        e.line(&format!(
            "  dst_ptr[i * {dst_id}.shape[3] + offset + idx] = (_Float16)temp_f32[idx];"
        ));
        e.line("}");
    } else if widening {
        e.line("vfloat32m2_t wide = __riscv_vfwcvt_f_f_v_f32m2(data, vl);");
        e.line(&format!(
            "__riscv_vse32_v_f32m2(dst_ptr + i * {dst_id}.shape[3] + offset, wide, vl);"
        ));
    } else {
        e.line(&format!(
            "__riscv_vse{eew}_v_{suffix}(dst_ptr + i * {dst_id}.shape[3] + offset, data, vl);",
            eew = dst_info.eew,
            suffix = dst_info.suffix
        ));
    }
    e.line("offset += vl;");
    e.end_scope();
    e.line("}");
    e.end_scope();
    e.line("}");
    if !CopyEnds::from_regions(src, dst).is_empty() {
        e.line(FENCE);
    }
    e.end_scope();
    e.line("}");
    Ok(())
}

fn fill(e: &mut Emitter<Rvv>, args: &[Expr]) -> Result<(), Error> {
    let tensor = arg_region(args, 0)?;
    let value = arg_float(args, 1)?;
    let id = e.region_tensor_id(tensor)?;
    let info = VecInfo::of(tensor.buffer.dtype)?;
    e.line("{");
    e.begin_scope();
    e.line(&format!("size_t vlen = {id}.shape[1] * {id}.shape[3];"));
    e.line("size_t vl;");
    let literal = if info.float {
        if value.is_infinite() {
            let sign = if value < 0.0 { "-" } else { "" };
            format!("({})({sign}INFINITY)", info.ctype)
        } else if value.is_nan() {
            format!("({})NAN", info.ctype)
        } else {
            Emitter::<Rvv>::scalar_literal(value)
        }
    } else {
        format!("{}", value as i64)
    };
    e.line(&format!("{} broadcast_val = {literal};", info.ctype));
    e.line("for (size_t offset = 0; offset < vlen; offset += vl) {");
    e.begin_scope();
    e.line(&format!(
        "vl = __riscv_vsetvl_e{}m1(vlen - offset);",
        info.eew
    ));
    if info.float {
        e.line(&format!(
            "{} vec_val = __riscv_vfmv_v_f_{}(broadcast_val, vl);",
            info.vtype, info.suffix
        ));
    } else {
        e.line(&format!(
            "{} vec_val = __riscv_vmv_v_x_{}(broadcast_val, vl);",
            info.vtype, info.suffix
        ));
    }
    e.line(&format!(
        "__riscv_vse{}_v_{}(({}*){id}.addr + offset, vec_val, vl);",
        info.eew, info.suffix, info.ctype
    ));
    e.end_scope();
    e.line("}");
    e.end_scope();
    e.line("}");
    Ok(())
}

fn gemm(e: &mut Emitter<Rvv>, args: &[Expr]) -> Result<(), Error> {
    let a = e.region_tensor_id(arg_region(args, 0)?)?;
    let b = e.region_tensor_id(arg_region(args, 1)?)?;
    let c = e.region_tensor_id(arg_region(args, 2)?)?;
    let m = arg_int(args, 3)?;
    let n = arg_int(args, 4)?;
    let k = arg_int(args, 5)?;
    let trans_b = arg_bool(args, 6)?;
    let dtype = arg_region(args, 0)?.buffer.dtype;

    #[derive(PartialEq)]
    enum Mode {
        Fp16,
        Fp32,
        Int8,
    }
    let mode = match (dtype.kind, dtype.bits) {
        (TypeKind::Float, 16) => Mode::Fp16,
        (TypeKind::Float, 32) => Mode::Fp32,
        (TypeKind::Int, 8) => Mode::Int8,
        _ => return Err(Error::UnsupportedType(dtype)),
    };

    e.line("{");
    e.begin_scope();
    match mode {
        Mode::Fp16 => {
            e.line(&format!("_Float16* A = (_Float16*){a}.addr;"));
            e.line(&format!("_Float16* B = (_Float16*){b}.addr;"));
            e.line(&format!("float* C = (float*){c}.addr;"));
        }
        Mode::Fp32 => {
            e.line(&format!("float* A = (float*){a}.addr;"));
            e.line(&format!("float* B = (float*){b}.addr;"));
            e.line(&format!("float* C = (float*){c}.addr;"));
        }
        Mode::Int8 => {
            e.line(&format!("int8_t* A = (int8_t*){a}.addr;"));
            e.line(&format!("int8_t* B = (int8_t*){b}.addr;"));
            e.line(&format!("int32_t* C = (int32_t*){c}.addr;"));
        }
    }
    e.line("size_t avl, vl;");
    match mode {
        Mode::Fp16 => e.line("vfloat32m2_t acc, a_bcast, b_convert;"),
        Mode::Fp32 => e.line("vfloat32m1_t acc, a_bcast, b_vec;"),
        Mode::Int8 => e.line("vint32m1_t acc, a_bcast, b_ext;"),
    }
    e.line(&format!("for (size_t i = 0; i < {m}; i++) {{"));
    e.begin_scope();
    e.line("size_t j = 0;");
    e.line(&format!("avl = {n};"));
    e.line("while (avl > 0) {");
    e.begin_scope();
    match mode {
        Mode::Fp16 => {
            e.line("vl = __riscv_vsetvl_e16m1(avl);");
            e.line("acc = __riscv_vfmv_v_f_f32m2(0.0f, vl);");
            e.line(&format!(
                "vfloat32m2_t current = __riscv_vle32_v_f32m2(C + i * {n} + j, vl);"
            ));
        }
        Mode::Fp32 => {
            e.line("vl = __riscv_vsetvl_e32m1(avl);");
            e.line("acc = __riscv_vfmv_v_f_f32m1(0.0f, vl);");
            e.line(&format!(
                "vfloat32m1_t current = __riscv_vle32_v_f32m1(C + i * {n} + j, vl);"
            ));
        }
        Mode::Int8 => {
            e.line("vl = __riscv_vsetvl_e8m1(avl);");
            e.line("acc = __riscv_vmv_v_x_i32m1(0, vl);");
            e.line(&format!(
                "vint32m1_t current = __riscv_vle32_v_i32m1(C + i * {n} + j, vl);"
            ));
        }
    }
    e.line(&format!("for (size_t k = 0; k < {k}; k++) {{"));
    e.begin_scope();
    match mode {
        Mode::Fp16 => {
            e.line(&format!("_Float16 a = A[i * {k} + k];"));
            e.line("float a_val = (float)a;");
            e.line("a_bcast = __riscv_vfmv_v_f_f32m2(a_val, vl);");
        }
        Mode::Fp32 => {
            e.line(&format!("a_bcast = __riscv_vfmv_v_f_f32m1(A[i * {k} + k], vl);"));
        }
        Mode::Int8 => {
            e.line(&format!(
                "a_bcast = __riscv_vwadd_vx_i32m1(__riscv_vmv_v_x_i8m1(A[i * {k} + k], vl), 0, vl);"
            ));
        }
    }
    // The B row walks columns when B is row-major, rows when transposed
    let b_index = if trans_b {
        format!("j * {k} + k")
    } else {
        format!("k * {n} + j")
    };
    match mode {
        Mode::Fp16 => {
            e.line(&format!(
                "vfloat16m1_t b_vec = __riscv_vle16_v_f16m1(B + {b_index}, vl);"
            ));
            e.line("b_convert = __riscv_vfwcvt_f_f_v_f32m2(b_vec, vl);");
            e.line("acc = __riscv_vfmacc_vv_f32m2(acc, a_bcast, b_convert, vl);");
        }
        Mode::Fp32 => {
            e.line(&format!("b_vec = __riscv_vle32_v_f32m1(&B[{b_index}], vl);"));
            e.line("acc = __riscv_vfmacc_vv_f32m1(acc, a_bcast, b_vec, vl);");
        }
        Mode::Int8 => {
            e.line(&format!(
                "b_ext = __riscv_vwadd_vx_i32m1(__riscv_vle8_v_i8m1(&B[{b_index}], vl), 0, vl);"
            ));
            e.line("acc = __riscv_vmacc_vv_i32m1(acc, a_bcast, b_ext, vl);");
        }
    }
    e.end_scope();
    e.line("}");
    match mode {
        Mode::Fp16 => {
            e.line("current = __riscv_vfadd_vv_f32m2(current, acc, vl);");
            e.line(&format!("__riscv_vse32_v_f32m2(C + i * {n} + j, current, vl);"));
        }
        Mode::Fp32 => {
            e.line("current = __riscv_vfadd_vv_f32m1(current, acc, vl);");
            e.line(&format!("__riscv_vse32_v_f32m1(C + i * {n} + j, current, vl);"));
        }
        Mode::Int8 => {
            e.line("current = __riscv_vadd_vv_i32m1(current, acc, vl);");
            e.line(&format!("__riscv_vse32_v_i32m1(C + i * {n} + j, current, vl);"));
        }
    }
    e.line("j += vl;");
    e.line("avl -= vl;");
    e.end_scope();
    e.line("}");
    e.end_scope();
    e.line("}");
    e.end_scope();
    e.line("}");
    Ok(())
}

/// Elementwise binary op: vector left operand, per-row scalar right operand
fn elementwise(e: &mut Emitter<Rvv>, args: &[Expr], op: &str) -> Result<(), Error> {
    let dst = e.region_tensor_id(arg_region(args, 0)?)?;
    let a = e.region_tensor_id(arg_region(args, 1)?)?;
    let b = e.region_tensor_id(arg_region(args, 2)?)?;
    let info = VecInfo::float_only(arg_region(args, 0)?.buffer.dtype)?;
    e.line("{");
    e.begin_scope();
    e.line(&format!("{0}* dst_ptr = ({0}*){dst}.addr;", info.ctype));
    e.line(&format!("{0}* src0_ptr = ({0}*){a}.addr;", info.ctype));
    e.line(&format!("{0}* src1_ptr = ({0}*){b}.addr;", info.ctype));
    e.line(&format!("size_t num_rows = {dst}.shape[1];"));
    e.line(&format!("size_t row_size = {dst}.shape[3];"));
    e.line("size_t vl;");
    e.line("for (size_t row_idx = 0; row_idx < num_rows; row_idx++) {");
    e.begin_scope();
    e.line(&format!("{} scale_val = src1_ptr[row_idx];", info.ctype));
    e.line("for (size_t col_offset = 0; col_offset < row_size; col_offset += vl) {");
    e.begin_scope();
    e.line(&format!(
        "vl = __riscv_vsetvl_e{}m1(row_size - col_offset);",
        info.eew
    ));
    e.line(&format!(
        "{vtype} v_src0 = __riscv_vle{eew}_v_{suffix}(src0_ptr + row_idx * row_size + \
         col_offset, vl);",
        vtype = info.vtype,
        eew = info.eew,
        suffix = info.suffix
    ));
    e.line(&format!(
        "{vtype} v_dst = __riscv_vf{op}_vf_{suffix}(v_src0, scale_val, vl);",
        vtype = info.vtype,
        suffix = info.suffix
    ));
    e.line(&format!(
        "__riscv_vse{eew}_v_{suffix}(dst_ptr + row_idx * row_size + col_offset, v_dst, vl);",
        eew = info.eew,
        suffix = info.suffix
    ));
    e.end_scope();
    e.line("}");
    e.end_scope();
    e.line("}");
    e.line(FENCE);
    e.end_scope();
    e.line("}");
    Ok(())
}

/// Elementwise op against a broadcast constant over the flattened tensor
fn elementwise_const(e: &mut Emitter<Rvv>, args: &[Expr], op: &str) -> Result<(), Error> {
    let dst = e.region_tensor_id(arg_region(args, 0)?)?;
    let a = e.region_tensor_id(arg_region(args, 1)?)?;
    let value = arg_float(args, 2)?;
    let info = VecInfo::of(arg_region(args, 0)?.buffer.dtype)?;
    e.line("{");
    e.begin_scope();
    e.line(&format!("{0}* dst_ptr = ({0}*){dst}.addr;", info.ctype));
    e.line(&format!("{0}* src0_ptr = ({0}*){a}.addr;", info.ctype));
    e.line(&format!(
        "size_t total_elements = {dst}.shape[1] * {dst}.shape[3];"
    ));
    e.line("size_t vl;");
    e.line("for (size_t offset = 0; offset < total_elements; offset += vl) {");
    e.begin_scope();
    e.line(&format!(
        "vl = __riscv_vsetvl_e{}m1(total_elements - offset);",
        info.eew
    ));
    e.line(&format!(
        "{vtype} v_src0 = __riscv_vle{eew}_v_{suffix}(src0_ptr + offset, vl);",
        vtype = info.vtype,
        eew = info.eew,
        suffix = info.suffix
    ));
    if info.float {
        e.line(&format!(
            "{} temp_const = {};",
            info.ctype,
            Emitter::<Rvv>::scalar_literal(value)
        ));
        e.line(&format!(
            "{} v_src1 = __riscv_vfmv_v_f_{}(temp_const, vl);",
            info.vtype, info.suffix
        ));
        e.line(&format!(
            "{vtype} v_dst = __riscv_vf{op}_vv_{suffix}(v_src0, v_src1, vl);",
            vtype = info.vtype,
            suffix = info.suffix
        ));
    } else {
        e.line(&format!("{} temp_const = {};", info.ctype, value as i64));
        e.line(&format!(
            "{} v_src1 = __riscv_vmv_v_x_{}(temp_const, vl);",
            info.vtype, info.suffix
        ));
        e.line(&format!(
            "{vtype} v_dst = __riscv_v{op}_vv_{suffix}(v_src0, v_src1, vl);",
            vtype = info.vtype,
            suffix = info.suffix
        ));
    }
    e.line(&format!(
        "__riscv_vse{}_v_{}(dst_ptr + offset, v_dst, vl);",
        info.eew, info.suffix
    ));
    e.end_scope();
    e.line("}");
    e.line(FENCE);
    e.end_scope();
    e.line("}");
    Ok(())
}

/// In-place exponential through a bounded stack spill and scalar `expf`
fn exp(e: &mut Emitter<Rvv>, args: &[Expr]) -> Result<(), Error> {
    let tensor = arg_region(args, 0)?;
    let id = e.region_tensor_id(tensor)?;
    let info = VecInfo::float_only(tensor.buffer.dtype)?;
    e.line("{");
    e.begin_scope();
    e.line(&format!("{0}* input_ptr = ({0}*){id}.addr;", info.ctype));
    e.line(&format!(
        "size_t total_elements = {id}.shape[1] * {id}.shape[3];"
    ));
    e.line("size_t vl;");
    e.line("for (size_t offset = 0; offset < total_elements; offset += vl) {");
    e.begin_scope();
    e.line(&format!(
        "size_t chunk = total_elements - offset < {SPILL_CAPACITY} ? total_elements - offset : \
         {SPILL_CAPACITY};"
    ));
    e.line(&format!("vl = __riscv_vsetvl_e{}m1(chunk);", info.eew));
    e.line(&format!(
        "{vtype} vec = __riscv_vle{eew}_v_{suffix}(input_ptr + offset, vl);",
        vtype = info.vtype,
        eew = info.eew,
        suffix = info.suffix
    ));
    e.line(&format!("{} temp[{SPILL_CAPACITY}];", info.ctype));
    e.line(&format!(
        "__riscv_vse{}_v_{}(temp, vec, vl);",
        info.eew, info.suffix
    ));
    e.line("for (size_t j = 0; j < vl; j++) {");
    if info.ctype == "_Float16" {
        e.line(&format!("  temp[j] = ({})(expf(temp[j]));", info.ctype));
    } else {
        e.line("  temp[j] = expf(temp[j]);");
    }
    e.line("}");
    e.line(&format!(
        "vec = __riscv_vle{}_v_{}(temp, vl);",
        info.eew, info.suffix
    ));
    e.line(&format!(
        "__riscv_vse{}_v_{}(input_ptr + offset, vec, vl);",
        info.eew, info.suffix
    ));
    e.end_scope();
    e.line("}");
    e.line(FENCE);
    e.end_scope();
    e.line("}");
    Ok(())
}

#[derive(Copy, Clone, PartialEq)]
enum ReduceKind {
    Max,
    Sum,
}

/// Row-wise reduction: a vector accumulator seeded with the identity,
/// strip-mined single-register reductions, one scalar move per row
fn reduce(e: &mut Emitter<Rvv>, args: &[Expr], kind: ReduceKind) -> Result<(), Error> {
    let input = arg_region(args, 0)?;
    let in_id = e.region_tensor_id(input)?;
    let out_id = e.region_tensor_id(arg_region(args, 1)?)?;
    let info = VecInfo::of(input.buffer.dtype)?;
    if info.eew == 8 {
        return Err(Error::UnsupportedType(input.buffer.dtype));
    }

    let init = match (kind, info.float, info.unsigned) {
        (ReduceKind::Max, true, _) => format!("({})(-INFINITY)", info.ctype),
        (ReduceKind::Max, false, true) => "0".to_string(),
        (ReduceKind::Max, false, false) => format!("INT{}_MIN", info.eew),
        (ReduceKind::Sum, true, _) => "0.0f".to_string(),
        (ReduceKind::Sum, false, _) => "0".to_string(),
    };
    let red = match (kind, info.float, info.unsigned) {
        (ReduceKind::Max, true, _) => "vfredmax",
        (ReduceKind::Max, false, true) => "vredmaxu",
        (ReduceKind::Max, false, false) => "vredmax",
        (ReduceKind::Sum, true, _) => "vfredusum",
        (ReduceKind::Sum, false, _) => "vredsum",
    };

    e.line("{");
    e.begin_scope();
    e.line(&format!("{0}* input_ptr = ({0}*){in_id}.addr;", info.ctype));
    e.line(&format!("{0}* output_ptr = ({0}*){out_id}.addr;", info.ctype));
    e.line(&format!("{} init_val = {init};", info.ctype));
    e.line(&format!(
        "size_t max_vl = __riscv_vsetvlmax_e{}m1();",
        info.eew
    ));
    if info.float {
        e.line(&format!(
            "{} vec_acc_init = __riscv_vfmv_v_f_{}(init_val, max_vl);",
            info.vtype, info.suffix
        ));
    } else {
        e.line(&format!(
            "{} vec_acc_init = __riscv_vmv_v_x_{}(init_val, max_vl);",
            info.vtype, info.suffix
        ));
    }
    e.line(&format!("size_t N = {in_id}.shape[1];"));
    e.line(&format!("size_t M = {in_id}.shape[3];"));
    e.line("for (size_t i = 0; i < N; i++) {");
    e.begin_scope();
    e.line(&format!(
        "{}* group_start = input_ptr + i * M;",
        info.ctype
    ));
    e.line(&format!("{} vec_acc = vec_acc_init;", info.vtype));
    e.line("size_t j = 0;");
    e.line("while (j < M) {");
    e.begin_scope();
    e.line(&format!("size_t vl = __riscv_vsetvl_e{}m1(M - j);", info.eew));
    e.line(&format!(
        "{vtype} vec = __riscv_vle{eew}_v_{suffix}(group_start + j, vl);",
        vtype = info.vtype,
        eew = info.eew,
        suffix = info.suffix
    ));
    e.line(&format!(
        "vec_acc = __riscv_{red}_vs_{suffix}_{suffix}(vec, vec_acc, vl);",
        suffix = info.suffix
    ));
    e.line("j += vl;");
    e.end_scope();
    e.line("}");
    if info.float {
        e.line(&format!(
            "output_ptr[i] = __riscv_vfmv_f_s_{}_{}(vec_acc);",
            info.suffix, info.short
        ));
    } else {
        e.line(&format!(
            "output_ptr[i] = __riscv_vmv_x_s_{}_{}(vec_acc);",
            info.suffix, info.short
        ));
    }
    e.end_scope();
    e.line("}");
    e.line(FENCE);
    e.end_scope();
    e.line("}");
    Ok(())
}

/// Embedding gather; an out-of-range index zero-fills its output row
fn embedding(e: &mut Emitter<Rvv>, args: &[Expr]) -> Result<(), Error> {
    let out_id = e.region_tensor_id(arg_region(args, 0)?)?;
    let params_id = e.region_tensor_id(arg_region(args, 1)?)?;
    let index_region = arg_region(args, 2)?;
    let index_id = e.region_tensor_id(index_region)?;
    let inner = arg_int(args, 6)?;
    let select = arg_int(args, 7)?;
    let index_num = arg_int(args, 8)?;
    let info = VecInfo::float_only(arg_region(args, 0)?.buffer.dtype)?;
    let index_dtype = index_region.buffer.dtype;
    let index_ctype = match (index_dtype.kind, index_dtype.bits) {
        (TypeKind::Int | TypeKind::UInt, 16) => "uint16_t",
        (TypeKind::Int | TypeKind::UInt, 32) => "uint32_t",
        _ => return Err(Error::UnsupportedType(index_dtype)),
    };

    e.line("{");
    e.begin_scope();
    e.line(&format!(
        "{0}* params_ptr = ({0}*){params_id}.addr;",
        info.ctype
    ));
    e.line(&format!("{0}* output_ptr = ({0}*){out_id}.addr;", info.ctype));
    e.line(&format!(
        "{index_ctype}* index_ptr = ({index_ctype}*){index_id}.addr;"
    ));
    e.line(&format!("for (int i = 0; i < {index_num}; i++) {{"));
    e.begin_scope();
    e.line(&format!("{index_ctype} idx = index_ptr[i];"));
    e.line("int j = 0;");
    e.line(&format!("while (j < {inner}) {{"));
    e.begin_scope();
    e.line(&format!(
        "size_t vl = __riscv_vsetvl_e{}m1({inner} - j);",
        info.eew
    ));
    e.line(&format!("if (idx >= {select}) {{"));
    e.begin_scope();
    e.line(&format!(
        "{} zero_vec = __riscv_vfmv_v_f_{}(0, vl);",
        info.vtype, info.suffix
    ));
    e.line(&format!(
        "__riscv_vse{}_v_{}(output_ptr + i * {inner} + j, zero_vec, vl);",
        info.eew, info.suffix
    ));
    e.end_scope();
    e.line("} else {");
    e.begin_scope();
    e.line(&format!(
        "{vtype} vec = __riscv_vle{eew}_v_{suffix}(params_ptr + idx * {inner} + j, vl);",
        vtype = info.vtype,
        eew = info.eew,
        suffix = info.suffix
    ));
    e.line(&format!(
        "__riscv_vse{}_v_{}(output_ptr + i * {inner} + j, vec, vl);",
        info.eew, info.suffix
    ));
    e.end_scope();
    e.line("}");
    e.line("j += vl;");
    e.end_scope();
    e.line("}");
    e.end_scope();
    e.line("}");
    e.line(FENCE);
    e.end_scope();
    e.line("}");
    Ok(())
}

/// Reciprocal square root: `vfrec7` of `vfsqrt` refined by one Newton
/// iteration `r = r * (2 - s * r)`
fn rsqrt(e: &mut Emitter<Rvv>, args: &[Expr]) -> Result<(), Error> {
    let dst = e.region_tensor_id(arg_region(args, 0)?)?;
    let src_region = arg_region(args, 1)?;
    let src = e.region_tensor_id(src_region)?;
    let info = VecInfo::float_only(src_region.buffer.dtype)?;
    let total: i64 = src_region.buffer.shape.iter().product();
    e.line("{");
    e.begin_scope();
    e.line("size_t vl;");
    e.line(&format!("for (size_t i = 0; i < {total}; i += vl) {{"));
    e.begin_scope();
    e.line(&format!("vl = __riscv_vsetvl_e{}m1({total} - i);", info.eew));
    e.line(&format!(
        "{vtype} vec_src = __riscv_vle{eew}_v_{suffix}(({ctype}*){src}.addr + i, vl);",
        vtype = info.vtype,
        eew = info.eew,
        suffix = info.suffix,
        ctype = info.ctype
    ));
    e.line(&format!(
        "{vtype} vec_sqrt = __riscv_vfsqrt_v_{suffix}(vec_src, vl);",
        vtype = info.vtype,
        suffix = info.suffix
    ));
    e.line(&format!(
        "{vtype} vec_rec = __riscv_vfrec7_v_{suffix}(vec_sqrt, vl);",
        vtype = info.vtype,
        suffix = info.suffix
    ));
    e.line(&format!(
        "vec_rec = __riscv_vfmul_vv_{suffix}(vec_rec, __riscv_vfrsub_vf_{suffix}(\
         __riscv_vfmul_vv_{suffix}(vec_sqrt, vec_rec, vl), 2.0, vl), vl);",
        suffix = info.suffix
    ));
    e.line(&format!(
        "__riscv_vse{eew}_v_{suffix}(({ctype}*){dst}.addr + i, vec_rec, vl);",
        eew = info.eew,
        suffix = info.suffix,
        ctype = info.ctype
    ));
    e.end_scope();
    e.line("}");
    e.end_scope();
    e.line("}");
    Ok(())
}
