use std::collections::{BTreeMap, HashMap, HashSet};

use bitflags::bitflags;

use crate::dtype::DataType;
use crate::error::Error;
use crate::ir::{BinOp, Buffer, CallOp, Expr, ForKind, IrModule, PrimFunc, Region, Stmt, Var};

/// A handler lowering one tensor intrinsic into target code.
/// `args` is the payload of the `call_extern` (the symbol already consumed).
pub type IntrinsicFn<T> = fn(&mut Emitter<T>, &[Expr]) -> Result<(), Error>;

/// The seam between the base visitor and a concrete backend.
///
/// A target contributes its intrinsic dispatch table plus a small set of
/// per-statement hooks; everything else (expressions, control flow, name
/// management) is shared.
pub trait Target: Sized {
    /// Intrinsic namespace, e.g. `ppl` in `call_extern("ppl.copy", ...)`
    const NS: &'static str;
    /// Emitted tensor-descriptor type name
    const DESCRIPTOR: &'static str;

    fn type_token(t: DataType) -> Result<String, Error>;

    /// Dispatch-table lookup for an intrinsic name without the namespace
    fn intrinsic(op: &str) -> Option<IntrinsicFn<Self>>;

    fn emit_allocate(
        e: &mut Emitter<Self>,
        var: &Var,
        dtype: DataType,
        extents: &[i64],
    ) -> Result<(), Error>;

    /// Handle a recognized attribute key; unknown keys are transparent
    fn emit_attr(_e: &mut Emitter<Self>, _key: &str) {}

    /// Emit the function signature and parameter materialization.
    /// Returns the parameter identifiers for the epilogue.
    fn emit_prologue(e: &mut Emitter<Self>, func: &PrimFunc) -> Result<Vec<String>, Error>;

    /// Close the function and emit any per-function trailer
    fn emit_epilogue(
        e: &mut Emitter<Self>,
        func: &PrimFunc,
        params: &[String],
    ) -> Result<(), Error>;

    /// Header declarations prepended once by [`Emitter::finish`]
    fn decl_prefix() -> String;
}

bitflags! {
    /// Which endpoints of a copy touch globally visible memory.
    /// Drives DMA-direction selection and fence emission.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct CopyEnds: u8 {
        const SRC_GLOBAL = 1 << 0;
        const DST_GLOBAL = 1 << 1;
    }
}

impl CopyEnds {
    #[must_use]
    pub fn from_regions(src: &Region, dst: &Region) -> Self {
        let mut ends = Self::empty();
        if src.buffer.scope.is_global() {
            ends |= Self::SRC_GLOBAL;
        }
        if dst.buffer.scope.is_global() {
            ends |= Self::DST_GLOBAL;
        }
        ends
    }
}

/// Rendered form of an expression: statements that must precede the
/// enclosing statement, and the inline fragment standing for the value.
#[derive(Debug, Default)]
pub(crate) struct Rendered {
    pub prelude: String,
    pub inline: String,
}

impl Rendered {
    fn pure(inline: impl Into<String>) -> Self {
        Self {
            prelude: String::new(),
            inline: inline.into(),
        }
    }
}

/// Fresh-name supply: sanitizes hints and keeps emitted names unique
/// within one function.
#[derive(Debug, Default)]
struct NameSupply {
    used: HashSet<String>,
}

impl NameSupply {
    fn fresh(&mut self, hint: &str) -> String {
        let base: String = hint
            .chars()
            .map(|c| if matches!(c, ':' | '-' | '.') { '_' } else { c })
            .collect();
        let base = if base.is_empty() { "v".to_string() } else { base };
        if self.used.insert(base.clone()) {
            return base;
        }
        let mut n = 1u32;
        loop {
            let candidate = if base == "_" {
                format!("_{n}")
            } else {
                format!("{base}_{n}")
            };
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    fn clear(&mut self) {
        self.used.clear();
    }
}

const VEC_ACCESS: [char; 4] = ['x', 'y', 'z', 'w'];

/// Single-pass code emitter over one or more [`PrimFunc`]s.
///
/// All derived tables are owned by the emitter and reset per function;
/// the accumulated source text persists until [`finish`](Self::finish).
pub struct Emitter<T: Target> {
    body: String,
    indent: usize,
    names: NameSupply,
    pub(crate) var_ids: HashMap<Var, String>,
    pub(crate) handle_types: HashMap<Var, DataType>,
    /// Normalized (n, c, h, w) per emitted tensor name
    pub(crate) buffer_shapes: HashMap<String, [i64; 4]>,
    /// Row-major strides per buffer name, inherited by sliced regions
    pub(crate) buffer_strides: HashMap<String, [i64; 4]>,
    /// Planner-assigned byte offsets, keyed by on-chip allocation var
    pub(crate) buffer_addrs: HashMap<Var, i64>,
    /// Parameter basename (hint minus `_handle`) to descriptor name
    pub(crate) parameter_map: HashMap<String, String>,
    pub(crate) fn_attrs: BTreeMap<String, i64>,
    warnings: Vec<String>,
    _target: std::marker::PhantomData<T>,
}

impl<T: Target> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Target> Emitter<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            body: String::new(),
            indent: 0,
            names: NameSupply::default(),
            var_ids: HashMap::new(),
            handle_types: HashMap::new(),
            buffer_shapes: HashMap::new(),
            buffer_strides: HashMap::new(),
            buffer_addrs: HashMap::new(),
            parameter_map: HashMap::new(),
            fn_attrs: BTreeMap::new(),
            warnings: Vec::new(),
            _target: std::marker::PhantomData,
        }
    }

    /// Emit the full C source for one function
    pub fn add_function(&mut self, func: &PrimFunc) -> Result<(), Error> {
        self.init_func_state(func);
        let params = T::emit_prologue(self, func)?;
        self.emit_stmt(&func.body)?;
        T::emit_epilogue(self, func, &params)
    }

    /// Accumulated source, prefixed by the target's header declarations
    #[must_use]
    pub fn finish(&self) -> String {
        let mut out = T::decl_prefix();
        out.push_str(&self.body);
        out
    }

    /// Non-fatal diagnostics gathered during emission
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn init_func_state(&mut self, func: &PrimFunc) {
        self.names.clear();
        self.var_ids.clear();
        self.handle_types.clear();
        self.buffer_shapes.clear();
        self.buffer_strides.clear();
        self.buffer_addrs.clear();
        self.parameter_map.clear();
        self.fn_attrs = func.attrs.clone();
        self.indent = 0;
        for (var, buffer) in &func.buffer_map {
            self.handle_types.insert(var.clone(), buffer.dtype);
        }
    }

    // ---- stream helpers ----------------------------------------------

    pub(crate) fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.body.push_str("  ");
        }
        self.body.push_str(text);
        self.body.push('\n');
    }

    pub(crate) fn raw(&mut self, text: &str) {
        self.body.push_str(text);
    }

    pub(crate) fn begin_scope(&mut self) {
        self.indent += 1;
    }

    pub(crate) fn end_scope(&mut self) {
        self.indent -= 1;
    }

    fn indented(&self, text: &str) -> String {
        let mut s = "  ".repeat(self.indent);
        s.push_str(text);
        s.push('\n');
        s
    }

    // ---- names and tables --------------------------------------------

    pub(crate) fn fresh(&mut self, hint: &str) -> String {
        self.names.fresh(hint)
    }

    /// Bind a fresh emitted name to `v`. Rebinding is allowed: repeated
    /// allocations of one variable (double buffering) shadow the earlier
    /// name, latest binding wins.
    pub(crate) fn alloc_var_id(&mut self, v: &Var) -> String {
        let vid = self.names.fresh(&v.hint);
        self.var_ids.insert(v.clone(), vid.clone());
        vid
    }

    pub(crate) fn var_id(&self, v: &Var) -> Result<String, Error> {
        self.var_ids
            .get(v)
            .cloned()
            .ok_or_else(|| Error::MalformedIr(format!("variable `{}` read before binding", v.hint)))
    }

    /// Emitted tensor identifier for a region operand: the bound name of
    /// its data var, or the parameter descriptor for function inputs.
    pub(crate) fn region_tensor_id(&self, region: &Region) -> Result<String, Error> {
        if let Some(vid) = self.var_ids.get(&region.buffer.data) {
            return Ok(vid.clone());
        }
        self.parameter_map
            .get(&region.buffer.name)
            .cloned()
            .ok_or_else(|| {
                Error::MalformedIr(format!("unknown tensor `{}` in region", region.buffer.name))
            })
    }

    /// Left-pad a rank-2 shape to (1, H, 1, W); rank 4 passes through.
    pub(crate) fn normalize_shape(shape: &[i64]) -> Result<[i64; 4], Error> {
        match shape {
            [w] => Ok([1, 1, 1, *w]),
            [h, w] => Ok([1, *h, 1, *w]),
            [n, c, h, w] => Ok([*n, *c, *h, *w]),
            _ => Err(Error::MalformedIr(format!(
                "buffer rank {} not in {{1, 2, 4}}",
                shape.len()
            ))),
        }
    }

    /// Row-major contiguous strides for a normalized shape
    #[must_use]
    pub(crate) fn default_strides(shape: [i64; 4]) -> [i64; 4] {
        let mut stride = [1i64; 4];
        for i in (0..3).rev() {
            stride[i] = shape[i + 1] * stride[i + 1];
        }
        stride
    }

    /// Register a buffer's normalized shape and default strides under its
    /// textual name.
    pub(crate) fn register_buffer(&mut self, name: &str, shape: &[i64]) -> Result<[i64; 4], Error> {
        let normalized = Self::normalize_shape(shape)?;
        self.buffer_shapes.insert(name.to_string(), normalized);
        self.buffer_strides
            .insert(name.to_string(), Self::default_strides(normalized));
        Ok(normalized)
    }

    /// Element offset of a region within its parent buffer:
    /// `(min_0) * stride_{map(0)} + ...`. The caller scales by element
    /// bytes. Rank 2 maps onto the C and W strides of the 4-D layout.
    pub(crate) fn region_offset_expr(&mut self, region: &Region) -> Result<String, Error> {
        let strides = match self.buffer_strides.get(&region.buffer.name) {
            Some(s) => *s,
            None => Self::default_strides(Self::normalize_shape(&region.buffer.shape)?),
        };
        let map: &[usize] = match region.ranges.len() {
            2 => &[1, 3],
            4 => &[0, 1, 2, 3],
            n => {
                return Err(Error::MalformedIr(format!("region rank {n} not in {{2, 4}}")));
            }
        };
        let mut parts = Vec::with_capacity(region.ranges.len());
        for (i, (min, _)) in region.ranges.iter().enumerate() {
            let min_str = self.expr_inline(min)?;
            parts.push(format!("({min_str}) * {}", strides[map[i]]));
        }
        Ok(format!("({})", parts.join(" + ")))
    }

    /// The region's extents as a brace-wrapped normalized 4-D shape
    pub(crate) fn region_shape_literal(region: &Region) -> Result<(String, [i64; 4]), Error> {
        let extents: Vec<i64> = region.ranges.iter().map(|(_, e)| *e).collect();
        let shape = match extents.as_slice() {
            [h, w] => [1, *h, 1, *w],
            [n, c, h, w] => [*n, *c, *h, *w],
            _ => {
                return Err(Error::MalformedIr(format!(
                    "region rank {} not in {{2, 4}}",
                    extents.len()
                )));
            }
        };
        Ok((
            format!("{{{}, {}, {}, {}}}", shape[0], shape[1], shape[2], shape[3]),
            shape,
        ))
    }

    // ---- expressions --------------------------------------------------

    /// Render an expression and merge its prelude into the stream at the
    /// current position; returns the inline fragment.
    pub(crate) fn expr_inline(&mut self, e: &Expr) -> Result<String, Error> {
        let r = self.render_expr(e)?;
        self.raw(&r.prelude);
        Ok(r.inline)
    }

    pub(crate) fn render_expr(&mut self, e: &Expr) -> Result<Rendered, Error> {
        match e {
            Expr::Var(v) => Ok(Rendered::pure(self.var_id(v)?)),
            Expr::IntImm { value, .. } => Ok(Rendered::pure(value.to_string())),
            Expr::FloatImm { dtype, value } => {
                Ok(Rendered::pure(Self::float_const(*dtype, *value)?))
            }
            Expr::StringImm(s) => Ok(Rendered::pure(format!("\"{s}\""))),
            Expr::Binary { op, dtype, a, b } => {
                if dtype.is_scalar() {
                    let a = self.render_expr(a)?;
                    let b = self.render_expr(b)?;
                    let tok = op.token();
                    let inline = if tok.chars().next().is_some_and(char::is_alphabetic) {
                        format!("{tok}({}, {})", a.inline, b.inline)
                    } else {
                        format!("({} {tok} {})", a.inline, b.inline)
                    };
                    Ok(Rendered {
                        prelude: a.prelude + &b.prelude,
                        inline,
                    })
                } else {
                    self.render_vec_binary(*op, *dtype, a, b)
                }
            }
            Expr::Compare { op, a, b } => {
                let a = self.render_expr(a)?;
                let b = self.render_expr(b)?;
                Ok(Rendered {
                    prelude: a.prelude + &b.prelude,
                    inline: format!("({} {} {})", a.inline, op.token(), b.inline),
                })
            }
            Expr::Cast { dtype, value } => self.render_cast(*dtype, value),
            Expr::Ramp {
                base,
                stride,
                lanes,
            } => {
                let b = self.render_expr(base)?;
                let s = self.render_expr(stride)?;
                let token = T::type_token(e.dtype())?;
                let elems: Vec<String> = (0..*lanes)
                    .map(|i| format!("({})+({}*{i})", b.inline, s.inline))
                    .collect();
                Ok(Rendered {
                    prelude: b.prelude + &s.prelude,
                    inline: format!("(make_{token}({}))", elems.join(", ")),
                })
            }
            Expr::Call { op, dtype, args } => match op {
                CallOp::IfThenElse => self.render_if_then_else(*dtype, args),
                CallOp::Extern(symbol) => self.render_extern(symbol, *dtype, args),
            },
            Expr::BufferLoad { buffer, indices } => self.render_buffer_load(buffer, indices),
            Expr::Region(region) => Err(Error::MalformedIr(format!(
                "region over `{}` outside an intrinsic call",
                region.buffer.name
            ))),
        }
    }

    fn render_extern(
        &mut self,
        symbol: &str,
        dtype: DataType,
        args: &[Expr],
    ) -> Result<Rendered, Error> {
        if let Some(op) = symbol.strip_prefix(T::NS).and_then(|s| s.strip_prefix('.')) {
            if let Some(handler) = T::intrinsic(op) {
                handler(self, args)?;
                return Ok(Rendered::default());
            }
            self.warnings.push(format!(
                "unknown intrinsic `{symbol}`, emitted as a plain extern call"
            ));
        }
        if dtype.is_vector() {
            // Unroll an unsupported vector call into per-lane scalar calls
            let sret = self.fresh("_");
            let token = T::type_token(dtype)?;
            let mut prelude = self.indented(&format!("{token} {sret};"));
            let mut rendered = Vec::with_capacity(args.len());
            for a in args {
                let r = self.render_expr(a)?;
                prelude.push_str(&r.prelude);
                rendered.push((r.inline, a.dtype()));
            }
            for lane in 0..dtype.lanes {
                let loads: Vec<String> = rendered
                    .iter()
                    .map(|(inline, t)| Self::vec_elem_load(inline, *t, lane))
                    .collect();
                let call = format!("{symbol}({})", loads.join(", "));
                prelude.push_str(&self.indented(&Self::vec_elem_store(&sret, dtype, lane, &call)));
            }
            return Ok(Rendered {
                prelude,
                inline: sret,
            });
        }
        let mut prelude = String::new();
        let mut rendered = Vec::with_capacity(args.len());
        for a in args {
            let r = self.render_expr(a)?;
            prelude.push_str(&r.prelude);
            rendered.push(r.inline);
        }
        Ok(Rendered {
            prelude,
            inline: format!("{symbol}({})", rendered.join(", ")),
        })
    }

    fn render_if_then_else(&mut self, dtype: DataType, args: &[Expr]) -> Result<Rendered, Error> {
        let [cond, then_val, else_val] = args else {
            return Err(Error::MalformedIr("if_then_else expects 3 arguments".into()));
        };
        let result = self.fresh("condval");
        let cond = self.render_expr(cond)?;
        let mut prelude = cond.prelude;
        // A buffer-typed branch yields a tensor descriptor, not a scalar
        let is_descriptor = then_val
            .as_var()
            .is_some_and(|v| self.buffer_addrs.contains_key(v));
        let decl_ty = if is_descriptor {
            T::DESCRIPTOR.to_string()
        } else {
            T::type_token(dtype)?
        };
        prelude.push_str(&self.indented(&format!("{decl_ty} {result};")));
        prelude.push_str(&self.indented(&format!("if ({}) {{", cond.inline)));
        self.begin_scope();
        let t = self.render_expr(then_val)?;
        prelude.push_str(&t.prelude);
        prelude.push_str(&self.indented(&format!("{result} = {};", t.inline)));
        self.end_scope();
        prelude.push_str(&self.indented("} else {"));
        self.begin_scope();
        let f = self.render_expr(else_val)?;
        prelude.push_str(&f.prelude);
        prelude.push_str(&self.indented(&format!("{result} = {};", f.inline)));
        self.end_scope();
        prelude.push_str(&self.indented("}"));
        Ok(Rendered {
            prelude,
            inline: result,
        })
    }

    fn render_vec_binary(
        &mut self,
        op: BinOp,
        dtype: DataType,
        a: &Expr,
        b: &Expr,
    ) -> Result<Rendered, Error> {
        let sret = self.fresh("_");
        let token = T::type_token(dtype)?;
        let mut prelude = self.indented(&format!("{token} {sret};"));
        let ra = self.render_expr(a)?;
        let rb = self.render_expr(b)?;
        prelude.push_str(&ra.prelude);
        prelude.push_str(&rb.prelude);
        let tok = op.token();
        for lane in 0..dtype.lanes {
            let lhs = Self::vec_elem_load(&ra.inline, a.dtype(), lane);
            let rhs = Self::vec_elem_load(&rb.inline, b.dtype(), lane);
            let value = if tok.chars().next().is_some_and(char::is_alphabetic) {
                format!("{tok}({lhs}, {rhs})")
            } else {
                format!("({lhs}{tok}{rhs})")
            };
            prelude.push_str(&self.indented(&Self::vec_elem_store(&sret, dtype, lane, &value)));
        }
        Ok(Rendered {
            prelude,
            inline: sret,
        })
    }

    fn render_cast(&mut self, target_ty: DataType, value: &Expr) -> Result<Rendered, Error> {
        let from_ty = value.dtype();
        if target_ty.lanes != from_ty.lanes {
            return Err(Error::MalformedIr(format!(
                "cast changes lanes: {from_ty} to {target_ty}"
            )));
        }
        if from_ty.is_scalar() {
            let v = self.render_expr(value)?;
            return Ok(Rendered {
                prelude: v.prelude,
                inline: Self::cast_from_to(&v.inline, from_ty, target_ty)?,
            });
        }
        // Vectorized cast unrolls into per-lane conversions
        let sret = self.fresh("_");
        let token = T::type_token(target_ty)?;
        let mut prelude = self.indented(&format!("{token} {sret};"));
        let src = self.render_expr(value)?;
        prelude.push_str(&src.prelude);
        let elem_token = T::type_token(target_ty.element_of())?;
        for lane in 0..from_ty.lanes {
            let loaded = Self::vec_elem_load(&src.inline, from_ty, lane);
            let converted = format!("({elem_token})({loaded})");
            prelude.push_str(&self.indented(&Self::vec_elem_store(
                &sret, target_ty, lane, &converted,
            )));
        }
        Ok(Rendered {
            prelude,
            inline: sret,
        })
    }

    fn render_buffer_load(&mut self, buffer: &Buffer, indices: &[Expr]) -> Result<Rendered, Error> {
        let t = buffer.dtype;
        let vid = self.var_id(&buffer.data)?;
        let matches_handle = self.handle_types.get(&buffer.data) == Some(&buffer.dtype);
        let elem_token = T::type_token(t.element_of())?;
        let buffer_str = if matches_handle {
            vid.clone()
        } else {
            format!("(({elem_token}*){vid})")
        };
        // Flatten a multi-axis access against the buffer's row-major layout
        let mut prelude = String::new();
        let index_str = if indices.len() == 1 {
            let r = self.render_expr(&indices[0])?;
            prelude = r.prelude;
            r.inline
        } else {
            let shape = Self::normalize_shape(&buffer.shape)?;
            let strides = Self::default_strides(shape);
            let map: &[usize] = match indices.len() {
                2 => &[1, 3],
                4 => &[0, 1, 2, 3],
                n => {
                    return Err(Error::MalformedIr(format!("buffer access rank {n}")));
                }
            };
            let mut parts = Vec::with_capacity(indices.len());
            for (i, idx) in indices.iter().enumerate() {
                let r = self.render_expr(idx)?;
                prelude.push_str(&r.prelude);
                parts.push(format!("({}) * {}", r.inline, strides[map[i]]));
            }
            parts.join(" + ")
        };
        let inline = if t.bits == 4 || (t.bits == 1 && t.is_int()) {
            // Sub-byte elements are backed by int32 words
            let div_factor = if t.lanes == 1 {
                32 / i64::from(t.bits)
            } else {
                i64::from(t.lanes)
            };
            format!("*((({elem_token}*){vid}) + {index_str} / {div_factor})")
        } else {
            format!("{buffer_str}[{index_str}]")
        };
        Ok(Rendered { prelude, inline })
    }

    pub(crate) fn cast_from_to(
        value: &str,
        from: DataType,
        target: DataType,
    ) -> Result<String, Error> {
        if from == target {
            return Ok(value.to_string());
        }
        let token = T::type_token(target)?;
        // f16 to 8-bit integers goes through a full-width integer first
        let via_int = if from.is_float() && from.bits == 16 && target.bits == 8 {
            match (target.is_int(), target.is_uint()) {
                (true, _) => "(int)",
                (_, true) => "(uint)",
                _ => "",
            }
        } else {
            ""
        };
        Ok(format!("(({token}){via_int}{value})"))
    }

    pub(crate) fn float_const(dtype: DataType, value: f64) -> Result<String, Error> {
        if matches!(dtype.kind, crate::dtype::TypeKind::BFloat16) {
            return Ok(format!("bfloat16_t({value:e}f)"));
        }
        match dtype.bits {
            32 | 64 => {
                let text = if value.is_infinite() {
                    let sign = if value < 0.0 { "-" } else { "" };
                    let inf = if dtype.bits == 32 {
                        "CUDART_INF_F"
                    } else {
                        "CUDART_INF"
                    };
                    format!("{sign}{inf}")
                } else if value.is_nan() {
                    if dtype.bits == 32 {
                        "CUDART_NAN_F".to_string()
                    } else {
                        "CUDART_NAN".to_string()
                    }
                } else if dtype.bits == 32 {
                    format!("{value:e}f")
                } else {
                    format!("{value:e}")
                };
                Ok(text)
            }
            16 => Ok(format!(
                "half_t({})",
                Self::float_const(DataType::f32(), value)?
            )),
            _ => Err(Error::UnsupportedType(dtype)),
        }
    }

    /// Decimal spelling of a scalar fill value: integral values print
    /// without an exponent so the literal round-trips exactly.
    #[must_use]
    pub(crate) fn scalar_literal(value: f64) -> String {
        if value.fract() == 0.0 && value.abs() < 1e15 {
            format!("{}", value as i64)
        } else {
            format!("{value:e}")
        }
    }

    fn vec_elem_load(vec: &str, t: DataType, i: u16) -> String {
        if t.is_scalar() {
            return vec.to_string();
        }
        let access = |n: u16| VEC_ACCESS[n as usize];
        if t.bits == 8 && (t.is_int() || t.is_uint()) {
            let type_name = if t.is_int() { "char" } else { "unsigned char" };
            if t.lanes == 2 || t.lanes == 3 {
                return format!("{vec}.{}", access(i % t.lanes));
            }
            let ac = if t.lanes == 4 {
                vec.to_string()
            } else {
                format!("{vec}.{}", access(i / 4))
            };
            return format!("(({type_name})({ac} >> {}))", i % 4 * 8);
        }
        if t.is_float() && t.bits == 16 {
            return format!("((half2*)(&({vec}.{})))->{}", access(i / 2), access(i % 2));
        }
        if matches!(t.kind, crate::dtype::TypeKind::BFloat16) {
            return format!(
                "((nv_bfloat162*)(&({vec}.{})))->{}",
                access(i / 2),
                access(i % 2)
            );
        }
        if t.lanes > 4 && t.lanes <= 8 {
            let type_name = match (t.bits, t.kind) {
                (16, crate::dtype::TypeKind::Int) => "short",
                (16, crate::dtype::TypeKind::UInt) => "ushort",
                (32, crate::dtype::TypeKind::Int) => "int",
                (32, crate::dtype::TypeKind::UInt) => "uint",
                (32, crate::dtype::TypeKind::Float) => "float",
                _ => "int",
            };
            return format!(
                "(({type_name}2*)(&({vec}.{})))->{}",
                access(i / 2),
                access(i % 2)
            );
        }
        format!("{vec}.{}", access(i))
    }

    fn vec_elem_store(vec: &str, t: DataType, i: u16, value: &str) -> String {
        let access = |n: u16| VEC_ACCESS[n as usize];
        if t.bits == 8 && (t.is_int() || t.is_uint()) {
            if t.lanes == 2 || t.lanes == 3 {
                return format!("{vec}.{}=({value});", access(i % t.lanes));
            }
            let ac = if t.lanes == 4 {
                vec.to_string()
            } else {
                format!("{vec}.{}", access(i / 4))
            };
            let mut s = format!("{ac}=");
            if i != 0 {
                s.push_str(&format!("{ac} & ~(0x000000ff << {}) |", i % 4 * 8));
            }
            s.push_str(&format!("({value} << {});", i % 4 * 8));
            return s;
        }
        if t.is_float() && t.bits == 16 {
            return format!(
                "((half2*)(&({vec}.{})))->{} = {value};",
                access(i / 2),
                access(i % 2)
            );
        }
        if matches!(t.kind, crate::dtype::TypeKind::BFloat16) {
            return format!(
                "((nv_bfloat162*)(&({vec}.{})))->{} = {value};",
                access(i / 2),
                access(i % 2)
            );
        }
        if t.lanes > 4 && t.lanes <= 8 {
            let type_name = match (t.bits, t.kind) {
                (16, crate::dtype::TypeKind::Int) => "short",
                (16, crate::dtype::TypeKind::UInt) => "ushort",
                (32, crate::dtype::TypeKind::Int) => "int",
                (32, crate::dtype::TypeKind::UInt) => "uint",
                (32, crate::dtype::TypeKind::Float) => "float",
                _ => "int",
            };
            return format!(
                "(({type_name}2*)(&({vec}.{})))->{} = {value};",
                access(i / 2),
                access(i % 2)
            );
        }
        format!("{vec}.{} = {value};", access(i))
    }

    // ---- statements ---------------------------------------------------

    pub(crate) fn emit_stmt(&mut self, s: &Stmt) -> Result<(), Error> {
        match s {
            Stmt::For {
                var,
                min,
                extent,
                kind,
                body,
            } => {
                if *kind == ForKind::Unrolled {
                    self.line("#pragma unroll");
                }
                let bound = self.expr_inline(&fold_add(min, extent))?;
                let start = self.expr_inline(min)?;
                let vid = self.alloc_var_id(var);
                let token = T::type_token(var.dtype)?;
                self.line(&format!(
                    "for ({token} {vid} = {start}; {vid} < {bound}; ++{vid}) {{"
                ));
                self.begin_scope();
                self.emit_stmt(body)?;
                self.end_scope();
                self.line("}");
                Ok(())
            }
            Stmt::LetStmt { var, value, body } => {
                let value_str = self.expr_inline(value)?;
                if var.dtype.is_handle() && self.handle_types.contains_key(var) {
                    let pointee = self.handle_types[var];
                    let token = T::type_token(pointee)?;
                    let vid = self.alloc_var_id(var);
                    self.line(&format!("{token}* {vid} = ({token}*){value_str};"));
                } else if var.hint.contains("shared") {
                    // Tensor-view bindings carry the descriptor type
                    let vid = self.alloc_var_id(var);
                    self.line(&format!("{} {vid} = {value_str};", T::DESCRIPTOR));
                } else {
                    let token = T::type_token(var.dtype)?;
                    let vid = self.alloc_var_id(var);
                    self.line(&format!("{token} {vid} = {value_str};"));
                }
                self.emit_stmt(body)
            }
            Stmt::Allocate {
                var,
                dtype,
                extents,
                body,
            } => {
                T::emit_allocate(self, var, *dtype, extents)?;
                self.emit_stmt(body)
            }
            Stmt::DeclBuffer { body, .. } => self.emit_stmt(body),
            Stmt::AttrStmt { key, body, .. } => {
                T::emit_attr(self, key);
                self.emit_stmt(body)
            }
            Stmt::IfThenElse {
                cond,
                then_case,
                else_case,
            } => {
                let cond_str = self.expr_inline(cond)?;
                self.line(&format!("if ({cond_str}) {{"));
                self.begin_scope();
                self.emit_stmt(then_case)?;
                self.end_scope();
                if let Some(else_case) = else_case {
                    self.line("} else {");
                    self.begin_scope();
                    self.emit_stmt(else_case)?;
                    self.end_scope();
                }
                self.line("}");
                Ok(())
            }
            Stmt::Evaluate(e) => {
                let r = self.render_expr(e)?;
                self.raw(&r.prelude);
                if !r.inline.is_empty() {
                    self.line(&format!("{};", r.inline));
                }
                Ok(())
            }
            Stmt::Seq(stmts) => {
                for s in stmts {
                    self.emit_stmt(s)?;
                }
                Ok(())
            }
        }
    }
}

/// Constant-fold `min + extent` for loop upper bounds
fn fold_add(min: &Expr, extent: &Expr) -> Expr {
    match (min.as_int(), extent.as_int()) {
        (Some(0), _) => extent.clone(),
        (Some(a), Some(b)) => Expr::int(a + b),
        _ => Expr::binary(BinOp::Add, extent.clone(), min.clone()),
    }
}

/// Walk every function of a module through a fresh emitter
pub(crate) fn build_module<T: Target>(module: &IrModule) -> Result<String, Error> {
    let mut cg = Emitter::<T>::new();
    for func in &module.functions {
        cg.add_function(func)?;
    }
    Ok(cg.finish())
}
