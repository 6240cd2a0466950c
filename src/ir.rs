use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use crate::dtype::DataType;
use crate::error::Error;

/// Interior of a [`Var`]
#[derive(Debug)]
pub struct VarNode {
    /// Name hint; the emitter sanitizes and uniquifies it
    pub hint: String,
    pub dtype: DataType,
}

/// An IR variable with shared identity
///
/// Two `Var`s compare equal only when they are clones of the same
/// allocation; the hint plays no part in identity.
#[derive(Debug, Clone)]
pub struct Var(Arc<VarNode>);

impl Var {
    #[must_use]
    pub fn new(hint: impl Into<String>, dtype: DataType) -> Self {
        Self(Arc::new(VarNode {
            hint: hint.into(),
            dtype,
        }))
    }
}

impl Deref for Var {
    type Target = VarNode;
    fn deref(&self) -> &VarNode {
        &self.0
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Var {}

impl Hash for Var {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

/// Storage scope of a buffer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StorageScope {
    Global,
    SharedDyn,
    Shared,
    Local,
}

impl StorageScope {
    pub fn parse(scope: &str) -> Result<Self, Error> {
        match scope {
            "global" => Ok(Self::Global),
            "shared.dyn" => Ok(Self::SharedDyn),
            "shared" => Ok(Self::Shared),
            "" | "local" => Ok(Self::Local),
            other => Err(Error::UnsupportedScope(other.to_string())),
        }
    }

    #[must_use]
    pub fn is_global(self) -> bool {
        matches!(self, Self::Global)
    }
}

/// Interior of a [`Buffer`]
#[derive(Debug)]
pub struct BufferNode {
    pub name: String,
    /// Backing variable; buffers sharing it denote the same storage
    pub data: Var,
    pub dtype: DataType,
    /// Fully-concrete extents
    pub shape: Vec<i64>,
    pub scope: StorageScope,
}

/// A tensor buffer descriptor with shared identity through its data var
#[derive(Debug, Clone)]
pub struct Buffer(Arc<BufferNode>);

impl Buffer {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        dtype: DataType,
        shape: Vec<i64>,
        scope: StorageScope,
    ) -> Self {
        let name = name.into();
        let data = Var::new(format!("{name}_handle"), DataType::handle());
        Self(Arc::new(BufferNode {
            name,
            data,
            dtype,
            shape,
            scope,
        }))
    }

    #[must_use]
    pub fn with_data(
        name: impl Into<String>,
        data: Var,
        dtype: DataType,
        shape: Vec<i64>,
        scope: StorageScope,
    ) -> Self {
        Self(Arc::new(BufferNode {
            name: name.into(),
            data,
            dtype,
            shape,
            scope,
        }))
    }
}

impl Deref for Buffer {
    type Target = BufferNode;
    fn deref(&self) -> &BufferNode {
        &self.0
    }
}

/// An access region over a buffer: per-axis (min, extent) ranges.
/// Rank must be 2 or 4.
#[derive(Debug, Clone)]
pub struct Region {
    pub buffer: Buffer,
    pub ranges: Vec<(Expr, i64)>,
}

impl Region {
    #[must_use]
    pub fn new(buffer: Buffer, ranges: Vec<(Expr, i64)>) -> Self {
        Self { buffer, ranges }
    }

    /// Full-extent region over the buffer's own shape
    #[must_use]
    pub fn full(buffer: Buffer) -> Self {
        let ranges = buffer
            .shape
            .iter()
            .map(|&extent| (Expr::int(0), extent))
            .collect();
        Self { buffer, ranges }
    }
}

/// Binary arithmetic operators
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
}

impl BinOp {
    /// Operator spelling; alphabetic spellings render as prefix calls
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

/// Comparison operators
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Callee of a [`Expr::Call`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOp {
    /// `call_extern("<ns>.<op>", ...)` or a plain foreign symbol
    Extern(String),
    /// Conditional value select
    IfThenElse,
}

/// IR expressions. Every node has a datatype.
#[derive(Debug, Clone)]
pub enum Expr {
    Var(Var),
    IntImm {
        dtype: DataType,
        value: i64,
    },
    FloatImm {
        dtype: DataType,
        value: f64,
    },
    StringImm(String),
    Binary {
        op: BinOp,
        dtype: DataType,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    Cast {
        dtype: DataType,
        value: Box<Expr>,
    },
    Ramp {
        base: Box<Expr>,
        stride: Box<Expr>,
        lanes: u16,
    },
    Call {
        op: CallOp,
        dtype: DataType,
        args: Vec<Expr>,
    },
    BufferLoad {
        buffer: Buffer,
        indices: Vec<Expr>,
    },
    /// Tensor-intrinsic argument carrying an access region
    Region(Region),
}

impl Expr {
    /// An `int32` immediate
    #[must_use]
    pub fn int(value: i64) -> Self {
        Self::IntImm {
            dtype: DataType::i32(),
            value,
        }
    }

    /// An `f32` immediate
    #[must_use]
    pub fn f32imm(value: f64) -> Self {
        Self::FloatImm {
            dtype: DataType::f32(),
            value,
        }
    }

    #[must_use]
    pub fn var(v: &Var) -> Self {
        Self::Var(v.clone())
    }

    /// A `call_extern` node with void result
    #[must_use]
    pub fn call_extern(symbol: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::Call {
            op: CallOp::Extern(symbol.into()),
            dtype: DataType::void(),
            args,
        }
    }

    #[must_use]
    pub fn binary(op: BinOp, a: Expr, b: Expr) -> Self {
        let dtype = a.dtype();
        Self::Binary {
            op,
            dtype,
            a: Box::new(a),
            b: Box::new(b),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DataType {
        match self {
            Self::Var(v) => v.dtype,
            Self::IntImm { dtype, .. }
            | Self::FloatImm { dtype, .. }
            | Self::Binary { dtype, .. }
            | Self::Cast { dtype, .. }
            | Self::Call { dtype, .. } => *dtype,
            Self::StringImm(_) => DataType::handle(),
            Self::Compare { .. } => DataType::bool(),
            Self::Ramp { base, lanes, .. } => base.dtype().with_lanes(*lanes),
            Self::BufferLoad { buffer, .. } => buffer.dtype,
            Self::Region(region) => region.buffer.dtype,
        }
    }

    /// If it is a `Region`, returns the region. Returns `None` otherwise.
    #[must_use]
    pub fn as_region(&self) -> Option<&Region> {
        match self {
            Self::Region(region) => Some(region),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Self::Var(v) => Some(v),
            _ => None,
        }
    }

    /// Integer immediate value, if this is one
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::IntImm { value, .. } => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::FloatImm { value, .. } => Some(*value),
            Self::IntImm { value, .. } => Some(*value as f64),
            _ => None,
        }
    }
}

/// Loop annotation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForKind {
    Serial,
    Unrolled,
}

/// IR statements
#[derive(Debug, Clone)]
pub enum Stmt {
    For {
        var: Var,
        min: Expr,
        extent: Expr,
        kind: ForKind,
        body: Box<Stmt>,
    },
    LetStmt {
        var: Var,
        value: Expr,
        body: Box<Stmt>,
    },
    /// On-chip tensor allocation. A leading third extent is an outer
    /// repetition count (double buffering).
    Allocate {
        var: Var,
        dtype: DataType,
        extents: Vec<i64>,
        body: Box<Stmt>,
    },
    DeclBuffer {
        buffer: Buffer,
        body: Box<Stmt>,
    },
    AttrStmt {
        key: String,
        value: Expr,
        body: Box<Stmt>,
    },
    IfThenElse {
        cond: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    Evaluate(Expr),
    Seq(Vec<Stmt>),
}

impl Stmt {
    /// An `Evaluate` over a `call_extern`
    #[must_use]
    pub fn call(symbol: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::Evaluate(Expr::call_extern(symbol, args))
    }

    #[must_use]
    pub fn seq(stmts: Vec<Stmt>) -> Self {
        Self::Seq(stmts)
    }
}

/// A lowered tensor-program function
#[derive(Debug, Clone)]
pub struct PrimFunc {
    /// Global symbol the kernel is emitted under
    pub name: String,
    pub params: Vec<Var>,
    pub buffer_map: HashMap<Var, Buffer>,
    pub body: Stmt,
    /// String-keyed integer attributes; the planner stores byte offsets here
    pub attrs: BTreeMap<String, i64>,
}

impl PrimFunc {
    #[must_use]
    pub fn new(name: impl Into<String>, buffers: Vec<Buffer>, body: Stmt) -> Self {
        let params: Vec<Var> = buffers.iter().map(|b| b.data.clone()).collect();
        let buffer_map = params
            .iter()
            .cloned()
            .zip(buffers)
            .collect();
        Self {
            name: name.into(),
            params,
            buffer_map,
            body,
            attrs: BTreeMap::new(),
        }
    }
}

/// An ordered collection of functions handed to a build entry point
#[derive(Debug, Clone, Default)]
pub struct IrModule {
    pub functions: Vec<PrimFunc>,
}

impl IrModule {
    #[must_use]
    pub fn single(func: PrimFunc) -> Self {
        Self {
            functions: vec![func],
        }
    }
}
