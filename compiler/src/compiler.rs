//! Compiler — resolved scope tree to register-machine bytecode.
//!
//! Every function literal in the program becomes one straight-line body
//! ending in `RET`. Bodies are laid out back to back, the program body
//! follows them, and a final marker instruction records where it starts:
//!
//! ```text
//!   0 ┌──────────────┐
//!     │ fn #n  ...   │   root function list, last entry first
//!     │ fn #0  ...   │
//! e   ├──────────────┤
//!     │ program body │
//!     │ RET          │
//!     ├──────────────┤
//!     │ FN +0 @e     │   marker
//!     └──────────────┘
//! ```
//!
//! There is no call stack. A call names a frame offset inside the
//! caller's window and the callee's window starts there:
//!
//! ```text
//!   caller  [output][input][locals][scratch ...]
//!                                   └ frame ┐
//!   callee                                  [output][input][locals]...
//! ```
//!
//! Scratch registers sit above the scope's window and are handed out by a
//! watermark that is reset after every expression, so a call frame
//! allocated last never overlaps a live temporary.

use crate::ast::{Expr, ExprKind, Lambda, Operator};
use crate::bytecode::{Bank, Instruction, Op, Program, Reg, Symbol};
use crate::errors::{CompileError, SemanticError};
use crate::scope::{ScopeId, ScopeTree, Var};
use crate::token::Span;
use crate::types::{Arrow, Typ};
use tracing::{debug, trace};

/// Functions callable by name without being declared.
pub const BUILTINS: [&str; 1] = ["print"];

/// Size of the buffer `print` formats its argument into.
const PRINT_BUFFER: usize = 24;

// ── Public API ──────────────────────────────────────────────────────

/// Lay out every function and the program body.
#[tracing::instrument(name = "compile", skip_all)]
pub fn compile(tree: &ScopeTree) -> Result<Program, CompileError> {
    let mut code = Vec::new();
    let mut fixups = Vec::new();
    let mut symbols = Vec::new();

    for func in tree.funcs().iter().rev() {
        let address = address(code.len())?;
        let body = Emitter::new(tree, func.scope).emit()?;
        debug!(id = func.id, name = %func.name, address, len = body.code.len(), "emitted function");
        fixups.extend(body.fixups.into_iter().map(|(at, id)| (at + code.len(), id)));
        code.extend(body.code);
        symbols.push(Symbol {
            id: func.id,
            name: func.name.clone(),
            address,
        });
    }

    let entry = address(code.len())?;
    let body = Emitter::new(tree, ScopeId::ROOT).emit()?;
    fixups.extend(body.fixups.into_iter().map(|(at, id)| (at + code.len(), id)));
    code.extend(body.code);

    if code.len() >= usize::from(u16::MAX) {
        return Err(CompileError::InstructionOverflow { count: code.len() });
    }

    for (at, id) in fixups {
        let symbol = symbols
            .iter()
            .find(|s| s.id == id)
            .ok_or(SemanticError::UnknownFunction {
                id,
                span: Span::default(),
            })?;
        trace!(at, id, address = symbol.address, "patched function address");
        code[at].yz = symbol.address;
    }

    code.push(Instruction::wide(Op::Call, 0, entry));
    debug!(instructions = code.len(), entry, "program laid out");
    Ok(Program {
        instructions: code,
        symbols,
    })
}

fn address(len: usize) -> Result<u16, CompileError> {
    u16::try_from(len).map_err(|_| CompileError::InstructionOverflow { count: len })
}

// ── Per-scope emission ──────────────────────────────────────────────

struct Body {
    code: Vec<Instruction>,
    /// `(instruction index, function id)` pairs whose `yz` needs the
    /// function's final address.
    fixups: Vec<(usize, usize)>,
}

struct Emitter<'t> {
    tree: &'t ScopeTree,
    scope: ScopeId,
    code: Vec<Instruction>,
    fixups: Vec<(usize, usize)>,
    /// First free scratch register.
    scratch: usize,
}

impl<'t> Emitter<'t> {
    fn new(tree: &'t ScopeTree, scope: ScopeId) -> Self {
        Self {
            tree,
            scope,
            code: Vec::new(),
            fixups: Vec::new(),
            scratch: tree[scope].size(),
        }
    }

    fn emit(mut self) -> Result<Body, CompileError> {
        let tree = self.tree;
        let scope = &tree[self.scope];
        let output = &scope.arrow.output;
        let count = scope.exprs.len();

        for (i, expr) in scope.exprs.iter().enumerate() {
            let last = i + 1 == count;
            match &expr.kind {
                ExprKind::TypeDecl { .. } => {}
                ExprKind::VarDecl { name, value, .. } => {
                    let var = self.var(name, expr.span)?;
                    self.eval(var.register()?, value, &var.ty)?;
                }
                ExprKind::Binary {
                    op: Operator::Assign,
                    lhs,
                    rhs,
                } => self.assign(lhs, rhs)?,
                _ if last && !is_void(output) => self.eval(Reg::local(0)?, expr, output)?,
                _ => self.discard(expr)?,
            }
        }

        self.push(Instruction::wide(Op::Ret, 0, 0));
        Ok(Body {
            code: self.code,
            fixups: self.fixups,
        })
    }

    // ── Emission helpers ────────────────────────────────────────────

    fn push(&mut self, inst: Instruction) {
        self.code.push(inst);
    }

    fn triple(&mut self, op: Op, x: Reg, y: Reg, z: Reg) {
        self.push(Instruction::triple(op, x, y, z));
    }

    fn mov(&mut self, dst: Reg, src: Reg) -> Result<(), CompileError> {
        self.triple(Op::Move, dst, src, Reg::local(0)?);
        Ok(())
    }

    /// Reserve `size` scratch registers and return the first offset.
    fn alloc(&mut self, size: usize) -> Result<usize, CompileError> {
        let at = self.scratch;
        self.scratch += size;
        if self.scratch > Reg::WINDOW {
            return Err(CompileError::RegisterOverflow {
                offset: self.scratch,
            });
        }
        Ok(at)
    }

    fn temp(&mut self) -> Result<Reg, CompileError> {
        Reg::local(self.alloc(1)?)
    }

    fn load_int(&mut self, dst: Reg, value: i32) {
        let bits = value as u32;
        self.push(Instruction::wide(Op::LoadLow, dst.raw(), bits as u16));
        if bits >> 16 != 0 {
            self.push(Instruction::wide(Op::LoadHigh, dst.raw(), (bits >> 16) as u16));
        }
    }

    fn constant(&mut self, value: i32) -> Result<Reg, CompileError> {
        let reg = self.temp()?;
        self.load_int(reg, value);
        Ok(reg)
    }

    fn var(&self, name: &str, span: Span) -> Result<&'t Var, CompileError> {
        let tree = self.tree;
        tree[self.scope].local(name).ok_or_else(|| {
            SemanticError::UnknownIdentifier {
                name: name.to_string(),
                span,
            }
            .into()
        })
    }

    // ── Statements ──────────────────────────────────────────────────

    fn assign(&mut self, lhs: &Expr, rhs: &Expr) -> Result<(), CompileError> {
        let Some(name) = lhs.as_id() else {
            return Err(unsupported("assignment to a non-identifier", lhs.span));
        };
        let var = self.var(name, lhs.span)?;
        self.eval(var.register()?, rhs, &var.ty)
    }

    fn discard(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let mark = self.scratch;
        let result = self
            .temp()
            .and_then(|reg| self.eval(reg, expr, &Typ::Void));
        self.scratch = mark;
        result
    }

    // ── Expressions ─────────────────────────────────────────────────

    /// Evaluate `expr` into the registers starting at `dst`, shaped as
    /// `ty`. A void `ty` means the value is not needed.
    fn eval(&mut self, dst: Reg, expr: &Expr, ty: &Typ) -> Result<(), CompileError> {
        let mark = self.scratch;
        let result = self.lower(dst, expr, ty);
        self.scratch = mark;
        result
    }

    fn lower(&mut self, dst: Reg, expr: &Expr, ty: &Typ) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Int(n) => {
                self.load_int(dst, *n);
                Ok(())
            }
            ExprKind::Uint(n) => {
                self.load_int(dst, *n as i32);
                Ok(())
            }
            ExprKind::Float(_) => Err(unsupported("float literal", expr.span)),
            ExprKind::Str(s) => self.string(dst, s, ty, expr.span),
            ExprKind::Id(name) => {
                let var = self.var(name, expr.span)?;
                self.copy(dst, var.register()?, &var.ty, ty)
            }
            ExprKind::Tuple(fields) => {
                if fields.len() == 1 && fields[0].label.is_none() {
                    return self.lower(dst, &fields[0].value, ty);
                }
                self.tuple(dst, expr, ty)
            }
            ExprKind::TypeDecl { .. } => Ok(()),
            ExprKind::VarDecl { .. } => Err(unsupported("nested declaration", expr.span)),
            ExprKind::Function(lambda) => self.closure(dst, lambda, expr.span),
            ExprKind::Unary { op, operand } => match op {
                Operator::Neg => {
                    if let Some(value) = self.fold(expr)? {
                        self.load_int(dst, value);
                        return Ok(());
                    }
                    let zero = self.constant(0)?;
                    let value = self.operand(operand)?;
                    self.triple(Op::Sub, dst, zero, value);
                    Ok(())
                }
                Operator::Not => {
                    let value = self.truth(operand)?;
                    self.invert(dst, value);
                    Ok(())
                }
                op => Err(unsupported(&format!("prefix '{}'", op), expr.span)),
            },
            ExprKind::Binary { op, lhs, rhs } => match op {
                Operator::Call | Operator::RCall => self.call(dst, lhs, rhs, ty, expr.span),
                Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Mod => {
                    self.arithmetic(dst, *op, expr, lhs, rhs)
                }
                op if op.is_comparison() => self.compare(dst, *op, lhs, rhs),
                Operator::And | Operator::Or => self.logic(dst, *op, lhs, rhs),
                Operator::Ctrl => self.control(dst, lhs, rhs, ty, expr.span),
                Operator::Dot | Operator::Index => {
                    let (src, src_ty) = self.place(expr)?;
                    self.copy(dst, src, &src_ty, ty)
                }
                Operator::Assign => {
                    self.assign(lhs, rhs)?;
                    if is_void(ty) {
                        return Ok(());
                    }
                    let var = self.var(lhs.as_id().unwrap_or_default(), lhs.span)?;
                    self.copy(dst, var.register()?, &var.ty, ty)
                }
                Operator::Comp => {
                    Err(SemanticError::UnresolvedComposition { span: expr.span }.into())
                }
                op => Err(unsupported(&format!("operator '{}'", op), expr.span)),
            },
        }
    }

    /// Register-by-register copy, limited by the smaller of both shapes.
    fn copy(&mut self, dst: Reg, src: Reg, src_ty: &Typ, ty: &Typ) -> Result<(), CompileError> {
        if is_void(ty) {
            return Ok(());
        }
        for i in 0..src_ty.size().min(ty.size()) {
            self.mov(dst.at(i)?, src.at(i)?)?;
        }
        Ok(())
    }

    // ── Literals ────────────────────────────────────────────────────

    /// ASCII packed four bytes per register, little end first, with a
    /// terminating NUL.
    fn string(&mut self, dst: Reg, s: &str, ty: &Typ, span: Span) -> Result<(), CompileError> {
        let mut bytes: Vec<u8> = s.bytes().filter(u8::is_ascii).collect();
        bytes.push(0);

        if matches!(ty.resolved(), Typ::Char) && bytes.len() == 2 {
            self.push(Instruction::wide(Op::LoadLow, dst.raw(), u16::from(bytes[0])));
            return Ok(());
        }

        let capacity = match ty.resolved() {
            Typ::Array(elem, count) if matches!(elem.resolved(), Typ::Char) => *count,
            _ => 0,
        };
        if bytes.len() >= capacity {
            return Err(CompileError::LiteralTooLarge {
                length: bytes.len() - 1,
                capacity,
                span,
            });
        }

        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.load_int(dst.at(i)?, i32::from_le_bytes(word));
        }
        Ok(())
    }

    fn tuple(&mut self, dst: Reg, expr: &Expr, ty: &Typ) -> Result<(), CompileError> {
        let ExprKind::Tuple(fields) = &expr.kind else {
            return Err(unsupported("tuple", expr.span));
        };
        let mismatch = || -> CompileError {
            SemanticError::TypeMismatch {
                expected: ty.to_string(),
                found: format!("a tuple of {} fields", fields.len()),
                span: expr.span,
            }
            .into()
        };

        match ty.resolved() {
            Typ::Void if fields.is_empty() => Ok(()),
            Typ::Tuple(types) if types.len() == fields.len() => {
                let mut offset = 0;
                for (field, field_ty) in fields.iter().zip(types) {
                    self.eval(dst.at(offset)?, &field.value, &field_ty.ty)?;
                    offset += field_ty.ty.size();
                }
                Ok(())
            }
            Typ::Array(elem, count)
                if *count == fields.len() && !matches!(elem.resolved(), Typ::Char | Typ::Bool) =>
            {
                for (i, field) in fields.iter().enumerate() {
                    self.eval(dst.at(i * elem.size())?, &field.value, elem)?;
                }
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }

    /// A function value: the bare address, or a fresh closure holding a
    /// copy of every captured register.
    fn closure(&mut self, dst: Reg, lambda: &Lambda, span: Span) -> Result<(), CompileError> {
        let tree = self.tree;
        if tree.func(lambda.id).is_none() {
            return Err(SemanticError::UnknownFunction { id: lambda.id, span }.into());
        }
        let captured = &tree[lambda.scope].closure;

        self.fixups.push((self.code.len(), lambda.id));
        if captured.is_empty() {
            self.push(Instruction::wide(Op::LoadLow, dst.raw(), 0));
            return Ok(());
        }

        self.push(Instruction::wide(Op::ClosureMake, dst.raw(), 0));
        for capture in captured {
            let origin = self.var(&capture.name, span)?.register()?;
            let slot = Reg::new(Bank::Aux, capture.offset)?;
            for i in 0..capture.ty.size() {
                self.mov(slot.at(i)?, origin.at(i)?)?;
            }
            trace!(id = lambda.id, name = %capture.name, %origin, %slot, "captured");
        }
        Ok(())
    }

    // ── Calls ───────────────────────────────────────────────────────

    fn call(
        &mut self,
        dst: Reg,
        callee: &Expr,
        arg: &Expr,
        ty: &Typ,
        span: Span,
    ) -> Result<(), CompileError> {
        let tree = self.tree;
        let callee = callee.unwrapped();
        if let Some(name) = callee.as_id() {
            if let Some(var) = tree[self.scope].local(name) {
                let arrow = var.ty.arrow().cloned().ok_or_else(|| SemanticError::TypeMismatch {
                    expected: "a function".to_string(),
                    found: var.ty.to_string(),
                    span: callee.span,
                })?;
                return self.invoke(dst, var.register()?, &arrow, Some(arg), ty, span);
            }
            if BUILTINS.contains(&name) {
                return self.builtin(name, arg, span);
            }
            return Err(SemanticError::UnknownIdentifier {
                name: name.to_string(),
                span: callee.span,
            }
            .into());
        }

        let arrow = tree.arrow_of(self.scope, callee)?;
        let function = self.temp()?;
        self.eval(function, callee, &Typ::Function(Box::new(arrow.clone())))?;
        self.invoke(dst, function, &arrow, Some(arg), ty, span)
    }

    /// Call the function word in `function` with a frame placed at the
    /// scratch watermark, then copy its output to `dst`.
    fn invoke(
        &mut self,
        dst: Reg,
        function: Reg,
        arrow: &Arrow,
        arg: Option<&Expr>,
        ty: &Typ,
        span: Span,
    ) -> Result<(), CompileError> {
        if !is_void(ty) && !arrow.output.matches(ty) {
            return Err(SemanticError::TypeMismatch {
                expected: ty.to_string(),
                found: arrow.output.to_string(),
                span,
            }
            .into());
        }

        let frame = self.alloc(arrow.output.size())?;
        let input = self.alloc(arrow.input.size())?;
        if let Some(arg) = arg {
            self.eval(Reg::local(input)?, arg, &arrow.input)?;
        }
        self.push(Instruction::wide(Op::CallRx, frame as u8, u16::from(function.raw())));
        self.copy(dst, Reg::local(frame)?, &arrow.output, ty)
    }

    fn builtin(&mut self, name: &str, arg: &Expr, span: Span) -> Result<(), CompileError> {
        match name {
            "print" => {
                let text = Typ::Array(Box::new(Typ::Char), PRINT_BUFFER);
                let buffer = Reg::local(self.alloc(text.size())?)?;
                self.eval(buffer, arg, &text)?;
                self.push(Instruction::wide(Op::Print, buffer.raw(), 0));
                Ok(())
            }
            _ => Err(SemanticError::UnknownIdentifier {
                name: name.to_string(),
                span,
            }
            .into()),
        }
    }

    // ── Arithmetic ──────────────────────────────────────────────────

    /// Integer value of a literal-only expression.
    fn fold(&self, expr: &Expr) -> Result<Option<i32>, CompileError> {
        let expr = expr.unwrapped();
        match &expr.kind {
            ExprKind::Int(n) => Ok(Some(*n)),
            ExprKind::Uint(n) => Ok(Some(*n as i32)),
            ExprKind::Unary {
                op: Operator::Neg,
                operand,
            } => Ok(self.fold(operand)?.map(i32::wrapping_neg)),
            ExprKind::Binary { op, lhs, rhs } if op.is_arithmetic() => {
                let (Some(l), Some(r)) = (self.fold(lhs)?, self.fold(rhs)?) else {
                    return Ok(None);
                };
                if r == 0 && matches!(op, Operator::Div | Operator::Mod) {
                    return Err(CompileError::DivisionByZero { span: expr.span });
                }
                Ok(Some(match op {
                    Operator::Add => l.wrapping_add(r),
                    Operator::Sub => l.wrapping_sub(r),
                    Operator::Mul => l.wrapping_mul(r),
                    Operator::Div => l.wrapping_div(r),
                    _ => l.wrapping_rem(r),
                }))
            }
            _ => Ok(None),
        }
    }

    fn arithmetic(
        &mut self,
        dst: Reg,
        op: Operator,
        expr: &Expr,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        if let Some(value) = self.fold(expr)? {
            self.load_int(dst, value);
            return Ok(());
        }
        let opcode = match op {
            Operator::Add => Op::Add,
            Operator::Sub => Op::Sub,
            Operator::Mul => Op::Mul,
            Operator::Div => Op::Div,
            _ => Op::Mod,
        };
        let (lhs, rhs) = (lhs.unwrapped(), rhs.unwrapped());

        if let (Some(l), Some(r)) = (lhs.as_id(), rhs.as_id()) {
            let (l, r) = (self.var(l, lhs.span)?, self.var(r, rhs.span)?);
            if l.ty.normalized() != r.ty.normalized() {
                return Err(SemanticError::TypeMismatch {
                    expected: l.ty.to_string(),
                    found: r.ty.to_string(),
                    span: rhs.span,
                }
                .into());
            }
            self.integral(l, lhs.span)?;
            self.triple(opcode, dst, l.register()?, r.register()?);
            return Ok(());
        }

        // A compound operand may be built in `dst` unless the other
        // operand still has to read it.
        let a = if self.is_leaf(lhs)? || self.mentions(rhs, dst) {
            self.operand(lhs)?
        } else {
            self.eval(dst, lhs, &Typ::Int)?;
            dst
        };
        let b = if self.is_leaf(rhs)? || a == dst || self.mentions(rhs, dst) {
            self.operand(rhs)?
        } else {
            self.eval(dst, rhs, &Typ::Int)?;
            dst
        };
        self.triple(opcode, dst, a, b);
        Ok(())
    }

    fn is_leaf(&self, expr: &Expr) -> Result<bool, CompileError> {
        Ok(expr.unwrapped().as_id().is_some() || self.fold(expr)?.is_some())
    }

    /// Whether evaluating `expr` reads the variable held in `reg`.
    fn mentions(&self, expr: &Expr, reg: Reg) -> bool {
        match &expr.kind {
            ExprKind::Id(name) => self
                .tree[self.scope]
                .local(name)
                .and_then(|v| v.register().ok())
                .is_some_and(|r| r == reg),
            ExprKind::Tuple(fields) => fields.iter().any(|f| self.mentions(&f.value, reg)),
            ExprKind::Binary { lhs, rhs, .. } => self.mentions(lhs, reg) || self.mentions(rhs, reg),
            ExprKind::Unary { operand, .. } => self.mentions(operand, reg),
            _ => false,
        }
    }

    fn integral(&self, var: &Var, span: Span) -> Result<(), CompileError> {
        match var.ty.resolved() {
            Typ::Float => Err(unsupported("float arithmetic", span)),
            ty if ty.is_integral() => Ok(()),
            ty => Err(SemanticError::TypeMismatch {
                expected: "int".to_string(),
                found: ty.to_string(),
                span,
            }
            .into()),
        }
    }

    /// A register holding the single-word value of `expr`: the variable
    /// itself for identifiers, otherwise a scratch register.
    fn operand(&mut self, expr: &Expr) -> Result<Reg, CompileError> {
        let expr = expr.unwrapped();
        if let Some(name) = expr.as_id() {
            let var = self.var(name, expr.span)?;
            self.integral(var, expr.span)?;
            return var.register();
        }
        if let Some(value) = self.fold(expr)? {
            return self.constant(value);
        }
        if let ExprKind::Float(_) = expr.kind {
            return Err(unsupported("float arithmetic", expr.span));
        }
        let reg = self.temp()?;
        self.eval(reg, expr, &Typ::Int)?;
        Ok(reg)
    }

    // ── Comparisons and logic ───────────────────────────────────────
    //
    // Results are 0 or 1 for every pair of i32 operands. With d = a - b,
    // the sign of `d ^ ((a ^ b) & (d ^ a))` is the sign `a - b` would have
    // without wrapping, so shifting it right by 31 gives -1 when a < b and
    // 0 otherwise. A value is non-zero exactly when `v | -v` has its sign
    // bit set. Squaring a 0/-1 mask gives 0/1, and negation is ~x + 2.

    /// `dst` must not sit above the watermark.
    fn xor(&mut self, dst: Reg, a: Reg, b: Reg) -> Result<(), CompileError> {
        let mark = self.scratch;
        let (t, u, v) = (self.temp()?, self.temp()?, self.temp()?);
        self.triple(Op::Nand, t, a, b);
        self.triple(Op::Nand, u, a, t);
        self.triple(Op::Nand, v, b, t);
        self.triple(Op::Nand, dst, u, v);
        self.scratch = mark;
        Ok(())
    }

    /// 1 when `a < b`, else 0.
    fn less(&mut self, dst: Reg, a: Reg, b: Reg) -> Result<(), CompileError> {
        let (d, x, y) = (self.temp()?, self.temp()?, self.temp()?);
        self.triple(Op::Sub, d, a, b);
        self.xor(x, a, b)?;
        self.xor(y, d, a)?;
        self.triple(Op::Nand, x, x, y);
        self.triple(Op::Nand, x, x, x);
        self.xor(y, d, x)?;
        let shift = self.constant(31)?;
        self.triple(Op::Shr, y, y, shift);
        self.triple(Op::Mul, dst, y, y);
        Ok(())
    }

    /// 1 when `value` is non-zero, else 0.
    fn nonzero(&mut self, dst: Reg, value: Reg) -> Result<(), CompileError> {
        let zero = self.constant(0)?;
        let (neg, not) = (self.temp()?, self.temp()?);
        self.triple(Op::Sub, neg, zero, value);
        self.triple(Op::Nand, neg, neg, neg);
        self.triple(Op::Nand, not, value, value);
        self.triple(Op::Nand, dst, not, neg);
        let shift = self.constant(31)?;
        self.triple(Op::Shr, dst, dst, shift);
        self.triple(Op::Mul, dst, dst, dst);
        Ok(())
    }

    fn invert(&mut self, dst: Reg, value: Reg) {
        self.triple(Op::Nand, dst, value, value);
        self.push(Instruction::wide(Op::Inc, dst.raw(), 2));
    }

    fn compare(
        &mut self,
        dst: Reg,
        op: Operator,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        let a = self.operand(lhs)?;
        let b = self.operand(rhs)?;
        match op {
            Operator::Lt | Operator::Gte => self.less(dst, a, b)?,
            Operator::Gt | Operator::Lte => self.less(dst, b, a)?,
            _ => {
                let d = self.temp()?;
                self.triple(Op::Sub, d, a, b);
                self.nonzero(dst, d)?;
            }
        }
        if matches!(op, Operator::Gte | Operator::Lte | Operator::Eq) {
            self.invert(dst, dst);
        }
        Ok(())
    }

    /// `expr` reduced to 0 or 1 in a register.
    fn truth(&mut self, expr: &Expr) -> Result<Reg, CompileError> {
        let expr = expr.unwrapped();
        let boolean = match &expr.kind {
            ExprKind::Binary { op, .. } => {
                op.is_comparison() || matches!(op, Operator::And | Operator::Or)
            }
            ExprKind::Unary { op, .. } => *op == Operator::Not,
            _ => false,
        };
        if boolean {
            return self.operand(expr);
        }
        if let Some(value) = self.fold(expr)? {
            return self.constant(i32::from(value != 0));
        }
        let value = self.operand(expr)?;
        let t = self.temp()?;
        self.nonzero(t, value)?;
        Ok(t)
    }

    fn logic(
        &mut self,
        dst: Reg,
        op: Operator,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        let a = self.truth(lhs)?;
        let b = self.truth(rhs)?;
        if op == Operator::And {
            self.triple(Op::Mul, dst, a, b);
            return Ok(());
        }
        let (na, nb) = (self.temp()?, self.temp()?);
        self.triple(Op::Nand, na, a, a);
        self.triple(Op::Nand, nb, b, b);
        self.triple(Op::Nand, dst, na, nb);
        Ok(())
    }

    /// `cond ? (then, else)`: both arms are thunks. The chosen word is
    /// `else + cond * (then - else)`, which is then called.
    fn control(
        &mut self,
        dst: Reg,
        cond: &Expr,
        branches: &Expr,
        ty: &Typ,
        span: Span,
    ) -> Result<(), CompileError> {
        let ExprKind::Tuple(fields) = &branches.kind else {
            return Err(SemanticError::InvalidControl { span: branches.span }.into());
        };
        let [then, otherwise] = fields.as_slice() else {
            return Err(SemanticError::InvalidControl { span: branches.span }.into());
        };
        let arrow = self.tree.arrow_of(self.scope, &then.value)?;
        let other = self.tree.arrow_of(self.scope, &otherwise.value)?;
        if !arrow.output.matches(&other.output) {
            return Err(SemanticError::TypeMismatch {
                expected: arrow.output.to_string(),
                found: other.output.to_string(),
                span: otherwise.value.span,
            }
            .into());
        }
        let thunk = Typ::Function(Box::new(arrow.clone()));

        if let Some(c) = self.fold(cond)? {
            let chosen = if c != 0 { &then.value } else { &otherwise.value };
            let word = self.temp()?;
            self.eval(word, chosen, &thunk)?;
            return self.invoke(dst, word, &arrow, None, ty, span);
        }

        let c = self.truth(cond)?;
        let t = self.temp()?;
        self.eval(t, &then.value, &thunk)?;
        let e = self.temp()?;
        self.eval(e, &otherwise.value, &thunk)?;
        self.triple(Op::Sub, t, t, e);
        self.triple(Op::Mul, t, t, c);
        self.triple(Op::Add, t, t, e);
        self.invoke(dst, t, &arrow, None, ty, span)
    }

    // ── Places ──────────────────────────────────────────────────────

    /// The registers a variable, a field of it or a constant element of
    /// it occupy.
    fn place(&self, expr: &Expr) -> Result<(Reg, Typ), CompileError> {
        let expr = expr.unwrapped();
        match &expr.kind {
            ExprKind::Id(name) => {
                let var = self.var(name, expr.span)?;
                Ok((var.register()?, var.ty.clone()))
            }
            ExprKind::Binary {
                op: Operator::Dot,
                lhs,
                rhs,
            } => {
                let (base, ty) = self.place(lhs)?;
                let name = rhs.as_id().unwrap_or_default();
                let (offset, field) = ty.field(name).ok_or_else(|| {
                    SemanticError::UnknownIdentifier {
                        name: format!("{}.{}", lhs, name),
                        span: expr.span,
                    }
                })?;
                Ok((base.at(offset)?, field.clone()))
            }
            ExprKind::Binary {
                op: Operator::Index,
                lhs,
                rhs,
            } => {
                let (base, ty) = self.place(lhs)?;
                let (elem, count) = match ty.resolved() {
                    Typ::Array(elem, count)
                        if !matches!(elem.resolved(), Typ::Char | Typ::Bool) =>
                    {
                        (elem, *count)
                    }
                    Typ::Array(..) => return Err(unsupported("indexing a packed array", expr.span)),
                    other => {
                        return Err(SemanticError::TypeMismatch {
                            expected: "an array".to_string(),
                            found: other.to_string(),
                            span: lhs.span,
                        }
                        .into())
                    }
                };
                let index = self
                    .fold(rhs)?
                    .ok_or_else(|| unsupported("dynamic index", rhs.span))?;
                if index < 0 || index as usize >= count {
                    return Err(CompileError::IndexOutOfBounds {
                        index,
                        count,
                        span: rhs.span,
                    });
                }
                Ok((base.at(index as usize * elem.size())?, (**elem).clone()))
            }
            _ => Err(unsupported("access of a non-variable", expr.span)),
        }
    }
}

fn is_void(ty: &Typ) -> bool {
    matches!(ty.resolved(), Typ::Void)
}

fn unsupported(what: &str, span: Span) -> CompileError {
    CompileError::Unsupported {
        what: what.to_string(),
        span,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::{strip_comments, tokenize};
    use crate::parser::parse_program;
    use crate::resolver::precompile;

    fn try_compile(src: &str) -> Result<Program, CompileError> {
        let tokens = strip_comments(tokenize(src).expect("Lex failed"));
        let mut tree = parse_program(&tokens).expect("Parse failed");
        precompile(&mut tree)?;
        compile(&tree)
    }

    fn compile_source(src: &str) -> Program {
        try_compile(src).expect("Compile failed")
    }

    fn find_op(program: &Program, op: Op) -> bool {
        program.instructions.iter().any(|i| i.op == op)
    }

    fn count_op(program: &Program, op: Op) -> usize {
        program.instructions.iter().filter(|i| i.op == op).count()
    }

    #[test]
    fn test_empty_program() {
        let prog = compile_source("");
        assert_eq!(prog.instructions.len(), 2);
        assert_eq!(prog.instructions[0].op, Op::Ret);
        assert_eq!(prog.instructions[1], Instruction::wide(Op::Call, 0, 0));
    }

    #[test]
    fn test_small_literal_is_one_load() {
        let prog = compile_source("[ a: int = 7");
        assert_eq!(prog.instructions[0], Instruction::wide(Op::LoadLow, 0, 7));
        assert!(!find_op(&prog, Op::LoadHigh));
    }

    #[test]
    fn test_wide_and_negative_literals() {
        let prog = compile_source("[ a: int = 0x12345678");
        assert_eq!(prog.instructions[0], Instruction::wide(Op::LoadLow, 0, 0x5678));
        assert_eq!(prog.instructions[1], Instruction::wide(Op::LoadHigh, 0, 0x1234));

        let prog = compile_source("[ a: int = -1");
        assert_eq!(prog.instructions[0], Instruction::wide(Op::LoadLow, 0, 0xffff));
        assert_eq!(prog.instructions[1], Instruction::wide(Op::LoadHigh, 0, 0xffff));
    }

    #[test]
    fn test_constant_folding() {
        let prog = compile_source("[ a: int = (2 + 3) * 4 - 6 / 2");
        assert_eq!(prog.instructions[0], Instruction::wide(Op::LoadLow, 0, 17));
        assert!(!prog.instructions.iter().any(|i| i.op.is_arithmetic()));
    }

    #[test]
    fn test_constant_division_by_zero() {
        assert!(matches!(
            try_compile("[ a: int = 1 / 0"),
            Err(CompileError::DivisionByZero { .. })
        ));
        assert!(matches!(
            try_compile("[ a: int = 1 % (2 - 2)"),
            Err(CompileError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn test_identifier_plus_identifier_is_one_op() {
        let prog = compile_source("[ count: int = 100; [ inc: int = 10; count = count + inc");
        let add = Instruction::triple(
            Op::Add,
            Reg::local(0).unwrap(),
            Reg::local(0).unwrap(),
            Reg::local(1).unwrap(),
        );
        assert_eq!(prog.instructions[2], add);
        assert_eq!(count_op(&prog, Op::Add), 1);
    }

    #[test]
    fn test_identifier_plus_literal_uses_scratch() {
        let prog = compile_source("[ a: int = 1; a = a * 3");
        assert_eq!(prog.instructions[1], Instruction::wide(Op::LoadLow, 1, 3));
        let mul = Instruction::triple(
            Op::Mul,
            Reg::local(0).unwrap(),
            Reg::local(0).unwrap(),
            Reg::local(1).unwrap(),
        );
        assert_eq!(prog.instructions[2], mul);
    }

    #[test]
    fn test_mismatched_operand_types() {
        let src = ": point = (x: int, y: int); [ p: point = (x: 1, y: 2); [ a: int = 1; a = a + p";
        assert!(matches!(
            try_compile(src),
            Err(CompileError::Semantic(SemanticError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_string_packing() {
        let prog = compile_source(": string = char 32; [ s: string = \"Hello\"");
        let low = u16::from(b'H') | u16::from(b'e') << 8;
        let high = u16::from(b'l') | u16::from(b'l') << 8;
        assert_eq!(prog.instructions[0], Instruction::wide(Op::LoadLow, 0, low));
        assert_eq!(prog.instructions[1], Instruction::wide(Op::LoadHigh, 0, high));
        assert_eq!(prog.instructions[2], Instruction::wide(Op::LoadLow, 1, u16::from(b'o')));
    }

    #[test]
    fn test_single_char_literal() {
        let prog = compile_source("[ c: char = \"A\"");
        assert_eq!(prog.instructions[0], Instruction::wide(Op::LoadLow, 0, 65));
        assert_eq!(prog.instructions.len(), 3);
    }

    #[test]
    fn test_string_capacity() {
        assert_eq!(compile_source("[ s: char 4 = \"ab\"").instructions.len(), 3);
        assert!(matches!(
            try_compile("[ s: char 4 = \"abc\""),
            Err(CompileError::LiteralTooLarge {
                length: 3,
                capacity: 4,
                ..
            })
        ));
        assert!(matches!(
            try_compile("[ n: int = \"abc\""),
            Err(CompileError::LiteralTooLarge { capacity: 0, .. })
        ));
    }

    #[test]
    fn test_print_builtin() {
        let prog = compile_source("print # \"Hello, World!\"");
        assert!(find_op(&prog, Op::Print));
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            try_compile("nothing # 1"),
            Err(CompileError::Semantic(SemanticError::UnknownIdentifier { .. }))
        ));
    }

    #[test]
    fn test_function_layout() {
        let prog = compile_source("[ double: int > int = \\x > x * 2; [ result: int = 0; \
            result = double(21)");
        let entry = prog.entry().unwrap();
        assert_eq!(prog.symbols.len(), 1);
        assert_eq!(prog.symbols[0].name, "double");
        assert_eq!(prog.symbols[0].address, 0);
        let body = &prog.instructions[..usize::from(entry)];
        assert_eq!(body.last().map(|i| i.op), Some(Op::Ret));
        // Without captures the function value is its address.
        assert_eq!(prog.instructions[usize::from(entry)], Instruction::wide(Op::LoadLow, 0, 0));
        assert!(find_op(&prog, Op::CallRx));
        assert!(!find_op(&prog, Op::ClosureMake));
    }

    #[test]
    fn test_functions_laid_out_in_reverse() {
        let prog = compile_source("[ inc: int > int = \\x > x + 1; [ dec: int > int = \\x > x - 1");
        let names: Vec<_> = prog.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["dec", "inc"]);
        assert_eq!(prog.symbols[0].address, 0);
        assert!(prog.symbols[1].address > 0);
    }

    #[test]
    fn test_capture_emits_closure() {
        let src = "[ base: int = 10; [ add_to_base: int > int = \\x > base + x";
        let prog = compile_source(src);
        let entry = usize::from(prog.entry().unwrap());
        let main = &prog.instructions[entry..];
        assert_eq!(main[1].op, Op::ClosureMake);
        assert_eq!(main[1].x, 1);
        let copy = Instruction::triple(
            Op::Move,
            Reg::new(Bank::Aux, 0).unwrap(),
            Reg::local(0).unwrap(),
            Reg::local(0).unwrap(),
        );
        assert_eq!(main[2], copy);
    }

    #[test]
    fn test_call_output_must_match() {
        let src = "[ f: int > char = \\x > \"a\"; [ r: int = 0; r = f # 1";
        assert!(matches!(
            try_compile(src),
            Err(CompileError::Semantic(SemanticError::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_tuple_arity() {
        assert!(matches!(
            try_compile(": p = (x: int, y: int); [ a: p = (1, 2, 3)"),
            Err(CompileError::Semantic(SemanticError::TypeMismatch { .. }))
        ));
        assert!(try_compile(": numbers = int 3; [ a: numbers = (0, 1, 2)").is_ok());
    }

    #[test]
    fn test_comparison_lowering() {
        let prog = compile_source("[ a: int = 1; [ b: int = 2; [ c: bool = a < b");
        assert!(find_op(&prog, Op::Shr));
        assert!(find_op(&prog, Op::Sub));
        let prog = compile_source("[ a: int = 1; [ b: int = 2; [ c: bool = a == b");
        assert!(find_op(&prog, Op::Nand));
        assert!(find_op(&prog, Op::Inc));
    }

    #[test]
    fn test_constant_control_calls_one_branch() {
        let prog = compile_source("[ r: int = 1 ? (10, 20)");
        assert_eq!(count_op(&prog, Op::CallRx), 1);
        assert!(!find_op(&prog, Op::Mul));
    }

    #[test]
    fn test_field_and_index_access() {
        let src = ": point = (x: int, y: int); [ p: point = (x: 10, y: 20); [ y: int = p.y";
        let prog = compile_source(src);
        let copy = Instruction::triple(
            Op::Move,
            Reg::local(2).unwrap(),
            Reg::local(1).unwrap(),
            Reg::local(0).unwrap(),
        );
        assert!(prog.instructions.contains(&copy));

        assert!(matches!(
            try_compile(": numbers = int 3; [ a: numbers = (0, 1, 2); [ b: int = a[3]"),
            Err(CompileError::IndexOutOfBounds { index: 3, count: 3, .. })
        ));
        assert!(matches!(
            try_compile(": numbers = int 3; [ a: numbers = (0, 1, 2); [ i: int = 0; \
                [ b: int = a[i]"),
            Err(CompileError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_unsupported_forms() {
        assert!(matches!(
            try_compile("[ a: int = 1; [ b: int = *a"),
            Err(CompileError::Unsupported { .. })
        ));
        assert!(matches!(
            try_compile("[ a: float = 1.5"),
            Err(CompileError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_register_overflow() {
        let src = ": big = int 70; [ a: big = (0); [ b: int = 1";
        assert_eq!(
            try_compile(src),
            Err(CompileError::RegisterOverflow { offset: 70 })
        );
    }
}
