//! Recursive-descent parser.
//!
//! One token of lookahead (`current`), fed by a [`Lexer`]. Parsing never
//! aborts: on a missing/unexpected token the parser records a diagnostic in
//! its [`ErrorSink`] and does its best to keep going, mirroring the
//! lexer's own "always return a token" contract.

use crate::ast::*;
use crate::precedence::{infix_precedence, is_assign_op, next_level, Precedence};
use kbc_common::source::{InternedStr, SrcLoc};
use kbc_common::{ErrorSink, Source};
use kbc_lexer::{Lexer, Token, TokenKind, TokenPayload};

/// Per-function parse state: the node arena being built and any nested
/// function literals discovered while parsing its body.
struct FnCtx {
    name: Option<InternedStr>,
    params: Vec<InternedStr>,
    has_varargs: bool,
    is_method: bool,
    sloc: SrcLoc,
    nodes: Vec<Node>,
    functions: Vec<Function>,
}

impl FnCtx {
    fn new(name: Option<InternedStr>, is_method: bool, sloc: SrcLoc) -> Self {
        Self {
            name,
            params: Vec::new(),
            has_varargs: false,
            is_method,
            sloc,
            nodes: Vec::new(),
            functions: Vec::new(),
        }
    }

    fn push(&mut self, kind: NodeKind, sloc: SrcLoc) -> NodeId {
        self.nodes.push(Node { kind, sloc });
        (self.nodes.len() - 1) as u32
    }
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    errors: ErrorSink,
    current: Token,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a mut Source) -> Self {
        let mut lexer = Lexer::new(source);
        let mut errors = ErrorSink::new();
        let current = lexer.next_token(&mut errors);
        Self { lexer, errors, current }
    }

    /// Parse an entire source file as the implicit top-level function
    ///. Consumes the parser; returns the program plus every
    /// diagnostic recorded by the lexer and parser together.
    pub fn parse_program(mut self) -> (Program, ErrorSink) {
        let sloc = self.current.sloc;
        let mut ctx = FnCtx::new(None, false, sloc);
        let body = self.parse_block(&mut ctx, &[TokenKind::Eof]);
        self.expect(TokenKind::Eof, "end of file");
        let main = self.finish_function(ctx, body);
        (Program { main }, self.errors)
    }

    // ---- token plumbing ----

    fn bump(&mut self) -> Token {
        let tok = self.current;
        self.current = self.lexer.next_token(&mut self.errors);
        tok
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Token {
        if self.check(kind) {
            self.bump()
        } else {
            self.errors.error(format!("expected {what}"), self.current.sloc);
            Token::new(kind, self.current.sloc)
        }
    }

    fn ident_text(&mut self, tok: Token) -> InternedStr {
        match tok.payload {
            TokenPayload::View { start, end } => {
                let text = self.lexer.text(start, end).to_string();
                self.lexer.intern(&text)
            }
            TokenPayload::Interned(id) => id,
            _ => self.lexer.intern("<error>"),
        }
    }

    fn expect_ident(&mut self) -> InternedStr {
        if self.check(TokenKind::Identifier) {
            let tok = self.bump();
            self.ident_text(tok)
        } else {
            self.errors.error("expected identifier", self.current.sloc);
            self.lexer.intern("<error>")
        }
    }

    fn finish_function(&mut self, ctx: FnCtx, body: NodeId) -> Function {
        let node_count = ctx.nodes.len();
        Function {
            name: ctx.name,
            params: ctx.params,
            param_locals: Vec::new(),
            has_varargs: ctx.has_varargs,
            is_method: ctx.is_method,
            sloc: ctx.sloc,
            nodes: ctx.nodes,
            body,
            functions: ctx.functions,
            locals: Vec::new(),
            outenvs: Vec::new(),
            max_upstack_size: 0,
            close_index: vec![0; node_count],
        }
    }

    /// Parse `(params) block end` for a nested function and push the
    /// finished `Function` onto `parent.functions`, returning its index.
    fn parse_function_rest(
        &mut self,
        name: Option<InternedStr>,
        is_method: bool,
        sloc: SrcLoc,
        parent: &mut FnCtx,
    ) -> FunctionId {
        let mut child = FnCtx::new(name, is_method, sloc);
        self.expect(TokenKind::LParen, "'('");
        if !self.check(TokenKind::RParen) {
            loop {
                if self.eat(TokenKind::Ellipsis) {
                    child.has_varargs = true;
                    break;
                }
                let p = self.expect_ident();
                child.params.push(p);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'");
        let body = self.parse_block(&mut child, &[TokenKind::End]);
        self.expect(TokenKind::End, "'end'");
        let function = self.finish_function(child, body);
        parent.functions.push(function);
        (parent.functions.len() - 1) as u32
    }

    // ---- statements ----

    fn parse_block(&mut self, ctx: &mut FnCtx, terminators: &[TokenKind]) -> NodeId {
        let sloc = self.current.sloc;
        let mut stmts = Vec::new();
        while !terminators.contains(&self.current.kind) && !self.check(TokenKind::Eof) {
            let before = self.current.sloc;
            if let Some(s) = self.parse_statement(ctx) {
                stmts.push(s);
            }
            // Guard against an unconsumed token causing an infinite loop on
            // malformed input: force progress past whatever was rejected.
            if self.current.sloc == before && !terminators.contains(&self.current.kind) && !self.check(TokenKind::Eof) {
                self.bump();
            }
        }
        ctx.push(NodeKind::Block(stmts), sloc)
    }

    fn parse_statement(&mut self, ctx: &mut FnCtx) -> Option<NodeId> {
        match self.current.kind {
            TokenKind::Semicolon => {
                self.bump();
                None
            }
            TokenKind::Var => self.parse_var_decl(ctx),
            TokenKind::If => self.parse_if(ctx),
            TokenKind::For => self.parse_for(ctx),
            TokenKind::While => self.parse_while(ctx),
            TokenKind::Repeat => self.parse_repeat(ctx),
            TokenKind::Break => {
                let sloc = self.bump().sloc;
                self.eat(TokenKind::Semicolon);
                Some(ctx.push(NodeKind::Break, sloc))
            }
            TokenKind::Continue => {
                let sloc = self.bump().sloc;
                self.eat(TokenKind::Semicolon);
                Some(ctx.push(NodeKind::Continue, sloc))
            }
            TokenKind::Return => self.parse_return(ctx),
            TokenKind::Throw => {
                let sloc = self.bump().sloc;
                let e = self.parse_expr(ctx);
                self.eat(TokenKind::Semicolon);
                Some(ctx.push(NodeKind::Throw(e), sloc))
            }
            TokenKind::Def => self.parse_function_decl(ctx),
            TokenKind::Error => {
                self.bump();
                None
            }
            _ => self.parse_expr_stmt(ctx),
        }
    }

    fn parse_var_decl(&mut self, ctx: &mut FnCtx) -> Option<NodeId> {
        let sloc = self.bump().sloc; // 'var'
        let mut names = vec![self.expect_ident()];
        while self.eat(TokenKind::Comma) {
            names.push(self.expect_ident());
        }
        let init = if self.eat(TokenKind::Assign) { Some(self.parse_expr(ctx)) } else { None };
        self.eat(TokenKind::Semicolon);
        let locals = vec![UNRESOLVED_LOCAL; names.len()];
        Some(ctx.push(NodeKind::VarDecl { names, locals, init }, sloc))
    }

    fn parse_if(&mut self, ctx: &mut FnCtx) -> Option<NodeId> {
        let sloc = self.bump().sloc; // 'if'
        let node = self.parse_if_rest(ctx, sloc);
        self.expect(TokenKind::End, "'end'");
        Some(node)
    }

    /// Parses one `if`/`elif` arm's condition and body, then recurses for
    /// the `else_block` on a chained `elif`. Only the outermost call
    /// consumes the final `end` (see `parse_if`), so an `elif` chain
    /// becomes nested `If` nodes without each link eating the terminator.
    fn parse_if_rest(&mut self, ctx: &mut FnCtx, sloc: SrcLoc) -> NodeId {
        let cond = self.parse_expr(ctx);
        let then_block = self.parse_block(ctx, &[TokenKind::Elif, TokenKind::Else, TokenKind::End]);
        let else_block = if self.check(TokenKind::Elif) {
            let elif_sloc = self.bump().sloc;
            Some(self.parse_if_rest(ctx, elif_sloc))
        } else if self.eat(TokenKind::Else) {
            Some(self.parse_block(ctx, &[TokenKind::End]))
        } else {
            None
        };
        ctx.push(NodeKind::If { cond, then_block, else_block }, sloc)
    }

    fn parse_for(&mut self, ctx: &mut FnCtx) -> Option<NodeId> {
        let sloc = self.bump().sloc; // 'for'
        let name = self.expect_ident();
        if self.eat(TokenKind::Assign) {
            let start = self.parse_expr(ctx);
            self.expect(TokenKind::Colon, "':'");
            let stop = self.parse_expr(ctx);
            let step = if self.eat(TokenKind::Colon) { Some(self.parse_expr(ctx)) } else { None };
            let body = self.parse_block(ctx, &[TokenKind::End]);
            self.expect(TokenKind::End, "'end'");
            Some(ctx.push(
                NodeKind::ForRange { var: name, local: UNRESOLVED_LOCAL, start, stop, step, body },
                sloc,
            ))
        } else {
            self.expect(TokenKind::Colon, "':'");
            let iterable = self.parse_expr(ctx);
            let body = self.parse_block(ctx, &[TokenKind::End]);
            self.expect(TokenKind::End, "'end'");
            Some(ctx.push(NodeKind::ForEach { var: name, local: UNRESOLVED_LOCAL, iterable, body }, sloc))
        }
    }

    fn parse_while(&mut self, ctx: &mut FnCtx) -> Option<NodeId> {
        let sloc = self.bump().sloc; // 'while'
        let cond = self.parse_expr(ctx);
        let body = self.parse_block(ctx, &[TokenKind::End]);
        self.expect(TokenKind::End, "'end'");
        Some(ctx.push(NodeKind::While { cond, body }, sloc))
    }

    fn parse_repeat(&mut self, ctx: &mut FnCtx) -> Option<NodeId> {
        let sloc = self.bump().sloc; // 'repeat'
        let body = self.parse_block(ctx, &[TokenKind::Until]);
        self.expect(TokenKind::Until, "'until'");
        let until = self.parse_expr(ctx);
        self.eat(TokenKind::Semicolon);
        Some(ctx.push(NodeKind::Repeat { body, until }, sloc))
    }

    fn parse_return(&mut self, ctx: &mut FnCtx) -> Option<NodeId> {
        let sloc = self.bump().sloc; // 'return'
        let mut values = Vec::new();
        if !matches!(
            self.current.kind,
            TokenKind::Semicolon
                | TokenKind::End
                | TokenKind::Eof
                | TokenKind::Elif
                | TokenKind::Else
                | TokenKind::Until
        ) {
            values.push(self.parse_expr(ctx));
            while self.eat(TokenKind::Comma) {
                values.push(self.parse_expr(ctx));
            }
        }
        self.eat(TokenKind::Semicolon);
        Some(ctx.push(NodeKind::Return(values), sloc))
    }

    fn parse_function_decl(&mut self, ctx: &mut FnCtx) -> Option<NodeId> {
        let sloc = self.bump().sloc; // 'def'
        let name = self.expect_ident();
        let function = self.parse_function_rest(Some(name), false, sloc, ctx);
        Some(ctx.push(NodeKind::FunctionDecl { name, local: UNRESOLVED_LOCAL, function }, sloc))
    }

    fn parse_expr_stmt(&mut self, ctx: &mut FnCtx) -> Option<NodeId> {
        let sloc = self.current.sloc;
        let expr = self.parse_expr(ctx);
        if self.check(TokenKind::Comma) {
            let mut targets = vec![expr];
            while self.eat(TokenKind::Comma) {
                targets.push(self.parse_expr(ctx));
            }
            self.expect(TokenKind::Assign, "'=' after assignment target list");
            let mut values = vec![self.parse_expr(ctx)];
            while self.eat(TokenKind::Comma) {
                values.push(self.parse_expr(ctx));
            }
            let node = ctx.push(NodeKind::MultiAssign { targets, values }, sloc);
            self.eat(TokenKind::Semicolon);
            return Some(node);
        }
        if is_assign_op(self.current.kind) {
            let op_tok = self.bump();
            let value = self.parse_expr(ctx);
            let op = assign_op_to_binop(op_tok.kind);
            let node = ctx.push(NodeKind::Assign { op, target: expr, value }, sloc);
            self.eat(TokenKind::Semicolon);
            Some(node)
        } else {
            let node = ctx.push(NodeKind::ExprStmt(expr), sloc);
            self.eat(TokenKind::Semicolon);
            Some(node)
        }
    }

    // ---- expressions ----

    fn parse_expr(&mut self, ctx: &mut FnCtx) -> NodeId {
        let expr = self.parse_binary(ctx, Precedence::Or);
        if self.check(TokenKind::If) {
            let sloc = self.bump().sloc;
            let cond = self.parse_binary(ctx, Precedence::Or);
            self.expect(TokenKind::Else, "'else'");
            let else_expr = self.parse_expr(ctx);
            return ctx.push(NodeKind::Ternary { cond, then_expr: expr, else_expr }, sloc);
        }
        expr
    }

    fn parse_binary(&mut self, ctx: &mut FnCtx, min_prec: Precedence) -> NodeId {
        let mut lhs = self.parse_unary(ctx);
        loop {
            let prec = infix_precedence(self.current.kind);
            if prec == Precedence::None || prec < min_prec {
                break;
            }
            if prec == Precedence::Comparison && is_comparison_token(self.current.kind) {
                lhs = self.parse_comparison_chain(ctx, lhs);
                continue;
            }
            let op_tok = self.bump();
            // `is not` is lowered to `NOT(IS ...)`; the
            // `not` must be consumed here, before parsing the rhs operand,
            // or `parse_unary` would instead treat it as negating the rhs.
            let is_not = op_tok.kind == TokenKind::Is && self.eat(TokenKind::Not);
            let rhs = self.parse_binary(ctx, next_level(prec));
            lhs = self.combine(ctx, op_tok, lhs, rhs);
            if is_not {
                lhs = ctx.push(NodeKind::Unary { op: UnaryOp::Not, operand: lhs }, op_tok.sloc);
            }
        }
        lhs
    }

    /// `a < b < c < ...`: every comparand is parsed once and evaluated once,
    /// even though (for a run of more than one operator) it participates in
    /// two adjacent comparisons. A single comparison collapses to a plain
    /// `Binary` node; only a genuine chain produces `CompareChain`.
    fn parse_comparison_chain(&mut self, ctx: &mut FnCtx, first: NodeId) -> NodeId {
        let mut operands = vec![first];
        let mut ops = Vec::new();
        let mut sloc = self.current.sloc;
        while is_comparison_token(self.current.kind) {
            let op_tok = self.bump();
            sloc = op_tok.sloc;
            ops.push(binop_for(op_tok.kind));
            let rhs = self.parse_binary(ctx, next_level(Precedence::Comparison));
            operands.push(rhs);
        }
        if ops.len() == 1 {
            return ctx.push(NodeKind::Binary { op: ops[0], lhs: operands[0], rhs: operands[1] }, sloc);
        }
        ctx.push(NodeKind::CompareChain { operands, ops }, sloc)
    }

    fn combine(&mut self, ctx: &mut FnCtx, op_tok: Token, lhs: NodeId, rhs: NodeId) -> NodeId {
        let sloc = op_tok.sloc;
        match op_tok.kind {
            TokenKind::And => ctx.push(NodeKind::Logical { op: LogicalOp::And, lhs, rhs }, sloc),
            TokenKind::Or => ctx.push(NodeKind::Logical { op: LogicalOp::Or, lhs, rhs }, sloc),
            kind => {
                let op = binop_for(kind);
                ctx.push(NodeKind::Binary { op, lhs, rhs }, sloc)
            }
        }
    }

    fn parse_unary(&mut self, ctx: &mut FnCtx) -> NodeId {
        let sloc = self.current.sloc;
        let op = match self.current.kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Pos),
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Hash => Some(UnaryOp::Len),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.parse_unary(ctx);
            return ctx.push(NodeKind::Unary { op, operand }, sloc);
        }
        self.parse_postfix(ctx)
    }

    fn parse_postfix(&mut self, ctx: &mut FnCtx) -> NodeId {
        let mut expr = self.parse_primary(ctx);
        loop {
            let sloc = self.current.sloc;
            match self.current.kind {
                TokenKind::Dot => {
                    self.bump();
                    let name = self.expect_ident();
                    expr = ctx.push(NodeKind::Key { obj: expr, name }, sloc);
                }
                TokenKind::LBracket => {
                    self.bump();
                    let index = self.parse_expr(ctx);
                    self.expect(TokenKind::RBracket, "']'");
                    expr = ctx.push(NodeKind::Index { obj: expr, index }, sloc);
                }
                TokenKind::LParen => {
                    let args = self.parse_args(ctx);
                    expr = ctx.push(NodeKind::Call { callee: expr, args }, sloc);
                }
                TokenKind::Colon => {
                    self.bump();
                    let name = self.expect_ident();
                    let args = self.parse_args(ctx);
                    expr = ctx.push(NodeKind::MethodCall { obj: expr, name, args }, sloc);
                }
                _ => break,
            }
        }
        expr
    }

    fn parse_args(&mut self, ctx: &mut FnCtx) -> Vec<NodeId> {
        self.expect(TokenKind::LParen, "'('");
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.parse_call_arg(ctx));
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'");
        args
    }

    fn parse_call_arg(&mut self, ctx: &mut FnCtx) -> NodeId {
        if self.check(TokenKind::Ellipsis) {
            let sloc = self.bump().sloc;
            let e = self.parse_expr(ctx);
            return ctx.push(NodeKind::Unpack(e), sloc);
        }
        self.parse_expr(ctx)
    }

    fn parse_primary(&mut self, ctx: &mut FnCtx) -> NodeId {
        let sloc = self.current.sloc;
        match self.current.kind {
            TokenKind::Null => {
                self.bump();
                ctx.push(NodeKind::Null, sloc)
            }
            TokenKind::True => {
                self.bump();
                ctx.push(NodeKind::True, sloc)
            }
            TokenKind::False => {
                self.bump();
                ctx.push(NodeKind::False, sloc)
            }
            TokenKind::Number => {
                let tok = self.bump();
                let n = match tok.payload {
                    TokenPayload::Number(n) => n,
                    _ => 0.0,
                };
                ctx.push(NodeKind::Number(n), sloc)
            }
            TokenKind::String => {
                let tok = self.bump();
                let id = match tok.payload {
                    TokenPayload::Interned(id) => id,
                    TokenPayload::View { start, end } => {
                        let text = self.lexer.text(start, end).to_string();
                        self.lexer.intern(&text)
                    }
                    _ => self.lexer.intern(""),
                };
                ctx.push(NodeKind::StringLit(id), sloc)
            }
            TokenKind::Identifier => {
                let tok = self.bump();
                let name = self.ident_text(tok);
                ctx.push(NodeKind::Name(name), sloc)
            }
            TokenKind::SelfKw => {
                self.bump();
                ctx.push(NodeKind::SelfName, sloc)
            }
            TokenKind::Super => {
                self.bump();
                ctx.push(NodeKind::SuperName, sloc)
            }
            TokenKind::LParen => {
                self.bump();
                let e = self.parse_expr(ctx);
                self.expect(TokenKind::RParen, "')'");
                e
            }
            TokenKind::LBracket => self.parse_array_lit(ctx),
            TokenKind::LBrace => self.parse_table_lit(ctx),
            TokenKind::Object => self.parse_object_lit(ctx),
            TokenKind::Def => {
                self.bump();
                let fid = self.parse_function_rest(None, false, sloc, ctx);
                ctx.push(NodeKind::FunctionLit(fid), sloc)
            }
            TokenKind::Ellipsis => {
                self.bump();
                ctx.push(NodeKind::Vararg, sloc)
            }
            TokenKind::Yield => self.parse_yield(ctx),
            _ => {
                self.errors.error("expected expression", sloc);
                // Don't consume: the caller's loop-progress guard advances
                // past whatever token triggered this so parsing can continue.
                ctx.push(NodeKind::Null, sloc)
            }
        }
    }

    fn parse_array_lit(&mut self, ctx: &mut FnCtx) -> NodeId {
        let sloc = self.bump().sloc; // '['
        let mut elements = Vec::new();
        if !self.check(TokenKind::RBracket) {
            loop {
                elements.push(self.parse_call_arg(ctx));
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBracket, "']'");
        ctx.push(NodeKind::ArrayLit { elements }, sloc)
    }

    fn parse_table_lit(&mut self, ctx: &mut FnCtx) -> NodeId {
        let sloc = self.bump().sloc; // '{'
        let mut entries = Vec::new();
        if !self.check(TokenKind::RBrace) {
            loop {
                let key = self.parse_table_key(ctx);
                self.expect(TokenKind::Colon, "':'");
                let value = self.parse_expr(ctx);
                entries.push((key, value));
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace, "'}'");
        ctx.push(NodeKind::TableLit { entries }, sloc)
    }

    fn parse_table_key(&mut self, ctx: &mut FnCtx) -> NodeId {
        let sloc = self.current.sloc;
        if self.eat(TokenKind::LBracket) {
            let e = self.parse_expr(ctx);
            self.expect(TokenKind::RBracket, "']'");
            e
        } else if self.check(TokenKind::Identifier) {
            let tok = self.bump();
            let name = self.ident_text(tok);
            ctx.push(NodeKind::StringLit(name), sloc)
        } else {
            self.parse_expr(ctx)
        }
    }

    fn parse_object_lit(&mut self, ctx: &mut FnCtx) -> NodeId {
        let sloc = self.bump().sloc; // 'object'
        let prototype = if self.eat(TokenKind::LParen) {
            let e = self.parse_expr(ctx);
            self.expect(TokenKind::RParen, "')'");
            Some(e)
        } else {
            None
        };
        let mut keys = Vec::new();
        let mut members = Vec::new();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            let name = self.expect_ident();
            if self.check(TokenKind::LParen) {
                let member_sloc = self.current.sloc;
                let fid = self.parse_function_rest(Some(name), true, member_sloc, ctx);
                members.push(ctx.push(NodeKind::FunctionLit(fid), member_sloc));
            } else {
                self.expect(TokenKind::Assign, "'='");
                let value = self.parse_expr(ctx);
                members.push(value);
            }
            keys.push(name);
            self.eat(TokenKind::Semicolon);
        }
        self.expect(TokenKind::End, "'end'");
        ctx.push(NodeKind::ObjectLit { prototype, keys, members }, sloc)
    }

    fn parse_yield(&mut self, ctx: &mut FnCtx) -> NodeId {
        let sloc = self.bump().sloc; // 'yield'
        if self.eat(TokenKind::For) {
            let iterable = self.parse_expr(ctx);
            return ctx.push(NodeKind::YieldFor { iterable }, sloc);
        }
        let args = if self.check(TokenKind::LParen) { self.parse_args(ctx) } else { Vec::new() };
        ctx.push(NodeKind::Yield { args }, sloc)
    }
}

fn assign_op_to_binop(kind: TokenKind) -> Option<BinaryOp> {
    use TokenKind::*;
    Some(match kind {
        Assign => return None,
        PlusAssign => BinaryOp::Add,
        MinusAssign => BinaryOp::Sub,
        StarAssign => BinaryOp::Mul,
        SlashAssign => BinaryOp::Div,
        SlashSlashAssign => BinaryOp::FloorDiv,
        PercentAssign => BinaryOp::Mod,
        TildeAssign => BinaryOp::Concat,
        AmpAssign => BinaryOp::BitAnd,
        PipeAssign => BinaryOp::BitOr,
        CaretAssign => BinaryOp::BitXor,
        LShiftAssign => BinaryOp::Shl,
        RShiftAssign => BinaryOp::Shr,
        AShiftAssign => BinaryOp::AShr,
        _ => unreachable!("not an assignment operator"),
    })
}

/// Maps an infix token to its `BinaryOp`. Shift-token naming follows
/// `kbc_lexer::token`: `<<` is `LShift`, `>>` is the arithmetic right shift
/// (`AShift`), and `~>>` is the logical right shift (`RShift`).
fn is_comparison_token(kind: TokenKind) -> bool {
    matches!(kind, TokenKind::Eq | TokenKind::NotEq | TokenKind::Lt | TokenKind::Le | TokenKind::Gt | TokenKind::Ge)
}

fn binop_for(kind: TokenKind) -> BinaryOp {
    use TokenKind::*;
    match kind {
        Plus => BinaryOp::Add,
        Minus => BinaryOp::Sub,
        Star => BinaryOp::Mul,
        Slash => BinaryOp::Div,
        SlashSlash => BinaryOp::FloorDiv,
        Percent => BinaryOp::Mod,
        Tilde => BinaryOp::Concat,
        Amp => BinaryOp::BitAnd,
        Pipe => BinaryOp::BitOr,
        Caret => BinaryOp::BitXor,
        LShift => BinaryOp::Shl,
        AShift => BinaryOp::AShr,
        RShift => BinaryOp::Shr,
        Eq => BinaryOp::Eq,
        NotEq => BinaryOp::NotEq,
        Lt => BinaryOp::Lt,
        Le => BinaryOp::Le,
        Gt => BinaryOp::Gt,
        Ge => BinaryOp::Ge,
        Is => BinaryOp::Is,
        _ => unreachable!("not a binary operator token"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbc_common::Source;

    fn parse(text: &str) -> (Program, ErrorSink) {
        let mut source = Source::new("t.kf", text);
        Parser::new(&mut source).parse_program()
    }

    fn block_stmts(function: &Function) -> &[NodeId] {
        match &function.node(function.body).kind {
            NodeKind::Block(stmts) => stmts,
            _ => panic!("expected block"),
        }
    }

    #[test]
    fn empty_program_parses_to_empty_block() {
        let (program, errors) = parse("");
        assert!(errors.is_empty());
        assert!(block_stmts(&program.main).is_empty());
    }

    #[test]
    fn var_decl_with_init() {
        let (program, errors) = parse("var x = 1 + 2;");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        assert_eq!(stmts.len(), 1);
        match &program.main.node(stmts[0]).kind {
            NodeKind::VarDecl { names, init, .. } => {
                assert_eq!(names.len(), 1);
                assert!(init.is_some());
            }
            other => panic!("expected VarDecl, got {other:?}"),
        }
    }

    #[test]
    fn binary_precedence_multiplies_before_adds() {
        let (program, errors) = parse("var x = 1 + 2 * 3;");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        let init = match &program.main.node(stmts[0]).kind {
            NodeKind::VarDecl { init: Some(id), .. } => *id,
            _ => panic!("expected var decl with init"),
        };
        match &program.main.node(init).kind {
            NodeKind::Binary { op: BinaryOp::Add, lhs, rhs } => {
                assert!(matches!(program.main.node(*lhs).kind, NodeKind::Number(n) if n == 1.0));
                assert!(matches!(program.main.node(*rhs).kind, NodeKind::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("expected top-level Add, got {other:?}"),
        }
    }

    #[test]
    fn if_elif_else_chain_nests_correctly() {
        let (program, errors) = parse("if a\nelif b\nelse\nend");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        match &program.main.node(stmts[0]).kind {
            NodeKind::If { else_block: Some(elif_id), .. } => {
                assert!(matches!(program.main.node(*elif_id).kind, NodeKind::If { .. }));
            }
            other => panic!("expected If, got {other:?}"),
        }
    }

    #[test]
    fn for_range_and_for_each_both_parse() {
        let (program, errors) = parse("for i = 0:10:2\nend\nfor x : xs\nend");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        assert!(matches!(program.main.node(stmts[0]).kind, NodeKind::ForRange { .. }));
        assert!(matches!(program.main.node(stmts[1]).kind, NodeKind::ForEach { .. }));
    }

    #[test]
    fn nested_function_literal_is_recorded() {
        let (program, errors) = parse("var f = def(x) return x end;");
        assert!(errors.is_empty());
        assert_eq!(program.main.functions.len(), 1);
        assert_eq!(program.main.functions[0].params.len(), 1);
    }

    #[test]
    fn call_and_method_call_and_index_chain() {
        let (program, errors) = parse("a.b:c(1)[2];");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        let expr = match &program.main.node(stmts[0]).kind {
            NodeKind::ExprStmt(e) => *e,
            _ => panic!("expected expr stmt"),
        };
        assert!(matches!(program.main.node(expr).kind, NodeKind::Index { .. }));
    }

    #[test]
    fn single_comparison_stays_a_plain_binary_node() {
        let (program, errors) = parse("return a < b;");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        let expr = match &program.main.node(stmts[0]).kind {
            NodeKind::Return(values) => values[0],
            _ => panic!("expected return"),
        };
        assert!(matches!(program.main.node(expr).kind, NodeKind::Binary { op: BinaryOp::Lt, .. }));
    }

    #[test]
    fn chained_comparison_becomes_a_single_comparechain_node() {
        let (program, errors) = parse("return a < b <= c;");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        let expr = match &program.main.node(stmts[0]).kind {
            NodeKind::Return(values) => values[0],
            _ => panic!("expected return"),
        };
        match &program.main.node(expr).kind {
            NodeKind::CompareChain { operands, ops } => {
                assert_eq!(operands.len(), 3);
                assert_eq!(ops, &vec![BinaryOp::Lt, BinaryOp::Le]);
            }
            other => panic!("expected CompareChain, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_block_reports_error_but_still_returns_a_program() {
        let (program, errors) = parse("if a\n");
        assert!(errors.has_errors());
        assert!(!block_stmts(&program.main).is_empty());
    }

    #[test]
    fn comma_separated_targets_and_values_parse_to_a_multi_assign_node() {
        let (program, errors) = parse("a, b = 1, 2;");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        assert_eq!(stmts.len(), 1);
        match &program.main.node(stmts[0]).kind {
            NodeKind::MultiAssign { targets, values } => {
                assert_eq!(targets.len(), 2);
                assert_eq!(values.len(), 2);
                assert!(matches!(program.main.node(values[0]).kind, NodeKind::Number(n) if n == 1.0));
                assert!(matches!(program.main.node(values[1]).kind, NodeKind::Number(n) if n == 2.0));
            }
            other => panic!("expected MultiAssign, got {other:?}"),
        }
    }

    #[test]
    fn single_target_assignment_still_parses_to_a_plain_assign_node() {
        let (program, errors) = parse("a = 1;");
        assert!(errors.is_empty());
        let stmts = block_stmts(&program.main);
        assert!(matches!(program.main.node(stmts[0]).kind, NodeKind::Assign { op: None, .. }));
    }
}
