use super::chunk::{Chunk, OpCode};
use super::heap::Gc;
use super::object::{ObjFunction, ObjKind};
use super::reporter::{Phase, Report, Reporter};
use super::token::{Token, TokenType};
use super::tokenizer::Tokenizer;
use super::value::Value;
use super::vm::Vm;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Primary,
            Self::Primary => Self::Primary,
        }
    }
}

type ParseFn<'src, 'a> = fn(&mut Compiler<'src, 'a>, bool);

struct ParseRule<'src, 'a> {
    prefix: Option<ParseFn<'src, 'a>>,
    infix: Option<ParseFn<'src, 'a>>,
    precedence: Precedence,
}

impl<'src, 'a> ParseRule<'src, 'a> {
    fn new(
        prefix: Option<ParseFn<'src, 'a>>,
        infix: Option<ParseFn<'src, 'a>>,
        precedence: Precedence,
    ) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
}

/// Depth -1 marks the window between declaration and initialization, so an
/// initializer cannot read the variable it is defining.
struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Upvalue {
    pub index: u8,
    pub is_local: bool,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// One function being compiled. Frames stack up for nested `fun`
/// declarations; the enclosing frame is the previous element.
struct FnCompiler<'src> {
    typ: FunctionType,
    name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl<'src> FnCompiler<'src> {
    fn new(typ: FunctionType, name: Option<String>) -> Self {
        // slot 0 holds the callee itself
        let mut locals = Vec::with_capacity(8);
        locals.push(Local {
            name: Token::new_empty(),
            depth: 0,
            is_captured: false,
        });

        Self {
            typ,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

pub struct Compiler<'src, 'a> {
    tokenizer: Tokenizer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    ok: bool,
    panic: bool,
    frames: Vec<FnCompiler<'src>>,
    vm: &'a mut Vm,
    reporter: &'a mut dyn Reporter,
}

/// Compiles `source` into a script function on the VM heap. Returns `None`
/// if any diagnostic was raised; compilation still runs to the end of the
/// source to surface as many errors as possible.
pub fn compile<'src, 'a>(
    source: &'src str,
    vm: &'a mut Vm,
    reporter: &'a mut dyn Reporter,
) -> Option<Gc> {
    let mut compiler = Compiler {
        tokenizer: Tokenizer::new(source),
        current: Token::new_empty(),
        previous: Token::new_empty(),
        ok: true,
        panic: false,
        frames: vec![FnCompiler::new(FunctionType::Script, None)],
        vm,
        reporter,
    };

    compiler.advance();
    while !compiler.matches(TokenType::EOF) {
        compiler.declaration();
    }

    let (function, _) = compiler.end_compiler();
    if compiler.ok {
        Some(function)
    } else {
        None
    }
}

impl<'src, 'a> Compiler<'src, 'a> {
    //>> Parser plumbing
    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.tokenizer.next_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            self.error_at(self.current, self.current.lexeme);
        }
    }

    fn consume(&mut self, typ: TokenType, msg: &str) {
        if self.current.typ == typ {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if self.check(typ) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_at(&mut self, token: Token<'src>, msg: &str) {
        if self.panic {
            return;
        }
        self.panic = true;
        self.ok = false;

        let location = match token.typ {
            TokenType::Error => String::new(),
            _ => format!(" at {}", token),
        };
        self.reporter.error(Report::new(
            Phase::Compile,
            format!("[line {}] Error{}: {}", token.line, location, msg),
        ));
    }

    fn error(&mut self, msg: &str) {
        self.error_at(self.previous, msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(self.current, msg);
    }

    fn synchronize(&mut self) {
        self.panic = false;
        while self.current.typ != TokenType::EOF {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            match self.current.typ {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {}
            }
            self.advance();
        }
    }
    //<<

    //>> Emission
    fn frame(&self) -> &FnCompiler<'src> {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut FnCompiler<'src> {
        self.frames.last_mut().unwrap()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.frame_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let idx = self.frame_mut().chunk.add_constant(value);
        if idx > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    /// Emits the opcode with a two-byte placeholder and returns the operand
    /// offset for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.frame().chunk.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // the operand counts from the byte just after itself
        let jump = self.frame().chunk.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.frame_mut().chunk.patch(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.frame().chunk.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    /// Object constants held by in-progress chunks are not yet reachable
    /// from any heap object, so every allocation made on the compiler's
    /// behalf passes them along as extra roots.
    fn gc_roots(&self) -> Vec<Gc> {
        let mut roots = Vec::new();
        for frame in &self.frames {
            for value in frame.chunk.constants() {
                if let Value::Obj(gc) = value {
                    roots.push(*gc);
                }
            }
        }
        roots
    }

    fn intern(&mut self, chars: &str) -> Gc {
        let roots = self.gc_roots();
        self.vm.intern_with_roots(chars, &roots)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let gc = self.intern(name);
        self.make_constant(Value::Obj(gc))
    }

    fn end_compiler(&mut self) -> (Gc, Vec<Upvalue>) {
        self.emit_return();

        let name_gc = match self.frame().name.clone() {
            Some(name) => Some(self.intern(&name)),
            None => None,
        };
        let mut roots = self.gc_roots();
        if let Some(name) = name_gc {
            roots.push(name);
        }

        let frame = self.frames.pop().unwrap();

        #[cfg(feature = "debug-bytecode")]
        if self.ok {
            println!("== {} ==", frame.name.as_deref().unwrap_or("script"));
            print!("{}", frame.chunk.disassemble(self.vm.heap()));
        }

        let function = self.vm.allocate_with_roots(
            ObjKind::Function(ObjFunction::new(
                name_gc,
                frame.chunk,
                frame.arity,
                frame.upvalues.len(),
            )),
            &roots,
        );
        (function, frame.upvalues)
    }
    //<<

    //>> Scopes and name resolution
    fn begin_scope(&mut self) {
        self.frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame_mut().scope_depth -= 1;
        loop {
            let frame = self.frame();
            let captured = match frame.locals.last() {
                Some(local) if local.depth > frame.scope_depth => local.is_captured,
                _ => break,
            };
            self.frame_mut().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        if self.frame().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.frame().scope_depth == 0 {
            return;
        }
        let name = self.previous;

        let mut duplicate = false;
        for local in self.frame().locals.iter().rev() {
            if local.depth != -1 && local.depth < self.frame().scope_depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let frame = self.frame_mut();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        frame.locals.last_mut().unwrap().depth = depth;
    }

    fn parse_variable(&mut self, msg: &str) -> u8 {
        self.consume(TokenType::Identifier, msg);
        self.declare_variable();
        if self.frame().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, frame_idx: usize, name: Token<'src>) -> Option<u8> {
        let mut found = None;
        for idx in (0..self.frames[frame_idx].locals.len()).rev() {
            if self.frames[frame_idx].locals[idx].name.lexeme == name.lexeme {
                found = Some(idx);
                break;
            }
        }

        let idx = found?;
        if self.frames[frame_idx].locals[idx].depth == -1 {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(idx as u8)
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        for (idx, upvalue) in self.frames[frame_idx].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return idx as u8;
            }
        }

        if self.frames[frame_idx].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.frames[frame_idx].upvalues.push(Upvalue { index, is_local });
        (self.frames[frame_idx].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, frame_idx: usize, name: Token<'src>) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(frame_idx - 1, name) {
            self.frames[frame_idx - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(frame_idx - 1, name) {
            return Some(self.add_upvalue(frame_idx, upvalue, false));
        }
        None
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let top = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(idx) = self.resolve_local(top, name) {
            (OpCode::GetLocal, OpCode::SetLocal, idx)
        } else if let Some(idx) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, idx)
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }
    //<<

    //>> Pratt table and expression handlers
    fn rule(typ: TokenType) -> ParseRule<'src, 'a> {
        match typ {
            TokenType::OParen => ParseRule::new(
                Some(Compiler::grouping),
                Some(Compiler::call),
                Precedence::Call,
            ),
            TokenType::Minus => ParseRule::new(
                Some(Compiler::unary),
                Some(Compiler::binary),
                Precedence::Term,
            ),
            TokenType::Plus => ParseRule::new(None, Some(Compiler::binary), Precedence::Term),
            TokenType::Slash | TokenType::Star => {
                ParseRule::new(None, Some(Compiler::binary), Precedence::Factor)
            }
            TokenType::Bang => ParseRule::new(Some(Compiler::unary), None, Precedence::None),
            TokenType::BangEqual | TokenType::DEqual => {
                ParseRule::new(None, Some(Compiler::binary), Precedence::Equality)
            }
            TokenType::Greater
            | TokenType::GreaterEqual
            | TokenType::Less
            | TokenType::LessEqual => {
                ParseRule::new(None, Some(Compiler::binary), Precedence::Comparison)
            }
            TokenType::Identifier => {
                ParseRule::new(Some(Compiler::variable), None, Precedence::None)
            }
            TokenType::String => ParseRule::new(Some(Compiler::string), None, Precedence::None),
            TokenType::Number => ParseRule::new(Some(Compiler::number), None, Precedence::None),
            TokenType::And => ParseRule::new(None, Some(Compiler::and), Precedence::And),
            TokenType::Or => ParseRule::new(None, Some(Compiler::or), Precedence::Or),
            TokenType::False | TokenType::True | TokenType::Nil => {
                ParseRule::new(Some(Compiler::literal), None, Precedence::None)
            }
            _ => ParseRule::new(None, None, Precedence::None),
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match Self::rule(self.previous.typ).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            }
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.typ).precedence {
            self.advance();
            let infix = Self::rule(self.previous.typ).infix.unwrap();
            infix(self, can_assign);
        }

        // an `=` nobody consumed means the left side was no assignment target
        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let gc = self.intern(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::Obj(gc));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.typ {
            TokenType::Nil => self.emit_op(OpCode::Nil),
            TokenType::True => self.emit_op(OpCode::True),
            TokenType::False => self.emit_op(OpCode::False),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::CParen, "Expect ')' after expression.");
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.typ;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenType::Minus => self.emit_op(OpCode::Negate),
            TokenType::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.typ;
        self.parse_precedence(Self::rule(op).precedence.next());

        match op {
            TokenType::Plus => self.emit_op(OpCode::Add),
            TokenType::Minus => self.emit_op(OpCode::Subtract),
            TokenType::Star => self.emit_op(OpCode::Multiply),
            TokenType::Slash => self.emit_op(OpCode::Divide),
            TokenType::DEqual => self.emit_op(OpCode::Equal),
            TokenType::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenType::Greater => self.emit_op(OpCode::Greater),
            TokenType::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenType::Less => self.emit_op(OpCode::Less),
            TokenType::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenType::CParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after arguments.");
        count as u8
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }
    //<<

    //>> Declarations and statements
    fn declaration(&mut self) {
        if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // initialized up front so the body can call itself
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, typ: FunctionType) {
        let name = self.previous.lexeme.to_owned();
        self.frames.push(FnCompiler::new(typ, Some(name)));
        self.begin_scope();

        self.consume(TokenType::OParen, "Expect '(' after function name.");
        if !self.check(TokenType::CParen) {
            loop {
                if self.frame().arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.frame_mut().arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after parameters.");
        self.consume(TokenType::OBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn statement(&mut self) {
        if self.matches(TokenType::Print) {
            self.print_statement();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::OBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::CBrace) && !self.check(TokenType::EOF) {
            self.declaration();
        }
        self.consume(TokenType::CBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::OParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::CParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.frame().chunk.len();
        self.consume(TokenType::OParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::CParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::OParen, "Expect '(' after 'for'.");

        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.frame().chunk.len();
        let mut exit_jump = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenType::CParen) {
            // the increment runs after the body, so jump over it here and
            // loop back to it from the body's end
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.frame().chunk.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenType::CParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.frame().typ == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
    //<<
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::Report;

    struct ErrorsTracker {
        errors: Vec<Report>,
    }

    impl ErrorsTracker {
        fn new() -> Self {
            Self { errors: Vec::new() }
        }
    }

    impl Reporter for ErrorsTracker {
        fn error(&mut self, report: Report) {
            self.errors.push(report);
        }
    }

    fn try_compile(source: &str) -> (Option<Gc>, Vec<String>, Vm) {
        let mut vm = Vm::new();
        let mut tracker = ErrorsTracker::new();
        let function = compile(source, &mut vm, &mut tracker);
        let msgs = tracker.errors.into_iter().map(|r| r.msg).collect();
        (function, msgs, vm)
    }

    #[test]
    fn compiles_a_simple_script() {
        let (function, errors, vm) = try_compile("print 1 + 2 * 3;");
        assert!(errors.is_empty());
        let function = function.unwrap();
        let chunk = &vm.heap().function(function).chunk;
        assert!(!chunk.is_empty());
        assert_eq!(chunk.constants().len(), 3);
    }

    #[test]
    fn rejects_invalid_assignment_targets() {
        let (function, errors, _) = try_compile("a + b = c;");
        assert!(function.is_none());
        assert_eq!(errors[0], "[line 1] Error at '=': Invalid assignment target.");
    }

    #[test]
    fn rejects_reading_a_local_in_its_own_initializer() {
        let (function, errors, _) = try_compile("{ var a = a; }");
        assert!(function.is_none());
        assert_eq!(
            errors[0],
            "[line 1] Error at 'a': Can't read local variable in its own initializer."
        );
    }

    #[test]
    fn rejects_duplicate_locals_in_one_scope() {
        let (function, errors, _) = try_compile("{ var a = 1; var a = 2; }");
        assert!(function.is_none());
        assert_eq!(
            errors[0],
            "[line 1] Error at 'a': Already a variable with this name in this scope."
        );
    }

    #[test]
    fn rejects_top_level_return() {
        let (function, errors, _) = try_compile("return 1;");
        assert!(function.is_none());
        assert_eq!(
            errors[0],
            "[line 1] Error at 'return': Can't return from top-level code."
        );
    }

    #[test]
    fn reports_scanner_errors_through_the_parser() {
        let (function, errors, _) = try_compile("var a = \"oops;");
        assert!(function.is_none());
        assert_eq!(errors[0], "[line 1] Error: Unterminated string.");
    }

    #[test]
    fn keeps_collecting_errors_after_synchronizing() {
        let (function, errors, _) = try_compile("var 1 = 2;\nprint x = ;\n");
        assert!(function.is_none());
        assert!(errors.len() >= 2);
    }

    #[test]
    fn limits_constants_per_function() {
        let mut source = String::new();
        for i in 0..300 {
            source += &format!("{}.5;\n", i);
        }
        let (function, errors, _) = try_compile(&source);
        assert!(function.is_none());
        assert!(errors[0].contains("Too many constants in one chunk."));
    }

    #[test]
    fn resolves_upvalues_through_nested_functions() {
        let source = "\
fun outer() {
  var x = 1;
  fun middle() {
    fun inner() {
      return x;
    }
    return inner;
  }
  return middle;
}
";
        let (function, errors, vm) = try_compile(source);
        assert!(errors.is_empty());
        // outer's closure constant is the middle function, whose inner
        // function captures x transitively
        let script = function.unwrap();
        let outer = vm
            .heap()
            .function(script)
            .chunk
            .constants()
            .iter()
            .find_map(|v| match v {
                Value::Obj(gc) => match vm.heap().kind(*gc) {
                    ObjKind::Function(f) if f.name.is_some() => Some(*gc),
                    _ => None,
                },
                _ => None,
            })
            .unwrap();
        let middle = vm
            .heap()
            .function(outer)
            .chunk
            .constants()
            .iter()
            .find_map(|v| match v {
                Value::Obj(gc) => match vm.heap().kind(*gc) {
                    ObjKind::Function(f) if f.upvalue_count > 0 => Some(*gc),
                    _ => None,
                },
                _ => None,
            });
        assert!(middle.is_some());
    }
}
