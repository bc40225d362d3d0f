//! Lowers the AST to bytecode: one flat constant pool plus an instruction
//! stream per function, with jumps back-patched after their targets are
//! known.

use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::ast::{Expression, Program, Statement};
use crate::code::{self, Instructions, Opcode};
use crate::evaluator::builtins;
use crate::object::{CompiledFunctionObject, Object};
use crate::symbol_table::{SymbolScope, SymbolTable};

#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

struct CompilationScope {
    instructions: Instructions,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Object>,
}

pub struct Compiler {
    constants: Vec<Object>,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
}

/// A fresh global symbol table with every builtin already bound.
pub fn new_symbol_table() -> SymbolTable {
    let mut symbol_table = SymbolTable::new();
    for (index, name) in builtins::NAMES.iter().enumerate() {
        symbol_table.define_builtin(index, name);
    }
    symbol_table
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Compiler::new_with_state(new_symbol_table(), Vec::new())
    }

    /// Picks up compilation where a previous `Compiler` left off, so a REPL
    /// can keep resolving identifiers and reusing constants across lines.
    pub fn new_with_state(symbol_table: SymbolTable, constants: Vec<Object>) -> Self {
        Compiler {
            constants,
            symbol_table,
            scopes: vec![CompilationScope {
                instructions: Vec::new(),
                last_instruction: None,
                previous_instruction: None,
            }],
        }
    }

    pub fn compile(&mut self, program: &Program) -> Result<(), CompileError> {
        for stmt in &program.statements {
            self.compile_statement(stmt)?;
        }
        Ok(())
    }

    pub fn bytecode(&self) -> Bytecode {
        Bytecode {
            instructions: self.current_instructions().clone(),
            constants: self.constants.clone(),
        }
    }

    /// Hands back the symbol table and constant pool so a caller (the REPL)
    /// can feed them into the next `Compiler::new_with_state`.
    pub fn into_symbol_table_and_constants(self) -> (SymbolTable, Vec<Object>) {
        (self.symbol_table, self.constants)
    }

    fn current_instructions(&self) -> &Instructions {
        &self.scopes.last().unwrap().instructions
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope {
            instructions: Vec::new(),
            last_instruction: None,
            previous_instruction: None,
        });
        let table = std::mem::take(&mut self.symbol_table);
        self.symbol_table = SymbolTable::enclosed(table);
    }

    fn leave_scope(&mut self) -> Instructions {
        let scope = self.scopes.pop().expect("no scope to leave");
        let table = std::mem::take(&mut self.symbol_table);
        let (outer, _) = table.leave_scope();
        self.symbol_table = outer;
        scope.instructions
    }

    fn add_constant(&mut self, obj: Object) -> usize {
        self.constants.push(obj);
        self.constants.len() - 1
    }

    fn emit(&mut self, op: Opcode, operands: &[usize]) -> usize {
        let instruction = code::make(op, operands);
        let position = self.current_instructions().len();

        let scope = self.scopes.last_mut().unwrap();
        scope.instructions.extend_from_slice(&instruction);

        scope.previous_instruction = scope.last_instruction;
        scope.last_instruction = Some(EmittedInstruction { opcode: op, position });

        position
    }

    fn last_instruction_is(&self, op: Opcode) -> bool {
        match self.scopes.last().unwrap().last_instruction {
            Some(emitted) => emitted.opcode == op,
            None => false,
        }
    }

    fn remove_last_pop(&mut self) {
        let scope = self.scopes.last_mut().unwrap();
        if let Some(last) = scope.last_instruction {
            scope.instructions.truncate(last.position);
            scope.last_instruction = scope.previous_instruction;
        }
    }

    fn replace_instruction(&mut self, position: usize, new_instruction: Instructions) {
        let scope = self.scopes.last_mut().unwrap();
        for (i, byte) in new_instruction.into_iter().enumerate() {
            scope.instructions[position + i] = byte;
        }
    }

    fn change_operand(&mut self, position: usize, operand: usize) {
        let op = Opcode::from_byte(self.current_instructions()[position]).unwrap();
        let new_instruction = code::make(op, &[operand]);
        self.replace_instruction(position, new_instruction);
    }

    fn replace_last_pop_with_return(&mut self) {
        let scope = self.scopes.last().unwrap();
        let Some(last) = scope.last_instruction else {
            return;
        };
        if last.opcode != Opcode::Pop {
            return;
        }
        let position = last.position;
        let new_instruction = code::make(Opcode::ReturnValue, &[]);
        self.replace_instruction(position, new_instruction);
        self.scopes.last_mut().unwrap().last_instruction = Some(EmittedInstruction {
            opcode: Opcode::ReturnValue,
            position,
        });
    }

    fn compile_statement(&mut self, stmt: &Statement) -> Result<(), CompileError> {
        match stmt {
            Statement::Expression(stmt) => {
                self.compile_expression(&stmt.expression)?;
                self.emit(Opcode::Pop, &[]);
                Ok(())
            }
            Statement::Let(stmt) => {
                let symbol = self.symbol_table.define(&stmt.name);
                self.compile_expression(&stmt.value)?;
                match symbol.scope {
                    SymbolScope::Global => {
                        self.emit(Opcode::SetGlobal, &[symbol.index]);
                    }
                    _ => {
                        self.emit(Opcode::SetLocal, &[symbol.index]);
                    }
                }
                Ok(())
            }
            Statement::Return(stmt) => {
                self.compile_expression(&stmt.value)?;
                self.emit(Opcode::ReturnValue, &[]);
                Ok(())
            }
            Statement::Block(block) => {
                for stmt in &block.statements {
                    self.compile_statement(stmt)?;
                }
                Ok(())
            }
        }
    }

    fn compile_expression(&mut self, expr: &Expression) -> Result<(), CompileError> {
        match expr {
            Expression::IntegerLiteral(value) => {
                let constant = self.add_constant(Object::Integer(*value));
                self.emit(Opcode::Constant, &[constant]);
                Ok(())
            }
            Expression::StringLiteral(value) => {
                let constant = self.add_constant(Object::Str(value.clone()));
                self.emit(Opcode::Constant, &[constant]);
                Ok(())
            }
            Expression::Boolean(true) => {
                self.emit(Opcode::True, &[]);
                Ok(())
            }
            Expression::Boolean(false) => {
                self.emit(Opcode::False, &[]);
                Ok(())
            }
            Expression::Identifier(name) => {
                let symbol = self
                    .symbol_table
                    .resolve(name)
                    .ok_or_else(|| CompileError {
                        message: format!("undefined variable {name}"),
                    })?;
                self.load_symbol(&symbol);
                Ok(())
            }
            Expression::Prefix(expr) => {
                self.compile_expression(&expr.right)?;
                match expr.operator.as_str() {
                    "!" => {
                        self.emit(Opcode::Bang, &[]);
                    }
                    "-" => {
                        self.emit(Opcode::Minus, &[]);
                    }
                    other => {
                        return Err(CompileError {
                            message: format!("unknown operator {other}"),
                        })
                    }
                }
                Ok(())
            }
            Expression::Infix(expr) => self.compile_infix(expr),
            Expression::If(expr) => self.compile_if(expr),
            Expression::Function(expr) => self.compile_function(expr),
            Expression::Call(expr) => {
                self.compile_expression(&expr.function)?;
                for arg in &expr.arguments {
                    self.compile_expression(arg)?;
                }
                self.emit(Opcode::Call, &[expr.arguments.len()]);
                Ok(())
            }
            Expression::ListLiteral(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()]);
                Ok(())
            }
            Expression::HashLiteral(pairs) => {
                let mut sorted = pairs.clone();
                sorted.sort_by_key(|(key, _)| key.to_string());
                for (key, value) in &sorted {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                self.emit(Opcode::Hash, &[sorted.len() * 2]);
                Ok(())
            }
            Expression::Index(expr) => {
                self.compile_expression(&expr.left)?;
                self.compile_expression(&expr.index)?;
                self.emit(Opcode::Index, &[]);
                Ok(())
            }
        }
    }

    fn load_symbol(&mut self, symbol: &crate::symbol_table::Symbol) {
        match symbol.scope {
            SymbolScope::Global => {
                self.emit(Opcode::GetGlobal, &[symbol.index]);
            }
            SymbolScope::Local => {
                self.emit(Opcode::GetLocal, &[symbol.index]);
            }
            SymbolScope::Builtin => {
                self.emit(Opcode::GetBuiltin, &[symbol.index]);
            }
            SymbolScope::Free => {
                self.emit(Opcode::GetFree, &[symbol.index]);
            }
            SymbolScope::Function => {
                self.emit(Opcode::CurrentClosure, &[]);
            }
        };
    }

    fn compile_infix(&mut self, expr: &crate::ast::InfixExpression) -> Result<(), CompileError> {
        if expr.operator == "<" {
            self.compile_expression(&expr.right)?;
            self.compile_expression(&expr.left)?;
            self.emit(Opcode::GreaterThan, &[]);
            return Ok(());
        }

        self.compile_expression(&expr.left)?;
        self.compile_expression(&expr.right)?;

        match expr.operator.as_str() {
            "+" => {
                self.emit(Opcode::Add, &[]);
            }
            "-" => {
                self.emit(Opcode::Sub, &[]);
            }
            "*" => {
                self.emit(Opcode::Mul, &[]);
            }
            "/" => {
                self.emit(Opcode::Div, &[]);
            }
            ">" => {
                self.emit(Opcode::GreaterThan, &[]);
            }
            "==" => {
                self.emit(Opcode::Equal, &[]);
            }
            "!=" => {
                self.emit(Opcode::NotEqual, &[]);
            }
            other => {
                return Err(CompileError {
                    message: format!("unknown operator {other}"),
                })
            }
        }
        Ok(())
    }

    fn compile_if(&mut self, expr: &crate::ast::IfExpression) -> Result<(), CompileError> {
        self.compile_expression(&expr.condition)?;

        let jump_not_truthy_pos = self.emit(Opcode::JumpNotTruthy, &[9999]);

        self.compile_statement(&Statement::Block(expr.consequence.clone()))?;
        if self.last_instruction_is(Opcode::Pop) {
            self.remove_last_pop();
        }

        let jump_pos = self.emit(Opcode::Jump, &[9999]);

        let after_consequence_pos = self.current_instructions().len();
        self.change_operand(jump_not_truthy_pos, after_consequence_pos);

        match &expr.alternative {
            Some(alternative) => {
                self.compile_statement(&Statement::Block(alternative.clone()))?;
                if self.last_instruction_is(Opcode::Pop) {
                    self.remove_last_pop();
                }
            }
            None => {
                self.emit(Opcode::Null, &[]);
            }
        }

        let after_alternative_pos = self.current_instructions().len();
        self.change_operand(jump_pos, after_alternative_pos);

        Ok(())
    }

    fn compile_function(
        &mut self,
        expr: &crate::ast::FunctionExpression,
    ) -> Result<(), CompileError> {
        self.enter_scope();

        if let Some(name) = &expr.name {
            self.symbol_table.define_function_name(name);
        }

        for param in &expr.parameters {
            self.symbol_table.define(param);
        }

        self.compile_statement(&Statement::Block(expr.body.clone()))?;

        if self.last_instruction_is(Opcode::Pop) {
            self.replace_last_pop_with_return();
        }
        if !self.last_instruction_is(Opcode::ReturnValue) {
            self.emit(Opcode::Return, &[]);
        }

        let free_symbols = self.symbol_table.free_symbols.clone();
        let num_locals = self.symbol_table.num_definitions;
        let instructions = self.leave_scope();

        for free in &free_symbols {
            self.load_symbol(free);
        }

        let compiled_function = Object::CompiledFunction(Rc::new(CompiledFunctionObject {
            instructions,
            num_locals,
            num_params: expr.parameters.len(),
        }));
        let constant = self.add_constant(compiled_function);

        debug!(
            "compiled function with {} locals, {} params, {} free vars",
            num_locals,
            expr.parameters.len(),
            free_symbols.len()
        );

        self.emit(Opcode::Closure, &[constant, free_symbols.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{make, Disassembled};
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn compile(input: &str) -> Bytecode {
        let lexer = Lexer::new(input);
        let mut parser = Parser::new(lexer);
        let program = parser.parse_program();
        assert!(parser.errors().is_empty(), "{:?}", parser.errors());

        let mut compiler = Compiler::new();
        compiler.compile(&program).expect("compile should succeed");
        compiler.bytecode()
    }

    fn concat_instructions(chunks: Vec<Instructions>) -> Instructions {
        chunks.concat()
    }

    #[test]
    fn integer_arithmetic_compiles_constants_and_add() {
        let bytecode = compile("1 + 2");
        assert_eq!(bytecode.constants, vec![Object::Integer(1), Object::Integer(2)]);

        let expected = concat_instructions(vec![
            make(Opcode::Constant, &[0]),
            make(Opcode::Constant, &[1]),
            make(Opcode::Add, &[]),
            make(Opcode::Pop, &[]),
        ]);
        assert_eq!(bytecode.instructions, expected);
    }

    #[test]
    fn less_than_compiles_as_swapped_greater_than() {
        let bytecode = compile("1 < 2");
        let expected = concat_instructions(vec![
            make(Opcode::Constant, &[0]),
            make(Opcode::Constant, &[1]),
            make(Opcode::GreaterThan, &[]),
            make(Opcode::Pop, &[]),
        ]);
        assert_eq!(bytecode.instructions, expected);
    }

    #[test]
    fn if_else_back_patches_jumps() {
        let bytecode = compile("if (true) { 10 } else { 20 }; 3333;");
        let expected = concat_instructions(vec![
            make(Opcode::True, &[]),
            make(Opcode::JumpNotTruthy, &[10]),
            make(Opcode::Constant, &[0]),
            make(Opcode::Jump, &[13]),
            make(Opcode::Constant, &[1]),
            make(Opcode::Pop, &[]),
            make(Opcode::Constant, &[2]),
            make(Opcode::Pop, &[]),
        ]);
        assert_eq!(
            Disassembled(&bytecode.instructions).to_string(),
            Disassembled(&expected).to_string()
        );
    }

    #[test]
    fn global_let_statements() {
        let bytecode = compile("let one = 1; let two = 2;");
        let expected = concat_instructions(vec![
            make(Opcode::Constant, &[0]),
            make(Opcode::SetGlobal, &[0]),
            make(Opcode::Constant, &[1]),
            make(Opcode::SetGlobal, &[1]),
        ]);
        assert_eq!(bytecode.instructions, expected);
    }

    #[test]
    fn functions_compile_to_closures_with_return() {
        let bytecode = compile("fn() { return 5 + 10 }");
        assert!(matches!(
            bytecode.constants.last(),
            Some(Object::CompiledFunction(_))
        ));
    }

    #[test]
    fn let_bound_recursive_function_uses_current_closure() {
        let bytecode = compile("let countdown = fn(x) { countdown(x - 1) }; countdown(1);");
        let Some(Object::CompiledFunction(func)) = bytecode.constants.iter().find(|obj| {
            matches!(obj, Object::CompiledFunction(_))
        }) else {
            panic!("expected a compiled function constant");
        };
        assert!(Disassembled(&func.instructions).to_string().contains("OpCurrentClosure"));
    }

    #[test]
    fn list_and_hash_literals() {
        let bytecode = compile("[1, 2, 3]");
        let expected = concat_instructions(vec![
            make(Opcode::Constant, &[0]),
            make(Opcode::Constant, &[1]),
            make(Opcode::Constant, &[2]),
            make(Opcode::Array, &[3]),
            make(Opcode::Pop, &[]),
        ]);
        assert_eq!(bytecode.instructions, expected);
    }
}
