//! Stack machine executing the bytecode the compiler produces.

mod frame;

pub use frame::Frame;

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use log::trace;

use crate::code::{self, Opcode};
use crate::compiler::Bytecode;
use crate::evaluator::builtins;
use crate::object::{ClosureObject, CompiledFunctionObject, HashPair, Object, FALSE, NULL, TRUE};

const STACK_SIZE: usize = 2048;
const GLOBALS_SIZE: usize = 65536;
const MAX_FRAMES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    StackOverflow,
    UnknownOperator(String),
    TypeMismatch(String),
    UnresolvedBuiltin(String),
    NotCallable(String),
    UndefinedVariable(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::StackOverflow => write!(f, "stack overflow"),
            VmError::UnknownOperator(msg) => write!(f, "unknown operator: {msg}"),
            VmError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            VmError::UnresolvedBuiltin(msg) => write!(f, "unresolved builtin: {msg}"),
            VmError::NotCallable(msg) => write!(f, "calling non-function and non-built-in: {msg}"),
            VmError::UndefinedVariable(msg) => write!(f, "undefined variable: {msg}"),
        }
    }
}

impl std::error::Error for VmError {}

pub struct Vm {
    constants: Vec<Object>,
    stack: Vec<Object>,
    sp: usize,
    globals: Vec<Object>,
    frames: Vec<Frame>,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        Vm::with_globals(bytecode, vec![NULL.clone(); GLOBALS_SIZE])
    }

    pub fn with_globals(bytecode: Bytecode, globals: Vec<Object>) -> Self {
        let main_fn = Rc::new(CompiledFunctionObject {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_params: 0,
        });
        let main_closure = Rc::new(ClosureObject {
            func: main_fn,
            free: Vec::new(),
        });
        let main_frame = Frame::new(main_closure, 0);

        let mut frames = Vec::with_capacity(MAX_FRAMES);
        frames.push(main_frame);

        Vm {
            constants: bytecode.constants,
            stack: vec![NULL.clone(); STACK_SIZE],
            sp: 0,
            globals,
            frames,
        }
    }

    pub fn new_globals() -> Vec<Object> {
        vec![NULL.clone(); GLOBALS_SIZE]
    }

    pub fn last_popped_stack_elem(&self) -> &Object {
        &self.stack[self.sp]
    }

    pub fn take_globals(self) -> Vec<Object> {
        self.globals
    }

    fn current_frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack is never empty")
    }

    fn push_frame(&mut self, frame: Frame) -> Result<(), VmError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::StackOverflow);
        }
        self.frames.push(frame);
        Ok(())
    }

    fn pop_frame(&mut self) -> Frame {
        self.frames.pop().expect("frame stack underflow")
    }

    fn push(&mut self, obj: Object) -> Result<(), VmError> {
        if self.sp >= STACK_SIZE {
            return Err(VmError::StackOverflow);
        }
        self.stack[self.sp] = obj;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Object {
        let obj = self.stack[self.sp - 1].clone();
        self.sp -= 1;
        obj
    }

    pub fn run(&mut self) -> Result<(), VmError> {
        while self.current_frame().ip + 1 < self.current_frame().instructions().len() as isize {
            self.current_frame().ip += 1;
            let ip = self.current_frame().ip as usize;
            let instructions = self.current_frame().instructions().to_vec();
            let op = Opcode::from_byte(instructions[ip])
                .ok_or_else(|| VmError::UnknownOperator(format!("byte {}", instructions[ip])))?;

            trace!("executing {} at ip={ip}", op.name());

            match op {
                Opcode::Constant => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    self.push(self.constants[operands[0]].clone())?;
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    self.execute_binary_operation(op)?;
                }
                Opcode::True => self.push(TRUE.clone())?,
                Opcode::False => self.push(FALSE.clone())?,
                Opcode::Null => self.push(NULL.clone())?,
                Opcode::Equal | Opcode::NotEqual | Opcode::GreaterThan => {
                    self.execute_comparison(op)?;
                }
                Opcode::Bang => {
                    let operand = self.pop();
                    self.push(native_bool(!operand.is_truthy()))?;
                }
                Opcode::Minus => {
                    let operand = self.pop();
                    match operand {
                        Object::Integer(value) => self.push(Object::Integer(-value))?,
                        other => {
                            return Err(VmError::UnknownOperator(format!(
                                "-{}",
                                other.type_name()
                            )))
                        }
                    }
                }
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::JumpNotTruthy => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    let condition = self.pop();
                    if !condition.is_truthy() {
                        self.current_frame().ip = operands[0] as isize - 1;
                    }
                }
                Opcode::Jump => {
                    let (operands, _) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip = operands[0] as isize - 1;
                }
                Opcode::SetGlobal => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    let value = self.pop();
                    self.globals[operands[0]] = value;
                }
                Opcode::GetGlobal => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    self.push(self.globals[operands[0]].clone())?;
                }
                Opcode::SetLocal => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    let base_pointer = self.current_frame().base_pointer;
                    let value = self.pop();
                    self.stack[base_pointer + operands[0]] = value;
                }
                Opcode::GetLocal => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    let base_pointer = self.current_frame().base_pointer;
                    self.push(self.stack[base_pointer + operands[0]].clone())?;
                }
                Opcode::GetBuiltin => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    let builtin = builtins::by_index(operands[0]).ok_or_else(|| {
                        VmError::UnresolvedBuiltin(format!("index {}", operands[0]))
                    })?;
                    self.push(Object::Builtin(builtin))?;
                }
                Opcode::Array => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    let count = operands[0];
                    let elements = self.stack[self.sp - count..self.sp].to_vec();
                    self.sp -= count;
                    self.push(Object::List(Rc::new(elements)))?;
                }
                Opcode::Hash => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    let count = operands[0];
                    let mut map = HashMap::new();
                    let mut i = self.sp - count;
                    while i < self.sp {
                        let key = self.stack[i].clone();
                        let value = self.stack[i + 1].clone();
                        let hash_key = key.hash_key().ok_or_else(|| {
                            VmError::TypeMismatch(format!(
                                "unusable as hash key: {}",
                                key.type_name()
                            ))
                        })?;
                        map.insert(hash_key, HashPair { key, value });
                        i += 2;
                    }
                    self.sp -= count;
                    self.push(Object::Hash(Rc::new(map)))?;
                }
                Opcode::Index => {
                    let index = self.pop();
                    let left = self.pop();
                    self.execute_index_expression(left, index)?;
                }
                Opcode::Call => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    self.execute_call(operands[0])?;
                }
                Opcode::ReturnValue => {
                    let return_value = self.pop();
                    let frame = self.pop_frame();
                    self.sp = frame.base_pointer - 1;
                    self.push(return_value)?;
                }
                Opcode::Return => {
                    let frame = self.pop_frame();
                    self.sp = frame.base_pointer - 1;
                    self.push(NULL.clone())?;
                }
                Opcode::Closure => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    self.push_closure(operands[0], operands[1])?;
                }
                Opcode::GetFree => {
                    let (operands, width) = code::read_operands(op, &instructions[ip + 1..]);
                    self.current_frame().ip += width as isize;
                    let free = self.current_frame().closure.free[operands[0]].clone();
                    self.push(free)?;
                }
                Opcode::CurrentClosure => {
                    let current = self.current_frame().closure.clone();
                    self.push(Object::Closure(current))?;
                }
            }
        }

        Ok(())
    }

    fn execute_binary_operation(&mut self, op: Opcode) -> Result<(), VmError> {
        let right = self.pop();
        let left = self.pop();

        match (&left, &right) {
            (Object::Integer(l), Object::Integer(r)) => {
                let result = match op {
                    Opcode::Add => l + r,
                    Opcode::Sub => l - r,
                    Opcode::Mul => l * r,
                    Opcode::Div => l / r,
                    _ => unreachable!(),
                };
                self.push(Object::Integer(result))
            }
            (Object::Str(l), Object::Str(r)) if op == Opcode::Add => {
                self.push(Object::Str(format!("{l}{r}")))
            }
            _ => Err(VmError::UnknownOperator(format!(
                "{} {} {}",
                op.name(),
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    fn execute_comparison(&mut self, op: Opcode) -> Result<(), VmError> {
        let right = self.pop();
        let left = self.pop();

        match (&left, &right) {
            (Object::Integer(l), Object::Integer(r)) => {
                let result = match op {
                    Opcode::Equal => l == r,
                    Opcode::NotEqual => l != r,
                    Opcode::GreaterThan => l > r,
                    _ => unreachable!(),
                };
                self.push(native_bool(result))
            }
            _ => match op {
                Opcode::Equal => self.push(native_bool(left == right)),
                Opcode::NotEqual => self.push(native_bool(left != right)),
                _ => Err(VmError::UnknownOperator(format!(
                    "{} {} {}",
                    op.name(),
                    left.type_name(),
                    right.type_name()
                ))),
            },
        }
    }

    fn execute_index_expression(&mut self, left: Object, index: Object) -> Result<(), VmError> {
        match (&left, &index) {
            (Object::List(elements), Object::Integer(i)) => {
                let i = *i;
                if i < 0 || i as usize >= elements.len() {
                    self.push(NULL.clone())
                } else {
                    self.push(elements[i as usize].clone())
                }
            }
            (Object::Hash(pairs), _) => {
                let key = index.hash_key().ok_or_else(|| {
                    VmError::TypeMismatch(format!("unusable as hash key: {}", index.type_name()))
                })?;
                match pairs.get(&key) {
                    Some(pair) => self.push(pair.value.clone()),
                    None => self.push(NULL.clone()),
                }
            }
            (left, _) => Err(VmError::TypeMismatch(format!(
                "index operator not supported: {}",
                left.type_name()
            ))),
        }
    }

    fn execute_call(&mut self, num_args: usize) -> Result<(), VmError> {
        let callee = self.stack[self.sp - 1 - num_args].clone();
        match callee {
            Object::Closure(closure) => self.call_closure(closure, num_args),
            Object::Builtin(func) => {
                let args = self.stack[self.sp - num_args..self.sp].to_vec();
                let result = func(&args);
                self.sp -= num_args + 1;
                self.push(result)
            }
            other => Err(VmError::NotCallable(other.type_name().to_string())),
        }
    }

    fn call_closure(&mut self, closure: Rc<ClosureObject>, num_args: usize) -> Result<(), VmError> {
        if num_args != closure.func.num_params {
            return Err(VmError::TypeMismatch(format!(
                "wrong number of arguments: want={}, got={}",
                closure.func.num_params, num_args
            )));
        }
        let num_locals = closure.func.num_locals;
        let base_pointer = self.sp - num_args;
        self.sp = base_pointer + num_locals;
        self.push_frame(Frame::new(closure, base_pointer))
    }

    fn push_closure(&mut self, const_index: usize, num_free: usize) -> Result<(), VmError> {
        let Object::CompiledFunction(func) = self.constants[const_index].clone() else {
            return Err(VmError::NotCallable(
                "constant is not a compiled function".to_string(),
            ));
        };

        let free = self.stack[self.sp - num_free..self.sp].to_vec();
        self.sp -= num_free;

        let closure = ClosureObject { func, free };
        self.push(Object::Closure(Rc::new(closure)))
    }
}

fn native_bool(value: bool) -> Object {
    if value {
        TRUE.clone()
    } else {
        FALSE.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn run_vm(input: &str) -> Object {
        let lexer = Lexer::new(input);
        let mut parser = Parser::new(lexer);
        let program = parser.parse_program();
        assert!(parser.errors().is_empty(), "{:?}", parser.errors());

        let mut compiler = Compiler::new();
        compiler.compile(&program).expect("compile should succeed");
        let bytecode = compiler.bytecode();

        let mut vm = Vm::new(bytecode);
        vm.run().expect("vm should run without error");
        vm.last_popped_stack_elem().clone()
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(run_vm("1"), Object::Integer(1));
        assert_eq!(run_vm("1 + 2"), Object::Integer(3));
        assert_eq!(run_vm("1 - 2"), Object::Integer(-1));
        assert_eq!(run_vm("2 * 2"), Object::Integer(4));
        assert_eq!(run_vm("4 / 2"), Object::Integer(2));
        assert_eq!(run_vm("50 / 2 * 2 + 10 - 5"), Object::Integer(55));
    }

    #[test]
    fn boolean_expressions() {
        assert_eq!(run_vm("true"), Object::Boolean(true));
        assert_eq!(run_vm("1 < 2"), Object::Boolean(true));
        assert_eq!(run_vm("1 > 2"), Object::Boolean(false));
        assert_eq!(run_vm("1 == 1"), Object::Boolean(true));
        assert_eq!(run_vm("(1 < 2) == true"), Object::Boolean(true));
        assert_eq!(run_vm("!true"), Object::Boolean(false));
        assert_eq!(run_vm("!5"), Object::Boolean(false));
        assert_eq!(run_vm("!!5"), Object::Boolean(true));
    }

    #[test]
    fn conditionals() {
        assert_eq!(run_vm("if (true) { 10 }"), Object::Integer(10));
        assert_eq!(run_vm("if (false) { 10 } else { 20 }"), Object::Integer(20));
        assert_eq!(run_vm("if (false) { 10 }"), Object::Null);
    }

    #[test]
    fn global_let_statements() {
        assert_eq!(run_vm("let one = 1; let two = 2; one + two"), Object::Integer(3));
    }

    #[test]
    fn string_expressions() {
        assert_eq!(run_vm(r#""mon" + "key""#), Object::Str("monkey".to_string()));
    }

    #[test]
    fn list_and_hash_literals() {
        assert_eq!(
            run_vm("[1, 2, 3][1]"),
            Object::Integer(2)
        );
        assert_eq!(run_vm(r#"{"one": 1}["one"]"#), Object::Integer(1));
    }

    #[test]
    fn calling_functions_without_arguments() {
        let input = "let fivePlusTen = fn() { 5 + 10; }; fivePlusTen();";
        assert_eq!(run_vm(input), Object::Integer(15));
    }

    #[test]
    fn calling_functions_with_bindings_and_arguments() {
        let input = "let identity = fn(a) { a; }; identity(4);";
        assert_eq!(run_vm(input), Object::Integer(4));
    }

    #[test]
    fn first_class_functions_and_closures() {
        let input = "let newAdder = fn(a) { fn(b) { a + b } }; let addTwo = newAdder(2); addTwo(3);";
        assert_eq!(run_vm(input), Object::Integer(5));
    }

    #[test]
    fn recursive_function_bound_in_outer_local_scope() {
        let input = "let wrapper = fn() {
            let countdown = fn(x) { if (x == 0) { 0 } else { countdown(x - 1) } };
            countdown(1);
        };
        wrapper();";
        assert_eq!(run_vm(input), Object::Integer(0));
    }

    #[test]
    fn builtin_functions_through_vm() {
        assert_eq!(run_vm(r#"len("four")"#), Object::Integer(4));
        assert_eq!(run_vm("len([1, 2, 3])"), Object::Integer(3));
    }

    #[test]
    fn stack_overflow_on_deep_recursion() {
        let input = "let overflow = fn() { overflow(); }; overflow();";
        let lexer = Lexer::new(input);
        let mut parser = Parser::new(lexer);
        let program = parser.parse_program();
        let mut compiler = Compiler::new();
        compiler.compile(&program).expect("compile should succeed");
        let mut vm = Vm::new(compiler.bytecode());
        assert_eq!(vm.run(), Err(VmError::StackOverflow));
    }
}
