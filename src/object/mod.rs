//! Runtime values shared by both the tree-walking evaluator and the VM.

mod environment;

pub use environment::Environment;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use once_cell::sync::Lazy;

use crate::ast::{BlockStatement, FunctionExpression};
use crate::code::Instructions;

pub static TRUE: Lazy<Object> = Lazy::new(|| Object::Boolean(true));
pub static FALSE: Lazy<Object> = Lazy::new(|| Object::Boolean(false));
pub static NULL: Lazy<Object> = Lazy::new(|| Object::Null);

pub type BuiltinFn = fn(&[Object]) -> Object;

#[derive(Debug, Clone)]
pub enum Object {
    Integer(i64),
    Boolean(bool),
    Str(String),
    Null,
    ReturnValue(Box<Object>),
    Error(String),
    Function(Rc<FunctionObject>),
    CompiledFunction(Rc<CompiledFunctionObject>),
    Closure(Rc<ClosureObject>),
    Builtin(BuiltinFn),
    List(Rc<Vec<Object>>),
    Hash(Rc<HashMap<HashKey, HashPair>>),
}

#[derive(Debug, Clone)]
pub struct FunctionObject {
    pub parameters: Vec<String>,
    pub body: BlockStatement,
    pub env: Rc<RefCell<Environment>>,
}

impl FunctionObject {
    pub fn from_expression(expr: &FunctionExpression, env: Rc<RefCell<Environment>>) -> Self {
        FunctionObject {
            parameters: expr.parameters.clone(),
            body: expr.body.clone(),
            env,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledFunctionObject {
    pub instructions: Instructions,
    pub num_locals: usize,
    pub num_params: usize,
}

#[derive(Debug, Clone)]
pub struct ClosureObject {
    pub func: Rc<CompiledFunctionObject>,
    pub free: Vec<Object>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Integer(i64),
    Boolean(bool),
    Str(String),
}

#[derive(Debug, Clone)]
pub struct HashPair {
    pub key: Object,
    pub value: Object,
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::Integer(_) => "INTEGER",
            Object::Boolean(_) => "BOOLEAN",
            Object::Str(_) => "STRING",
            Object::Null => "NULL",
            Object::ReturnValue(_) => "RETURN_VALUE",
            Object::Error(_) => "ERROR",
            Object::Function(_) => "FUNCTION",
            Object::CompiledFunction(_) => "COMPILED_FUNCTION_OBJ",
            Object::Closure(_) => "CLOSURE",
            Object::Builtin(_) => "BUILTIN",
            Object::List(_) => "LIST",
            Object::Hash(_) => "HASH",
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Object::Boolean(false) | Object::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Object::Error(_))
    }

    pub fn hash_key(&self) -> Option<HashKey> {
        match self {
            Object::Integer(value) => Some(HashKey::Integer(*value)),
            Object::Boolean(value) => Some(HashKey::Boolean(*value)),
            Object::Str(value) => Some(HashKey::Str(value.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Integer(value) => write!(f, "{value}"),
            Object::Boolean(value) => write!(f, "{value}"),
            Object::Str(value) => write!(f, "{value}"),
            Object::Null => write!(f, "null"),
            Object::ReturnValue(value) => write!(f, "{value}"),
            Object::Error(message) => write!(f, "ERROR: {message}"),
            Object::Function(func) => {
                write!(f, "fn({}) {{\n{}\n}}", func.parameters.join(", "), func.body)
            }
            Object::CompiledFunction(func) => write!(f, "CompiledFunction[{:p}]", Rc::as_ptr(func)),
            Object::Closure(closure) => write!(f, "Closure[{:p}]", Rc::as_ptr(&closure.func)),
            Object::Builtin(_) => write!(f, "builtin function"),
            Object::List(elements) => {
                let items: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Object::Hash(pairs) => {
                let items: Vec<String> = pairs
                    .values()
                    .map(|pair| format!("{}: {}", pair.key, pair.value))
                    .collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Object::Integer(a), Object::Integer(b)) => a == b,
            (Object::Boolean(a), Object::Boolean(b)) => a == b,
            (Object::Str(a), Object::Str(b)) => a == b,
            (Object::Null, Object::Null) => true,
            _ => false,
        }
    }
}
