//! Built-in functions shared (by name) between the tree-walking evaluator
//! and the VM's `OpGetBuiltin` table.

use std::rc::Rc;

use crate::object::{BuiltinFn, Object};

pub const NAMES: &[&str] = &["len", "first", "last", "rest", "push", "puts"];

pub fn get(name: &str) -> Option<BuiltinFn> {
    match name {
        "len" => Some(len),
        "first" => Some(first),
        "last" => Some(last),
        "rest" => Some(rest),
        "push" => Some(push),
        "puts" => Some(puts),
        _ => None,
    }
}

pub fn by_index(index: usize) -> Option<BuiltinFn> {
    NAMES.get(index).and_then(|name| get(name))
}

fn error(message: impl Into<String>) -> Object {
    Object::Error(message.into())
}

fn len(args: &[Object]) -> Object {
    if args.len() != 1 {
        return error(format!("wrong number of arguments. got={}, want=1", args.len()));
    }
    match &args[0] {
        Object::Str(s) => Object::Integer(s.len() as i64),
        Object::List(elements) => Object::Integer(elements.len() as i64),
        other => error(format!("argument to `len` not supported, got {}", other.type_name())),
    }
}

fn first(args: &[Object]) -> Object {
    if args.len() != 1 {
        return error(format!("wrong number of arguments. got={}, want=1", args.len()));
    }
    match &args[0] {
        Object::List(elements) => elements.first().cloned().unwrap_or(Object::Null),
        other => error(format!("argument to `first` must be LIST, got {}", other.type_name())),
    }
}

fn last(args: &[Object]) -> Object {
    if args.len() != 1 {
        return error(format!("wrong number of arguments. got={}, want=1", args.len()));
    }
    match &args[0] {
        Object::List(elements) => elements.last().cloned().unwrap_or(Object::Null),
        other => error(format!("argument to `last` must be LIST, got {}", other.type_name())),
    }
}

fn rest(args: &[Object]) -> Object {
    if args.len() != 1 {
        return error(format!("wrong number of arguments. got={}, want=1", args.len()));
    }
    match &args[0] {
        Object::List(elements) => {
            if elements.is_empty() {
                Object::Null
            } else {
                Object::List(Rc::new(elements[1..].to_vec()))
            }
        }
        other => error(format!("argument to `rest` must be LIST, got {}", other.type_name())),
    }
}

fn push(args: &[Object]) -> Object {
    if args.len() != 2 {
        return error(format!("wrong number of arguments. got={}, want=2", args.len()));
    }
    match &args[0] {
        Object::List(elements) => {
            let mut new_elements = (**elements).clone();
            new_elements.push(args[1].clone());
            Object::List(Rc::new(new_elements))
        }
        other => error(format!("argument to `push` must be LIST, got {}", other.type_name())),
    }
}

fn puts(args: &[Object]) -> Object {
    for arg in args {
        println!("{arg}");
    }
    Object::Null
}
