//! Tree-walking evaluator: one recursive `eval` over the AST, directly
//! against an `Environment` chain (no bytecode involved).

pub mod builtins;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{BlockStatement, Expression, IfExpression, InfixExpression, Program, Statement};
use crate::object::{Environment, FunctionObject, HashPair, Object, FALSE, NULL, TRUE};

pub fn eval_program(program: &Program, env: &Rc<RefCell<Environment>>) -> Object {
    let mut result = NULL.clone();

    for stmt in &program.statements {
        result = eval_statement(stmt, env);
        match result {
            Object::ReturnValue(value) => return *value,
            Object::Error(_) => return result,
            _ => {}
        }
    }

    result
}

fn eval_block_statement(block: &BlockStatement, env: &Rc<RefCell<Environment>>) -> Object {
    let mut result = NULL.clone();

    for stmt in &block.statements {
        result = eval_statement(stmt, env);
        if matches!(result, Object::ReturnValue(_) | Object::Error(_)) {
            return result;
        }
    }

    result
}

fn eval_statement(stmt: &Statement, env: &Rc<RefCell<Environment>>) -> Object {
    match stmt {
        Statement::Expression(stmt) => eval_expression(&stmt.expression, env),
        Statement::Return(stmt) => {
            let value = eval_expression(&stmt.value, env);
            if value.is_error() {
                value
            } else {
                Object::ReturnValue(Box::new(value))
            }
        }
        Statement::Let(stmt) => {
            let value = eval_expression(&stmt.value, env);
            if value.is_error() {
                return value;
            }
            env.borrow_mut().set(stmt.name.clone(), value);
            NULL.clone()
        }
        Statement::Block(block) => eval_block_statement(block, env),
    }
}

fn eval_expression(expr: &Expression, env: &Rc<RefCell<Environment>>) -> Object {
    match expr {
        Expression::IntegerLiteral(value) => Object::Integer(*value),
        Expression::Boolean(value) => native_bool(*value),
        Expression::StringLiteral(value) => Object::Str(value.clone()),
        Expression::Identifier(name) => eval_identifier(name, env),
        Expression::Prefix(expr) => {
            let right = eval_expression(&expr.right, env);
            if right.is_error() {
                return right;
            }
            eval_prefix_expression(&expr.operator, right)
        }
        Expression::Infix(expr) => eval_infix(expr, env),
        Expression::If(expr) => eval_if_expression(expr, env),
        Expression::Function(expr) => Object::Function(Rc::new(FunctionObject::from_expression(
            expr,
            env.clone(),
        ))),
        Expression::Call(expr) => {
            let function = eval_expression(&expr.function, env);
            if function.is_error() {
                return function;
            }
            let args = match eval_expressions(&expr.arguments, env) {
                Ok(args) => args,
                Err(err) => return err,
            };
            apply_function(function, &args)
        }
        Expression::ListLiteral(elements) => match eval_expressions(elements, env) {
            Ok(values) => Object::List(Rc::new(values)),
            Err(err) => err,
        },
        Expression::HashLiteral(pairs) => eval_hash_literal(pairs, env),
        Expression::Index(expr) => {
            let left = eval_expression(&expr.left, env);
            if left.is_error() {
                return left;
            }
            let index = eval_expression(&expr.index, env);
            if index.is_error() {
                return index;
            }
            eval_index_expression(left, index)
        }
    }
}

fn native_bool(value: bool) -> Object {
    if value {
        TRUE.clone()
    } else {
        FALSE.clone()
    }
}

fn eval_identifier(name: &str, env: &Rc<RefCell<Environment>>) -> Object {
    if let Some(value) = env.borrow().get(name) {
        return value;
    }
    if let Some(builtin) = builtins::get(name) {
        return Object::Builtin(builtin);
    }
    Object::Error(format!("identifier not found: {name}"))
}

fn eval_prefix_expression(operator: &str, right: Object) -> Object {
    match operator {
        "!" => native_bool(!right.is_truthy()),
        "-" => match right {
            Object::Integer(value) => Object::Integer(-value),
            other => Object::Error(format!("unknown operator: -{}", other.type_name())),
        },
        other => Object::Error(format!("unknown operator: {other}{}", right.type_name())),
    }
}

fn eval_infix(expr: &InfixExpression, env: &Rc<RefCell<Environment>>) -> Object {
    let left = eval_expression(&expr.left, env);
    if left.is_error() {
        return left;
    }
    let right = eval_expression(&expr.right, env);
    if right.is_error() {
        return right;
    }
    eval_infix_expression(&expr.operator, left, right)
}

fn eval_infix_expression(operator: &str, left: Object, right: Object) -> Object {
    match (&left, &right) {
        (Object::Integer(l), Object::Integer(r)) => eval_integer_infix(operator, *l, *r),
        (Object::Str(l), Object::Str(r)) => eval_string_infix(operator, l, r),
        _ if operator == "==" => native_bool(left == right),
        _ if operator == "!=" => native_bool(left != right),
        _ if left.type_name() != right.type_name() => Object::Error(format!(
            "type mismatch: {} {} {}",
            left.type_name(),
            operator,
            right.type_name()
        )),
        _ => Object::Error(format!(
            "unknown operator: {} {} {}",
            left.type_name(),
            operator,
            right.type_name()
        )),
    }
}

fn eval_integer_infix(operator: &str, left: i64, right: i64) -> Object {
    match operator {
        "+" => Object::Integer(left + right),
        "-" => Object::Integer(left - right),
        "*" => Object::Integer(left * right),
        "/" => Object::Integer(left / right),
        "<" => native_bool(left < right),
        ">" => native_bool(left > right),
        "==" => native_bool(left == right),
        "!=" => native_bool(left != right),
        other => Object::Error(format!("unknown operator: INTEGER {other} INTEGER")),
    }
}

fn eval_string_infix(operator: &str, left: &str, right: &str) -> Object {
    match operator {
        "+" => Object::Str(format!("{left}{right}")),
        "==" => native_bool(left == right),
        "!=" => native_bool(left != right),
        other => Object::Error(format!("unknown operator: STRING {other} STRING")),
    }
}

fn eval_if_expression(expr: &IfExpression, env: &Rc<RefCell<Environment>>) -> Object {
    let condition = eval_expression(&expr.condition, env);
    if condition.is_error() {
        return condition;
    }

    if condition.is_truthy() {
        eval_block_statement(&expr.consequence, env)
    } else if let Some(alternative) = &expr.alternative {
        eval_block_statement(alternative, env)
    } else {
        NULL.clone()
    }
}

fn eval_expressions(
    exprs: &[Expression],
    env: &Rc<RefCell<Environment>>,
) -> Result<Vec<Object>, Object> {
    let mut values = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let value = eval_expression(expr, env);
        if value.is_error() {
            return Err(value);
        }
        values.push(value);
    }
    Ok(values)
}

fn apply_function(function: Object, args: &[Object]) -> Object {
    match function {
        Object::Function(func) => {
            let extended_env = extend_function_env(&func, args);
            let evaluated = eval_block_statement(&func.body, &extended_env);
            unwrap_return_value(evaluated)
        }
        Object::Builtin(func) => func(args),
        other => Object::Error(format!("not a function: {}", other.type_name())),
    }
}

fn extend_function_env(func: &FunctionObject, args: &[Object]) -> Rc<RefCell<Environment>> {
    let env = Environment::enclosed(func.env.clone());
    for (param, arg) in func.parameters.iter().zip(args) {
        env.borrow_mut().set(param.clone(), arg.clone());
    }
    env
}

fn unwrap_return_value(obj: Object) -> Object {
    match obj {
        Object::ReturnValue(value) => *value,
        other => other,
    }
}

fn eval_hash_literal(pairs: &[(Expression, Expression)], env: &Rc<RefCell<Environment>>) -> Object {
    let mut map = HashMap::new();

    for (key_expr, value_expr) in pairs {
        let key = eval_expression(key_expr, env);
        if key.is_error() {
            return key;
        }
        let Some(hash_key) = key.hash_key() else {
            return Object::Error(format!("unusable as hash key: {}", key.type_name()));
        };

        let value = eval_expression(value_expr, env);
        if value.is_error() {
            return value;
        }

        map.insert(hash_key, HashPair { key, value });
    }

    Object::Hash(Rc::new(map))
}

fn eval_index_expression(left: Object, index: Object) -> Object {
    match (&left, &index) {
        (Object::List(elements), Object::Integer(i)) => {
            let i = *i;
            if i < 0 || i as usize >= elements.len() {
                NULL.clone()
            } else {
                elements[i as usize].clone()
            }
        }
        (Object::Hash(pairs), _) => {
            let Some(key) = index.hash_key() else {
                return Object::Error(format!("unusable as hash key: {}", index.type_name()));
            };
            pairs.get(&key).map(|pair| pair.value.clone()).unwrap_or(NULL.clone())
        }
        (left, _) => Object::Error(format!("index operator not supported: {}", left.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn eval(input: &str) -> Object {
        let lexer = Lexer::new(input);
        let mut parser = Parser::new(lexer);
        let program = parser.parse_program();
        assert!(parser.errors().is_empty(), "{:?}", parser.errors());
        let env = Environment::new();
        eval_program(&program, &env)
    }

    #[test]
    fn integer_expressions() {
        assert_eq!(eval("5"), Object::Integer(5));
        assert_eq!(eval("5 + 5 + 5 + 5 - 10"), Object::Integer(10));
        assert_eq!(eval("2 * 2 * 2 * 2 * 2"), Object::Integer(32));
        assert_eq!(eval("(5 + 10 * 2 + 15 / 3) * 2 + -10"), Object::Integer(50));
    }

    #[test]
    fn boolean_and_bang_expressions() {
        assert_eq!(eval("true"), Object::Boolean(true));
        assert_eq!(eval("1 < 2"), Object::Boolean(true));
        assert_eq!(eval("!true"), Object::Boolean(false));
        assert_eq!(eval("!!true"), Object::Boolean(true));
        assert_eq!(eval("!5"), Object::Boolean(false));
        assert_eq!(eval("!!5"), Object::Boolean(true));
    }

    #[test]
    fn if_else_expressions() {
        assert_eq!(eval("if (true) { 10 }"), Object::Integer(10));
        assert_eq!(eval("if (false) { 10 }"), Object::Null);
        assert_eq!(eval("if (1 < 2) { 10 } else { 20 }"), Object::Integer(10));
    }

    #[test]
    fn return_statements_short_circuit_nested_blocks() {
        let input = "if (10 > 1) {\n  if (10 > 1) {\n    return 10;\n  }\n  return 1;\n}";
        assert_eq!(eval(input), Object::Integer(10));
    }

    #[test]
    fn error_handling() {
        let cases = vec![
            ("5 + true;", "type mismatch: INTEGER + BOOLEAN"),
            ("-true", "unknown operator: -BOOLEAN"),
            ("true + false;", "unknown operator: BOOLEAN + BOOLEAN"),
            (
                "if (10 > 1) { true + false; }",
                "unknown operator: BOOLEAN + BOOLEAN",
            ),
            ("foobar", "identifier not found: foobar"),
        ];

        for (input, expected) in cases {
            match eval(input) {
                Object::Error(message) => assert_eq!(message, expected),
                other => panic!("expected error, got {other:?}"),
            }
        }
    }

    #[test]
    fn let_statements_bind_values() {
        assert_eq!(eval("let a = 5; a;"), Object::Integer(5));
        assert_eq!(eval("let a = 5 * 5; a;"), Object::Integer(25));
        assert_eq!(eval("let a = 5; let b = a; b;"), Object::Integer(5));
    }

    #[test]
    fn closures_capture_defining_environment() {
        let input = "let newAdder = fn(x) { fn(y) { x + y }; }; let addTwo = newAdder(2); addTwo(3);";
        assert_eq!(eval(input), Object::Integer(5));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(
            eval(r#""Hello" + " " + "World!""#),
            Object::Str("Hello World!".to_string())
        );
    }

    #[test]
    fn builtin_functions() {
        assert_eq!(eval(r#"len("")"#), Object::Integer(0));
        assert_eq!(eval(r#"len("four")"#), Object::Integer(4));
        assert_eq!(eval("len([1, 2, 3])"), Object::Integer(3));
        match eval("len(1)") {
            Object::Error(message) => {
                assert_eq!(message, "argument to `len` not supported, got INTEGER")
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn list_index_expressions() {
        assert_eq!(eval("[1, 2, 3][0]"), Object::Integer(1));
        assert_eq!(eval("[1, 2, 3][1 + 1]"), Object::Integer(3));
        assert_eq!(eval("[1, 2, 3][3]"), Object::Null);
        assert_eq!(eval("[1, 2, 3][-1]"), Object::Null);
    }

    #[test]
    fn empty_program_evaluates_to_null() {
        assert_eq!(eval(""), Object::Null);
    }
}
