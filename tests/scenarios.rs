//! Feeds each concrete scenario through both back-ends and checks they
//! agree on the final printed value.

use fen_lang::compiler::Compiler;
use fen_lang::evaluator;
use fen_lang::lexer::Lexer;
use fen_lang::object::Environment;
use fen_lang::parser::Parser;
use fen_lang::vm::Vm;

fn run_tree_walker(input: &str) -> String {
    let lexer = Lexer::new(input);
    let mut parser = Parser::new(lexer);
    let program = parser.parse_program();
    assert!(parser.errors().is_empty(), "{:?}", parser.errors());

    let env = Environment::new();
    evaluator::eval_program(&program, &env).to_string()
}

fn run_vm(input: &str) -> String {
    let lexer = Lexer::new(input);
    let mut parser = Parser::new(lexer);
    let program = parser.parse_program();
    assert!(parser.errors().is_empty(), "{:?}", parser.errors());

    let mut compiler = Compiler::new();
    compiler.compile(&program).expect("compile should succeed");

    let mut vm = Vm::new(compiler.bytecode());
    vm.run().expect("vm should run without error");
    vm.last_popped_stack_elem().to_string()
}

fn assert_both_backends(input: &str, expected: &str) {
    assert_eq!(run_tree_walker(input), expected, "tree-walker mismatch for {input:?}");
    assert_eq!(run_vm(input), expected, "vm mismatch for {input:?}");
}

#[test]
fn simple_arithmetic() {
    assert_both_backends("1 + 2", "3");
}

#[test]
fn let_bindings_and_arithmetic() {
    assert_both_backends("let x = 5; let y = 10; x + y;", "15");
}

#[test]
fn string_concatenation() {
    assert_both_backends(r#""Hello" + " " + "World!""#, "Hello World!");
}

#[test]
fn function_calls_with_arguments() {
    assert_both_backends("let add = fn(a, b) { a + b }; add(3, 4);", "7");
}

#[test]
fn closures_curry_arguments() {
    assert_both_backends(
        "let newAdder = fn(x) { fn(y) { x + y }; }; let addTwo = newAdder(2); addTwo(3);",
        "5",
    );
}

#[test]
fn conditional_without_else_on_false_branch() {
    assert_both_backends("if (false) { 10 }", "null");
}

#[test]
fn conditional_with_else_takes_consequence_branch() {
    assert_both_backends("if (1 < 2) { 10 } else { 20 }", "10");
}

#[test]
fn conditional_with_else_takes_alternative_branch() {
    assert_both_backends("if (1 > 2) { 10 } else { 20 }", "20");
}

#[test]
fn list_indexing() {
    assert_both_backends("[1, 2, 3][1 + 1]", "3");
}

#[test]
fn recursive_fibonacci() {
    let input = "let fib = fn(n) { if (n < 2) { n } else { fib(n - 1) + fib(n - 2) } }; fib(10);";
    assert_both_backends(input, "55");
}

#[test]
fn empty_program_is_null() {
    assert_both_backends("", "null");
}

#[test]
fn bang_truthiness_chains() {
    assert_both_backends("!!true", "true");
    assert_both_backends("!5", "false");
    assert_both_backends("!!5", "true");
}
