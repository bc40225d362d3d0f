//! Interactive read-eval-print loop over either execution back-end.

use std::io::{self, BufRead, Write};

use crate::compiler::{new_symbol_table, Compiler};
use crate::evaluator;
use crate::lexer::Lexer;
use crate::object::{Environment, Object};
use crate::parser::Parser;
use crate::vm::Vm;

const PROMPT: &str = ">> ";

pub fn start(mut input: impl BufRead, mut output: impl Write, use_vm: bool) -> io::Result<()> {
    let env = Environment::new();
    let mut globals = Vm::new_globals();
    let mut symbol_table = new_symbol_table();
    let mut constants: Vec<Object> = Vec::new();

    loop {
        write!(output, "{PROMPT}")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(());
        }

        let lexer = Lexer::new(line);
        let mut parser = Parser::new(lexer);
        let program = parser.parse_program();

        if !parser.errors().is_empty() {
            print_parse_errors(&mut output, parser.errors())?;
            continue;
        }

        if use_vm {
            let mut compiler = Compiler::new_with_state(
                std::mem::take(&mut symbol_table),
                std::mem::take(&mut constants),
            );
            let compile_result = compiler.compile(&program);
            let bytecode = compiler.bytecode();
            (symbol_table, constants) = compiler.into_symbol_table_and_constants();

            if let Err(err) = compile_result {
                writeln!(output, "Woops! Compilation failed:\n {err}\n")?;
                continue;
            }

            let mut machine = Vm::with_globals(bytecode, std::mem::take(&mut globals));
            if let Err(err) = machine.run() {
                globals = machine.take_globals();
                writeln!(output, "Woops! Executing bytecode failed:\n {err}\n")?;
                continue;
            }

            let result = machine.last_popped_stack_elem().clone();
            globals = machine.take_globals();
            writeln!(output, "{result}")?;
        } else {
            let result = evaluator::eval_program(&program, &env);
            writeln!(output, "{result}")?;
        }
    }
}

fn print_parse_errors(
    output: &mut impl Write,
    errors: &[crate::parser::ParseError],
) -> io::Result<()> {
    for err in errors {
        writeln!(output, "\t{err}")?;
    }
    Ok(())
}
