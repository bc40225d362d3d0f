use std::fs;
use std::io::{self, BufReader};
use std::process::ExitCode;

use clap::Parser as ClapParser;
use log::{error, info, LevelFilter};

use fen_lang::compiler::Compiler;
use fen_lang::evaluator;
use fen_lang::lexer::Lexer;
use fen_lang::object::Environment;
use fen_lang::parser::Parser;
use fen_lang::repl;
use fen_lang::vm::Vm;

/// A small dynamically-typed scripting language: tree-walking interpreter
/// and bytecode compiler & virtual machine, chosen at the command line.
#[derive(Debug, ClapParser)]
#[command(name = "fen", author, version, about)]
struct Cli {
    /// Start an interactive REPL.
    #[arg(short = 'i', long = "interactive", required_unless_present = "file")]
    interactive: bool,

    /// Run a script from this file.
    #[arg(short = 'f', long = "file", required_unless_present = "interactive")]
    file: Option<String>,

    /// Use the bytecode VM instead of the tree-walking evaluator.
    #[arg(long = "vm", default_value_t = true)]
    use_vm: bool,

    /// Increase logging verbosity (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn level_for(verbosity: u8) -> log::Level {
    match verbosity {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        _ => log::Level::Debug,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    simple_logger::init_with_level(level_for(cli.verbose)).ok();
    log::set_max_level(LevelFilter::Trace);

    // clap enforces at least one of -f/-i via `required_unless_present` above,
    // so reaching here with neither set is not possible.
    match &cli.file {
        Some(path) => run_file(path, cli.use_vm),
        None => run_repl(cli.use_vm),
    }
}

fn run_repl(use_vm: bool) -> ExitCode {
    info!("starting REPL (vm={use_vm})");
    let stdin = io::stdin();
    let stdout = io::stdout();
    match repl::start(BufReader::new(stdin.lock()), stdout.lock(), use_vm) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("repl error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_file(path: &str, use_vm: bool) -> ExitCode {
    info!("running {path} (vm={use_vm})");

    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            error!("could not read {path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let lexer = Lexer::new(source);
    let mut parser = Parser::new(lexer);
    let program = parser.parse_program();

    if !parser.errors().is_empty() {
        for err in parser.errors() {
            error!("{err}");
        }
        return ExitCode::FAILURE;
    }

    if use_vm {
        let mut compiler = Compiler::new();
        if let Err(err) = compiler.compile(&program) {
            error!("compilation failed: {err}");
            return ExitCode::FAILURE;
        }

        let mut vm = Vm::new(compiler.bytecode());
        if let Err(err) = vm.run() {
            error!("executing bytecode failed: {err}");
            return ExitCode::FAILURE;
        }
    } else {
        let env = Environment::new();
        let result = evaluator::eval_program(&program, &env);
        if result.is_error() {
            error!("{result}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
