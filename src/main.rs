use rill::{CliReporter, InterpretResult, Vm};
use rustyline::error::ReadlineError;
use rustyline::Editor;
use std::{env, fs, process};

fn main() {
    let mut args = env::args().skip(1);
    match (args.next(), args.next()) {
        (None, _) => repl(),
        (Some(path), None) => run_file(&path),
        _ => {
            eprintln!("Usage: rill [path]");
            process::exit(exitcode::USAGE);
        }
    }
}

fn repl() {
    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    let mut rl = Editor::<()>::new();

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                vm.interpret(&line, &mut reporter);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }
    }
}

fn run_file(path: &str) {
    let source = fs::read_to_string(path).unwrap_or_else(|err| {
        eprintln!("Could not read \"{path}\": {err}");
        process::exit(exitcode::IOERR);
    });

    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    match vm.interpret(&source, &mut reporter) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => process::exit(exitcode::DATAERR),
        InterpretResult::RuntimeError => process::exit(exitcode::SOFTWARE),
    }
}
