//! `lox` - REPL and file-interpreter entry point.
//!
//! Usage:
//!   lox              # REPL, one persistent Vm across lines
//!   lox PATH         # interpret a file, then exit
//!   lox --trace ...  # print the operand stack before each instruction

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser as ClapParser;
use lox_runtime::{InterpretError, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(ClapParser)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A bytecode interpreter for a small dynamically-typed scripting language")]
struct Cli {
    /// Script to run. Omit to start the REPL.
    path: Option<PathBuf>,

    /// Print the operand stack before executing each instruction.
    #[arg(long)]
    trace: bool,
}

const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;
const EXIT_IO_ERROR: i32 = 74;

fn main() {
    let cli = Cli::parse();
    let mut vm = Vm::new();
    vm.set_trace(cli.trace);

    let code = match cli.path {
        Some(path) => run_file(&mut vm, &path),
        None => run_repl(&mut vm),
    };
    process::exit(code);
}

fn run_file(vm: &mut Vm, path: &PathBuf) -> i32 {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading {}: {}", path.display(), e);
            return EXIT_IO_ERROR;
        }
    };
    match vm.interpret(&source) {
        Ok(()) => 0,
        Err(InterpretError::Compile(errors)) => {
            for e in &errors {
                eprintln!("{e}");
            }
            EXIT_COMPILE_ERROR
        }
        Err(InterpretError::Runtime(e)) => {
            eprintln!("{e}");
            EXIT_RUNTIME_ERROR
        }
    }
}

fn run_repl(vm: &mut Vm) -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error starting the line editor: {e}");
            return EXIT_IO_ERROR;
        }
    };
    let history_path = dirs::home_dir().map(|home| home.join(".lox_history"));
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                // A parse or runtime error on one line never exits the REPL.
                match vm.interpret(&line) {
                    Ok(()) => {}
                    Err(InterpretError::Compile(errors)) => {
                        for e in &errors {
                            eprintln!("{e}");
                        }
                    }
                    Err(InterpretError::Runtime(e)) => eprintln!("{e}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Readline error: {e}");
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = editor.save_history(path);
    }
    0
}
