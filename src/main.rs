use clap::{Parser, ValueEnum};
use jlite::ir::lower::OperandOrder;
use jlite::{ir, Options};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    Asm,
    Ir3,
}

/// Compile a JLite program to ARM assembly.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Source file to compile.
    input: PathBuf,

    /// Run constant propagation and dead-code elimination on IR3.
    #[arg(short = 'O', long)]
    optimize: bool,

    #[arg(short, long, default_value = "program.s")]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = Emit::Asm)]
    emit: Emit,

    /// Emit the left operand of binary expressions first.
    #[arg(long)]
    left_first: bool,

    /// Run the IR3 program on standard input instead of writing output.
    #[arg(long)]
    interpret: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let options = Options {
        optimize: args.optimize,
        operand_order: if args.left_first { OperandOrder::LeftFirst } else { OperandOrder::RightFirst },
    };

    let source = fs::read_to_string(&args.input).unwrap_or_else(|err| {
        eprintln!("Error reading {}: {err}", args.input.display());
        process::exit(1);
    });

    let program = jlite::build_ir(&source, &options).unwrap_or_else(|err| {
        eprintln!("{err}");
        process::exit(1);
    });

    if args.interpret {
        let mut input = String::new();
        io::stdin().read_to_string(&mut input).unwrap_or_else(|err| {
            eprintln!("Error reading standard input: {err}");
            process::exit(1);
        });
        let lines = ir::interp::run(&program, &input).unwrap_or_else(|err| {
            eprintln!("Runtime error: {err}");
            process::exit(1);
        });
        for line in lines {
            println!("{line}");
        }
        return;
    }

    let output = match args.emit {
        Emit::Ir3 => program.to_string(),
        Emit::Asm => jlite::backend::generate(&program).unwrap_or_else(|err| {
            eprintln!("Error during code generation: {err}");
            process::exit(1);
        }),
    };

    fs::write(&args.output, &output).unwrap_or_else(|err| {
        eprintln!("Error writing {}: {err}", args.output.display());
        process::exit(1);
    });

    print!("{output}");
}
