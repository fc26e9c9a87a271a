use clap::{Parser, ValueEnum};
use fncas::Formula;
use std::process;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Emit {
    /// Portable C source
    C,
    /// x86-64 NASM assembly
    Asm,
    /// Cranelift IR of the JIT backend
    Clif,
}

#[derive(Parser)]
#[command(name = "fncas-emit")]
#[command(about = "Generate evaluation code from mathematical expressions")]
#[command(version)]
struct Args {
    /// Mathematical expression, variables are assigned input slots alphabetically
    expression: String,

    /// Output format
    #[arg(long, value_enum, default_value_t = Emit::C)]
    emit: Emit,

    /// Evaluate at the given comma-separated point with the interpreter and the JIT
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    eval: Option<Vec<f64>>,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let formula = Formula::new(args.expression.as_str())?;

    let text = match args.emit {
        Emit::C => formula.source().text,
        Emit::Asm => formula.assembly().text,
        Emit::Clif => formula.clif()?,
    };
    println!("{text}");

    if let Some(values) = &args.eval {
        let interpreted = formula.eval(values)?;
        let jitted = formula.jit()?.eval(values)?;
        eprintln!("variables:   {}", formula.variables().join(", "));
        eprintln!("interpreter: {interpreted}");
        eprintln!("jit:         {jitted}");
    }

    Ok(())
}
