// Luno CLI
// Usage: luno [FILE] [OPTIONS]

use clap::Parser;
use colored::*;
use std::fs;
use std::path::PathBuf;

use luno::binary;
use luno::compiler;
use luno::lexer::Lexer;
use luno::Vm;

/// Luno - a small embeddable scripting language
#[derive(Parser)]
#[command(name = "luno")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A small embeddable scripting language", long_about = None)]
struct Cli {
    /// Source file to run (.luno or .lunoc)
    file: Option<PathBuf>,

    /// Debug options: tokens, asm (comma-separated)
    #[arg(short = 'd', long = "debug", value_delimiter = ',')]
    debug: Option<Vec<String>>,

    /// Execute inline code
    #[arg(short = 'e', long = "exec")]
    exec: Option<String>,

    /// Compile to .lunoc instead of running
    #[arg(short = 'c', long = "compile")]
    compile: bool,

    /// Check for errors without running
    #[arg(long = "check")]
    check: bool,

    /// Output path for compiled file (requires -c)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let debug = DebugFlags::from_options(&cli.debug);

    let result = if let Some(code) = cli.exec {
        handle_exec(&code, debug)
    } else if let Some(path) = cli.file {
        if cli.check {
            handle_check(&path)
        } else if cli.compile {
            handle_compile(&path, debug, cli.output)
        } else {
            handle_run(&path, debug)
        }
    } else {
        Err("no input: pass a file or use -e 'code'".to_string())
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

#[derive(Default, Clone, Copy)]
struct DebugFlags {
    tokens: bool,
    asm: bool,
}

impl DebugFlags {
    fn from_options(opts: &Option<Vec<String>>) -> Self {
        let mut flags = Self::default();
        if let Some(opts) = opts {
            for opt in opts {
                match opt.as_str() {
                    "tokens" => flags.tokens = true,
                    "asm" => flags.asm = true,
                    _ => eprintln!("{} Unknown debug option: {}", "!".yellow(), opt),
                }
            }
        }
        flags
    }
}

fn read_source(path: &PathBuf) -> Result<(String, String), String> {
    let source = fs::read_to_string(path)
        .map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
    Ok((source, path.to_string_lossy().to_string()))
}

fn dump_tokens(source: &str, file_name: &str) -> Result<(), String> {
    println!("{}", "-- Tokens --".cyan());
    let mut lexer = Lexer::new(source, file_name);
    loop {
        let token = lexer.next_token().map_err(|e| e.to_string())?;
        if token.is_eof() {
            break;
        }
        println!("  {:>4}  {:?}", token.span.start.line, token.kind);
    }
    Ok(())
}

fn handle_exec(code: &str, debug: DebugFlags) -> Result<(), String> {
    if debug.tokens {
        return dump_tokens(code, "=(command line)");
    }
    let proto = compiler::Parser::compile(code, "=(command line)").map_err(|e| e.to_string())?;
    if debug.asm {
        print!("{}", proto.disassemble());
        return Ok(());
    }
    Vm::new().execute(proto, &[]).map_err(|e| e.to_string())?;
    Ok(())
}

/// Check a file for errors without running it.
fn handle_check(path: &PathBuf) -> Result<(), String> {
    let (source, file_name) = read_source(path)?;
    compiler::Parser::compile(&source, &file_name).map_err(|e| e.to_string())?;
    println!("{} No errors found in {}", "✓".green(), path.display());
    Ok(())
}

fn handle_compile(
    path: &PathBuf,
    debug: DebugFlags,
    output: Option<PathBuf>,
) -> Result<(), String> {
    let (source, file_name) = read_source(path)?;
    if debug.tokens {
        return dump_tokens(&source, &file_name);
    }
    let proto = compiler::Parser::compile(&source, &file_name).map_err(|e| e.to_string())?;
    if debug.asm {
        print!("{}", proto.disassemble());
        return Ok(());
    }

    let output_path = output.unwrap_or_else(|| path.with_extension("lunoc"));
    let bytes = binary::serialize(&proto);
    fs::write(&output_path, bytes).map_err(|e| format!("cannot write file: {}", e))?;
    println!("{} Compiled to {}", "✓".green(), output_path.display());
    Ok(())
}

fn handle_run(path: &PathBuf, debug: DebugFlags) -> Result<(), String> {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");

    let proto = if ext == "lunoc" {
        let data =
            fs::read(path).map_err(|e| format!("cannot read '{}': {}", path.display(), e))?;
        binary::deserialize(&data).map_err(|e| e.to_string())?
    } else {
        let (source, file_name) = read_source(path)?;
        if debug.tokens {
            return dump_tokens(&source, &file_name);
        }
        compiler::Parser::compile(&source, &file_name).map_err(|e| e.to_string())?
    };

    if debug.asm {
        print!("{}", proto.disassemble());
        return Ok(());
    }

    Vm::new().execute(proto, &[]).map_err(|e| e.to_string())?;
    Ok(())
}
