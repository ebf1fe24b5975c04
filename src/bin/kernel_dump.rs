//! Kernel inspection tool.
//!
//! Generates one GEMM/BRGEMM or unary kernel and writes its code as raw
//! little-endian words or as an AArch64 ELF relocatable, so it can be
//! disassembled with `objdump -d` or `llvm-objdump -d`. Without `--out` the
//! instruction words are printed as hex, one per line.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tenjit::core::{write_elf, GenerationStats};
use tenjit::generator::{BrgemmGenerator, BrgemmShape, DType, GeneratedKernel, UnaryGenerator, UnaryOp};

#[derive(Parser)]
#[command(name = "kernel_dump", about = "Generate a tenjit kernel and dump its code", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Batch-reduce GEMM kernel: C += sum over batch of A * B
    Gemm {
        #[arg(long)]
        m: usize,
        #[arg(long)]
        n: usize,
        #[arg(long)]
        k: usize,
        /// Number of reduced (A, B) pairs
        #[arg(long, default_value_t = 1)]
        batch: usize,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Elementwise kernel: B := op(A)
    Unary {
        /// zero, identity, relu or transpose
        #[arg(long)]
        op: UnaryOp,
        #[arg(long)]
        m: usize,
        #[arg(long)]
        n: usize,
        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Args)]
struct OutputArgs {
    /// File to write the code to
    #[arg(short, long)]
    out: Option<PathBuf>,
    /// Write an ELF relocatable instead of raw words
    #[arg(long)]
    elf: bool,
}

fn dump(kernel: &dyn GeneratedKernel, output: &OutputArgs) -> Result<(), Box<dyn std::error::Error>> {
    let words = kernel.buffer().words();
    let name = kernel.symbol_name();
    match &output.out {
        Some(path) if output.elf => {
            let bytes = write_elf(&[(name.as_str(), words)])?;
            std::fs::write(path, bytes)?;
            log::info!("wrote {name} as ELF to {}", path.display());
        }
        Some(path) => {
            kernel.buffer().dump(path)?;
            log::info!("wrote {name} ({} words) to {}", words.len(), path.display());
        }
        None => {
            for word in words {
                println!("{word:08x}");
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut stats = GenerationStats::new();
    match cli.command {
        Command::Gemm { m, n, k, batch, output } => {
            let mut generator = BrgemmGenerator::new();
            let kernel = generator.generate(&BrgemmShape::brgemm(m, n, k, batch))?;
            let tiling = kernel.tiling();
            log::info!(
                "{}: tile {}x{} ({} full M tiles, M remainder {}), small tile {}x{}, {} words",
                kernel.symbol_name(),
                tiling.big.m,
                tiling.big.n,
                tiling.full_m_tiles,
                tiling.m_remainder,
                tiling.small.m,
                tiling.small.n,
                kernel.size_words()
            );
            dump(&kernel, &output)?;
            stats.merge(generator.stats());
        }
        Command::Unary { op, m, n, output } => {
            let mut generator = UnaryGenerator::new();
            let kernel = generator.generate(m, n, DType::F32, op)?;
            log::info!("{}: {} words", kernel.symbol_name(), kernel.size_words());
            dump(&kernel, &output)?;
            stats.merge(generator.stats());
        }
    }

    eprint!("{stats}");
    Ok(())
}
