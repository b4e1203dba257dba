//! xtask: Development tasks for rpmsg
//!
//! Run with: `cargo xtask <command>`

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use xshell::{cmd, Shell};

/// Fuzz targets in `fuzz/tests`, with what each one drives.
const FUZZ_TARGETS: &[(&str, &str)] = &[
    ("vring", "split vring offer/take/return/reclaim"),
    ("desc_ownership", "transmit descriptor claims and generations"),
    ("endpoint_registry", "endpoint binding against a reference set"),
    ("link_integration", "master/remote link over a deferred loopback"),
    ("header_codec", "16-byte message header decode/encode"),
];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for rpmsg")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests (workspace + fuzz harnesses)
    Test,
    /// Run fuzz tests with bolero
    Fuzz {
        /// Target to fuzz (e.g., "vring", "link_integration").
        /// If not specified, runs all fuzz harnesses in test mode (quick smoke test)
        target: Option<String>,
    },
    /// Run the ping-pong example with ring tracing
    Pingpong,
    /// Run clippy on all code
    Clippy,
    /// Check formatting
    Fmt {
        /// Fix formatting issues instead of just checking
        #[arg(long)]
        fix: bool,
    },
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // Find workspace root (where Cargo.toml with [workspace] lives)
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => std::path::PathBuf::from(dir),
        Err(_) => std::env::current_dir()?,
    };
    let workspace_root = manifest_dir
        .parent()
        .ok_or("xtask has no parent directory")?
        .to_path_buf();
    sh.change_dir(&workspace_root);

    match cli.command {
        Commands::Test => {
            println!("=== Running workspace tests ===");

            // Try nextest first, fall back to cargo test
            if cmd!(sh, "cargo nextest --version").quiet().run().is_ok() {
                println!("Using cargo-nextest");
                cmd!(sh, "cargo nextest run --workspace").run()?;
            } else {
                println!("cargo-nextest not found, using cargo test");
                cmd!(sh, "cargo test --workspace").run()?;
            }

            println!("\n=== Running fuzz harnesses (test mode) ===");
            sh.change_dir(workspace_root.join("fuzz"));
            cmd!(sh, "cargo test").run()?;

            println!("\n=== All tests passed ===");
        }
        Commands::Fuzz { target } => {
            sh.change_dir(workspace_root.join("fuzz"));

            if let Some(t) = target {
                if !FUZZ_TARGETS.iter().any(|(name, _)| *name == t) {
                    return Err(format!("unknown fuzz target: {t}").into());
                }
                println!("=== Fuzzing target: {t} ===");
                println!("Press Ctrl+C to stop.\n");

                // Check if cargo-bolero is installed
                if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
                    eprintln!("cargo-bolero not found. Install with:");
                    eprintln!("  cargo install cargo-bolero");
                    return Err("cargo-bolero not installed".into());
                }

                cmd!(sh, "cargo bolero test {t}").run()?;
            } else {
                println!("=== Running all fuzz harnesses in test mode ===");
                println!("(For real fuzzing, specify a target: cargo xtask fuzz vring)\n");
                println!("Available targets:");
                for (name, what) in FUZZ_TARGETS {
                    println!("  - {name:<18} ({what})");
                }
                println!();

                cmd!(sh, "cargo test").run()?;
            }
        }
        Commands::Pingpong => {
            let _log = sh.push_env("RUST_LOG", "rpmsg_transport_shm=debug");
            cmd!(sh, "cargo run -p rpmsg --example pingpong").run()?;
        }
        Commands::Clippy => {
            println!("=== Running clippy ===");
            cmd!(sh, "cargo clippy --workspace --all-features --all-targets -- -D warnings").run()?;

            println!("\n=== Clippy on fuzz crate ===");
            sh.change_dir(workspace_root.join("fuzz"));
            cmd!(sh, "cargo clippy --all-targets -- -D warnings").run()?;
        }
        Commands::Fmt { fix } => {
            if fix {
                println!("=== Fixing formatting ===");
                cmd!(sh, "cargo fmt --all").run()?;
            } else {
                println!("=== Checking formatting ===");
                cmd!(sh, "cargo fmt --all -- --check").run()?;
            }
        }
    }

    Ok(())
}
