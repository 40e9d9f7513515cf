use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use devmp::{Devirtualizer, ir};

#[derive(Parser)]
#[command(version, about = "Static devirtualizer for VMProtect-3-family x86-64 binaries")]
struct CliArgs {
    #[arg(value_name = "INPUT", help = "Path to the protected PE file.")]
    input: PathBuf,

    #[arg(short, long, help = "Enable verbose analysis tracing.")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    simplelog::TermLogger::init(
        if args.verbose {
            simplelog::LevelFilter::Trace
        }
        else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Stdout,
        simplelog::ColorChoice::Auto,
    )?;

    let buffer = fs::read(&args.input)
        .map_err(|e| format!("failed to read {}: {e}", args.input.display()))?;
    log::info!("loaded raw image of size 0x{:x}", buffer.len());

    let devirt = Devirtualizer::new(&buffer)?;

    let scan_results = devirt.scan_for_vmentry(".text");
    log::info!("found {} virtualized routines", scan_results.len());
    for result in &scan_results {
        log::info!(
            "  rva 0x{:x} vmentry 0x{:x} stub 0x{:x}",
            result.rva,
            result.job.vmentry_rva,
            result.job.entry_stub
        );
    }
    if scan_results.is_empty() {
        return Err("no virtualized routines found".into());
    }

    let output_dir = args.input.with_file_name("VMPAttack-Output");
    fs::create_dir_all(&output_dir)?;

    for result in &scan_results {
        log::info!("devirtualizing routine @ 0x{:x}...", result.rva);

        let Some(mut routine) = devirt.lift(&result.job)
        else {
            log::error!("lifting failed");
            continue;
        };
        log::info!("lifting success");
        fs::write(
            output_dir.join(format!("0x{:x}.vtil", result.rva)),
            routine.to_string(),
        )?;

        let removed = ir::opt::apply_all(&mut routine);
        log::info!("optimization success ({removed} ops removed)");
        fs::write(
            output_dir.join(format!("0x{:x}-Optimized.vtil", result.rva)),
            routine.to_string(),
        )?;
    }

    Ok(())
}
