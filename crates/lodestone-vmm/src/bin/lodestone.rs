//! Lodestone CLI — boot a flat guest image under KVM

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use lodestone_vmm::config::{ConfigError, VmConfig};
use lodestone_vmm::exit::LogTracer;
use lodestone_vmm::loader::FlatImage;
use lodestone_vmm::vm::{Vm, VmError};
use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Vm(#[from] VmError),
}

#[derive(Parser)]
#[command(name = "lodestone")]
#[command(about = "Run a guest on the Lodestone KVM monitor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct MachineArgs {
    /// JSON machine configuration (default: built-in machine)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of VCPUs
    #[arg(long)]
    vcpus: Option<u32>,

    /// Guest RAM in MiB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Trace every device access
    #[arg(long)]
    debug: bool,

    /// Never promote hot write addresses to eventfd doorbells
    #[arg(long)]
    no_eventfds: bool,

    /// Writes to one address before it becomes a doorbell
    #[arg(long)]
    threshold: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a flat image and run until every VCPU stops
    Run {
        #[command(flatten)]
        machine: MachineArgs,

        /// Flat binary loaded at the first free page below 64 KiB
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Single-step and log every instruction
        #[arg(long)]
        trace: bool,

        /// Write the final register and device state here
        #[arg(long)]
        state_out: Option<PathBuf>,
    },

    /// Print the effective configuration as JSON
    ShowConfig {
        #[command(flatten)]
        machine: MachineArgs,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            machine,
            image,
            trace,
            state_out,
        } => cmd_run(&machine, image.as_deref(), trace, state_out.as_deref()),
        Commands::ShowConfig { machine } => cmd_show_config(&machine),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn build_config(args: &MachineArgs) -> Result<VmConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => VmConfig::from_file(path)?,
        None => VmConfig::default(),
    };
    if let Some(vcpus) = args.vcpus {
        config.vcpus = vcpus;
    }
    if let Some(mb) = args.memory_mb {
        config.set_memory_size(mb << 20);
    }
    config.debug |= args.debug;
    if args.no_eventfds {
        config.eventfds.enabled = false;
    }
    if let Some(threshold) = args.threshold {
        config.eventfds.threshold = threshold;
    }
    config.validate()?;
    Ok(config)
}

fn cmd_run(
    args: &MachineArgs,
    image: Option<&Path>,
    trace: bool,
    state_out: Option<&Path>,
) -> Result<(), CliError> {
    let config = build_config(args)?;
    let mut vm = Vm::new(config)?;

    if let Some(path) = image {
        let image = FlatImage::from_file(path).map_err(VmError::from)?;
        let entry = vm.load_image(&image)?;
        info!("loaded {} at {entry:#x}", path.display());
    }
    if trace {
        vm.set_tracer(Arc::new(LogTracer));
        for control in vm.vcpus() {
            control.set_single_step(true);
        }
    }

    vm.run()?;

    if let Some(path) = state_out {
        let state = vm.snapshot()?;
        state.save(path).map_err(VmError::from)?;
        info!("state written to {}", path.display());
    }
    Ok(())
}

fn cmd_show_config(args: &MachineArgs) -> Result<(), CliError> {
    let config = build_config(args)?;
    println!("{}", config.to_json()?);
    Ok(())
}
