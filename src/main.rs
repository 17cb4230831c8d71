use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use vmm::config::{default_base_dir, HOME_ENV};
use vmm::mount::parse_mount_spec;
use vmm::tracing::{init_tracing, shutdown_tracing};
use vmm::vm::PortForward;
use vmm::{Backends, Config, CreateOptions, Paths, VMManager, VMRecord};

#[derive(Parser)]
#[command(name = "vmm")]
#[command(about = "Manage Firecracker microVMs on this host", long_about = None)]
struct Cli {
    /// State directory (defaults to ~/.vmm of the invoking user)
    #[arg(long, env = HOME_ENV, global = true)]
    home: Option<PathBuf>,

    /// OTLP collector endpoint for trace export
    #[arg(long, env = "VMM_OTLP_ENDPOINT", global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Define a new VM without allocating anything
    Create {
        name: String,
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory in MiB
        #[arg(long)]
        memory: Option<u32>,
        /// Disk size in MiB
        #[arg(long)]
        disk: Option<u32>,
        /// host_path:tag[:ro|rw], repeatable
        #[arg(long = "mount", value_name = "SPEC")]
        mounts: Vec<String>,
        /// host_port:guest_port[/tcp|udp], repeatable
        #[arg(long = "port", value_name = "SPEC")]
        ports: Vec<String>,
        /// Public key installed for root in the guest
        #[arg(long)]
        ssh_key: Option<PathBuf>,
    },
    /// Boot a created or stopped VM
    Start { name: String },
    /// Shut a running VM down
    Stop { name: String },
    /// Remove a stopped VM and its disks
    Delete { name: String },
    /// Show one VM
    Show { name: String },
    /// List all VMs
    List,
    /// Kernel and rootfs images
    Images {
        #[command(subcommand)]
        command: ImagesCommands,
    },
}

#[derive(Subcommand)]
enum ImagesCommands {
    /// List installed kernels and base root filesystems
    List,
    /// Download the default kernel and rootfs if missing
    Pull,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = Paths::new(cli.home.clone().unwrap_or_else(default_base_dir));
    let config = Config::load(&paths.base)?;

    let otlp_endpoint = cli.otlp_endpoint.clone().or_else(|| config.otlp_endpoint.clone());
    init_tracing("vmm", otlp_endpoint.as_deref())
        .map_err(|e| anyhow::anyhow!("initializing tracing: {}", e))?;

    let result = run(cli, paths, config).await;
    shutdown_tracing();

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli, paths: Paths, config: Config) -> Result<()> {
    paths.ensure()?;
    let manager = VMManager::new(paths, config.clone(), Backends::system(&config));

    match cli.command {
        Commands::Create {
            name,
            cpus,
            memory,
            disk,
            mounts,
            ports,
            ssh_key,
        } => {
            let mounts = mounts
                .iter()
                .map(|spec| parse_mount_spec(spec))
                .collect::<vmm::Result<Vec<_>>>()?;
            let port_forwards = ports
                .iter()
                .map(|spec| PortForward::parse(spec))
                .collect::<vmm::Result<Vec<_>>>()?;

            let record = manager.create(
                &name,
                CreateOptions {
                    cpus,
                    memory_mb: memory,
                    disk_mb: disk,
                    mounts,
                    port_forwards,
                    ssh_key_path: ssh_key,
                },
            )?;
            println!("Created VM '{}' ({})", record.name, record.id);
        }
        Commands::Start { name } => {
            let record = manager.start(&name).await?;
            println!(
                "Started VM '{}' (pid {}, ip {})",
                record.name,
                record.pid,
                display_opt(record.ip_address)
            );
        }
        Commands::Stop { name } => {
            let record = manager.stop(&name).await?;
            println!("VM '{}' is {}", record.name, record.state);
        }
        Commands::Delete { name } => {
            manager.delete(&name)?;
            println!("Deleted VM '{}'", name);
        }
        Commands::Show { name } => {
            let record = manager.get(&name)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("serializing VM record")?
            );
        }
        Commands::List => {
            let records = manager.list()?;
            print_table(&records);
        }
        Commands::Images { command } => match command {
            ImagesCommands::List => {
                println!("Kernels:");
                for name in manager.images().list_kernels()? {
                    println!("  {}", name);
                }
                println!("Root filesystems:");
                for name in manager.images().list_rootfs()? {
                    println!("  {}", name);
                }
            }
            ImagesCommands::Pull => {
                manager
                    .images()
                    .ensure_default_images(&config.kernel_url, &config.rootfs_url)
                    .await?;
                println!("Default images are in place");
            }
        },
    }

    Ok(())
}

fn print_table(records: &[VMRecord]) {
    println!(
        "{:<20} {:<9} {:>4} {:>7} {:<15} {:>8}",
        "NAME", "STATE", "CPUS", "MEM", "IP", "PID"
    );
    for r in records {
        println!(
            "{:<20} {:<9} {:>4} {:>6}M {:<15} {:>8}",
            r.name,
            r.state.to_string(),
            r.cpus,
            r.memory_mb,
            display_opt(r.ip_address),
            if r.pid == 0 { "-".to_string() } else { r.pid.to_string() }
        );
    }
}

fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
