//! The mydocker command-line front-end.

use std::io::Write;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tabwriter::TabWriter;

use mydocker::cgroups::{ResourceOpts, Resources};
use mydocker::container::{self, engine, exec, scan, RunSpec};
use mydocker::network;
use mydocker::Runtime;

const ABOUT: &str = "A simple container runtime built on namespaces, \
cgroup v1, union mounts and virtual networking.";

#[derive(Parser)]
#[command(name = "mydocker", version, about = ABOUT)]
struct Cli {
    /// Print debug logs
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the user process inside the container. Never call it directly.
    #[command(hide = true)]
    Init,

    /// Create and start a new container
    Run(RunArgs),

    /// List containers
    Ps,

    /// Show a container's log output
    Logs {
        /// Follow the log output
        #[arg(short, long)]
        follow: bool,
        container: String,
    },

    /// Run a command inside a running container
    Exec {
        container: String,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Stop one or more containers
    Stop {
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Start one or more stopped containers
    Start {
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Restart one or more containers
    Restart {
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Remove one or more containers
    Rm {
        /// Stop the container first if it is running
        #[arg(short, long)]
        force: bool,
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Pull one or more images through the docker daemon
    Pull {
        #[arg(required = true)]
        images: Vec<String>,
    },

    /// Remove one or more images
    Rmi {
        #[arg(required = true)]
        images: Vec<String>,
    },

    /// List images
    Images,

    /// Manage container networks
    Network {
        #[command(subcommand)]
        command: NetworkCmd,
    },

    /// Show the full records of containers, networks or images
    Inspect {
        #[arg(required = true)]
        objects: Vec<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Run the container in the background
    #[arg(short, long)]
    detach: bool,

    /// Assign a name to the container
    #[arg(short, long)]
    name: Option<String>,

    /// Set the hostname inside the container
    #[arg(long)]
    hostname: Option<String>,

    /// DNS servers written to /etc/resolv.conf
    #[arg(long, default_values_t = ["8.8.8.8".to_string(), "8.8.4.4".to_string()])]
    dns: Vec<String>,

    /// The image to run (alternative to the positional IMAGE)
    #[arg(short, long)]
    image: Option<String>,

    /// Set environment variables, e.g. -e key=value
    #[arg(short, long = "env")]
    env: Vec<String>,

    /// Bind a host directory, e.g. -v /src:/dst
    #[arg(short, long = "volume")]
    volume: Vec<String>,

    /// Connect the container to a network (none to disable)
    #[arg(long = "net", alias = "network")]
    net: Vec<String>,

    /// Publish a port, e.g. -p 8080:80 (host:container)
    #[arg(short, long = "publish")]
    publish: Vec<String>,

    /// Storage driver to use
    #[arg(short = 's', long, default_value = mydocker::storage::OVERLAY)]
    storage_driver: String,

    #[command(flatten)]
    resources: ResourceOpts,

    /// IMAGE [CMD...]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    // The exec helper re-enters here with its target in the environment;
    // it never returns when that environment is present.
    exec::maybe_enter_namespace()?;

    let cli = Cli::parse();
    init_tracing(cli.debug);

    // The init subcommand runs inside the new namespaces and must not
    // touch host-side state.
    if let Cmd::Init = cli.command {
        return container::init::run_init().map_err(Into::into);
    }

    let mut rt = Runtime::new()?;
    rt.networks
        .init()
        .context("failed to initialize networks")?;

    match cli.command {
        Cmd::Init => unreachable!("handled above"),
        Cmd::Run(args) => cmd_run(&mut rt, args),
        Cmd::Ps => cmd_ps(&rt),
        Cmd::Logs { follow, container } => {
            let c = scan::get_container(&rt.layout, &container)?;
            engine::logs(&c, follow).map_err(Into::into)
        }
        Cmd::Exec { container, command } => {
            let code = exec::exec_in_container(&rt, &container, &command)?;
            std::process::exit(code);
        }
        Cmd::Stop { containers } => for_each_container(&mut rt, &containers, engine::stop),
        Cmd::Start { containers } => for_each_container(&mut rt, &containers, engine::start),
        Cmd::Restart { containers } => for_each_container(&mut rt, &containers, engine::restart),
        Cmd::Rm { force, containers } => cmd_rm(&mut rt, force, &containers),
        Cmd::Pull { images } => {
            for image in images {
                rt.images.pull(&image)?;
            }
            Ok(())
        }
        Cmd::Rmi { images } => {
            for image in images {
                rt.images.delete(&image)?;
            }
            Ok(())
        }
        Cmd::Images => cmd_images(&rt),
        Cmd::Network { command } => cmd_network(&mut rt, command),
        Cmd::Inspect { objects } => cmd_inspect(&rt, &objects),
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if debug { "mydocker=debug" } else { "mydocker=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_run(rt: &mut Runtime, args: RunArgs) -> anyhow::Result<()> {
    let (image, command) = match (&args.image, args.args.as_slice()) {
        (Some(image), rest) => (image.clone(), rest.to_vec()),
        (None, [image, rest @ ..]) => (image.clone(), rest.to_vec()),
        (None, []) => anyhow::bail!("missing image: use `run IMAGE [CMD...]` or -i IMAGE"),
    };

    let resources = Resources::from_opts(&args.resources)?;
    let spec = RunSpec {
        detach: args.detach,
        name: args.name,
        hostname: args.hostname,
        dns: args.dns,
        image,
        args: command,
        envs: args.env,
        volumes: args.volume,
        networks: args.net,
        publish: args.publish,
        storage_driver: args.storage_driver,
        resources,
    };

    let mut c = container::new_container(rt, spec)?;
    engine::run(rt, &mut c)?;
    if c.detach {
        println!("{}", c.uuid);
    }
    Ok(())
}

fn for_each_container(
    rt: &mut Runtime,
    identifiers: &[String],
    op: fn(&mut Runtime, &mut mydocker::container::Container) -> mydocker::Result<()>,
) -> anyhow::Result<()> {
    for identifier in identifiers {
        let mut c = scan::get_container(&rt.layout, identifier)?;
        op(rt, &mut c)?;
        println!("{}", c.uuid);
    }
    Ok(())
}

fn cmd_rm(rt: &mut Runtime, force: bool, identifiers: &[String]) -> anyhow::Result<()> {
    for identifier in identifiers {
        let mut c = scan::get_container(&rt.layout, identifier)?;
        if c.status == container::Status::Running && !force {
            anyhow::bail!(
                "the container {} is running; stop it first or use rm -f",
                c.name
            );
        }
        engine::delete(rt, &mut c)?;
        println!("{}", c.uuid);
    }
    Ok(())
}

fn cmd_ps(rt: &Runtime) -> anyhow::Result<()> {
    let mut tw = TabWriter::new(std::io::stdout());
    writeln!(
        tw,
        "CONTAINER ID\tNAME\tIMAGE\tSTATUS\tDRIVER\tPID\tCOMMAND\tIPS\tPORTS\tCREATED"
    )?;

    for c in scan::all_containers(&rt.layout)? {
        let ips = c
            .endpoints
            .iter()
            .map(|ep| ep.ip.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let ports = c
            .ports
            .iter()
            .map(|(out, inner)| format!("{out}->{inner}"))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            c.uuid,
            c.name,
            c.image,
            c.status,
            c.storage_driver,
            c.cgroups.pid,
            c.commands.join(" "),
            ips,
            ports,
            c.created.format("%Y-%m-%d %H:%M:%S"),
        )?;
    }

    tw.flush()?;
    Ok(())
}

fn cmd_images(rt: &Runtime) -> anyhow::Result<()> {
    let mut tw = TabWriter::new(std::io::stdout());
    writeln!(tw, "IMAGE ID\tREPO:TAG\tSIZE\tCOUNTS\tCREATED")?;
    for img in rt.images.list() {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            img.uuid,
            img.repo_tag,
            img.size,
            img.counts,
            img.created.format("%Y-%m-%d %H:%M:%S"),
        )?;
    }
    tw.flush()?;
    Ok(())
}

#[derive(Subcommand)]
enum NetworkCmd {
    /// Create a new network
    Create {
        /// The network driver to use
        #[arg(short, long, default_value = network::BRIDGE)]
        driver: String,

        /// The subnet CIDR, e.g. 10.20.30.0/24
        #[arg(short, long)]
        subnet: String,

        name: String,
    },

    /// Remove one or more networks
    Rm {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// List networks
    Ls,

    /// Connect a running container to a network
    Connect { network: String, container: String },

    /// Disconnect a container from a network
    Disconnect { network: String, container: String },
}

fn cmd_network(rt: &mut Runtime, command: NetworkCmd) -> anyhow::Result<()> {
    match command {
        NetworkCmd::Create {
            driver,
            subnet,
            name,
        } => {
            let subnet = subnet
                .parse()
                .with_context(|| format!("bad subnet {subnet:?}"))?;
            rt.networks.create_network(&name, &driver, subnet)?;
            println!("{name}");
            Ok(())
        }
        NetworkCmd::Rm { names } => {
            for name in names {
                rt.networks.delete_network(&name)?;
                println!("{name}");
            }
            Ok(())
        }
        NetworkCmd::Ls => {
            let mut tw = TabWriter::new(std::io::stdout());
            writeln!(tw, "NAME\tSUBNET\tGATEWAY\tCOUNTS\tDRIVER\tCREATED")?;
            for nw in rt.networks.list() {
                writeln!(
                    tw,
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    nw.name,
                    nw.subnet,
                    nw.gateway,
                    nw.counts,
                    nw.driver,
                    nw.created.format("%Y-%m-%d %H:%M:%S"),
                )?;
            }
            tw.flush()?;
            Ok(())
        }
        NetworkCmd::Connect { network, container } => {
            let mut c = scan::get_container(&rt.layout, &container)?;
            engine::connect_network(rt, &mut c, &network)?;
            Ok(())
        }
        NetworkCmd::Disconnect { network, container } => {
            let mut c = scan::get_container(&rt.layout, &container)?;
            engine::disconnect_network(rt, &mut c, &network)?;
            Ok(())
        }
    }
}

fn cmd_inspect(rt: &Runtime, objects: &[String]) -> anyhow::Result<()> {
    for object in objects {
        if let Ok(c) = scan::get_container(&rt.layout, object) {
            println!("{}", serde_json::to_string_pretty(&c)?);
            continue;
        }
        if let Ok(nw) = rt.networks.get(object) {
            println!("{}", serde_json::to_string_pretty(nw)?);
            continue;
        }
        if let Ok(img) = rt.images.get_by_name_or_uuid(object) {
            println!("{}", serde_json::to_string_pretty(img)?);
            continue;
        }
        eprintln!("no such mydocker object: {object}");
    }
    Ok(())
}
