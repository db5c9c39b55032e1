//! Small command-line browser for an OVN database.
//!
//! Every subcommand connects, waits for the replica to seed, runs one
//! read or one transaction, and exits. `monitor` stays attached and
//! prints entity events until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ovn_client::{
    Acl, Client, Config, LoadBalancer, LogicalRouter, LogicalSwitch, LogicalSwitchPort,
    SignalHandler, DB_NORTHBOUND,
};
use tracing_subscriber::EnvFilter;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "ovnctl")]
struct Args {
    /// Database to replicate.
    #[arg(long, default_value = DB_NORTHBOUND)]
    db: String,

    /// Comma-separated endpoints, e.g. `tcp:127.0.0.1:6641,tcp:127.0.0.2:6641`
    #[arg(long, env = "OVN_NB_ENDPOINTS", default_value = "tcp:127.0.0.1:6641")]
    endpoints: String,

    /// Connection and per-call timeout (milliseconds).
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Refuse servers that are not the raft leader.
    #[arg(long)]
    leader_only: bool,

    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// List logical switches.
    LsList,
    /// Create a logical switch.
    LsAdd { name: String },
    /// Delete a logical switch.
    LsDel { name: String },
    /// List the ports of a switch.
    LspList { switch: String },
    /// Create a port on a switch.
    LspAdd { switch: String, port: String },
    /// Delete a port from whichever switch holds it.
    LspDel { port: String },
    /// List the ACLs of a switch, highest priority first.
    AclList { switch: String },
    /// List logical routers.
    LrList,
    /// List load balancers.
    LbList,
    /// Print entity events as they happen, until interrupted.
    Monitor,
}

/// Event printer installed for the `monitor` subcommand.
struct PrintEvents;

impl SignalHandler for PrintEvents {
    fn on_logical_switch_create(&self, ls: &LogicalSwitch) {
        println!("+ switch {} ({})", ls.name, ls.uuid);
    }

    fn on_logical_switch_delete(&self, ls: &LogicalSwitch) {
        println!("- switch {} ({})", ls.name, ls.uuid);
    }

    fn on_logical_switch_port_create(&self, lsp: &LogicalSwitchPort) {
        println!("+ port {} ({})", lsp.name, lsp.uuid);
    }

    fn on_logical_switch_port_delete(&self, lsp: &LogicalSwitchPort) {
        println!("- port {} ({})", lsp.name, lsp.uuid);
    }

    fn on_acl_create(&self, acl: &Acl) {
        println!("+ acl {} {} {:?}", acl.direction, acl.priority, acl.match_);
    }

    fn on_acl_delete(&self, acl: &Acl) {
        println!("- acl {} {} {:?}", acl.direction, acl.priority, acl.match_);
    }

    fn on_logical_router_create(&self, lr: &LogicalRouter) {
        println!("+ router {} ({})", lr.name, lr.uuid);
    }

    fn on_logical_router_delete(&self, lr: &LogicalRouter) {
        println!("- router {} ({})", lr.name, lr.uuid);
    }

    fn on_load_balancer_create(&self, lb: &LoadBalancer) {
        println!("+ load balancer {} ({})", lb.name, lb.uuid);
    }

    fn on_load_balancer_delete(&self, lb: &LoadBalancer) {
        println!("- load balancer {} ({})", lb.name, lb.uuid);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(
        !args.endpoints.contains("ssl:"),
        "ssl endpoints need a client TLS configuration, which only the library API can supply"
    );

    let mut config = Config::new(&args.db, &args.endpoints)
        .timeout(Duration::from_millis(args.timeout_ms))
        .leader_only(args.leader_only);
    if matches!(args.cmd, Command::Monitor) {
        config = config.signal(Arc::new(PrintEvents)).reconnect(true);
    }

    let client = Client::connect(config)
        .await
        .with_context(|| format!("connect to {}", args.endpoints))?;

    let outcome = run(&client, args.cmd).await;
    client.close().await;
    outcome
}

async fn run(client: &Client, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::LsList => {
            for ls in client.ls_list().await {
                println!("{} {} ({} ports)", ls.uuid, ls.name, ls.ports.len());
            }
        }
        Command::LsAdd { name } => {
            let cmd = client.ls_add(&name).await?;
            client.execute([cmd]).await?;
            println!("created switch {name}");
        }
        Command::LsDel { name } => {
            let cmd = client.ls_del(&name).await?;
            client.execute([cmd]).await?;
            println!("deleted switch {name}");
        }
        Command::LspList { switch } => {
            for lsp in client.lsp_list(&switch).await? {
                let kind = if lsp.kind.is_empty() {
                    "vif"
                } else {
                    lsp.kind.as_str()
                };
                println!("{} {} [{}]", lsp.uuid, lsp.name, kind);
            }
        }
        Command::LspAdd { switch, port } => {
            let cmd = client.lsp_add(&switch, &port).await?;
            client.execute([cmd]).await?;
            println!("created port {port} on {switch}");
        }
        Command::LspDel { port } => {
            let cmd = client.lsp_del(&port).await?;
            client.execute([cmd]).await?;
            println!("deleted port {port}");
        }
        Command::AclList { switch } => {
            for acl in client.acl_list(&switch).await? {
                println!(
                    "{:>5} {:>10} {:?} => {}",
                    acl.priority, acl.direction, acl.match_, acl.action
                );
            }
        }
        Command::LrList => {
            for lr in client.lr_list().await {
                println!("{} {} ({} ports)", lr.uuid, lr.name, lr.ports.len());
            }
        }
        Command::LbList => {
            for lb in client.lb_list().await {
                let vips = lb
                    .vips
                    .iter()
                    .map(|(vip, backends)| format!("{vip} -> {backends}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{} {} [{vips}]", lb.uuid, lb.name);
            }
        }
        Command::Monitor => {
            eprintln!("watching {}; press ctrl-c to stop", client.db());
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
        }
    }
    Ok(())
}
