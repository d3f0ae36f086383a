// trellisctl - admin command line for a Trellis registry

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use trellis_client::{AdminClient, HttpClientConfig, TrellisHttpClient};
use trellis_common::api::TopologyRequest;
use trellis_common::{DEFAULT_NETWORK, Pool, ServiceRecord, TicketKind};
use trellis_server::middleware::{JwtAuthenticator, Role};

#[derive(Debug, Parser)]
#[command(name = "trellisctl", version, about = "Manage a Trellis registry")]
struct Cli {
    /// Registry base URL; repeat for failover
    #[arg(
        short = 's',
        long = "server",
        env = "TRELLIS_SERVER",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:8848"
    )]
    servers: Vec<String>,
    /// Admin bearer token
    #[arg(long = "token", env = "TRELLIS_TOKEN")]
    token: Option<String>,
    #[arg(short = 'n', long = "network", default_value = DEFAULT_NETWORK)]
    network: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List service records
    List {
        /// List every network instead of --network
        #[arg(long)]
        all: bool,
    },
    /// Issue a one-time provisioning URL
    Provision {
        #[command(subcommand)]
        kind: ProvisionKind,
    },
    /// Inspect or drop provisioning tickets
    Tickets {
        #[command(subcommand)]
        action: Option<TicketAction>,
    },
    /// Make a mirror the leader of its cluster
    Promote(TopologyArgs),
    /// Hand leadership of a cluster to another member
    Demote(TopologyArgs),
    /// Manage pools
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
    /// Mint a bearer token from the registry secret
    Token {
        sub: String,
        #[arg(long, default_value = "admin")]
        role: String,
        #[arg(long, env = "TRELLIS_JWT_SECRET")]
        secret: String,
        #[arg(long, default_value_t = 18_000)]
        ttl_seconds: i64,
    },
}

#[derive(Debug, Subcommand)]
enum ProvisionKind {
    /// Enroll a new service
    Service { name: String },
    /// Enroll a user certificate
    User { name: String },
    /// Create a mirror `name` of `target`
    Clone { target: String, name: String },
}

#[derive(Debug, Subcommand)]
enum TicketAction {
    List {
        #[arg(long)]
        kind: Option<TicketKind>,
    },
    Revoke { iden: String },
    Clear {
        #[arg(long)]
        kind: Option<TicketKind>,
    },
}

#[derive(Debug, Args)]
struct TopologyArgs {
    name: String,
    /// Skip every interaction with the current leader
    #[arg(long)]
    force: bool,
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum PoolAction {
    Create { pool: String },
    Delete { pool: String },
    Add { pool: String, member: String },
    Del { pool: String, member: String },
    List,
    Show { pool: String },
}

fn print_record(record: &ServiceRecord) {
    let online = record.online.as_deref().unwrap_or("-");
    let mut line = format!(
        "{}/{}  {}  online={} ready={}",
        record.network, record.name, record.urlinfo, online, record.ready
    );
    if let Some(cluster) = &record.cluster {
        line.push_str(&format!(
            "  cluster={} leader={}",
            cluster,
            record.leader.as_deref().unwrap_or("-")
        ));
    }
    println!("{}", line);
}

fn print_pool(pool: &Pool) {
    println!("{}/{}  ({} members)", pool.network, pool.name, pool.members.len());
    for member in &pool.members {
        println!("    {}", member);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Command::Token {
        sub,
        role,
        secret,
        ttl_seconds,
    } = &cli.command
    {
        let role: Role = role.parse()?;
        let auth = JwtAuthenticator::new(secret, *ttl_seconds)?;
        // enrolled principals act only within the selected network
        let token = match role {
            Role::Admin => auth.encode(sub, role)?,
            Role::Service | Role::User => auth.encode_scoped(sub, &cli.network, role)?,
        };
        println!("{}", token);
        return Ok(());
    }

    let mut config = HttpClientConfig::with_servers(cli.servers.clone());
    if let Some(token) = &cli.token {
        config = config.with_token(token.clone());
    }
    let admin = AdminClient::new(TrellisHttpClient::new(config)?);
    let network = cli.network.as_str();

    match cli.command {
        Command::List { all } => {
            let records = admin
                .list_services(if all { None } else { Some(network) })
                .await?;
            for record in &records {
                print_record(record);
            }
            println!("{} service(s)", records.len());
        }
        Command::Provision { kind } => {
            let url = match kind {
                ProvisionKind::Service { name } => {
                    admin
                        .provision(TicketKind::Service, Some(network), &name, Default::default())
                        .await?
                }
                ProvisionKind::User { name } => {
                    admin
                        .provision(TicketKind::User, Some(network), &name, Default::default())
                        .await?
                }
                ProvisionKind::Clone { target, name } => {
                    admin.provision_clone(Some(network), &target, &name).await?
                }
            };
            println!("{} ticket for network {}:", url.kind, url.network);
            println!("{}", url.url);
        }
        Command::Tickets { action } => match action.unwrap_or(TicketAction::List { kind: None }) {
            TicketAction::List { kind } => {
                let tickets = admin.list_tickets(kind).await?;
                for ticket in &tickets {
                    println!(
                        "{}  {:<7}  {}/{}  by {}",
                        ticket.iden, ticket.kind.as_str(), ticket.network, ticket.target, ticket.creator
                    );
                }
                println!("{} ticket(s)", tickets.len());
            }
            TicketAction::Revoke { iden } => {
                admin.revoke_ticket(&iden).await?;
                println!("Revoked ticket {}", iden);
            }
            TicketAction::Clear { kind } => {
                let cleared = admin.clear_tickets(kind).await?;
                println!("Cleared {} ticket(s)", cleared);
            }
        },
        Command::Promote(args) => {
            let record = admin.promote(&topology_request(network, args)).await?;
            println!("Promoted:");
            print_record(&record);
        }
        Command::Demote(args) => {
            let record = admin.demote(&topology_request(network, args)).await?;
            println!("Demoted; new leader:");
            print_record(&record);
        }
        Command::Pool { action } => match action {
            PoolAction::Create { pool } => print_pool(&admin.create_pool(network, &pool).await?),
            PoolAction::Delete { pool } => {
                admin.delete_pool(network, &pool).await?;
                println!("Deleted pool {}/{}", network, pool);
            }
            PoolAction::Add { pool, member } => {
                print_pool(&admin.add_pool_member(network, &pool, &member).await?)
            }
            PoolAction::Del { pool, member } => {
                print_pool(&admin.del_pool_member(network, &pool, &member).await?)
            }
            PoolAction::List => {
                for pool in admin.list_pools(network).await? {
                    println!("{}  ({} members)", pool.name, pool.members.len());
                }
            }
            PoolAction::Show { pool } => print_pool(&admin.get_pool(network, &pool).await?),
        },
        Command::Token { .. } => {}
    }
    Ok(())
}

fn topology_request(network: &str, args: TopologyArgs) -> TopologyRequest {
    TopologyRequest {
        network: Some(network.to_string()),
        name: args.name,
        graceful: Some(!args.force),
        timeout_ms: args.timeout_ms,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_provision_clone() {
        let cli = Cli::try_parse_from([
            "trellisctl", "-n", "example", "provision", "clone", "db.0", "db.1",
        ])
        .unwrap();
        assert_eq!(cli.network, "example");
        match cli.command {
            Command::Provision {
                kind: ProvisionKind::Clone { target, name },
            } => {
                assert_eq!(target, "db.0");
                assert_eq!(name, "db.1");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_forced_promote() {
        let cli = Cli::try_parse_from(["trellisctl", "promote", "db.1", "--force"]).unwrap();
        let Command::Promote(args) = cli.command else {
            panic!("expected promote");
        };
        let request = topology_request(DEFAULT_NETWORK, args);
        assert_eq!(request.graceful, Some(false));
        assert_eq!(request.name, "db.1");
    }

    #[test]
    fn test_parse_ticket_kind_filter() {
        let cli = Cli::try_parse_from(["trellisctl", "tickets", "clear", "--kind", "clone"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Tickets {
                action: Some(TicketAction::Clear {
                    kind: Some(TicketKind::Clone)
                })
            }
        ));
    }
}
