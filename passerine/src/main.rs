mod server;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use pv_user::config::{read_config, ProviderConfig};
use server::Server;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(
        short,
        long,
        env = "PASSERINE_CONFIG",
        default_value = "passerine.toml"
    )]
    /// Path to the main passerine configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs every protocol listener configured in the config file
    Daemon,
    /// Manage address-to-mailbox routing for SMTP/LMTP delivery
    #[clap(subcommand)]
    Alias(AliasCommand),
}

#[derive(Subcommand, Debug)]
enum AliasCommand {
    /// List configured aliases, optionally filtered by a substring pattern
    List { pattern: Option<String> },
    /// Route `<addr>` to `<mailbox>`, owned by the mailbox's account
    Create {
        addr: String,
        mailbox: String,
        #[clap(short, long)]
        owner: String,
    },
    /// Remove an alias
    Delete { addr: String },
}

fn tracer() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "passerine=info,pv_proto=info,pv_collections=info");
    }
    tracing_subscriber::fmt::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracer();

    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{}", panic_info);
        eprintln!("{:?}", backtrace::Backtrace::new());
        std::process::abort();
    }));

    let args = Args::parse();
    let config: ProviderConfig =
        read_config(args.config_file.clone()).context(format!("'{:?}' must be a provider config file", args.config_file))?;

    match args.command {
        Command::Daemon => {
            let server = Server::from_provider_config(config).await?;
            server.run().await?;
        }
        Command::Alias(cmd) => alias_management(cmd, config).await?,
    }

    Ok(())
}

async fn alias_management(cmd: AliasCommand, config: ProviderConfig) -> Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database.url)
        .await?;

    match cmd {
        AliasCommand::List { pattern } => {
            let rows: Vec<(String, String, String)> = match &pattern {
                Some(p) => sqlx::query_as(
                    "select address, owner, mailbox from aliases where address like $1 order by address",
                )
                .bind(format!("%{p}%"))
                .fetch_all(&pool)
                .await?,
                None => sqlx::query_as("select address, owner, mailbox from aliases order by address")
                    .fetch_all(&pool)
                    .await?,
            };
            for (address, owner, mailbox) in rows {
                println!("{address}\t{owner}\t{mailbox}");
            }
        }
        AliasCommand::Create { addr, mailbox, owner } => {
            sqlx::query(
                "insert into aliases (address, owner, mailbox) values ($1, $2, $3) \
                 on conflict (address) do update set owner = excluded.owner, mailbox = excluded.mailbox",
            )
            .bind(&addr)
            .bind(&owner)
            .bind(&mailbox)
            .execute(&pool)
            .await
            .context("creating alias")?;
        }
        AliasCommand::Delete { addr } => {
            let result = sqlx::query("delete from aliases where address = $1")
                .bind(&addr)
                .execute(&pool)
                .await
                .context("deleting alias")?;
            if result.rows_affected() == 0 {
                bail!("no alias found for {addr}");
            }
        }
    }

    Ok(())
}
