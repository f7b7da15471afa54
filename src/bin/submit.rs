use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use fleetwatch::scheduler::{TaskRequest, listener, task::ReplyStatus};

/// Submit a task to a running hub
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Submission socket of the hub (defaults to FLEETWATCH_SOCKET)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Worker name, e.g. purge_data
    #[arg(long)]
    worker: String,

    /// Task id
    #[arg(long)]
    id: String,

    /// Task options as JSON
    #[arg(long)]
    options: Option<String>,

    /// UNIX timestamp after which the task is dropped
    #[arg(long, default_value_t = 0)]
    expire: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let socket = args
        .socket
        .or_else(fleetwatch::util::get_socket_path)
        .context("no socket given and FLEETWATCH_SOCKET is not set")?;

    let options = match &args.options {
        Some(raw) => serde_json::from_str(raw).context("--options is not valid JSON")?,
        None => serde_json::Value::Null,
    };

    let request = TaskRequest {
        worker_name: args.worker,
        id: args.id,
        options,
        expire: args.expire,
    };

    let reply = listener::submit(&socket, &request).await?;
    match reply.status {
        ReplyStatus::Scheduled => println!("scheduled {}", request.id),
        ReplyStatus::Duplicate => println!("{} is already scheduled", request.id),
        ReplyStatus::Error => bail!(
            "rejected: {}",
            reply.message.unwrap_or_else(|| "unknown error".to_string())
        ),
    }

    Ok(())
}
