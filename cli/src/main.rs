use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use frames::{Frame, Map, Value};
use notebook_sync::{
    ClientConfig, ClientError, MessageKind, Notice, NotebookClient, NotebookObserver, Session, SessionObserver, Url,
    WsConnector, socket_address,
};
use tracing::info;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing notebook id; pass --notebook-id or set NOTEBOOK_ID")]
    MissingNotebookId,
    #[error(transparent)]
    Address(#[from] notebook_sync::AddressError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("waiting for ctrl-c failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "notebook-cli", about = "Talk to a live notebook engine")]
struct Cli {
    #[arg(long, env = "NOTEBOOK_BASE_URL", default_value = "http://127.0.0.1:1234/")]
    base_url: String,

    #[arg(long, env = "NOTEBOOK_SECRET")]
    secret: Option<String>,

    #[arg(long, env = "NOTEBOOK_ID")]
    notebook_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and send one keepalive ping.
    Ping,
    /// Print the full notebook state as JSON.
    State,
    /// Stream state changes until interrupted.
    Watch {
        /// Print the whole replica on every change instead of a summary.
        #[arg(long, default_value_t = false)]
        full: bool,
    },
    /// Run the given cells.
    Run {
        #[arg(required = true)]
        cells: Vec<String>,
    },
    /// Set a bond to a JSON value.
    SetBond {
        name: String,
        value: String,
        /// Mark this as the widget's initial value.
        #[arg(long, default_value_t = false)]
        first: bool,
    },
    Interrupt,
    Restart,
    Shutdown {
        #[arg(long, default_value_t = false)]
        keep_in_session: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut address = socket_address(&cli.base_url, None)?;
    if let Some(secret) = &cli.secret {
        address.query_pairs_mut().clear().append_pair("secret", secret);
    }
    let config = ClientConfig::from_env();

    if matches!(cli.command, Command::Ping) {
        return run_ping(address, config).await;
    }

    let notebook_id = cli.notebook_id.ok_or(CliError::MissingNotebookId)?;
    let observer: Arc<dyn NotebookObserver> = match cli.command {
        Command::Watch { full } => Arc::new(Printer { full }),
        _ => Arc::new(()),
    };
    let client = NotebookClient::connect(Arc::new(WsConnector), address, &notebook_id, config, observer).await?;

    let outcome = run_command(&client, cli.command).await;
    client.kill();
    outcome
}

async fn run_command(client: &NotebookClient, command: Command) -> Result<(), CliError> {
    match command {
        Command::Ping => Ok(()),
        Command::State => print_json(&client.snapshot()),
        Command::Watch { .. } => {
            info!(notebook_id = client.notebook_id(), "watching; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            Ok(())
        }
        Command::Run { cells } => print_response(&client.run_cells(&cells).await?),
        Command::SetBond { name, value, first } => {
            let value = Value::from(serde_json::from_str::<serde_json::Value>(&value)?);
            client.set_bond(&name, value, first).await?;
            println!("ok");
            Ok(())
        }
        Command::Interrupt => print_response(&client.interrupt().await?),
        Command::Restart => print_response(&client.restart_process().await?),
        Command::Shutdown { keep_in_session } => print_response(&client.shutdown(keep_in_session).await?),
    }
}

async fn run_ping(address: Url, config: ClientConfig) -> Result<(), CliError> {
    let session = Session::connect(Arc::new(WsConnector), address, Map::new(), config, Arc::new(Quiet)).await?;
    let outcome = session
        .send(MessageKind::Ping, Value::empty_map(), Map::new(), true)
        .await;
    session.kill();
    outcome?;
    println!("ok");
    Ok(())
}

fn print_response(frame: &Frame) -> Result<(), CliError> {
    print_json(&frame.body)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(&value.to_json())?;
    println!("{rendered}");
    Ok(())
}

/// Prints state changes and notices for `watch`.
struct Printer {
    full: bool,
}

impl NotebookObserver for Printer {
    fn on_state_changed(&self, replica: &Value) {
        if self.full {
            if let Ok(rendered) = serde_json::to_string_pretty(&replica.to_json()) {
                println!("{rendered}");
            }
            return;
        }
        let view = notebook_sync::state::NotebookView::new(replica);
        let busy = view
            .cell_order()
            .into_iter()
            .filter(|id| view.cell_is_busy(id))
            .count();
        println!(
            "process={} cells={} busy={busy}",
            view.process_status().unwrap_or("unknown"),
            view.cell_order().len(),
        );
    }

    fn on_connection_status(&self, connected: bool, hopeless: bool) {
        eprintln!("connected={connected} hopeless={hopeless}");
    }

    fn on_notice(&self, notice: Notice) {
        eprintln!("notice: {notice}");
    }
}

/// Session observer for one-shot commands.
struct Quiet;

#[async_trait]
impl SessionObserver for Quiet {
    fn on_unrequested_update(&self, _frame: Frame, _by_me: bool) -> Result<(), ClientError> {
        Ok(())
    }

    fn on_connection_status(&self, _connected: bool, _hopeless: bool) {}

    async fn on_reconnect(&self) -> bool {
        true
    }

    fn on_notice(&self, notice: Notice) {
        eprintln!("notice: {notice}");
    }
}
