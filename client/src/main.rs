use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rollcall_client::client::SessionClient;
use rollcall_client::config::ClientConfig;
use rollcall_client::model::calendar_date;
use rollcall_client::notify::{ChannelSink, Notification, NotificationLevel};
use rollcall_client::permissions::StaffRole;
use rollcall_client::session::{Dispatch, SessionPhase, SessionSnapshot};
use rollcall_client::shell::{self, ShellCommand};
use rollcall_client::transport::SocketTransport;

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Live attendance session client")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "rollcall.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join an existing session and mark attendance interactively
    Watch {
        #[arg(long)]
        session: String,
        #[arg(long)]
        class: String,
    },
    /// Open a new session for a class and mark attendance interactively
    Create {
        #[arg(long)]
        class: String,
        #[arg(long)]
        workspace: String,
        #[arg(long, value_parser = calendar_date::parse)]
        date: NaiveDate,
        #[arg(long)]
        total: u32,
    },
    /// Print attendance statistics for a class and date
    Stats {
        #[arg(long)]
        class: String,
        #[arg(long)]
        workspace: String,
        #[arg(long, value_parser = calendar_date::parse)]
        date: NaiveDate,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ClientConfig::load(&cli.config).map_err(anyhow::Error::msg)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let identity = config.identity();
    if identity.email.is_empty() {
        bail!("no identity configured: set identity.email or ROLLCALL_EMAIL");
    }

    let transport = Arc::new(SocketTransport::new(&config.server.url));
    transport
        .connect(identity)
        .await
        .with_context(|| format!("failed to connect to {}", config.server.url))?;

    let (sink, notifications) = ChannelSink::new();
    let client = SessionClient::builder(transport.clone())
        .notifier(Arc::new(sink))
        .permissions(Arc::new(StaffRole::parse(&config.identity.role)))
        .ack_timeout(config.ack_timeout())
        .build();
    info!(client_id = %client.id(), url = %config.server.url, "rollcall client ready");

    let result = match cli.command {
        Command::Watch { session, class } => {
            client.commands().join_session(session, class);
            run_shell(&client, notifications).await
        }
        Command::Create {
            class,
            workspace,
            date,
            total,
        } => {
            client
                .commands()
                .create_session(class, workspace, date, total);
            run_shell(&client, notifications).await
        }
        Command::Stats {
            class,
            workspace,
            date,
        } => print_stats(&client, notifications, class, workspace, date, config.ack_timeout()).await,
    };

    client.shutdown().await;
    transport.close().await;
    result
}

/// Read commands from stdin until `quit`, EOF or ctrl-c, printing
/// notifications and progress as they arrive.
async fn run_shell(
    client: &SessionClient,
    mut notifications: UnboundedReceiver<Notification>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = client.subscribe();
    let mut shown = (SessionPhase::Idle, None);
    println!("{}", shell::HELP);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match ShellCommand::parse(&line) {
                    Ok(ShellCommand::Quit) => break,
                    Ok(command) => execute(client, command),
                    Err(e) => println!("{}", e),
                }
            }
            Some(notification) = notifications.recv() => println!("{}", notification),
            changed = updates.changed() => {
                changed.context("session store went away")?;
                let snapshot = updates.borrow_and_update().clone();
                let current = (snapshot.phase.clone(), snapshot.progress);
                if current != shown {
                    print_progress(&snapshot);
                    shown = current;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

fn execute(client: &SessionClient, command: ShellCommand) {
    let commands = client.commands();
    let outcome = match command {
        ShellCommand::Mark {
            student_id,
            status,
            notes,
        } => commands.mark_attendance(student_id, status, notes),
        ShellCommand::Bulk(entries) => commands.bulk_mark_attendance(entries),
        ShellCommand::Refresh => commands.refresh_session_status(),
        ShellCommand::Close => commands.close_session(),
        ShellCommand::Leave => commands.leave_session(),
        ShellCommand::Viewers => {
            print_viewers(&client.snapshot());
            return;
        }
        ShellCommand::Progress => {
            print_progress(&client.snapshot());
            return;
        }
        ShellCommand::Help => {
            println!("{}", shell::HELP);
            return;
        }
        ShellCommand::Quit => return,
    };
    match outcome {
        Dispatch::NoSession => println!("not in a session"),
        Dispatch::Offline => println!("not connected; command not sent"),
        _ => {}
    }
}

fn print_progress(snapshot: &SessionSnapshot) {
    let Some(session) = snapshot.session.as_deref() else {
        match &snapshot.phase {
            SessionPhase::Pending { request, .. } => {
                println!("waiting for the server to {}", request.describe())
            }
            _ => println!("no current session"),
        }
        return;
    };
    let state = match snapshot.phase {
        SessionPhase::Closing => "closing",
        SessionPhase::Closed => "closed",
        _ => "active",
    };
    match snapshot.progress {
        Some(p) => println!(
            "{} {} ({}): {}/{} marked, {}%",
            session.class_id,
            session.date,
            state,
            p.marked_students,
            p.total_students,
            p.percentage
        ),
        None => println!("{} {} ({})", session.class_id, session.date, state),
    }
}

fn print_viewers(snapshot: &SessionSnapshot) {
    if snapshot.viewers.is_empty() {
        println!("nobody else is viewing");
        return;
    }
    for viewer in snapshot.viewers.iter() {
        println!("{} ({})", viewer.email, viewer.role);
    }
}

async fn print_stats(
    client: &SessionClient,
    mut notifications: UnboundedReceiver<Notification>,
    class_id: String,
    workspace_id: String,
    date: NaiveDate,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut updates = client.subscribe();
    if client.commands().get_stats(class_id, workspace_id, date) != Dispatch::Sent {
        while let Ok(notification) = notifications.try_recv() {
            eprintln!("{}", notification);
        }
        bail!("statistics request was not sent");
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => bail!("timed out waiting for attendance statistics"),
            Some(notification) = notifications.recv() => {
                if notification.level == NotificationLevel::Error {
                    bail!("{}", notification.message);
                }
                eprintln!("{}", notification);
            }
            changed = updates.changed() => {
                changed.context("session store went away")?;
                let stats = updates.borrow_and_update().stats.clone();
                if let Some(stats) = stats {
                    println!("total:   {}", stats.total_students);
                    println!("present: {}", stats.present_count);
                    println!("absent:  {}", stats.absent_count);
                    println!("late:    {}", stats.late_count);
                    println!("rate:    {}%", stats.percentage);
                    return Ok(());
                }
            }
        }
    }
}
