use std::{
    io::{Read, Write},
    path::PathBuf,
    time::Duration,
};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{self, Context};
use tcphelper::{Bytes, Helper, HelperConfig, HelperError, Notification, Observer};
use tracing_subscriber::filter::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// JSON file with `timeout_ms` and `chunk_size` settings
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Maximum number of bytes moved by a single read or write
    #[clap(long, global = true)]
    chunk_size: Option<usize>,

    /// Give up on a connect, read or write after this many milliseconds
    #[clap(long, global = true)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept one connection and print everything received to stdout
    Serve { port: String },

    /// Connect to a server and send stdin
    Send { host: String, port: String },
}

impl Args {
    fn helper_config(&self) -> eyre::Result<HelperConfig> {
        let mut config = match &self.config {
            Some(path) => HelperConfig::from_path(path)
                .wrap_err_with(|| format!("loading configuration from {}", path.display()))?,
            None => HelperConfig::default(),
        };
        if let Some(chunk_size) = self.chunk_size {
            config = config
                .with_chunk_size(chunk_size)
                .context("setting chunk size")?;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config = config
                .with_timeout(Some(Duration::from_millis(timeout_ms)))
                .context("setting timeout")?;
        }
        Ok(config)
    }
}

/// Streams received chunks to stdout and logs everything else
struct Console;

impl Observer for Console {
    fn started_running(&mut self, helper: &Helper) {
        tracing::info!(state = ?helper.state(), "started");
    }

    fn connected(&mut self, _helper: &Helper) {
        tracing::info!("connected");
    }

    fn disconnected(&mut self, _helper: &Helper) {
        tracing::info!("disconnected");
    }

    fn received_data(&mut self, _helper: &Helper, chunk: Bytes) {
        tracing::debug!(len = chunk.len(), "received chunk");
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(&chunk).and_then(|()| stdout.flush()) {
            tracing::warn!(error = %e, "writing to stdout");
        }
    }

    fn sent_data(&mut self, _helper: &Helper, chunk: Bytes) {
        tracing::debug!(len = chunk.len(), "sent chunk");
    }

    fn finished_sending_data(&mut self, _helper: &Helper) {
        tracing::info!("finished sending");
    }

    fn finished_receiving_data(&mut self, _helper: &Helper, data: Bytes) {
        tracing::info!(len = data.len(), "finished receiving");
    }

    fn error_occurred(&mut self, _helper: &Helper, error: HelperError) {
        tracing::warn!(kind = %error.kind(), %error, "helper error");
    }
}

/// Dispatch until `pred` matches, turning helper errors into reports
fn wait_until<F>(helper: &Helper, what: &str, mut pred: F) -> eyre::Result<Notification>
where
    F: FnMut(&Notification) -> bool,
{
    tracing::debug!("waiting until {what}");
    let notification = helper
        .wait_for(Duration::MAX, |n| pred(n) || matches!(n, Notification::Error(_)))
        .ok_or_else(|| eyre::eyre!("notifications stopped before {what}"))?;
    match notification {
        Notification::Error(error) => Err(error).wrap_err_with(|| format!("waiting until {what}")),
        other => Ok(other),
    }
}

fn serve(helper: &Helper) -> eyre::Result<()> {
    helper.start_server();
    wait_until(helper, "a client connects", |n| {
        matches!(n, Notification::Connected)
    })?;

    helper.receive_data();
    wait_until(helper, "the client closes the connection", |n| {
        matches!(n, Notification::FinishedReceivingData(_))
    })?;
    Ok(())
}

fn send(helper: &Helper) -> eyre::Result<()> {
    let mut data = Vec::new();
    std::io::stdin()
        .read_to_end(&mut data)
        .context("reading from stdin")?;
    tracing::debug!(len = data.len(), "read input");

    helper.start_client();
    wait_until(helper, "connected", |n| matches!(n, Notification::Connected))?;

    helper.send_data(data);
    wait_until(helper, "everything is sent", |n| {
        matches!(n, Notification::FinishedSendingData)
    })?;
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install().context("installing color_eyre")?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "parsed command line arguments");
    let config = args.helper_config()?;

    let (helper, result) = match &args.command {
        Command::Serve { port } => {
            let helper = Helper::with_config("", port.as_str(), config);
            helper.set_observer(Console);
            let result = serve(&helper).context("serving");
            (helper, result)
        }
        Command::Send { host, port } => {
            let helper = Helper::with_config(host.as_str(), port.as_str(), config);
            helper.set_observer(Console);
            let result = send(&helper).context("sending");
            (helper, result)
        }
    };

    helper.disconnect();
    helper.dispatch();
    result
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "tcphelper",
            "send",
            "localhost",
            "5678",
            "--chunk-size",
            "4",
            "--timeout-ms",
            "250",
        ])
        .unwrap();

        let config = args.helper_config().unwrap();
        assert_eq!(config.chunk_size(), 4);
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
        assert!(matches!(args.command, Command::Send { .. }));
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let args =
            Args::try_parse_from(["tcphelper", "serve", "5678", "--chunk-size", "0"]).unwrap();
        assert!(args.helper_config().is_err());
    }
}
