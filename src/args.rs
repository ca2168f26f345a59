use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "trust-weighted leaderboard and scoring service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Serve the HTTP API and rebuild leaderboards on a schedule (default)
    Serve {
        /// Overrides `SERVER_API_PORT`
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Rebuild every leaderboard once and exit
    Sync,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Serve { port: None })
    }
}

pub fn parse_cli_args() -> Cli {
    Cli::parse()
}
