use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use siglink::{
    setup_tracing, AppResult, ServerNode, TransportConfig, UnroutedHandler, GLOBAL_CONFIG,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    let _log_guard = setup_tracing();

    let commandline: CommandLine = CommandLine::parse();
    let transport_config = match commandline.conf.as_ref() {
        Some(path) => TransportConfig::set_up_config(PathBuf::from(path))?,
        None => {
            let default_path = PathBuf::from("conf.toml");
            if default_path.exists() {
                TransportConfig::set_up_config(default_path)?
            } else {
                TransportConfig::default()
            }
        }
    };

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", transport_config);
        return Ok(());
    }

    GLOBAL_CONFIG
        .set(transport_config.clone())
        .expect("set transport config failed");

    // a bare node rejects every target until an operation layer is wired
    // in through ServerNode::start with a real handler
    let node = ServerNode::new(transport_config);
    node.start(Arc::new(UnroutedHandler))?;

    Ok(())
}
