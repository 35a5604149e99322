use clap::Parser;
use hhlabor::api::{Cli, Command, run_command, run_http_server};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Command::Serve { port } = cli.command {
        if let Err(e) = run_http_server(port).await {
            eprintln!("Server error: {e}");
            std::process::exit(1);
        }
        return;
    }

    match run_command(cli.command) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
