//! skiff CLI binary entry point.

use skiff::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();
    skiff::cli::init_tracing(cli.verbose);

    let code = match cli.command {
        Commands::Agents => {
            skiff::cli::handle_agents();
            0
        }
        Commands::Run(args) => match skiff::cli::handle_run(args).await {
            Ok(true) => 0,
            Ok(false) => 1,
            Err(e) => {
                eprintln!("Error: {}", e.user_message());
                2
            }
        },
    };
    // Exit without waiting on a stdin reader blocked in the approval prompt.
    std::process::exit(code);
}
