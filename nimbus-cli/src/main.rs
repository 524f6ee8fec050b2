use clap::Parser;
use nimbus_cli::{commands, exit_code, init_logging, Cli, INTERRUPTED};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = tokio::select! {
        result = commands::run(cli) => match result {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                exit_code(&e)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", INTERRUPTED);
            1
        }
    };
    std::process::exit(code);
}
