mod actions;
mod cli;

#[tokio::main]
async fn main() {
    std::process::exit(cli::dispatch::run().await);
}
