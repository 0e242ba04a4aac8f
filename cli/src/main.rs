#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = daqifi_cli::main_cli().await {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}
